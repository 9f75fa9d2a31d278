use std::fmt;

use tracing::debug;

use crate::config::AnalysisConfig;
use crate::model::TraceModel;
use crate::protocol::tls;
use crate::reassembly;
use crate::session::{ChannelSession, Transport};

/// Inferred function of a session's remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SmDpPlus,
    SmDs,
    Eim,
    DpPlus,
    Tac,
    Dns,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SmDpPlus => "SM-DP+",
            Role::SmDs => "SM-DS",
            Role::Eim => "eIM",
            Role::DpPlus => "DP+",
            Role::Tac => "TAC",
            Role::Dns => "DNS",
            Role::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the role of every session in place.
pub fn resolve(model: &TraceModel, sessions: &mut [ChannelSession], config: &AnalysisConfig) {
    for session in sessions.iter_mut() {
        session.role = detect(model, session, config);
        if session.role == Role::Dns && session.label == "BIP Session" {
            session.label = "DNS".to_string();
        }
    }
}

/// Highest-priority match wins: SNI patterns from the outbound ClientHello,
/// then UDP 53, then the configured IP table.
pub fn detect(model: &TraceModel, session: &ChannelSession, config: &AnalysisConfig) -> Role {
    let streams = reassembly::reassemble_limited(model, session, config, config.role_scan_items);
    if let Some(hello) = tls::find_client_hello(&streams.outbound.data) {
        if let Some(sni) = &hello.sni {
            if let Some(role) = config.role_for_hostname(sni) {
                debug!(sni = %sni, role = %role, "role from SNI");
                return role;
            }
        }
    }

    if session.transport == Transport::Udp && session.port == Some(53) {
        return Role::Dns;
    }

    for ip in &session.ip_addresses {
        if let Some(role) = config.role_for_ip(ip) {
            return role;
        }
    }

    Role::Unknown
}

/// Timeline type label for a session row: role when known, "DNSbyME" for
/// address-less channels, else a DNS/Unknown guess from the server label.
pub fn type_label(session: &ChannelSession, config: &AnalysisConfig) -> String {
    if session.is_dns_by_me() {
        return "DNSbyME".to_string();
    }
    if session.role != Role::Unknown {
        return session.role.to_string();
    }
    let server = crate::session::server_label(session, config);
    if server.to_uppercase().contains("DNS") {
        "DNS".to_string()
    } else {
        "Unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InterpNode, TraceItem, TraceModel};
    use crate::session;
    use std::collections::BTreeSet;

    fn plain(summary: &str, details: &[&str]) -> TraceItem {
        let mut root = InterpNode::new(summary);
        for d in details {
            root.children.push(InterpNode::new(*d));
        }
        TraceItem {
            protocol: "ISO7816".into(),
            item_type: "apduresponse".into(),
            summary: summary.into(),
            interpretation: vec![root],
            ..Default::default()
        }
    }

    /// SEND DATA item carrying a TLS ClientHello with the given SNI.
    fn send_tls_client_hello(sni: &str) -> TraceItem {
        let mut ch_body = vec![0x03, 0x03];
        ch_body.extend_from_slice(&[0x42; 32]);
        ch_body.push(0);
        ch_body.extend_from_slice(&[0x00, 0x02, 0xC0, 0x2F]);
        ch_body.extend_from_slice(&[0x01, 0x00]);
        let mut entry = vec![0x00];
        entry.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        entry.extend_from_slice(sni.as_bytes());
        let mut sni_data = (entry.len() as u16).to_be_bytes().to_vec();
        sni_data.extend_from_slice(&entry);
        let mut exts = vec![0x00, 0x00];
        exts.extend_from_slice(&(sni_data.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_data);
        ch_body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        ch_body.extend_from_slice(&exts);

        let mut hs = vec![0x01];
        hs.extend_from_slice(&(ch_body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&ch_body);
        let mut rec = vec![0x16, 0x03, 0x03];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);

        // Wrap in D0 / channel data TLV (long form for safety).
        let mut inner = vec![0x81, 0x03, 0x01, 0x43, 0x01, 0xB6, 0x81, rec.len() as u8];
        inner.extend_from_slice(&rec);
        let mut raw = vec![0xD0, 0x81, inner.len() as u8];
        raw.extend_from_slice(&inner);
        raw.extend_from_slice(&[0x90, 0x00]);
        TraceItem {
            protocol: "ISO7816".into(),
            item_type: "apduresponse".into(),
            summary: "FETCH - SEND DATA".into(),
            interpretation: vec![InterpNode::new("FETCH - SEND DATA")],
            raw: Some(raw),
            ..Default::default()
        }
    }

    fn session_with(items: Vec<TraceItem>) -> (TraceModel, Vec<ChannelSession>) {
        let model = TraceModel::build(items);
        let (mut sessions, _) = session::reconstruct(&model, &AnalysisConfig::default());
        resolve(&model, &mut sessions, &AnalysisConfig::default());
        (model, sessions)
    }

    #[test]
    fn sni_beats_port() {
        let (_, sessions) = session_with(vec![
            plain(
                "FETCH - OPEN CHANNEL",
                &["Address : 10.9.9.9", "Port Number : 53", "Transport : UDP"],
            ),
            plain("TERMINAL RESPONSE - OPEN CHANNEL SW: 9000", &["Allocated Channel : 1"]),
            send_tls_client_hello("tac.thales.example"),
            plain("FETCH - CLOSE CHANNEL", &[]),
        ]);
        assert_eq!(sessions[0].role, Role::Tac);
    }

    #[test]
    fn udp_53_is_dns() {
        let (_, sessions) = session_with(vec![
            plain(
                "FETCH - OPEN CHANNEL",
                &["Address : 10.0.0.1", "Port Number : 53", "Transport : UDP"],
            ),
            plain("TERMINAL RESPONSE - OPEN CHANNEL SW: 9000", &["Allocated Channel : 1"]),
            plain("FETCH - CLOSE CHANNEL", &[]),
        ]);
        assert_eq!(sessions[0].role, Role::Dns);
    }

    #[test]
    fn ip_table_fallback() {
        let mut config = AnalysisConfig::default();
        config.ip_roles.push(("192.0.2.".into(), Role::DpPlus));
        let model = TraceModel::build(vec![
            plain(
                "FETCH - OPEN CHANNEL",
                &["Address : 192.0.2.9", "Port Number : 443", "Transport : TCP"],
            ),
            plain("TERMINAL RESPONSE - OPEN CHANNEL SW: 9000", &["Allocated Channel : 1"]),
            plain("FETCH - CLOSE CHANNEL", &[]),
        ]);
        let (mut sessions, _) = session::reconstruct(&model, &config);
        resolve(&model, &mut sessions, &config);
        assert_eq!(sessions[0].role, Role::DpPlus);
    }

    #[test]
    fn unknown_without_signals() {
        let (_, sessions) = session_with(vec![
            plain(
                "FETCH - OPEN CHANNEL",
                &["Address : 198.51.100.4", "Port Number : 8080"],
            ),
            plain("TERMINAL RESPONSE - OPEN CHANNEL SW: 9000", &["Allocated Channel : 1"]),
            plain("FETCH - CLOSE CHANNEL", &[]),
        ]);
        assert_eq!(sessions[0].role, Role::Unknown);
    }

    #[test]
    fn smdp_hostname_patterns() {
        for (host, expected) in [
            ("rsp.smdpplus.example.com", Role::SmDpPlus),
            ("smds.gsma.example", Role::SmDs),
            ("eim.operator.example", Role::Eim),
            ("dpplus.operator.example", Role::Eim),
        ] {
            let (_, sessions) = session_with(vec![
                plain(
                    "FETCH - OPEN CHANNEL",
                    &["Address : 203.0.113.7", "Port Number : 443", "Transport : TCP"],
                ),
                plain("TERMINAL RESPONSE - OPEN CHANNEL SW: 9000", &["Allocated Channel : 1"]),
                send_tls_client_hello(host),
                plain("FETCH - CLOSE CHANNEL", &[]),
            ]);
            assert_eq!(sessions[0].role, expected, "host {host}");
        }
    }

    #[test]
    fn type_label_prefers_dns_by_me() {
        let session = ChannelSession {
            channel_id: Some(1),
            open_index: 0,
            close_index: None,
            item_indices: vec![0],
            server_name: None,
            ip_addresses: BTreeSet::new(),
            port: None,
            transport: Transport::Unknown,
            role: Role::Unknown,
            opened_at: None,
            closed_at: None,
            label: "BIP Session".into(),
        };
        assert_eq!(type_label(&session, &AnalysisConfig::default()), "DNSbyME");
    }
}
