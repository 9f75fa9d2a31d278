pub mod dns;
pub mod tls;

use crate::apdu::tlv;
use crate::session::Transport;

/// Primary classification of a reassembled payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Tls,
    Dns,
    Json,
    Http,
    Asn1Ber,
    Binary,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Tls => "TLS",
            PayloadKind::Dns => "DNS",
            PayloadKind::Json => "JSON",
            PayloadKind::Http => "HTTP",
            PayloadKind::Asn1Ber => "ASN.1/BER",
            PayloadKind::Binary => "Binary",
        }
    }
}

const HTTP_PREFIXES: [&[u8]; 7] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"HTTP/",
];

/// Dispatch a direction buffer to exactly one primary label. Predicates run
/// in priority order; the first match wins and classification never mutates
/// the buffer.
pub fn classify(data: &[u8], transport: Transport, port: Option<u16>) -> PayloadKind {
    if data.is_empty() {
        return PayloadKind::Binary;
    }
    if tls::is_tls(data) {
        return PayloadKind::Tls;
    }
    if transport == Transport::Udp && port == Some(53) && dns::parse_dns(data).is_ok() {
        return PayloadKind::Dns;
    }
    if data[0] == b'{' && serde_json::from_slice::<serde_json::Value>(data).is_ok() {
        return PayloadKind::Json;
    }
    if HTTP_PREFIXES.iter().any(|p| data.starts_with(p)) {
        return PayloadKind::Http;
    }
    if looks_like_ber(data) {
        return PayloadKind::Asn1Ber;
    }
    PayloadKind::Binary
}

/// SEQUENCE/SET or a context tag with a self-consistent BER length.
fn looks_like_ber(data: &[u8]) -> bool {
    let lead = data[0];
    if !(lead == 0x30 || lead == 0x31 || (0xA0..=0xBF).contains(&lead)) {
        return false;
    }
    !tlv::parse_lenient(data).is_empty()
}

/// Human-readable summary of the top-level BER structures in a buffer.
pub fn asn1_summary(data: &[u8]) -> Vec<String> {
    tlv::parse_lenient(data)
        .iter()
        .map(|t| match t.tag {
            0x30 => format!("SEQUENCE (length {})", t.length),
            0x31 => format!("SET (length {})", t.length),
            tag if (0xA0..=0xBF).contains(&tag) => {
                format!("Context-specific [{}] (length {})", tag & 0x1F, t.length)
            }
            tag => format!("Tag 0x{tag:02X} (length {})", t.length),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_takes_priority() {
        let buf = [0x16, 0x03, 0x03, 0x00, 0x02, 0x01, 0x00];
        assert_eq!(
            classify(&buf, Transport::Tcp, Some(443)),
            PayloadKind::Tls
        );
    }

    #[test]
    fn dns_requires_udp_53() {
        // Header-only query with one question for "a"
        let wire = {
            use simple_dns::{Name, Packet, Question, CLASS, QCLASS, QTYPE, TYPE};
            let mut pkt = Packet::new_query(1);
            pkt.questions.push(Question::new(
                Name::new("a.example.com").unwrap(),
                QTYPE::TYPE(TYPE::A),
                QCLASS::CLASS(CLASS::IN),
                false,
            ));
            pkt.build_bytes_vec().unwrap()
        };
        assert_eq!(classify(&wire, Transport::Udp, Some(53)), PayloadKind::Dns);
        assert_ne!(classify(&wire, Transport::Tcp, Some(443)), PayloadKind::Dns);
    }

    #[test]
    fn json_payload() {
        assert_eq!(
            classify(br#"{"status":"ok"}"#, Transport::Tcp, Some(443)),
            PayloadKind::Json
        );
        // A brace that is not JSON falls through to binary
        assert_eq!(
            classify(b"{not json", Transport::Tcp, None),
            PayloadKind::Binary
        );
    }

    #[test]
    fn http_prefixes() {
        assert_eq!(
            classify(b"GET /profile HTTP/1.1\r\n", Transport::Tcp, Some(80)),
            PayloadKind::Http
        );
        assert_eq!(
            classify(b"HTTP/1.1 200 OK\r\n", Transport::Tcp, Some(80)),
            PayloadKind::Http
        );
    }

    #[test]
    fn ber_structure() {
        let buf = [0x30, 0x03, 0x02, 0x01, 0x05];
        assert_eq!(classify(&buf, Transport::Tcp, None), PayloadKind::Asn1Ber);
        assert_eq!(
            asn1_summary(&buf),
            vec!["SEQUENCE (length 3)".to_string()]
        );
    }

    #[test]
    fn context_tag_summary() {
        let buf = [0xA2, 0x02, 0x05, 0x00];
        assert_eq!(
            asn1_summary(&buf),
            vec!["Context-specific [2] (length 2)".to_string()]
        );
    }

    #[test]
    fn fallback_is_binary() {
        assert_eq!(
            classify(&[0x00, 0x01, 0x02], Transport::Unknown, None),
            PayloadKind::Binary
        );
        assert_eq!(classify(&[], Transport::Unknown, None), PayloadKind::Binary);
    }
}
