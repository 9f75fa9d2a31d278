pub mod role;

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::model::{TraceItem, TraceModel};
use crate::validate::{Severity, ValidationIssue};

pub use role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Unknown,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Unknown => "Unknown",
        }
    }
}

/// One OPEN → CLOSE (or OPEN → end-of-trace) lifecycle of a BIP channel.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    pub channel_id: Option<u8>,
    pub open_index: usize,
    pub close_index: Option<usize>,
    /// Ordered item indices belonging to this session, all within
    /// `[open_index, close_index]`.
    pub item_indices: Vec<usize>,
    pub server_name: Option<String>,
    pub ip_addresses: BTreeSet<String>,
    pub port: Option<u16>,
    pub transport: Transport,
    pub role: Role,
    pub opened_at: Option<NaiveDateTime>,
    pub closed_at: Option<NaiveDateTime>,
    /// Normalised display name.
    pub label: String,
}

impl ChannelSession {
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.closed_at?.signed_duration_since(self.opened_at?))
    }

    /// First and last trace index covered by this session.
    pub fn span(&self) -> (usize, usize) {
        let first = self.item_indices.first().copied().unwrap_or(self.open_index);
        let last = self.item_indices.last().copied().unwrap_or(self.open_index);
        (first, last)
    }

    /// True when the channel was opened without a target address, i.e. the ME
    /// resolves DNS on the card's behalf.
    pub fn is_dns_by_me(&self) -> bool {
        self.ip_addresses.is_empty() && self.server_name.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelOp {
    Open,
    Close,
    Send,
    Receive,
}

/// Classify an item as a channel operation, with the terminal-response flag.
fn channel_op(item: &TraceItem) -> Option<(ChannelOp, bool)> {
    let summary = item.summary_upper();
    let is_fetch = summary.trim_start().starts_with("FETCH");
    let is_tr = item.is_terminal_response();
    if !is_fetch && !is_tr {
        return None;
    }
    let op = if summary.contains("OPEN CHANNEL") {
        ChannelOp::Open
    } else if summary.contains("CLOSE CHANNEL") {
        ChannelOp::Close
    } else if summary.contains("SEND DATA") {
        ChannelOp::Send
    } else if summary.contains("RECEIVE DATA") {
        ChannelOp::Receive
    } else {
        return None;
    };
    Some((op, is_tr))
}

static IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:ip\s*address|address)\s*:\s*(\d{1,3}[.:]\d{1,3}[.:]\d{1,3}[.:]\d{1,3})")
        .expect("ip regex")
});
static PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)port(?:\s*number)?\s*:\s*(\d+)").expect("port regex"));
static SERVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:server\s*name|network\s*access\s*name)\s*:\s*([A-Za-z0-9._-]+)")
        .expect("server regex")
});

#[derive(Debug, Default)]
struct Endpoint {
    server_name: Option<String>,
    ips: BTreeSet<String>,
    port: Option<u16>,
    transport: Transport,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Unknown
    }
}

/// Pull server / IP / port / transport out of an OPEN CHANNEL item's
/// interpretation tree, with a fallback scan of address TLVs in the raw body.
fn extract_endpoint(item: &TraceItem) -> Endpoint {
    let text = item.interp_text();
    let mut ep = Endpoint::default();

    for caps in IP_RE.captures_iter(&text) {
        ep.ips.insert(caps[1].replace(':', "."));
    }
    if let Some(caps) = PORT_RE.captures(&text) {
        ep.port = caps[1].parse().ok();
    }
    if let Some(caps) = SERVER_RE.captures(&text) {
        ep.server_name = Some(caps[1].to_string());
    }

    let upper = text.to_uppercase();
    ep.transport = if upper.contains("TCP") {
        Transport::Tcp
    } else if upper.contains("UDP") {
        Transport::Udp
    } else {
        match ep.port {
            Some(443) | Some(80) => Transport::Tcp,
            Some(53) => Transport::Udp,
            _ => Transport::Unknown,
        }
    };

    // Fallback: address TLVs in the body (type byte 0x21 = IPv4).
    if ep.ips.is_empty() {
        if let (Some(tlvs), Some(raw)) = (item.tlvs.as_deref(), item.raw.as_deref()) {
            for tlv in tlvs {
                if let Some(addr) = tlv.find(&|n| {
                    matches!(n.short_tag(), 0x06 | 0x3E) && n.length == 5
                }) {
                    let v = addr.value(raw);
                    if v[0] == 0x21 {
                        ep.ips
                            .insert(format!("{}.{}.{}.{}", v[1], v[2], v[3], v[4]));
                    }
                }
            }
        }
    }

    ep
}

/// Whether an OPEN CHANNEL item carries any target IP address.
pub(crate) fn open_channel_has_ip(item: &TraceItem) -> bool {
    !extract_endpoint(item).ips.is_empty()
}

fn merge_endpoint(session: &mut ChannelSession, ep: Endpoint) {
    if session.server_name.is_none() {
        session.server_name = ep.server_name;
    }
    session.ip_addresses.extend(ep.ips);
    if session.port.is_none() {
        session.port = ep.port;
    }
    if session.transport == Transport::Unknown {
        session.transport = ep.transport;
    }
}

/// Server label: explicit name, then well-known IP table, then "ME" for
/// address-less DNS channels, else "Unknown".
pub fn server_label(session: &ChannelSession, config: &AnalysisConfig) -> String {
    if let Some(name) = &session.server_name {
        return name.clone();
    }
    for ip in &session.ip_addresses {
        if let Some(label) = config.label_for_ip(ip) {
            return label.to_string();
        }
        if let Some(role) = config.role_for_ip(ip) {
            return role.to_string();
        }
    }
    if session.ip_addresses.is_empty() {
        "ME".to_string()
    } else {
        "Unknown".to_string()
    }
}

fn display_label(session: &ChannelSession, config: &AnalysisConfig) -> String {
    let server = server_label(session, config);
    if server.to_uppercase().contains("DNS") {
        "DNS".to_string()
    } else if server == "ME" || server == "Unknown" {
        "BIP Session".to_string()
    } else {
        server
    }
}

fn channel_display(ch: Option<u8>) -> String {
    match ch {
        Some(id) => format!("channel {id}"),
        None => "unknown channel".to_string(),
    }
}

/// Reconstruct per-channel sessions and surface state-machine issues.
/// Roles are not resolved here; see [`role::resolve`].
pub fn reconstruct(
    model: &TraceModel,
    config: &AnalysisConfig,
) -> (Vec<ChannelSession>, Vec<ValidationIssue>) {
    let mut open: Vec<ChannelSession> = Vec::new();
    let mut done: Vec<ChannelSession> = Vec::new();
    let mut issues: Vec<ValidationIssue> = Vec::new();

    for item in &model.items {
        let Some((op, is_tr)) = channel_op(item) else {
            continue;
        };
        match (op, is_tr) {
            (ChannelOp::Open, false) => {
                let mut session = ChannelSession {
                    channel_id: item.channel_id(),
                    open_index: item.index,
                    close_index: None,
                    item_indices: vec![item.index],
                    server_name: None,
                    ip_addresses: BTreeSet::new(),
                    port: None,
                    transport: Transport::Unknown,
                    role: Role::Unknown,
                    opened_at: item.timestamp,
                    closed_at: None,
                    label: String::new(),
                };
                merge_endpoint(&mut session, extract_endpoint(item));
                open.push(session);
            }
            (ChannelOp::Open, true) => {
                let allocated = item.channel_id();
                // Duplicate OPEN on an id that is already open is a leak on
                // the prior session; it is closed at the current index.
                if let Some(ch) = allocated {
                    let dup = open
                        .iter()
                        .position(|s| s.channel_id == Some(ch) && s.open_index != item.index);
                    let newest_unassigned = open.iter().rposition(|s| s.channel_id.is_none());
                    if let (Some(dup_pos), Some(_)) = (dup, newest_unassigned) {
                        let mut leaked = open.remove(dup_pos);
                        issues.push(ValidationIssue {
                            severity: Severity::Critical,
                            category: "State Machine".into(),
                            message: format!(
                                "Multiple OPEN CHANNEL on {}",
                                channel_display(Some(ch))
                            ),
                            item_index: Some(item.index),
                            timestamp: item.timestamp,
                        });
                        issues.push(ValidationIssue {
                            severity: Severity::Critical,
                            category: "Resource Leak".into(),
                            message: format!(
                                "{} reopened before being closed",
                                channel_display(Some(ch))
                            ),
                            item_index: Some(leaked.open_index),
                            timestamp: model.items[leaked.open_index].timestamp,
                        });
                        leaked.close_index = Some(item.index);
                        done.push(leaked);
                    }
                }
                let pos = open
                    .iter()
                    .rposition(|s| s.channel_id.is_none() || s.channel_id == allocated);
                if let Some(p) = pos {
                    let session = &mut open[p];
                    if session.channel_id.is_none() {
                        session.channel_id = allocated;
                    }
                    session.item_indices.push(item.index);
                    merge_endpoint(session, extract_endpoint(item));
                } else {
                    // TERMINAL RESPONSE without a preceding proactive OPEN:
                    // start the session here.
                    let mut session = ChannelSession {
                        channel_id: allocated,
                        open_index: item.index,
                        close_index: None,
                        item_indices: vec![item.index],
                        server_name: None,
                        ip_addresses: BTreeSet::new(),
                        port: None,
                        transport: Transport::Unknown,
                        role: Role::Unknown,
                        opened_at: item.timestamp,
                        closed_at: None,
                        label: String::new(),
                    };
                    merge_endpoint(&mut session, extract_endpoint(item));
                    open.push(session);
                }
            }
            (ChannelOp::Send, _) | (ChannelOp::Receive, _) => {
                let ch = item.channel_id();
                let pos = ch
                    .and_then(|c| open.iter().rposition(|s| s.channel_id == Some(c)))
                    .or_else(|| open.len().checked_sub(1));
                match pos {
                    Some(p) => open[p].item_indices.push(item.index),
                    None => issues.push(ValidationIssue {
                        severity: Severity::Warning,
                        category: "State Machine".into(),
                        message: format!(
                            "{} data with no open channel ({})",
                            if op == ChannelOp::Send { "SEND" } else { "RECEIVE" },
                            channel_display(ch)
                        ),
                        item_index: Some(item.index),
                        timestamp: item.timestamp,
                    }),
                }
            }
            (ChannelOp::Close, false) => {
                let ch = item.channel_id();
                let pos = match ch {
                    Some(c) => open
                        .iter()
                        .rposition(|s| s.channel_id == Some(c))
                        .or_else(|| open.iter().rposition(|s| s.channel_id.is_none())),
                    None => (!open.is_empty()).then(|| open.len() - 1),
                };
                match pos {
                    Some(p) => {
                        let mut session = open.remove(p);
                        session.close_index = Some(item.index);
                        session.closed_at = item.timestamp;
                        session.item_indices.push(item.index);
                        done.push(session);
                    }
                    None => issues.push(ValidationIssue {
                        severity: Severity::Critical,
                        category: "State Machine".into(),
                        message: format!(
                            "CLOSE CHANNEL without preceding OPEN ({})",
                            channel_display(ch)
                        ),
                        item_index: Some(item.index),
                        timestamp: item.timestamp,
                    }),
                }
            }
            (ChannelOp::Close, true) => {
                // Attach the TERMINAL RESPONSE to the session just closed.
                if let Some(session) = done
                    .iter_mut()
                    .rev()
                    .find(|s| s.close_index.is_some_and(|c| c < item.index))
                {
                    session.item_indices.push(item.index);
                    session.close_index = Some(item.index);
                    if session.closed_at.is_none() {
                        session.closed_at = item.timestamp;
                    }
                } else if open.is_empty() {
                    issues.push(ValidationIssue {
                        severity: Severity::Critical,
                        category: "State Machine".into(),
                        message: format!(
                            "CLOSE CHANNEL without preceding OPEN ({})",
                            channel_display(item.channel_id())
                        ),
                        item_index: Some(item.index),
                        timestamp: item.timestamp,
                    });
                }
            }
        }
    }

    // Anything still open at end of trace leaked.
    for session in open {
        issues.push(ValidationIssue {
            severity: Severity::Critical,
            category: "Resource Leak".into(),
            message: format!(
                "{} opened but never closed",
                channel_display(session.channel_id)
            ),
            item_index: Some(session.open_index),
            timestamp: model.items[session.open_index].timestamp,
        });
        done.push(session);
    }

    done.sort_by_key(|s| s.open_index);
    for session in &mut done {
        session.item_indices.sort_unstable();
        session.item_indices.dedup();
        session.label = display_label(session, config);
        if session.opened_at.is_none() {
            session.opened_at = session
                .item_indices
                .iter()
                .find_map(|&i| model.items[i].timestamp);
        }
    }
    debug!(sessions = done.len(), "channel sessions reconstructed");
    (done, issues)
}

/// Reconstruct sessions and resolve roles in one go.
pub fn reconstruct_with_roles(
    model: &TraceModel,
    config: &AnalysisConfig,
) -> (Vec<ChannelSession>, Vec<ValidationIssue>) {
    let (mut sessions, issues) = reconstruct(model, config);
    role::resolve(model, &mut sessions, config);
    (sessions, issues)
}
