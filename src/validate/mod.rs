use std::fmt;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::model::{self, TraceItem, TraceModel};
use crate::protocol::tls;
use crate::reassembly;
use crate::session::{self, ChannelSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One anomaly found while scanning the trace.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub item_index: Option<usize>,
    pub timestamp: Option<NaiveDateTime>,
}

impl ValidationIssue {
    fn at(severity: Severity, category: &str, message: impl Into<String>, item: &TraceItem) -> Self {
        ValidationIssue {
            severity,
            category: category.to_string(),
            message: message.into(),
            item_index: Some(item.index),
            timestamp: item.timestamp,
        }
    }
}

/// Full validation pass: state-machine issues from session reconstruction,
/// per-item scans, and TLS compliance. Sorted chronologically.
pub fn validate(model: &TraceModel, config: &AnalysisConfig) -> Vec<ValidationIssue> {
    let (sessions, issues) = session::reconstruct_with_roles(model, config);
    finish(model, &sessions, issues, config)
}

/// Complete a validation run given already-reconstructed sessions.
pub(crate) fn finish(
    model: &TraceModel,
    sessions: &[ChannelSession],
    mut issues: Vec<ValidationIssue>,
    config: &AnalysisConfig,
) -> Vec<ValidationIssue> {
    for (index, message) in &model.ingest_warnings {
        issues.push(ValidationIssue {
            severity: Severity::Warning,
            category: "Ingest".into(),
            message: message.clone(),
            item_index: Some(*index),
            timestamp: model.items.get(*index).and_then(|i| i.timestamp),
        });
    }
    scan_items(model, config, &mut issues);
    tls_compliance(model, sessions, config, &mut issues);
    sort_issues(&mut issues);
    debug!(issues = issues.len(), "validation complete");
    issues
}

/// Sort ascending by timestamp; undated issues keep trace order after all
/// dated ones.
pub fn sort_issues(issues: &mut [ValidationIssue]) {
    issues.sort_by_key(|i| {
        (
            i.timestamp.is_none(),
            i.timestamp,
            i.item_index.unwrap_or(usize::MAX),
        )
    });
}

fn scan_items(model: &TraceModel, config: &AnalysisConfig, issues: &mut Vec<ValidationIssue>) {
    for item in &model.items {
        let summary = item.summary_upper();
        let raw = item.raw.as_deref().unwrap_or(&[]);

        check_location_status(item, raw, config, issues);
        check_card_events(item, &summary, raw, issues);
        check_open_channel_ip(item, &summary, issues);
        check_link_dropped(item, &summary, issues);
        check_sw_5023(item, &summary, raw, issues);
        check_bip_error(item, &summary, raw, issues);
        check_unexpected_response(item, &summary, issues);
        check_terminal_response_result(item, &summary, issues);
    }

    if let Some(det) = model::detect_iccid(&model.items) {
        let anchor = &model.items[det.select_index];
        issues.push(ValidationIssue::at(
            Severity::Info,
            "ICCID Detected",
            det.value,
            anchor,
        ));
    }
}

/// Location status TLV `1B 01 xx` inside event download envelopes.
fn check_location_status(
    item: &TraceItem,
    raw: &[u8],
    config: &AnalysisConfig,
    issues: &mut Vec<ValidationIssue>,
) {
    for window in raw.windows(3) {
        if window[0] != 0x1B || window[1] != 0x01 {
            continue;
        }
        let (severity, label) = match window[2] {
            0x00 => (Severity::Info, "Normal"),
            0x01 => (Severity::Warning, "Limited"),
            0x02 => {
                let severity = if config.no_service_critical {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                (severity, "No Service")
            }
            _ => continue,
        };
        issues.push(ValidationIssue::at(
            severity,
            &format!("Location Status / {label}"),
            format!("{label} service"),
            item,
        ));
        break;
    }
}

fn check_card_events(
    item: &TraceItem,
    summary: &str,
    raw: &[u8],
    issues: &mut Vec<ValidationIssue>,
) {
    if raw == [0x19, 0x00] || summary.contains("CARD POWERED OFF") {
        issues.push(ValidationIssue::at(
            Severity::Info,
            "Card Event",
            "Card Powered Off",
            item,
        ));
        return;
    }
    if summary.contains("COLD RESET") {
        issues.push(ValidationIssue::at(
            Severity::Info,
            "Card Event",
            "Cold Reset",
            item,
        ));
    } else if summary.contains("REFRESH") {
        issues.push(ValidationIssue::at(
            Severity::Info,
            "Card Event",
            "Refresh",
            item,
        ));
    } else if summary.contains("POWER ON") {
        issues.push(ValidationIssue::at(
            Severity::Info,
            "Card Event",
            "Power On",
            item,
        ));
    }
}

/// An OPEN CHANNEL with no target address is typically a DNS channel the ME
/// resolves itself.
fn check_open_channel_ip(item: &TraceItem, summary: &str, issues: &mut Vec<ValidationIssue>) {
    if !summary.starts_with("FETCH") || !summary.contains("OPEN CHANNEL") {
        return;
    }
    if !session::open_channel_has_ip(item) {
        issues.push(ValidationIssue::at(
            Severity::Info,
            "Channel",
            "OPEN CHANNEL without IP address (likely DNS resolved by ME)",
            item,
        ));
    }
}

fn check_link_dropped(item: &TraceItem, summary: &str, issues: &mut Vec<ValidationIssue>) {
    let in_channel_status = summary.contains("CHANNEL STATUS") || summary.contains("ENVELOPE");
    let text = item.interp_text().to_uppercase();
    if (in_channel_status || text.contains("CHANNEL STATUS"))
        && (text.contains("LINK DROPPED") || text.contains("LINK OFF"))
    {
        issues.push(ValidationIssue::at(
            Severity::Critical,
            "Channel Status",
            "Link dropped: channel connection lost",
            item,
        ));
    }
}

fn check_sw_5023(item: &TraceItem, summary: &str, raw: &[u8], issues: &mut Vec<ValidationIssue>) {
    let in_raw = raw.windows(2).any(|w| w == [0x50, 0x23]);
    if item.sw() == Some(0x5023) || (summary.contains("5023") && in_raw) {
        issues.push(ValidationIssue::at(
            Severity::Critical,
            "Status Word",
            "SW 5023: technical problem, no precise diagnosis",
            item,
        ));
    }
}

/// Result TLV `(03|83) 02 3A xx`: Bearer Independent Protocol error with a
/// cause byte.
fn check_bip_error(item: &TraceItem, summary: &str, raw: &[u8], issues: &mut Vec<ValidationIssue>) {
    if !summary.contains("TERMINAL RESPONSE") {
        return;
    }
    for window in raw.windows(4) {
        if (window[0] & 0x7F) == 0x03 && window[1] == 0x02 && window[2] == 0x3A {
            let cause = window[3];
            let message = if cause == 0 {
                "Bearer Independent Protocol error (no specific cause)".to_string()
            } else {
                format!("Bearer Independent Protocol error (cause 0x{cause:02X})")
            };
            issues.push(ValidationIssue::at(
                Severity::Critical,
                "BIP Error",
                message,
                item,
            ));
            break;
        }
    }
}

/// Conservative: only responses the trace itself marks as unexpected.
fn check_unexpected_response(item: &TraceItem, summary: &str, issues: &mut Vec<ValidationIssue>) {
    if summary.contains("TERMINAL RESPONSE") && summary.contains("UNEXPECTED") {
        issues.push(ValidationIssue::at(
            Severity::Info,
            "Trace",
            format!("Terminal response marked unexpected: {}", item.summary),
            item,
        ));
    }
}

/// General Result values reporting an error inside a TERMINAL RESPONSE tree.
fn check_terminal_response_result(
    item: &TraceItem,
    summary: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    if !summary.contains("TERMINAL RESPONSE") {
        return;
    }
    let mut result: Option<String> = None;
    for node in &item.interpretation {
        node.walk(&mut |n| {
            if result.is_some() || !n.content.contains("General Result") {
                return;
            }
            let value = n.content.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
            let upper = value.to_uppercase();
            if upper.contains("ERROR") || upper.contains("UNABLE TO PROCESS") {
                result = Some(value.to_string());
            }
        });
    }
    if let Some(value) = result {
        let command = summary
            .split_once('-')
            .map(|(_, c)| c.trim().to_string())
            .unwrap_or_else(|| "COMMAND".to_string());
        issues.push(ValidationIssue::at(
            Severity::Warning,
            "Terminal Response",
            format!("{command}: {value}"),
            item,
        ));
    }
}

/// TLS compliance warnings per session (weak version, unapproved cipher,
/// certificate validity, single-certificate chain).
fn tls_compliance(
    model: &TraceModel,
    sessions: &[ChannelSession],
    config: &AnalysisConfig,
    issues: &mut Vec<ValidationIssue>,
) {
    for session in sessions {
        let streams = reassembly::reassemble(model, session, config);
        if !tls::is_tls(&streams.outbound.data) && !tls::is_tls(&streams.inbound.data) {
            continue;
        }
        let outbound = tls::analyze_stream(&streams.outbound.data);
        let inbound = tls::analyze_stream(&streams.inbound.data);
        for message in
            tls::compliance_issues(&outbound, &inbound, session.opened_at, &config.approved_ciphers)
        {
            issues.push(ValidationIssue {
                severity: Severity::Warning,
                category: "TLS Compliance".into(),
                message,
                item_index: Some(session.open_index),
                timestamp: session.opened_at,
            });
        }
    }
}
