use chrono::NaiveDateTime;
use regex::Regex;

use crate::config::AnalysisConfig;
use crate::model::{self, TraceModel};
use crate::session::{role, ChannelSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Session,
    Event,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Session => "Session",
            RowKind::Event => "Event",
        }
    }
}

/// One row of the chronological flow timeline.
#[derive(Debug, Clone)]
pub struct TimelineRow {
    pub kind: RowKind,
    /// Matchable type ("TAC", "DNS", "DNSbyME", "Refresh", "ICCID", …).
    pub type_label: String,
    /// Display label.
    pub label: String,
    pub timestamp: Option<NaiveDateTime>,
    /// First trace index, used as the stable sort tie-break.
    pub anchor: usize,
    /// Trace range covered by the row.
    pub span: (usize, usize),
    /// Index into the sessions list for Session rows.
    pub session: Option<usize>,
}

/// Merge sessions and key events into one chronological timeline. Rows are
/// sorted by timestamp with a stable tie-break on trace index; undated rows
/// follow the dated ones in trace order.
pub fn build(
    model: &TraceModel,
    sessions: &[ChannelSession],
    config: &AnalysisConfig,
) -> Vec<TimelineRow> {
    let mut rows = Vec::new();

    for (i, session) in sessions.iter().enumerate() {
        let timestamp = session.opened_at.or_else(|| {
            session
                .item_indices
                .iter()
                .find_map(|&idx| model.items[idx].timestamp)
        });
        rows.push(TimelineRow {
            kind: RowKind::Session,
            type_label: role::type_label(session, config),
            label: session.label.clone(),
            timestamp,
            anchor: session.open_index,
            span: session.span(),
            session: Some(i),
        });
    }

    rows.extend(events(model));
    rows.sort_by_key(|r| (r.timestamp.is_none(), r.timestamp, r.anchor));
    rows
}

fn event_row(item: &crate::model::TraceItem, type_label: &str, label: String) -> TimelineRow {
    TimelineRow {
        kind: RowKind::Event,
        type_label: type_label.to_string(),
        label,
        timestamp: item.timestamp,
        anchor: item.index,
        span: (item.index, item.index),
        session: None,
    }
}

/// Key events: Refresh, Cold Reset, ICCID, plus Link Dropped and BIP errors.
fn events(model: &TraceModel) -> Vec<TimelineRow> {
    let mut rows = Vec::new();

    for item in &model.items {
        let summary = item.summary.to_lowercase();
        if summary.contains("refresh") {
            rows.push(event_row(item, "Refresh", "Refresh".into()));
        } else if summary.contains("cold reset") {
            rows.push(event_row(item, "Cold Reset", "Cold Reset".into()));
        } else {
            let text = item.interp_text().to_lowercase();
            if text.contains("link dropped") || text.contains("link off") {
                rows.push(event_row(item, "Link Dropped", "Link Dropped".into()));
            } else if let Some(cause) = bip_error_cause(item) {
                rows.push(event_row(
                    item,
                    "BIP Error",
                    format!("BIP Error: 0x{cause:02X}"),
                ));
            }
        }
    }

    if let Some(det) = model::detect_iccid(&model.items) {
        let item = &model.items[det.select_index];
        rows.push(event_row(item, "ICCID", format!("ICCID: {}", det.value)));
    }

    rows
}

fn bip_error_cause(item: &crate::model::TraceItem) -> Option<u8> {
    let raw = item.raw.as_deref()?;
    raw.windows(4)
        .find(|w| (w[0] & 0x7F) == 0x03 && w[1] == 0x02 && w[2] == 0x3A)
        .map(|w| w[3])
}

/// Timeline filter, expressed as a regex over the row kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFilter {
    All,
    Sessions,
    Events,
}

impl FlowFilter {
    fn pattern(&self) -> &'static str {
        match self {
            FlowFilter::All => "Session|Event",
            FlowFilter::Sessions => "^Session$",
            FlowFilter::Events => "^Event$",
        }
    }
}

pub fn filter(rows: Vec<TimelineRow>, mode: FlowFilter) -> Vec<TimelineRow> {
    let re = Regex::new(mode.pattern()).expect("filter regex");
    rows.into_iter()
        .filter(|r| re.is_match(r.kind.as_str()))
        .collect()
}
