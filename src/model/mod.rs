use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::apdu::{self, Apdu};
use crate::apdu::tlv::{self, Tlv};

/// One node of the interpretation tree, preserving XML order and nesting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpNode {
    pub content: String,
    pub children: Vec<InterpNode>,
}

impl InterpNode {
    pub fn new(content: impl Into<String>) -> Self {
        InterpNode {
            content: content.into(),
            children: Vec::new(),
        }
    }

    /// Depth-first visit of this node and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a InterpNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// One row of the trace. Immutable after ingestion.
#[derive(Debug, Clone, Default)]
pub struct TraceItem {
    /// Position in the file; unique and dense.
    pub index: usize,
    pub protocol: String,
    pub item_type: String,
    pub timestamp: Option<NaiveDateTime>,
    pub raw: Option<Vec<u8>>,
    /// Top-level interpretation nodes in document order.
    pub interpretation: Vec<InterpNode>,
    /// Content of the first interpretation node, or empty.
    pub summary: String,
    /// Structural decode of `raw`, when the item type suggests an APDU.
    pub apdu: Option<Apdu>,
    /// Top-level BER-TLVs of the APDU body (or of `raw` for non-APDU items).
    pub tlvs: Option<Vec<Tlv>>,
}

static CHANNEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:allocated channel|channel identifier|channel id)\s*:\s*(\d+)")
        .expect("channel regex")
});
static SW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)SW:\s*([0-9A-F]{2})\s*([0-9A-F]{2})").expect("sw regex"));

impl TraceItem {
    /// Uppercased summary for keyword matching.
    pub fn summary_upper(&self) -> String {
        self.summary.to_uppercase()
    }

    /// All interpretation contents plus the summary, flattened to one string.
    pub fn interp_text(&self) -> String {
        let mut parts = vec![self.summary.clone()];
        for node in &self.interpretation {
            node.walk(&mut |n| {
                if !n.content.is_empty() {
                    parts.push(n.content.clone());
                }
            });
        }
        parts.join("\n")
    }

    /// Proactive command item (FETCH result or bare FETCH).
    pub fn is_fetch(&self) -> bool {
        self.item_type.eq_ignore_ascii_case("fetch")
            || self.summary_upper().trim_start().starts_with("FETCH")
    }

    pub fn is_terminal_response(&self) -> bool {
        self.item_type.eq_ignore_ascii_case("terminalresponse")
            || self
                .summary_upper()
                .trim_start()
                .starts_with("TERMINAL RESPONSE")
    }

    /// Channel id, from the interpretation tree first, else from the
    /// Command Details qualifier of channel-management commands.
    pub fn channel_id(&self) -> Option<u8> {
        if let Some(caps) = CHANNEL_RE.captures(&self.interp_text()) {
            if let Ok(id) = caps[1].parse::<u8>() {
                return Some(id);
            }
        }
        let tlvs = self.tlvs.as_deref()?;
        let raw = self.raw.as_deref()?;
        apdu::command_details(tlvs, raw).and_then(|d| d.channel_id())
    }

    /// Status word, from the decoded APDU or from a "SW: xxxx" marker in the
    /// summary.
    pub fn sw(&self) -> Option<u16> {
        if let Some(sw) = self.apdu.as_ref().and_then(|a| a.sw()) {
            return Some(sw);
        }
        let caps = SW_RE.captures(&self.summary)?;
        let hi = u8::from_str_radix(&caps[1], 16).ok()?;
        let lo = u8::from_str_radix(&caps[2], 16).ok()?;
        Some(u16::from_be_bytes([hi, lo]))
    }
}

/// Canonical in-memory trace with derived indices. Shared read-only by all
/// analysis stages.
#[derive(Debug, Default)]
pub struct TraceModel {
    pub items: Vec<TraceItem>,
    pub by_protocol: BTreeMap<String, Vec<usize>>,
    pub by_type: BTreeMap<String, Vec<usize>>,
    pub by_channel: BTreeMap<u8, Vec<usize>>,
    /// ICCID decoded from SELECT EF_ICCID + READ BINARY, when present.
    pub iccid: Option<String>,
    /// Per-item ingestion warnings (malformed items kept with empty
    /// interpretation).
    pub ingest_warnings: Vec<(usize, String)>,
}

impl TraceModel {
    /// Build the model from ingested items: assign dense indices, run the
    /// APDU/TLV decoder and compute the lookup indices.
    pub fn build(mut items: Vec<TraceItem>) -> Self {
        for (i, item) in items.iter_mut().enumerate() {
            item.index = i;
            if let Some(raw) = item.raw.clone() {
                item.apdu = apdu::parse(&item.item_type, &raw);
                // Body offsets are relative to the window start; shift so
                // they index into the item's raw bytes.
                let (window, shift): (&[u8], usize) = match &item.apdu {
                    Some(Apdu::Command { lc, data, .. }) => {
                        (data.as_slice(), if lc.is_some() { 5 } else { 4 })
                    }
                    Some(Apdu::Response { data, .. }) => (data.as_slice(), 0),
                    None => (&raw, 0),
                };
                if !window.is_empty() {
                    let mut tlvs = tlv::parse_lenient(window);
                    if shift != 0 {
                        for t in &mut tlvs {
                            shift_tlv(t, shift);
                        }
                    }
                    if !tlvs.is_empty() {
                        item.tlvs = Some(tlvs);
                    }
                }
            }
        }

        let mut model = TraceModel {
            items,
            ..TraceModel::default()
        };
        for item in &model.items {
            model
                .by_protocol
                .entry(item.protocol.clone())
                .or_default()
                .push(item.index);
            model
                .by_type
                .entry(item.item_type.clone())
                .or_default()
                .push(item.index);
            if let Some(ch) = item.channel_id() {
                model.by_channel.entry(ch).or_default().push(item.index);
            }
        }
        model.iccid = detect_iccid(&model.items).map(|d| d.value);
        model
    }
}

fn shift_tlv(tlv: &mut Tlv, shift: usize) {
    tlv.start += shift;
    for child in &mut tlv.children {
        shift_tlv(child, shift);
    }
}

/// Detected ICCID read sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IccidDetection {
    /// Index of the SELECT EF_ICCID item the detection is anchored to.
    pub select_index: usize,
    /// Index of the READ BINARY response carrying the value.
    pub response_index: usize,
    pub value: String,
}

/// Scan for SELECT EF_ICCID → READ BINARY → 9000 response and decode the
/// BCD-encoded ICCID from the response data.
pub fn detect_iccid(items: &[TraceItem]) -> Option<IccidDetection> {
    let mut select_index: Option<usize> = None;
    let mut read_seen = false;

    for item in items {
        let summary = item.summary_upper();
        if summary.contains("SELECT") && summary.contains("ICCID") {
            select_index = Some(item.index);
            read_seen = false;
        } else if select_index.is_some()
            && summary.contains("READ BINARY")
            && item.item_type.eq_ignore_ascii_case("apducommand")
        {
            read_seen = true;
        } else if read_seen
            && item.item_type.eq_ignore_ascii_case("apduresponse")
            && item.sw() == Some(0x9000)
        {
            let Some(data) = item
                .apdu
                .as_ref()
                .map(|a| a.body().to_vec())
                .or_else(|| item.raw.clone())
            else {
                continue;
            };
            let body = if data.len() >= 12 && data.ends_with(&[0x90, 0x00]) {
                &data[..data.len() - 2]
            } else {
                &data[..]
            };
            if let Some(value) = decode_bcd_iccid(body) {
                return Some(IccidDetection {
                    select_index: select_index.unwrap_or(item.index),
                    response_index: item.index,
                    value,
                });
            }
            select_index = None;
            read_seen = false;
        }
    }
    None
}

/// Decode a nibble-swapped BCD ICCID, stripping trailing F padding.
/// A valid ICCID is at least 18 digits and starts with 89.
pub fn decode_bcd_iccid(data: &[u8]) -> Option<String> {
    if data.len() < 9 {
        return None;
    }
    let mut digits = String::with_capacity(data.len() * 2);
    for b in data {
        for nibble in [b & 0x0F, b >> 4] {
            digits.push(match nibble {
                0..=9 => (b'0' + nibble) as char,
                0xF => 'F',
                _ => return None,
            });
        }
    }
    let trimmed = digits.trim_end_matches('F');
    if trimmed.len() >= 18 && trimmed.starts_with("89") && !trimmed.contains('F') {
        Some(trimmed.to_string())
    } else {
        None
    }
}

static TS_UT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{1,2})/(\d{1,2})/(\d{4})\s+(\d{1,2}):(\d{2}):(\d{2})(?::(\d{1,3}))?(?:\.(\d{1,9}))?",
    )
    .expect("ut timestamp regex")
});
static TS_ISO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})[T ](\d{1,2}):(\d{2}):(\d{2})(?:\.(\d{1,9}))?")
        .expect("iso timestamp regex")
});

/// Flexible timestamp parsing: `MM/DD/YYYY HH:MM:SS[:ms[.us]]` (Universal
/// Tracer) and `YYYY-MM-DD[T ]hh:mm:ss[.frac]`. Normalised to naive UTC with
/// microsecond precision.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Some(caps) = TS_UT_RE.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        let hour: u32 = caps[4].parse().ok()?;
        let minute: u32 = caps[5].parse().ok()?;
        let second: u32 = caps[6].parse().ok()?;
        let millis: u32 = caps
            .get(7)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        // Sub-millisecond digits follow the dot; only the first three count
        // at microsecond precision.
        let sub: u32 = caps
            .get(8)
            .map(|m| {
                let s = format!("{:0<3.3}", m.as_str());
                s.parse().unwrap_or(0)
            })
            .unwrap_or(0);
        return NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_micro_opt(hour, minute, second, millis * 1000 + sub);
    }
    if let Some(caps) = TS_ISO_RE.captures(text) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        let hour: u32 = caps[4].parse().ok()?;
        let minute: u32 = caps[5].parse().ok()?;
        let second: u32 = caps[6].parse().ok()?;
        let micro: u32 = caps
            .get(7)
            .map(|m| {
                let s = format!("{:0<6.6}", m.as_str());
                s.parse().unwrap_or(0)
            })
            .unwrap_or(0);
        return NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_micro_opt(hour, minute, second, micro);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, item_type: &str, summary: &str) -> TraceItem {
        TraceItem {
            index,
            protocol: "ISO7816".into(),
            item_type: item_type.into(),
            summary: summary.into(),
            ..TraceItem::default()
        }
    }

    #[test]
    fn parse_universal_tracer_timestamp() {
        let ts = parse_timestamp("10/23/2025 16:16:21:272.000000").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(), "2025-10-23 16:16:21.272000");
    }

    #[test]
    fn parse_universal_tracer_timestamp_no_millis() {
        let ts = parse_timestamp("01/05/2024 09:07:03").unwrap();
        assert_eq!(ts.format("%H:%M:%S").to_string(), "09:07:03");
    }

    #[test]
    fn parse_iso_timestamp() {
        let ts = parse_timestamp("2025-10-23T16:16:21.272").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(), "2025-10-23 16:16:21.272");
        assert!(parse_timestamp("2025-10-23 16:16:21").is_some());
    }

    #[test]
    fn parse_garbage_timestamp() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("13/45/2025 99:99:99").is_none());
    }

    #[test]
    fn channel_id_from_interpretation() {
        let mut it = item(0, "apduresponse", "TERMINAL RESPONSE - OPEN CHANNEL");
        it.interpretation = vec![InterpNode {
            content: "Channel Status".into(),
            children: vec![InterpNode::new("Allocated Channel : 2")],
        }];
        assert_eq!(it.channel_id(), Some(2));
    }

    #[test]
    fn channel_id_from_command_details_qualifier() {
        let raw = vec![
            0x80, 0x12, 0x00, 0x00, 0x09, 0xD0, 0x07, 0x81, 0x03, 0x01, 0x43, 0x03, 0x82, 0x00,
        ];
        let mut it = item(0, "apducommand", "FETCH - SEND DATA");
        it.raw = Some(raw);
        let model = TraceModel::build(vec![it]);
        assert_eq!(model.items[0].channel_id(), Some(3));
    }

    #[test]
    fn sw_from_summary() {
        let it = item(0, "apduresponse", "SW: 9000 (Normal processing)");
        assert_eq!(it.sw(), Some(0x9000));
        let it = item(0, "apduresponse", "SW: 91 2A");
        assert_eq!(it.sw(), Some(0x912A));
    }

    #[test]
    fn summary_invariant_holds_after_build() {
        let mut it = item(0, "apduresponse", "FETCH - OPEN CHANNEL");
        it.interpretation = vec![InterpNode::new("FETCH - OPEN CHANNEL")];
        let model = TraceModel::build(vec![it]);
        assert_eq!(model.items[0].summary, model.items[0].interpretation[0].content);
    }

    #[test]
    fn indices_are_dense_and_grouped() {
        let items = vec![
            item(0, "apducommand", "FETCH"),
            item(0, "apduresponse", "FETCH - OPEN CHANNEL"),
            item(0, "envelope", "ENVELOPE - EVENT DOWNLOAD"),
        ];
        let model = TraceModel::build(items);
        for (i, it) in model.items.iter().enumerate() {
            assert_eq!(it.index, i);
        }
        assert_eq!(model.by_type["apducommand"], vec![0]);
        assert_eq!(model.by_protocol["ISO7816"].len(), 3);
    }

    #[test]
    fn decode_iccid_swaps_nibbles_and_strips_padding() {
        // 8944 5000 0000 0012 34 + F padding
        let data = [0x98, 0x44, 0x05, 0x00, 0x00, 0x00, 0x00, 0x10, 0x32, 0xF4];
        let iccid = decode_bcd_iccid(&data).unwrap();
        assert_eq!(iccid, "8944500000000001234");
    }

    #[test]
    fn decode_iccid_rejects_wrong_prefix() {
        let data = [0x12, 0x44, 0x05, 0x00, 0x00, 0x00, 0x00, 0x10, 0x32, 0xF4];
        assert!(decode_bcd_iccid(&data).is_none());
    }

    #[test]
    fn detect_iccid_sequence() {
        let mut select = item(0, "apducommand", "SELECT FILE - EF_ICCID");
        select.raw = Some(vec![0x00, 0xA4, 0x00, 0x00, 0x02, 0x2F, 0xE2]);
        let read = item(1, "apducommand", "READ BINARY");
        let mut resp = item(2, "apduresponse", "SW: 9000");
        resp.raw = Some(vec![
            0x98, 0x44, 0x05, 0x00, 0x00, 0x00, 0x00, 0x10, 0x32, 0xF4, 0x90, 0x00,
        ]);
        let model = TraceModel::build(vec![select, read, resp]);
        assert_eq!(model.iccid.as_deref(), Some("8944500000000001234"));
        let det = detect_iccid(&model.items).unwrap();
        assert_eq!(det.select_index, 0);
        assert_eq!(det.response_index, 2);
    }
}
