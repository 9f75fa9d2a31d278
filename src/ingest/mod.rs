use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::model::{self, InterpNode, TraceItem, TraceModel};

/// Errors surfaced by ingestion. Only a document-level XML failure is fatal;
/// per-item problems become warnings on the model.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid XML: {0}")]
    InvalidXml(String),
    #[error("missing <tracedata> root element")]
    MissingRoot,
    #[error("ingestion cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cooperative cancellation flag, checked between trace items.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Load a trace file into an immutable model.
pub fn load(path: &Path) -> Result<TraceModel, IngestError> {
    load_with_cancel(path, &CancelToken::new())
}

pub fn load_with_cancel(path: &Path, token: &CancelToken) -> Result<TraceModel, IngestError> {
    let bytes = std::fs::read(path)?;
    load_bytes(&bytes, token)
}

/// Run ingestion on a worker thread; the completed model is handed back over
/// the returned channel as a single value.
pub fn load_in_background(
    path: PathBuf,
    token: CancelToken,
) -> crossbeam_channel::Receiver<Result<TraceModel, IngestError>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(load_with_cancel(&path, &token));
    });
    rx
}

/// Parse in-memory XML into the trace model.
pub fn load_bytes(bytes: &[u8], token: &CancelToken) -> Result<TraceModel, IngestError> {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = Reader::from_reader(text.as_bytes());
    let mut buf = Vec::new();

    let mut seen_root = false;
    let mut items: Vec<TraceItem> = Vec::new();
    let mut warnings: Vec<(usize, String)> = Vec::new();
    let mut current: Option<ItemBuilder> = None;

    loop {
        buf.clear();
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| IngestError::InvalidXml(e.to_string()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name().as_ref().to_vec();
                let empty = matches!(event, Event::Empty(_));
                if !seen_root {
                    if name != b"tracedata" {
                        return Err(IngestError::MissingRoot);
                    }
                    seen_root = true;
                    if empty {
                        break;
                    }
                    continue;
                }
                match name.as_slice() {
                    b"traceitem" => {
                        if token.is_cancelled() {
                            return Err(IngestError::Cancelled);
                        }
                        let mut builder = ItemBuilder::default();
                        builder.read_item_attrs(e);
                        if empty {
                            items.push(builder.finish(items.len(), &mut warnings));
                        } else {
                            current = Some(builder);
                        }
                    }
                    b"data" => {
                        if let Some(b) = current.as_mut() {
                            b.read_data_attrs(e);
                        }
                    }
                    b"interpretedresult" => {
                        if let Some(b) = current.as_mut() {
                            let node = InterpNode::new(attr_value(e, b"content").unwrap_or_default());
                            if empty {
                                b.attach(node);
                            } else {
                                b.interp_stack.push(node);
                            }
                        }
                    }
                    b"timestamp" => {
                        if let Some(b) = current.as_mut() {
                            b.in_timestamp = !empty;
                        }
                    }
                    b"standard" => {
                        if let Some(b) = current.as_mut() {
                            if b.in_timestamp {
                                b.read_standard_attrs(e);
                            }
                        }
                    }
                    b"formatted" => {
                        if let Some(b) = current.as_mut() {
                            b.in_formatted = !empty;
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                if let Some(b) = current.as_mut() {
                    if b.in_formatted {
                        if let Ok(text) = t.unescape() {
                            let text = text.trim().to_string();
                            if !text.is_empty() {
                                b.formatted_ts = Some(text);
                            }
                        }
                    }
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"traceitem" => {
                    if let Some(b) = current.take() {
                        items.push(b.finish(items.len(), &mut warnings));
                    }
                }
                b"interpretedresult" => {
                    if let Some(b) = current.as_mut() {
                        if let Some(node) = b.interp_stack.pop() {
                            b.attach(node);
                        }
                    }
                }
                b"timestamp" => {
                    if let Some(b) = current.as_mut() {
                        b.in_timestamp = false;
                    }
                }
                b"formatted" => {
                    if let Some(b) = current.as_mut() {
                        b.in_formatted = false;
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(IngestError::MissingRoot);
    }

    debug!(items = items.len(), warnings = warnings.len(), "trace ingested");
    let mut model = TraceModel::build(items);
    model.ingest_warnings = warnings;
    Ok(model)
}

#[derive(Default)]
struct ItemBuilder {
    protocol: String,
    item_type: String,
    raw: Option<Vec<u8>>,
    raw_error: Option<String>,
    interpretation: Vec<InterpNode>,
    interp_stack: Vec<InterpNode>,
    ts_attrs: BTreeMap<String, String>,
    formatted_ts: Option<String>,
    in_timestamp: bool,
    in_formatted: bool,
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        (a.key.as_ref() == key)
            .then(|| a.unescape_value().map(|v| v.into_owned()).unwrap_or_default())
    })
}

impl ItemBuilder {
    fn read_item_attrs(&mut self, e: &BytesStart<'_>) {
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_default();
            match key.as_str() {
                "protocol" => self.protocol = value,
                "type" => self.item_type = value,
                _ => {
                    self.ts_attrs.insert(key, value);
                }
            }
        }
    }

    fn read_data_attrs(&mut self, e: &BytesStart<'_>) {
        if let Some(rawhex) = attr_value(e, b"rawhex") {
            let cleaned: String = rawhex.chars().filter(|c| !c.is_whitespace()).collect();
            match hex::decode(&cleaned) {
                Ok(bytes) => self.raw = Some(bytes),
                Err(e) => self.raw_error = Some(format!("bad rawhex: {e}")),
            }
        }
    }

    fn read_standard_attrs(&mut self, e: &BytesStart<'_>) {
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_default();
            self.ts_attrs.insert(key, value);
        }
    }

    /// Attach a completed interpretedresult node to its parent, or to the
    /// top level when the stack is empty.
    fn attach(&mut self, node: InterpNode) {
        match self.interp_stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.interpretation.push(node),
        }
    }

    fn finish(mut self, index: usize, warnings: &mut Vec<(usize, String)>) -> TraceItem {
        // Unterminated interpretedresult elements cannot happen with
        // well-formed XML, but drain defensively.
        while let Some(node) = self.interp_stack.pop() {
            self.attach(node);
        }
        if let Some(err) = self.raw_error.take() {
            warnings.push((index, err));
        }
        if self.interpretation.is_empty() {
            warnings.push((index, "item without interpretation".into()));
        }
        let summary = self
            .interpretation
            .first()
            .map(|n| n.content.clone())
            .unwrap_or_default();
        let timestamp = self.compose_timestamp();
        TraceItem {
            index,
            protocol: self.protocol,
            item_type: self.item_type,
            timestamp,
            raw: self.raw,
            interpretation: self.interpretation,
            summary,
            apdu: None,
            tlvs: None,
        }
    }

    fn compose_timestamp(&self) -> Option<NaiveDateTime> {
        if let Some(ts) = self
            .formatted_ts
            .as_deref()
            .and_then(model::parse_timestamp)
        {
            return Some(ts);
        }
        for key in ["timestamp", "datetime"] {
            if let Some(ts) = self.ts_attrs.get(key).and_then(|v| model::parse_timestamp(v)) {
                return Some(ts);
            }
        }
        if let (Some(date), Some(time)) = (self.ts_attrs.get("date"), self.ts_attrs.get("time")) {
            if let Some(ts) = model::parse_timestamp(&format!("{date} {time}")) {
                return Some(ts);
            }
        }

        // Individual components: year/month/date (or day)/hour/minute/second.
        let get = |k: &str| self.ts_attrs.get(k).and_then(|v| v.parse::<u32>().ok());
        let year = self.ts_attrs.get("year").and_then(|v| v.parse::<i32>().ok())?;
        let month = get("month")?;
        let day = get("date").or_else(|| get("day"))?;
        let hour = get("hour")?;
        let minute = get("minute")?;
        let second = get("second")?;
        let micro = match (get("millisecond"), get("nanosecond")) {
            (Some(ms), Some(ns)) => ms * 1000 + (ns / 1000) % 1000,
            (Some(ms), None) => ms * 1000,
            (None, Some(ns)) => ns / 1000,
            (None, None) => 0,
        };
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_micro_opt(hour, minute, second, micro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_str(xml: &str) -> Result<TraceModel, IngestError> {
        load_bytes(xml.as_bytes(), &CancelToken::new())
    }

    #[test]
    fn parse_minimal_trace() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apducommand"
                           year="2025" month="10" date="23" hour="16" minute="16" second="21" millisecond="272">
                    <data rawhex="A0 12 00 00 19"/>
                    <interpretation>
                        <interpretedresult content="FETCH"/>
                    </interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert_eq!(model.items.len(), 1);
        let item = &model.items[0];
        assert_eq!(item.protocol, "ISO7816");
        assert_eq!(item.item_type, "apducommand");
        assert_eq!(item.summary, "FETCH");
        assert_eq!(item.raw.as_deref(), Some(&[0xA0, 0x12, 0x00, 0x00, 0x19][..]));
        assert_eq!(
            item.timestamp.unwrap().format("%H:%M:%S%.3f").to_string(),
            "16:16:21.272"
        );
    }

    #[test]
    fn interpretation_tree_preserves_nesting() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apduresponse">
                    <interpretation>
                        <interpretedresult content="FETCH - OPEN CHANNEL">
                            <interpretedresult content="Bearer Description">
                                <interpretedresult content="Bearer Type: GPRS"/>
                            </interpretedresult>
                            <interpretedresult content="Port Number: 443"/>
                        </interpretedresult>
                    </interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        let item = &model.items[0];
        assert_eq!(item.summary, "FETCH - OPEN CHANNEL");
        let root = &item.interpretation[0];
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].children[0].content, "Bearer Type: GPRS");
        assert_eq!(root.children[1].content, "Port Number: 443");
    }

    #[test]
    fn timestamp_element_standard_form() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apducommand">
                    <timestamp><standard year="2025" month="3" date="7" hour="9" minute="5" second="1" millisecond="42"/></timestamp>
                    <interpretation><interpretedresult content="FETCH"/></interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert_eq!(
            model.items[0]
                .timestamp
                .unwrap()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
            "2025-03-07 09:05:01.042"
        );
    }

    #[test]
    fn timestamp_formatted_form() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apducommand">
                    <timestamp><formatted>10/23/2025 16:16:21:272.000000</formatted></timestamp>
                    <interpretation><interpretedresult content="FETCH"/></interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert!(model.items[0].timestamp.is_some());
    }

    #[test]
    fn item_without_timestamp_is_kept() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="BIP" type="envelope">
                    <interpretation><interpretedresult content="ENVELOPE"/></interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert!(model.items[0].timestamp.is_none());
    }

    #[test]
    fn malformed_rawhex_becomes_warning() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apducommand">
                    <data rawhex="ZZ GG"/>
                    <interpretation><interpretedresult content="FETCH"/></interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert!(model.items[0].raw.is_none());
        assert_eq!(model.ingest_warnings.len(), 1);
        assert_eq!(model.ingest_warnings[0].0, 0);
    }

    #[test]
    fn item_without_interpretation_kept_with_warning() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apducommand">
                    <data rawhex="A012000019"/>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert_eq!(model.items.len(), 1);
        assert!(model.items[0].summary.is_empty());
        assert!(!model.ingest_warnings.is_empty());
    }

    #[test]
    fn invalid_xml_is_fatal() {
        assert!(matches!(
            load_str("<tracedata><traceitem></tracedata>"),
            Err(IngestError::InvalidXml(_))
        ));
    }

    #[test]
    fn wrong_root_rejected() {
        assert!(matches!(
            load_str("<notatrace></notatrace>"),
            Err(IngestError::MissingRoot)
        ));
        assert!(matches!(load_str(""), Err(IngestError::MissingRoot)));
    }

    #[test]
    fn whitespace_in_rawhex_is_ignored() {
        let model = load_str(
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apduresponse">
                    <data rawhex="90  00"/>
                    <interpretation><interpretedresult content="SW: 9000"/></interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();
        assert_eq!(model.items[0].raw.as_deref(), Some(&[0x90, 0x00][..]));
    }

    #[test]
    fn cancellation_aborts_between_items() {
        let token = CancelToken::new();
        token.cancel();
        let xml = r#"<tracedata>
            <traceitem protocol="ISO7816" type="apducommand">
                <interpretation><interpretedresult content="FETCH"/></interpretation>
            </traceitem>
        </tracedata>"#;
        assert!(matches!(
            load_bytes(xml.as_bytes(), &token),
            Err(IngestError::Cancelled)
        ));
    }

    #[test]
    fn empty_tracedata_yields_empty_model() {
        let model = load_str("<tracedata/>").unwrap();
        assert!(model.items.is_empty());
    }

    #[test]
    fn background_load_hands_back_one_model() {
        let dir = std::env::temp_dir();
        let path = dir.join("xtilens_ingest_background.xti");
        std::fs::write(
            &path,
            r#"<tracedata>
                <traceitem protocol="ISO7816" type="apducommand">
                    <interpretation><interpretedresult content="FETCH"/></interpretation>
                </traceitem>
            </tracedata>"#,
        )
        .unwrap();

        let rx = load_in_background(path.clone(), CancelToken::new());
        let model = rx.recv().expect("worker result").expect("model");
        assert_eq!(model.items.len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
