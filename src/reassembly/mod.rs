use crate::config::AnalysisConfig;
use crate::model::{TraceItem, TraceModel};
use crate::session::ChannelSession;

/// Direction of a reassembled payload stream. SEND DATA payloads travel
/// ME→SIM on the command layer; RECEIVE DATA payloads travel SIM→ME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    MeToSim,
    SimToMe,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::MeToSim => "ME→SIM",
            Direction::SimToMe => "SIM→ME",
        }
    }
}

/// Byte range of one source item inside a reassembled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSegment {
    pub offset: usize,
    pub len: usize,
    pub item_index: usize,
}

/// Ordered concatenation of channel-data bytes for one (channel, direction).
#[derive(Debug, Clone, Default)]
pub struct PayloadStream {
    pub channel_id: Option<u8>,
    pub data: Vec<u8>,
    pub segments: Vec<StreamSegment>,
}

impl PayloadStream {
    fn push(&mut self, item_index: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.segments.push(StreamSegment {
            offset: self.data.len(),
            len: bytes.len(),
            item_index,
        });
        self.data.extend_from_slice(bytes);
    }

    /// Source item for a byte offset, for hex ↔ trace selection sync.
    pub fn item_at(&self, offset: usize) -> Option<usize> {
        self.segments
            .iter()
            .find(|s| offset >= s.offset && offset < s.offset + s.len)
            .map(|s| s.item_index)
    }
}

/// Both directions of one session's traffic.
#[derive(Debug, Clone, Default)]
pub struct SessionStreams {
    /// SEND DATA payloads (ME→SIM).
    pub outbound: PayloadStream,
    /// RECEIVE DATA payloads (SIM→ME).
    pub inbound: PayloadStream,
}

impl SessionStreams {
    pub fn stream(&self, direction: Direction) -> &PayloadStream {
        match direction {
            Direction::MeToSim => &self.outbound,
            Direction::SimToMe => &self.inbound,
        }
    }
}

/// Channel Data TLV value of one item, located by walking its TLV tree.
fn channel_data<'a>(item: &'a TraceItem, config: &AnalysisConfig) -> Option<&'a [u8]> {
    let tlvs = item.tlvs.as_deref()?;
    let raw = item.raw.as_deref()?;
    let wanted = config.channel_data_tag as u32;
    let node = tlvs
        .iter()
        .find_map(|t| t.find(&|n| n.short_tag() == wanted && n.length > 0))?;
    Some(node.value(raw))
}

/// Reassemble a session's payload, one contiguous buffer per direction.
pub fn reassemble(
    model: &TraceModel,
    session: &ChannelSession,
    config: &AnalysisConfig,
) -> SessionStreams {
    reassemble_limited(model, session, config, usize::MAX)
}

/// Reassemble using at most the first `max_items` session items. Role
/// detection uses this to bound its TLS scan.
pub fn reassemble_limited(
    model: &TraceModel,
    session: &ChannelSession,
    config: &AnalysisConfig,
    max_items: usize,
) -> SessionStreams {
    let mut streams = SessionStreams::default();
    streams.outbound.channel_id = session.channel_id;
    streams.inbound.channel_id = session.channel_id;

    for &index in session.item_indices.iter().take(max_items) {
        let Some(item) = model.items.get(index) else {
            continue;
        };
        let summary = item.summary_upper();
        let stream = if summary.contains("SEND DATA") {
            &mut streams.outbound
        } else if summary.contains("RECEIVE DATA") {
            &mut streams.inbound
        } else {
            continue;
        };
        if let Some(bytes) = channel_data(item, config) {
            stream.push(index, bytes);
        }
    }
    streams
}
