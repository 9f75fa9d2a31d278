use std::collections::BTreeMap;

use crate::model::{TraceItem, TraceModel};

/// Outcome of one FETCH ↔ TERMINAL RESPONSE exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStatus {
    Success,
    Error,
    Pending,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Success => "Success",
            PairStatus::Error => "Error",
            PairStatus::Pending => "Pending",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pair {
    pub fetch_index: usize,
    pub response_index: Option<usize>,
    pub status: PairStatus,
    pub sw: Option<u16>,
    pub duration_ms: Option<i64>,
}

/// Pairing result plus navigation indices.
#[derive(Debug, Default)]
pub struct Pairing {
    pub pairs: Vec<Pair>,
    pub by_fetch: BTreeMap<usize, usize>,
    pub by_response: BTreeMap<usize, usize>,
    /// Item indices per (protocol, channel) context, in trace order, for
    /// same-session navigation.
    pub contexts: BTreeMap<(String, Option<u8>), Vec<usize>>,
}

impl Pairing {
    /// Next item in the same (protocol, channel) context after `index`.
    pub fn next_in_context(&self, model: &TraceModel, index: usize) -> Option<usize> {
        let key = context_key(model.items.get(index)?);
        let list = self.contexts.get(&key)?;
        let pos = list.iter().position(|&i| i == index)?;
        list.get(pos + 1).copied()
    }

    /// Previous item in the same (protocol, channel) context before `index`.
    pub fn prev_in_context(&self, model: &TraceModel, index: usize) -> Option<usize> {
        let key = context_key(model.items.get(index)?);
        let list = self.contexts.get(&key)?;
        let pos = list.iter().position(|&i| i == index)?;
        pos.checked_sub(1).and_then(|p| list.get(p)).copied()
    }
}

fn context_key(item: &TraceItem) -> (String, Option<u8>) {
    (item.protocol.clone(), item.channel_id())
}

/// Success on SW 9000 or 91xx (proactive data waiting).
fn sw_is_success(sw: u16) -> bool {
    sw == 0x9000 || (sw & 0xFF00) == 0x9100
}

/// A pairable fetch is a proactive command item. When the ME's bare FETCH
/// command is immediately followed by the card's "FETCH - …" result, only the
/// result item is pairable; the command is transport plumbing.
fn is_pairable_fetch(model: &TraceModel, index: usize) -> bool {
    let item = &model.items[index];
    if !item.is_fetch() || item.is_terminal_response() {
        return false;
    }
    let bare = item.summary_upper().trim() == "FETCH";
    if bare {
        if let Some(next) = model.items.get(index + 1) {
            if next.is_fetch() && next.summary_upper().trim() != "FETCH" {
                return false;
            }
        }
    }
    true
}

/// Status word for a terminal response: from the item itself, or from the
/// immediately following response APDU.
fn response_sw(model: &TraceModel, index: usize) -> Option<u16> {
    if let Some(sw) = model.items[index].sw() {
        return Some(sw);
    }
    let next = model.items.get(index + 1)?;
    if next.item_type.eq_ignore_ascii_case("apduresponse") {
        next.sw()
    } else {
        None
    }
}

/// Pair every proactive command with the first subsequent TERMINAL RESPONSE
/// on a matching context. Contexts match on channel id when both sides carry
/// one, otherwise on protocol alone. An unanswered FETCH blocks earlier
/// fetches on the same context until it is answered, so responses resolve
/// newest-first.
pub fn pair(model: &TraceModel) -> Pairing {
    let mut pairing = Pairing::default();
    // Open fetches per protocol, as indices into `pairing.pairs`.
    let mut open: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    for item in &model.items {
        pairing
            .contexts
            .entry(context_key(item))
            .or_default()
            .push(item.index);

        if is_pairable_fetch(model, item.index) {
            let pair_idx = pairing.pairs.len();
            pairing.pairs.push(Pair {
                fetch_index: item.index,
                response_index: None,
                status: PairStatus::Pending,
                sw: None,
                duration_ms: None,
            });
            open.entry(item.protocol.clone()).or_default().push(pair_idx);
        } else if item.is_terminal_response() {
            let stack = match open.get_mut(&item.protocol) {
                Some(s) => s,
                None => continue,
            };
            let response_channel = item.channel_id();
            // Newest compatible open fetch wins.
            let slot = stack.iter().rposition(|&pi| {
                let fetch_channel = model.items[pairing.pairs[pi].fetch_index].channel_id();
                match (fetch_channel, response_channel) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
            });
            let Some(slot) = slot else { continue };
            let pair_idx = stack.remove(slot);

            let pair = &mut pairing.pairs[pair_idx];
            pair.response_index = Some(item.index);
            pair.sw = response_sw(model, item.index);
            pair.status = match pair.sw {
                Some(sw) if sw_is_success(sw) => PairStatus::Success,
                Some(_) => PairStatus::Error,
                None => PairStatus::Success,
            };
            let fetch_ts = model.items[pair.fetch_index].timestamp;
            if let (Some(f), Some(r)) = (fetch_ts, item.timestamp) {
                pair.duration_ms = Some(r.signed_duration_since(f).num_milliseconds());
            }

            pairing.by_fetch.insert(pair.fetch_index, item.index);
            pairing.by_response.insert(item.index, pair.fetch_index);
        }
    }

    pairing
}
