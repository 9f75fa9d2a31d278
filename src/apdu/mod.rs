pub mod tlv;

use tlv::Tlv;

/// Parsed ISO 7816 APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    Command {
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        lc: Option<u8>,
        data: Vec<u8>,
        le: Option<u8>,
    },
    Response {
        data: Vec<u8>,
        sw1: u8,
        sw2: u8,
    },
}

impl Apdu {
    /// Status word of a response APDU.
    pub fn sw(&self) -> Option<u16> {
        match self {
            Apdu::Response { sw1, sw2, .. } => Some(u16::from_be_bytes([*sw1, *sw2])),
            Apdu::Command { .. } => None,
        }
    }

    /// Body bytes carrying TLVs: command data field, or response data
    /// (everything before SW1 SW2).
    pub fn body(&self) -> &[u8] {
        match self {
            Apdu::Command { data, .. } => data,
            Apdu::Response { data, .. } => data,
        }
    }

    pub fn ins(&self) -> Option<u8> {
        match self {
            Apdu::Command { ins, .. } => Some(*ins),
            Apdu::Response { .. } => None,
        }
    }
}

/// ISO 7816-4 instruction names used by the trace producer.
pub fn ins_name(ins: u8) -> Option<&'static str> {
    Some(match ins {
        0x10 => "TERMINAL PROFILE",
        0x12 => "FETCH",
        0x14 => "TERMINAL RESPONSE",
        0x70 => "MANAGE CHANNEL",
        0xA4 => "SELECT",
        0xB0 => "READ BINARY",
        0xC0 => "GET RESPONSE",
        0xC2 => "ENVELOPE",
        _ => return None,
    })
}

pub const INS_FETCH: u8 = 0x12;
pub const INS_TERMINAL_RESPONSE: u8 = 0x14;
pub const INS_SELECT: u8 = 0xA4;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_ENVELOPE: u8 = 0xC2;

/// SIM Toolkit command type byte from the Command Details TLV.
pub fn stk_command_name(cmd: u8) -> Option<&'static str> {
    Some(match cmd {
        0x01 => "REFRESH",
        0x02 => "MORE TIME",
        0x03 => "POLL INTERVAL",
        0x04 => "POLLING OFF",
        0x05 => "SET UP EVENT LIST",
        0x10 => "SET UP CALL",
        0x13 => "SEND SMS",
        0x20 => "DISPLAY TEXT",
        0x21 => "GET INKEY",
        0x22 => "GET INPUT",
        0x23 => "SELECT ITEM",
        0x24 => "SET UP MENU",
        0x25 => "PROVIDE LOCAL INFO",
        0x26 => "TIMER MANAGEMENT",
        0x27 => "SET UP IDLE MODE TEXT",
        0x40 => "OPEN CHANNEL",
        0x41 => "CLOSE CHANNEL",
        0x42 => "RECEIVE DATA",
        0x43 => "SEND DATA",
        0x44 => "GET CHANNEL STATUS",
        _ => return None,
    })
}

pub const STK_REFRESH: u8 = 0x01;
pub const STK_OPEN_CHANNEL: u8 = 0x40;
pub const STK_CLOSE_CHANNEL: u8 = 0x41;
pub const STK_RECEIVE_DATA: u8 = 0x42;
pub const STK_SEND_DATA: u8 = 0x43;

/// Decoded Command Details TLV (tag 0x01 / 0x81).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDetails {
    pub number: u8,
    pub command: u8,
    pub qualifier: u8,
}

impl CommandDetails {
    /// Channel id encoded in the qualifier for channel-management commands.
    pub fn channel_id(&self) -> Option<u8> {
        match self.command {
            STK_CLOSE_CHANNEL | STK_RECEIVE_DATA | STK_SEND_DATA => {
                let ch = self.qualifier & 0x07;
                (ch != 0).then_some(ch)
            }
            _ => None,
        }
    }
}

/// Locate the Command Details TLV at the top level or inside a proactive
/// command wrapper (tag 0xD0).
pub fn command_details(tlvs: &[Tlv], raw: &[u8]) -> Option<CommandDetails> {
    let node = tlvs
        .iter()
        .find_map(|t| t.find(&|n: &Tlv| n.short_tag() == 0x01 && n.length >= 3))?;
    let value = node.value(raw);
    Some(CommandDetails {
        number: value[0],
        command: value[1],
        qualifier: value[2],
    })
}

/// Parse raw bytes as a command or response APDU depending on the trace item
/// type. Returns `None` when the bytes cannot form the requested shape; the
/// item is still usable, only without structural decoding.
pub fn parse(item_type: &str, raw: &[u8]) -> Option<Apdu> {
    let lower = item_type.to_ascii_lowercase();
    if lower.contains("command") || lower == "fetch" || lower == "envelope" {
        parse_command(raw)
    } else if lower.contains("response") {
        parse_response(raw)
    } else {
        None
    }
}

fn parse_command(raw: &[u8]) -> Option<Apdu> {
    if raw.len() < 4 {
        return None;
    }
    let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
    let rest = &raw[4..];
    let (lc, data, le) = match rest {
        [] => (None, Vec::new(), None),
        // Case 2: Le only
        [le] => (None, Vec::new(), Some(*le)),
        _ => {
            let lc = rest[0] as usize;
            let body = &rest[1..];
            if body.len() == lc {
                // Case 3: Lc + data
                (Some(rest[0]), body.to_vec(), None)
            } else if body.len() == lc + 1 {
                // Case 4: Lc + data + Le
                (Some(rest[0]), body[..lc].to_vec(), Some(body[lc]))
            } else {
                return None;
            }
        }
    };
    Some(Apdu::Command {
        cla,
        ins,
        p1,
        p2,
        lc,
        data,
        le,
    })
}

fn parse_response(raw: &[u8]) -> Option<Apdu> {
    if raw.len() < 2 {
        return None;
    }
    let (data, sw) = raw.split_at(raw.len() - 2);
    Some(Apdu::Response {
        data: data.to_vec(),
        sw1: sw[0],
        sw2: sw[1],
    })
}
