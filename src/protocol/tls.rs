use chrono::NaiveDateTime;
use tls_parser::TlsCipherSuite;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

pub const CONTENT_CCS: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPDATA: u8 = 23;

/// One record of the TLS record layer within a direction buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRecord {
    pub content_type: u8,
    pub version: u16,
    /// Declared body length.
    pub length: usize,
    /// Offset of the body within the direction buffer.
    pub body_offset: usize,
    /// Declared length exceeds the remaining bytes.
    pub truncated: bool,
}

pub fn version_name(version: u16) -> &'static str {
    match version {
        0x0300 => "SSL 3.0",
        0x0301 => "TLS 1.0",
        0x0302 => "TLS 1.1",
        0x0303 => "TLS 1.2",
        0x0304 => "TLS 1.3",
        _ => "Unknown",
    }
}

/// IANA cipher suite name, falling back to the hex id.
pub fn cipher_name(id: u16) -> String {
    match TlsCipherSuite::from_id(id) {
        Some(cs) => cs.name.to_string(),
        None => format!("0x{id:04X}"),
    }
}

/// Quick check whether a buffer starts with a plausible TLS record header.
pub fn is_tls(buf: &[u8]) -> bool {
    buf.len() >= 5
        && (CONTENT_CCS..=CONTENT_APPDATA).contains(&buf[0])
        && buf[1] == 0x03
        && (0x00..=0x04).contains(&buf[2])
}

/// Walk the record layer. Stops after the first truncated record (which is
/// included, flagged) or at the first byte that is not a record header.
pub fn parse_records(buf: &[u8]) -> Vec<TlsRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 5 <= buf.len() {
        let content_type = buf[pos];
        let version = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]);
        if !(CONTENT_CCS..=CONTENT_APPDATA).contains(&content_type)
            || !(0x0300..=0x0304).contains(&version)
        {
            break;
        }
        let length = u16::from_be_bytes([buf[pos + 3], buf[pos + 4]]) as usize;
        let body_offset = pos + 5;
        let truncated = body_offset + length > buf.len();
        records.push(TlsRecord {
            content_type,
            version,
            length,
            body_offset,
            truncated,
        });
        if truncated {
            break;
        }
        pos = body_offset + length;
    }
    records
}

/// Decoded ClientHello with named extensions.
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    pub version: u16,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    /// Extension names in wire order.
    pub extensions: Vec<String>,
    pub sni: Option<String>,
    pub supported_groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub max_fragment_length: Option<u8>,
    pub alpn: Vec<String>,
}

impl ClientHello {
    pub fn version_name(&self) -> &'static str {
        version_name(self.version)
    }

    pub fn cipher_names(&self) -> Vec<String> {
        self.cipher_suites.iter().map(|&c| cipher_name(c)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerHello {
    pub version: u16,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher: u16,
    pub compression: u8,
    pub extensions: Vec<String>,
}

impl ServerHello {
    pub fn cipher_name(&self) -> String {
        cipher_name(self.cipher)
    }
}

/// Minimal X.509 decode of one chain entry. Signatures are not verified.
#[derive(Debug, Clone, Default)]
pub struct CertificateInfo {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_before: Option<NaiveDateTime>,
    pub not_after: Option<NaiveDateTime>,
    pub key_type: String,
    pub decoded: bool,
}

/// One message of the reconstructed TLS flow.
#[derive(Debug, Clone)]
pub enum TlsMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    Certificate(Vec<CertificateInfo>),
    ServerKeyExchange { length: usize },
    ServerHelloDone,
    ClientKeyExchange { length: usize },
    Finished,
    /// Handshake record seen after ChangeCipherSpec.
    EncryptedHandshake { length: usize },
    ChangeCipherSpec,
    Alert { level: u8, description: u8 },
    ApplicationData { length: usize },
    Handshake { msg_type: u8, length: usize },
}

impl TlsMessage {
    pub fn label(&self) -> String {
        match self {
            TlsMessage::ClientHello(ch) => match &ch.sni {
                Some(sni) => format!("ClientHello ({}, SNI {sni})", ch.version_name()),
                None => format!("ClientHello ({})", ch.version_name()),
            },
            TlsMessage::ServerHello(sh) => format!(
                "ServerHello ({}, {})",
                version_name(sh.version),
                sh.cipher_name()
            ),
            TlsMessage::Certificate(chain) => format!("Certificate ({} entries)", chain.len()),
            TlsMessage::ServerKeyExchange { .. } => "ServerKeyExchange".to_string(),
            TlsMessage::ServerHelloDone => "ServerHelloDone".to_string(),
            TlsMessage::ClientKeyExchange { .. } => "ClientKeyExchange".to_string(),
            TlsMessage::Finished => "Finished".to_string(),
            TlsMessage::EncryptedHandshake { .. } => "Encrypted Finished".to_string(),
            TlsMessage::ChangeCipherSpec => "ChangeCipherSpec".to_string(),
            TlsMessage::Alert { level, description } => format!(
                "Alert ({}, {})",
                alert_level_name(*level),
                alert_description_name(*description)
            ),
            TlsMessage::ApplicationData { length } => {
                format!("ApplicationData ({length} bytes)")
            }
            TlsMessage::Handshake { msg_type, .. } => format!("Handshake (type {msg_type})"),
        }
    }
}

/// Message plus the record it starts in.
#[derive(Debug, Clone)]
pub struct PositionedMessage {
    pub message: TlsMessage,
    pub record_index: usize,
}

/// Record walk and handshake reconstruction over one direction buffer.
#[derive(Debug, Clone, Default)]
pub struct StreamAnalysis {
    pub records: Vec<TlsRecord>,
    pub messages: Vec<PositionedMessage>,
    pub truncated: bool,
}

impl StreamAnalysis {
    pub fn client_hello(&self) -> Option<&ClientHello> {
        self.messages.iter().find_map(|m| match &m.message {
            TlsMessage::ClientHello(ch) => Some(ch),
            _ => None,
        })
    }

    pub fn server_hello(&self) -> Option<&ServerHello> {
        self.messages.iter().find_map(|m| match &m.message {
            TlsMessage::ServerHello(sh) => Some(sh),
            _ => None,
        })
    }

    pub fn certificates(&self) -> Option<&[CertificateInfo]> {
        self.messages.iter().find_map(|m| match &m.message {
            TlsMessage::Certificate(chain) => Some(chain.as_slice()),
            _ => None,
        })
    }
}

/// Analyze one direction buffer: records, then handshake messages. Handshake
/// payloads are concatenated until a non-handshake record (or end of buffer)
/// so messages spanning records still parse. After ChangeCipherSpec the
/// handshake is opaque.
pub fn analyze_stream(buf: &[u8]) -> StreamAnalysis {
    let records = parse_records(buf);
    let mut analysis = StreamAnalysis {
        truncated: records.last().is_some_and(|r| r.truncated),
        records,
        ..StreamAnalysis::default()
    };

    let mut ccs_seen = false;
    let mut hs_buf: Vec<u8> = Vec::new();
    // Start offset of each contributing record's payload within hs_buf.
    let mut hs_map: Vec<(usize, usize)> = Vec::new();

    for index in 0..analysis.records.len() {
        let record = analysis.records[index];
        if record.truncated {
            break;
        }
        let body = &buf[record.body_offset..record.body_offset + record.length];
        match record.content_type {
            CONTENT_HANDSHAKE if !ccs_seen => {
                hs_map.push((hs_buf.len(), index));
                hs_buf.extend_from_slice(body);
            }
            CONTENT_HANDSHAKE => analysis.messages.push(PositionedMessage {
                message: TlsMessage::EncryptedHandshake {
                    length: record.length,
                },
                record_index: index,
            }),
            CONTENT_CCS => {
                flush_handshake(&mut hs_buf, &mut hs_map, &mut analysis);
                analysis.messages.push(PositionedMessage {
                    message: TlsMessage::ChangeCipherSpec,
                    record_index: index,
                });
                ccs_seen = true;
            }
            CONTENT_ALERT => {
                flush_handshake(&mut hs_buf, &mut hs_map, &mut analysis);
                let message = if body.len() >= 2 {
                    TlsMessage::Alert {
                        level: body[0],
                        description: body[1],
                    }
                } else {
                    TlsMessage::Alert {
                        level: 0,
                        description: 0,
                    }
                };
                analysis.messages.push(PositionedMessage {
                    message,
                    record_index: index,
                });
            }
            _ => {
                flush_handshake(&mut hs_buf, &mut hs_map, &mut analysis);
                analysis.messages.push(PositionedMessage {
                    message: TlsMessage::ApplicationData {
                        length: record.length,
                    },
                    record_index: index,
                });
            }
        }
    }
    flush_handshake(&mut hs_buf, &mut hs_map, &mut analysis);
    analysis
}

/// First ClientHello in a buffer, for role detection.
pub fn find_client_hello(buf: &[u8]) -> Option<ClientHello> {
    analyze_stream(buf).client_hello().cloned()
}

fn record_for_offset(hs_map: &[(usize, usize)], offset: usize) -> usize {
    hs_map
        .iter()
        .rev()
        .find(|(start, _)| *start <= offset)
        .map(|(_, index)| *index)
        .unwrap_or(0)
}

fn flush_handshake(
    hs_buf: &mut Vec<u8>,
    hs_map: &mut Vec<(usize, usize)>,
    analysis: &mut StreamAnalysis,
) {
    let mut pos = 0;
    while pos + 4 <= hs_buf.len() {
        let msg_type = hs_buf[pos];
        let length =
            ((hs_buf[pos + 1] as usize) << 16) | ((hs_buf[pos + 2] as usize) << 8) | hs_buf[pos + 3] as usize;
        let body_start = pos + 4;
        if body_start + length > hs_buf.len() {
            analysis.truncated = true;
            break;
        }
        let body = &hs_buf[body_start..body_start + length];
        let message = match msg_type {
            1 => parse_client_hello(body)
                .map(TlsMessage::ClientHello)
                .unwrap_or(TlsMessage::Handshake { msg_type, length }),
            2 => parse_server_hello(body)
                .map(TlsMessage::ServerHello)
                .unwrap_or(TlsMessage::Handshake { msg_type, length }),
            11 => TlsMessage::Certificate(parse_certificate_chain(body)),
            12 => TlsMessage::ServerKeyExchange { length },
            14 => TlsMessage::ServerHelloDone,
            16 => TlsMessage::ClientKeyExchange { length },
            20 => TlsMessage::Finished,
            _ => TlsMessage::Handshake { msg_type, length },
        };
        analysis.messages.push(PositionedMessage {
            message,
            record_index: record_for_offset(hs_map, pos),
        });
        pos = body_start + length;
    }
    hs_buf.clear();
    hs_map.clear();
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let v = u16::from_be_bytes([*self.buf.get(self.pos)?, *self.buf.get(self.pos + 1)?]);
        self.pos += 2;
        Some(v)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(v)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn parse_client_hello(body: &[u8]) -> Option<ClientHello> {
    let mut c = Cursor::new(body);
    let mut hello = ClientHello {
        version: c.u16()?,
        random: c.take(32)?.to_vec(),
        ..ClientHello::default()
    };
    let sid_len = c.u8()? as usize;
    hello.session_id = c.take(sid_len)?.to_vec();

    let cs_len = c.u16()? as usize;
    let cs_bytes = c.take(cs_len)?;
    hello.cipher_suites = cs_bytes
        .chunks_exact(2)
        .map(|p| u16::from_be_bytes([p[0], p[1]]))
        .collect();

    let comp_len = c.u8()? as usize;
    hello.compression_methods = c.take(comp_len)?.to_vec();

    if c.remaining() >= 2 {
        let ext_len = c.u16()? as usize;
        let ext_bytes = c.take(ext_len.min(c.remaining()))?;
        parse_extensions(ext_bytes, &mut hello);
    }
    Some(hello)
}

fn parse_extensions(bytes: &[u8], hello: &mut ClientHello) {
    let mut c = Cursor::new(bytes);
    while c.remaining() >= 4 {
        let Some(ext_type) = c.u16() else { break };
        let Some(len) = c.u16() else { break };
        let Some(data) = c.take(len as usize) else { break };
        hello.extensions.push(extension_name(ext_type));
        match ext_type {
            0 => hello.sni = parse_sni(data),
            1 => hello.max_fragment_length = data.first().copied(),
            10 => {
                let mut e = Cursor::new(data);
                if let Some(list_len) = e.u16() {
                    if let Some(list) = e.take(list_len as usize) {
                        hello.supported_groups = list
                            .chunks_exact(2)
                            .map(|p| u16::from_be_bytes([p[0], p[1]]))
                            .collect();
                    }
                }
            }
            11 => {
                let mut e = Cursor::new(data);
                if let Some(n) = e.u8() {
                    if let Some(formats) = e.take(n as usize) {
                        hello.ec_point_formats = formats.to_vec();
                    }
                }
            }
            13 => {
                let mut e = Cursor::new(data);
                if let Some(list_len) = e.u16() {
                    if let Some(list) = e.take(list_len as usize) {
                        hello.signature_algorithms = list
                            .chunks_exact(2)
                            .map(|p| u16::from_be_bytes([p[0], p[1]]))
                            .collect();
                    }
                }
            }
            16 => hello.alpn = parse_alpn(data),
            _ => {}
        }
    }
}

fn extension_name(ext_type: u16) -> String {
    match ext_type {
        0 => "server_name".to_string(),
        1 => "max_fragment_length".to_string(),
        10 => "supported_groups".to_string(),
        11 => "ec_point_formats".to_string(),
        13 => "signature_algorithms".to_string(),
        16 => "application_layer_protocol_negotiation".to_string(),
        43 => "supported_versions".to_string(),
        51 => "key_share".to_string(),
        other => format!("extension_{other}"),
    }
}

/// First host_name entry of the SNI extension.
fn parse_sni(data: &[u8]) -> Option<String> {
    let mut c = Cursor::new(data);
    let list_len = c.u16()? as usize;
    let mut list = Cursor::new(c.take(list_len.min(c.remaining()))?);
    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let len = list.u16()? as usize;
        let name = list.take(len)?;
        if name_type == 0 {
            return Some(String::from_utf8_lossy(name).into_owned());
        }
    }
    None
}

fn parse_alpn(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let mut c = Cursor::new(data);
    let Some(list_len) = c.u16() else {
        return protocols;
    };
    let Some(list) = c.take((list_len as usize).min(c.remaining())) else {
        return protocols;
    };
    let mut l = Cursor::new(list);
    while l.remaining() > 0 {
        let Some(n) = l.u8() else { break };
        let Some(p) = l.take(n as usize) else { break };
        protocols.push(String::from_utf8_lossy(p).into_owned());
    }
    protocols
}

fn parse_server_hello(body: &[u8]) -> Option<ServerHello> {
    let mut c = Cursor::new(body);
    let mut hello = ServerHello {
        version: c.u16()?,
        random: c.take(32)?.to_vec(),
        ..ServerHello::default()
    };
    let sid_len = c.u8()? as usize;
    hello.session_id = c.take(sid_len)?.to_vec();
    hello.cipher = c.u16()?;
    hello.compression = c.u8()?;
    if c.remaining() >= 2 {
        if let Some(ext_len) = c.u16() {
            if let Some(ext_bytes) = c.take((ext_len as usize).min(c.remaining())) {
                let mut e = Cursor::new(ext_bytes);
                while e.remaining() >= 4 {
                    let Some(t) = e.u16() else { break };
                    let Some(n) = e.u16() else { break };
                    if e.take(n as usize).is_none() {
                        break;
                    }
                    hello.extensions.push(extension_name(t));
                }
            }
        }
    }
    Some(hello)
}

/// Certificate handshake body: 3-byte list length, then 3-byte-length
/// prefixed DER entries.
fn parse_certificate_chain(body: &[u8]) -> Vec<CertificateInfo> {
    let mut chain = Vec::new();
    if body.len() < 3 {
        return chain;
    }
    let list_len = ((body[0] as usize) << 16) | ((body[1] as usize) << 8) | body[2] as usize;
    let end = (3 + list_len).min(body.len());
    let mut pos = 3;
    while pos + 3 <= end {
        let cert_len = ((body[pos] as usize) << 16) | ((body[pos + 1] as usize) << 8)
            | body[pos + 2] as usize;
        pos += 3;
        if pos + cert_len > end {
            break;
        }
        chain.push(parse_certificate(&body[pos..pos + cert_len]));
        pos += cert_len;
    }
    chain
}

fn asn1_time_to_naive(secs: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

/// Minimal decode of one DER certificate. An undecodable entry is reported
/// as such rather than dropped.
fn parse_certificate(der: &[u8]) -> CertificateInfo {
    match parse_x509_certificate(der) {
        Ok((_, cert)) => {
            let subject_cn = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|a| a.as_str().ok())
                .map(str::to_string);
            let issuer_cn = cert
                .issuer()
                .iter_common_name()
                .next()
                .and_then(|a| a.as_str().ok())
                .map(str::to_string);
            let validity = cert.validity();
            CertificateInfo {
                subject_cn,
                issuer_cn,
                not_before: asn1_time_to_naive(validity.not_before.timestamp()),
                not_after: asn1_time_to_naive(validity.not_after.timestamp()),
                key_type: public_key_type(cert.public_key()),
                decoded: true,
            }
        }
        Err(_) => CertificateInfo {
            key_type: "Unknown".to_string(),
            decoded: false,
            ..CertificateInfo::default()
        },
    }
}

fn public_key_type(spki: &SubjectPublicKeyInfo<'_>) -> String {
    match spki.parsed() {
        Ok(PublicKey::RSA(_)) => "RSA".to_string(),
        Ok(PublicKey::EC(_)) => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|oid| oid.to_id_string());
            match curve.as_deref() {
                Some("1.2.840.10045.3.1.7") => "EC P-256".to_string(),
                Some("1.3.132.0.34") => "EC P-384".to_string(),
                Some("1.3.132.0.35") => "EC P-521".to_string(),
                _ => "EC".to_string(),
            }
        }
        _ => "Unknown".to_string(),
    }
}

pub fn alert_level_name(level: u8) -> &'static str {
    match level {
        1 => "warning",
        2 => "fatal",
        _ => "unknown",
    }
}

pub fn alert_description_name(description: u8) -> &'static str {
    match description {
        0 => "close_notify",
        10 => "unexpected_message",
        20 => "bad_record_mac",
        22 => "record_overflow",
        40 => "handshake_failure",
        42 => "bad_certificate",
        43 => "unsupported_certificate",
        44 => "certificate_revoked",
        45 => "certificate_expired",
        46 => "certificate_unknown",
        47 => "illegal_parameter",
        48 => "unknown_ca",
        49 => "access_denied",
        50 => "decode_error",
        51 => "decrypt_error",
        70 => "protocol_version",
        71 => "insufficient_security",
        80 => "internal_error",
        90 => "user_canceled",
        109 => "missing_extension",
        110 => "unsupported_extension",
        112 => "unrecognized_name",
        116 => "certificate_required",
        120 => "no_application_protocol",
        _ => "unknown_alert",
    }
}

/// Compliance warnings for one session's two directions. Returned as plain
/// messages; the validator attaches severity and location.
pub fn compliance_issues(
    outbound: &StreamAnalysis,
    inbound: &StreamAnalysis,
    session_time: Option<NaiveDateTime>,
    approved_ciphers: &[u16],
) -> Vec<String> {
    let mut issues = Vec::new();

    let server_hello = inbound.server_hello().or_else(|| outbound.server_hello());
    let negotiated = server_hello
        .map(|sh| sh.version)
        .or_else(|| outbound.client_hello().map(|ch| ch.version));
    if let Some(version) = negotiated {
        if version < 0x0303 {
            issues.push(format!(
                "negotiated {} is below TLS 1.2",
                version_name(version)
            ));
        }
    }

    if !approved_ciphers.is_empty() {
        if let Some(sh) = server_hello {
            if !approved_ciphers.contains(&sh.cipher) {
                issues.push(format!(
                    "chosen cipher {} is not in the approved list",
                    sh.cipher_name()
                ));
            }
        }
    }

    let chain = inbound.certificates().or_else(|| outbound.certificates());
    if let Some(chain) = chain {
        for cert in chain {
            if !cert.decoded {
                continue;
            }
            let cn = cert.subject_cn.as_deref().unwrap_or("<no CN>");
            if let (Some(session_time), Some(nb), Some(na)) =
                (session_time, cert.not_before, cert.not_after)
            {
                if session_time < nb || session_time > na {
                    issues.push(format!(
                        "certificate {cn} not valid at session time ({nb} .. {na})"
                    ));
                }
            }
        }
        if chain.len() == 1 {
            issues.push("single-certificate chain (possibly self-signed)".to_string());
        }
    }

    issues
}
