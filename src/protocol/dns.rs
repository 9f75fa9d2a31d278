use simple_dns::{rdata::RData, Packet, PacketFlag, OPCODE, QTYPE, RCODE};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Decoded DNS message.
#[derive(Debug, Clone)]
pub struct DnsInfo {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub rcode: u8,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: String,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: String,
    pub ttl: u32,
    pub rdata: String,
}

/// Soft failure: the buffer is reported undecodable with a reason instead of
/// aborting the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unable to decode DNS message: {reason}")]
pub struct DnsError {
    pub reason: String,
}

pub fn parse_dns(data: &[u8]) -> Result<DnsInfo, DnsError> {
    let packet = Packet::parse(data).map_err(|e| DnsError {
        reason: e.to_string(),
    })?;

    let questions = packet
        .questions
        .iter()
        .map(|q| DnsQuestion {
            name: q.qname.to_string(),
            qtype: qtype_str(&q.qtype),
        })
        .collect();

    let answers = packet.answers.iter().map(convert_record).collect();
    let authorities = packet.name_servers.iter().map(convert_record).collect();
    let additionals = packet
        .additional_records
        .iter()
        .map(convert_record)
        .collect();

    Ok(DnsInfo {
        id: packet.id(),
        is_response: packet.has_flags(PacketFlag::RESPONSE),
        opcode: opcode_to_u8(packet.opcode()),
        rcode: rcode_to_u8(packet.rcode()),
        questions,
        answers,
        authorities,
        additionals,
    })
}

fn convert_record(rr: &simple_dns::ResourceRecord) -> DnsRecord {
    DnsRecord {
        name: rr.name.to_string(),
        rtype: rdata_type_str(&rr.rdata),
        ttl: rr.ttl,
        rdata: rdata_to_string(&rr.rdata),
    }
}

fn rdata_type_str(rdata: &RData) -> String {
    match rdata {
        RData::A(_) => "A".into(),
        RData::AAAA(_) => "AAAA".into(),
        RData::CNAME(_) => "CNAME".into(),
        RData::MX(_) => "MX".into(),
        RData::NS(_) => "NS".into(),
        RData::PTR(_) => "PTR".into(),
        RData::SOA(_) => "SOA".into(),
        RData::SRV(_) => "SRV".into(),
        RData::TXT(_) => "TXT".into(),
        _ => format!("{rdata:?}"),
    }
}

fn rdata_to_string(rdata: &RData) -> String {
    match rdata {
        RData::A(a) => Ipv4Addr::from(a.address).to_string(),
        RData::AAAA(aaaa) => Ipv6Addr::from(aaaa.address).to_string(),
        RData::CNAME(cname) => cname.0.to_string(),
        RData::MX(mx) => format!("{} {}", mx.preference, mx.exchange),
        RData::NS(ns) => ns.0.to_string(),
        RData::PTR(ptr) => ptr.0.to_string(),
        RData::SOA(soa) => format!("{} {} {}", soa.mname, soa.rname, soa.serial),
        RData::SRV(srv) => format!(
            "{}:{} p={} w={}",
            srv.target, srv.port, srv.priority, srv.weight
        ),
        RData::TXT(txt) => txt
            .attributes()
            .into_iter()
            .map(|(k, v)| match v {
                Some(val) => format!("{k}={val}"),
                None => k,
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => format!("{rdata:?}"),
    }
}

fn qtype_str(qtype: &QTYPE) -> String {
    match qtype {
        QTYPE::TYPE(t) => format!("{t:?}"),
        QTYPE::ANY => "ANY".into(),
        QTYPE::AXFR => "AXFR".into(),
        QTYPE::IXFR => "IXFR".into(),
        QTYPE::MAILB => "MAILB".into(),
        QTYPE::MAILA => "MAILA".into(),
    }
}

fn opcode_to_u8(opcode: OPCODE) -> u8 {
    match opcode {
        OPCODE::StandardQuery => 0,
        OPCODE::InverseQuery => 1,
        OPCODE::ServerStatusRequest => 2,
        OPCODE::Notify => 4,
        OPCODE::Update => 5,
        _ => 255,
    }
}

fn rcode_to_u8(rcode: RCODE) -> u8 {
    match rcode {
        RCODE::NoError => 0,
        RCODE::FormatError => 1,
        RCODE::ServerFailure => 2,
        RCODE::NameError => 3,
        RCODE::NotImplemented => 4,
        RCODE::Refused => 5,
        _ => 255,
    }
}

pub fn rcode_str(code: u8) -> &'static str {
    match code {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "OTHER",
    }
}

impl DnsInfo {
    /// Compact display: questions, records, rcode.
    pub fn display_string(&self) -> String {
        let mut out = String::new();
        for q in &self.questions {
            out.push_str(&q.name);
            out.push(' ');
            out.push_str(&q.qtype);
            out.push(' ');
        }
        for r in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            out.push_str(&r.name);
            out.push(' ');
            out.push_str(&r.rtype);
            out.push(' ');
            out.push_str(&r.rdata);
            out.push(' ');
        }
        out.push_str(rcode_str(self.rcode));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_dns::{rdata, Name, Question, ResourceRecord, CLASS, QCLASS, QTYPE, TYPE};

    fn build_query(id: u16, name: &str, qtype: TYPE) -> Vec<u8> {
        let mut pkt = Packet::new_query(id);
        pkt.questions.push(Question::new(
            Name::new(name).unwrap(),
            QTYPE::TYPE(qtype),
            QCLASS::CLASS(CLASS::IN),
            false,
        ));
        pkt.build_bytes_vec().unwrap()
    }

    fn build_response(id: u16, name: &str, qtype: TYPE, answers: Vec<RData>) -> Vec<u8> {
        let mut pkt = Packet::new_reply(id);
        pkt.questions.push(Question::new(
            Name::new(name).unwrap(),
            QTYPE::TYPE(qtype),
            QCLASS::CLASS(CLASS::IN),
            false,
        ));
        for rdata in answers {
            pkt.answers.push(ResourceRecord::new(
                Name::new(name).unwrap(),
                CLASS::IN,
                3600,
                rdata,
            ));
        }
        pkt.build_bytes_vec().unwrap()
    }

    #[test]
    fn parse_a_query() {
        let wire = build_query(0x1234, "smdp.example.com", TYPE::A);
        let info = parse_dns(&wire).unwrap();
        assert!(!info.is_response);
        assert_eq!(info.id, 0x1234);
        assert_eq!(info.questions.len(), 1);
        assert_eq!(info.questions[0].name, "smdp.example.com");
        assert_eq!(info.questions[0].qtype, "A");
        assert!(info.answers.is_empty());
    }

    #[test]
    fn parse_a_response() {
        let wire = build_response(
            0xABCD,
            "smdp.example.com",
            TYPE::A,
            vec![RData::A(rdata::A {
                address: u32::from(std::net::Ipv4Addr::new(10, 20, 30, 40)),
            })],
        );
        let info = parse_dns(&wire).unwrap();
        assert!(info.is_response);
        assert_eq!(info.answers.len(), 1);
        assert_eq!(info.answers[0].rtype, "A");
        assert_eq!(info.answers[0].rdata, "10.20.30.40");
        assert_eq!(info.answers[0].ttl, 3600);
    }

    #[test]
    fn section_counts_match_parsed_sections() {
        let wire = build_response(
            7,
            "example.com",
            TYPE::A,
            vec![
                RData::A(rdata::A { address: 1 }),
                RData::A(rdata::A { address: 2 }),
            ],
        );
        // Header counts live at bytes 4..12.
        let qd = u16::from_be_bytes([wire[4], wire[5]]) as usize;
        let an = u16::from_be_bytes([wire[6], wire[7]]) as usize;
        let ns = u16::from_be_bytes([wire[8], wire[9]]) as usize;
        let ar = u16::from_be_bytes([wire[10], wire[11]]) as usize;
        let info = parse_dns(&wire).unwrap();
        assert_eq!(info.questions.len(), qd);
        assert_eq!(info.answers.len(), an);
        assert_eq!(info.authorities.len(), ns);
        assert_eq!(info.additionals.len(), ar);
    }

    #[test]
    fn parse_mx_and_srv_rdata() {
        let wire = build_response(
            2,
            "example.com",
            TYPE::MX,
            vec![RData::MX(rdata::MX {
                preference: 10,
                exchange: Name::new("mail.example.com").unwrap(),
            })],
        );
        let info = parse_dns(&wire).unwrap();
        assert_eq!(info.answers[0].rdata, "10 mail.example.com");

        let wire = build_response(
            3,
            "_http._tcp.example.com",
            TYPE::SRV,
            vec![RData::SRV(rdata::SRV {
                priority: 1,
                weight: 5,
                port: 8080,
                target: Name::new("svc.example.com").unwrap(),
            })],
        );
        let info = parse_dns(&wire).unwrap();
        assert_eq!(info.answers[0].rdata, "svc.example.com:8080 p=1 w=5");
    }

    #[test]
    fn compressed_names_resolve() {
        // build_response repeats the owner name; simple-dns compresses it,
        // and the parser must expand the pointer back.
        let wire = build_response(
            9,
            "www.example.com",
            TYPE::CNAME,
            vec![RData::CNAME(rdata::CNAME(
                Name::new("www.example.com").unwrap(),
            ))],
        );
        let info = parse_dns(&wire).unwrap();
        assert_eq!(info.answers[0].name, "www.example.com");
        assert_eq!(info.answers[0].rdata, "www.example.com");
    }

    #[test]
    fn nxdomain_rcode() {
        let mut pkt = Packet::new_reply(5);
        *pkt.rcode_mut() = RCODE::NameError;
        pkt.questions.push(Question::new(
            Name::new("missing.example.com").unwrap(),
            QTYPE::TYPE(TYPE::A),
            QCLASS::CLASS(CLASS::IN),
            false,
        ));
        let wire = pkt.build_bytes_vec().unwrap();
        let info = parse_dns(&wire).unwrap();
        assert_eq!(info.rcode, 3);
        assert!(info.display_string().contains("NXDOMAIN"));
    }

    #[test]
    fn malformed_message_fails_softly() {
        assert!(parse_dns(&[]).is_err());
        assert!(parse_dns(&[0xFF; 5]).is_err());
        let err = parse_dns(b"notdns").unwrap_err();
        assert!(!err.reason.is_empty());
    }
}
