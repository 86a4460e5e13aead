//! DNS message parsing.
//!
//! Only the parts the router needs are decoded: the header, the question
//! section and the answer section. Authority and additional records are left
//! untouched in the raw bytes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

/// Upper bound on compression pointer hops while decoding one name.
const MAX_POINTER_HOPS: usize = 64;

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Lowercased name without the trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record from the answer section.
#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    /// The address carried by an A or AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        match (self.rtype, self.rdata.len()) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = self.rdata[..].try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = self.rdata[..].try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

/// A parsed DNS message (header, questions and answers).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    /// Offset of the first byte after the question section.
    question_end: usize,
}

impl Message {
    /// Parse a DNS message from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::MalformedDns("shorter than header"));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount.min(8));
        for _ in 0..qdcount {
            let (name, next) = read_name(data, pos)?;
            if next + 4 > data.len() {
                return Err(Error::MalformedDns("truncated question"));
            }
            questions.push(Question {
                name,
                qtype: u16::from_be_bytes([data[next], data[next + 1]]),
                qclass: u16::from_be_bytes([data[next + 2], data[next + 3]]),
            });
            pos = next + 4;
        }
        let question_end = pos;

        let mut answers = Vec::with_capacity(ancount.min(16));
        for _ in 0..ancount {
            let (name, next) = read_name(data, pos)?;
            if next + 10 > data.len() {
                return Err(Error::MalformedDns("truncated record header"));
            }
            let rtype = u16::from_be_bytes([data[next], data[next + 1]]);
            let class = u16::from_be_bytes([data[next + 2], data[next + 3]]);
            let ttl = u32::from_be_bytes([
                data[next + 4],
                data[next + 5],
                data[next + 6],
                data[next + 7],
            ]);
            let rdlength = u16::from_be_bytes([data[next + 8], data[next + 9]]) as usize;
            let start = next + 10;
            if start + rdlength > data.len() {
                return Err(Error::MalformedDns("truncated rdata"));
            }
            answers.push(Record {
                name,
                rtype,
                class,
                ttl,
                rdata: data[start..start + rdlength].to_vec(),
            });
            pos = start + rdlength;
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            question_end,
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// All A/AAAA addresses in the answer section.
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.answers.iter().filter_map(Record::address)
    }
}

/// Enumerate every question name in a DNS message.
pub fn question_names(data: &[u8]) -> Result<Vec<String>> {
    let message = Message::parse(data)?;
    if message.questions.is_empty() {
        return Err(Error::MalformedDns("no questions"));
    }
    Ok(message.questions.into_iter().map(|q| q.name).collect())
}

/// Shape a cached answer into a reply for `query`.
///
/// The reply carries the query's ID, RD bit and question bytes. Returns
/// `None` when the cached message is unusable for this query: unparsable,
/// not a response, without answers, or for a different question.
pub fn reply_from_cache(query: &[u8], cached: &[u8]) -> Option<Vec<u8>> {
    let query_msg = Message::parse(query).ok()?;
    let cached_msg = Message::parse(cached).ok()?;

    if !cached_msg.is_response() || cached_msg.answers.is_empty() {
        return None;
    }
    let (q, c) = (query_msg.first_question()?, cached_msg.first_question()?);
    if q.name != c.name || q.qtype != c.qtype {
        return None;
    }

    let mut reply = cached.to_vec();
    reply[0..2].copy_from_slice(&query_msg.id.to_be_bytes());

    let flags = (cached_msg.flags & !FLAG_RECURSION_DESIRED)
        | (query_msg.flags & FLAG_RECURSION_DESIRED);
    reply[2..4].copy_from_slice(&flags.to_be_bytes());

    // Same name and type, so only letter case can differ between the two
    // question sections; keep the querier's spelling when the layout matches.
    if query_msg.questions.len() == 1
        && cached_msg.questions.len() == 1
        && query_msg.question_end == cached_msg.question_end
    {
        reply[HEADER_LEN..query_msg.question_end]
            .copy_from_slice(&query[HEADER_LEN..query_msg.question_end]);
    }

    Some(reply)
}

/// Lowercase a domain name and strip its trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Decode a (possibly compressed) name starting at `pos`.
///
/// Returns the normalized name and the offset right after it in the
/// original byte stream.
fn read_name(data: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut resume_at = None;
    let mut hops = 0;

    loop {
        let Some(&len) = data.get(pos) else {
            return Err(Error::MalformedDns("truncated name"));
        };

        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let Some(&low) = data.get(pos + 1) else {
                    return Err(Error::MalformedDns("truncated pointer"));
                };
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(Error::MalformedDns("pointer loop"));
                }
                resume_at.get_or_insert(pos + 2);
                pos = (((l & 0x3F) as usize) << 8) | low as usize;
            }
            l if l & 0xC0 != 0 => return Err(Error::MalformedDns("reserved label type")),
            l => {
                let start = pos + 1;
                let end = start + l as usize;
                if end > data.len() {
                    return Err(Error::MalformedDns("truncated label"));
                }
                labels.push(String::from_utf8_lossy(&data[start..end]).to_ascii_lowercase());
                pos = end;
            }
        }
    }

    Ok((labels.join("."), resume_at.unwrap_or(pos)))
}
