use crate::protocol::{parse_question, Question, HEADER_SIZE, QCLASS_IN, QTYPE_A, QTYPE_PTR};
use bytes::BufMut;
use std::net::Ipv4Addr;

const LOCAL_TTL: u32 = 655360;

/// Answer certain special names internally, without contacting an upstream.
///
/// - localhost gets an A record of 127.0.0.1
///
/// - 1.0.0.127.in-addr.arpa gets a PTR record of localhost
///
/// - dotted-decimal domain names get an A record, e.g. domain 192.48.96.2
///   gets A record 192.48.96.2
///
/// Returns `None` for everything else, which continues to the cache and
/// the upstream pool.
pub fn synthesize(query: &[u8]) -> Option<Vec<u8>> {
    let question = parse_question(query)?;
    if question.qclass != QCLASS_IN {
        return None;
    }

    if question.qtype == QTYPE_PTR {
        if question.domain == "1.0.0.127.in-addr.arpa" {
            return Some(answer(query, &question, &ptr_rdata("localhost")));
        }
    } else if question.qtype == QTYPE_A {
        if question.domain == "localhost" {
            return Some(answer(query, &question, &Ipv4Addr::LOCALHOST.octets()));
        }
        if let Ok(ip) = question.domain.parse::<Ipv4Addr>() {
            return Some(answer(query, &question, &ip.octets()));
        }
    }

    None
}

/// One-answer response: header, the echoed question section, and a single
/// record whose name is a compression pointer back to the question.
fn answer(query: &[u8], question: &Question, rdata: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(question.raw_end + 12 + rdata.len());

    // ID echoed from the query; flags are QR + AA + RA plus the client's
    // RD bit carried through.
    buf.put_slice(&query[0..2]);
    let rd = (u16::from(query[2]) << 8) & 0x0100;
    buf.put_u16(0x8000 | 0x0400 | rd | 0x0080);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(1); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(0); // ARCOUNT

    buf.put_slice(&query[HEADER_SIZE..question.raw_end]);

    // Pointer to the QNAME at offset 12.
    buf.put_slice(&[0xc0, 0x0c]);
    buf.put_u16(question.qtype);
    buf.put_u16(QCLASS_IN);
    buf.put_u32(LOCAL_TTL);
    buf.put_u16(rdata.len() as u16);
    buf.put_slice(rdata);

    buf
}

fn ptr_rdata(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf
}
