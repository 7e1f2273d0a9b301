use byteorder::{NetworkEndian, ReadBytesExt};
use rand::prelude::*;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_PACKET_SIZE: usize = 512;

/// Size of the fixed message header; the question section starts here.
/// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
pub const HEADER_SIZE: usize = 12;

pub type ID = u16;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_PTR: u16 = 12;
pub const QCLASS_IN: u16 = 1;

/// Read the 16-bit transaction ID at octet offset 0.
pub fn read_id(buf: &[u8]) -> Option<ID> {
    Cursor::new(buf).read_u16::<NetworkEndian>().ok()
}

/// Overwrite the 16-bit transaction ID at octet offset 0 in place.
///
/// Everything else in the message is left untouched; this is the only
/// rewrite performed on forwarded or cached bytes.
pub fn write_id(buf: &mut [u8], id: ID) {
    if buf.len() >= 2 {
        buf[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// The question carried by a query, read from the wire without touching
/// anything past the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// QNAME, ASCII-lowercased. All comparisons of domain names must be
    /// case-insensitive, so the name is normalized on parse.
    /// https://datatracker.ietf.org/doc/html/rfc1035#section-2.3.3
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Byte offset one past QCLASS, i.e. where the question section ends.
    pub raw_end: usize,
}

/// Extract the queried name from a query datagram.
///
/// Labels start at octet 12: one length octet followed by that many name
/// octets, terminated by a zero length. Returns `None` rather than reading
/// past the buffer on truncated or malformed input.
pub fn extract_qname(buf: &[u8]) -> Option<String> {
    walk_qname(buf).map(|(domain, _)| domain)
}

/// Parse the first question of a query. Queries carry uncompressed names,
/// so a length octet with the upper two bits set is rejected.
pub fn parse_question(buf: &[u8]) -> Option<Question> {
    let (domain, mut pos) = walk_qname(buf)?;

    if pos + 4 > buf.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let qclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
    pos += 4;

    Some(Question {
        domain,
        qtype,
        qclass,
        raw_end: pos,
    })
}

fn walk_qname(buf: &[u8]) -> Option<(String, usize)> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let mut labels = Vec::new();
    let mut pos = HEADER_SIZE;

    loop {
        let len = *buf.get(pos)? as usize;
        pos += 1;

        if len == 0 {
            return Some((labels.join("."), pos));
        }

        // Labels are restricted to 63 octets; the 01 and 10 tags are
        // reserved and 11 marks a compression pointer, which queries
        // do not carry.
        if len > 63 || pos + len > buf.len() {
            return None;
        }

        let label: String = buf[pos..pos + len]
            .iter()
            .map(|&b| b.to_ascii_lowercase() as char)
            .collect();
        labels.push(label);
        pos += len;
    }
}

static FINGERPRINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produce a short opaque handle for a pending request: the first eight
/// bytes of a SHA-256 over the request coordinates plus enough entropy
/// (time, a process-wide counter, random salt) that concurrent requests
/// for the same question still get distinct handles.
pub fn fingerprint(client: &SocketAddr, client_query_id: ID, domain: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = FINGERPRINT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let salt: [u8; 8] = rand::thread_rng().gen();

    let mut hasher = Sha256::new();
    hasher.update(client.ip().to_string().as_bytes());
    hasher.update(client.port().to_be_bytes());
    hasher.update(client_query_id.to_be_bytes());
    hasher.update(domain.as_bytes());
    hasher.update(now.as_nanos().to_be_bytes());
    hasher.update(counter.to_be_bytes());
    hasher.update(salt);

    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    // Captured query from running `dig +noedns example.com`
    const QUERY: [u8; 29] = [
        0xcd, 0xf0, // ID
        0x01, 0x20, // flags = rd ad
        0x00, 0x01, // qdcount
        0x00, 0x00, // ancount
        0x00, 0x00, // nscount
        0x00, 0x00, // arcount
        0x07, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, // example
        0x03, 0x63, 0x6f, 0x6d, // com
        0x00, // root label
        0x00, 0x01, // QTYPE A
        0x00, 0x01, // QCLASS IN
    ];

    #[test]
    fn read_id_from_query() {
        assert_eq!(read_id(&QUERY), Some(0xcdf0));
    }

    #[test]
    fn read_id_runt_buffer() {
        assert_eq!(read_id(&[]), None);
        assert_eq!(read_id(&[0xcd]), None);
    }

    #[test]
    fn rewrite_id_twice_is_identity() {
        let mut buf = QUERY.to_vec();
        write_id(&mut buf, 0x1234);
        assert_eq!(read_id(&buf), Some(0x1234));
        write_id(&mut buf, 0xcdf0);
        assert_eq!(buf, QUERY.to_vec());
    }

    #[test]
    fn write_id_runt_buffer_is_noop() {
        let mut buf = vec![0xab];
        write_id(&mut buf, 0x1234);
        assert_eq!(buf, vec![0xab]);
    }

    #[test]
    fn extract_qname_example_com() {
        assert_eq!(extract_qname(&QUERY), Some("example.com".to_string()));
    }

    #[test]
    fn extract_qname_lowercases() {
        let mut buf = QUERY.to_vec();
        // "example" -> "eXaMPle", "com" -> "COM"
        buf[13] = b'e';
        buf[14] = b'X';
        buf[15] = b'a';
        buf[16] = b'M';
        buf[17] = b'P';
        buf[21] = b'C';
        buf[22] = b'O';
        buf[23] = b'M';
        assert_eq!(extract_qname(&buf), Some("example.com".to_string()));
    }

    #[test]
    fn extract_qname_truncated_before_root_label() {
        // Cut the buffer in the middle of the "com" label; the walk must
        // stop at the end of the buffer instead of reading past it.
        assert_eq!(extract_qname(&QUERY[..22]), None);
        // Cut right before the root label.
        assert_eq!(extract_qname(&QUERY[..24]), None);
    }

    #[test]
    fn extract_qname_header_only() {
        assert_eq!(extract_qname(&QUERY[..12]), None);
        assert_eq!(extract_qname(&[]), None);
    }

    #[test]
    fn extract_qname_rejects_compression_tag() {
        let mut buf = QUERY.to_vec();
        buf[12] = 0xc0;
        assert_eq!(extract_qname(&buf), None);
    }

    #[test]
    fn parse_question_example_com() {
        let question = parse_question(&QUERY).unwrap();
        assert_eq!(
            question,
            Question {
                domain: "example.com".to_string(),
                qtype: QTYPE_A,
                qclass: QCLASS_IN,
                raw_end: 29,
            }
        );
    }

    #[test]
    fn parse_question_truncated_after_name() {
        assert_eq!(parse_question(&QUERY[..27]), None);
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let client: SocketAddr = "127.0.0.1:44444".parse().unwrap();
        let fp = fingerprint(&client, 0x1234, "example.com");
        assert_eq!(fp.len(), 16);
        assert!(fp
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprints_for_identical_requests_differ() {
        let client: SocketAddr = "127.0.0.1:44444".parse().unwrap();
        let a = fingerprint(&client, 0x1234, "example.com");
        let b = fingerprint(&client, 0x1234, "example.com");
        assert_ne!(a, b);
    }
}
