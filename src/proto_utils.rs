//! Raw DNS packet helpers.
//!
//! Everything here works on the wire bytes directly, without building a
//! hickory `Message`: the cache keys on raw query bytes and only needs a
//! handful of header fields and TTLs from answers.

use thiserror::Error;

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

/// Query types whose answers may be cached.
const CACHEABLE_TYPES: [u16; 5] = [TYPE_A, TYPE_PTR, TYPE_MX, TYPE_AAAA, TYPE_ANY];

// 32-bit FNV parameters
const FNV_MULT: u32 = 16_777_619;
const FNV_BASIS: u32 = 2_166_136_261;

const MAX_LABEL_LEN: u8 = 63;
const POINTER_MASK: u8 = 0xC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet overrun at offset {0}")]
    Overrun(usize),
    #[error("malformed name at offset {0}")]
    MalformedName(usize),
    #[error("unsupported query: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, PacketError>;

/// Bounds-checked reader over an immutable packet.
///
/// Every read either succeeds completely or returns [`PacketError::Overrun`]
/// without moving the cursor.
#[derive(Debug, Clone)]
pub struct PacketCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(PacketError::Overrun(self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads an uncompressed name (question section) and returns its raw
    /// encoding, terminating zero included.
    pub fn read_label_sequence(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        loop {
            let at = self.pos;
            let len = match self.read_u8() {
                Ok(len) => len,
                Err(err) => {
                    self.pos = start;
                    return Err(err);
                }
            };
            if len == 0 {
                return Ok(&self.buf[start..self.pos]);
            }
            // compression is not expected in questions
            if len > MAX_LABEL_LEN {
                self.pos = start;
                return Err(PacketError::MalformedName(at));
            }
            if let Err(err) = self.skip(len as usize) {
                self.pos = start;
                return Err(err);
            }
        }
    }

    /// Skips a possibly compressed name (answer/authority sections).
    pub fn skip_name(&mut self) -> Result<()> {
        let start = self.pos;
        let res = (|| loop {
            let at = self.pos;
            let len = self.read_u8()?;
            if len == 0 {
                return Ok(());
            }
            if len & POINTER_MASK == POINTER_MASK {
                return self.skip(1);
            }
            if len > MAX_LABEL_LEN {
                return Err(PacketError::MalformedName(at));
            }
            self.skip(len as usize)?;
        })();
        if res.is_err() {
            self.pos = start;
        }
        res
    }
}

#[inline]
fn fnv(hash: u32, byte: u8) -> u32 {
    hash.wrapping_mul(FNV_MULT) ^ byte as u32
}

fn header_counts(packet: &[u8]) -> Result<(u16, u16, u16, u16)> {
    let mut cur = PacketCursor::new(packet);
    cur.skip(4)?;
    Ok((cur.read_u16()?, cur.read_u16()?, cur.read_u16()?, cur.read_u16()?))
}

/// Checks that `packet` is a query shape whose answer may be cached.
///
/// TC, RD, AD and CD are not checked here: RD/AD/CD take part in hashing and
/// comparison, TC is ignored everywhere.
pub fn validate_query(packet: &[u8]) -> Result<()> {
    if packet.len() < HEADER_LEN {
        return Err(PacketError::Unsupported("query packet too small"));
    }
    // QR, opcode and AA must be zero; RA, Z and RCODE too
    if packet[2] & 0xFC != 0 || packet[3] & 0xCF != 0 {
        return Err(PacketError::Unsupported("query packet flags"));
    }
    let (qd_count, an_count, ns_count, ar_count) = header_counts(packet)?;
    if an_count != 0 || ns_count != 0 || ar_count > 1 {
        return Err(PacketError::Unsupported("query packet contains non-query records"));
    }
    if qd_count == 0 {
        return Err(PacketError::Unsupported("query packet has no question"));
    }

    let mut cur = PacketCursor::new(packet);
    cur.skip(HEADER_LEN)?;
    for _ in 0..qd_count {
        cur.read_label_sequence()?;
        let qtype = cur.read_u16()?;
        if !CACHEABLE_TYPES.contains(&qtype) {
            return Err(PacketError::Unsupported("unsupported TYPE"));
        }
        if cur.read_u16()? != CLASS_IN {
            return Err(PacketError::Unsupported("unsupported CLASS"));
        }
    }
    for _ in 0..ar_count {
        // NAME, TYPE, CLASS, TTL, RDLENGTH, RDATA
        cur.read_label_sequence()?;
        cur.skip(8)?;
        let rd_len = cur.read_u16()? as usize;
        cur.skip(rd_len)?;
    }
    Ok(())
}

fn hash_label_bytes(mut hash: u32, name: &[u8]) -> u32 {
    let mut i = 0;
    while i < name.len() {
        let len = name[i] as usize;
        if len == 0 {
            break;
        }
        let end = (i + 1 + len).min(name.len());
        for &b in &name[i + 1..end] {
            hash = fnv(hash, b);
        }
        i = end;
    }
    hash
}

fn hash_sections(packet: &[u8], hash: &mut u32) -> Result<()> {
    let mut cur = PacketCursor::new(packet);
    // transaction id is not part of the key
    cur.skip(2)?;
    let flags_hi = cur.read_u8()?;
    let flags_lo = cur.read_u8()?;
    // RD only; TC is ignored
    *hash = fnv(*hash, flags_hi & 1);
    *hash = fnv(*hash, flags_lo);

    let qd_count = cur.read_u16()?;
    cur.skip(4)?;
    let ar_count = cur.read_u16()?;

    for _ in 0..qd_count {
        *hash = hash_label_bytes(*hash, cur.read_label_sequence()?);
        for &b in cur.read_bytes(4)? {
            *hash = fnv(*hash, b);
        }
    }
    for _ in 0..ar_count {
        *hash = hash_label_bytes(*hash, cur.read_label_sequence()?);
        // TYPE, CLASS, TTL
        for &b in cur.read_bytes(8)? {
            *hash = fnv(*hash, b);
        }
        let rd_len = cur.read_u16()? as usize;
        for &b in cur.read_bytes(rd_len)? {
            *hash = fnv(*hash, b);
        }
    }
    Ok(())
}

/// Rolling FNV hash over the parts of a query that identify its answer.
///
/// Meant for packets that passed [`validate_query`]; on a short packet the
/// hash of the prefix read so far is returned.
pub fn hash_query(packet: &[u8]) -> u32 {
    let mut hash = FNV_BASIS;
    let _ = hash_sections(packet, &mut hash);
    hash
}

fn compare_queries(a: &[u8], b: &[u8]) -> Result<bool> {
    let mut ca = PacketCursor::new(a);
    let mut cb = PacketCursor::new(b);
    ca.skip(2)?;
    cb.skip(2)?;

    if ca.read_u8()? & 1 != cb.read_u8()? & 1 {
        return Ok(false);
    }
    // AD / CD and the rest of the second flag byte
    if ca.read_u8()? != cb.read_u8()? {
        return Ok(false);
    }
    let qd_count = ca.read_u16()?;
    if qd_count != cb.read_u16()? {
        return Ok(false);
    }
    ca.skip(4)?;
    cb.skip(4)?;
    let ar_count = ca.read_u16()?;
    if ar_count != cb.read_u16()? {
        return Ok(false);
    }

    for _ in 0..qd_count {
        if ca.read_label_sequence()? != cb.read_label_sequence()? {
            return Ok(false);
        }
        if ca.read_bytes(4)? != cb.read_bytes(4)? {
            return Ok(false);
        }
    }
    for _ in 0..ar_count {
        if ca.read_label_sequence()? != cb.read_label_sequence()? {
            return Ok(false);
        }
        if ca.read_bytes(8)? != cb.read_bytes(8)? {
            return Ok(false);
        }
        let rd_len = ca.read_u16()?;
        if rd_len != cb.read_u16()? {
            return Ok(false);
        }
        if ca.read_bytes(rd_len as usize)? != cb.read_bytes(rd_len as usize)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Structural query equality ignoring the transaction id and TC bit.
///
/// Names are compared byte for byte: `Example.com` and `example.com` are
/// different keys.
pub fn queries_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    compare_queries(a, b).unwrap_or(false)
}

struct RecordView<'a> {
    rtype: u16,
    ttl: u32,
    rdata: &'a [u8],
}

fn read_record<'a>(cur: &mut PacketCursor<'a>) -> Result<RecordView<'a>> {
    cur.skip_name()?;
    let rtype = cur.read_u16()?;
    cur.skip(2)?;
    let ttl = cur.read_u32()?;
    let rd_len = cur.read_u16()? as usize;
    let rdata = cur.read_bytes(rd_len)?;
    Ok(RecordView { rtype, ttl, rdata })
}

/// MINIMUM field of SOA rdata: MNAME, RNAME, then five 32-bit fields.
fn soa_minimum(rdata: &[u8]) -> Option<u32> {
    let mut cur = PacketCursor::new(rdata);
    cur.skip_name().ok()?;
    cur.skip_name().ok()?;
    if cur.remaining() != 20 {
        return None;
    }
    cur.skip(16).ok()?;
    cur.read_u32().ok()
}

fn answer_ttl(answer: &[u8]) -> Result<u32> {
    let (qd_count, an_count, ns_count, _) = header_counts(answer)?;
    let mut cur = PacketCursor::new(answer);
    cur.skip(HEADER_LEN)?;
    for _ in 0..qd_count {
        cur.skip_name()?;
        cur.skip(4)?;
    }

    if an_count > 0 {
        let mut min_ttl = u32::MAX;
        for _ in 0..an_count {
            min_ttl = min_ttl.min(read_record(&mut cur)?.ttl);
        }
        return Ok(min_ttl);
    }

    // negative answer: min(SOA TTL, SOA MINIMUM), RFC 2308
    let mut negative: Option<u32> = None;
    for _ in 0..ns_count {
        let rr = read_record(&mut cur)?;
        if rr.rtype != TYPE_SOA {
            continue;
        }
        if let Some(minimum) = soa_minimum(rr.rdata) {
            let ttl = rr.ttl.min(minimum);
            negative = Some(negative.map_or(ttl, |cur| cur.min(ttl)));
        }
    }
    Ok(negative.unwrap_or(0))
}

/// Seconds an answer may stay in the cache; 0 means "do not cache".
pub fn extract_ttl(answer: &[u8]) -> u32 {
    answer_ttl(answer).unwrap_or(0)
}

#[inline]
pub fn query_id(packet: &[u8]) -> Option<u16> {
    (packet.len() >= 2).then(|| u16::from_be_bytes([packet[0], packet[1]]))
}

#[inline]
pub fn response_rcode(packet: &[u8]) -> Option<u8> {
    (packet.len() >= HEADER_LEN).then(|| packet[3] & 0x0F)
}

#[inline]
pub fn is_truncated(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[2] & 0x02 != 0
}

fn same_questions(query: &[u8], response: &[u8]) -> Result<bool> {
    let (q_count, ..) = header_counts(query)?;
    let (r_count, ..) = header_counts(response)?;
    if q_count != r_count {
        return Ok(false);
    }
    let mut cq = PacketCursor::new(query);
    let mut cr = PacketCursor::new(response);
    cq.skip(HEADER_LEN)?;
    cr.skip(HEADER_LEN)?;
    for _ in 0..q_count {
        let qn = cq.read_label_sequence()?;
        let rn = cr.read_label_sequence()?;
        // servers may echo the name with different case
        if !qn.eq_ignore_ascii_case(rn) {
            return Ok(false);
        }
        if cq.read_bytes(4)? != cr.read_bytes(4)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether `response` answers `query`: same id, QR set and the same
/// question section.
pub fn is_response_to(query: &[u8], response: &[u8]) -> bool {
    if response.len() < HEADER_LEN || response[2] & 0x80 == 0 {
        return false;
    }
    if query_id(query) != query_id(response) {
        return false;
    }
    same_questions(query, response).unwrap_or(false)
}

/// Fast parse of the first question, for logging
pub struct QuickQuery {
    pub tx_id: u16,
    pub qname: String,
    pub qtype: u16,
}

pub fn parse_quick(packet: &[u8]) -> Option<QuickQuery> {
    let tx_id = query_id(packet)?;
    let (qd_count, ..) = header_counts(packet).ok()?;
    if qd_count == 0 {
        return None;
    }
    let mut cur = PacketCursor::new(packet);
    cur.skip(HEADER_LEN).ok()?;
    let raw = cur.read_label_sequence().ok()?;
    let qtype = cur.read_u16().ok()?;

    let mut qname = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() && raw[i] != 0 {
        let len = raw[i] as usize;
        if !qname.is_empty() {
            qname.push('.');
        }
        qname.push_str(&String::from_utf8_lossy(&raw[i + 1..i + 1 + len]));
        i += 1 + len;
    }
    if qname.is_empty() {
        qname.push('.');
    }
    Some(QuickQuery { tx_id, qname, qtype })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-built packets for tests across the crate.

    use super::*;
    use std::net::Ipv4Addr;

    pub fn encode_name(out: &mut Vec<u8>, name: &str) {
        for label in name.trim_end_matches('.').split('.') {
            if label.is_empty() {
                continue;
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&id.to_be_bytes());
        // RD
        out.extend_from_slice(&[0x01, 0x00]);
        out.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        encode_name(&mut out, name);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    /// Response echoing `query`, with one A record per `(ttl, addr)`.
    pub fn build_answer(query: &[u8], rcode: u8, records: &[(u32, Ipv4Addr)]) -> Vec<u8> {
        let mut out = query.to_vec();
        out[2] |= 0x80;
        out[3] = 0x80 | (rcode & 0x0F);
        out[6..8].copy_from_slice(&(records.len() as u16).to_be_bytes());
        for (ttl, addr) in records {
            out.extend_from_slice(&[0xC0, 0x0C]);
            out.extend_from_slice(&TYPE_A.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&addr.octets());
        }
        out
    }

    pub fn with_id(packet: &[u8], id: u16) -> Vec<u8> {
        let mut out = packet.to_vec();
        out[0..2].copy_from_slice(&id.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, SOA};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn response_message(query_name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(Query::query(Name::from_str(query_name).unwrap(), RecordType::A));
        msg
    }

    #[test]
    fn cursor_never_reads_past_the_end() {
        let buf = [0u8, 1, 2];
        let mut cur = PacketCursor::new(&buf);
        assert_eq!(cur.read_u16().unwrap(), 1);
        assert_eq!(cur.read_u16(), Err(PacketError::Overrun(2)));
        assert_eq!(cur.position(), 2);
        assert_eq!(cur.read_u8().unwrap(), 2);
        assert!(cur.skip(1).is_err());
    }

    #[test]
    fn label_sequence_rejects_overlong_label_and_rewinds() {
        let mut buf = vec![64u8];
        buf.extend_from_slice(&[b'a'; 64]);
        buf.push(0);
        let mut cur = PacketCursor::new(&buf);
        assert_eq!(cur.read_label_sequence(), Err(PacketError::MalformedName(0)));
        assert_eq!(cur.position(), 0);

        let mut cur = PacketCursor::new(&[3, b'w', b'w']);
        assert!(matches!(cur.read_label_sequence(), Err(PacketError::Overrun(_))));
    }

    #[test]
    fn validate_accepts_plain_queries() {
        for qtype in [TYPE_A, TYPE_AAAA, TYPE_PTR, TYPE_MX, TYPE_ANY] {
            validate_query(&build_query(1, "www.example.com", qtype)).unwrap();
        }
    }

    #[test]
    fn validate_rejects_unsupported_shapes() {
        let base = build_query(1, "www.example.com", TYPE_A);

        let mut resp = base.clone();
        resp[2] |= 0x80;
        assert!(validate_query(&resp).is_err());

        let mut with_answer = base.clone();
        with_answer[7] = 1;
        assert!(validate_query(&with_answer).is_err());

        let mut two_additional = base.clone();
        two_additional[11] = 2;
        assert!(validate_query(&two_additional).is_err());

        let mut no_question = base.clone();
        no_question[5] = 0;
        assert!(validate_query(&no_question).is_err());

        // TXT is not cacheable
        assert_eq!(
            validate_query(&build_query(1, "www.example.com", 16)),
            Err(PacketError::Unsupported("unsupported TYPE"))
        );

        let mut chaos = base.clone();
        let len = chaos.len();
        chaos[len - 1] = 3;
        assert_eq!(validate_query(&chaos), Err(PacketError::Unsupported("unsupported CLASS")));

        assert!(validate_query(&base[..base.len() - 3]).is_err());
        assert!(validate_query(&base[..5]).is_err());
    }

    #[test]
    fn validate_checks_the_additional_record() {
        let mut q = build_query(1, "example.com", TYPE_A);
        q[11] = 1;
        // OPT: root name, type 41, udp size 4096, ttl 0, rdlen 0
        q.extend_from_slice(&[0, 0, 41, 0x10, 0, 0, 0, 0, 0, 0, 0]);
        validate_query(&q).unwrap();

        // rdlen pointing past the end
        let mut bad = q.clone();
        let len = bad.len();
        bad[len - 1] = 4;
        assert!(validate_query(&bad).is_err());
    }

    #[test]
    fn hash_ignores_id_and_tc_but_not_rd() {
        let a = build_query(1, "www.example.com", TYPE_A);
        let b = build_query(0xBEEF, "www.example.com", TYPE_A);
        assert_eq!(hash_query(&a), hash_query(&b));
        assert!(queries_equal(&a, &b));

        let mut tc = a.clone();
        tc[2] |= 0x02;
        assert_eq!(hash_query(&a), hash_query(&tc));
        assert!(queries_equal(&a, &tc));

        let mut no_rd = a.clone();
        no_rd[2] &= !0x01;
        assert_ne!(hash_query(&a), hash_query(&no_rd));
        assert!(!queries_equal(&a, &no_rd));

        let mut cd = a.clone();
        cd[3] |= 0x10;
        assert!(!queries_equal(&a, &cd));
    }

    #[test]
    fn names_are_compared_case_sensitively() {
        let lower = build_query(1, "www.example.com", TYPE_A);
        let mixed = build_query(1, "www.Example.com", TYPE_A);
        assert_ne!(hash_query(&lower), hash_query(&mixed));
        assert!(!queries_equal(&lower, &mixed));
    }

    #[test]
    fn queries_with_different_type_are_not_equal() {
        let a = build_query(1, "www.example.com", TYPE_A);
        let aaaa = build_query(1, "www.example.com", TYPE_AAAA);
        assert!(!queries_equal(&a, &aaaa));
        assert_ne!(hash_query(&a), hash_query(&aaaa));
    }

    #[test]
    fn extract_ttl_returns_minimum_answer_ttl() {
        let mut msg = response_message("www.example.com.");
        for ttl in [5u32, 100, 50] {
            msg.add_answer(Record::from_rdata(
                Name::from_str("www.example.com.").unwrap(),
                ttl,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
            ));
        }
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(extract_ttl(&bytes), 5);
    }

    #[test]
    fn extract_ttl_uses_soa_minimum_for_negative_answers() {
        let mut msg = response_message("missing.example.com.");
        msg.set_response_code(ResponseCode::NXDomain);
        let soa = SOA::new(
            Name::from_str("ns1.example.com.").unwrap(),
            Name::from_str("hostmaster.example.com.").unwrap(),
            2024010101,
            7200,
            3600,
            1209600,
            60,
        );
        msg.add_name_server(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            900,
            RData::SOA(soa),
        ));
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(extract_ttl(&bytes), 60);
    }

    #[test]
    fn extract_ttl_is_zero_without_ttl_bearing_records() {
        let q = build_query(3, "nothing.example.com", TYPE_A);
        let empty = build_answer(&q, 0, &[]);
        assert_eq!(extract_ttl(&empty), 0);

        let answer = build_answer(&q, 0, &[(300, Ipv4Addr::new(10, 0, 0, 1))]);
        assert_eq!(extract_ttl(&answer), 300);
        // cut inside the answer record
        assert_eq!(extract_ttl(&answer[..answer.len() - 2]), 0);
        assert_eq!(extract_ttl(&[0u8; 4]), 0);
    }

    #[test]
    fn response_matching_checks_id_and_question() {
        let q = build_query(0x1234, "www.example.com", TYPE_A);
        let ans = build_answer(&q, 0, &[(60, Ipv4Addr::new(1, 2, 3, 4))]);
        assert!(is_response_to(&q, &ans));
        assert!(!is_response_to(&q, &with_id(&ans, 0x4321)));
        assert!(!is_response_to(&q, &q));

        let other = build_answer(
            &build_query(0x1234, "www.example.org", TYPE_A),
            0,
            &[(60, Ipv4Addr::new(1, 2, 3, 4))],
        );
        assert!(!is_response_to(&q, &other));

        let upper = build_answer(&build_query(0x1234, "WWW.example.com", TYPE_A), 0, &[]);
        assert!(is_response_to(&q, &upper));
    }

    #[test]
    fn header_helpers() {
        let q = build_query(9, "a.b", TYPE_A);
        let mut ans = build_answer(&q, 2, &[]);
        assert_eq!(response_rcode(&ans), Some(2));
        assert!(!is_truncated(&ans));
        ans[2] |= 0x02;
        assert!(is_truncated(&ans));
        assert_eq!(query_id(&ans), Some(9));

        let quick = parse_quick(&q).unwrap();
        assert_eq!(quick.qname, "a.b");
        assert_eq!(quick.qtype, TYPE_A);
        assert_eq!(quick.tx_id, 9);
    }
}
