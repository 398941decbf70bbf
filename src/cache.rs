use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::proto_utils::{self, PacketError};

/// Fixed table size: 64 * 2 * 5, tuned for a handful of apps per network.
pub const MAX_ENTRIES: usize = 64 * 2 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Query shape cannot be cached.
    Unsupported,
    NotFound,
    Found(Bytes),
    /// Lookup skipped because the caller will not store the answer.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("no such network")]
    NoSuchNetwork,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("answer ttl is zero")]
    ZeroTtl,
    #[error("query not cacheable: {0}")]
    Unsupported(#[from] PacketError),
}

/// Validated query bytes plus their hash.
#[derive(Debug, Clone, Copy)]
pub struct QueryKey<'a> {
    bytes: &'a [u8],
    hash: u32,
}

impl<'a> QueryKey<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, PacketError> {
        proto_utils::validate_query(bytes)?;
        Ok(Self {
            bytes,
            hash: proto_utils::hash_query(bytes),
        })
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn matches(&self, entry: &Entry) -> bool {
        entry.hash == self.hash && proto_utils::queries_equal(&entry.query, self.bytes)
    }
}

#[derive(Debug)]
struct Entry {
    hash: u32,
    query: Bytes,
    answer: Bytes,
    expires: Instant,
    // bucket chain
    hnext: Option<usize>,
    // MRU list, towards head / towards tail
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded answer table for one network.
///
/// Entries live in an index arena; each sits in one hash bucket chain and in
/// a doubly linked MRU list whose head is the most recently used entry.
/// Not synchronised: the registry wraps every call in its global lock.
#[derive(Debug)]
pub struct AnswerCache {
    buckets: Vec<Option<usize>>,
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    capacity: usize,
    pending: FxHashSet<u32>,
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new(MAX_ENTRIES)
    }
}

impl AnswerCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buckets: vec![None; capacity],
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            capacity,
            pending: FxHashSet::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    fn entry(&self, idx: usize) -> &Entry {
        self.slots[idx].as_ref().unwrap_or_else(|| unreachable!("dangling cache index {idx}"))
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        self.slots[idx].as_mut().unwrap_or_else(|| unreachable!("dangling cache index {idx}"))
    }

    fn find(&self, key: &QueryKey<'_>) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(key.hash)];
        while let Some(idx) = cur {
            let entry = self.entry(idx);
            if key.matches(entry) {
                return Some(idx);
            }
            cur = entry.hnext;
        }
        None
    }

    fn unlink_mru(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let e = self.entry_mut(idx);
        e.prev = None;
        e.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let e = self.entry_mut(idx);
            e.prev = None;
            e.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink_mru(idx);
            self.push_front(idx);
        }
    }

    fn unlink_bucket(&mut self, idx: usize) {
        let (bucket, hnext) = {
            let e = self.entry(idx);
            (self.bucket_of(e.hash), e.hnext)
        };
        if self.buckets[bucket] == Some(idx) {
            self.buckets[bucket] = hnext;
            return;
        }
        let mut cur = self.buckets[bucket];
        while let Some(c) = cur {
            let next = self.entry(c).hnext;
            if next == Some(idx) {
                self.entry_mut(c).hnext = hnext;
                return;
            }
            cur = next;
        }
    }

    fn remove_at(&mut self, idx: usize) {
        self.unlink_bucket(idx);
        self.unlink_mru(idx);
        self.slots[idx] = None;
        self.free.push(idx);
        self.len -= 1;
    }

    /// Answer for `key` if present and fresh; promotes it to MRU head.
    /// An expired entry met here is dropped.
    pub fn get(&mut self, key: &QueryKey<'_>, now: Instant) -> Option<Bytes> {
        let idx = self.find(key)?;
        if now >= self.entry(idx).expires {
            self.remove_at(idx);
            return None;
        }
        self.promote(idx);
        Some(self.entry(idx).answer.clone())
    }

    pub fn contains(&self, key: &QueryKey<'_>) -> bool {
        self.find(key).is_some()
    }

    /// Expiry of a live entry. A stale entry is dropped, as in `get`.
    pub fn expiration(&mut self, key: &QueryKey<'_>, now: Instant) -> Option<Instant> {
        let idx = self.find(key)?;
        let expires = self.entry(idx).expires;
        if now >= expires {
            self.remove_at(idx);
            return None;
        }
        Some(expires)
    }

    /// Stores `answer` for `ttl` seconds. An existing entry is left as is.
    pub fn insert(
        &mut self,
        key: &QueryKey<'_>,
        answer: &[u8],
        ttl: u32,
        now: Instant,
    ) -> Result<(), CacheError> {
        if self.find(key).is_some() {
            return Err(CacheError::AlreadyExists);
        }
        if ttl == 0 {
            return Err(CacheError::ZeroTtl);
        }
        if self.len >= self.capacity {
            self.remove_expired(now);
            if self.len >= self.capacity {
                self.remove_oldest();
            }
        }

        let bucket = self.bucket_of(key.hash);
        let entry = Entry {
            hash: key.hash,
            query: Bytes::copy_from_slice(key.bytes),
            answer: Bytes::copy_from_slice(answer),
            expires: now + Duration::from_secs(ttl as u64),
            hnext: self.buckets[bucket],
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.buckets[bucket] = Some(idx);
        self.push_front(idx);
        self.len += 1;
        Ok(())
    }

    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let (next, expired) = {
                let e = self.entry(idx);
                (e.next, now >= e.expires)
            };
            if expired {
                self.remove_at(idx);
                removed += 1;
            }
            cur = next;
        }
        removed
    }

    pub fn remove_oldest(&mut self) -> bool {
        match self.tail {
            Some(idx) => {
                self.remove_at(idx);
                true
            }
            None => false,
        }
    }

    /// Drops every entry and every pending marker.
    pub fn flush(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.pending.clear();
    }

    pub fn is_pending(&self, hash: u32) -> bool {
        self.pending.contains(&hash)
    }

    /// Returns false when another resolver already owns `hash`.
    pub fn mark_pending(&mut self, hash: u32) -> bool {
        self.pending.insert(hash)
    }

    pub fn release_pending(&mut self, hash: u32) -> bool {
        self.pending.remove(&hash)
    }

    /// Question name of the most recently used answer carrying `addr`.
    pub fn hostname_for_address(&self, addr: IpAddr) -> Option<String> {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let entry = self.entry(idx);
            cur = entry.next;
            let Ok(msg) = Message::from_vec(&entry.answer) else {
                continue;
            };
            let hit = msg.answers().iter().any(|rr| match (rr.data(), addr) {
                (Some(RData::A(a)), IpAddr::V4(v4)) => a.0 == v4,
                (Some(RData::AAAA(aaaa)), IpAddr::V6(v6)) => aaaa.0 == v6,
                _ => false,
            });
            if !hit {
                continue;
            }
            let name = msg
                .queries()
                .iter()
                .map(|q| q.name().to_utf8())
                .find(|n| !n.is_empty() && n != ".");
            if let Some(name) = name {
                return Some(name.trim_end_matches('.').to_string());
            }
        }
        None
    }

    /// Query bytes from most to least recently used.
    #[cfg(test)]
    fn mru_queries(&self) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(idx) = cur {
            let e = self.entry(idx);
            out.push(e.query.clone());
            cur = e.next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto_utils::testing::{build_answer, build_query};
    use crate::proto_utils::{TYPE_A, TYPE_AAAA};
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::AAAA;
    use hickory_proto::rr::{Name, Record, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    fn query(name: &str) -> Vec<u8> {
        build_query(1, name, TYPE_A)
    }

    fn answer_for(q: &[u8], ttl: u32) -> Vec<u8> {
        build_answer(q, 0, &[(ttl, Ipv4Addr::new(192, 0, 2, 7))])
    }

    fn put(cache: &mut AnswerCache, name: &str, ttl: u32, now: Instant) -> Vec<u8> {
        let q = query(name);
        let key = QueryKey::new(&q).unwrap();
        cache.insert(&key, &answer_for(&q, ttl), ttl, now).unwrap();
        q
    }

    #[test]
    fn insert_then_get_returns_identical_answer() {
        let mut cache = AnswerCache::default();
        let now = Instant::now();
        let q = query("www.example.com");
        let answer = answer_for(&q, 60);
        let key = QueryKey::new(&q).unwrap();
        cache.insert(&key, &answer, 60, now).unwrap();

        // a different transaction id still hits
        let other = build_query(0x7777, "www.example.com", TYPE_A);
        let other_key = QueryKey::new(&other).unwrap();
        assert_eq!(cache.get(&other_key, now).as_deref(), Some(answer.as_slice()));
    }

    #[test]
    fn zero_ttl_is_never_stored() {
        let mut cache = AnswerCache::default();
        let now = Instant::now();
        let q = query("zero.example.com");
        let key = QueryKey::new(&q).unwrap();
        assert_eq!(cache.insert(&key, &answer_for(&q, 0), 0, now), Err(CacheError::ZeroTtl));
        assert!(cache.get(&key, now).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn duplicate_insert_keeps_expiry_and_position() {
        let mut cache = AnswerCache::default();
        let now = Instant::now();
        let a = put(&mut cache, "a.example.com", 30, now);
        let key_a = QueryKey::new(&a).unwrap();
        let expires = cache.expiration(&key_a, now).unwrap();

        let b = put(&mut cache, "b.example.com", 30, now);
        let later = now + Duration::from_secs(5);
        assert_eq!(
            cache.insert(&key_a, &answer_for(&a, 300), 300, later),
            Err(CacheError::AlreadyExists)
        );
        assert_eq!(cache.expiration(&key_a, later), Some(expires));
        assert_eq!(cache.mru_queries(), vec![Bytes::from(b), Bytes::from(a)]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entry_is_removed_on_lookup() {
        let mut cache = AnswerCache::default();
        let now = Instant::now();
        let q = put(&mut cache, "short.example.com", 2, now);
        let key = QueryKey::new(&q).unwrap();
        assert!(cache.get(&key, now + Duration::from_secs(1)).is_some());
        assert!(cache.get(&key, now + Duration::from_secs(2)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn full_table_evicts_least_recently_used() {
        let mut cache = AnswerCache::new(3);
        let now = Instant::now();
        let a = put(&mut cache, "a.test", 100, now);
        let b = put(&mut cache, "b.test", 100, now);
        let c = put(&mut cache, "c.test", 100, now);

        // touch a so b becomes the tail
        assert!(cache.get(&QueryKey::new(&a).unwrap(), now).is_some());
        let d = put(&mut cache, "d.test", 100, now);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&QueryKey::new(&b).unwrap()));
        assert_eq!(
            cache.mru_queries(),
            vec![Bytes::from(d), Bytes::from(a), Bytes::from(c)]
        );
    }

    #[test]
    fn full_table_purges_expired_before_lru() {
        let mut cache = AnswerCache::new(3);
        let now = Instant::now();
        let old = put(&mut cache, "old.test", 100, now);
        let short1 = put(&mut cache, "short1.test", 1, now);
        let short2 = put(&mut cache, "short2.test", 1, now);

        let later = now + Duration::from_secs(10);
        let fresh = put(&mut cache, "fresh.test", 100, later);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&QueryKey::new(&old).unwrap()));
        assert!(!cache.contains(&QueryKey::new(&short1).unwrap()));
        assert!(!cache.contains(&QueryKey::new(&short2).unwrap()));
        assert!(cache.contains(&QueryKey::new(&fresh).unwrap()));
    }

    #[test]
    fn colliding_buckets_keep_entries_apart() {
        // one bucket forces every entry onto the same chain
        let mut cache = AnswerCache::new(1);
        cache.capacity = 4;
        let now = Instant::now();
        let names = ["w.test", "x.test", "y.test", "z.test"];
        let queries: Vec<_> = names.iter().map(|n| put(&mut cache, n, 50, now)).collect();
        for q in &queries {
            let key = QueryKey::new(q).unwrap();
            assert_eq!(cache.get(&key, now).as_deref(), Some(answer_for(q, 50).as_slice()));
        }
        let key = QueryKey::new(&queries[1]).unwrap();
        cache.remove_at(cache.find(&key).unwrap());
        assert!(!cache.contains(&key));
        for q in [&queries[0], &queries[2], &queries[3]] {
            assert!(cache.contains(&QueryKey::new(q).unwrap()));
        }
    }

    #[test]
    fn flush_clears_entries_and_pending() {
        let mut cache = AnswerCache::default();
        let now = Instant::now();
        put(&mut cache, "a.test", 100, now);
        assert!(cache.mark_pending(42));
        assert!(!cache.mark_pending(42));
        cache.flush();
        assert!(cache.is_empty());
        assert!(!cache.is_pending(42));
        // slots are reusable after a flush
        put(&mut cache, "b.test", 100, now);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reverse_lookup_finds_question_name() {
        let mut cache = AnswerCache::default();
        let now = Instant::now();
        put(&mut cache, "host.example.com", 100, now);
        assert_eq!(
            cache.hostname_for_address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))).as_deref(),
            Some("host.example.com")
        );
        assert!(cache.hostname_for_address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8))).is_none());

        let v6 = Ipv6Addr::from_str("2001:db8::1").unwrap();
        let name = Name::from_str("six.example.com.").unwrap();
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(name.clone(), RecordType::AAAA));
        msg.add_answer(Record::from_rdata(name, 100, RData::AAAA(AAAA(v6))));
        let q = build_query(1, "six.example.com", TYPE_AAAA);
        let key = QueryKey::new(&q).unwrap();
        cache.insert(&key, &msg.to_bytes().unwrap(), 100, now).unwrap();
        assert_eq!(
            cache.hostname_for_address(IpAddr::V6(v6)).as_deref(),
            Some("six.example.com")
        );
    }
}
