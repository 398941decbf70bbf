//! Per-network resolver state and the answer cache API.
//!
//! Every network lives in one map behind one lock. Cache waiters park on a
//! single condition variable tied to that lock; whoever releases a pending
//! marker (insert, failure, flush, delete) wakes them all and they re-check.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{AnswerCache, CacheError, CacheStatus, QueryKey};
use crate::proto_utils;
use crate::stats::{self, ResParams, Sample, ServerStats, StatsSummary};

pub const MAXNS: usize = 4;
pub const MAXDNSRCH: usize = 6;
pub const MAXDNSRCHPATH: usize = 256;
pub const DNS_PORT: u16 = 53;
pub const DOT_PORT: u16 = 853;
pub const PENDING_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("network {0} does not exist")]
    NoSuchNetwork(u32),
    #[error("network {0} already exists")]
    AlreadyExists(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

bitflags::bitflags! {
    /// Caller flags for one resolution.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// One attempt per server, no retry rounds.
        const NO_RETRY = 1 << 0;
        /// Never store the answer.
        const NO_CACHE_STORE = 1 << 1;
        /// Never serve from the cache.
        const NO_CACHE_LOOKUP = 1 << 2;
    }
}

const NO_CACHE: QueryFlags = QueryFlags::NO_CACHE_STORE.union(QueryFlags::NO_CACHE_LOOKUP);

/// 截断处理模式 / Truncation handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcMode {
    /// TCP only after a truncated UDP answer.
    #[default]
    Default,
    /// Also fall back to TCP when UDP fails outright.
    UdpTcp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateDnsMode {
    #[default]
    Off,
    Opportunistic,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
    pub addr: IpAddr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Replaces the network's customized hosts table; empty clears it.
    pub hosts: Vec<HostEntry>,
    pub tc_mode: TcMode,
    /// Socket mark for every query sent on behalf of this network.
    pub mark: u32,
}

#[derive(Debug, Default)]
struct PrivateDnsState {
    mode: PrivateDnsMode,
    servers: Vec<SocketAddr>,
    tls_name: Option<String>,
    validated: FxHashSet<SocketAddr>,
}

#[derive(Debug)]
struct NetConfig {
    cache: AnswerCache,
    nameservers: Vec<String>,
    server_addrs: Vec<SocketAddr>,
    domains: Vec<String>,
    params: ResParams,
    stats: Vec<ServerStats>,
    revision: u32,
    hosts: FxHashMap<String, Vec<IpAddr>>,
    tc_mode: TcMode,
    mark: u32,
    private_dns: PrivateDnsState,
    subsampling: FxHashMap<i32, u32>,
    pending_timeouts: u64,
}

impl NetConfig {
    fn new(subsampling: FxHashMap<i32, u32>) -> Self {
        Self {
            cache: AnswerCache::default(),
            nameservers: Vec::new(),
            server_addrs: Vec::new(),
            domains: Vec::new(),
            params: ResParams::default(),
            stats: Vec::new(),
            revision: 0,
            hosts: FxHashMap::default(),
            tc_mode: TcMode::Default,
            mark: 0,
            private_dns: PrivateDnsState::default(),
            subsampling,
            pending_timeouts: 0,
        }
    }

    /// Samples taken before this point no longer apply.
    fn clear_stats(&mut self) {
        self.stats.iter_mut().for_each(ServerStats::clear);
        self.revision = self.revision.wrapping_add(1);
    }
}

/// What the dispatcher needs to run one query, copied out under the lock.
#[derive(Debug, Clone)]
pub struct ResolverSnapshot {
    pub servers: Vec<SocketAddr>,
    pub params: ResParams,
    pub stats: Vec<ServerStats>,
    pub revision: u32,
    pub tc_mode: TcMode,
    pub mark: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateDnsStatus {
    pub mode: PrivateDnsMode,
    pub servers: Vec<SocketAddr>,
    /// Validated servers, in configured order.
    pub validated: Vec<SocketAddr>,
    pub tls_name: Option<String>,
    pub mark: u32,
}

/// Dump of one network, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverInfo {
    pub netid: u32,
    pub nameservers: Vec<String>,
    pub domains: Vec<String>,
    pub params: ResParams,
    pub stats: Vec<StatsSummary>,
    pub revision: u32,
    pub wait_for_pending_req_timeout_count: u64,
    pub tc_mode: TcMode,
    pub mark: u32,
    pub cache_entries: usize,
    pub private_dns_mode: PrivateDnsMode,
    pub validated_dot_servers: Vec<SocketAddr>,
}

/// Registry of all networks: configuration, statistics and caches.
#[derive(Debug)]
pub struct Registry {
    state: Mutex<FxHashMap<u32, NetConfig>>,
    cv: Condvar,
    pending_timeout: Duration,
    subsampling_default: FxHashMap<i32, u32>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts `1.2.3.4`, `2001:db8::1`, `1.2.3.4:5353` and `[2001:db8::1]:5353`.
pub fn parse_server(server: &str, default_port: u16) -> Result<SocketAddr, RegistryError> {
    let server = server.trim();
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    server
        .parse::<SocketAddr>()
        .map_err(|_| RegistryError::InvalidArgument(format!("bad server address {server:?}")))
}

/// Drops duplicates, rejects oversized entries, keeps the first MAXDNSRCH.
fn filter_domains(domains: &[String]) -> Result<Vec<String>, RegistryError> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::with_capacity(domains.len().min(MAXDNSRCH));
    for domain in domains {
        if domain.len() > MAXDNSRCHPATH - 1 {
            return Err(RegistryError::InvalidArgument(format!(
                "search domain longer than {} bytes",
                MAXDNSRCHPATH - 1
            )));
        }
        if seen.insert(domain.as_str()) {
            out.push(domain.clone());
        }
    }
    if out.len() > MAXDNSRCH {
        warn!(valid = out.len(), max = MAXDNSRCH, "too many search domains, truncating");
        out.truncate(MAXDNSRCH);
    }
    Ok(out)
}

fn same_server_set(old: &[SocketAddr], new: &[SocketAddr]) -> bool {
    let old: BTreeSet<_> = old.iter().collect();
    let new: BTreeSet<_> = new.iter().collect();
    old == new
}

impl Registry {
    pub fn new() -> Self {
        Self::with_pending_timeout(PENDING_REQUEST_TIMEOUT)
    }

    pub fn with_pending_timeout(pending_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(FxHashMap::default()),
            cv: Condvar::new(),
            pending_timeout,
            subsampling_default: stats::parse_subsampling_map(stats::DEFAULT_SUBSAMPLING_MAP),
        }
    }

    /// Subsampling map given to networks created from now on.
    pub fn set_default_subsampling(&mut self, raw: &str) {
        self.subsampling_default = stats::parse_subsampling_map(raw);
    }

    // every critical section leaves the map consistent, so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, FxHashMap<u32, NetConfig>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_network(&self, netid: u32) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if state.contains_key(&netid) {
            warn!(netid, "network already created");
            return Err(RegistryError::AlreadyExists(netid));
        }
        state.insert(netid, NetConfig::new(self.subsampling_default.clone()));
        info!(netid, "network created");
        Ok(())
    }

    /// Removes the network; parked cache waiters wake and see it gone.
    pub fn delete_network(&self, netid: u32) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let mut removed = state.remove(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        removed.cache.flush();
        drop(state);
        self.cv.notify_all();
        info!(netid, "network deleted");
        Ok(())
    }

    pub fn list_networks(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_cache(&self, netid: u32) -> bool {
        self.lock().contains_key(&netid)
    }

    pub fn has_nameservers(&self, netid: u32) -> bool {
        self.lock()
            .get(&netid)
            .is_some_and(|n| !n.server_addrs.is_empty())
    }

    pub fn set_nameservers(
        &self,
        netid: u32,
        servers: &[String],
        domains: &[String],
        params: ResParams,
        options: ResolverOptions,
    ) -> Result<(), RegistryError> {
        let mut nameservers: Vec<String> = servers.to_vec();
        if nameservers.len() > MAXNS {
            warn!(netid, count = nameservers.len(), max = MAXNS, "too many nameservers, truncating");
            nameservers.truncate(MAXNS);
        }
        // parse before locking so a bad entry leaves nothing half applied
        let addrs = nameservers
            .iter()
            .map(|s| parse_server(s, DNS_PORT))
            .collect::<Result<Vec<_>, _>>()?;
        let domains = filter_domains(domains)?;

        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;

        let old_max_samples = net.params.max_samples;
        net.params = params;
        if !same_server_set(&net.server_addrs, &addrs) {
            info!(netid, servers = ?addrs, "nameservers changed");
            net.stats = vec![ServerStats::default(); addrs.len()];
            net.nameservers = nameservers;
            net.server_addrs = addrs;
            net.clear_stats();
        } else {
            // same set, maybe reordered: samples follow their server
            let mut old: Vec<(SocketAddr, ServerStats)> = net
                .server_addrs
                .iter()
                .copied()
                .zip(std::mem::take(&mut net.stats))
                .collect();
            net.stats = addrs
                .iter()
                .map(|addr| {
                    old.iter()
                        .position(|(a, _)| a == addr)
                        .map(|pos| old.swap_remove(pos).1)
                        .unwrap_or_default()
                })
                .collect();
            net.nameservers = nameservers;
            net.server_addrs = addrs;
            if net.params.max_samples != old_max_samples {
                net.clear_stats();
            }
        }

        net.domains = domains;
        net.hosts.clear();
        for host in options.hosts {
            if host.name.is_empty() {
                continue;
            }
            net.hosts.entry(host.name).or_default().push(host.addr);
        }
        net.tc_mode = options.tc_mode;
        net.mark = options.mark;
        Ok(())
    }

    /// Clears the answer cache and the reachability statistics.
    pub fn flush(&self, netid: u32) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        net.cache.flush();
        net.clear_stats();
        drop(state);
        self.cv.notify_all();
        info!(target = "cache", netid, "cache flushed");
        Ok(())
    }

    pub fn resolver_snapshot(&self, netid: u32) -> Result<ResolverSnapshot, RegistryError> {
        let state = self.lock();
        let net = state.get(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        Ok(ResolverSnapshot {
            servers: net.server_addrs.clone(),
            params: net.params,
            stats: net.stats.clone(),
            revision: net.revision,
            tc_mode: net.tc_mode,
            mark: net.mark,
        })
    }

    /// Records a sample unless the server set changed since `revision`.
    pub fn add_stats_sample(&self, netid: u32, revision: u32, server: SocketAddr, sample: Sample) -> bool {
        let mut state = self.lock();
        let Some(net) = state.get_mut(&netid) else {
            return false;
        };
        if net.revision != revision {
            debug!(netid, revision, current = net.revision, "dropping stale sample");
            return false;
        }
        let max_samples = net.params.max_samples;
        match net.server_addrs.iter().position(|a| *a == server) {
            Some(pos) => {
                net.stats[pos].push(sample, max_samples);
                true
            }
            None => false,
        }
    }

    pub fn resolver_info(&self, netid: u32) -> Result<ResolverInfo, RegistryError> {
        let state = self.lock();
        let net = state.get(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        Ok(ResolverInfo {
            netid,
            nameservers: net.nameservers.clone(),
            domains: net.domains.clone(),
            params: net.params,
            stats: net.stats.iter().map(ServerStats::summary).collect(),
            revision: net.revision,
            wait_for_pending_req_timeout_count: net.pending_timeouts,
            tc_mode: net.tc_mode,
            mark: net.mark,
            cache_entries: net.cache.len(),
            private_dns_mode: net.private_dns.mode,
            validated_dot_servers: validated_in_order(&net.private_dns),
        })
    }

    pub fn customized_hosts(&self, netid: u32, name: &str) -> Vec<IpAddr> {
        self.lock()
            .get(&netid)
            .and_then(|n| n.hosts.get(name).cloned())
            .unwrap_or_default()
    }

    pub fn subsampling_denom(&self, netid: u32, rcode: i32) -> u32 {
        self.lock()
            .get(&netid)
            .map_or(0, |n| stats::subsampling_denom(&n.subsampling, rcode))
    }

    pub fn set_private_dns(
        &self,
        netid: u32,
        mode: PrivateDnsMode,
        servers: &[String],
        tls_name: Option<String>,
    ) -> Result<(), RegistryError> {
        let addrs = servers
            .iter()
            .map(|s| parse_server(s, DOT_PORT))
            .collect::<Result<Vec<_>, _>>()?;
        let tls_name = tls_name.filter(|n| !n.is_empty());
        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        let dot = &mut net.private_dns;
        if mode == PrivateDnsMode::Off || dot.tls_name != tls_name {
            dot.validated.clear();
        } else {
            dot.validated.retain(|a| addrs.contains(a));
        }
        dot.mode = mode;
        dot.servers = addrs;
        dot.tls_name = tls_name;
        info!(target = "dot", netid, mode = ?mode, servers = ?dot.servers, "private dns configured");
        Ok(())
    }

    pub fn mark_dot_validated(&self, netid: u32, server: SocketAddr, ok: bool) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        let dot = &mut net.private_dns;
        if !dot.servers.contains(&server) {
            return Err(RegistryError::InvalidArgument(format!(
                "{server} is not a private dns server of network {netid}"
            )));
        }
        if ok {
            dot.validated.insert(server);
        } else {
            dot.validated.remove(&server);
        }
        info!(target = "dot", netid, server = %server, ok, "private dns validation");
        Ok(())
    }

    pub fn private_dns_status(&self, netid: u32) -> Result<PrivateDnsStatus, RegistryError> {
        let state = self.lock();
        let net = state.get(&netid).ok_or(RegistryError::NoSuchNetwork(netid))?;
        Ok(PrivateDnsStatus {
            mode: net.private_dns.mode,
            servers: net.private_dns.servers.clone(),
            validated: validated_in_order(&net.private_dns),
            tls_name: net.private_dns.tls_name.clone(),
            mark: net.mark,
        })
    }

    pub fn cache_lookup(&self, netid: u32, query: &[u8], flags: QueryFlags) -> Result<CacheStatus, CacheError> {
        self.cache_lookup_at(netid, query, flags, Instant::now())
    }

    /// Looks `query` up; on a miss the caller becomes the resolver for it,
    /// unless another caller already is, in which case this waits for it.
    pub fn cache_lookup_at(
        &self,
        netid: u32,
        query: &[u8],
        flags: QueryFlags,
        now: Instant,
    ) -> Result<CacheStatus, CacheError> {
        if flags.intersects(NO_CACHE) {
            return Ok(if flags.contains(QueryFlags::NO_CACHE_STORE) {
                CacheStatus::Skip
            } else {
                CacheStatus::NotFound
            });
        }
        let Ok(key) = QueryKey::new(query) else {
            debug!(target = "cache", netid, "unsupported query");
            return Ok(CacheStatus::Unsupported);
        };

        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(CacheError::NoSuchNetwork)?;
        if let Some(answer) = net.cache.get(&key, now) {
            debug!(target = "cache", netid, hash = key.hash(), "cache hit");
            return Ok(CacheStatus::Found(answer));
        }
        if net.cache.mark_pending(key.hash()) {
            debug!(target = "cache", netid, hash = key.hash(), "cache miss");
            return Ok(CacheStatus::NotFound);
        }

        debug!(target = "cache", netid, hash = key.hash(), "waiting for pending request");
        let hash = key.hash();
        let (mut state, res) = self
            .cv
            .wait_timeout_while(state, self.pending_timeout, |nets| {
                nets.get(&netid).is_some_and(|n| n.cache.is_pending(hash))
            })
            .unwrap_or_else(PoisonError::into_inner);
        let net = state.get_mut(&netid).ok_or(CacheError::NoSuchNetwork)?;
        if res.timed_out() {
            net.pending_timeouts += 1;
            warn!(target = "cache", netid, hash, "timed out waiting for pending request");
        }
        // the clock moved while parked
        let now = now.max(Instant::now());
        Ok(match net.cache.get(&key, now) {
            Some(answer) => CacheStatus::Found(answer),
            None => CacheStatus::NotFound,
        })
    }

    pub fn cache_add(&self, netid: u32, query: &[u8], answer: &[u8]) -> Result<(), CacheError> {
        self.cache_add_at(netid, query, answer, Instant::now())
    }

    /// Stores `answer` and releases waiters for `query`, even when nothing
    /// is stored.
    pub fn cache_add_at(&self, netid: u32, query: &[u8], answer: &[u8], now: Instant) -> Result<(), CacheError> {
        let key = QueryKey::new(query)?;
        let ttl = proto_utils::extract_ttl(answer);
        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(CacheError::NoSuchNetwork)?;
        let res = net.cache.insert(&key, answer, ttl, now);
        net.cache.release_pending(key.hash());
        drop(state);
        self.cv.notify_all();
        match &res {
            Ok(()) => debug!(target = "cache", netid, hash = key.hash(), ttl, "answer cached"),
            Err(err) => debug!(target = "cache", netid, hash = key.hash(), error = %err, "answer not cached"),
        }
        res
    }

    /// Releases waiters after a failed resolution without storing anything.
    pub fn cache_query_failed(&self, netid: u32, query: &[u8], flags: QueryFlags) {
        if flags.intersects(NO_CACHE) {
            return;
        }
        let Ok(key) = QueryKey::new(query) else {
            return;
        };
        let mut state = self.lock();
        if let Some(net) = state.get_mut(&netid) {
            net.cache.release_pending(key.hash());
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Expiry of the cached answer for `query`, if it is still live.
    pub fn cache_expiration(&self, netid: u32, query: &[u8]) -> Result<Option<Instant>, CacheError> {
        self.cache_expiration_at(netid, query, Instant::now())
    }

    pub fn cache_expiration_at(&self, netid: u32, query: &[u8], now: Instant) -> Result<Option<Instant>, CacheError> {
        let key = QueryKey::new(query)?;
        let mut state = self.lock();
        let net = state.get_mut(&netid).ok_or(CacheError::NoSuchNetwork)?;
        Ok(net.cache.expiration(&key, now))
    }

    pub fn hostname_for_address(&self, netid: u32, addr: IpAddr) -> Option<String> {
        self.lock().get(&netid)?.cache.hostname_for_address(addr)
    }
}

fn validated_in_order(dot: &PrivateDnsState) -> Vec<SocketAddr> {
    dot.servers
        .iter()
        .filter(|s| dot.validated.contains(s))
        .copied()
        .collect()
}
