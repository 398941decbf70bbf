use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sample rcode for failures that never reached the server.
pub const RCODE_INTERNAL_ERROR: u8 = 254;
pub const RCODE_TIMEOUT: u8 = 255;

const RCODE_NOERROR: u8 = 0;
const RCODE_NXDOMAIN: u8 = 3;
const RCODE_NOTAUTH: u8 = 9;

const DEFAULT_RETRY_COUNT: u32 = 2;
const DEFAULT_BASE_TIMEOUT_MSEC: u32 = 5000;
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default telemetry subsampling: keep every event, 1/100 NOERROR, 1/10 timeouts.
pub const DEFAULT_SUBSAMPLING_MAP: &str = "default:1 0:100 7:10";
/// Key used for "every other return code" in the subsampling map.
pub const SUBSAMPLING_DEFAULT_KEY: i32 = -1;

/// 解析器参数 / Resolver tuning parameters for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResParams {
    /// 样本有效期（秒）。
    #[serde(default = "default_sample_validity")]
    pub sample_validity_secs: u16,
    /// 成功率阈值（百分比），低于此值的服务器暂不使用。
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u8,
    #[serde(default = "default_min_samples")]
    pub min_samples: u8,
    #[serde(default = "default_max_samples")]
    pub max_samples: u8,
    /// 基础超时（毫秒），0 表示使用缺省值。
    #[serde(default)]
    pub base_timeout_msec: u32,
    /// 重试轮数，0 表示使用缺省值。
    #[serde(default)]
    pub retry_count: u32,
}

impl Default for ResParams {
    fn default() -> Self {
        Self {
            sample_validity_secs: default_sample_validity(),
            success_threshold: default_success_threshold(),
            min_samples: default_min_samples(),
            max_samples: default_max_samples(),
            base_timeout_msec: 0,
            retry_count: 0,
        }
    }
}

impl ResParams {
    pub fn effective_retry_count(&self) -> u32 {
        if self.retry_count == 0 {
            DEFAULT_RETRY_COUNT
        } else {
            self.retry_count
        }
    }

    pub fn effective_base_timeout(&self) -> Duration {
        let ms = if self.base_timeout_msec == 0 {
            DEFAULT_BASE_TIMEOUT_MSEC
        } else {
            self.base_timeout_msec
        };
        Duration::from_millis(ms as u64)
    }

    /// Per-attempt timeout: the base doubles each round and is split across
    /// the servers after the first round, never below one second.
    pub fn attempt_timeout(&self, attempt: u32, nameservers: usize) -> Duration {
        let base = self.effective_base_timeout().as_millis() as u64;
        let mut ms = base.checked_shl(attempt).unwrap_or(u64::MAX);
        if attempt > 0 && nameservers > 0 {
            ms /= nameservers as u64;
        }
        Duration::from_millis(ms).max(MIN_ATTEMPT_TIMEOUT)
    }

    pub fn sample_validity(&self) -> Duration {
        Duration::from_secs(self.sample_validity_secs as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub at: Instant,
    pub rtt: Duration,
    pub rcode: u8,
}

impl Sample {
    pub fn new(at: Instant, rtt: Duration, rcode: u8) -> Self {
        Self { at, rtt, rcode }
    }
}

/// Aggregated view over one server's samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub successes: u32,
    pub errors: u32,
    pub timeouts: u32,
    pub internal_errors: u32,
    pub rtt_avg_ms: Option<u64>,
    #[serde(skip)]
    pub last_sample: Option<Instant>,
}

/// Ring of the most recent samples for one nameserver.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    samples: VecDeque<Sample>,
}

impl ServerStats {
    pub fn push(&mut self, sample: Sample, max_samples: u8) {
        let max = max_samples as usize;
        if max == 0 {
            return;
        }
        while self.samples.len() >= max {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> StatsSummary {
        let mut out = StatsSummary::default();
        let mut rtt_total = Duration::ZERO;
        for s in &self.samples {
            match s.rcode {
                RCODE_NOERROR | RCODE_NXDOMAIN | RCODE_NOTAUTH => {
                    out.successes += 1;
                    rtt_total += s.rtt;
                }
                RCODE_TIMEOUT => out.timeouts += 1,
                RCODE_INTERNAL_ERROR => out.internal_errors += 1,
                _ => out.errors += 1,
            }
        }
        if out.successes > 0 {
            out.rtt_avg_ms = Some((rtt_total / out.successes).as_millis() as u64);
        }
        out.last_sample = self.samples.back().map(|s| s.at);
        out
    }

    /// A server with enough samples and a poor success rate is skipped,
    /// unless its samples are too old to mean anything.
    pub fn is_usable(&self, params: &ResParams, now: Instant) -> bool {
        let s = self.summary();
        // internal errors say nothing about the server
        let total = s.successes + s.errors + s.timeouts;
        if total == 0 || total < params.min_samples as u32 {
            return true;
        }
        let success_rate = s.successes * 100 / total;
        if success_rate >= params.success_threshold as u32 {
            return true;
        }
        match s.last_sample {
            Some(last) => now.saturating_duration_since(last) > params.sample_validity(),
            None => true,
        }
    }
}

/// Usability flag per server, in order. If no server is usable all are.
pub fn usable_servers(params: &ResParams, stats: &[ServerStats], now: Instant) -> Vec<bool> {
    let mut usable: Vec<bool> = stats.iter().map(|s| s.is_usable(params, now)).collect();
    if !usable.iter().any(|u| *u) {
        usable.iter_mut().for_each(|u| *u = true);
    }
    usable
}

/// Parses `"default:1 0:100 7:10"` style maps; bad pairs are skipped.
pub fn parse_subsampling_map(raw: &str) -> FxHashMap<i32, u32> {
    let mut out = FxHashMap::default();
    for pair in raw.split_whitespace() {
        let Some((code, denom)) = pair.split_once(':') else {
            warn!(pair, "invalid subsampling pair");
            continue;
        };
        let code = if code == "default" {
            SUBSAMPLING_DEFAULT_KEY
        } else {
            match code.parse::<i32>() {
                Ok(code) => code,
                Err(_) => {
                    warn!(pair, "invalid subsampling return code");
                    continue;
                }
            }
        };
        match denom.parse::<u32>() {
            Ok(denom) => {
                out.insert(code, denom);
            }
            Err(_) => warn!(pair, "invalid subsampling denominator"),
        }
    }
    out
}

/// Denominator for `rcode`, falling back to the default key; 0 drops the event.
pub fn subsampling_denom(map: &FxHashMap<i32, u32>, rcode: i32) -> u32 {
    map.get(&rcode)
        .or_else(|| map.get(&SUBSAMPLING_DEFAULT_KEY))
        .copied()
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Dot,
    /// Served from the answer cache.
    Cache,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Dot => "dot",
            Protocol::Cache => "cache",
        })
    }
}

/// One finished attempt, or one cache hit (then `server` is `None`).
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub netid: u32,
    pub server: Option<SocketAddr>,
    pub protocol: Protocol,
    pub rcode: u8,
    pub latency: Duration,
    pub cache_hit: bool,
    pub sampling_denom: u32,
}

/// Telemetry boundary: receives every outcome, aggregates nothing here.
pub trait QueryEventSink: Send + Sync {
    fn record_query_outcome(&self, outcome: &QueryOutcome);
}

/// Default sink: structured log line plus a few counters / 默认事件接收器
#[derive(Debug, Default)]
pub struct EventCounters {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    latency_us_total: AtomicU64,
}

impl EventCounters {
    pub fn metrics_snapshot(&self) -> String {
        let queries = self.queries.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let lat = self.latency_us_total.load(Ordering::Relaxed);
        // the two loads are not one snapshot
        let upstream = queries.saturating_sub(hits);
        let avg_us = if upstream > 0 { lat / upstream } else { 0 };
        format!(
            "queries={} cache_hits={} failures={} upstream_avg_us={}",
            queries, hits, failures, avg_us
        )
    }
}

impl QueryEventSink for EventCounters {
    fn record_query_outcome(&self, outcome: &QueryOutcome) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if outcome.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.latency_us_total
                .fetch_add(outcome.latency.as_micros() as u64, Ordering::Relaxed);
            if !matches!(outcome.rcode, RCODE_NOERROR | RCODE_NXDOMAIN) {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        if outcome.sampling_denom == 0 {
            return;
        }
        debug!(
            target = "engine",
            netid = outcome.netid,
            server = ?outcome.server,
            protocol = %outcome.protocol,
            rcode = outcome.rcode,
            latency_us = outcome.latency.as_micros() as u64,
            cache_hit = outcome.cache_hit,
            sampling_denom = outcome.sampling_denom,
            "query outcome"
        );
    }
}

fn default_sample_validity() -> u16 {
    1800
}

fn default_success_threshold() -> u8 {
    25
}

fn default_min_samples() -> u8 {
    8
}

fn default_max_samples() -> u8 {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ResParams {
        ResParams::default()
    }

    fn fill(stats: &mut ServerStats, at: Instant, rcode: u8, n: usize) {
        for _ in 0..n {
            stats.push(Sample::new(at, Duration::from_millis(20), rcode), 64);
        }
    }

    #[test]
    fn params_default_and_zero_fallbacks() {
        let p: ResParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(p, ResParams::default());
        assert_eq!(p.effective_retry_count(), 2);
        assert_eq!(p.effective_base_timeout(), Duration::from_millis(5000));

        let p: ResParams =
            serde_json::from_value(serde_json::json!({ "retry_count": 4, "base_timeout_msec": 800 }))
                .unwrap();
        assert_eq!(p.effective_retry_count(), 4);
        assert_eq!(p.max_samples, 64);
    }

    #[test]
    fn attempt_timeout_scales_and_floors() {
        let p = params();
        assert_eq!(p.attempt_timeout(0, 3), Duration::from_millis(5000));
        // 10000 / 3
        assert_eq!(p.attempt_timeout(1, 3), Duration::from_millis(3333));
        assert_eq!(p.attempt_timeout(2, 4), Duration::from_millis(5000));

        let fast = ResParams { base_timeout_msec: 300, ..params() };
        assert_eq!(fast.attempt_timeout(0, 1), Duration::from_millis(1000));
        assert_eq!(fast.attempt_timeout(1, 4), Duration::from_millis(1000));
    }

    #[test]
    fn ring_keeps_most_recent_samples() {
        let mut stats = ServerStats::default();
        let now = Instant::now();
        for i in 0..5u8 {
            stats.push(Sample::new(now, Duration::ZERO, i), 3);
        }
        assert_eq!(stats.len(), 3);
        let rcodes: Vec<u8> = stats.samples.iter().map(|s| s.rcode).collect();
        assert_eq!(rcodes, vec![2, 3, 4]);
    }

    #[test]
    fn summary_classifies_rcodes() {
        let mut stats = ServerStats::default();
        let now = Instant::now();
        fill(&mut stats, now, 0, 2);
        fill(&mut stats, now, 3, 1);
        fill(&mut stats, now, 2, 1);
        fill(&mut stats, now, RCODE_TIMEOUT, 2);
        fill(&mut stats, now, RCODE_INTERNAL_ERROR, 1);
        let s = stats.summary();
        assert_eq!((s.successes, s.errors, s.timeouts, s.internal_errors), (3, 1, 2, 1));
        assert_eq!(s.rtt_avg_ms, Some(20));
        assert_eq!(s.last_sample, Some(now));
    }

    #[test]
    fn failing_server_is_unusable_until_samples_age_out() {
        let p = params();
        let now = Instant::now();
        let mut bad = ServerStats::default();
        fill(&mut bad, now, 2, 10);
        assert!(!bad.is_usable(&p, now));
        assert!(bad.is_usable(&p, now + Duration::from_secs(1801)));

        // too few samples to judge
        let mut young = ServerStats::default();
        fill(&mut young, now, 2, 7);
        assert!(young.is_usable(&p, now));
    }

    #[test]
    fn internal_errors_do_not_count_against_a_server() {
        let p = params();
        let now = Instant::now();
        let mut stats = ServerStats::default();
        fill(&mut stats, now, RCODE_INTERNAL_ERROR, 20);
        fill(&mut stats, now, 0, 1);
        assert!(stats.is_usable(&p, now));
    }

    #[test]
    fn all_servers_usable_when_none_is() {
        let p = params();
        let now = Instant::now();
        let mut bad = ServerStats::default();
        fill(&mut bad, now, RCODE_TIMEOUT, 10);
        let good = ServerStats::default();
        assert_eq!(usable_servers(&p, &[bad.clone(), good], now), vec![false, true]);
        assert_eq!(usable_servers(&p, &[bad.clone(), bad], now), vec![true, true]);
    }

    #[test]
    fn subsampling_map_parsing() {
        let map = parse_subsampling_map(DEFAULT_SUBSAMPLING_MAP);
        assert_eq!(subsampling_denom(&map, 0), 100);
        assert_eq!(subsampling_denom(&map, 7), 10);
        assert_eq!(subsampling_denom(&map, 2), 1);

        let map = parse_subsampling_map("x:1 3:abc 5:2 broken");
        assert_eq!(map.len(), 1);
        assert_eq!(subsampling_denom(&map, 5), 2);
        assert_eq!(subsampling_denom(&map, 0), 0);
    }

    #[test]
    fn counters_track_hits_and_failures() {
        let sink = EventCounters::default();
        let mut outcome = QueryOutcome {
            netid: 1,
            server: None,
            protocol: Protocol::Cache,
            rcode: 0,
            latency: Duration::ZERO,
            cache_hit: true,
            sampling_denom: 1,
        };
        sink.record_query_outcome(&outcome);
        outcome.cache_hit = false;
        outcome.rcode = 2;
        outcome.latency = Duration::from_micros(40);
        sink.record_query_outcome(&outcome);
        assert_eq!(
            sink.metrics_snapshot(),
            "queries=2 cache_hits=1 failures=1 upstream_avg_us=40"
        );
    }

    #[test]
    fn snapshot_survives_hits_read_ahead_of_queries() {
        let sink = EventCounters::default();
        sink.cache_hits.store(3, Ordering::Relaxed);
        sink.queries.store(2, Ordering::Relaxed);
        sink.latency_us_total.store(90, Ordering::Relaxed);
        assert_eq!(
            sink.metrics_snapshot(),
            "queries=2 cache_hits=3 failures=0 upstream_avg_us=0"
        );
    }
}
