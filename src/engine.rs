use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStatus};
use crate::dot::{DotConnector, DotResponse, DotServer, DotTransportPool, RustlsConnector};
use crate::netconfig::{
    PrivateDnsMode, PrivateDnsStatus, QueryFlags, Registry, RegistryError, ResolverSnapshot, TcMode,
};
use crate::proto_utils::{self, HEADER_LEN};
use crate::stats::{
    self, EventCounters, Protocol, QueryEventSink, QueryOutcome, RCODE_INTERNAL_ERROR, RCODE_TIMEOUT,
    Sample,
};
use crate::transport::{SocketLayer, SystemSockets};

/// Queries larger than this skip UDP.
pub const PACKETSZ: usize = 512;
const MAX_UDP_ANSWER: usize = 65_535;
const HOSTS_TTL: u32 = 0;
const VALIDATION_NAME: &str = "dns-probe.invalid.";

const RCODE_SERVFAIL: u8 = 2;
const RCODE_NOTIMP: u8 = 4;
const RCODE_REFUSED: u8 = 5;

/// Last underlying reason of a failed resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Timeout,
    Network,
    Internal,
    Rcode(u8),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Timeout => f.write_str("timeout"),
            FailureCause::Network => f.write_str("network error"),
            FailureCause::Internal => f.write_str("internal error"),
            FailureCause::Rcode(rcode) => write!(f, "rcode {}", ResponseCode::from(0, *rcode)),
        }
    }
}

impl FailureCause {
    fn sample_rcode(self) -> u8 {
        match self {
            // unreachable counts like silence
            FailureCause::Timeout | FailureCause::Network => RCODE_TIMEOUT,
            FailureCause::Internal => RCODE_INTERNAL_ERROR,
            FailureCause::Rcode(rcode) => rcode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("malformed query")]
    MalformedQuery,
    #[error("network {0} does not exist")]
    NoSuchNetwork(u32),
    #[error("no nameservers configured")]
    NoNameservers,
    #[error("no validated private dns server")]
    PrivateDnsUnavailable,
    #[error("answer larger than {0} bytes")]
    AnswerTooLarge(usize),
    #[error("all attempts failed: {0}")]
    AllAttemptsFailed(FailureCause),
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoSuchNetwork(netid) => DispatchError::NoSuchNetwork(netid),
            RegistryError::AlreadyExists(_) | RegistryError::InvalidArgument(_) => {
                DispatchError::AllAttemptsFailed(FailureCause::Internal)
            }
        }
    }
}

/// Knobs that may change on config reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Largest answer handed back to a caller.
    pub answer_limit: usize,
    /// Strict mode waits this many polls for a validated server.
    pub strict_validation_polls: u32,
    pub strict_poll_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            answer_limit: 8192,
            strict_validation_polls: 42,
            strict_poll_interval: Duration::from_millis(100),
        }
    }
}

enum AttemptError {
    Failed(FailureCause),
    Terminal(DispatchError),
}

enum UdpReply {
    Answer(Vec<u8>),
    Truncated,
}

enum DotOutcome {
    Answer(Vec<u8>),
    Fallback,
    Fail(DispatchError),
}

/// Query dispatcher: cache, then DoT, then UDP/TCP over the nameserver list.
///
/// Blocking; the daemon runs it on tokio's blocking pool.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    dot: Arc<DotTransportPool>,
    sockets: Arc<dyn SocketLayer>,
    events: Arc<dyn QueryEventSink>,
    settings: Arc<ArcSwap<DispatchSettings>>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, settings: DispatchSettings, dot_timeout: Duration) -> Self {
        Self::with_parts(
            registry,
            Arc::new(SystemSockets),
            Arc::new(RustlsConnector),
            Arc::new(EventCounters::default()),
            settings,
            dot_timeout,
        )
    }

    pub fn with_parts(
        registry: Arc<Registry>,
        sockets: Arc<dyn SocketLayer>,
        connector: Arc<dyn DotConnector>,
        events: Arc<dyn QueryEventSink>,
        settings: DispatchSettings,
        dot_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            dot: Arc::new(DotTransportPool::new(connector, dot_timeout)),
            sockets,
            events,
            settings: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn update_settings(&self, settings: DispatchSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Closes DoT sessions idle for longer than the idle window.
    pub fn sweep_idle(&self) -> usize {
        self.dot.maybe_cleanup(Instant::now());
        self.dot.connection_count()
    }

    /// Resolves `query` for `netid` and returns the raw answer.
    pub fn send_query(&self, netid: u32, query: &[u8], flags: QueryFlags) -> Result<Vec<u8>, DispatchError> {
        if query.len() < HEADER_LEN {
            return Err(DispatchError::MalformedQuery);
        }
        let settings = self.settings.load_full();
        let snapshot = self.registry.resolver_snapshot(netid)?;
        if snapshot.servers.is_empty() {
            debug!(target = "engine", netid, "no nameservers");
            return Err(DispatchError::NoNameservers);
        }

        let started = Instant::now();
        let status = match self.registry.cache_lookup(netid, query, flags) {
            Ok(status) => status,
            Err(CacheError::NoSuchNetwork) => return Err(DispatchError::NoSuchNetwork(netid)),
            Err(_) => CacheStatus::Unsupported,
        };
        let status = match status {
            CacheStatus::Found(answer) if answer.len() <= settings.answer_limit => {
                self.report(netid, None, Protocol::Cache, answer_rcode(&answer), started.elapsed(), true);
                return Ok(answer.to_vec());
            }
            // too large for the caller, resolve live
            CacheStatus::Found(_) => CacheStatus::Unsupported,
            other => other,
        };

        if let Some(q) = proto_utils::parse_quick(query) {
            debug!(target = "engine", netid, tx_id = q.tx_id, qname = %q.qname, qtype = q.qtype, cache = ?status, "resolving");
        }

        match self.resolve(netid, query, flags, &snapshot, &settings) {
            Ok(answer) => {
                if status == CacheStatus::NotFound {
                    match self.registry.cache_add(netid, query, &answer) {
                        Ok(()) | Err(CacheError::AlreadyExists) | Err(CacheError::ZeroTtl) => {}
                        Err(err) => debug!(target = "engine", netid, error = %err, "cache insert failed"),
                    }
                }
                Ok(answer)
            }
            Err(err) => {
                self.registry.cache_query_failed(netid, query, flags);
                debug!(target = "engine", netid, error = %err, elapsed_ms = started.elapsed().as_millis() as u64, "resolution failed");
                Err(err)
            }
        }
    }

    fn resolve(
        &self,
        netid: u32,
        query: &[u8],
        flags: QueryFlags,
        snapshot: &ResolverSnapshot,
        settings: &DispatchSettings,
    ) -> Result<Vec<u8>, DispatchError> {
        let dot = self.registry.private_dns_status(netid)?;
        if dot.mode != PrivateDnsMode::Off {
            match self.dot_dispatch(netid, query, dot, settings)? {
                DotOutcome::Answer(answer) => return Ok(answer),
                DotOutcome::Fail(err) => return Err(err),
                DotOutcome::Fallback => {
                    debug!(target = "engine", netid, "private dns unusable, falling back to cleartext");
                }
            }
        }
        self.classic_dispatch(netid, query, flags, snapshot, settings)
    }

    fn dot_dispatch(
        &self,
        netid: u32,
        query: &[u8],
        mut dot: PrivateDnsStatus,
        settings: &DispatchSettings,
    ) -> Result<DotOutcome, DispatchError> {
        let strict = dot.mode == PrivateDnsMode::Strict;
        if strict {
            let mut polls = 0;
            while dot.validated.is_empty() && polls < settings.strict_validation_polls {
                thread::sleep(settings.strict_poll_interval);
                dot = self.registry.private_dns_status(netid)?;
                polls += 1;
            }
            if dot.validated.is_empty() {
                warn!(target = "engine", netid, "strict mode without a validated server");
                return Ok(DotOutcome::Fail(DispatchError::PrivateDnsUnavailable));
            }
        } else if dot.validated.is_empty() {
            return Ok(DotOutcome::Fallback);
        }

        let servers: Vec<DotServer> = dot
            .validated
            .iter()
            .map(|addr| {
                if strict {
                    DotServer::strict(*addr, dot.tls_name.clone())
                } else {
                    DotServer::opportunistic(*addr, dot.tls_name.clone())
                }
            })
            .collect();

        let mut last = FailureCause::Network;
        for server in self.dot.order_candidates(&servers, dot.mark) {
            let t0 = Instant::now();
            let resp = self.dot.send(&server, dot.mark, query, settings.answer_limit);
            let latency = t0.elapsed();
            match resp {
                DotResponse::Success(answer) => {
                    self.report(netid, Some(server.addr), Protocol::Dot, answer_rcode(&answer), latency, false);
                    return Ok(DotOutcome::Answer(answer));
                }
                DotResponse::LimitError => {
                    self.report(netid, Some(server.addr), Protocol::Dot, RCODE_INTERNAL_ERROR, latency, false);
                    return Ok(DotOutcome::Fail(DispatchError::AnswerTooLarge(settings.answer_limit)));
                }
                DotResponse::NetworkError => {
                    self.report(netid, Some(server.addr), Protocol::Dot, RCODE_TIMEOUT, latency, false);
                    last = FailureCause::Network;
                }
                DotResponse::InternalError => {
                    self.report(netid, Some(server.addr), Protocol::Dot, RCODE_INTERNAL_ERROR, latency, false);
                    last = FailureCause::Internal;
                }
            }
        }

        if strict {
            Ok(DotOutcome::Fail(DispatchError::AllAttemptsFailed(last)))
        } else {
            Ok(DotOutcome::Fallback)
        }
    }

    fn classic_dispatch(
        &self,
        netid: u32,
        query: &[u8],
        flags: QueryFlags,
        snapshot: &ResolverSnapshot,
        settings: &DispatchSettings,
    ) -> Result<Vec<u8>, DispatchError> {
        let usable = stats::usable_servers(&snapshot.params, &snapshot.stats, Instant::now());
        let rounds = if flags.contains(QueryFlags::NO_RETRY) {
            1
        } else {
            snapshot.params.effective_retry_count()
        };
        let ns_count = snapshot.servers.len();

        let mut last = FailureCause::Timeout;
        for attempt in 0..rounds {
            for (idx, server) in snapshot.servers.iter().enumerate() {
                if !usable[idx] {
                    debug!(target = "engine", netid, server = %server, "skipping unusable server");
                    continue;
                }
                let timeout = snapshot.params.attempt_timeout(attempt, ns_count);
                match self.attempt_server(netid, query, *server, snapshot, timeout, settings) {
                    Ok(answer) => return Ok(answer),
                    Err(AttemptError::Terminal(err)) => return Err(err),
                    Err(AttemptError::Failed(cause)) => {
                        debug!(target = "engine", netid, server = %server, attempt, cause = %cause, "attempt failed");
                        last = cause;
                    }
                }
            }
        }
        Err(DispatchError::AllAttemptsFailed(last))
    }

    /// One try against one server: UDP (TCP for large queries), with a TCP
    /// retry on truncation or, in `UdpTcp` mode, on UDP failure.
    fn attempt_server(
        &self,
        netid: u32,
        query: &[u8],
        server: SocketAddr,
        snapshot: &ResolverSnapshot,
        timeout: Duration,
        settings: &DispatchSettings,
    ) -> Result<Vec<u8>, AttemptError> {
        if query.len() > PACKETSZ {
            let res = self.timed(netid, server, Protocol::Tcp, snapshot.revision, || {
                self.tcp_exchange(query, server, snapshot.mark, timeout)
            });
            return accept(res, settings);
        }

        let udp = self.timed(netid, server, Protocol::Udp, snapshot.revision, || {
            self.udp_exchange(query, server, &snapshot.servers, snapshot.mark, timeout)
        });
        let tcp_retry = match &udp {
            Ok(UdpReply::Truncated) => true,
            Err(_) => snapshot.tc_mode == TcMode::UdpTcp,
            Ok(UdpReply::Answer(_)) => false,
        };
        if !tcp_retry {
            return match udp {
                Ok(UdpReply::Answer(answer)) => accept(Ok(answer), settings),
                Ok(UdpReply::Truncated) => Err(AttemptError::Failed(FailureCause::Internal)),
                Err(cause) => Err(AttemptError::Failed(cause)),
            };
        }

        debug!(target = "engine", netid, server = %server, "retrying over tcp");
        let res = self.timed(netid, server, Protocol::Tcp, snapshot.revision, || {
            self.tcp_exchange(query, server, snapshot.mark, timeout)
        });
        accept(res, settings)
    }

    /// Runs one exchange and records its sample and outcome.
    fn timed<T, F>(&self, netid: u32, server: SocketAddr, protocol: Protocol, revision: u32, f: F) -> Result<T, FailureCause>
    where
        T: ExchangeResult,
        F: FnOnce() -> Result<T, FailureCause>,
    {
        let at = Instant::now();
        let res = f();
        let rtt = at.elapsed();
        let rcode = match &res {
            Ok(v) => v.rcode(),
            Err(cause) => cause.sample_rcode(),
        };
        self.registry
            .add_stats_sample(netid, revision, server, Sample::new(at, rtt, rcode));
        self.report(netid, Some(server), protocol, rcode, rtt, false);
        res
    }

    fn udp_exchange(
        &self,
        query: &[u8],
        server: SocketAddr,
        nameservers: &[SocketAddr],
        mark: u32,
        timeout: Duration,
    ) -> Result<UdpReply, FailureCause> {
        let socket = self.sockets.udp_socket(server, mark).map_err(|err| {
            warn!(target = "engine", server = %server, error = %err, "udp socket failed");
            FailureCause::Internal
        })?;
        socket.send_to(query, server).map_err(|err| {
            debug!(target = "engine", server = %server, error = %err, "udp send failed");
            FailureCause::Network
        })?;

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_UDP_ANSWER];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(FailureCause::Timeout);
            }
            let (n, from) = socket.recv_from(&mut buf, left).map_err(io_cause)?;
            if !nameservers.contains(&from) {
                debug!(target = "engine", from = %from, "dropping answer from unknown source");
                continue;
            }
            let resp = &buf[..n];
            if !proto_utils::is_response_to(query, resp) {
                debug!(target = "engine", from = %from, "dropping mismatched answer");
                continue;
            }
            if proto_utils::is_truncated(resp) {
                return Ok(UdpReply::Truncated);
            }
            return Ok(UdpReply::Answer(resp.to_vec()));
        }
    }

    fn tcp_exchange(&self, query: &[u8], server: SocketAddr, mark: u32, timeout: Duration) -> Result<Vec<u8>, FailureCause> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.sockets.tcp_connect(server, mark, timeout).map_err(io_cause)?;
        conn.send_frame(query).map_err(io_cause)?;
        loop {
            let resp = conn.recv_frame(deadline).map_err(io_cause)?;
            if proto_utils::is_response_to(query, &resp) {
                return Ok(resp);
            }
            // servers sometimes answer an older query first
            debug!(target = "engine", server = %server, "dropping mismatched tcp answer");
        }
    }

    fn report(&self, netid: u32, server: Option<SocketAddr>, protocol: Protocol, rcode: u8, latency: Duration, cache_hit: bool) {
        let sampling_denom = self.registry.subsampling_denom(netid, rcode as i32);
        self.events.record_query_outcome(&QueryOutcome {
            netid,
            server,
            protocol,
            rcode,
            latency,
            cache_hit,
            sampling_denom,
        });
    }

    /// Probes every private DNS server of `netid` and records which answered.
    pub fn validate_private_dns(&self, netid: u32) -> Result<Vec<(SocketAddr, bool)>, DispatchError> {
        let status = self.registry.private_dns_status(netid)?;
        if status.mode == PrivateDnsMode::Off {
            return Ok(Vec::new());
        }
        let validation = build_validation_query().map_err(|_| DispatchError::AllAttemptsFailed(FailureCause::Internal))?;
        let limit = self.settings.load().answer_limit;
        let mut results = Vec::with_capacity(status.servers.len());
        for addr in &status.servers {
            let server = match status.mode {
                PrivateDnsMode::Strict => DotServer::strict(*addr, status.tls_name.clone()),
                _ => DotServer::opportunistic(*addr, status.tls_name.clone()),
            };
            let ok = match self.dot.send(&server, status.mark, &validation, limit) {
                DotResponse::Success(answer) => proto_utils::is_response_to(&validation, &answer),
                _ => false,
            };
            self.registry.mark_dot_validated(netid, *addr, ok)?;
            info!(target = "engine", netid, server = %addr, ok, "private dns validation");
            results.push((*addr, ok));
        }
        Ok(results)
    }

    /// Answers an A/AAAA query from the network's customized hosts table.
    pub fn answer_from_hosts(&self, netid: u32, query: &[u8]) -> Option<Vec<u8>> {
        let req = Message::from_vec(query).ok()?;
        let q = req.queries().first()?;
        let name = q.name().to_utf8();
        let addrs = self
            .registry
            .customized_hosts(netid, name.trim_end_matches('.'));
        let records: Vec<Record> = addrs
            .into_iter()
            .filter_map(|ip| match (q.query_type(), ip) {
                (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A(v4))),
                (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA(v6))),
                _ => None,
            })
            .map(|rdata| Record::from_rdata(q.name().clone(), HOSTS_TTL, rdata))
            .collect();
        if records.is_empty() {
            return None;
        }
        build_response(&req, ResponseCode::NoError, records).ok()
    }

    /// Daemon entry: hosts table, then dispatch; SERVFAIL on failure.
    /// `None` when the packet is not worth answering at all.
    pub fn handle_query(&self, netid: u32, packet: &[u8]) -> Option<Vec<u8>> {
        if let Some(answer) = self.answer_from_hosts(netid, packet) {
            return Some(answer);
        }
        match self.send_query(netid, packet, QueryFlags::empty()) {
            Ok(answer) => Some(answer),
            Err(DispatchError::MalformedQuery) => None,
            Err(err) => {
                debug!(target = "engine", netid, error = %err, "answering servfail");
                build_servfail(packet)
            }
        }
    }
}

/// Something an exchange produced that has a response code.
trait ExchangeResult {
    fn rcode(&self) -> u8;
}

impl ExchangeResult for Vec<u8> {
    fn rcode(&self) -> u8 {
        answer_rcode(self)
    }
}

impl ExchangeResult for UdpReply {
    fn rcode(&self) -> u8 {
        match self {
            UdpReply::Answer(answer) => answer_rcode(answer),
            // truncated answers still came from a working server
            UdpReply::Truncated => 0,
        }
    }
}

fn answer_rcode(answer: &[u8]) -> u8 {
    proto_utils::response_rcode(answer).unwrap_or(RCODE_INTERNAL_ERROR)
}

fn io_cause(err: io::Error) -> FailureCause {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureCause::Timeout,
        _ => FailureCause::Network,
    }
}

/// Turns a received answer into the attempt's result.
fn accept(res: Result<Vec<u8>, FailureCause>, settings: &DispatchSettings) -> Result<Vec<u8>, AttemptError> {
    let answer = res.map_err(AttemptError::Failed)?;
    if answer.len() > settings.answer_limit {
        return Err(AttemptError::Terminal(DispatchError::AnswerTooLarge(settings.answer_limit)));
    }
    match answer_rcode(&answer) {
        rcode @ (RCODE_SERVFAIL | RCODE_NOTIMP | RCODE_REFUSED) => {
            Err(AttemptError::Failed(FailureCause::Rcode(rcode)))
        }
        _ => Ok(answer),
    }
}

fn build_response(req: &Message, rcode: ResponseCode, answers: Vec<Record>) -> anyhow::Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());
    for ans in answers {
        msg.add_answer(ans);
    }
    Ok(msg.to_bytes()?)
}

/// SERVFAIL echoing the question; header-only if the query does not parse.
pub fn build_servfail(packet: &[u8]) -> Option<Vec<u8>> {
    if let Ok(req) = Message::from_vec(packet) {
        return build_response(&req, ResponseCode::ServFail, Vec::new()).ok();
    }
    if packet.len() < HEADER_LEN {
        return None;
    }
    let mut out = packet[..HEADER_LEN].to_vec();
    out[2] = 0x80 | (packet[2] & 0x01);
    out[3] = 0x80 | RCODE_SERVFAIL;
    out[4..].fill(0);
    Some(out)
}

fn build_validation_query() -> anyhow::Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_ascii(VALIDATION_NAME)?, RecordType::A));
    Ok(msg.to_bytes()?)
}
