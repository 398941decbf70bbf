//! DNS-over-TLS transport pool (RFC 7858).
//!
//! One [`TransportHandle`] per (mark, server). The pool lock only covers
//! lookup and accounting; the TLS exchange runs after the pool lock is
//! released, on a session checked out of the handle.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use thiserror::Error;
use tracing::{debug, info};

use crate::proto_utils;
use crate::transport::{self, read_frame, write_frame};

/// Idle handles older than this are dropped; sweeps run at most this often.
pub const DOT_IDLE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DotServer {
    pub addr: SocketAddr,
    /// Name sent as SNI and checked against the certificate.
    pub tls_name: Option<String>,
    /// Opportunistic sessions accept any certificate.
    pub verify: bool,
}

impl DotServer {
    pub fn opportunistic(addr: SocketAddr, tls_name: Option<String>) -> Self {
        Self { addr, tls_name, verify: false }
    }

    pub fn strict(addr: SocketAddr, tls_name: Option<String>) -> Self {
        Self { addr, tls_name, verify: true }
    }

    fn server_name(&self) -> Result<ServerName<'static>, DotError> {
        match &self.tls_name {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|e| DotError::Internal(format!("invalid tls name {name:?}: {e}"))),
            None => Ok(ServerName::from(self.addr.ip())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotResponse {
    Success(Vec<u8>),
    /// Transient, try the next server or protocol.
    NetworkError,
    /// Not transient for this attempt.
    InternalError,
    /// Answer larger than the caller accepts; terminal.
    LimitError,
}

#[derive(Debug, Error)]
pub enum DotError {
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub trait DotSession: Send {
    fn query(&mut self, query: &[u8], timeout: Duration) -> Result<Vec<u8>, DotError>;
}

pub trait DotConnector: Send + Sync {
    fn connect(&self, server: &DotServer, mark: u32, timeout: Duration) -> Result<Box<dyn DotSession>, DotError>;
}

/// Shared by every caller querying one (mark, server).
#[derive(Default)]
pub struct TransportHandle {
    session: Mutex<Option<Box<dyn DotSession>>>,
}

impl TransportHandle {
    /// The idle session is checked out for the exchange, so a slow connect
    /// never holds other callers of this handle.
    fn exchange(
        &self,
        connector: &dyn DotConnector,
        server: &DotServer,
        mark: u32,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, DotError> {
        let idle = self.lock().take();
        if let Some(mut s) = idle {
            match s.query(query, timeout) {
                Ok(answer) => {
                    self.check_in(s);
                    return Ok(answer);
                }
                Err(err) => {
                    // the server may have closed an idle session
                    debug!(target = "dot", server = %server.addr, error = %err, "reused session failed, reconnecting");
                }
            }
        }

        let mut fresh = connector.connect(server, mark, timeout)?;
        debug!(target = "dot", server = %server.addr, mark, "session established");
        let answer = fresh.query(query, timeout)?;
        self.check_in(fresh);
        Ok(answer)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn DotSession>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keeps one session per handle; extras opened concurrently are closed.
    fn check_in(&self, session: Box<dyn DotSession>) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(session);
        }
    }
}

struct PoolEntry {
    handle: Arc<TransportHandle>,
    use_count: usize,
    last_used: Instant,
}

struct PoolState {
    entries: FxHashMap<(u32, DotServer), PoolEntry>,
    last_sweep: Instant,
}

pub struct DotTransportPool {
    state: Mutex<PoolState>,
    connector: Arc<dyn DotConnector>,
    query_timeout: Duration,
}

impl DotTransportPool {
    pub fn new(connector: Arc<dyn DotConnector>, query_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: FxHashMap::default(),
                last_sweep: Instant::now(),
            }),
            connector,
            query_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Servers with a live handle first, IPv6 before IPv4 within each tier.
    pub fn order_candidates(&self, servers: &[DotServer], mark: u32) -> Vec<DotServer> {
        let state = self.lock();
        let mut tiers: [Vec<DotServer>; 4] = Default::default();
        for server in servers {
            let live = state.entries.contains_key(&(mark, server.clone()));
            let tier = match (live, server.addr.is_ipv6()) {
                (true, true) => 0,
                (true, false) => 1,
                (false, true) => 2,
                (false, false) => 3,
            };
            tiers[tier].push(server.clone());
        }
        tiers.into_iter().flatten().collect()
    }

    /// Sends `query` to `server`, reusing its session when one exists.
    pub fn send(&self, server: &DotServer, mark: u32, query: &[u8], max_answer: usize) -> DotResponse {
        let key = (mark, server.clone());
        let handle = {
            let mut state = self.lock();
            let entry = state.entries.entry(key.clone()).or_insert_with(|| PoolEntry {
                handle: Arc::new(TransportHandle::default()),
                use_count: 0,
                last_used: Instant::now(),
            });
            entry.use_count += 1;
            Arc::clone(&entry.handle)
        };

        let res = handle.exchange(self.connector.as_ref(), server, mark, query, self.query_timeout);

        let now = Instant::now();
        {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.use_count = entry.use_count.saturating_sub(1);
                entry.last_used = now;
            }
            sweep_locked(&mut state, now);
        }

        match res {
            Ok(answer) if answer.len() > max_answer => {
                debug!(target = "dot", server = %server.addr, len = answer.len(), max_answer, "answer too large");
                DotResponse::LimitError
            }
            Ok(answer) => DotResponse::Success(answer),
            Err(DotError::Network(err)) => {
                debug!(target = "dot", server = %server.addr, error = %err, "query failed");
                DotResponse::NetworkError
            }
            Err(DotError::Internal(err)) => {
                debug!(target = "dot", server = %server.addr, error = %err, "query failed");
                DotResponse::InternalError
            }
        }
    }

    /// Runs an idle sweep as of `now`, unless one ran within the idle window.
    pub fn maybe_cleanup(&self, now: Instant) {
        sweep_locked(&mut self.lock(), now);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().entries.len()
    }
}

fn sweep_locked(state: &mut PoolState, now: Instant) {
    if now.saturating_duration_since(state.last_sweep) < DOT_IDLE_WINDOW {
        return;
    }
    state.last_sweep = now;
    let before = state.entries.len();
    state.entries.retain(|_, e| {
        e.use_count > 0 || now.saturating_duration_since(e.last_used) <= DOT_IDLE_WINDOW
    });
    let dropped = before - state.entries.len();
    if dropped > 0 {
        info!(target = "dot", dropped, "idle transports removed");
    }
}

/// Opportunistic mode accepts any certificate the server presents.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Built once, shared by every verifying session.
static VERIFIED_TLS_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
});

static OPPORTUNISTIC_TLS_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth(),
    )
});

/// Real DoT sessions: socket2 TCP + rustls.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsConnector;

struct RustlsSession {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl DotConnector for RustlsConnector {
    fn connect(&self, server: &DotServer, mark: u32, timeout: Duration) -> Result<Box<dyn DotSession>, DotError> {
        let name = server.server_name()?;
        let config = if server.verify {
            VERIFIED_TLS_CONFIG.clone()
        } else {
            OPPORTUNISTIC_TLS_CONFIG.clone()
        };
        let tcp = transport::connect_tcp(server.addr, mark, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;
        let conn = ClientConnection::new(config, name).map_err(|e| DotError::Internal(e.to_string()))?;
        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock)?;
        }
        Ok(Box::new(RustlsSession { stream }))
    }
}

impl DotSession for RustlsSession {
    fn query(&mut self, query: &[u8], timeout: Duration) -> Result<Vec<u8>, DotError> {
        let deadline = Instant::now() + timeout;
        write_frame(&mut self.stream, query)?;
        loop {
            self.stream.sock.set_read_timeout(Some(transport::remaining(deadline)?))?;
            let answer = read_frame(&mut self.stream)?;
            if proto_utils::query_id(&answer) == proto_utils::query_id(query) {
                return Ok(answer);
            }
            debug!(target = "dot", "discarding answer with unexpected id");
        }
    }
}
