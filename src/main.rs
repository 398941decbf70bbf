use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use netresolv::config;
use netresolv::dot::RustlsConnector;
use netresolv::engine::Engine;
use netresolv::netconfig::Registry;
use netresolv::stats::EventCounters;
use netresolv::transport::{self, SystemSockets};
use netresolv::watcher;

const MAX_UDP_QUERY: usize = 4096;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Per-network caching DNS stub resolver", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/resolver.json")]
    config: PathBuf,
    /// 前端收到的查询所属网络，缺省取配置中的 default_netid。
    #[arg(long = "netid")]
    netid: Option<u32>,
    /// 启用调试日志
    #[arg(long = "debug")]
    debug: bool,
    /// 阻塞线程池上限，解析在其中同步执行；0 表示 tokio 缺省值
    #[arg(long = "blocking-threads", default_value_t = 0)]
    blocking_threads: usize,
    /// UDP 监听 socket 数量，0 表示每个 CPU 一个
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if args.blocking_threads > 0 {
        builder.max_blocking_threads(args.blocking_threads);
    }
    builder
        .build()
        .context("build tokio runtime")?
        .block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let cfg = config::load_config(&args.config).context("load initial config")?;
    let udp_addr: SocketAddr = cfg.settings.bind_udp.parse().context("parse udp listen address")?;
    let tcp_addr: SocketAddr = cfg.settings.bind_tcp.parse().context("parse tcp listen address")?;
    let netid = args.netid.unwrap_or(cfg.settings.default_netid);

    let mut registry = Registry::new();
    registry.set_default_subsampling(&cfg.settings.subsampling);
    let events = Arc::new(EventCounters::default());
    let engine = Engine::with_parts(
        Arc::new(registry),
        Arc::new(SystemSockets),
        Arc::new(RustlsConnector),
        events.clone(),
        cfg.settings.dispatch_settings(),
        cfg.settings.dot_query_timeout(),
    );

    // DoT 探测是阻塞的
    let initial = engine.clone();
    tokio::task::spawn_blocking(move || config::apply_config(&initial, &cfg))
        .await
        .context("apply initial config")??;
    if !engine.registry().has_cache(netid) {
        warn!(netid, "front end network is not configured, every query will get SERVFAIL");
    }
    watcher::spawn(args.config.clone(), engine.clone());

    let frontend = Frontend { engine: engine.clone(), netid };
    let workers = if args.udp_workers > 0 { args.udp_workers } else { num_cpus::get().max(1) };
    let mut tasks = JoinSet::new();

    for worker_id in 0..workers {
        let socket = transport::bind_udp_listener(udp_addr)
            .and_then(UdpSocket::from_std)
            .with_context(|| format!("bind udp listener {worker_id}"))?;
        let frontend = frontend.clone();
        tasks.spawn(async move {
            if let Err(err) = frontend.serve_udp(Arc::new(socket)).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
    }

    let listener = TcpListener::bind(tcp_addr).await.context("bind tcp listener")?;
    let tcp_frontend = frontend.clone();
    tasks.spawn(async move {
        if let Err(err) = tcp_frontend.serve_tcp(listener).await {
            error!(error = %err, "tcp server exited");
        }
    });

    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dot_sessions = engine.sweep_idle();
            info!(metrics = %events.metrics_snapshot(), dot_sessions, "resolver metrics");
        }
    });

    info!(udp = %udp_addr, tcp = %tcp_addr, netid, workers, "resolver started");

    tokio::select! {
        _ = tasks.join_next() => warn!("a listener stopped, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    tasks.shutdown().await;
    Ok(())
}

fn init_tracing(debug: bool) {
    // 非 debug 仅 warn，RUST_LOG 优先
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Listeners feeding one network's queries to the blocking dispatcher.
#[derive(Clone)]
struct Frontend {
    engine: Engine,
    netid: u32,
}

impl Frontend {
    async fn answer(&self, packet: Bytes) -> Option<Vec<u8>> {
        let engine = self.engine.clone();
        let netid = self.netid;
        tokio::task::spawn_blocking(move || engine.handle_query(netid, &packet))
            .await
            .unwrap_or_else(|err| {
                error!(error = %err, "resolver task failed");
                None
            })
    }

    async fn serve_udp(self, socket: Arc<UdpSocket>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_UDP_QUERY];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    // ICMP errors from earlier sends surface here
                    debug!(error = %err, "udp recv failed");
                    continue;
                }
            };
            let packet = Bytes::copy_from_slice(&buf[..len]);
            let this = self.clone();
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let Some(resp) = this.answer(packet).await else {
                    return;
                };
                if let Err(err) = socket.send_to(&resp, peer).await {
                    debug!(peer = %peer, error = %err, "udp send failed");
                }
            });
        }
    }

    async fn serve_tcp(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.serve_tcp_conn(stream).await {
                    debug!(peer = %peer, error = %err, "tcp connection closed");
                }
            });
        }
    }

    /// Length-prefixed queries, answered in order until the peer hangs up.
    async fn serve_tcp_conn(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        loop {
            let len = match stream.read_u16().await {
                Ok(0) => return Ok(()),
                Ok(len) => len as usize,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await?;

            let Some(resp) = self.answer(Bytes::from(query)).await else {
                return Ok(());
            };
            let Ok(resp_len) = u16::try_from(resp.len()) else {
                warn!(len = resp.len(), "answer too large for tcp, dropped");
                continue;
            };
            let mut frame = Vec::with_capacity(resp.len() + 2);
            frame.extend_from_slice(&resp_len.to_be_bytes());
            frame.extend_from_slice(&resp);
            stream.write_all(&frame).await?;
        }
    }
}
