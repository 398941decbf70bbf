use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::{DispatchSettings, Engine};
use crate::netconfig::{
    self, DNS_PORT, DOT_PORT, HostEntry, PrivateDnsMode, Registry, RegistryError, ResolverOptions, TcMode,
};
use crate::stats::{self, ResParams};

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// 各网络的解析配置，按 netid 区分。
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 监听端口收到的查询归属的网络。
    #[serde(default = "default_netid")]
    pub default_netid: u32,
    /// 返回给调用方的最大应答字节数。
    #[serde(default = "default_answer_limit")]
    pub answer_limit: usize,
    /// DoT 单次查询超时（毫秒）。
    #[serde(default = "default_dot_query_timeout_ms")]
    pub dot_query_timeout_ms: u64,
    /// strict 模式等待验证通过的轮询次数。
    #[serde(default = "default_strict_validation_polls")]
    pub strict_validation_polls: u32,
    #[serde(default = "default_strict_poll_interval_ms")]
    pub strict_poll_interval_ms: u64,
    /// 配置加载后是否主动探测 DoT 服务器。
    #[serde(default = "default_validate_private_dns")]
    pub validate_private_dns: bool,
    /// Telemetry subsampling, "default:1 0:100 7:10" style.
    #[serde(default = "default_subsampling")]
    pub subsampling: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            default_netid: default_netid(),
            answer_limit: default_answer_limit(),
            dot_query_timeout_ms: default_dot_query_timeout_ms(),
            strict_validation_polls: default_strict_validation_polls(),
            strict_poll_interval_ms: default_strict_poll_interval_ms(),
            validate_private_dns: default_validate_private_dns(),
            subsampling: default_subsampling(),
        }
    }
}

impl GlobalSettings {
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            answer_limit: self.answer_limit,
            strict_validation_polls: self.strict_validation_polls,
            strict_poll_interval: Duration::from_millis(self.strict_poll_interval_ms),
        }
    }

    pub fn dot_query_timeout(&self) -> Duration {
        Duration::from_millis(self.dot_query_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub netid: u32,
    /// 该网络所有 socket 的路由标记。
    #[serde(default)]
    pub mark: u32,
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// 搜索域，最多 6 个。
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub params: ResParams,
    #[serde(default)]
    pub tc_mode: TcMode,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub private_dns: PrivateDnsConfig,
}

impl NetworkConfig {
    fn options(&self) -> ResolverOptions {
        ResolverOptions {
            hosts: self.hosts.clone(),
            tc_mode: self.tc_mode,
            mark: self.mark,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivateDnsConfig {
    #[serde(default)]
    pub mode: PrivateDnsMode,
    /// DoT 服务器，裸 IP 时默认 853 端口。
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub tls_name: Option<String>,
}

pub fn load_config(path: &Path) -> Result<ResolverConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ResolverConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// 轻量校验：地址提前解析，避免应用到一半失败。
fn validate(cfg: &ResolverConfig) -> Result<()> {
    let mut seen = FxHashSet::default();
    for net in &cfg.networks {
        if !seen.insert(net.netid) {
            anyhow::bail!("duplicate network {}", net.netid);
        }
        for server in &net.nameservers {
            netconfig::parse_server(server, DNS_PORT)
                .with_context(|| format!("network {} nameserver", net.netid))?;
        }
        for server in &net.private_dns.servers {
            netconfig::parse_server(server, DOT_PORT)
                .with_context(|| format!("network {} private dns server", net.netid))?;
        }
        if net.private_dns.mode == PrivateDnsMode::Strict && net.private_dns.servers.is_empty() {
            warn!(target = "config", netid = net.netid, "strict private dns without servers, every query will fail");
        }
    }
    if stats::parse_subsampling_map(&cfg.settings.subsampling).is_empty() {
        anyhow::bail!("invalid subsampling map: {:?}", cfg.settings.subsampling);
    }
    Ok(())
}

/// Brings the registry in line with `cfg`: networks that disappeared are
/// deleted, new ones created, and every listed network reconfigured.
pub fn apply_networks(registry: &Registry, cfg: &ResolverConfig) -> Result<()> {
    let wanted: FxHashSet<u32> = cfg.networks.iter().map(|n| n.netid).collect();
    for netid in registry.list_networks() {
        if !wanted.contains(&netid) {
            registry.delete_network(netid)?;
            info!(target = "config", netid, "network removed");
        }
    }

    for net in &cfg.networks {
        if !registry.has_cache(net.netid) {
            match registry.create_network(net.netid) {
                Ok(()) | Err(RegistryError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        registry
            .set_nameservers(net.netid, &net.nameservers, &net.domains, net.params, net.options())
            .with_context(|| format!("configure network {}", net.netid))?;
        registry
            .set_private_dns(
                net.netid,
                net.private_dns.mode,
                &net.private_dns.servers,
                net.private_dns.tls_name.clone(),
            )
            .with_context(|| format!("configure private dns of network {}", net.netid))?;
    }
    Ok(())
}

/// Applies a loaded configuration to a running engine.
pub fn apply_config(engine: &Engine, cfg: &ResolverConfig) -> Result<()> {
    apply_networks(engine.registry(), cfg)?;
    engine.update_settings(cfg.settings.dispatch_settings());
    if cfg.settings.validate_private_dns {
        for net in &cfg.networks {
            if net.private_dns.mode == PrivateDnsMode::Off {
                continue;
            }
            let results = engine.validate_private_dns(net.netid)?;
            let ok = results.iter().filter(|(_, ok)| *ok).count();
            info!(target = "config", netid = net.netid, validated = ok, total = results.len(), "private dns validated");
        }
    }
    Ok(())
}


fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_netid() -> u32 {
    100
}

fn default_answer_limit() -> usize {
    8192
}

fn default_dot_query_timeout_ms() -> u64 {
    10_000
}

fn default_strict_validation_polls() -> u32 {
    42
}

fn default_strict_poll_interval_ms() -> u64 {
    100
}

fn default_validate_private_dns() -> bool {
    true
}

fn default_subsampling() -> String {
    stats::DEFAULT_SUBSAMPLING_MAP.to_string()
}
