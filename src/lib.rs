//! Per-network caching DNS stub resolver.
//!
//! Each network (netid) has its own nameservers, search domains, reachability
//! statistics and answer cache. Queries go through [`engine::Engine`], which
//! consults the cache, then private DNS (DoT), then UDP/TCP.

pub mod cache;
pub mod config;
pub mod dot;
pub mod engine;
pub mod netconfig;
pub mod proto_utils;
pub mod stats;
pub mod transport;
pub mod watcher;
