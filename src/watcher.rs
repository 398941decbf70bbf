use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::engine::Engine;

const RELOAD_ATTEMPTS: u32 = 3;
const RELOAD_BACKOFF: Duration = Duration::from_millis(50);

pub fn spawn(path: PathBuf, engine: Engine) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, engine) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, engine: Engine) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &engine),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Editors often truncate then write, so a failed parse is retried briefly.
fn reload(path: &Path, engine: &Engine) {
    let mut retries = RELOAD_ATTEMPTS;
    while retries > 0 {
        match config::load_config(path) {
            Ok(cfg) => {
                // earlier networks stay applied when a later one fails
                if let Err(err) = config::apply_config(engine, &cfg) {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config applied partially");
                } else {
                    info!(target = "watcher", path = %path.display(), networks = cfg.networks.len(), "config reloaded");
                }
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                } else {
                    thread::sleep(RELOAD_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DispatchSettings;
    use crate::netconfig::Registry;
    use std::fs;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::new(Arc::new(Registry::new()), DispatchSettings::default(), Duration::from_secs(1))
    }

    #[test]
    fn reload_applies_a_valid_file_and_keeps_state_on_garbage() {
        let path = std::env::temp_dir().join(format!("netresolv-watch-{}.json", std::process::id()));
        let engine = engine();

        fs::write(&path, r#"{ "networks": [ { "netid": 9, "nameservers": ["192.0.2.1"] } ] }"#).unwrap();
        reload(&path, &engine);
        assert_eq!(engine.registry().list_networks(), vec![9]);

        fs::write(&path, "{ not json").unwrap();
        reload(&path, &engine);
        assert_eq!(engine.registry().list_networks(), vec![9]);

        fs::remove_file(&path).unwrap();
    }
}
