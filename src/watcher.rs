use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config;
use crate::router::Shunt;

const RELOAD_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Watches the config file, plus the bypass file it names at startup, and
/// pushes every successful reload into `shunt`.
pub fn spawn(path: PathBuf, shunt: Arc<Shunt>) {
    let runtime = Handle::current();
    // The watcher lives on a blocking thread; reloads enter the runtime so
    // resolver rebuilds can spawn their cleanup tasks.
    thread::spawn(move || {
        let _guard = runtime.enter();
        if let Err(err) = run_watcher(&path, &shunt) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: &Path, shunt: &Shunt) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    let bypass_file = config::load_config(path)
        .ok()
        .and_then(|cfg| cfg.bypass.bypass_file);
    if let Some(bypass_file) = bypass_file.as_deref() {
        if let Err(err) = watcher.watch(bypass_file, RecursiveMode::NonRecursive) {
            warn!(target = "watcher", path = %bypass_file.display(), error = %err, "bypass file not watched");
        }
    }

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(path, shunt),
            Err(err) => warn!(target = "watcher", error = %err, "watcher event error"),
        }
    }
    Ok(())
}

/// Retries cover editors that truncate before writing.
fn reload(path: &Path, shunt: &Shunt) {
    for attempt in 1..=RELOAD_RETRIES {
        match config::load_config(path).and_then(|cfg| shunt.update(&cfg)) {
            Ok(()) => {
                info!(target = "watcher", path = %path.display(), "config reloaded");
                return;
            }
            Err(err) if attempt == RELOAD_RETRIES => {
                warn!(target = "watcher", path = %path.display(), error = %err,
                    "config reload failed, keeping old config");
            }
            Err(_) => thread::sleep(RETRY_DELAY),
        }
    }
}
