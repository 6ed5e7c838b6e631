use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kixroute::Shunt;
use kixroute::config::load_config;
use kixroute::fakeip::{FakeIpStore, FileStore, MemoryStore};
use kixroute::server::{self, DnsServer};
use kixroute::watcher;

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Rule-based routing core with fake-ip DNS", long_about = None)]
struct Args {
    /// Config file (JSON).
    #[arg(short = 'c', long = "config", default_value = "config/kixroute.json")]
    config: PathBuf,
    /// Enable debug logging.
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP workers for the DNS listener; defaults to the CPU count.
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let bind_udp: SocketAddr = cfg.server.bind_udp.parse().context("parse udp bind addr")?;
    let bind_tcp: SocketAddr = cfg.server.bind_tcp.parse().context("parse tcp bind addr")?;

    let store: Arc<dyn FakeIpStore> = match cfg.dns.cache_file.as_deref() {
        Some(path) => Arc::new(FileStore::open(path).context("open fake-ip cache")?),
        None => Arc::new(MemoryStore::new()),
    };

    // Proxy protocols plug in here; without one, proxy-mode dials fail cleanly.
    let shunt = Arc::new(Shunt::new(&cfg, HashMap::new(), store).context("build shunt")?);
    watcher::spawn(args.config.clone(), shunt.clone());

    let flusher = shunt.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            flusher.flush();
        }
    });

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    let serving = server::serve(DnsServer::new(shunt.clone()), bind_udp, bind_tcp, udp_workers);
    tokio::select! {
        res = serving => {
            if let Err(err) = &res {
                warn!(error = %err, "dns server stopped");
            }
            shunt.flush();
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shunt.flush();
            Ok(())
        }
    }
}

fn init_tracing(debug: bool) {
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
