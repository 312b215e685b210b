use forwarder::config::{self, RelayConfig};
use forwarder::cycle::{Forwarder, ForwarderSettings};
use forwarder::identity::device_identity;
use forwarder::remote::postgres::PgRemote;
use forwarder::status_http::{self, StatusContext};
use relay_queue::QueueStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Parse optional --config <path> argument. Without it the default path is
    // used when present, otherwise built-in defaults plus RELAY_* overrides.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => Some(PathBuf::from(p)),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let cfg = match config::load_config(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "forwarder starting");

    let queue = match QueueStore::open_with_busy_timeout(
        Path::new(&cfg.queue.sqlite_path),
        cfg.queue.busy_timeout,
    ) {
        Ok(q) => {
            info!(path = %cfg.queue.sqlite_path, "queue opened");
            Arc::new(Mutex::new(q))
        }
        Err(e) => {
            eprintln!("FATAL: failed to open queue: {}", e);
            std::process::exit(1);
        }
    };

    let remote = connect_remote(&cfg).await;
    let identity = device_identity(&cfg);
    info!(
        device_key = %identity.device_key,
        ip = identity.ip.as_deref().unwrap_or("-"),
        delivery_enabled = remote.is_some(),
        "device identity resolved"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fwd = Forwarder::new(
        queue.clone(),
        remote,
        identity,
        ForwarderSettings::from_config(&cfg),
    );

    if cfg.status_http.enabled {
        let ctx = StatusContext {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            device_key: cfg.device.key.clone(),
            queue: queue.clone(),
            forwarder: fwd.state(),
        };
        match status_http::start(&cfg.status_http.bind, ctx, shutdown_rx.clone()).await {
            Ok(addr) => info!(addr = %addr, "status HTTP server started"),
            Err(e) => {
                eprintln!("FATAL: failed to start status HTTP server: {}", e);
                std::process::exit(1);
            }
        }
    }

    let worker = tokio::spawn(fwd.run(shutdown_rx));

    wait_for_stop_signal().await;
    shutdown_tx.send(true).ok();

    if let Err(e) = worker.await {
        error!(error = %e, "forwarder task ended abnormally");
    }
    info!("forwarder shutdown complete");
}

/// Build the remote store, or None when delivery must stay off.
async fn connect_remote(cfg: &RelayConfig) -> Option<PgRemote> {
    if !cfg.remote.enabled {
        info!("remote delivery disabled by config");
        return None;
    }
    if !cfg.remote.is_ready() {
        warn!(
            report = %cfg.remote.readiness_report(),
            "remote not configured, delivery OFF"
        );
        return None;
    }

    let remote = match PgRemote::connect_lazy(&cfg.remote) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("FATAL: invalid remote settings: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        host = %cfg.remote.host,
        port = cfg.remote.port,
        database = %cfg.remote.database,
        "remote store configured"
    );

    if cfg.remote.run_migrations {
        match remote.run_migrations().await {
            Ok(()) => info!("remote migrations applied"),
            // The store may simply be unreachable right now; delivery retries on its own.
            Err(e) => warn!(error = %e, "remote migrations failed"),
        }
    }
    Some(remote)
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}
