use collector::config;
use collector::producer::{Producer, ProducerSettings};
use collector::sensor::SimulatedSensor;
use relay_queue::QueueStore;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
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

    info!(version = env!("CARGO_PKG_VERSION"), "collector starting");

    let queue = match QueueStore::open_with_busy_timeout(Path::new(&cfg.sqlite_path), cfg.lock_retry) {
        Ok(q) => {
            info!(path = %cfg.sqlite_path, "queue opened");
            q
        }
        Err(e) => {
            eprintln!("FATAL: failed to open queue: {}", e);
            std::process::exit(1);
        }
    };

    let sensor = SimulatedSensor::new(&cfg.sensor_type, &cfg.pin, cfg.failure_ratio);
    let producer = Producer::new(queue, sensor, ProducerSettings::from_config(&cfg));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(producer.run(shutdown_rx));

    wait_for_stop_signal().await;
    shutdown_tx.send(true).ok();

    if let Err(e) = worker.await {
        error!(error = %e, "collector task ended abnormally");
    }
    info!("collector shutdown complete");
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
