use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use belay::{Config, Store, Worker};
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let store = Store::connect(&config.database_url).await?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_notify = Arc::new(Notify::new());
    let mut handles = Vec::new();
    for _ in 0..config.worker_count.max(1) {
        let worker = Worker::new(store.clone(), config.worker.clone())?;
        let stop = stop.clone();
        let notify = stop_notify.clone();
        handles.push(tokio::spawn(async move {
            worker.run(stop, notify).await;
        }));
    }
    info!(
        worker_count = config.worker_count,
        lease_ms = config.worker.lease_ms,
        max_attempts = config.worker.max_attempts,
        "workers started - waiting for shutdown signal"
    );

    let signal = shutdown_signal().await?;
    info!(signal, "shutdown signal received - stopping workers");
    stop.store(true, Ordering::SeqCst);
    stop_notify.notify_waiters();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Resolve once the process is asked to stop, naming the signal that won so
/// the caller can trip the shared stop flag.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}
