//! corral scheduler
//!
//! Serves the scheduler RPC port, registers itself in the service registry and
//! admits hosts while the registry is reachable.
//!
//! Exit codes: 0 on clean shutdown, 1 on a cluster state invariant violation,
//! 2 on configuration errors.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use corral_registry::{
    Heartbeater, HttpRegistry, Instance, LeaderTracker, MemoryRegistry, Registry, ServiceConfig,
};
use corral_scheduler::config::Config;
use corral_scheduler::{serve, Scheduler, SERVICE_NAME};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Scheduler failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    info!(
        listen_addr = %config.listen_addr,
        advertise_addr = %config.advertise_addr,
        registry_url = ?config.registry_url,
        "Starting corral scheduler"
    );

    let registry: Arc<dyn Registry> = match &config.registry_url {
        Some(url) => Arc::new(HttpRegistry::new(url.as_str()).context("building registry client")?),
        None => {
            warn!("CORRAL_REGISTRY_URL not set, using in-process registry");
            Arc::new(MemoryRegistry::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tracker = LeaderTracker::spawn(Arc::clone(&registry), SERVICE_NAME, shutdown_rx.clone());
    let scheduler = Arc::new(Scheduler::new(config.options()).with_registry_gate(tracker.subscribe()));
    let mut fatal = scheduler.fatal_signal();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let announce_handle = tokio::spawn({
        let registry = Arc::clone(&registry);
        let addr = config.advertise_addr.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { announce(registry, addr, shutdown_rx).await }
    });

    let mut server_handle = tokio::spawn(serve(listener, Arc::clone(&scheduler), shutdown_rx));

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            ExitCode::SUCCESS
        }
        _ = fatal.wait_for(Option::is_some) => {
            error!("Exiting after invariant violation");
            ExitCode::from(1)
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("RPC server exited"),
                Ok(Err(e)) => error!(error = %e, "RPC server failed"),
                Err(e) => error!(error = %e, "RPC server task panicked"),
            }
            ExitCode::FAILURE
        }
    };

    let _ = shutdown_tx.send(true);
    if let Ok(Some(heartbeater)) = announce_handle.await {
        if let Err(e) = heartbeater.close().await {
            warn!(error = %e, "Failed to deregister from registry");
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), server_handle).await;

    info!("Scheduler shutdown complete");
    Ok(code)
}

/// Registers this scheduler in the registry, retrying until it succeeds or
/// shutdown is requested. The heartbeater is returned after shutdown.
async fn announce(
    registry: Arc<dyn Registry>,
    addr: String,
    mut shutdown: watch::Receiver<bool>,
) -> Option<Heartbeater> {
    let mut delay = Duration::from_millis(200);

    let heartbeater = loop {
        let attempt = async {
            registry
                .add_service(SERVICE_NAME, ServiceConfig::default())
                .await?;
            registry
                .register_instance(SERVICE_NAME, Instance::new(addr.clone()))
                .await
        };
        match attempt.await {
            Ok(heartbeater) => {
                info!(service = SERVICE_NAME, addr = %addr, "Registered in service registry");
                break heartbeater;
            }
            Err(e) => {
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Registry registration failed, retrying");
                tokio::select! {
                    _ = shutdown.changed() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(Duration::from_secs(30));
            }
        }
    };

    let _ = shutdown.wait_for(|stop| *stop).await;
    Some(heartbeater)
}
