//! corral host agent
//!
//! Registers with the scheduler, runs the jobs it receives and serves the host
//! HTTP API.
//!
//! Exit codes: 0 on clean shutdown, 1 when the job table detects an
//! inconsistency, 2 on configuration errors.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use corral_host::config::{Config, ExecutorKind};
use corral_host::{
    instance_id, Agent, AgentOptions, Executor, MockBehavior, MockExecutor, ProcessExecutor,
    SchedulerLocator, SERVICE_NAME,
};
use corral_registry::{Heartbeater, HttpRegistry, Instance, MemoryRegistry, Registry, ServiceConfig};
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
            error!(error = %format!("{e:#}"), "Host agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let host_id = match &config.host_id {
        Some(id) => id.clone(),
        None => instance_id::load_or_create(&config.data_dir)?,
    };
    info!(
        host_id = %host_id,
        http_addr = %config.http_addr,
        scheduler_addr = ?config.scheduler_addr,
        registry_url = ?config.registry_url,
        port_range = %config.port_range,
        "Starting corral host agent"
    );

    let registry: Arc<dyn Registry> = match &config.registry_url {
        Some(url) => Arc::new(HttpRegistry::new(url.as_str()).context("building registry client")?),
        None => {
            warn!("CORRAL_REGISTRY_URL not set, using in-process registry");
            Arc::new(MemoryRegistry::new())
        }
    };

    let locator = match &config.scheduler_addr {
        Some(addr) => SchedulerLocator::Static(addr.clone()),
        None => SchedulerLocator::Registry(Arc::clone(&registry)),
    };

    let executor: Arc<dyn Executor> = match config.executor {
        ExecutorKind::Process => Arc::new(ProcessExecutor::new()),
        ExecutorKind::Mock => {
            warn!("Using the mock executor, jobs will not run real processes");
            let mock = MockExecutor::new();
            mock.set_default(MockBehavior::long_running());
            Arc::new(mock)
        }
    };

    let options = AgentOptions {
        stop_grace: config.stop_grace,
        job_retention: config.job_retention,
        attach_wait: config.attach_wait,
        external_ip: config.external_ip.clone(),
        ..AgentOptions::default()
    };
    let agent = Agent::new(
        config.host_template(host_id.clone()),
        executor,
        Arc::clone(&registry),
        locator,
        options,
    )?;
    let mut fatal = agent.table().fatal_signal();

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let announce_handle = tokio::spawn({
        let registry = Arc::clone(&registry);
        let instance = Instance::new(config.http_advertise_addr())
            .with_meta("host_id", host_id.as_str());
        let stop_rx = stop_rx.clone();
        async move { announce(registry, instance, stop_rx).await }
    });

    let mut agent_handle = tokio::spawn(agent.run(listener, stop_rx));

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            ExitCode::SUCCESS
        }
        _ = fatal.wait_for(Option::is_some) => {
            error!("Exiting after job table inconsistency");
            ExitCode::from(1)
        }
        result = &mut agent_handle => {
            match result {
                Ok(Ok(())) => info!("Host agent exited"),
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "Host agent failed"),
                Err(e) => error!(error = %e, "Host agent task panicked"),
            }
            ExitCode::FAILURE
        }
    };

    let _ = stop_tx.send(true);
    if let Ok(Some(heartbeater)) = announce_handle.await {
        if let Err(e) = heartbeater.close().await {
            warn!(error = %e, "Failed to deregister from registry");
        }
    }
    if !agent_handle.is_finished() {
        let grace = config.stop_grace + Duration::from_secs(10);
        if tokio::time::timeout(grace, agent_handle).await.is_err() {
            warn!("Host agent did not stop in time");
        }
    }

    info!("Host agent shutdown complete");
    Ok(code)
}

/// Registers this host in the registry, retrying until it succeeds or
/// shutdown is requested. The heartbeater is returned after shutdown.
async fn announce(
    registry: Arc<dyn Registry>,
    instance: Instance,
    mut shutdown: watch::Receiver<bool>,
) -> Option<Heartbeater> {
    let mut delay = Duration::from_millis(200);

    let heartbeater = loop {
        let attempt = async {
            registry
                .add_service(SERVICE_NAME, ServiceConfig::default())
                .await?;
            registry
                .register_instance(SERVICE_NAME, instance.clone())
                .await
        };
        match attempt.await {
            Ok(heartbeater) => {
                info!(service = SERVICE_NAME, addr = %instance.addr, "Registered in service registry");
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
