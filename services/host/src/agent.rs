//! Wires the host agent together.
//!
//! Background workers share one internal shutdown channel. When the agent is
//! asked to stop it first stops every active job, so the terminal events still
//! reach the scheduler and the registry, and only then signals the workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use corral_proto::Host;
use corral_registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::announcer::Announcer;
use crate::api::{self, ApiState};
use crate::attach::AttachService;
use crate::executor::Executor;
use crate::ports::PortPool;
use crate::reconciler::Reconciler;
use crate::registration::{BackoffPolicy, ConnectionState, RegistrationClient, SchedulerLocator};
use crate::runner::Runner;
use crate::state::JobTable;

/// Resolves once `shutdown` flips to true or its sender is dropped.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

const WORKER_SHUTDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub stop_grace: Duration,
    pub job_retention: Duration,
    pub prune_period: Duration,
    pub attach_wait: Duration,
    /// Address job services are announced at.
    pub external_ip: String,
    pub backoff: BackoffPolicy,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            job_retention: Duration::from_secs(3600),
            prune_period: Duration::from_secs(30),
            attach_wait: Duration::from_secs(60),
            external_ip: "127.0.0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct Agent {
    runner: Arc<Runner>,
    attach: AttachService,
    registration: RegistrationClient,
    reconciler: Reconciler,
    announcer: Announcer,
    options: AgentOptions,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Agent {
    /// `template` describes the host; its port range bounds job ports.
    pub fn new(
        template: Host,
        executor: Arc<dyn Executor>,
        registry: Arc<dyn Registry>,
        locator: SchedulerLocator,
        options: AgentOptions,
    ) -> Result<Self> {
        let range = template
            .port_range
            .context("host advertisement has no port range")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let table = Arc::new(JobTable::new(template.id.clone()));
        let ports = Arc::new(PortPool::new(range));
        let runner = Arc::new(Runner::new(
            Arc::clone(&table),
            Arc::clone(&executor),
            ports,
            options.stop_grace,
        ));
        let attach = AttachService::new(
            Arc::clone(&table),
            executor,
            options.attach_wait,
            shutdown_rx.clone(),
        );

        let registration = RegistrationClient::new(template, Arc::clone(&runner), locator.clone())
            .with_backoff(options.backoff);
        let reconciler = Reconciler::new(&table, locator).with_backoff(options.backoff);
        let announcer = Announcer::new(table, registry, options.external_ip.clone());

        Ok(Self {
            runner,
            attach,
            registration,
            reconciler,
            announcer,
            options,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn table(&self) -> &Arc<JobTable> {
        self.runner.table()
    }

    /// Scheduler link state, updated while [`Agent::run`] is active.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.registration.subscribe()
    }

    pub fn router(&self) -> Router {
        api::router(ApiState {
            runner: Arc::clone(&self.runner),
            attach: self.attach.clone(),
            shutdown: self.shutdown_rx.clone(),
        })
    }

    /// Serves the API on `listener` and runs every worker until `stop` flips
    /// or the HTTP server fails.
    pub async fn run(self, listener: TcpListener, mut stop: watch::Receiver<bool>) -> Result<()> {
        let addr = listener.local_addr().context("reading listener address")?;
        info!(addr = %addr, host_id = %self.table().host_id(), "Host API listening");

        let app = self.router();
        let Agent {
            runner,
            registration,
            reconciler,
            announcer,
            options,
            shutdown_tx,
            shutdown_rx,
            ..
        } = self;

        let mut server = tokio::spawn({
            let mut shutdown = shutdown_rx.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                        info!("HTTP server shutting down");
                    })
                    .await
            }
        });

        let retention = chrono::Duration::from_std(options.job_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let workers: Vec<(&'static str, JoinHandle<()>)> = vec![
            ("registration", tokio::spawn(registration.run(shutdown_rx.clone()))),
            ("reconciler", tokio::spawn(reconciler.run(shutdown_rx.clone()))),
            ("announcer", tokio::spawn(announcer.run(shutdown_rx.clone()))),
            ("exit watcher", {
                let runner = Arc::clone(&runner);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { runner.watch_exits(shutdown).await })
            }),
            ("pruner", {
                let runner = Arc::clone(&runner);
                let shutdown = shutdown_rx.clone();
                let period = options.prune_period;
                tokio::spawn(async move { runner.run_pruner(period, retention, shutdown).await })
            }),
        ];

        let mut server_result = None;
        tokio::select! {
            _ = stopped(&mut stop) => info!("Host agent stopping"),
            result = &mut server => server_result = Some(result),
        }

        runner.stop_all().await;
        let _ = shutdown_tx.send(true);

        for (name, handle) in workers {
            if tokio::time::timeout(WORKER_SHUTDOWN, handle).await.is_err() {
                warn!(worker = name, "Worker did not shut down in time");
            }
        }

        let result = match server_result {
            Some(result) => result,
            None => match tokio::time::timeout(WORKER_SHUTDOWN, server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("HTTP server did not shut down in time");
                    return Ok(());
                }
            },
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "HTTP server failed");
                Err(e).context("serving host API")
            }
            Err(e) => Err(anyhow::anyhow!("HTTP server task panicked: {e}")),
        }
    }
}
