//! Shared fixtures: a host stack backed by the mock executor.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use corral_host::api::{self, ApiState};
use corral_host::{AttachService, JobTable, MockExecutor, PortPool, Runner};
use corral_id::{HostId, JobId};
use corral_proto::{Job, PortRange};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct Stack {
    pub runner: Arc<Runner>,
    pub mock: MockExecutor,
    pub router: Router,
    pub shutdown: watch::Sender<bool>,
}

pub fn stack() -> Stack {
    let mock = MockExecutor::new();
    let table = Arc::new(JobTable::new(HostId::parse("h1").unwrap()));
    let ports = Arc::new(PortPool::new(PortRange::new(6000, 6009).unwrap()));
    let runner = Arc::new(Runner::new(
        Arc::clone(&table),
        Arc::new(mock.clone()),
        ports,
        Duration::from_millis(200),
    ));
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn({
        let runner = Arc::clone(&runner);
        let rx = rx.clone();
        async move { runner.watch_exits(rx).await }
    });
    let attach = AttachService::new(table, Arc::new(mock.clone()), Duration::from_secs(5), rx.clone());
    let router = api::router(ApiState {
        runner: Arc::clone(&runner),
        attach,
        shutdown: rx,
    });
    Stack {
        runner,
        mock,
        router,
        shutdown,
    }
}

impl Stack {
    /// Serves the API on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

pub fn jid(s: &str) -> JobId {
    JobId::parse(s).unwrap()
}

pub fn job(id: &str) -> Job {
    Job::new(jid(id)).with_command(["app"])
}

pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}
