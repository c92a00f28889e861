//! Scheduler RPC over a real TCP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use corral_id::{HostId, JobId};
use corral_proto::{Host, HostJobs, Job, ResourceValue, RpcErrorKind, ScheduleRequest};
use corral_scheduler::{serve, ClientError, Scheduler, SchedulerClient, SchedulerOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;

struct TestServer {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn start() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(SchedulerOptions::default()));
    tokio::spawn(serve(listener, scheduler, rx));
    TestServer {
        addr,
        _shutdown: shutdown,
    }
}

fn hid(s: &str) -> HostId {
    HostId::parse(s).unwrap()
}

fn job(id: &str, memory: i64) -> Job {
    Job::new(JobId::parse(id).unwrap()).with_resource("memory", memory)
}

fn h1() -> Host {
    Host::new(hid("h1")).with_resource("memory", ResourceValue::new(1024))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_register_schedule_and_receive_in_order() {
    let server = start().await;
    let mut host = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(h1())
        .await
        .unwrap();
    assert_eq!(host.host_id(), &hid("h1"));

    let mut client = SchedulerClient::connect(server.addr).await.unwrap();
    let resp = client
        .schedule(ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 512), job("j2", 256)]),
        ))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.state.hosts[&hid("h1")].resources["memory"].value, 256);

    assert_eq!(host.next_job().await.unwrap().unwrap().id.as_str(), "j1");
    assert_eq!(host.next_job().await.unwrap().unwrap().id.as_str(), "j2");

    let state = client.state().await.unwrap();
    assert_eq!(state.job_count(), 2);
}

#[tokio::test]
async fn test_duplicate_registration_is_refused() {
    let server = start().await;
    let _first = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(h1())
        .await
        .unwrap();

    let second = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(h1())
        .await;
    match second {
        Err(ClientError::Rpc(e)) => assert_eq!(e.kind, RpcErrorKind::DuplicateRegistration),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second registration accepted"),
    }
}

#[tokio::test]
async fn test_disconnect_removes_host_and_reconnect_restores_advertisement() {
    let server = start().await;
    let host = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(h1())
        .await
        .unwrap();

    let mut client = SchedulerClient::connect(server.addr).await.unwrap();
    client
        .schedule(ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 512)]),
        ))
        .await
        .unwrap();

    drop(host);
    eventually(|| {
        let addr = server.addr;
        async move {
            let mut c = SchedulerClient::connect(addr).await.unwrap();
            c.state().await.unwrap().hosts.is_empty()
        }
    })
    .await;

    let mut advertised = h1();
    advertised.jobs.push(job("j1", 512));
    let _host = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(advertised.clone())
        .await
        .unwrap();

    let state = client.state().await.unwrap();
    let seen = &state.hosts[&hid("h1")];
    assert_eq!(seen.jobs, advertised.jobs);
    assert_eq!(seen.resources["memory"].value, 512);
}

#[tokio::test]
async fn test_remove_jobs_acknowledged() {
    let server = start().await;
    let _host = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(h1())
        .await
        .unwrap();

    let mut client = SchedulerClient::connect(server.addr).await.unwrap();
    client
        .schedule(ScheduleRequest::incremental(
            HostJobs::new().with(hid("h1"), vec![job("j1", 512)]),
        ))
        .await
        .unwrap();
    client
        .remove_jobs(hid("h1"), vec![JobId::parse("j1").unwrap()])
        .await
        .unwrap();
    client
        .remove_jobs(hid("h1"), vec![JobId::parse("j1").unwrap()])
        .await
        .unwrap();

    let state = client.state().await.unwrap();
    assert_eq!(state.hosts[&hid("h1")].resources["memory"].value, 1024);
}

#[tokio::test]
async fn test_stream_state_follows_commits() {
    let server = start().await;
    let mut stream = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .stream_state()
        .await
        .unwrap();
    let initial = stream.next().await.unwrap().unwrap();
    assert!(initial.hosts.is_empty());

    let _host = SchedulerClient::connect(server.addr)
        .await
        .unwrap()
        .register_host(h1())
        .await
        .unwrap();

    let next = stream.next().await.unwrap().unwrap();
    assert!(next.hosts.contains_key(&hid("h1")));
}
