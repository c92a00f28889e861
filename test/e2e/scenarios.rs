//! End-to-end scenarios.
//!
//! A scheduler and one host agent run in-process: the scheduler serves its
//! RPC port, the agent registers over a real registration stream and runs
//! jobs on the mock executor, and attach goes through the host HTTP API.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p corral-e2e --test scenarios
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use corral_events::{Event, EventKind};
use corral_host::{
    Agent, AgentOptions, Attached, BackoffPolicy, ConnectionState, HostClient, JobTable,
    MockBehavior, MockExecutor, SchedulerLocator,
};
use corral_id::{HostId, JobId};
use corral_proto::attach::{AttachFlags, AttachReq, StreamId};
use corral_proto::{
    ClusterSnapshot, Host, HostJobs, Job, Operator, PortRange, RejectReason, ResourceValue, Rule,
    ScheduleRequest,
};
use corral_registry::MemoryRegistry;
use corral_scheduler::{serve, Scheduler, SchedulerClient, SchedulerOptions};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

struct Cluster {
    scheduler_addr: SocketAddr,
    host_url: String,
    table: Arc<JobTable>,
    mock: MockExecutor,
    creates: mpsc::UnboundedReceiver<Event>,
    _shutdown: watch::Sender<bool>,
}

fn hid(s: &str) -> HostId {
    HostId::parse(s).unwrap()
}

fn jid(s: &str) -> JobId {
    JobId::parse(s).unwrap()
}

fn job(id: &str, memory: i64) -> Job {
    Job::new(jid(id))
        .with_command(["worker"])
        .with_resource("memory", memory)
}

fn h1() -> Host {
    Host::new(hid("H1"))
        .with_resource("memory", ResourceValue::new(1024))
        .with_port_range(PortRange::new(40000, 40099).unwrap())
}

/// Starts a scheduler and registers `host` through a running agent.
async fn start(host: Host) -> Cluster {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();

    let (shutdown, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let scheduler_addr = listener.local_addr().unwrap();
    let scheduler = Arc::new(Scheduler::new(SchedulerOptions::default()));
    tokio::spawn(serve(listener, scheduler, shutdown_rx.clone()));

    let mock = MockExecutor::new();
    mock.set_default(MockBehavior::long_running());
    let options = AgentOptions {
        stop_grace: Duration::from_millis(200),
        backoff: BackoffPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(200),
            jitter: 0.0,
        },
        ..AgentOptions::default()
    };
    let agent = Agent::new(
        host,
        Arc::new(mock.clone()),
        Arc::new(MemoryRegistry::new()),
        SchedulerLocator::Static(scheduler_addr.to_string()),
        options,
    )
    .unwrap();
    let table = Arc::clone(agent.table());
    let creates = table.subscribe(None);
    let mut connection = agent.connection();

    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_url = format!("http://{}", http.local_addr().unwrap());
    tokio::spawn(agent.run(http, shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        connection.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("host did not register")
    .unwrap();
    tracing::info!(%scheduler_addr, %host_url, "Cluster started");

    Cluster {
        scheduler_addr,
        host_url,
        table,
        mock,
        creates,
        _shutdown: shutdown,
    }
}

impl Cluster {
    async fn client(&self) -> SchedulerClient {
        SchedulerClient::connect(self.scheduler_addr).await.unwrap()
    }

    async fn state(&self) -> ClusterSnapshot {
        self.client().await.state().await.unwrap()
    }

    /// Job ids of the next `n` create events, in arrival order.
    async fn received(&mut self, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        while ids.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(5), self.creates.recv())
                .await
                .expect("job not delivered")
                .unwrap();
            if event.kind == EventKind::Create {
                ids.push(event.job_id.to_string());
            }
        }
        ids
    }

    /// Asserts no further job arrives for a short while.
    async fn nothing_received(&mut self) {
        let waited = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match self.creates.recv().await {
                    Some(event) if event.kind == EventKind::Create => return event,
                    Some(_) => continue,
                    None => std::future::pending().await,
                }
            }
        })
        .await;
        assert!(waited.is_err(), "unexpected job {:?}", waited.map(|e| e.job_id));
    }
}

fn memory(state: &ClusterSnapshot) -> i64 {
    state.hosts[&hid("H1")].resources["memory"].value
}

#[tokio::test]
async fn e2e_batch_fits_and_jobs_arrive_in_order() {
    let mut cluster = start(h1()).await;

    let resp = cluster
        .client()
        .await
        .schedule(ScheduleRequest::atomic(
            HostJobs::new().with(hid("H1"), vec![job("J1", 512), job("J2", 256)]),
        ))
        .await
        .unwrap();
    assert!(resp.success);
    assert!(resp.remaining.is_empty());
    assert_eq!(memory(&resp.state), 256);
    assert_eq!(memory(&cluster.state().await), 256);

    assert_eq!(cluster.received(2).await, vec!["J1", "J2"]);
}

#[tokio::test]
async fn e2e_atomic_overflow_places_nothing() {
    let mut cluster = start(h1()).await;
    let before = cluster.state().await;

    let resp = cluster
        .client()
        .await
        .schedule(ScheduleRequest::atomic(
            HostJobs::new().with(hid("H1"), vec![job("J1", 512), job("J2", 600)]),
        ))
        .await
        .unwrap();
    assert!(!resp.success);

    let after = cluster.state().await;
    assert_eq!(after, before);
    assert_eq!(memory(&after), 1024);
    assert!(after.hosts[&hid("H1")].jobs.is_empty());
    cluster.nothing_received().await;
}

#[tokio::test]
async fn e2e_incremental_places_what_fits() {
    let mut cluster = start(h1()).await;

    let resp = cluster
        .client()
        .await
        .schedule(ScheduleRequest::incremental(HostJobs::new().with(
            hid("H1"),
            vec![job("J1", 512), job("J2", 600), job("J3", 256)],
        )))
        .await
        .unwrap();
    assert!(resp.success);
    let remaining: Vec<&str> = resp.remaining.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(remaining, vec!["J2"]);
    assert_eq!(memory(&cluster.state().await), 256);

    assert_eq!(cluster.received(2).await, vec!["J1", "J3"]);
}

#[tokio::test]
async fn e2e_rule_mismatch_rejects_job() {
    let host = h1().with_rule(Rule::new("env", Operator::Eq, "prod"));
    let mut cluster = start(host).await;

    let resp = cluster
        .client()
        .await
        .schedule(ScheduleRequest::atomic(HostJobs::new().with(
            hid("H1"),
            vec![job("J1", 64).with_attribute("env", "dev")],
        )))
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.rejections.len(), 1);
    assert_eq!(resp.rejections[0].job_id, jid("J1"));
    assert!(matches!(
        resp.rejections[0].reason,
        RejectReason::RuleMismatch { .. }
    ));
    cluster.nothing_received().await;
}

#[tokio::test]
async fn e2e_job_exit_frees_scheduler_resources() {
    let mut cluster = start(h1()).await;
    cluster.mock.script(
        &jid("J1"),
        MockBehavior::exits_with(7).after(Duration::from_millis(50)),
    );
    let mut events = cluster.table.subscribe(Some(jid("J1")));

    let resp = cluster
        .client()
        .await
        .schedule(ScheduleRequest::atomic(
            HostJobs::new().with(hid("H1"), vec![job("J1", 512)]),
        ))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(cluster.received(1).await, vec!["J1"]);

    let stop = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no stop event")
            .unwrap();
        if event.kind == EventKind::Stop {
            break event;
        }
    };
    assert_eq!(stop.job_id, jid("J1"));
    assert_eq!(stop.details.unwrap().exit_code, Some(7));

    for _ in 0..100 {
        let state = cluster.state().await;
        if memory(&state) == 1024 && state.hosts[&hid("H1")].jobs.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scheduler never released J1");
}

#[tokio::test]
async fn e2e_attach_before_start_gets_output() {
    let mut cluster = start(h1()).await;
    cluster.mock.script(
        &jid("J1"),
        MockBehavior::exits_with(0)
            .slow_start(Duration::from_millis(300))
            .prints(StreamId::Stdout, b"hello from J1\n")
            .after(Duration::from_millis(100)),
    );

    cluster
        .client()
        .await
        .schedule(ScheduleRequest::atomic(
            HostJobs::new().with(hid("H1"), vec![job("J1", 128)]),
        ))
        .await
        .unwrap();
    assert_eq!(cluster.received(1).await, vec!["J1"]);
    assert!(cluster
        .table
        .get(&jid("J1"))
        .is_some_and(|j| !j.is_terminal() && j.started_at.is_none()));

    let host = HostClient::new(cluster.host_url.as_str()).unwrap();
    let req = AttachReq::new(jid("J1"), AttachFlags::STDOUT | AttachFlags::STREAM);
    let attach = tokio::spawn(async move {
        match host.attach(&req).await.unwrap() {
            Attached::Session(session) => session.collect().await.unwrap(),
            Attached::WouldWait => panic!("attach must wait for a starting job"),
        }
    });

    for _ in 0..100 {
        if cluster.table.waiting_attachers(&jid("J1")) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let transcript = tokio::time::timeout(Duration::from_secs(5), attach)
        .await
        .expect("attach did not finish")
        .unwrap();
    assert_eq!(transcript.stdout, b"hello from J1\n");
    assert!(transcript.stderr.is_empty());
    assert_eq!(transcript.exit, Some(0));
}
