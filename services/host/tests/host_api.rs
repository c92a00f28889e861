//! Host HTTP API driven through the router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use corral_events::{Event, EventKind, JobStatus};
use corral_host::MockBehavior;
use tower::ServiceExt;

use common::{eventually, jid, job, stack};

async fn call(router: &axum::Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let stack = stack();
    let (status, body) = call(&stack.router, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["service"], "corral-host");
}

#[tokio::test]
async fn test_get_running_job() {
    let stack = stack();
    stack.runner.accept(job("j1").with_tcp_ports(2)).unwrap();
    eventually(|| {
        stack
            .runner
            .table()
            .get(&jid("j1"))
            .is_some_and(|j| j.status == JobStatus::Running)
    })
    .await;

    let (status, body) = call(&stack.router, "GET", "/host/jobs/j1").await;
    assert_eq!(status, StatusCode::OK);
    let job = json(&body);
    assert_eq!(job["status"], "running");
    assert_eq!(job["allocated_ports"].as_array().unwrap().len(), 2);

    let (status, body) = call(&stack.router, "GET", "/host/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body).as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_job_is_problem_json() {
    let stack = stack();
    let response = stack
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/host/jobs/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers()["content-type"],
        "application/problem+json"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let problem = json(&body);
    assert_eq!(problem["code"], "job_not_found");
    assert_eq!(problem["status"], 404);
}

#[tokio::test]
async fn test_stop_then_stop_again() {
    let stack = stack();
    stack.runner.accept(job("j1")).unwrap();
    eventually(|| stack.mock.container_id(&jid("j1")).is_some()).await;
    eventually(|| {
        stack
            .runner
            .table()
            .get(&jid("j1"))
            .is_some_and(|j| j.status == JobStatus::Running)
    })
    .await;

    let (status, _) = call(&stack.router, "POST", "/host/jobs/j1/stop").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    eventually(|| {
        stack
            .runner
            .table()
            .get(&jid("j1"))
            .is_some_and(|j| j.is_terminal())
    })
    .await;
    assert_eq!(stack.mock.signals(&jid("j1")), vec![libc::SIGTERM]);

    let (status, body) = call(&stack.router, "POST", "/host/jobs/j1/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["signal"], libc::SIGTERM);
}

#[tokio::test]
async fn test_resize_requires_running_job() {
    let stack = stack();
    stack.runner.accept(job("t1").with_tty(true)).unwrap();
    eventually(|| {
        stack
            .runner
            .table()
            .get(&jid("t1"))
            .is_some_and(|j| j.status == JobStatus::Running)
    })
    .await;

    let (status, _) = call(&stack.router, "POST", "/host/jobs/t1/resize?cols=120&rows=40").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(stack.mock.sizes(&jid("t1")), vec![(120, 40)]);

    stack.mock.exit(&jid("t1"), Some(0), None);
    eventually(|| {
        stack
            .runner
            .table()
            .get(&jid("t1"))
            .is_some_and(|j| j.is_terminal())
    })
    .await;
    let (status, body) = call(&stack.router, "POST", "/host/jobs/t1/resize?cols=1&rows=1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json(&body)["code"], "job_not_running");
}

#[tokio::test]
async fn test_job_events_end_at_exit() {
    let stack = stack();
    stack
        .mock
        .script(&jid("j1"), MockBehavior::exits_with(3));
    stack.runner.accept(job("j1")).unwrap();

    let (status, body) = call(&stack.router, "GET", "/host/jobs/j1/events").await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<Event> = String::from_utf8(body)
        .unwrap()
        .lines()
        .map(|line| Event::from_ndjson(line).unwrap())
        .collect();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Create, EventKind::Start, EventKind::Stop]);
    assert_eq!(events[2].status(), JobStatus::Crashed);
}

#[tokio::test]
async fn test_attach_requires_upgrade() {
    let stack = stack();
    let response = stack
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/host/attach")
                .body(Body::from(r#"{"job_id":"j1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
