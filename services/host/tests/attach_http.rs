//! Attach over a real HTTP upgrade, through `HostClient`.

mod common;

use corral_events::EventKind;
use corral_host::{Attached, HostClient, HostClientError, MockBehavior};
use corral_proto::attach::{AttachFlags, AttachFrame, AttachReq, StreamId};
use futures::{SinkExt, StreamExt};

use common::{eventually, jid, job, stack};

fn all_output() -> AttachFlags {
    AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::LOGS | AttachFlags::STREAM
}

#[tokio::test]
async fn test_waiting_attach_sees_all_output_and_exit() {
    let stack = stack();
    let client = HostClient::new(format!("http://{}", stack.serve().await)).unwrap();
    stack.mock.script(
        &jid("j1"),
        MockBehavior::exits_with(7)
            .prints(StreamId::Stdout, b"hello ")
            .prints(StreamId::Stderr, b"oops")
            .after(std::time::Duration::from_millis(50)),
    );

    let attach = tokio::spawn({
        let client = client.clone();
        async move {
            let req = AttachReq::new(jid("j1"), all_output());
            match client.attach(&req).await.unwrap() {
                Attached::Session(session) => session.collect().await.unwrap(),
                Attached::WouldWait => panic!("attach should wait"),
            }
        }
    });
    eventually(|| stack.runner.table().waiting_attachers(&jid("j1")) == 1).await;
    stack.runner.accept(job("j1")).unwrap();

    let transcript = attach.await.unwrap();
    assert_eq!(transcript.stdout, b"hello ");
    assert_eq!(transcript.stderr, b"oops");
    assert_eq!(transcript.exit, Some(7));
}

#[tokio::test]
async fn test_no_wait_answers_would_wait() {
    let stack = stack();
    let client = HostClient::new(format!("http://{}", stack.serve().await)).unwrap();
    let mut req = AttachReq::new(jid("ghost"), all_output());
    req.wait = false;
    assert!(matches!(
        client.attach(&req).await.unwrap(),
        Attached::WouldWait
    ));
}

#[tokio::test]
async fn test_failed_job_refuses_waiting_attach() {
    let stack = stack();
    let client = HostClient::new(format!("http://{}", stack.serve().await)).unwrap();
    stack
        .mock
        .script(&jid("bad"), MockBehavior::fails_prepare("no such image"));

    let attach = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .attach(&AttachReq::new(jid("bad"), all_output()))
                .await
        }
    });
    eventually(|| stack.runner.table().waiting_attachers(&jid("bad")) == 1).await;
    stack.runner.accept(job("bad")).unwrap();

    match attach.await.unwrap() {
        Err(HostClientError::Refused(msg)) => assert!(msg.contains("no such image"), "{msg}"),
        Ok(_) => panic!("attach to a failed job succeeded"),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[tokio::test]
async fn test_stdin_and_signal_frames() {
    let stack = stack();
    let client = HostClient::new(format!("http://{}", stack.serve().await)).unwrap();
    stack
        .mock
        .script(&jid("j1"), MockBehavior::long_running().echoing());
    stack.runner.accept(job("j1")).unwrap();
    eventually(|| stack.mock.container_id(&jid("j1")).is_some()).await;

    let req = AttachReq::new(
        jid("j1"),
        AttachFlags::STDIN | AttachFlags::STDOUT | AttachFlags::STREAM,
    );
    let Attached::Session(session) = client.attach(&req).await.unwrap() else {
        panic!("job is running");
    };
    let mut framed = session.framed();

    framed
        .send(AttachFrame::Data {
            stream: StreamId::Stdin,
            data: "ping".into(),
        })
        .await
        .unwrap();
    match framed.next().await.unwrap().unwrap() {
        AttachFrame::Data { stream, data } => {
            assert_eq!(stream, StreamId::Stdout);
            assert_eq!(&data[..], b"ping");
        }
        other => panic!("unexpected frame {other:?}"),
    }

    framed.send(AttachFrame::close_stdin()).await.unwrap();
    eventually(|| stack.mock.stdin_closed(&jid("j1"))).await;

    framed
        .send(AttachFrame::Signal(libc::SIGTERM as u32))
        .await
        .unwrap();
    let mut exit = None;
    while let Some(frame) = framed.next().await {
        if let AttachFrame::Exit(code) = frame.unwrap() {
            exit = Some(code);
        }
    }
    assert_eq!(exit, Some(128 + libc::SIGTERM));
    assert_eq!(stack.mock.stdin(&jid("j1")), b"ping");
}

#[tokio::test]
async fn test_event_stream_and_stop_through_client() {
    let stack = stack();
    let client = HostClient::new(format!("http://{}", stack.serve().await)).unwrap();
    stack.runner.accept(job("j1")).unwrap();
    eventually(|| stack.mock.container_id(&jid("j1")).is_some()).await;

    let mut events = client.job_events(&jid("j1")).await.unwrap();
    assert_eq!(events.next_event().await.unwrap().unwrap().kind, EventKind::Create);
    assert_eq!(events.next_event().await.unwrap().unwrap().kind, EventKind::Start);

    let stopped = client.stop_job(&jid("j1")).await.unwrap();
    assert_eq!(stopped.job.id, jid("j1"));

    let last = events.next_event().await.unwrap().unwrap();
    assert_eq!(last.kind, EventKind::Stop);
    assert!(events.next_event().await.unwrap().is_none());

    match client.get_job(&jid("missing")).await {
        Err(HostClientError::Api { status, problem }) => {
            assert_eq!(status, 404);
            assert_eq!(problem.code, "job_not_found");
        }
        other => panic!("unexpected result {:?}", other.map(|j| j.job.id)),
    }
}
