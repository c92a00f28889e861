//! Attach sessions.
//!
//! A session runs on the upgraded connection of `POST /host/attach`. The
//! client's [`AttachReq`] has already been read; the session answers with a
//! status byte, waits for the job to start if needed, and then relays output
//! and input until the process exits, the client leaves or the agent shuts
//! down.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use corral_events::EventKind;
use corral_id::JobId;
use corral_proto::attach::{status, AttachCodec, AttachFlags, AttachFrame, AttachReq, StreamId};
use corral_proto::ActiveJob;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Encoder, Framed};
use tracing::{debug, info, warn};

use crate::agent::stopped;
use crate::error::AttachError;
use crate::executor::{AttachOptions, Executor, OutputChunk};
use crate::state::{AttachSlot, Handoff, JobTable};

/// How long a finished stream waits for the exit to be recorded.
const EXIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AttachService {
    table: Arc<JobTable>,
    executor: Arc<dyn Executor>,
    wait_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

/// A job ready to be attached to.
struct Target {
    job: ActiveJob,
    container_id: String,
    options: AttachOptions,
}

impl AttachService {
    pub fn new(
        table: Arc<JobTable>,
        executor: Arc<dyn Executor>,
        wait_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            table,
            executor,
            wait_timeout,
            shutdown,
        }
    }

    /// Runs one session to completion. Failures before `success` reach the
    /// client as an error frame.
    pub async fn serve<S>(&self, req: AttachReq, mut io: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let job_id = req.job_id.clone();
        let mut began = false;
        match self.session(req, &mut io, &mut began).await {
            Ok(()) => debug!(job_id = %job_id, "Attach session ended"),
            Err(e) if began => debug!(job_id = %job_id, error = %e, "Attach session aborted"),
            Err(e) => {
                info!(job_id = %job_id, error = %e, "Attach refused");
                let mut buf = BytesMut::new();
                if AttachCodec
                    .encode(AttachFrame::Error(e.to_string()), &mut buf)
                    .is_ok()
                {
                    let _ = io.write_all(&buf).await;
                }
            }
        }
        let _ = io.shutdown().await;
    }

    async fn session<S>(
        &self,
        req: AttachReq,
        io: &mut S,
        began: &mut bool,
    ) -> Result<(), AttachError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let flags = req.effective_flags();
        let (job, was_waiting) = match self.table.add_attacher(&req.job_id) {
            AttachSlot::Ready(job) => (job, false),
            AttachSlot::Waiting(_) if !req.wait => {
                *began = true;
                io.write_all(&[status::WOULD_WAIT]).await?;
                io.flush().await?;
                return Ok(());
            }
            AttachSlot::Waiting(rx) => {
                io.write_all(&[status::WAITING]).await?;
                io.flush().await?;
                debug!(job_id = %req.job_id, "Attach waiting for job to start");
                (self.wait_for_start(&req.job_id, rx).await?, true)
            }
        };

        let target = self.target(job, flags, was_waiting)?;
        // Waiters are handed over after start, so the size applies to a live
        // container.
        if let (true, Some((cols, rows))) = (target.job.job.tty, req.size()) {
            self.executor.resize(&target.container_id, cols, rows).await?;
        }
        let streams = self
            .executor
            .attach(&target.container_id, target.options)
            .await?;

        *began = true;
        io.write_all(&[status::SUCCESS]).await?;
        io.flush().await?;
        info!(
            job_id = %req.job_id,
            tty = target.job.job.tty,
            flags = flags.bits(),
            "Attach session started"
        );

        if target.job.job.tty {
            self.relay_raw(io, &target, streams.output, streams.stdin).await
        } else {
            self.relay_framed(io, &target, streams.output, streams.stdin).await
        }
    }

    async fn wait_for_start(
        &self,
        job_id: &JobId,
        rx: oneshot::Receiver<Handoff>,
    ) -> Result<ActiveJob, AttachError> {
        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            handoff = tokio::time::timeout(self.wait_timeout, rx) => match handoff {
                Err(_) => Err(AttachError::Timeout(job_id.clone())),
                Ok(Err(_)) => Err(AttachError::NotFound(job_id.clone())),
                Ok(Ok(Ok(job))) => Ok(job),
                Ok(Ok(Err(reason))) => Err(AttachError::Failed(job_id.clone(), reason)),
            },
            _ = stopped(&mut shutdown) => Err(AttachError::NotRunning(job_id.clone())),
        };
        if result.is_err() {
            self.table.release_attachers(job_id);
        }
        result
    }

    /// Decides what the attach delivers. A client that waited always gets
    /// the output produced since start. A finished job can only be replayed.
    fn target(
        &self,
        job: ActiveJob,
        flags: AttachFlags,
        was_waiting: bool,
    ) -> Result<Target, AttachError> {
        let terminal = job.is_terminal();
        if terminal && !flags.contains(AttachFlags::LOGS) && !was_waiting {
            return Err(AttachError::NotRunning(job.job.id.clone()));
        }
        let container_id = job
            .container_id
            .clone()
            .ok_or_else(|| AttachError::NotRunning(job.job.id.clone()))?;
        let options = AttachOptions {
            stdin: flags.contains(AttachFlags::STDIN) && !terminal,
            stdout: flags.wants(StreamId::Stdout),
            stderr: flags.wants(StreamId::Stderr),
            logs: flags.contains(AttachFlags::LOGS) || was_waiting,
            stream: flags.contains(AttachFlags::STREAM) && !terminal,
            size: None,
        };
        Ok(Target {
            job,
            container_id,
            options,
        })
    }

    async fn relay_framed<S>(
        &self,
        io: &mut S,
        target: &Target,
        mut output: mpsc::Receiver<OutputChunk>,
        mut stdin: Option<mpsc::Sender<Bytes>>,
    ) -> Result<(), AttachError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(io, AttachCodec);
        let mut shutdown = self.shutdown.clone();
        let mut client_open = true;

        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => {
                        framed
                            .send(AttachFrame::Data { stream: chunk.stream, data: chunk.data })
                            .await?;
                    }
                    None => break,
                },
                frame = framed.next(), if client_open => match frame {
                    Some(Ok(frame)) => self.client_frame(target, frame, &mut stdin).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => client_open = false,
                },
                _ = stopped(&mut shutdown) => return Ok(()),
            }
        }

        if target.options.stream {
            if let Some(code) = self.exit_code(target.job.id()).await {
                framed.send(AttachFrame::Exit(code)).await?;
            }
        }
        Ok(())
    }

    async fn client_frame(
        &self,
        target: &Target,
        frame: AttachFrame,
        stdin: &mut Option<mpsc::Sender<Bytes>>,
    ) -> Result<(), AttachError> {
        match frame {
            AttachFrame::Data {
                stream: StreamId::Stdin,
                data,
            } => {
                let close = data.is_empty();
                if let Some(tx) = stdin.as_ref() {
                    let _ = tx.send(data).await;
                }
                if close {
                    *stdin = None;
                }
            }
            AttachFrame::Signal(signo) => {
                let signo = i32::try_from(signo)
                    .map_err(|_| AttachError::BadRequest(format!("signal {signo}")))?;
                debug!(job_id = %target.job.id(), signo, "Forwarding signal");
                if let Err(e) = self.executor.signal(&target.container_id, signo).await {
                    warn!(job_id = %target.job.id(), error = %e, "Signal from attach failed");
                }
            }
            AttachFrame::Resize { cols, rows } => {
                self.executor
                    .resize(&target.container_id, cols, rows)
                    .await?;
            }
            other => {
                return Err(AttachError::BadRequest(format!(
                    "unexpected frame from client: {other:?}"
                )))
            }
        }
        Ok(())
    }

    async fn relay_raw<S>(
        &self,
        io: &mut S,
        target: &Target,
        mut output: mpsc::Receiver<OutputChunk>,
        mut stdin: Option<mpsc::Sender<Bytes>>,
    ) -> Result<(), AttachError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; 8 * 1024];
        let mut client_open = true;

        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => {
                        writer.write_all(&chunk.data).await?;
                        writer.flush().await?;
                    }
                    None => break,
                },
                read = reader.read(&mut buf), if client_open => match read? {
                    0 => {
                        client_open = false;
                        if let Some(tx) = stdin.take() {
                            let _ = tx.send(Bytes::new()).await;
                        }
                    }
                    n => {
                        if let Some(tx) = stdin.as_ref() {
                            let _ = tx.send(Bytes::copy_from_slice(&buf[..n])).await;
                        }
                    }
                },
                _ = stopped(&mut shutdown) => break,
            }
        }
        debug!(job_id = %target.job.id(), "Raw attach finished");
        Ok(())
    }

    /// Exit code to report once output ended: the process's code, or
    /// `128 + signal` when it was killed.
    async fn exit_code(&self, job_id: &JobId) -> Option<i32> {
        let (history, mut rx) = self.table.subscribe_job(job_id).ok()?;
        let finished = |kind: EventKind| matches!(kind, EventKind::Stop | EventKind::Error);
        if !history.iter().any(|e| finished(e.kind)) {
            let wait = async {
                while let Some(event) = rx.recv().await {
                    if finished(event.kind) {
                        return;
                    }
                }
            };
            if tokio::time::timeout(EXIT_WAIT, wait).await.is_err() {
                warn!(job_id = %job_id, "Output ended but no exit was recorded");
                return None;
            }
        }
        let job = self.table.get(job_id)?;
        Some(match (job.exit_code, job.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockBehavior, MockExecutor};
    use corral_id::HostId;
    use corral_proto::Job;
    use tokio::io::DuplexStream;

    struct Fixture {
        table: Arc<JobTable>,
        mock: MockExecutor,
        service: AttachService,
        shutdown: watch::Sender<bool>,
    }

    fn fixture(wait: Duration) -> Fixture {
        let table = Arc::new(JobTable::new(HostId::parse("h1").unwrap()));
        let mock = MockExecutor::new();
        let (tx, rx) = watch::channel(false);
        let service = AttachService::new(Arc::clone(&table), Arc::new(mock.clone()), wait, rx);
        Fixture {
            table,
            mock,
            service,
            shutdown: tx,
        }
    }

    fn jid(s: &str) -> JobId {
        JobId::parse(s).unwrap()
    }

    async fn start(f: &Fixture, job: Job) {
        let id = job.id.clone();
        f.table.add_job(job.clone()).unwrap();
        let cid = f.mock.create(&job, &[]).await.unwrap();
        f.table.set_container_id(&id, &cid).unwrap();
        f.mock.start(&cid).await.unwrap();
        f.table.set_running(&id).unwrap();
    }

    fn open(f: &Fixture, req: AttachReq) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let service = f.service.clone();
        tokio::spawn(async move { service.serve(req, server).await });
        client
    }

    async fn read_status(client: &mut DuplexStream) -> u8 {
        client.read_u8().await.unwrap()
    }

    #[tokio::test]
    async fn test_timed_out_wait_leaves_no_wait_list() {
        let f = fixture(Duration::from_millis(50));
        let mut client = open(&f, AttachReq::new(jid("never"), AttachFlags::STDOUT));
        assert_eq!(read_status(&mut client).await, status::WAITING);
        assert_eq!(read_status(&mut client).await, status::ERROR);
        assert_eq!(f.table.attach_wait_lists(), 0);
    }

    #[tokio::test]
    async fn test_waiting_tty_attach_resizes_once_after_start() {
        let f = fixture(Duration::from_secs(1));
        let mut req = AttachReq::new(
            jid("t1"),
            AttachFlags::STDIN | AttachFlags::STDOUT | AttachFlags::STREAM,
        );
        req.width = 80;
        req.height = 24;
        let mut client = open(&f, req);
        assert_eq!(read_status(&mut client).await, status::WAITING);

        start(&f, Job::new(jid("t1")).with_tty(true)).await;
        assert_eq!(read_status(&mut client).await, status::SUCCESS);
        assert_eq!(f.mock.sizes(&jid("t1")), vec![(80, 24)]);
    }

    #[tokio::test]
    async fn test_shutdown_ends_streaming_session() {
        let f = fixture(Duration::from_secs(1));
        start(&f, Job::new(jid("j1"))).await;
        let mut client = open(
            &f,
            AttachReq::new(jid("j1"), AttachFlags::STDOUT | AttachFlags::STREAM),
        );
        assert_eq!(read_status(&mut client).await, status::SUCCESS);

        f.shutdown.send(true).unwrap();
        let mut framed = Framed::new(client, AttachCodec);
        let end = tokio::time::timeout(Duration::from_secs(2), framed.next()).await;
        assert!(matches!(end, Ok(None)));
    }

    #[tokio::test]
    async fn test_logs_without_stream_replays_and_closes() {
        let f = fixture(Duration::from_secs(1));
        let job = Job::new(jid("j1"));
        f.mock.script(
            &job.id,
            MockBehavior::long_running().prints(StreamId::Stdout, b"history"),
        );
        start(&f, job).await;

        let mut client = open(
            &f,
            AttachReq::new(jid("j1"), AttachFlags::STDOUT | AttachFlags::LOGS),
        );
        assert_eq!(read_status(&mut client).await, status::SUCCESS);

        let mut framed = Framed::new(client, AttachCodec);
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            AttachFrame::stdout(&b"history"[..])
        );
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_follows_until_exit() {
        let f = fixture(Duration::from_secs(1));
        start(&f, Job::new(jid("j1"))).await;

        let mut client = open(
            &f,
            AttachReq::new(
                jid("j1"),
                AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::STREAM,
            ),
        );
        assert_eq!(read_status(&mut client).await, status::SUCCESS);
        let mut framed = Framed::new(client, AttachCodec);

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.mock.write(&jid("j1"), StreamId::Stderr, b"live");
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            AttachFrame::stderr(&b"live"[..])
        );

        let id = jid("j1");
        assert!(f.mock.exit(&id, Some(4), None));
        f.table.set_exited(&id, Some(4), None).unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), AttachFrame::Exit(4));
    }

    #[tokio::test]
    async fn test_waiting_client_gets_output_since_start() {
        let f = fixture(Duration::from_secs(5));
        let mut client = open(
            &f,
            AttachReq::new(jid("j1"), AttachFlags::STDOUT | AttachFlags::STREAM),
        );
        assert_eq!(read_status(&mut client).await, status::WAITING);

        let job = Job::new(jid("j1"));
        f.mock.script(
            &job.id,
            MockBehavior::long_running().prints(StreamId::Stdout, b"boot"),
        );
        start(&f, job).await;

        assert_eq!(read_status(&mut client).await, status::SUCCESS);
        let mut framed = Framed::new(client, AttachCodec);
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            AttachFrame::stdout(&b"boot"[..])
        );
    }

    #[tokio::test]
    async fn test_would_wait_without_wait_flag() {
        let f = fixture(Duration::from_secs(1));
        let mut req = AttachReq::new(jid("ghost"), AttachFlags::STDOUT);
        req.wait = false;
        let mut client = open(&f, req);
        assert_eq!(read_status(&mut client).await, status::WOULD_WAIT);
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_error() {
        let f = fixture(Duration::from_millis(30));
        let mut client = open(&f, AttachReq::new(jid("ghost"), AttachFlags::STDOUT));
        assert_eq!(read_status(&mut client).await, status::WAITING);

        let mut framed = Framed::new(client, AttachCodec);
        match framed.next().await.unwrap().unwrap() {
            AttachFrame::Error(msg) => assert!(msg.contains("did not start"), "{msg}"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_failure_reaches_waiting_client() {
        let f = fixture(Duration::from_secs(5));
        let mut client = open(&f, AttachReq::new(jid("j1"), AttachFlags::STDOUT));
        assert_eq!(read_status(&mut client).await, status::WAITING);

        f.table.add_job(Job::new(jid("j1"))).unwrap();
        f.table.set_failed(&jid("j1"), "image missing").unwrap();

        let mut framed = Framed::new(client, AttachCodec);
        match framed.next().await.unwrap().unwrap() {
            AttachFrame::Error(msg) => assert!(msg.contains("image missing"), "{msg}"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finished_job_without_logs_is_refused() {
        let f = fixture(Duration::from_secs(1));
        start(&f, Job::new(jid("j1"))).await;
        f.table.set_exited(&jid("j1"), Some(0), None).unwrap();

        let client = open(&f, AttachReq::new(jid("j1"), AttachFlags::STDOUT));
        let mut framed = Framed::new(client, AttachCodec);
        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            AttachFrame::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_stdin_and_signal_frames_reach_the_process() {
        let f = fixture(Duration::from_secs(1));
        let job = Job::new(jid("j1"));
        f.mock.script(&job.id, MockBehavior::long_running().ignoring_term());
        start(&f, job).await;

        let mut client = open(
            &f,
            AttachReq::new(
                jid("j1"),
                AttachFlags::STDIN | AttachFlags::STDOUT | AttachFlags::STREAM,
            ),
        );
        assert_eq!(read_status(&mut client).await, status::SUCCESS);
        let mut framed = Framed::new(client, AttachCodec);
        framed
            .send(AttachFrame::Data {
                stream: StreamId::Stdin,
                data: Bytes::from_static(b"input"),
            })
            .await
            .unwrap();
        framed.send(AttachFrame::close_stdin()).await.unwrap();
        framed.send(AttachFrame::Signal(libc::SIGHUP as u32)).await.unwrap();

        for _ in 0..50 {
            if f.mock.stdin_closed(&jid("j1")) && !f.mock.signals(&jid("j1")).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.mock.stdin(&jid("j1")), b"input");
        assert!(f.mock.stdin_closed(&jid("j1")));
        assert_eq!(f.mock.signals(&jid("j1")), vec![libc::SIGHUP]);
    }
}
