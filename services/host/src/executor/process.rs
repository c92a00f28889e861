//! Runs jobs as local child processes.
//!
//! The program is the first element of the job's command, or its image name
//! when the command is empty. TTY jobs get a pseudo-terminal whose master side
//! carries both output and input; other jobs get three pipes.

use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corral_id::Ulid;
use corral_proto::attach::StreamId;
use corral_proto::Job;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    container_env, AttachOptions, AttachStreams, ContainerEvent, ContainerStatus, EventFanout,
    Executor, OutputHub,
};
use crate::error::ExecutorError;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const READ_BUFFER: usize = 8 * 1024;
const STDIN_BUFFER: usize = 64;

nix::ioctl_write_ptr_bad!(set_winsize, libc::TIOCSWINSZ, Winsize);

#[derive(Default)]
struct RunState {
    pid: Option<Pid>,
    stdin: Option<mpsc::Sender<Bytes>>,
    pty: Option<Arc<std::fs::File>>,
    started: bool,
    exited: bool,
}

struct Container {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    tty: bool,
    hub: Arc<OutputHub>,
    run: Mutex<RunState>,
}

impl Container {
    fn run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Shared {
    containers: Mutex<HashMap<String, Arc<Container>>>,
    events: EventFanout,
}

/// [`Executor`] backed by local processes.
#[derive(Clone, Default)]
pub struct ProcessExecutor {
    shared: Arc<Shared>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn container(&self, container_id: &str) -> Result<Arc<Container>, ExecutorError> {
        self.shared
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container_id)
            .cloned()
            .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))
    }

    fn spawn_tty(&self, container: &Container) -> Result<(Child, TtyIo), ExecutorError> {
        let winsize = Winsize {
            ws_row: DEFAULT_ROWS,
            ws_col: DEFAULT_COLS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } =
            openpty(Some(&winsize), None).map_err(|e| ExecutorError::Start(e.to_string()))?;

        let mut cmd = command(container);
        cmd.stdin(stdio(&slave)?)
            .stdout(stdio(&slave)?)
            .stderr(Stdio::from(slave));
        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Start(format!("{}: {e}", container.program.display())))?;

        let master = std::fs::File::from(master);
        let reader = tokio::fs::File::from_std(master.try_clone()?);
        let writer = tokio::fs::File::from_std(master.try_clone()?);
        Ok((
            child,
            TtyIo {
                master: Arc::new(master),
                reader,
                writer,
            },
        ))
    }
}

struct TtyIo {
    master: Arc<std::fs::File>,
    reader: tokio::fs::File,
    writer: tokio::fs::File,
}

fn command(container: &Container) -> Command {
    let mut cmd = Command::new(&container.program);
    cmd.args(&container.args)
        .env_clear()
        .envs(&container.env)
        .kill_on_drop(false);
    if let Ok(path) = std::env::var("PATH") {
        if !container.env.contains_key("PATH") {
            cmd.env("PATH", path);
        }
    }
    cmd
}

fn stdio(fd: &OwnedFd) -> Result<Stdio, ExecutorError> {
    Ok(Stdio::from(fd.try_clone()?))
}

/// Finds the program a job runs.
fn resolve_program(job: &Job) -> Result<(PathBuf, Vec<String>), ExecutorError> {
    let (program, args) = match job.command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None if !job.container_image.is_empty() => (job.container_image.clone(), Vec::new()),
        None => {
            return Err(ExecutorError::ImageUnavailable(
                "job has neither a command nor an image".to_string(),
            ))
        }
    };

    let path = if program.contains('/') {
        let path = PathBuf::from(&program);
        is_executable(&path).then_some(path)
    } else {
        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(&program))
                .find(|candidate| is_executable(candidate))
        })
    };
    path.map(|p| (p, args))
        .ok_or_else(|| ExecutorError::ImageUnavailable(format!("{program}: not found")))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), status.signal())
}

/// Copies a reader into the hub until EOF or error. A PTY master reports EIO
/// once the slave side closes, which ends the copy like EOF.
fn pump<R>(mut reader: R, stream: StreamId, hub: Arc<OutputHub>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => hub.push(stream, Bytes::copy_from_slice(&buf[..n])),
            }
        }
    })
}

/// Feeds stdin from a channel. An empty chunk closes stdin.
fn feed<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if data.is_empty() {
                let _ = writer.shutdown().await;
                return;
            }
            if writer.write_all(&data).await.is_err() || writer.flush().await.is_err() {
                return;
            }
        }
    });
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn prepare(&self, job: &Job) -> Result<(), ExecutorError> {
        let (program, _) = resolve_program(job)?;
        debug!(job_id = %job.id, program = %program.display(), "Program resolved");
        Ok(())
    }

    async fn create(&self, job: &Job, ports: &[u16]) -> Result<String, ExecutorError> {
        let (program, args) = resolve_program(job)?;
        let container_id = Ulid::new().to_string().to_lowercase();
        let container = Container {
            program,
            args,
            env: container_env(job, ports),
            tty: job.tty,
            hub: Arc::new(OutputHub::new()),
            run: Mutex::new(RunState::default()),
        };
        self.shared
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container_id.clone(), Arc::new(container));
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> Result<(), ExecutorError> {
        let container = self.container(container_id)?;
        if container.run().started {
            return Err(ExecutorError::Start(format!(
                "container {container_id} already started"
            )));
        }

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_BUFFER);
        let (mut child, pumps, pty) = if container.tty {
            let (child, io) = self.spawn_tty(&container)?;
            let output = pump(io.reader, StreamId::Stdout, Arc::clone(&container.hub));
            feed(io.writer, stdin_rx);
            (child, vec![output], Some(io.master))
        } else {
            let mut child = command(&container)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| {
                    ExecutorError::Start(format!("{}: {e}", container.program.display()))
                })?;
            let mut pumps = Vec::new();
            if let Some(out) = child.stdout.take() {
                pumps.push(pump(out, StreamId::Stdout, Arc::clone(&container.hub)));
            }
            if let Some(err) = child.stderr.take() {
                pumps.push(pump(err, StreamId::Stderr, Arc::clone(&container.hub)));
            }
            if let Some(stdin) = child.stdin.take() {
                feed(stdin, stdin_rx);
            }
            (child, pumps, None)
        };

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);
        {
            let mut run = container.run();
            run.pid = pid;
            run.stdin = Some(stdin_tx);
            run.pty = pty;
            run.started = true;
        }
        info!(container_id, pid = ?pid.map(Pid::as_raw), "Container started");
        self.shared.events.publish(ContainerEvent {
            container_id: container_id.to_string(),
            status: ContainerStatus::Start,
        });

        let shared = Arc::clone(&self.shared);
        let cid = container_id.to_string();
        tokio::spawn(async move {
            let (exit_code, signal) = match child.wait().await {
                Ok(status) => exit_parts(status),
                Err(e) => {
                    warn!(container_id = %cid, error = %e, "Waiting for process failed");
                    (None, None)
                }
            };
            for handle in pumps {
                let _ = handle.await;
            }
            {
                let mut run = container.run();
                run.exited = true;
                run.stdin = None;
                run.pty = None;
            }
            container.hub.close();
            debug!(container_id = %cid, ?exit_code, ?signal, "Container exited");
            shared.events.publish(ContainerEvent {
                container_id: cid,
                status: ContainerStatus::Die { exit_code, signal },
            });
        });
        Ok(())
    }

    async fn attach(
        &self,
        container_id: &str,
        options: AttachOptions,
    ) -> Result<AttachStreams, ExecutorError> {
        let container = self.container(container_id)?;
        let stdin = if options.stdin {
            container.run().stdin.clone()
        } else {
            None
        };
        if let Some((cols, rows)) = options.size {
            self.resize(container_id, cols, rows).await?;
        }
        Ok(AttachStreams {
            output: container.hub.attach(options),
            stdin,
        })
    }

    async fn resize(&self, container_id: &str, cols: u16, rows: u16) -> Result<(), ExecutorError> {
        let container = self.container(container_id)?;
        let Some(master) = container.run().pty.clone() else {
            return Ok(());
        };
        let size = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: the descriptor stays open while `master` is held.
        unsafe { set_winsize(master.as_raw_fd(), &size) }
            .map_err(|e| ExecutorError::Io(std::io::Error::from(e)))?;
        Ok(())
    }

    async fn signal(&self, container_id: &str, signal: i32) -> Result<(), ExecutorError> {
        let container = self.container(container_id)?;
        let run = container.run();
        let pid = match (run.pid, run.exited) {
            (Some(pid), false) => pid,
            _ => {
                return Err(ExecutorError::Signal(format!(
                    "container {container_id} is not running"
                )))
            }
        };
        let signal = Signal::try_from(signal).map_err(|e| ExecutorError::Signal(e.to_string()))?;
        kill(pid, signal).map_err(|e| ExecutorError::Signal(e.to_string()))
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), ExecutorError> {
        self.signal(container_id, libc::SIGTERM).await?;

        let this = self.clone();
        let cid = container_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let alive = match this.container(&cid) {
                Ok(c) => {
                    let exited = c.run().exited;
                    !exited
                }
                Err(_) => false,
            };
            if alive {
                warn!(container_id = %cid, grace_secs = grace.as_secs(), "Grace period expired, killing");
                if let Err(e) = this.signal(&cid, libc::SIGKILL).await {
                    debug!(container_id = %cid, error = %e, "Kill after grace failed");
                }
            }
        });
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), ExecutorError> {
        self.shared
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ContainerEvent> {
        self.shared.events.subscribe()
    }
}
