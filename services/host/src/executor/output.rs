//! Buffered output of one container.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use corral_proto::attach::StreamId;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::AttachOptions;

/// Bytes of output kept for replay per container.
pub const HISTORY_LIMIT: usize = 1024 * 1024;

const LIVE_CAPACITY: usize = 1024;
const ATTACH_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamId,
    pub data: Bytes,
}

struct HubInner {
    history: VecDeque<OutputChunk>,
    history_len: usize,
    live: Option<broadcast::Sender<OutputChunk>>,
}

/// Keeps the most recent output of a container and fans live output out to
/// attached clients. Replay and subscription are taken under one lock so an
/// attach with `logs` and `stream` sees every chunk exactly once.
pub struct OutputHub {
    inner: Mutex<HubInner>,
}

impl Default for OutputHub {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputHub {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: Mutex::new(HubInner {
                history: VecDeque::new(),
                history_len: 0,
                live: Some(live),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stream: StreamId, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.lock();
        let Some(live) = inner.live.clone() else {
            return;
        };

        let chunk = OutputChunk { stream, data };
        inner.history_len += chunk.data.len();
        inner.history.push_back(chunk.clone());
        while inner.history_len > HISTORY_LIMIT {
            match inner.history.pop_front() {
                Some(old) => inner.history_len -= old.data.len(),
                None => break,
            }
        }
        let _ = live.send(chunk);
    }

    /// Ends live output. Attached streams drain and close.
    pub fn close(&self) {
        self.lock().live = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().live.is_none()
    }

    pub fn history(&self) -> Vec<OutputChunk> {
        self.lock().history.iter().cloned().collect()
    }

    /// Output selected by `options`: the replay when `logs` is set, then live
    /// chunks when `stream` is set.
    pub fn attach(&self, options: AttachOptions) -> mpsc::Receiver<OutputChunk> {
        let (replay, live) = {
            let inner = self.lock();
            let replay: Vec<OutputChunk> = if options.logs {
                inner
                    .history
                    .iter()
                    .filter(|c| options.wants(c.stream))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            let live = options
                .stream
                .then(|| inner.live.as_ref().map(broadcast::Sender::subscribe))
                .flatten();
            (replay, live)
        };

        let (tx, rx) = mpsc::channel(ATTACH_BUFFER);
        tokio::spawn(async move {
            for chunk in replay {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            let Some(mut live) = live else {
                return;
            };
            loop {
                match live.recv().await {
                    Ok(chunk) => {
                        if options.wants(chunk.stream) && tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Attached client fell behind, output dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        rx
    }
}
