//! Typed client for the host HTTP API.

use bytes::{Bytes, BytesMut};
use corral_events::Event;
use corral_id::JobId;
use corral_proto::attach::{status, AttachCodec, AttachFrame, AttachReq, StreamId, ATTACH_UPGRADE};
use corral_proto::ActiveJob;
use futures::StreamExt;
use reqwest::header::{CONNECTION, UPGRADE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio_util::codec::Framed;

use crate::api::{HealthResponse, ProblemDetails};
use crate::error::HostClientError;

/// Largest error message accepted before `success`.
const MAX_REFUSAL_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HostClient {
    http: reqwest::Client,
    base_url: String,
}

impl HostClient {
    /// `base_url` is `http://host:port`, with or without a trailing slash.
    pub fn new(base_url: impl Into<String>) -> Result<Self, HostClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<HealthResponse, HostClientError> {
        let response = self.http.get(self.url("/healthz")).send().await?;
        json(response).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<ActiveJob>, HostClientError> {
        let response = self.http.get(self.url("/host/jobs")).send().await?;
        json(response).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<ActiveJob, HostClientError> {
        let response = self
            .http
            .get(self.url(&format!("/host/jobs/{job_id}")))
            .send()
            .await?;
        json(response).await
    }

    /// Requests a graceful stop and returns the job as recorded afterwards.
    pub async fn stop_job(&self, job_id: &JobId) -> Result<ActiveJob, HostClientError> {
        let response = self
            .http
            .post(self.url(&format!("/host/jobs/{job_id}/stop")))
            .send()
            .await?;
        json(response).await
    }

    pub async fn resize(&self, job_id: &JobId, cols: u16, rows: u16) -> Result<(), HostClientError> {
        let response = self
            .http
            .post(self.url(&format!("/host/jobs/{job_id}/resize")))
            .query(&[("cols", cols), ("rows", rows)])
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    /// Events of one job, ending after its terminal event.
    pub async fn job_events(&self, job_id: &JobId) -> Result<EventStream, HostClientError> {
        let response = self
            .http
            .get(self.url(&format!("/host/jobs/{job_id}/events")))
            .send()
            .await?;
        Ok(EventStream::new(check(response).await?))
    }

    /// Events of every job on the host.
    pub async fn events(&self) -> Result<EventStream, HostClientError> {
        let response = self.http.get(self.url("/host/events")).send().await?;
        Ok(EventStream::new(check(response).await?))
    }

    /// Opens an attach session. Blocks while the host reports `waiting`.
    pub async fn attach(&self, req: &AttachReq) -> Result<Attached, HostClientError> {
        let response = self
            .http
            .post(self.url("/host/attach"))
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, ATTACH_UPGRADE)
            .json(req)
            .send()
            .await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            check(response).await?;
            return Err(HostClientError::Protocol(
                "host did not switch protocols".to_string(),
            ));
        }
        let mut io = response.upgrade().await?;

        loop {
            match io.read_u8().await? {
                status::WAITING => continue,
                status::SUCCESS => return Ok(Attached::Session(AttachSession { io })),
                status::WOULD_WAIT => return Ok(Attached::WouldWait),
                status::ERROR => {
                    let len = io.read_u32().await? as usize;
                    if len > MAX_REFUSAL_LEN {
                        return Err(HostClientError::Protocol(format!(
                            "error message of {len} bytes"
                        )));
                    }
                    let mut msg = vec![0u8; len];
                    io.read_exact(&mut msg).await?;
                    return Err(HostClientError::Refused(
                        String::from_utf8_lossy(&msg).into_owned(),
                    ));
                }
                other => {
                    return Err(HostClientError::Protocol(format!(
                        "unexpected status byte {other}"
                    )))
                }
            }
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, HostClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let problem = serde_json::from_slice::<ProblemDetails>(&body).unwrap_or_else(|_| {
        ProblemDetails {
            r#type: "about:blank".to_string(),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: String::from_utf8_lossy(&body).into_owned(),
            code: "unknown".to_string(),
        }
    });
    Err(HostClientError::Api {
        status: status.as_u16(),
        problem: Box::new(problem),
    })
}

async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HostClientError> {
    Ok(check(response).await?.json().await?)
}

/// Newline-delimited event feed.
pub struct EventStream {
    body: futures::stream::BoxStream<'static, reqwest::Result<Bytes>>,
    buf: BytesMut,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            body: response.bytes_stream().boxed(),
            buf: BytesMut::new(),
        }
    }

    /// The next event, or `None` once the host ends the feed.
    pub async fn next_event(&mut self) -> Result<Option<Event>, HostClientError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line[..pos]);
                if text.trim().is_empty() {
                    continue;
                }
                return Ok(Some(Event::from_ndjson(&text)?));
            }
            match self.body.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None => return Ok(None),
            }
        }
    }
}

pub enum Attached {
    Session(AttachSession),
    /// The job does not exist yet and the request asked not to wait.
    WouldWait,
}

/// An attach connection after `success`.
pub struct AttachSession {
    io: reqwest::Upgraded,
}

/// Output collected from a framed session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: Option<i32>,
}

impl AttachSession {
    /// Frame codec over the connection, for jobs without a TTY.
    pub fn framed(self) -> Framed<reqwest::Upgraded, AttachCodec> {
        Framed::new(self.io, AttachCodec)
    }

    /// Raw byte stream, for TTY jobs.
    pub fn into_raw(self) -> reqwest::Upgraded {
        self.io
    }

    /// Reads frames until the host closes the session.
    pub async fn collect(self) -> Result<Transcript, HostClientError> {
        let mut framed = self.framed();
        let mut transcript = Transcript::default();
        while let Some(frame) = framed.next().await {
            match frame? {
                AttachFrame::Data { stream, data } => match stream {
                    StreamId::Stdout => transcript.stdout.extend_from_slice(&data),
                    StreamId::Stderr => transcript.stderr.extend_from_slice(&data),
                    StreamId::Stdin => {}
                },
                AttachFrame::Exit(code) => transcript.exit = Some(code),
                AttachFrame::Error(msg) => return Err(HostClientError::Refused(msg)),
                other => {
                    return Err(HostClientError::Protocol(format!(
                        "unexpected frame from host: {other:?}"
                    )))
                }
            }
        }
        Ok(transcript)
    }
}
