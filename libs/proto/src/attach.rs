//! Attach protocol.
//!
//! After the HTTP upgrade the client has sent an [`AttachReq`] and the server
//! answers with one status byte. `waiting` may be followed later by `success`
//! or an error frame. After `success` the connection carries raw bytes for TTY
//! jobs and [`AttachFrame`]s otherwise.
//!
//! ```text
//! data   [3][stream u8][len u32 BE][bytes]   len 0 on stdin closes stdin
//! error  [2][len u32 BE][utf8]
//! signal [4][signo u32 BE]                   client → server
//! exit   [5][code i32 BE]                    server → client
//! resize [6][cols u16 BE][rows u16 BE]       client → server
//! ```

use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use corral_id::JobId;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtoError;

/// Content type announcing the attach framing on the upgraded connection.
pub const ATTACH_CONTENT_TYPE: &str = "application/vnd.cluster.attach-hijack";

/// Value of the `Upgrade` header used for attach.
pub const ATTACH_UPGRADE: &str = "corral-attach";

/// Largest data frame payload accepted.
pub const MAX_CHUNK_LEN: usize = 1024 * 1024;

pub mod status {
    pub const SUCCESS: u8 = 0;
    pub const WAITING: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const DATA: u8 = 3;
    pub const SIGNAL: u8 = 4;
    pub const EXIT: u8 = 5;
    pub const RESIZE: u8 = 6;
    pub const WOULD_WAIT: u8 = 7;
}

/// Output or input stream carried by a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamId {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamId {
    pub fn as_byte(self) -> u8 {
        match self {
            StreamId::Stdin => 0,
            StreamId::Stdout => 1,
            StreamId::Stderr => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StreamId::Stdin),
            1 => Some(StreamId::Stdout),
            2 => Some(StreamId::Stderr),
            _ => None,
        }
    }

    fn flag(self) -> AttachFlags {
        match self {
            StreamId::Stdin => AttachFlags::STDIN,
            StreamId::Stdout => AttachFlags::STDOUT,
            StreamId::Stderr => AttachFlags::STDERR,
        }
    }
}

/// Bit set selecting what an attach delivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachFlags(u8);

impl AttachFlags {
    pub const STDOUT: Self = Self(1);
    pub const STDERR: Self = Self(1 << 1);
    pub const STDIN: Self = Self(1 << 2);
    /// Replay buffered output first.
    pub const LOGS: Self = Self(1 << 3);
    /// Keep streaming live output.
    pub const STREAM: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether output on `stream` was requested.
    pub fn wants(self, stream: StreamId) -> bool {
        self.contains(stream.flag())
    }
}

impl BitOr for AttachFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Request sent by an attaching client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachReq {
    pub job_id: JobId,

    #[serde(default)]
    pub flags: AttachFlags,

    #[serde(default)]
    pub height: u16,

    #[serde(default)]
    pub width: u16,

    /// Streams selected by name, merged into `flags`.
    #[serde(default)]
    pub streams: Vec<StreamId>,

    /// Queue until the job exists instead of answering `would_wait`.
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

impl AttachReq {
    pub fn new(job_id: JobId, flags: AttachFlags) -> Self {
        Self {
            job_id,
            flags,
            height: 0,
            width: 0,
            streams: Vec::new(),
            wait: true,
        }
    }

    /// `flags` with the named `streams` folded in.
    pub fn effective_flags(&self) -> AttachFlags {
        self.streams
            .iter()
            .fold(self.flags, |acc, s| acc | s.flag())
    }

    /// Terminal size requested, if both dimensions are set.
    pub fn size(&self) -> Option<(u16, u16)> {
        (self.width > 0 && self.height > 0).then_some((self.width, self.height))
    }
}

/// One frame of the non-TTY attach stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachFrame {
    Data { stream: StreamId, data: Bytes },
    Error(String),
    Signal(u32),
    Exit(i32),
    Resize { cols: u16, rows: u16 },
}

impl AttachFrame {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        AttachFrame::Data {
            stream: StreamId::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        AttachFrame::Data {
            stream: StreamId::Stderr,
            data: data.into(),
        }
    }

    /// Zero-length stdin frame telling the server to close stdin.
    pub fn close_stdin() -> Self {
        AttachFrame::Data {
            stream: StreamId::Stdin,
            data: Bytes::new(),
        }
    }
}

/// Encodes and decodes [`AttachFrame`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttachCodec;

impl Encoder<AttachFrame> for AttachCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: AttachFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            AttachFrame::Data { stream, data } => {
                dst.reserve(6 + data.len());
                dst.put_u8(status::DATA);
                dst.put_u8(stream.as_byte());
                dst.put_u32(data.len() as u32);
                dst.extend_from_slice(&data);
            }
            AttachFrame::Error(msg) => {
                dst.reserve(5 + msg.len());
                dst.put_u8(status::ERROR);
                dst.put_u32(msg.len() as u32);
                dst.extend_from_slice(msg.as_bytes());
            }
            AttachFrame::Signal(signo) => {
                dst.put_u8(status::SIGNAL);
                dst.put_u32(signo);
            }
            AttachFrame::Exit(code) => {
                dst.put_u8(status::EXIT);
                dst.put_i32(code);
            }
            AttachFrame::Resize { cols, rows } => {
                dst.put_u8(status::RESIZE);
                dst.put_u16(cols);
                dst.put_u16(rows);
            }
        }
        Ok(())
    }
}

impl Decoder for AttachCodec {
    type Item = AttachFrame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&kind) = src.first() else {
            return Ok(None);
        };
        match kind {
            status::DATA => {
                if src.len() < 6 {
                    return Ok(None);
                }
                let stream = StreamId::from_byte(src[1]).ok_or(ProtoError::UnknownFrame(src[1]))?;
                let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
                if len > MAX_CHUNK_LEN {
                    return Err(ProtoError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("attach chunk of {len} bytes exceeds limit"),
                    )));
                }
                if src.len() < 6 + len {
                    src.reserve(6 + len - src.len());
                    return Ok(None);
                }
                src.advance(6);
                let data = src.split_to(len).freeze();
                Ok(Some(AttachFrame::Data { stream, data }))
            }
            status::ERROR => {
                if src.len() < 5 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
                if src.len() < 5 + len {
                    return Ok(None);
                }
                src.advance(5);
                let msg = src.split_to(len);
                Ok(Some(AttachFrame::Error(
                    String::from_utf8_lossy(&msg).into_owned(),
                )))
            }
            status::SIGNAL | status::EXIT => {
                if src.len() < 5 {
                    return Ok(None);
                }
                src.advance(1);
                let raw = src.get_u32();
                Ok(Some(if kind == status::SIGNAL {
                    AttachFrame::Signal(raw)
                } else {
                    AttachFrame::Exit(raw as i32)
                }))
            }
            status::RESIZE => {
                if src.len() < 5 {
                    return Ok(None);
                }
                src.advance(1);
                let cols = src.get_u16();
                let rows = src.get_u16();
                Ok(Some(AttachFrame::Resize { cols, rows }))
            }
            other => Err(ProtoError::UnknownFrame(other)),
        }
    }
}
