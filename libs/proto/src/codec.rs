//! Length-prefixed JSON framing.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::rpc::{Request, Response};
use crate::ProtoError;

/// Largest frame accepted on the scheduler port.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes `Enc` values and decodes `Dec` values, one JSON document per frame.
pub struct JsonCodec<Enc, Dec> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(Enc) -> Dec>,
}

/// Codec for the client side of a scheduler connection.
pub type ClientCodec = JsonCodec<Request, Response>;

/// Codec for the server side of a scheduler connection.
pub type ServerCodec = JsonCodec<Response, Request>;

impl<Enc, Dec> JsonCodec<Enc, Dec> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<Enc, Dec> Default for JsonCodec<Enc, Dec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Enc: Serialize, Dec> Encoder<Enc> for JsonCodec<Enc, Dec> {
    type Error = ProtoError;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

impl<Enc, Dec: DeserializeOwned> Decoder for JsonCodec<Enc, Dec> {
    type Item = Dec;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}
