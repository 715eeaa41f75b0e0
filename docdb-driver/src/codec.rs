//! Codec types used by the pool to turn frames into bytes and back.
//!
//! The correlation layer treats the wire format as opaque: it only needs a [`CodecBuilder`] that produces
//! an encoder for [`OutgoingFrame`]s and a decoder for [`IncomingFrame`]s.
//! [`JsonCodecBuilder`] is the reference implementation, length delimited JSON.

use crate::frame::{IncomingFrame, OutgoingFrame};
use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

#[derive(Debug)]
pub enum CodecReadError {
    /// The codec failed to parse a received frame
    Parser(anyhow::Error),
    /// The tcp connection returned an error
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecReadError {
    fn from(err: std::io::Error) -> Self {
        CodecReadError::Io(err)
    }
}

#[derive(Debug)]
pub enum CodecWriteError {
    /// The codec failed to encode a frame
    Encoder(anyhow::Error),
    /// The tcp connection returned an error
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecWriteError {
    fn from(err: std::io::Error) -> Self {
        CodecWriteError::Io(err)
    }
}

// TODO: Replace with trait_alias (rust-lang/rust#41517).
pub trait DecoderHalf: Decoder<Item = IncomingFrame, Error = CodecReadError> + Send + 'static {}
impl<T: Decoder<Item = IncomingFrame, Error = CodecReadError> + Send + 'static> DecoderHalf for T {}

// TODO: Replace with trait_alias (rust-lang/rust#41517).
pub trait EncoderHalf: Encoder<OutgoingFrame, Error = CodecWriteError> + Send + 'static {}
impl<T: Encoder<OutgoingFrame, Error = CodecWriteError> + Send + 'static> EncoderHalf for T {}

pub trait CodecBuilder: Clone + Send + Sync + 'static {
    type Decoder: DecoderHalf;
    type Encoder: EncoderHalf;

    /// Creates the decoder and encoder for a single connection.
    fn build(&self) -> (Self::Decoder, Self::Encoder);

    fn protocol_name(&self) -> &'static str;
}

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Length delimited JSON, decoding `D` and encoding `E`.
/// The driver decodes [`IncomingFrame`] and encodes [`OutgoingFrame`], a server does the reverse.
pub struct JsonCodec<D, E> {
    framing: LengthDelimitedCodec,
    _marker: PhantomData<fn() -> (D, E)>,
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> JsonCodec<D, E> {
    pub fn new() -> Self {
        JsonCodec {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = CodecReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, CodecReadError> {
        match self.framing.decode(src)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| CodecReadError::Parser(anyhow!(err).context("Failed to parse frame"))),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D, E> {
    type Error = CodecWriteError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), CodecWriteError> {
        let bytes = serde_json::to_vec(&item)
            .map_err(|err| CodecWriteError::Encoder(anyhow!(err).context("Failed to encode frame")))?;
        self.framing.encode(Bytes::from(bytes), dst)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodecBuilder;

impl CodecBuilder for JsonCodecBuilder {
    type Decoder = JsonCodec<IncomingFrame, OutgoingFrame>;
    type Encoder = JsonCodec<IncomingFrame, OutgoingFrame>;

    fn build(&self) -> (Self::Decoder, Self::Encoder) {
        (JsonCodec::new(), JsonCodec::new())
    }

    fn protocol_name(&self) -> &'static str {
        "json"
    }
}
