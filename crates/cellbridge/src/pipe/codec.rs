//! Framing of records written by the child into `GONB_PIPE`.
//!
//! Each record is a 4-byte big-endian length followed by one JSON
//! [`DisplayRecord`](super::protocol::DisplayRecord). The child runs arbitrary
//! user code, so frame length is capped at [`MAX_FRAME_LENGTH`]; an oversized
//! or undecodable frame ends decoding for the rest of the cell. Children in
//! any language can produce these frames with a plain write.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected: the writer is untrusted user code.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub struct RecordCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for RecordCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for RecordCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for RecordCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding record");
        self.inner.encode(Bytes::from(json), dst)
    }
}
