//! Length-prefixed JSON frames over any byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! Byte payloads inside frames travel as base64 strings.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Room for a base64-encoded 50 KiB chunk plus envelope, with headroom for
/// larger configured chunk sizes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Frame codec for one message type `T`.
pub struct JsonCodec<T> {
    framing: LengthDelimitedCodec,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Frames above `max` bytes are refused in both directions.
    pub fn with_max_frame_length(max: usize) -> Self {
        let framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(max)
            .new_codec();
        Self {
            framing,
            _frame: PhantomData,
        }
    }
}

fn invalid_frame(len: usize, e: serde_json::Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed {len}-byte frame: {e}"),
    )
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.framing.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| invalid_frame(frame.len(), e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = body.len(), "Encoding frame");
        self.framing.encode(Bytes::from(body), dst)
    }
}

/// Serde adapter carrying `Bytes` as a standard base64 string.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::frame::{InboundFrame, OutboundFrame, TaskOutput};

    #[test]
    fn codec_roundtrip_inbound_chunk() {
        let mut codec = JsonCodec::<InboundFrame>::new();
        let mut buf = BytesMut::new();

        let frame = InboundFrame::PayloadChunk {
            data: Bytes::from_static(b"\x00\x01binary\xff"),
            is_complete: true,
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_roundtrip_outbound_output() {
        let mut codec = JsonCodec::<OutboundFrame>::new();
        let mut buf = BytesMut::new();

        let frame = OutboundFrame::Output {
            output: TaskOutput::Error {
                details: "boom".to_string(),
            },
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = JsonCodec::<InboundFrame>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                InboundFrame::DependencyInit {
                    key: Some("dep".to_string()),
                },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn codec_rejects_invalid_json() {
        let mut codec = JsonCodec::<InboundFrame>::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec()
            .encode(Bytes::from_static(b"{not json"), &mut buf)
            .unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn codec_rejects_oversized_frames() {
        let mut codec = JsonCodec::<OutboundFrame>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let frame = OutboundFrame::ResultChunk {
            request_id: "r".to_string(),
            data: Bytes::from(vec![0u8; 64]),
        };
        assert!(codec.encode(frame, &mut buf).is_err());
    }
}
