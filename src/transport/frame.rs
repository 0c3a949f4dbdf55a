//! Wire frames
//!
//! Every frame travels as one `LengthDelimitedCodec` record whose body is the
//! bincode encoding of [`Frame`]. Message payloads inside `Data` frames are JSON,
//! so dynamically typed values survive the trip unchanged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::transport::TransportError;

/// Version announced in the `Hello` preface. Peers with a different version are refused.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default maximum size of a single frame (16 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Identifier of a logical channel inside one connection
pub type ChannelId = u64;

/// A single transport frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Connection preface, sent once in each direction before anything else
    Hello { version: u16 },
    /// The sender opened `channel`; the receiving side gets a new inbound receiver
    Open { channel: ChannelId },
    /// One message on `channel`. `reply` names a channel the receiver may answer on.
    Data {
        channel: ChannelId,
        payload: Vec<u8>,
        reply: Option<ChannelId>,
    },
    /// No more data will be sent on `channel`
    Close { channel: ChannelId },
}

impl Frame {
    /// Encode into a frame body (without the length prefix)
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Decode a frame body produced by [`Frame::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Channel this frame refers to, if any
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Frame::Hello { .. } => None,
            Frame::Open { channel } | Frame::Data { channel, .. } | Frame::Close { channel } => {
                Some(*channel)
            }
        }
    }
}

/// Build the length-delimited codec used on both halves of a connection
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_data_frame_survives_codec() {
        let frame = Frame::Data {
            channel: 7,
            payload: br#"{"key":"any value"}"#.to_vec(),
            reply: Some(9),
        };

        let mut codec = codec(DEFAULT_MAX_FRAME_LENGTH);
        let mut buf = BytesMut::new();
        codec.encode(frame.encode().unwrap(), &mut buf).unwrap();

        let body = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(Frame::decode(&body).unwrap(), frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_rest() {
        let frame = Frame::Open { channel: 42 };
        let mut codec = codec(DEFAULT_MAX_FRAME_LENGTH);
        let mut full = BytesMut::new();
        codec.encode(frame.encode().unwrap(), &mut full).unwrap();

        let mid = full.len() / 2;
        let mut buf = BytesMut::from(&full[..mid]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[mid..]);
        let body = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(Frame::decode(&body).unwrap(), frame);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = codec(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 64]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let err = Frame::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_channel_accessor() {
        assert_eq!(Frame::Hello { version: 1 }.channel(), None);
        assert_eq!(Frame::Close { channel: 3 }.channel(), Some(3));
    }
}
