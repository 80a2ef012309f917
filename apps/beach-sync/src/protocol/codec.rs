use bytes::Bytes;

use super::{BackMessage, ForwardMessage};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode {direction} frame: {source}")]
    Decode {
        direction: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {direction} frame: {source}")]
    Encode {
        direction: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Converts between wire frames and typed messages.
///
/// The cache stores encoded frames and decodes a fresh copy on every
/// dereference, so implementations must be deterministic and side-effect free.
pub trait FrameCodec: Send + Sync {
    fn decode_forward(&self, frame: &[u8]) -> Result<ForwardMessage, CodecError>;
    fn encode_forward(&self, message: &ForwardMessage) -> Result<Bytes, CodecError>;
    fn decode_back(&self, frame: &[u8]) -> Result<BackMessage, CodecError>;
    fn encode_back(&self, message: &BackMessage) -> Result<Bytes, CodecError>;
}

/// JSON frames carried as websocket binary (or text) payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn decode_forward(&self, frame: &[u8]) -> Result<ForwardMessage, CodecError> {
        serde_json::from_slice(frame).map_err(|source| CodecError::Decode {
            direction: "forward",
            source,
        })
    }

    fn encode_forward(&self, message: &ForwardMessage) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|source| CodecError::Encode {
                direction: "forward",
                source,
            })
    }

    fn decode_back(&self, frame: &[u8]) -> Result<BackMessage, CodecError> {
        serde_json::from_slice(frame).map_err(|source| CodecError::Decode {
            direction: "back",
            source,
        })
    }

    fn encode_back(&self, message: &BackMessage) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|source| CodecError::Encode {
                direction: "back",
                source,
            })
    }
}
