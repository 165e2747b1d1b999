//! Envelope definition and framing for the worker channel
//!
//! Every message on the channel, request, response or push notification,
//! travels in one [`Envelope`] archived with rkyv and framed with a 4-byte
//! big-endian length prefix.

use crate::RpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rkyv::{Archive, Deserialize, Serialize};

/// Correlation id carried by push notifications
pub const NOTIFICATION_ID: u64 = 0;

/// Message kind used by the worker to report a failed request
pub const ERROR_KIND: &str = "error";

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One message on the multiplexed channel
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Envelope {
    /// Operation or notification kind
    pub kind: String,

    /// Request id this message answers, or [`NOTIFICATION_ID`]
    pub correlation_id: u64,

    /// Payload compression as u8 (0=none, 1=LZ4, 2=Zstd)
    pub compression: u8,

    /// Serialized payload
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an uncompressed request or response envelope
    pub fn request(kind: impl Into<String>, correlation_id: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id,
            compression: 0,
            payload,
        }
    }

    /// Build a push notification envelope
    pub fn notification(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::request(kind, NOTIFICATION_ID, payload)
    }

    pub fn is_notification(&self) -> bool {
        self.correlation_id == NOTIFICATION_ID
    }

    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> Result<Bytes, RpcError> {
        let bytes = rkyv::to_bytes::<_, 256>(self)
            .map_err(|e| RpcError::ProtocolError(format!("Serialization failed: {e}")))?;
        Ok(Bytes::from(bytes.to_vec()))
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RpcError> {
        let archived = rkyv::check_archived_root::<Self>(bytes)
            .map_err(|e| RpcError::ProtocolError(format!("Validation failed: {e}")))?;

        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| RpcError::ProtocolError(format!("Deserialization failed: {e:?}")))
    }
}

/// Frame encoder/decoder for the envelope stream
pub struct FramedCodec;

impl FramedCodec {
    /// Encode an envelope with length prefix
    pub fn encode(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), RpcError> {
        let payload = envelope.to_bytes()?;

        if payload.len() > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "Frame of {} bytes exceeds limit",
                payload.len()
            )));
        }

        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }

    /// Decode an envelope from buffer
    /// Returns Some(envelope) if a complete frame is available, None if more data needed
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, RpcError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "Frame of {length} bytes exceeds limit"
            )));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        buf.advance(4);

        // Copy out so the archive is properly aligned
        let frame = buf.split_to(length).to_vec();

        Envelope::from_bytes(&frame).map(Some)
    }
}

/// Frame statistics for debugging/monitoring
#[derive(Debug, Default, Clone)]
pub struct MessageStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::request("evaluate", 42, br#"{"args":[1]}"#.to_vec());

        let bytes = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert!(!decoded.is_notification());
    }

    #[test]
    fn test_framed_codec() {
        let first = Envelope::request("snapshot", 1, b"{}".to_vec());
        let second = Envelope::notification("model_changed", Vec::new());

        let mut buf = BytesMut::new();
        FramedCodec::encode(&first, &mut buf).unwrap();
        FramedCodec::encode(&second, &mut buf).unwrap();

        assert_eq!(FramedCodec::decode(&mut buf).unwrap(), Some(first));
        let decoded = FramedCodec::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_notification());
        assert_eq!(decoded.kind, "model_changed");

        assert_eq!(buf.len(), 0);
        assert_eq!(FramedCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.extend_from_slice(&[0u8; 8]);
        assert!(FramedCodec::decode(&mut buf).is_err());
    }
}
