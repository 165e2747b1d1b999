//! Request/response correlation over a multiplexed worker channel
//!
//! Turns a single stream of envelopes into independently awaitable calls,
//! and routes unsolicited push notifications to subscribers.

pub mod protocol;
pub mod compress;
pub mod transport;
pub mod correlator;

pub use protocol::{Envelope, FramedCodec, MessageStats, ERROR_KIND, MAX_FRAME_LEN, NOTIFICATION_ID};
pub use compress::{CompressionAlgorithm, CompressionConfig, Compressor, PayloadCompressor};
pub use transport::{read_frames, ChannelTransport, FramedTransport, Transport, DEFAULT_CHANNEL_CAPACITY};
pub use correlator::{
    CorrelationId, Correlator, CorrelatorConfig, Notification, SubscriptionId, Ticket,
};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Request {correlation_id} ({kind}) timed out after {timeout:?}")]
    TimedOut {
        kind: String,
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    #[error("Response {correlation_id} has kind {found}, expected {expected}")]
    ProtocolMismatch {
        correlation_id: CorrelationId,
        expected: String,
        found: String,
    },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Correlator closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
