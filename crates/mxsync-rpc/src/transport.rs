//! Transports carrying envelopes to and from the worker
//!
//! The correlator only needs a way to send; the receiving half of every
//! transport feeds an `mpsc` channel that [`crate::Correlator::spawn_dispatch`]
//! drains. Establishing the underlying channel (spawning the worker, opening
//! a socket) happens elsewhere.

use crate::compress::PayloadCompressor;
use crate::protocol::{Envelope, FramedCodec, MessageStats};
use crate::RpcError;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// Default queue depth for in-process channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Outgoing half of a message channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one envelope to the channel
    async fn send(&self, envelope: Envelope) -> Result<(), RpcError>;
}

/// In-process transport backed by a bounded `mpsc` channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing what it sends
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Wrap an existing sender
    pub fn from_sender(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| RpcError::TransportError("Channel closed".to_string()))
    }
}

/// Length-prefixed framing over any async byte stream
pub struct FramedTransport<W> {
    writer: Mutex<W>,
    compressor: PayloadCompressor,
    stats: Mutex<MessageStats>,
}

impl<W: AsyncWrite + Unpin + Send> FramedTransport<W> {
    pub fn new(writer: W, compressor: PayloadCompressor) -> Self {
        Self {
            writer: Mutex::new(writer),
            compressor,
            stats: Mutex::new(MessageStats::default()),
        }
    }

    /// Get frame statistics
    pub async fn stats(&self) -> MessageStats {
        self.stats.lock().await.clone()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for FramedTransport<W> {
    async fn send(&self, mut envelope: Envelope) -> Result<(), RpcError> {
        self.compressor.pack(&mut envelope)?;

        let mut buf = BytesMut::new();
        FramedCodec::encode(&envelope, &mut buf)?;

        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(&buf)
                .await
                .map_err(|e| RpcError::TransportError(format!("Write failed: {e}")))?;
            writer
                .flush()
                .await
                .map_err(|e| RpcError::TransportError(format!("Flush failed: {e}")))?;
        }

        let mut stats = self.stats.lock().await;
        stats.frames_sent += 1;
        stats.bytes_sent += buf.len() as u64;
        trace!("Sent {} frame {} ({} bytes)", envelope.kind, envelope.correlation_id, buf.len());
        Ok(())
    }
}

/// Read frames from `reader` and forward decoded envelopes to `sink`
///
/// Returns the receive statistics once the stream ends cleanly or the sink
/// is dropped. A truncated or undecodable frame ends the stream with an
/// error since framing cannot be recovered.
pub async fn read_frames<R>(
    mut reader: R,
    compressor: &PayloadCompressor,
    sink: mpsc::Sender<Envelope>,
) -> Result<MessageStats, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut stats = MessageStats::default();

    loop {
        while let Some(mut envelope) = FramedCodec::decode(&mut buf)? {
            stats.frames_received += 1;
            compressor.unpack(&mut envelope)?;
            if sink.send(envelope).await.is_err() {
                debug!("Envelope sink dropped, stopping reader");
                return Ok(stats);
            }
        }

        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            if buf.is_empty() {
                debug!("Stream closed after {} frames", stats.frames_received);
                return Ok(stats);
            }
            return Err(RpcError::ProtocolError(format!(
                "Stream ended inside a frame ({} bytes pending)",
                buf.len()
            )));
        }
        stats.bytes_received += read as u64;
    }
}
