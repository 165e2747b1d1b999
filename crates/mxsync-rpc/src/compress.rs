//! Payload compression for framed transports
//!
//! Provides both Zstd and LZ4 compression algorithms. Snapshots of large
//! models are mostly repeated keys and names, so they shrink well; small
//! request payloads are sent as-is.

use crate::protocol::{Envelope, MAX_FRAME_LEN};
use crate::RpcError;
use std::io::{Read, Write};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CompressionAlgorithm {
    /// Zstandard compression (better ratio, slightly slower)
    #[cfg_attr(feature = "clap", value(name = "zstd"))]
    Zstd,
    /// LZ4 compression (faster, lower ratio)
    #[cfg_attr(feature = "clap", value(name = "lz4"))]
    Lz4,
}

impl CompressionAlgorithm {
    /// Envelope flag for this algorithm
    pub fn flag(self) -> u8 {
        match self {
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
        }
    }

    /// Algorithm for an envelope flag; `None` for uncompressed payloads
    pub fn from_flag(flag: u8) -> Result<Option<Self>, RpcError> {
        match flag {
            0 => Ok(None),
            1 => Ok(Some(CompressionAlgorithm::Lz4)),
            2 => Ok(Some(CompressionAlgorithm::Zstd)),
            other => Err(RpcError::CompressionError(format!("Unknown compression flag {other}"))),
        }
    }
}

/// Compressor wrapper supporting multiple algorithms
#[derive(Debug, Clone)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    compression_level: i32,
    /// Largest payload `decompress` will produce
    max_output: usize,
}

impl Compressor {
    /// Create a new compressor with specified algorithm
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            compression_level: match algorithm {
                CompressionAlgorithm::Zstd => 3,
                CompressionAlgorithm::Lz4 => 0,
            },
            max_output: MAX_FRAME_LEN,
        }
    }

    /// Set compression level (zstd only)
    pub fn with_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Set the decompressed size limit
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => {
                let mut encoder = zstd::Encoder::new(Vec::new(), self.compression_level)
                    .map_err(|e| RpcError::CompressionError(format!("Failed to create zstd encoder: {e}")))?;
                encoder
                    .write_all(data)
                    .map_err(|e| RpcError::CompressionError(format!("Failed to write to zstd encoder: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| RpcError::CompressionError(format!("Failed to finish zstd encoding: {e}")))
            }
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => {
                let decoder = zstd::Decoder::new(data)
                    .map_err(|e| RpcError::CompressionError(format!("Failed to create zstd decoder: {e}")))?;
                let mut decompressed = Vec::new();
                // One byte past the limit tells an oversized payload from one at the limit
                decoder
                    .take(self.max_output as u64 + 1)
                    .read_to_end(&mut decompressed)
                    .map_err(|e| RpcError::CompressionError(format!("Failed to decompress zstd data: {e}")))?;
                if decompressed.len() > self.max_output {
                    return Err(self.too_large(decompressed.len()));
                }
                Ok(decompressed)
            }
            CompressionAlgorithm::Lz4 => {
                let declared = data
                    .get(..4)
                    .and_then(|prefix| prefix.try_into().ok())
                    .map(u32::from_le_bytes)
                    .ok_or_else(|| RpcError::CompressionError("LZ4 payload missing size prefix".to_string()))?;
                if declared as usize > self.max_output {
                    return Err(self.too_large(declared as usize));
                }
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| RpcError::CompressionError(format!("LZ4 decompression failed: {e}")))
            }
        }
    }

    fn too_large(&self, size: usize) -> RpcError {
        RpcError::CompressionError(format!(
            "Decompressed payload of {size} bytes exceeds limit of {}",
            self.max_output
        ))
    }
}

/// Size thresholds for payload compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Payloads smaller than this are sent uncompressed
    pub min_size: usize,
    /// Payloads at least this large use zstd instead of lz4
    pub zstd_min_size: usize,
    /// Disable compression entirely
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 4 * 1024,
            zstd_min_size: 64 * 1024,
            enabled: true,
        }
    }
}

/// Chooses an algorithm per payload and rewrites envelopes in place
#[derive(Debug, Clone)]
pub struct PayloadCompressor {
    config: CompressionConfig,
    lz4: Compressor,
    zstd: Compressor,
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

impl PayloadCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            lz4: Compressor::new(CompressionAlgorithm::Lz4),
            zstd: Compressor::new(CompressionAlgorithm::Zstd),
        }
    }

    /// Algorithm that would be used for a payload of this size
    pub fn choose(&self, len: usize) -> Option<CompressionAlgorithm> {
        if !self.config.enabled || len < self.config.min_size {
            None
        } else if len < self.config.zstd_min_size {
            Some(CompressionAlgorithm::Lz4)
        } else {
            Some(CompressionAlgorithm::Zstd)
        }
    }

    /// Compress an outgoing envelope's payload if it is large enough
    pub fn pack(&self, envelope: &mut Envelope) -> Result<(), RpcError> {
        if envelope.compression != 0 {
            return Ok(());
        }
        if let Some(algorithm) = self.choose(envelope.payload.len()) {
            envelope.payload = self.compressor(algorithm).compress(&envelope.payload)?;
            envelope.compression = algorithm.flag();
        }
        Ok(())
    }

    /// Restore an incoming envelope's payload
    pub fn unpack(&self, envelope: &mut Envelope) -> Result<(), RpcError> {
        if let Some(algorithm) = CompressionAlgorithm::from_flag(envelope.compression)? {
            envelope.payload = self.compressor(algorithm).decompress(&envelope.payload)?;
            envelope.compression = 0;
        }
        Ok(())
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &Compressor {
        match algorithm {
            CompressionAlgorithm::Lz4 => &self.lz4,
            CompressionAlgorithm::Zstd => &self.zstd,
        }
    }
}
