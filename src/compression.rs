//! Chunk compression for stored datasets

use crate::error::{IngestError, Result};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression applied to each stored chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Raw chunk bytes
    None,
    /// Deflate/ZIP compression
    Deflate,
    /// Zstandard compression
    #[default]
    Zstd,
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

impl CompressionMethod {
    /// Encode a chunk buffer
    pub fn encode(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(data.to_vec()),
            CompressionMethod::Deflate => {
                let mut encoder =
                    DeflateEncoder::new(data, FlateCompression::new(u32::from(level.value())));
                let mut compressed = Vec::new();
                encoder
                    .read_to_end(&mut compressed)
                    .map_err(|e| IngestError::Compression(e.to_string()))?;
                Ok(compressed)
            }
            CompressionMethod::Zstd => zstd::encode_all(data, i32::from(level.value()))
                .map_err(|e| IngestError::Compression(e.to_string())),
        }
    }

    /// Decode a stored chunk, checking it has the expected size
    pub fn decode(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let decoded = match self {
            CompressionMethod::None => data.to_vec(),
            CompressionMethod::Deflate => {
                let mut decoder = DeflateDecoder::new(data);
                let mut decompressed = Vec::with_capacity(expected_size);
                decoder
                    .read_to_end(&mut decompressed)
                    .map_err(|e| IngestError::Decompression(e.to_string()))?;
                decompressed
            }
            CompressionMethod::Zstd => {
                zstd::decode_all(data).map_err(|e| IngestError::Decompression(e.to_string()))?
            }
        };

        if decoded.len() != expected_size {
            return Err(IngestError::Decompression(format!(
                "Chunk decoded to {} bytes, expected {}",
                decoded.len(),
                expected_size
            )));
        }
        Ok(decoded)
    }
}
