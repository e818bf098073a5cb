//! Writer configuration

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{IngestError, Result};
use crate::layout::{ChunkLayoutPlanner, TileMultipliers, DEFAULT_TARGET_CHUNK_BYTES};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum number of tile fetches in flight
pub const DEFAULT_WINDOW: usize = 10;

/// Tunables for dataset writers. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Concurrency window for tile fetches
    pub window: usize,
    /// Chunk byte budget
    pub target_chunk_bytes: usize,
    /// Tile extent in chunks per axis role
    pub multipliers: TileMultipliers,
    pub compression: CompressionMethod,
    pub compression_level: CompressionLevel,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            target_chunk_bytes: DEFAULT_TARGET_CHUNK_BYTES,
            multipliers: TileMultipliers::default(),
            compression: CompressionMethod::default(),
            compression_level: CompressionLevel::default(),
        }
    }
}

impl WriterConfig {
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_target_chunk_bytes(mut self, bytes: usize) -> Self {
        self.target_chunk_bytes = bytes;
        self
    }

    pub fn with_multipliers(mut self, multipliers: TileMultipliers) -> Self {
        self.multipliers = multipliers;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.compression_level = level;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IngestError::Configuration(format!("Invalid writer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IngestError::Configuration(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(IngestError::Configuration(
                "Concurrency window must be at least 1".to_string(),
            ));
        }
        if self.target_chunk_bytes == 0 {
            return Err(IngestError::Configuration(
                "Chunk byte budget must be positive".to_string(),
            ));
        }
        let m = self.multipliers;
        if m.time == 0 || m.space == 0 || m.channel == 0 {
            return Err(IngestError::Configuration(format!(
                "Tile multipliers must be positive: {m:?}"
            )));
        }
        Ok(())
    }

    pub fn planner(&self) -> ChunkLayoutPlanner {
        ChunkLayoutPlanner::new(self.target_chunk_bytes, self.multipliers)
    }
}
