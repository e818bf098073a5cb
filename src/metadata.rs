//! Persisted metadata for groups and chunked datasets

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{IngestError, Result};
use crate::types::{AxisTags, DataType, ValueRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Object name of a dataset's metadata document
pub const DATASET_METADATA_KEY: &str = ".dataset.json";

/// Object name marking a group
pub const GROUP_METADATA_KEY: &str = ".group.json";

/// Container format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Metadata document of a group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub version: FormatVersion,
}

/// Metadata document of a chunked dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Format version
    pub version: FormatVersion,

    /// Extent along each axis
    pub shape: Vec<usize>,

    /// Element type
    pub data_type: DataType,

    /// Storage chunk extent along each axis
    pub chunk_shape: Vec<usize>,

    /// Compression method used for chunks
    pub compression: CompressionMethod,

    /// Compression level used when encoding chunks
    #[serde(default)]
    pub compression_level: CompressionLevel,

    /// Axis order and roles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axistags: Option<AxisTags>,

    /// Value range hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drange: Option<ValueRange>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// Free-form attributes
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl DatasetMetadata {
    /// Create new metadata
    pub fn new(shape: Vec<usize>, data_type: DataType, chunk_shape: Vec<usize>) -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::default(),
            shape,
            data_type,
            chunk_shape,
            compression: CompressionMethod::default(),
            compression_level: CompressionLevel::default(),
            axistags: None,
            drange: None,
            created_at: now,
            modified_at: now,
            attributes: HashMap::new(),
        }
    }

    /// Set compression method and level
    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.compression_level = level;
        self
    }

    pub fn with_axistags(mut self, axistags: AxisTags) -> Self {
        self.axistags = Some(axistags);
        self
    }

    pub fn with_drange(mut self, drange: ValueRange) -> Self {
        self.drange = Some(drange);
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible(&FormatVersion::CURRENT) {
            return Err(IngestError::Metadata(format!(
                "Unsupported format version {}.{}",
                self.version.major, self.version.minor
            )));
        }
        if self.chunk_shape.len() != self.shape.len() {
            return Err(IngestError::Metadata(format!(
                "Chunk shape {:?} does not match shape {:?}",
                self.chunk_shape, self.shape
            )));
        }
        if self
            .chunk_shape
            .iter()
            .zip(&self.shape)
            .any(|(&c, &n)| c > n || (c == 0 && n > 0))
        {
            return Err(IngestError::Metadata(format!(
                "Chunk shape {:?} not within shape {:?}",
                self.chunk_shape, self.shape
            )));
        }
        if let Some(tags) = &self.axistags {
            if tags.len() != self.shape.len() {
                return Err(IngestError::Metadata(format!(
                    "Axis tags '{}' do not match shape {:?}",
                    tags.keys(),
                    self.shape
                )));
            }
        }
        Ok(())
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let metadata: Self =
            serde_json::from_slice(bytes).map_err(|e| IngestError::Metadata(e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }
}
