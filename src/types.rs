//! Core data types: element types, axis tags, regions of interest

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types supported by sources and datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Rust element types that map onto a [`DataType`]
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Append the little-endian encoding of `self`
    fn extend_le_bytes(&self, out: &mut Vec<u8>);

    /// Decode from exactly `size_in_bytes` little-endian bytes
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dt;

                fn extend_le_bytes(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// Role of an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisType {
    Space,
    Time,
    Channel,
}

/// Axis key from the fixed alphabet `t, x, y, z, c`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisKey {
    #[serde(rename = "t")]
    Time,
    #[serde(rename = "x")]
    X,
    #[serde(rename = "y")]
    Y,
    #[serde(rename = "z")]
    Z,
    #[serde(rename = "c")]
    Channel,
}

impl AxisKey {
    /// Parse a single-character key
    pub fn from_char(key: char) -> Option<Self> {
        match key {
            't' => Some(AxisKey::Time),
            'x' => Some(AxisKey::X),
            'y' => Some(AxisKey::Y),
            'z' => Some(AxisKey::Z),
            'c' => Some(AxisKey::Channel),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            AxisKey::Time => 't',
            AxisKey::X => 'x',
            AxisKey::Y => 'y',
            AxisKey::Z => 'z',
            AxisKey::Channel => 'c',
        }
    }

    /// The role an axis with this key conventionally has
    pub fn default_type(&self) -> AxisType {
        match self {
            AxisKey::Time => AxisType::Time,
            AxisKey::Channel => AxisType::Channel,
            AxisKey::X | AxisKey::Y | AxisKey::Z => AxisType::Space,
        }
    }
}

impl fmt::Display for AxisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A single keyed axis with its role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisInfo {
    pub key: AxisKey,
    #[serde(rename = "type")]
    pub axis_type: AxisType,
}

impl AxisInfo {
    pub fn new(key: AxisKey, axis_type: AxisType) -> Self {
        Self { key, axis_type }
    }

    /// Axis with the conventional role for its key
    pub fn from_key(key: AxisKey) -> Self {
        Self::new(key, key.default_type())
    }
}

/// Ordered, key-unique axis descriptors. Order is the dimension order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AxisTagsRepr", into = "AxisTagsRepr")]
pub struct AxisTags {
    axes: Vec<AxisInfo>,
}

#[derive(Serialize, Deserialize)]
struct AxisTagsRepr {
    axes: Vec<AxisInfo>,
}

impl TryFrom<AxisTagsRepr> for AxisTags {
    type Error = IngestError;

    fn try_from(repr: AxisTagsRepr) -> Result<Self> {
        AxisTags::new(repr.axes)
    }
}

impl From<AxisTags> for AxisTagsRepr {
    fn from(tags: AxisTags) -> Self {
        Self { axes: tags.axes }
    }
}

impl AxisTags {
    /// Create axis tags, rejecting duplicate keys
    pub fn new(axes: Vec<AxisInfo>) -> Result<Self> {
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].iter().any(|a| a.key == axis.key) {
                return Err(IngestError::InvalidDimensions(format!(
                    "Duplicate axis key '{}'",
                    axis.key
                )));
            }
        }
        Ok(Self { axes })
    }

    /// Parse from a key string such as `"txyzc"`
    pub fn from_keys(keys: &str) -> Result<Self> {
        let axes = keys
            .chars()
            .map(|k| {
                AxisKey::from_char(k)
                    .map(AxisInfo::from_key)
                    .ok_or_else(|| IngestError::InvalidDimensions(format!("Unknown axis key '{k}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(axes)
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AxisInfo> {
        self.axes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AxisInfo> {
        self.axes.iter()
    }

    /// Position of the axis with the given key
    pub fn index_of(&self, key: AxisKey) -> Option<usize> {
        self.axes.iter().position(|a| a.key == key)
    }

    pub fn keys(&self) -> String {
        self.axes.iter().map(|a| a.key.as_char()).collect()
    }

    /// Insert an axis at `index`
    pub fn insert(&mut self, index: usize, axis: AxisInfo) -> Result<()> {
        if self.index_of(axis.key).is_some() {
            return Err(IngestError::InvalidDimensions(format!(
                "Axis '{}' already present",
                axis.key
            )));
        }
        if index > self.axes.len() {
            return Err(IngestError::OutOfBounds(format!(
                "Axis position {index} beyond {} axes",
                self.axes.len()
            )));
        }
        self.axes.insert(index, axis);
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Value range hint for a volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Rectangular region: per-axis half-open `[start, stop)` bounds
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    pub start: Vec<usize>,
    pub stop: Vec<usize>,
}

impl Roi {
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Result<Self> {
        if start.len() != stop.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "ROI start has {} axes but stop has {}",
                start.len(),
                stop.len()
            )));
        }
        if start.iter().zip(&stop).any(|(a, b)| a > b) {
            return Err(IngestError::InvalidDimensions(format!(
                "ROI start {start:?} exceeds stop {stop:?}"
            )));
        }
        Ok(Self { start, stop })
    }

    /// The region covering a whole array of `shape`
    pub fn full(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    pub fn extents(&self) -> Vec<usize> {
        self.start.iter().zip(&self.stop).map(|(a, b)| b - a).collect()
    }

    pub fn num_elements(&self) -> usize {
        self.extents().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// Check `0 <= start <= stop <= shape` on every axis
    pub fn is_within(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len() && self.stop.iter().zip(shape).all(|(s, n)| s <= n)
    }

    /// Overlap with another region, if non-empty
    pub fn intersect(&self, other: &Roi) -> Option<Roi> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let start: Vec<usize> = self
            .start
            .iter()
            .zip(&other.start)
            .map(|(a, b)| *a.max(b))
            .collect();
        let stop: Vec<usize> = self
            .stop
            .iter()
            .zip(&other.stop)
            .map(|(a, b)| *a.min(b))
            .collect();
        if start.iter().zip(&stop).all(|(a, b)| a < b) {
            Some(Roi { start, stop })
        } else {
            None
        }
    }

    /// Express this region relative to `origin`
    pub fn relative_to(&self, origin: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(origin).map(|(a, o)| a - o).collect(),
            stop: self.stop.iter().zip(origin).map(|(a, o)| a - o).collect(),
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.stop)
    }
}

/// A region plus its generation-order sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub seq: usize,
    pub roi: Roi,
}
