//! Chunk layout planning: storage chunk shapes and request tiling

use crate::error::{IngestError, Result};
use crate::types::{AxisKey, AxisTags, AxisType, DataType, Roi, Tile};
use serde::{Deserialize, Serialize};

/// Default chunk byte budget. Chunks of 300k or less tend to work best.
pub const DEFAULT_TARGET_CHUNK_BYTES: usize = 300_000;

/// How many chunks wide a request tile is along each kind of axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileMultipliers {
    pub time: usize,
    pub space: usize,
    /// There is rarely an advantage to splitting channels
    pub channel: usize,
}

impl TileMultipliers {
    pub fn for_axis(&self, axis_type: AxisType) -> usize {
        match axis_type {
            AxisType::Time => self.time,
            AxisType::Space => self.space,
            AxisType::Channel => self.channel,
        }
    }
}

impl Default for TileMultipliers {
    fn default() -> Self {
        Self {
            time: 1,
            space: 5,
            channel: 100,
        }
    }
}

/// Derives chunk shapes and tile decompositions from a byte budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayoutPlanner {
    pub target_chunk_bytes: usize,
    pub multipliers: TileMultipliers,
}

impl Default for ChunkLayoutPlanner {
    fn default() -> Self {
        Self {
            target_chunk_bytes: DEFAULT_TARGET_CHUNK_BYTES,
            multipliers: TileMultipliers::default(),
        }
    }
}

/// Largest `d` with `d^3 <= q`
fn integer_cbrt(q: usize) -> usize {
    let mut d = (q as f64).cbrt().floor() as usize;
    while d > 0 && d.saturating_mul(d).saturating_mul(d) > q {
        d -= 1;
    }
    while (d + 1).saturating_mul(d + 1).saturating_mul(d + 1) <= q {
        d += 1;
    }
    d
}

fn check_rank(shape: &[usize], axistags: &AxisTags) -> Result<()> {
    if shape.len() != axistags.len() {
        return Err(IngestError::InvalidDimensions(format!(
            "Shape {:?} does not match axis tags '{}'",
            shape,
            axistags.keys()
        )));
    }
    Ok(())
}

impl ChunkLayoutPlanner {
    pub fn new(target_chunk_bytes: usize, multipliers: TileMultipliers) -> Self {
        Self {
            target_chunk_bytes,
            multipliers,
        }
    }

    /// Side length of a roughly cubic chunk fitting the budget
    pub fn cube_dim(&self, num_channels: usize, dtype: DataType) -> usize {
        let column_bytes = num_channels.max(1) * dtype.size_in_bytes();
        integer_cbrt(self.target_chunk_bytes / column_bytes)
    }

    /// Storage chunk shape: one time point, a cube of space, all channels.
    ///
    /// Every extent is clamped to the data shape. Fails when a single
    /// column of channels does not fit the byte budget.
    pub fn compute_chunk_shape(
        &self,
        shape: &[usize],
        axistags: &AxisTags,
        dtype: DataType,
    ) -> Result<Vec<usize>> {
        check_rank(shape, axistags)?;

        let num_channels = axistags
            .index_of(AxisKey::Channel)
            .map(|i| shape[i])
            .unwrap_or(1);
        let cube_dim = self.cube_dim(num_channels, dtype);
        if cube_dim == 0 {
            return Err(IngestError::Configuration(format!(
                "{} channels of {} ({} bytes each) exceed the {} byte chunk budget",
                num_channels,
                dtype,
                dtype.size_in_bytes(),
                self.target_chunk_bytes
            )));
        }

        let chunk_shape = axistags
            .iter()
            .zip(shape)
            .map(|(axis, &extent)| {
                let target = match axis.axis_type {
                    AxisType::Time => 1,
                    AxisType::Space => cube_dim,
                    AxisType::Channel => num_channels,
                };
                target.min(extent)
            })
            .collect();
        Ok(chunk_shape)
    }

    /// Request tile shape: a multiple of the chunk shape, clamped to the data
    pub fn tile_shape(
        &self,
        shape: &[usize],
        axistags: &AxisTags,
        chunk_shape: &[usize],
    ) -> Result<Vec<usize>> {
        check_rank(shape, axistags)?;
        if chunk_shape.len() != shape.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "Chunk shape {:?} does not match shape {:?}",
                chunk_shape, shape
            )));
        }
        Ok(axistags
            .iter()
            .zip(shape.iter().zip(chunk_shape))
            .map(|(axis, (&extent, &chunk))| {
                (chunk * self.multipliers.for_axis(axis.axis_type)).min(extent)
            })
            .collect())
    }

    /// Decompose the full extent into disjoint tiles.
    ///
    /// Tiles are ordered with the last axis varying fastest.
    pub fn compute_tile_list(
        &self,
        shape: &[usize],
        axistags: &AxisTags,
        chunk_shape: &[usize],
    ) -> Result<Vec<Tile>> {
        let tile_shape = self.tile_shape(shape, axistags, chunk_shape)?;
        if shape.iter().any(|&n| n == 0) {
            return Ok(Vec::new());
        }
        if tile_shape.iter().any(|&t| t == 0) {
            return Err(IngestError::InvalidDimensions(format!(
                "Tile shape {:?} has a zero extent for shape {:?}",
                tile_shape, shape
            )));
        }

        let counts: Vec<usize> = shape
            .iter()
            .zip(&tile_shape)
            .map(|(n, t)| n.div_ceil(*t))
            .collect();
        let total: usize = counts.iter().product();
        let mut tiles = Vec::with_capacity(total);
        let mut coords = vec![0usize; shape.len()];

        for seq in 0..total {
            let start: Vec<usize> = coords.iter().zip(&tile_shape).map(|(c, t)| c * t).collect();
            let stop: Vec<usize> = start
                .iter()
                .zip(&tile_shape)
                .zip(shape)
                .map(|((s, t), n)| (s + t).min(*n))
                .collect();
            tiles.push(Tile {
                seq,
                roi: Roi { start, stop },
            });

            for dim in (0..coords.len()).rev() {
                coords[dim] += 1;
                if coords[dim] < counts[dim] {
                    break;
                }
                coords[dim] = 0;
            }
        }

        Ok(tiles)
    }
}

/// Chunk shape using the default budget
pub fn compute_chunk_shape(shape: &[usize], axistags: &AxisTags, dtype: DataType) -> Result<Vec<usize>> {
    ChunkLayoutPlanner::default().compute_chunk_shape(shape, axistags, dtype)
}

/// Tile list using the default multipliers
pub fn compute_tile_list(shape: &[usize], axistags: &AxisTags, chunk_shape: &[usize]) -> Result<Vec<Tile>> {
    ChunkLayoutPlanner::default().compute_tile_list(shape, axistags, chunk_shape)
}

/// Regular grid of storage chunks over an array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    shape: Vec<usize>,
    chunk_shape: Vec<usize>,
}

impl ChunkGrid {
    pub fn new(shape: Vec<usize>, chunk_shape: Vec<usize>) -> Result<Self> {
        if shape.len() != chunk_shape.len() {
            return Err(IngestError::InvalidDimensions(
                "Chunk shape must have one extent per axis".to_string(),
            ));
        }
        if shape.iter().zip(&chunk_shape).any(|(&n, &c)| c == 0 && n > 0) {
            return Err(IngestError::InvalidDimensions(format!(
                "Chunk shape {:?} has a zero extent for shape {:?}",
                chunk_shape, shape
            )));
        }
        Ok(Self { shape, chunk_shape })
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }

    /// Number of chunks along each axis
    pub fn chunk_count(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&n, &c)| if n == 0 { 0 } else { n.div_ceil(c) })
            .collect()
    }

    pub fn total_chunks(&self) -> usize {
        self.chunk_count().iter().product()
    }

    pub fn chunk_num_elements(&self) -> usize {
        self.chunk_shape.iter().product()
    }

    /// Full (unclipped) element region of the chunk at `coords`
    pub fn chunk_region(&self, coords: &[usize]) -> Roi {
        let start: Vec<usize> = coords
            .iter()
            .zip(&self.chunk_shape)
            .map(|(c, s)| c * s)
            .collect();
        let stop = start.iter().zip(&self.chunk_shape).map(|(a, s)| a + s).collect();
        Roi { start, stop }
    }

    /// Coordinates of every chunk overlapping `roi`, last axis fastest
    pub fn chunks_intersecting(&self, roi: &Roi) -> Vec<Vec<usize>> {
        if roi.is_empty() || roi.ndim() != self.shape.len() {
            return Vec::new();
        }
        let lo: Vec<usize> = roi
            .start
            .iter()
            .zip(&self.chunk_shape)
            .map(|(s, c)| s / c)
            .collect();
        let hi: Vec<usize> = roi
            .stop
            .iter()
            .zip(&self.chunk_shape)
            .map(|(s, c)| s.div_ceil(*c))
            .collect();

        let mut out = Vec::new();
        let mut coords = lo.clone();
        loop {
            out.push(coords.clone());
            let mut dim = coords.len();
            loop {
                if dim == 0 {
                    return out;
                }
                dim -= 1;
                coords[dim] += 1;
                if coords[dim] < hi[dim] {
                    break;
                }
                coords[dim] = lo[dim];
            }
        }
    }
}
