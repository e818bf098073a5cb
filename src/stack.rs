//! Virtual image stacks: a sequence of 2-D image files read as one array
//!
//! The reader does NOT cache pixel data. Every [`ArraySource::read`] call
//! re-decodes every file it touches, so direct access is slow, especially
//! through the stack axis. Callers wanting repeated access should put a
//! cache with large x-y blocks in front of it.

use crate::array::{ArrayBlock, ArrayMeta, ArraySource};
use crate::error::{IngestError, Result};
use crate::types::{AxisInfo, AxisKey, AxisTags, DataType, Element, Roi};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use log::{debug, trace, warn};
use ndarray::{ArrayViewD, Axis, IxDyn, Slice};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Separates patterns in a glob string list, e.g. `"/a/*.png//b/*.png"`
pub const PATTERN_DELIMITER: &str = "//";

/// Position of the stack axis in the combined `x, y, z, c` order
pub const STACK_AXIS: usize = 2;

/// Split a glob string list into its patterns, sorted
pub fn split_patterns(glob_string: &str) -> Vec<&str> {
    let mut patterns: Vec<&str> = glob_string
        .split(PATTERN_DELIMITER)
        .filter(|p| !p.is_empty())
        .collect();
    patterns.sort_unstable();
    patterns
}

/// Expand a glob string list into an ordered file list.
///
/// Matches are sorted within each pattern, and pattern groups are
/// concatenated in pattern order.
pub fn expand_glob_string(glob_string: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in split_patterns(glob_string) {
        let entries = glob::glob(pattern).map_err(|e| {
            IngestError::Configuration(format!("Invalid glob pattern '{pattern}': {e}"))
        })?;
        let mut matches: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping unreadable glob entry: {}", e);
                    None
                }
            })
            .collect();
        matches.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
        trace!("Pattern {} matched {} files", pattern, matches.len());
        files.extend(matches);
    }
    Ok(files)
}

/// Per-file geometry and pixel type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub dtype: DataType,
}

impl ImageInfo {
    /// Describe a decoded image
    pub fn of(image: &DynamicImage) -> Result<Self> {
        let color = image.color();
        let dtype = match color {
            image::ColorType::L8
            | image::ColorType::La8
            | image::ColorType::Rgb8
            | image::ColorType::Rgba8 => DataType::U8,
            image::ColorType::L16
            | image::ColorType::La16
            | image::ColorType::Rgb16
            | image::ColorType::Rgba16 => DataType::U16,
            image::ColorType::Rgb32F | image::ColorType::Rgba32F => DataType::F32,
            other => {
                return Err(IngestError::Decode(format!(
                    "Unsupported pixel layout {other:?}"
                )))
            }
        };
        let (width, height) = image.dimensions();
        Ok(Self {
            width: width as usize,
            height: height as usize,
            channels: usize::from(color.channel_count()),
            dtype,
        })
    }

    /// Probe a file on disk
    pub fn probe(path: &Path) -> Result<Self> {
        Self::of(&open_image(path)?)
    }

    /// Per-file shape in `x, y, c` order
    pub fn shape(&self) -> Vec<usize> {
        vec![self.width, self.height, self.channels]
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| {
        debug!("Failed to open {}: {}", path.display(), e);
        IngestError::FileOpen(path.to_path_buf())
    })
}

fn le_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::DATA_TYPE.size_in_bytes());
    for v in values {
        v.extend_le_bytes(&mut out);
    }
    out
}

/// Interleaved pixel bytes in row-major `y, x, c` order
fn pixel_bytes(image: DynamicImage) -> Result<Vec<u8>> {
    match image {
        DynamicImage::ImageLuma8(buf) => Ok(buf.into_raw()),
        DynamicImage::ImageLumaA8(buf) => Ok(buf.into_raw()),
        DynamicImage::ImageRgb8(buf) => Ok(buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => Ok(buf.into_raw()),
        DynamicImage::ImageLuma16(buf) => Ok(le_bytes(buf.as_raw())),
        DynamicImage::ImageLumaA16(buf) => Ok(le_bytes(buf.as_raw())),
        DynamicImage::ImageRgb16(buf) => Ok(le_bytes(buf.as_raw())),
        DynamicImage::ImageRgba16(buf) => Ok(le_bytes(buf.as_raw())),
        DynamicImage::ImageRgb32F(buf) => Ok(le_bytes(buf.as_raw())),
        DynamicImage::ImageRgba32F(buf) => Ok(le_bytes(buf.as_raw())),
        other => Err(IngestError::Decode(format!(
            "Unsupported pixel layout {:?}",
            other.color()
        ))),
    }
}

/// Decode `roi` (in `x, y, z, c` order) from the files covering its z range
fn read_stack_region(files: &[PathBuf], reference: ImageInfo, roi: &Roi) -> Result<ArrayBlock> {
    let mut block = ArrayBlock::zeros(reference.dtype, &roi.extents());
    let item = reference.dtype.size_in_bytes();

    for (i, path) in files.iter().enumerate() {
        trace!("Reading image: {}", path.display());
        let image = open_image(path)?;
        let found = ImageInfo::of(&image)?;
        if found != reference {
            return Err(IngestError::ShapeMismatch {
                path: path.clone(),
                expected: reference.shape(),
                expected_dtype: reference.dtype,
                found: found.shape(),
                found_dtype: found.dtype,
            });
        }

        let bytes = pixel_bytes(image)?;
        let plane = ArrayViewD::from_shape(
            IxDyn(&[reference.height, reference.width, reference.channels, item]),
            &bytes[..],
        )?
        .permuted_axes(IxDyn(&[1, 0, 2, 3]));
        let region = plane.slice_each_axis(|ax| match ax.axis.index() {
            0 => Slice::from(roi.start[0]..roi.stop[0]),
            1 => Slice::from(roi.start[1]..roi.stop[1]),
            2 => Slice::from(roi.start[3]..roi.stop[3]),
            _ => Slice::from(..),
        });
        block
            .raw_mut()
            .index_axis_mut(Axis(STACK_AXIS), i)
            .assign(&region);
    }

    Ok(block)
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    files: Arc<Vec<PathBuf>>,
    info: Option<ImageInfo>,
}

impl Snapshot {
    fn meta(&self) -> Result<Option<ArrayMeta>> {
        let Some(info) = self.info else {
            return Ok(None);
        };
        let mut axistags = AxisTags::from_keys("xyc")?;
        axistags.insert(STACK_AXIS, AxisInfo::from_key(AxisKey::Z))?;
        let shape = vec![info.width, info.height, self.files.len(), info.channels];
        ArrayMeta::new(shape, info.dtype, axistags).map(Some)
    }

    /// Decode `roi` from this file list only
    async fn read(&self, roi: &Roi) -> Result<ArrayBlock> {
        let (Some(meta), Some(reference)) = (self.meta()?, self.info) else {
            return Err(IngestError::Configuration(
                "Stack reader has no files".to_string(),
            ));
        };
        meta.check_roi(roi)?;

        let files = self
            .files
            .get(roi.start[STACK_AXIS]..roi.stop[STACK_AXIS])
            .ok_or_else(|| {
                IngestError::OutOfBounds(format!(
                    "Region {} exceeds the {} files of the stack",
                    roi,
                    self.files.len()
                ))
            })?
            .to_vec();
        let roi = roi.clone();
        tokio::task::spawn_blocking(move || read_stack_region(&files, reference, &roi))
            .await
            .map_err(|e| IngestError::Task(e.to_string()))?
    }
}

#[derive(Debug, Default)]
struct StackState {
    glob_string: Option<String>,
    dirty: bool,
    generation: u64,
    snapshot: Snapshot,
}

/// Read-only `x, y, z, c` array over an ordered list of image files
#[derive(Debug, Default)]
pub struct VirtualStackReader {
    state: RwLock<StackState>,
}

impl VirtualStackReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source glob string list. Derived state is recomputed lazily.
    pub fn set_glob_string(&self, glob_string: impl Into<String>) {
        let mut state = self.state.write();
        state.glob_string = Some(glob_string.into());
        state.dirty = true;
        state.generation += 1;
    }

    /// Set the glob string and compute the stack's metadata immediately
    pub fn configure(&self, glob_string: impl Into<String>) -> Result<Option<ArrayMeta>> {
        self.set_glob_string(glob_string);
        self.stack_meta()
    }

    pub fn glob_string(&self) -> Option<String> {
        self.state.read().glob_string.clone()
    }

    /// Incremented on every change of the source description
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// The ordered file list
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        Ok(self.refresh()?.files.as_ref().clone())
    }

    /// Stack metadata, or `None` when the glob string matched no files
    pub fn stack_meta(&self) -> Result<Option<ArrayMeta>> {
        self.refresh()?.meta()
    }

    fn refresh(&self) -> Result<Snapshot> {
        {
            let state = self.state.read();
            if !state.dirty {
                if state.glob_string.is_none() {
                    return Err(IngestError::Configuration(
                        "No glob string set on stack reader".to_string(),
                    ));
                }
                return Ok(state.snapshot.clone());
            }
        }

        let mut state = self.state.write();
        if !state.dirty {
            return Ok(state.snapshot.clone());
        }
        let Some(glob_string) = state.glob_string.clone() else {
            return Err(IngestError::Configuration(
                "No glob string set on stack reader".to_string(),
            ));
        };

        let files = expand_glob_string(&glob_string)?;
        let info = match files.first() {
            Some(first) => Some(ImageInfo::probe(first)?),
            None => None,
        };
        debug!(
            "Stack '{}': {} files, per-file {:?}",
            glob_string,
            files.len(),
            info.map(|i| i.shape())
        );

        state.snapshot = Snapshot {
            files: Arc::new(files),
            info,
        };
        state.dirty = false;
        Ok(state.snapshot.clone())
    }
}

#[async_trait]
impl ArraySource for VirtualStackReader {
    fn meta(&self) -> Result<ArrayMeta> {
        self.stack_meta()?.ok_or_else(|| {
            IngestError::Configuration(format!(
                "Glob string {:?} matched no files",
                self.glob_string().unwrap_or_default()
            ))
        })
    }

    async fn read(&self, roi: &Roi) -> Result<ArrayBlock> {
        // One snapshot for both the bounds check and the file slice
        let snapshot = self.refresh()?;
        snapshot.read(roi).await
    }
}
