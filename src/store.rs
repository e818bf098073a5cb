//! Chunked container: groups and chunked datasets over an [`IOManager`]

use crate::array::ArrayBlock;
use crate::error::{IngestError, Result};
use crate::io::{create_io_manager, IOManager, MemoryIOManager};
use crate::layout::ChunkGrid;
use crate::metadata::{DatasetMetadata, GroupMetadata, DATASET_METADATA_KEY, GROUP_METADATA_KEY};
use crate::types::{AxisTags, DataType, Roi, ValueRange};
use crate::utils::{ancestors, chunk_key, join_key, normalize_path};
use futures::future::try_join_all;
use log::{debug, trace};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, Slice};
use std::sync::Arc;

/// Slice of `roi` along `axis`; the trailing element-byte axis is taken whole
fn axis_slice(roi: &Roi, axis: usize) -> Slice {
    if axis < roi.ndim() {
        Slice::from(roi.start[axis]..roi.stop[axis])
    } else {
        Slice::from(..)
    }
}

/// Handle to an open chunked-array container
#[derive(Clone)]
pub struct ChunkedContainer {
    io: Arc<dyn IOManager>,
}

impl ChunkedContainer {
    /// Open a container by URL (`file://`, bare path or `memory://`)
    pub async fn open(url: &str) -> Result<Self> {
        let io = create_io_manager(url).await?;
        Ok(Self::from_io(Arc::from(io)))
    }

    pub fn from_io(io: Arc<dyn IOManager>) -> Self {
        Self { io }
    }

    /// A fresh in-memory container
    pub fn memory() -> Self {
        Self::from_io(Arc::new(MemoryIOManager::new()))
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.io
    }

    /// Whether any node exists at `path`
    pub async fn contains(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        self.io.exists(&path).await
    }

    /// Whether a dataset exists at `path`
    pub async fn contains_dataset(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        self.io.exists(&join_key(&path, DATASET_METADATA_KEY)).await
    }

    /// Delete the node at `path` and everything under it
    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        self.io
            .delete_all(&path)
            .await
            .map_err(|e| IngestError::StorageWrite(format!("delete {path}: {e}")))
    }

    /// Create a group and any missing parents
    pub async fn create_group(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let mut groups = ancestors(&path);
        groups.push(&path);
        for group in groups {
            self.ensure_group(group).await?;
        }
        Ok(())
    }

    async fn ensure_group(&self, group: &str) -> Result<()> {
        if self.io.exists(&join_key(group, DATASET_METADATA_KEY)).await? {
            return Err(IngestError::Configuration(format!(
                "'{group}' is a dataset, not a group"
            )));
        }
        let marker = join_key(group, GROUP_METADATA_KEY);
        if !self.io.exists(&marker).await? {
            trace!("Creating group {}", group);
            let json = serde_json::to_vec_pretty(&GroupMetadata::default())?;
            self.io
                .write(&marker, &json)
                .await
                .map_err(|e| IngestError::StorageWrite(format!("{marker}: {e}")))?;
        }
        Ok(())
    }

    /// Create a dataset, replacing whatever exists at `path`
    pub async fn create_dataset(&self, path: &str, metadata: DatasetMetadata) -> Result<Dataset> {
        let path = normalize_path(path)?;
        metadata.validate()?;

        if self.io.exists(&path).await? {
            debug!("Replacing existing node at {}", path);
            self.delete(&path).await?;
        }
        for group in ancestors(&path) {
            self.ensure_group(group).await?;
        }

        let dataset = Dataset::new(Arc::clone(&self.io), path, metadata)?;
        dataset.flush_metadata().await?;
        Ok(dataset)
    }

    /// Open an existing dataset
    pub async fn open_dataset(&self, path: &str) -> Result<Dataset> {
        let path = normalize_path(path)?;
        let bytes = self
            .io
            .read(&join_key(&path, DATASET_METADATA_KEY))
            .await
            .map_err(|e| match e {
                IngestError::NotFound(_) => IngestError::NotFound(format!("dataset {path}")),
                other => other,
            })?;
        let metadata = DatasetMetadata::from_json(&bytes)?;
        Dataset::new(Arc::clone(&self.io), path, metadata)
    }
}

/// A chunked N-D dataset inside a container
pub struct Dataset {
    io: Arc<dyn IOManager>,
    path: String,
    metadata: DatasetMetadata,
    grid: ChunkGrid,
}

impl Dataset {
    fn new(io: Arc<dyn IOManager>, path: String, metadata: DatasetMetadata) -> Result<Self> {
        let grid = ChunkGrid::new(metadata.shape.clone(), metadata.chunk_shape.clone())?;
        Ok(Self {
            io,
            path,
            metadata,
            grid,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn shape(&self) -> &[usize] {
        &self.metadata.shape
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.metadata.chunk_shape
    }

    pub fn dtype(&self) -> DataType {
        self.metadata.data_type
    }

    pub fn axistags(&self) -> Option<&AxisTags> {
        self.metadata.axistags.as_ref()
    }

    /// Persist axis tags as dataset metadata
    pub async fn set_axistags(&mut self, axistags: AxisTags) -> Result<()> {
        if axistags.len() != self.shape().len() {
            return Err(IngestError::InvalidDimensions(format!(
                "Axis tags '{}' do not match shape {:?}",
                axistags.keys(),
                self.shape()
            )));
        }
        self.metadata.axistags = Some(axistags);
        self.flush_metadata().await
    }

    pub fn set_drange(&mut self, drange: ValueRange) {
        self.metadata.drange = Some(drange);
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.attributes.insert(key.into(), value.into());
    }

    /// Write the metadata document
    pub async fn flush_metadata(&self) -> Result<()> {
        let key = join_key(&self.path, DATASET_METADATA_KEY);
        let json = self.metadata.to_json()?;
        self.io
            .write(&key, &json)
            .await
            .map_err(|e| IngestError::StorageWrite(format!("{key}: {e}")))
    }

    /// Keys of the chunks present in storage
    pub async fn stored_chunks(&self) -> Result<Vec<String>> {
        self.io.list(&join_key(&self.path, "c")).await
    }

    fn chunk_dims(&self) -> Vec<usize> {
        let mut dims = self.metadata.chunk_shape.clone();
        dims.push(self.dtype().size_in_bytes());
        dims
    }

    fn chunk_bytes(&self) -> usize {
        self.grid.chunk_num_elements() * self.dtype().size_in_bytes()
    }

    fn chunk_path(&self, coords: &[usize]) -> String {
        join_key(&self.path, &chunk_key(coords))
    }

    async fn load_chunk(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.io.read(key).await {
            Ok(bytes) => Ok(Some(
                self.metadata.compression.decode(&bytes, self.chunk_bytes())?,
            )),
            Err(IngestError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn check_region(&self, roi: &Roi) -> Result<()> {
        if !roi.is_within(self.shape()) {
            return Err(IngestError::OutOfBounds(format!(
                "ROI {} outside dataset {} of shape {:?}",
                roi,
                self.path,
                self.shape()
            )));
        }
        Ok(())
    }

    /// Write contiguous C-ordered element bytes covering `roi`, without copying them first
    pub async fn write_direct(&self, roi: &Roi, bytes: &[u8]) -> Result<()> {
        let mut dims = roi.extents();
        dims.push(self.dtype().size_in_bytes());
        let view = ArrayViewD::from_shape(IxDyn(&dims), bytes)?;
        self.write_view(roi, view).await
    }

    /// Write an arbitrarily strided byte view covering `roi`
    pub async fn write_region(&self, roi: &Roi, data: ArrayViewD<'_, u8>) -> Result<()> {
        self.write_view(roi, data).await
    }

    /// Write a block, taking the direct path when it is contiguous
    pub async fn write_block(&self, roi: &Roi, block: &ArrayBlock) -> Result<()> {
        if block.dtype() != self.dtype() {
            return Err(IngestError::InvalidDimensions(format!(
                "Block of {} written to {} dataset {}",
                block.dtype(),
                self.dtype(),
                self.path
            )));
        }
        match block.as_contiguous_bytes() {
            Some(bytes) => self.write_direct(roi, bytes).await,
            None => self.write_region(roi, block.view()).await,
        }
    }

    async fn write_view(&self, roi: &Roi, data: ArrayViewD<'_, u8>) -> Result<()> {
        self.check_region(roi)?;
        let mut expected = roi.extents();
        expected.push(self.dtype().size_in_bytes());
        if data.shape() != expected.as_slice() {
            return Err(IngestError::InvalidDimensions(format!(
                "Data of shape {:?} does not fit ROI {} (expected {:?})",
                data.shape(),
                roi,
                expected
            )));
        }

        let shape = self.shape().to_vec();
        for coords in self.grid.chunks_intersecting(roi) {
            let chunk_roi = self.grid.chunk_region(&coords);
            let Some(overlap) = chunk_roi.intersect(roi) else {
                continue;
            };
            let key = self.chunk_path(&coords);

            // Partially covered chunks keep whatever was stored before
            let valid = chunk_roi.intersect(&Roi::full(&shape));
            let mut buffer = if valid.as_ref() == Some(&overlap) {
                vec![0u8; self.chunk_bytes()]
            } else {
                self.load_chunk(&key)
                    .await?
                    .unwrap_or_else(|| vec![0u8; self.chunk_bytes()])
            };

            {
                let dst = overlap.relative_to(&chunk_roi.start);
                let src = overlap.relative_to(&roi.start);
                let mut chunk = ArrayViewMutD::from_shape(IxDyn(&self.chunk_dims()), &mut buffer[..])?;
                chunk
                    .slice_each_axis_mut(|ax| axis_slice(&dst, ax.axis.index()))
                    .assign(&data.slice_each_axis(|ax| axis_slice(&src, ax.axis.index())));
            }

            let encoded = self
                .metadata
                .compression
                .encode(&buffer, self.metadata.compression_level)?;
            trace!("Writing chunk {} ({} bytes)", key, encoded.len());
            self.io
                .write(&key, &encoded)
                .await
                .map_err(|e| IngestError::StorageWrite(format!("{key}: {e}")))?;
        }
        Ok(())
    }

    /// Read `roi` back as a block. Chunks never written read as zeros.
    pub async fn read_region(&self, roi: &Roi) -> Result<ArrayBlock> {
        self.check_region(roi)?;

        let coords_list = self.grid.chunks_intersecting(roi);
        let chunks = try_join_all(coords_list.iter().map(|coords| async move {
            let data = self.load_chunk(&self.chunk_path(coords)).await?;
            Ok::<_, IngestError>((coords, data))
        }))
        .await?;

        let mut dims = roi.extents();
        dims.push(self.dtype().size_in_bytes());
        let mut out = ArrayD::<u8>::zeros(IxDyn(&dims));

        for (coords, data) in chunks {
            let Some(buffer) = data else {
                continue;
            };
            let chunk_roi = self.grid.chunk_region(coords);
            let Some(overlap) = chunk_roi.intersect(roi) else {
                continue;
            };
            let chunk = ArrayViewD::from_shape(IxDyn(&self.chunk_dims()), &buffer[..])?;
            let src = overlap.relative_to(&chunk_roi.start);
            let dst = overlap.relative_to(&roi.start);
            out.slice_each_axis_mut(|ax| axis_slice(&dst, ax.axis.index()))
                .assign(&chunk.slice_each_axis(|ax| axis_slice(&src, ax.axis.index())));
        }

        ArrayBlock::from_raw(self.dtype(), out)
    }
}
