//! Image stack to chunked dataset, one stack slice at a time

use crate::array::ArraySource;
use crate::config::WriterConfig;
use crate::error::{IngestError, Result};
use crate::metadata::DatasetMetadata;
use crate::pipeline::ProgressObserver;
use crate::stack::VirtualStackReader;
use crate::store::ChunkedContainer;
use crate::types::{AxisKey, Roi};
use crate::utils::percent;
use log::{debug, info, trace};
use std::sync::Arc;

/// Copies a [`VirtualStackReader`] into a chunked dataset image by image.
///
/// Every image is fetched and written strictly in sequence. The boolean
/// result is cached until the glob string, destination or path changes.
pub struct StackToChunkedDatasetBridge {
    reader: VirtualStackReader,
    destination: Option<ChunkedContainer>,
    path: Option<String>,
    config: WriterConfig,
    observer: Option<Arc<dyn ProgressObserver>>,
    result: Option<bool>,
    result_generation: u64,
}

impl Default for StackToChunkedDatasetBridge {
    fn default() -> Self {
        Self::new(WriterConfig::default())
    }
}

impl StackToChunkedDatasetBridge {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            reader: VirtualStackReader::new(),
            destination: None,
            path: None,
            config,
            observer: None,
            result: None,
            result_generation: 0,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn reader(&self) -> &VirtualStackReader {
        &self.reader
    }

    pub fn set_glob_string(&mut self, glob_string: impl Into<String>) {
        self.reader.set_glob_string(glob_string);
        self.result = None;
    }

    pub fn set_destination(&mut self, destination: ChunkedContainer) {
        self.destination = Some(destination);
        self.result = None;
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
        self.result = None;
    }

    /// Whether a successful result is cached and still valid
    pub fn is_current(&self) -> bool {
        self.result.is_some() && self.result_generation == self.reader.generation()
    }

    fn report(&self, percent: u8) {
        if let Some(observer) = &self.observer {
            observer.on_progress(percent);
        }
    }

    /// Copy the stack, or return the cached result if nothing changed
    pub async fn write_image(&mut self) -> Result<bool> {
        if self.is_current() {
            trace!("Stack copy is up to date");
            return Ok(true);
        }
        self.result = None;
        let generation = self.reader.generation();
        let written = self.copy_stack().await?;
        self.result = Some(written);
        self.result_generation = generation;
        Ok(written)
    }

    async fn copy_stack(&self) -> Result<bool> {
        let destination = self.destination.as_ref().ok_or_else(|| {
            IngestError::Configuration("No destination container set".to_string())
        })?;
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| IngestError::Configuration("No dataset path set".to_string()))?;
        self.config.validate()?;

        let meta = self.reader.meta()?;
        let z_axis = meta.axistags.index_of(AxisKey::Z).ok_or_else(|| {
            IngestError::Configuration(format!(
                "Stack axis tags '{}' have no z axis",
                meta.axistags.keys()
            ))
        })?;
        let num_images = meta.shape[z_axis];

        let chunk_shape =
            self.config
                .planner()
                .compute_chunk_shape(&meta.shape, &meta.axistags, meta.dtype)?;
        debug!("Copying {} images with chunk shape {:?}", num_images, chunk_shape);

        let metadata = DatasetMetadata::new(meta.shape.clone(), meta.dtype, chunk_shape)
            .with_compression(self.config.compression, self.config.compression_level);
        let mut dataset = destination.create_dataset(path, metadata).await?;

        self.report(0);
        for z in 0..num_images {
            // Exactly one whole image from the stack
            let mut roi = Roi::full(&meta.shape);
            roi.start[z_axis] = z;
            roi.stop[z_axis] = z + 1;

            let block = self.reader.read(&roi).await?;
            dataset.write_block(&roi, &block).await?;
            self.report(percent(z + 1, num_images));
        }

        dataset.set_axistags(meta.axistags.clone()).await?;
        info!("Copied {} images to {}", num_images, dataset.path());
        self.report(100);
        Ok(true)
    }
}
