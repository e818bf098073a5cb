//! Bounded-concurrency streaming of tiles from an array source into a dataset
//!
//! The writer plans a chunk shape and a tile list, then keeps at most
//! `window` tile fetches in flight. Fetches may complete in any order, but
//! the writer always waits for the oldest one first, so tiles are written in
//! tile-list order and the destination is only touched by the calling task.
//!
//! A failed run aborts immediately and may leave the dataset partially
//! written. Re-running deletes and recreates it from scratch.

use crate::array::{ArrayBlock, ArraySource};
use crate::config::WriterConfig;
use crate::error::{IngestError, Result};
use crate::metadata::DatasetMetadata;
use crate::store::{ChunkedContainer, Dataset};
use crate::types::Tile;
use crate::utils::{format_bytes, percent};
use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Receives integer completion percentages in `[0, 100]`, in order
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percent: u8);
}

impl<F> ProgressObserver for F
where
    F: Fn(u8) + Send + Sync,
{
    fn on_progress(&self, percent: u8) {
        self(percent)
    }
}

/// Lifecycle of a writer run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Planning,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

type Fetch = JoinHandle<Result<ArrayBlock>>;

/// FIFO of outstanding fetches. Dropping it aborts whatever is still running.
struct ActiveRequests {
    queue: VecDeque<(Tile, Fetch)>,
}

impl ActiveRequests {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn push(&mut self, tile: Tile, fetch: Fetch) {
        self.queue.push_back((tile, fetch));
    }

    fn pop_oldest(&mut self) -> Option<(Tile, Fetch)> {
        self.queue.pop_front()
    }
}

impl Drop for ActiveRequests {
    fn drop(&mut self) {
        for (_, fetch) in &self.queue {
            fetch.abort();
        }
    }
}

/// Streams an [`ArraySource`] into a freshly created chunked dataset
pub struct BoundedPipelineWriter {
    config: WriterConfig,
    observer: Option<Arc<dyn ProgressObserver>>,
    state: Mutex<WriterState>,
}

impl Default for BoundedPipelineWriter {
    fn default() -> Self {
        Self::new(WriterConfig::default())
    }
}

impl BoundedPipelineWriter {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            observer: None,
            state: Mutex::new(WriterState::Idle),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn state(&self) -> WriterState {
        *self.state.lock()
    }

    fn set_state(&self, state: WriterState) {
        trace!("Writer state -> {:?}", state);
        *self.state.lock() = state;
    }

    fn report(&self, percent: u8) {
        if let Some(observer) = &self.observer {
            observer.on_progress(percent);
        }
    }

    /// Copy all of `source` into a new dataset at `path`.
    ///
    /// Any existing node at `path` is deleted first. Returns `Ok(true)` once
    /// every tile and the axis metadata are written; any read or write
    /// failure aborts the run and is returned as an error.
    pub async fn run(
        &self,
        destination: &ChunkedContainer,
        path: &str,
        source: Arc<dyn ArraySource>,
    ) -> Result<bool> {
        let result = self.run_inner(destination, path, source).await;
        if result.is_err() {
            self.set_state(WriterState::Failed);
        }
        result
    }

    async fn run_inner(
        &self,
        destination: &ChunkedContainer,
        path: &str,
        source: Arc<dyn ArraySource>,
    ) -> Result<bool> {
        self.set_state(WriterState::Planning);
        self.config.validate()?;
        let meta = source.meta()?;
        let planner = self.config.planner();

        let chunk_shape = planner.compute_chunk_shape(&meta.shape, &meta.axistags, meta.dtype)?;
        debug!(
            "Chunk shape {:?} for {} array of shape {:?} ({})",
            chunk_shape,
            meta.dtype,
            meta.shape,
            format_bytes(meta.size_bytes())
        );
        let metadata = DatasetMetadata::new(meta.shape.clone(), meta.dtype, chunk_shape.clone())
            .with_compression(self.config.compression, self.config.compression_level);
        let mut dataset = destination.create_dataset(path, metadata).await?;

        let tiles = planner.compute_tile_list(&meta.shape, &meta.axistags, &chunk_shape)?;
        let total = tiles.len();
        debug!("Dividing work into {} pieces", total);

        self.set_state(WriterState::Streaming);
        self.report(0);
        self.stream(&dataset, &source, tiles).await?;

        self.set_state(WriterState::Finalizing);
        if let Some(drange) = meta.drange {
            dataset.set_drange(drange);
        }
        dataset.set_axistags(meta.axistags.clone()).await?;

        self.set_state(WriterState::Done);
        info!("Wrote {} tiles to {}", total, dataset.path());
        self.report(100);
        Ok(true)
    }

    fn submit(source: &Arc<dyn ArraySource>, tile: &Tile) -> Fetch {
        trace!("Creating request for tile {} {}", tile.seq, tile.roi);
        let source = Arc::clone(source);
        let roi = tile.roi.clone();
        tokio::spawn(async move { source.read(&roi).await })
    }

    async fn stream(
        &self,
        dataset: &Dataset,
        source: &Arc<dyn ArraySource>,
        tiles: Vec<Tile>,
    ) -> Result<()> {
        let total = tiles.len();
        let mut pending: VecDeque<Tile> = tiles.into();
        let mut active = ActiveRequests::new(self.config.window.min(total));

        while active.len() < self.config.window {
            let Some(tile) = pending.pop_front() else {
                break;
            };
            let fetch = Self::submit(source, &tile);
            active.push(tile, fetch);
        }

        let mut completed = 0;
        while let Some((tile, fetch)) = active.pop_oldest() {
            let block = fetch
                .await
                .map_err(|e| IngestError::Task(format!("tile {}: {e}", tile.seq)))??;
            Self::write_tile(dataset, &tile, &block).await?;
            // Release the block before the next fetch is issued
            drop(block);

            if let Some(next) = pending.pop_front() {
                let fetch = Self::submit(source, &next);
                active.push(next, fetch);
            }

            completed += 1;
            self.report(percent(completed, total));
            trace!("Request {} out of {} executed", completed, total);
        }
        Ok(())
    }

    async fn write_tile(dataset: &Dataset, tile: &Tile, block: &ArrayBlock) -> Result<()> {
        let extents = tile.roi.extents();
        if block.shape() != extents.as_slice() || block.dtype() != dataset.dtype() {
            return Err(IngestError::InvalidDimensions(format!(
                "Tile {} expected {} block of shape {:?}, source returned {} {:?}",
                tile.seq,
                dataset.dtype(),
                extents,
                block.dtype(),
                block.shape()
            )));
        }
        match block.as_contiguous_bytes() {
            Some(bytes) => dataset.write_direct(&tile.roi, bytes).await,
            None => dataset.write_region(&tile.roi, block.view()).await,
        }
    }
}
