//! Pipeline behaviour against instrumented in-memory sources and stores

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use stack_ingest::io::MemoryIOManager;
use stack_ingest::{
    ArrayBlock, ArrayMeta, ArraySource, AxisTags, BoundedPipelineWriter, ChunkedContainer,
    DataType, ErrorCategory, IOManager, IngestError, MemorySource, Roi, StorageBackend,
    TileMultipliers, ValueRange, WriterConfig, WriterState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn synthetic_f32(shape: &[usize]) -> (Vec<f32>, ArrayBlock) {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| i as f32 * 0.5 - 7.0).collect();
    let block = ArrayBlock::from_elements(shape, &values).unwrap();
    (values, block)
}

/// Wraps a source, delaying reads by a position-dependent amount and
/// counting concurrent reads.
struct InstrumentedSource {
    inner: MemorySource,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reads: AtomicUsize,
    fortran_blocks: bool,
    fail_at: Option<usize>,
}

impl InstrumentedSource {
    fn new(inner: MemorySource) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            fortran_blocks: false,
            fail_at: None,
        }
    }
}

#[async_trait]
impl ArraySource for InstrumentedSource {
    fn meta(&self) -> stack_ingest::Result<ArrayMeta> {
        self.inner.meta()
    }

    async fn read(&self, roi: &Roi) -> stack_ingest::Result<ArrayBlock> {
        let index = self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Later requests often finish first
        let delay = (7 * (roi.start.iter().sum::<usize>() + 3)) % 11;
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;

        let result = if self.fail_at == Some(index) {
            Err(IngestError::FileOpen(format!("tile-{index}.png").into()))
        } else {
            self.inner.read(roi).await.map(|block| {
                if self.fortran_blocks {
                    let mut f = ArrayBlock::zeros_fortran(block.dtype(), block.shape());
                    f.raw_mut().assign(block.raw());
                    f
                } else {
                    block
                }
            })
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn many_tile_config() -> WriterConfig {
    WriterConfig::default()
        .with_target_chunk_bytes(64)
        .with_multipliers(TileMultipliers {
            time: 1,
            space: 1,
            channel: 1,
        })
}

fn u8_source() -> (Vec<u8>, MemorySource) {
    let shape = [1, 40, 40, 4, 1];
    let n: usize = shape.iter().product();
    let values: Vec<u8> = (0..n).map(|i| (i * 31 % 251) as u8).collect();
    let block = ArrayBlock::from_elements(&shape, &values).unwrap();
    let source = MemorySource::new(block, AxisTags::from_keys("txyzc").unwrap()).unwrap();
    (values, source)
}

#[tokio::test]
async fn test_round_trip_5d() {
    init_logging();
    let shape = [1, 50, 50, 8, 3];
    let (values, block) = synthetic_f32(&shape);
    let tags = AxisTags::from_keys("txyzc").unwrap();
    let source = MemorySource::new(block, tags.clone())
        .unwrap()
        .with_drange(ValueRange::new(-7.0, 30000.0));

    let container = ChunkedContainer::memory();
    let writer = BoundedPipelineWriter::default();
    assert!(writer
        .run(&container, "volume/data", Arc::new(source))
        .await
        .unwrap());

    let dataset = container.open_dataset("volume/data").await.unwrap();
    assert_eq!(dataset.shape(), &shape);
    assert_eq!(dataset.dtype(), DataType::F32);
    assert_eq!(dataset.chunk_shape(), &[1, 29, 29, 8, 3]);
    assert_eq!(dataset.axistags(), Some(&tags));
    assert_eq!(
        dataset.metadata().drange,
        Some(ValueRange::new(-7.0, 30000.0))
    );

    let read = dataset.read_region(&Roi::full(&shape)).await.unwrap();
    assert_eq!(read.to_elements::<f32>().unwrap(), values);
}

#[tokio::test]
async fn test_round_trip_many_tiles_on_disk() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::TempDir::new()?;
    let shape = [1, 50, 50, 8, 3];
    let (values, block) = synthetic_f32(&shape);
    let source = MemorySource::new(block, AxisTags::from_keys("txyzc")?)?;

    let container = ChunkedContainer::open(&format!("file://{}", dir.path().display())).await?;
    assert_eq!(container.io().backend(), StorageBackend::FileSystem);
    let writer = BoundedPipelineWriter::new(WriterConfig::default().with_target_chunk_bytes(1000));
    assert!(writer.run(&container, "\\volume\\data", Arc::new(source)).await?);

    let dataset = container.open_dataset("volume/data").await?;
    assert_eq!(dataset.chunk_shape(), &[1, 4, 4, 4, 3]);
    let read = dataset.read_region(&Roi::full(&shape)).await?;
    assert_eq!(read.to_contiguous_bytes().len(), values.len() * 4);
    assert_eq!(read.to_elements::<f32>()?, values);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_never_exceeds_window() {
    init_logging();
    for window in [1usize, 3, 10] {
        let (values, inner) = u8_source();
        let source = Arc::new(InstrumentedSource::new(inner));
        let container = ChunkedContainer::memory();
        let writer = BoundedPipelineWriter::new(many_tile_config().with_window(window));

        assert!(writer
            .run(&container, "out", source.clone() as Arc<dyn ArraySource>)
            .await
            .unwrap());

        let tiles = source.reads.load(Ordering::SeqCst);
        assert_eq!(tiles, 100);
        let max = source.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= window.min(tiles), "window {window}: {max} in flight");
        if window > 1 {
            assert!(max > 1, "window {window} never overlapped fetches");
        }

        let dataset = container.open_dataset("out").await.unwrap();
        let read = dataset.read_region(&Roi::full(dataset.shape())).await.unwrap();
        assert_eq!(read.to_elements::<u8>().unwrap(), values);
    }
}

#[tokio::test]
async fn test_window_larger_than_tile_count() {
    let (_, inner) = u8_source();
    let source = Arc::new(InstrumentedSource::new(inner));
    let container = ChunkedContainer::memory();
    let config = WriterConfig::default()
        .with_target_chunk_bytes(64)
        .with_window(50);
    let writer = BoundedPipelineWriter::new(config);
    writer
        .run(&container, "out", source.clone() as Arc<dyn ArraySource>)
        .await
        .unwrap();

    // chunk 4 x 4 x 4, tiles 20 x 20 x 4
    let tiles = source.reads.load(Ordering::SeqCst);
    assert_eq!(tiles, 4);
    assert!(source.max_in_flight.load(Ordering::SeqCst) <= tiles);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_with_out_of_order_completion() {
    init_logging();
    let (values, inner) = u8_source();
    let source = Arc::new(InstrumentedSource::new(inner));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let writer = BoundedPipelineWriter::new(many_tile_config().with_window(7))
        .with_observer(Arc::new(move |p: u8| sink.lock().push(p)));
    let container = ChunkedContainer::memory();
    writer
        .run(&container, "out", source as Arc<dyn ArraySource>)
        .await
        .unwrap();

    let progress = seen.lock().clone();
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(progress.len(), 100 + 2);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|&p| p <= 100));

    let dataset = container.open_dataset("out").await.unwrap();
    let read = dataset.read_region(&Roi::full(dataset.shape())).await.unwrap();
    assert_eq!(read.to_elements::<u8>().unwrap(), values);
}

#[tokio::test]
async fn test_non_contiguous_blocks_use_general_path() {
    let shape = [1, 50, 50, 8, 3];
    let (values, block) = synthetic_f32(&shape);
    let inner = MemorySource::new(block, AxisTags::from_keys("txyzc").unwrap()).unwrap();
    let mut source = InstrumentedSource::new(inner);
    source.fortran_blocks = true;

    let container = ChunkedContainer::memory();
    let writer = BoundedPipelineWriter::new(WriterConfig::default().with_target_chunk_bytes(1000));
    writer
        .run(&container, "out", Arc::new(source))
        .await
        .unwrap();

    let dataset = container.open_dataset("out").await.unwrap();
    let read = dataset.read_region(&Roi::full(&shape)).await.unwrap();
    assert_eq!(read.to_elements::<f32>().unwrap(), values);
}

#[tokio::test]
async fn test_source_failure_aborts_run() {
    let (_, inner) = u8_source();
    let mut source = InstrumentedSource::new(inner);
    source.fail_at = Some(5);
    let source = Arc::new(source);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let writer = BoundedPipelineWriter::new(many_tile_config().with_window(3))
        .with_observer(Arc::new(move |p: u8| sink.lock().push(p)));
    let container = ChunkedContainer::memory();

    let err = writer
        .run(&container, "out", source.clone() as Arc<dyn ArraySource>)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SourceRead);
    assert_eq!(writer.state(), WriterState::Failed);
    assert!(!seen.lock().contains(&100));
    // No further fetches are issued after the failing one is observed
    assert!(source.reads.load(Ordering::SeqCst) < 100);

    // Partially written, axis tags never persisted
    let dataset = container.open_dataset("out").await.unwrap();
    assert!(dataset.axistags().is_none());
    assert_eq!(dataset.stored_chunks().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_rerun_replaces_dataset() {
    let container = ChunkedContainer::memory();
    let writer = BoundedPipelineWriter::default();

    let first = ArrayBlock::from_elements(&[4, 4], &[9u8; 16]).unwrap();
    let source = MemorySource::new(first, AxisTags::from_keys("xy").unwrap()).unwrap();
    writer.run(&container, "d", Arc::new(source)).await.unwrap();

    let second = ArrayBlock::from_elements(&[2, 3, 2], &[1u16; 12]).unwrap();
    let source = MemorySource::new(second, AxisTags::from_keys("zyx").unwrap()).unwrap();
    writer.run(&container, "d", Arc::new(source)).await.unwrap();

    let dataset = container.open_dataset("d").await.unwrap();
    assert_eq!(dataset.shape(), &[2, 3, 2]);
    assert_eq!(dataset.dtype(), DataType::U16);
    let read = dataset.read_region(&Roi::full(&[2, 3, 2])).await.unwrap();
    assert_eq!(read.to_elements::<u16>().unwrap(), vec![1u16; 12]);
}

/// Memory store whose chunk writes start failing after a number of successes
struct FailingStore {
    inner: MemoryIOManager,
    chunk_writes: AtomicUsize,
    fail_after: usize,
}

#[async_trait]
impl IOManager for FailingStore {
    async fn read(&self, path: &str) -> stack_ingest::Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> stack_ingest::Result<()> {
        if path.contains("/c/") && self.chunk_writes.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.write(path, data).await
    }

    async fn exists(&self, path: &str) -> stack_ingest::Result<bool> {
        self.inner.exists(path).await
    }

    async fn delete_all(&self, path: &str) -> stack_ingest::Result<()> {
        self.inner.delete_all(path).await
    }

    async fn list(&self, prefix: &str) -> stack_ingest::Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

#[tokio::test]
async fn test_storage_failure_aborts_run() {
    let (_, source) = u8_source();
    let container = ChunkedContainer::from_io(Arc::new(FailingStore {
        inner: MemoryIOManager::new(),
        chunk_writes: AtomicUsize::new(0),
        fail_after: 10,
    }));
    let writer = BoundedPipelineWriter::new(many_tile_config());

    let err = writer
        .run(&container, "out", Arc::new(source))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::StorageWrite(_)));
    assert_eq!(err.category(), ErrorCategory::StorageWrite);
    assert_eq!(writer.state(), WriterState::Failed);
}

#[tokio::test]
async fn test_channels_over_budget_fail_before_writing() {
    let shape = [1, 4, 4, 2, 40];
    let (_, block) = synthetic_f32(&shape);
    let source = MemorySource::new(block, AxisTags::from_keys("txyzc").unwrap()).unwrap();
    let container = ChunkedContainer::memory();
    let writer = BoundedPipelineWriter::new(WriterConfig::default().with_target_chunk_bytes(100));

    let err = writer
        .run(&container, "out", Arc::new(source))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));
    assert_eq!(writer.state(), WriterState::Failed);
    assert!(!container.contains_dataset("out").await.unwrap());
}
