//! Image stacks on disk through the windowed writer and the per-image bridge

use image::{GrayImage, Luma, Rgb, RgbImage};
use parking_lot::Mutex;
use stack_ingest::stack::expand_glob_string;
use stack_ingest::{
    ArraySource, BoundedPipelineWriter, ChunkedContainer, DataType, IngestError, Roi,
    StackToChunkedDatasetBridge, VirtualStackReader, WriterConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gray(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    GrayImage::from_fn(width, height, |x, y| Luma([(x * 3 + y) as u8]))
        .save(&path)
        .unwrap();
    path
}

fn pattern(dir: &Path, glob: &str) -> String {
    dir.join(glob).to_str().unwrap().to_string()
}

#[test]
fn test_glob_groups_sorted() {
    let dir = TempDir::new().unwrap();
    for name in ["b1.png", "a2.png", "a10.png", "b0.png", "a1.png", "c0.png"] {
        gray(dir.path(), name, 2, 2);
    }
    let names = |files: Vec<PathBuf>| -> Vec<String> {
        files
            .iter()
            .map(|f| f.file_name().unwrap().to_str().unwrap().to_string())
            .collect()
    };
    let expected = vec!["a1.png", "a10.png", "a2.png", "b0.png", "b1.png"];

    let list = format!("{}//{}", pattern(dir.path(), "a*.png"), pattern(dir.path(), "b*.png"));
    assert_eq!(names(expand_glob_string(&list).unwrap()), expected);

    // Group order follows pattern text, not list order
    let reversed = format!("{}//{}", pattern(dir.path(), "b*.png"), pattern(dir.path(), "a*.png"));
    let reader = VirtualStackReader::new();
    reader.set_glob_string(reversed);
    assert_eq!(names(reader.files().unwrap()), expected);
    assert_eq!(reader.meta().unwrap().shape, vec![2, 2, 5, 1]);
}

#[test]
fn test_invalid_pattern() {
    let reader = VirtualStackReader::new();
    assert!(matches!(
        reader.configure("[unclosed"),
        Err(IngestError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_stack_through_windowed_writer() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();
    for z in 0..6u8 {
        RgbImage::from_fn(30, 20, |x, y| Rgb([z, x as u8, y as u8]))
            .save(images.path().join(format!("slice{z:02}.png")))
            .unwrap();
    }

    let reader = VirtualStackReader::new();
    reader.set_glob_string(pattern(images.path(), "slice*.png"));
    let container = ChunkedContainer::open(dir.path().to_str().unwrap())
        .await
        .unwrap();
    let writer = BoundedPipelineWriter::new(
        WriterConfig::default()
            .with_target_chunk_bytes(200)
            .with_window(4),
    );
    assert!(writer
        .run(&container, "stack/raw", Arc::new(reader))
        .await
        .unwrap());

    let dataset = container.open_dataset("stack/raw").await.unwrap();
    assert_eq!(dataset.shape(), &[30, 20, 6, 3]);
    assert_eq!(dataset.dtype(), DataType::U8);
    assert_eq!(dataset.axistags().unwrap().keys(), "xyzc");
    // 200 / 3 = 66 bytes per column, cube of 4
    assert_eq!(dataset.chunk_shape(), &[4, 4, 4, 3]);

    let block = dataset
        .read_region(&Roi::new(vec![17, 11, 4, 0], vec![18, 12, 5, 3]).unwrap())
        .await
        .unwrap();
    assert_eq!(block.to_elements::<u8>().unwrap(), vec![4, 17, 11]);
}

#[tokio::test]
async fn test_bridge_shape_mismatch_leaves_slice_unwritten() {
    let images = TempDir::new().unwrap();
    gray(images.path(), "img0.png", 6, 5);
    gray(images.path(), "img1.png", 7, 5);

    let container = ChunkedContainer::memory();
    let mut bridge = StackToChunkedDatasetBridge::default();
    bridge.set_glob_string(pattern(images.path(), "img*.png"));
    bridge.set_destination(container.clone());
    bridge.set_path("volume/data");

    let err = bridge.write_image().await.unwrap_err();
    assert!(matches!(err, IngestError::ShapeMismatch { .. }));
    assert!(!bridge.is_current());

    let dataset = container.open_dataset("volume/data").await.unwrap();
    let first = dataset
        .read_region(&Roi::new(vec![0, 0, 0, 0], vec![6, 5, 1, 1]).unwrap())
        .await
        .unwrap();
    assert_eq!(first.to_elements::<u8>().unwrap()[6 * 5 - 1], 5 * 3 + 4);
    let second = dataset
        .read_region(&Roi::new(vec![0, 0, 1, 0], vec![6, 5, 2, 1]).unwrap())
        .await
        .unwrap();
    assert!(second.to_elements::<u8>().unwrap().iter().all(|&v| v == 0));
}

#[tokio::test]
async fn test_pipeline_shape_mismatch_writes_nothing() {
    let images = TempDir::new().unwrap();
    gray(images.path(), "img0.png", 6, 5);
    gray(images.path(), "img1.png", 6, 4);

    let reader = VirtualStackReader::new();
    reader.set_glob_string(pattern(images.path(), "img*.png"));
    let container = ChunkedContainer::memory();
    let err = BoundedPipelineWriter::default()
        .run(&container, "data", Arc::new(reader))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ShapeMismatch { .. }));

    // The single tile spans both files, so nothing reached storage
    let dataset = container.open_dataset("data").await.unwrap();
    assert!(dataset.stored_chunks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreadable_later_file() {
    let images = TempDir::new().unwrap();
    gray(images.path(), "f0.png", 3, 3);
    let broken = images.path().join("f1.png");
    std::fs::write(&broken, b"truncated").unwrap();

    let reader = VirtualStackReader::new();
    reader.set_glob_string(pattern(images.path(), "f*.png"));
    let meta = reader.meta().unwrap();
    assert_eq!(meta.shape, vec![3, 3, 2, 1]);

    let first = Roi::new(vec![0, 0, 0, 0], vec![3, 3, 1, 1]).unwrap();
    assert!(reader.read(&first).await.is_ok());
    match reader.read(&Roi::full(&meta.shape)).await {
        Err(IngestError::FileOpen(path)) => assert_eq!(path, broken),
        other => panic!("expected FileOpen, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bridge_invalidated_by_glob_change() {
    let images = TempDir::new().unwrap();
    gray(images.path(), "a0.png", 4, 4);
    gray(images.path(), "b0.png", 4, 4);
    gray(images.path(), "b1.png", 4, 4);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let container = ChunkedContainer::memory();
    let mut bridge = StackToChunkedDatasetBridge::default()
        .with_observer(Arc::new(move |p: u8| sink.lock().push(p)));
    bridge.set_destination(container.clone());
    bridge.set_path("d");

    bridge.set_glob_string(pattern(images.path(), "a*.png"));
    bridge.write_image().await.unwrap();
    assert_eq!(
        container.open_dataset("d").await.unwrap().shape(),
        &[4, 4, 1, 1]
    );

    bridge.set_glob_string(pattern(images.path(), "b*.png"));
    assert!(!bridge.is_current());
    bridge.write_image().await.unwrap();
    assert_eq!(
        container.open_dataset("d").await.unwrap().shape(),
        &[4, 4, 2, 1]
    );
    assert_eq!(*seen.lock(), vec![0, 100, 100, 0, 50, 100, 100]);
}
