//! stack-ingest - image stacks into chunked arrays
//!
//! Streams large N-dimensional image data into a chunked, randomly
//! addressable on-disk array format without ever holding the full dataset
//! in memory.
//!
//! # Features
//!
//! - Virtual stacks: an ordered list of 2-D image files read as one `x, y, z, c` array
//! - Chunk shapes derived from a byte budget, coarser request tiles derived from chunks
//! - Bounded-concurrency pipeline: at most `window` tile fetches in flight, written in order
//! - Chunk compression (Deflate, Zstd) over a pluggable [`IOManager`] backend
//! - Async I/O throughout
//!
//! # Example
//!
//! ```rust,ignore
//! use stack_ingest::{BoundedPipelineWriter, ChunkedContainer, VirtualStackReader};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let container = ChunkedContainer::open("file:///data/flyem.chunked").await?;
//!
//! let reader = VirtualStackReader::new();
//! reader.set_glob_string("/data/flyem_sample_stack/*.png");
//!
//! let writer = BoundedPipelineWriter::default()
//!     .with_observer(Arc::new(|percent: u8| println!("{percent}%")));
//! writer.run(&container, "volume/data", Arc::new(reader)).await?;
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod bridge;
pub mod compression;
pub mod config;
pub mod error;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod pipeline;
pub mod stack;
pub mod store;
pub mod types;
pub mod utils;

// Re-exports
pub use array::{ArrayBlock, ArrayMeta, ArraySource, MemorySource};
pub use bridge::StackToChunkedDatasetBridge;
pub use compression::{CompressionLevel, CompressionMethod};
pub use config::WriterConfig;
pub use error::{ErrorCategory, IngestError, Result};
pub use io::{IOManager, StorageBackend};
pub use layout::{compute_chunk_shape, compute_tile_list, ChunkLayoutPlanner, TileMultipliers};
pub use metadata::DatasetMetadata;
pub use pipeline::{BoundedPipelineWriter, ProgressObserver, WriterState};
pub use stack::VirtualStackReader;
pub use store::{ChunkedContainer, Dataset};
pub use types::{AxisInfo, AxisKey, AxisTags, AxisType, DataType, Roi, Tile, ValueRange};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
