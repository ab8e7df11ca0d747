//! The shared-memory frame exchange: one writer, any number of readers.

pub mod active_consumers;
pub mod cached;
pub mod geometry;
pub mod metadata;
pub mod reader;
pub mod segment;
pub mod writer;

pub use active_consumers::ActiveConsumers;
pub use cached::CachedReader;
pub use metadata::{Config, ConsumerKind, ConsumerPattern, FrameMetadata, LayerConfig};
pub use reader::{Reader, Snapshot, SnapshotState};
pub use segment::Segment;
pub use writer::{FrameInfo, Writer};
