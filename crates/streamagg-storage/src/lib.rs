//! # `StreamAgg` Storage
//!
//! Durability layer for `StreamAgg` - filesystem checkpoint records and
//! periodic checkpoint coordination.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Filesystem checkpoint store - One checksummed record per substream
pub mod checkpoint_store;

/// Checkpoint coordination - Periodic snapshot and recovery of a transform
pub mod coordinator;

// Re-export key types
pub use checkpoint_store::FileSystemCheckpointStore;
pub use coordinator::{CheckpointConfig, CheckpointCoordinator};
