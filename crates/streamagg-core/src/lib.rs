//! # `StreamAgg` Core
//!
//! Incremental, substream-aware aggregation over Arrow record batches.
//!
//! This crate provides:
//! - **Aggregates**: retractable accumulators and per-substream group tables
//! - **Transforms**: a watermark-driven aggregating operator with global and
//!   keyed flavours, including changelog (retract/insert) emission
//! - **Checkpoints**: versioned per-substream snapshots and a store trait
//! - **Time**: watermarks
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use arrow_array::{Int64Array, RecordBatch};
//! use arrow_schema::{DataType, Field, Schema};
//! use streamagg_core::aggregate::{AggregateFunction, AggregateSpec};
//! use streamagg_core::chunk::{Chunk, ChunkContext};
//! use streamagg_core::params::{AggregatingTransformParams, AggregationConfig};
//! use streamagg_core::substream::SubstreamId;
//! use streamagg_core::transform::{CollectingSink, GlobalAggregatingTransformWithSubstream};
//!
//! let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
//! let config = AggregationConfig::new()
//!     .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "v", "total"));
//! let params = AggregatingTransformParams::try_new(config, &schema).unwrap();
//!
//! let sink = CollectingSink::new();
//! let mut transform =
//!     GlobalAggregatingTransformWithSubstream::try_new(params, Box::new(sink.clone())).unwrap();
//!
//! let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap();
//! let chunk = Chunk::new(batch).with_context(ChunkContext::shared(100));
//! transform.consume(SubstreamId::GLOBAL, &chunk).unwrap();
//!
//! let output = sink.take();
//! assert_eq!(output.len(), 1);
//! assert_eq!(output[0].num_rows(), 1);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod checkpoint;
pub mod chunk;
pub mod helper;
pub mod params;
pub mod substream;
pub mod time;
pub mod transform;

// Re-export key types
pub use aggregate::{AggregateFunction, AggregateSpec, AggregationError};
pub use checkpoint::{CheckpointError, CheckpointStore, CheckpointVersion, SubstreamCheckpoint};
pub use chunk::{Chunk, ChunkContext, ChunkList};
pub use params::{AggregatingTransformParams, AggregationConfig, ConfigError, EmitMode};
pub use substream::{SubstreamContext, SubstreamId};
pub use time::Watermark;
pub use transform::{
    AggregatedResultSink, AggregatingTransformWithSubstream, GlobalAggregatingTransformWithSubstream,
    KeyedAggregatingTransformWithSubstream,
};

/// Result type for streamagg-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for streamagg-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Aggregation or emission errors
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Checkpoint encoding or recovery errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Checkpoint store errors
    #[error("Checkpoint store error: {0}")]
    Store(#[from] checkpoint::CheckpointStoreError),
}
