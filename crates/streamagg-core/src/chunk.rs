//! # Chunks
//!
//! A [`Chunk`] is an immutable columnar batch of rows, backed by an Arrow
//! [`RecordBatch`], with an optional shared [`ChunkContext`] carrying the
//! watermark that triggered it.
//!
//! Chunks are produced by finalization or passed through from upstream and
//! are never mutated once built. Attaching a context consumes the chunk and
//! returns a new one.

use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::time::Watermark;

/// Per-chunk metadata propagated alongside the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContext {
    watermark: Watermark,
}

impl ChunkContext {
    /// Creates a context carrying the given watermark.
    #[must_use]
    pub fn new(watermark: Watermark) -> Self {
        Self { watermark }
    }

    /// Creates a shared context carrying the given watermark.
    #[must_use]
    pub fn shared(watermark: impl Into<Watermark>) -> Arc<Self> {
        Arc::new(Self::new(watermark.into()))
    }

    /// Returns the watermark carried by this context.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }
}

/// An immutable batch of rows with an optional [`ChunkContext`].
#[derive(Debug, Clone)]
pub struct Chunk {
    batch: RecordBatch,
    context: Option<Arc<ChunkContext>>,
}

/// Ordered list of chunks produced by one finalization.
pub type ChunkList = Vec<Chunk>;

impl Chunk {
    /// Wraps a record batch without a context.
    #[must_use]
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            context: None,
        }
    }

    /// Creates a zero-row chunk with the given schema.
    #[must_use]
    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(RecordBatch::new_empty(schema))
    }

    /// Creates a zero-row chunk whose only purpose is to carry a watermark.
    #[must_use]
    pub fn heartbeat(schema: SchemaRef, watermark: impl Into<Watermark>) -> Self {
        Self::empty(schema).with_context(ChunkContext::shared(watermark))
    }

    /// Returns this chunk with `context` attached, replacing any previous one.
    #[must_use]
    pub fn with_context(self, context: Arc<ChunkContext>) -> Self {
        Self {
            batch: self.batch,
            context: Some(context),
        }
    }

    /// Returns the underlying record batch.
    #[must_use]
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Consumes the chunk, returning the record batch.
    #[must_use]
    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    /// Returns the attached context, if any.
    #[must_use]
    pub fn context(&self) -> Option<&Arc<ChunkContext>> {
        self.context.as_ref()
    }

    /// Returns the watermark of the attached context, if any.
    #[must_use]
    pub fn watermark(&self) -> Option<Watermark> {
        self.context.as_ref().map(|ctx| ctx.watermark())
    }

    /// Number of rows in the chunk.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Returns true if the chunk has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    /// Schema of the rows in this chunk.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }
}

impl From<RecordBatch> for Chunk {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap()
    }

    #[test]
    fn test_chunk_without_context() {
        let chunk = Chunk::new(batch());
        assert_eq!(chunk.num_rows(), 3);
        assert!(chunk.context().is_none());
        assert!(chunk.watermark().is_none());
    }

    #[test]
    fn test_chunk_with_context() {
        let chunk = Chunk::new(batch()).with_context(ChunkContext::shared(100));
        assert_eq!(chunk.watermark(), Some(Watermark::new(100)));
    }

    #[test]
    fn test_heartbeat_chunk() {
        let chunk = Chunk::heartbeat(batch().schema(), 5);
        assert!(chunk.is_empty());
        assert_eq!(chunk.watermark(), Some(Watermark::new(5)));
        assert_eq!(chunk.schema().fields().len(), 1);
    }
}
