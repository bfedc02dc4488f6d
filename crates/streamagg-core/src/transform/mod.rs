//! # Aggregating Transforms
//!
//! [`AggregatingTransformWithSubstream`] drives incremental aggregation over
//! many independent substreams:
//!
//! 1. An input chunk is routed to its substream's [`SubstreamContext`],
//!    created on first use.
//! 2. Its rows are folded into the context's variants.
//! 3. When the chunk carries a watermark newer than the context's
//!    finalized watermark, the context is finalized: variants are converted
//!    to output chunks and pushed to the [`AggregatedResultSink`].
//!
//! Behaviour that differs between aggregation flavours sits behind the
//! [`SubstreamAggregation`] trait. Its default methods are the base
//! behaviour; [`GlobalSubstreamAggregation`] overrides them for changelog
//! emission and [`KeyedSubstreamAggregation`] uses them as is.
//!
//! ## Finalization bookkeeping
//!
//! Every finalize call, including ones that emit nothing or fail, resets
//! the since-finalize row counter and advances the finalized watermark.
//! This is enforced by [`FinalizeGuard`].

pub mod global;
pub mod keyed;
pub mod metrics;

use std::collections::hash_map::Entry;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use arrow_schema::SchemaRef;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::aggregate::AggregationError;
use crate::checkpoint::{
    decode_substream_into, encode_substream, CheckpointError, CheckpointStore, SubstreamCheckpoint,
};
use crate::chunk::{Chunk, ChunkContext, ChunkList};
use crate::helper;
use crate::params::AggregatingTransformParams;
use crate::substream::{SubstreamContext, SubstreamId};
use crate::time::Watermark;

pub use global::{GlobalAggregatingTransformWithSubstream, GlobalSubstreamAggregation};
pub use keyed::{KeyedAggregatingTransformWithSubstream, KeyedSubstreamAggregation};
pub use metrics::AggregationMetrics;

/// Downstream consumer of finalized results.
pub trait AggregatedResultSink: Send {
    /// Receives the chunks of one finalization, in order.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::Sink`] (or any other variant) if the
    /// chunks cannot be accepted.
    fn push(&mut self, chunks: ChunkList) -> Result<(), AggregationError>;
}

/// Sink that collects every chunk into a shared buffer.
///
/// Clones share the buffer, so a clone can be handed to a transform and
/// the original used to inspect the output.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    chunks: Arc<Mutex<Vec<Chunk>>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns the collected chunks.
    #[must_use]
    pub fn take(&self) -> Vec<Chunk> {
        std::mem::take(&mut *self.chunks.lock())
    }

    /// Number of chunks collected and not yet taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Returns true if no chunks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }
}

impl AggregatedResultSink for CollectingSink {
    fn push(&mut self, chunks: ChunkList) -> Result<(), AggregationError> {
        self.chunks.lock().extend(chunks);
        Ok(())
    }
}

/// Sink backed by a closure.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: FnMut(ChunkList) -> Result<(), AggregationError> + Send,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AggregatedResultSink for FnSink<F>
where
    F: FnMut(ChunkList) -> Result<(), AggregationError> + Send,
{
    fn push(&mut self, chunks: ChunkList) -> Result<(), AggregationError> {
        (self.f)(chunks)
    }
}

/// State shared by all substreams of one transform.
pub struct TransformShared {
    params: Arc<AggregatingTransformParams>,
    sink: Box<dyn AggregatedResultSink>,
    metrics: AggregationMetrics,
}

impl TransformShared {
    /// Parameters of the transform.
    #[must_use]
    pub fn params(&self) -> &Arc<AggregatingTransformParams> {
        &self.params
    }

    /// Finalization metrics.
    #[must_use]
    pub fn metrics(&self) -> &AggregationMetrics {
        &self.metrics
    }
}

impl fmt::Debug for TransformShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformShared")
            .field("params", &self.params)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Aggregation-flavour hooks of [`AggregatingTransformWithSubstream`].
///
/// Every method has a default implementing the base behaviour.
pub trait SubstreamAggregation: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Called once when a substream context is created, before any rows
    /// are folded into it (and before a checkpoint is restored into it).
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if the context cannot be prepared.
    fn on_substream_context(
        &self,
        _params: &AggregatingTransformParams,
        _ctx: &mut SubstreamContext,
    ) -> Result<(), AggregationError> {
        Ok(())
    }

    /// Folds `chunk` into `ctx`. Returns `(state_changed, new_keys_added)`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if the rows cannot be aggregated.
    fn execute_or_merge_columns(
        &self,
        params: &AggregatingTransformParams,
        chunk: &Chunk,
        ctx: &mut SubstreamContext,
    ) -> Result<(bool, bool), AggregationError> {
        default_execute_or_merge_columns(params, chunk, ctx)
    }

    /// Converts `ctx` to output and pushes it downstream.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if conversion or emission fails.
    /// Bookkeeping is updated regardless.
    fn finalize(
        &self,
        shared: &mut TransformShared,
        ctx: &mut SubstreamContext,
        chunk_context: &Arc<ChunkContext>,
    ) -> Result<(), AggregationError> {
        finalize_with(shared, ctx, chunk_context, default_convert)
    }
}

/// Base row folding: aggregate raw rows or merge partial states.
///
/// # Errors
///
/// Returns [`AggregationError`] if the rows cannot be aggregated.
pub fn default_execute_or_merge_columns(
    params: &AggregatingTransformParams,
    chunk: &Chunk,
    ctx: &mut SubstreamContext,
) -> Result<(bool, bool), AggregationError> {
    params.aggregator().execute_or_merge(chunk, &mut ctx.variants)
}

/// Base conversion: snapshot or updates, plus an optional `_version`
/// column on final results.
///
/// # Errors
///
/// Returns [`AggregationError::PreconditionViolated`] in changelog mode,
/// which needs a changelog-aware aggregation.
pub fn default_convert(
    params: &AggregatingTransformParams,
    ctx: &mut SubstreamContext,
) -> Result<ChunkList, AggregationError> {
    if params.emit_changelog() {
        return Err(AggregationError::PreconditionViolated(
            "changelog emission is not handled by the base conversion".to_string(),
        ));
    }
    let chunks = if helper::only_emit_updates(params.emit_mode()) {
        helper::convert_updates_to_chunks(&mut ctx.variants, params)?
    } else {
        helper::convert_to_chunks(&mut ctx.variants, params)?
    };
    if params.final_results() && params.emit_version() && !chunks.is_empty() {
        let version = ctx.next_version();
        return helper::append_version_column(chunks, version, params.output_schema());
    }
    Ok(chunks)
}

/// Scope guard over a context being finalized.
///
/// On drop, resets the since-finalize row counter and advances the
/// finalized watermark, on every exit path.
pub struct FinalizeGuard<'a> {
    ctx: &'a mut SubstreamContext,
    watermark: Watermark,
}

impl<'a> FinalizeGuard<'a> {
    /// Starts finalizing `ctx` at `watermark`.
    #[must_use]
    pub fn new(ctx: &'a mut SubstreamContext, watermark: Watermark) -> Self {
        Self { ctx, watermark }
    }
}

impl Deref for FinalizeGuard<'_> {
    type Target = SubstreamContext;

    fn deref(&self) -> &SubstreamContext {
        self.ctx
    }
}

impl DerefMut for FinalizeGuard<'_> {
    fn deref_mut(&mut self) -> &mut SubstreamContext {
        self.ctx
    }
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.reset_row_counts();
        self.ctx.advance_finalized_watermark(self.watermark);
    }
}

/// Finalize skeleton shared by all aggregation flavours.
///
/// Skips contexts without new rows or groups, runs `convert`, guarantees
/// at least one (possibly empty) chunk so the watermark travels downstream,
/// attaches `chunk_context` to the last chunk and pushes to the sink.
///
/// # Errors
///
/// Returns the error of `convert` or of the sink.
pub fn finalize_with<F>(
    shared: &mut TransformShared,
    ctx: &mut SubstreamContext,
    chunk_context: &Arc<ChunkContext>,
    convert: F,
) -> Result<(), AggregationError>
where
    F: FnOnce(&AggregatingTransformParams, &mut SubstreamContext) -> Result<ChunkList, AggregationError>,
{
    let mut ctx = FinalizeGuard::new(ctx, chunk_context.watermark());
    if !ctx.has_new_data() || ctx.variants.is_empty() {
        shared.metrics.record_skip();
        return Ok(());
    }

    let start = Instant::now();
    let params = Arc::clone(&shared.params);
    let mut chunks = match convert(params.as_ref(), &mut *ctx) {
        Ok(chunks) => chunks,
        Err(e) => {
            shared.metrics.record_failure();
            tracing::error!(substream = %ctx.id(), error = %e, "Failed to convert aggregation state");
            return Err(e);
        }
    };
    if chunks.is_empty() {
        chunks.push(Chunk::empty(Arc::clone(params.output_schema())));
    }
    if let Some(last) = chunks.pop() {
        chunks.push(last.with_context(Arc::clone(chunk_context)));
    }
    let elapsed = start.elapsed();

    let num_chunks = chunks.len();
    let rows: usize = chunks.iter().map(Chunk::num_rows).sum();
    if let Err(e) = shared.sink.push(chunks) {
        shared.metrics.record_failure();
        tracing::error!(substream = %ctx.id(), error = %e, "Failed to push aggregated result");
        return Err(e);
    }
    shared.metrics.record_finalize(elapsed, num_chunks, rows);

    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        substream = %ctx.id(),
        watermark = %chunk_context.watermark(),
        rows,
        chunks = num_chunks,
        "Took {elapsed_ms} milliseconds to finalize aggregation"
    );
    Ok(())
}

/// Substream-aware aggregating transform, parameterized by flavour.
pub struct AggregatingTransformWithSubstream<S: SubstreamAggregation> {
    strategy: S,
    shared: TransformShared,
    substreams: FxHashMap<SubstreamId, SubstreamContext>,
}

impl<S: SubstreamAggregation> AggregatingTransformWithSubstream<S> {
    /// Creates a transform with the given flavour, parameters and sink.
    pub fn new(
        strategy: S,
        params: Arc<AggregatingTransformParams>,
        sink: Box<dyn AggregatedResultSink>,
    ) -> Self {
        Self {
            strategy,
            shared: TransformShared {
                params,
                sink,
                metrics: AggregationMetrics::new(),
            },
            substreams: FxHashMap::default(),
        }
    }

    /// Name of the aggregation flavour.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Parameters of the transform.
    #[must_use]
    pub fn params(&self) -> &Arc<AggregatingTransformParams> {
        &self.shared.params
    }

    /// Schema of emitted chunks.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(self.shared.params.output_schema())
    }

    /// Finalization metrics.
    #[must_use]
    pub fn metrics(&self) -> &AggregationMetrics {
        &self.shared.metrics
    }

    /// Looks up a substream context.
    #[must_use]
    pub fn substream(&self, id: SubstreamId) -> Option<&SubstreamContext> {
        self.substreams.get(&id)
    }

    /// Number of live substreams.
    #[must_use]
    pub fn num_substreams(&self) -> usize {
        self.substreams.len()
    }

    /// Live substream ids in ascending order.
    #[must_use]
    pub fn substream_ids(&self) -> Vec<SubstreamId> {
        let mut ids: Vec<_> = self.substreams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the context of `id`, creating and preparing it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if the flavour cannot prepare the
    /// context.
    pub fn get_or_create_substream_context(
        &mut self,
        id: SubstreamId,
    ) -> Result<&mut SubstreamContext, AggregationError> {
        Self::context_entry(&self.strategy, &self.shared.params, &mut self.substreams, id)
    }

    fn context_entry<'m>(
        strategy: &S,
        params: &AggregatingTransformParams,
        substreams: &'m mut FxHashMap<SubstreamId, SubstreamContext>,
        id: SubstreamId,
    ) -> Result<&'m mut SubstreamContext, AggregationError> {
        match substreams.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut ctx = SubstreamContext::new(id);
                strategy.on_substream_context(params, &mut ctx)?;
                tracing::debug!(substream = %id, transform = strategy.name(), "Created substream context");
                Ok(entry.insert(ctx))
            }
        }
    }

    /// Folds `chunk` into substream `id`, finalizing if the chunk carries a
    /// watermark newer than the substream's finalized watermark.
    ///
    /// Only rows that reached a group count as new data. If folding fails
    /// part-way, the rows already folded are still counted so the next
    /// watermark emits them.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if aggregation or finalization fails.
    pub fn consume(&mut self, id: SubstreamId, chunk: &Chunk) -> Result<(), AggregationError> {
        let ctx = Self::context_entry(&self.strategy, &self.shared.params, &mut self.substreams, id)?;
        if !chunk.is_empty() {
            let folded = self
                .strategy
                .execute_or_merge_columns(&self.shared.params, chunk, ctx);
            let rows = ctx.variants.take_folded_rows();
            ctx.add_row_count(rows);
            folded?;
        }
        if let Some(chunk_context) = chunk.context() {
            if chunk_context.watermark() > ctx.finalized_watermark() {
                self.strategy.finalize(&mut self.shared, ctx, chunk_context)?;
            }
        }
        Ok(())
    }

    /// Advances substream `id` to `watermark` without new rows.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if finalization fails.
    pub fn on_watermark(
        &mut self,
        id: SubstreamId,
        watermark: Watermark,
    ) -> Result<(), AggregationError> {
        let ctx = Self::context_entry(&self.strategy, &self.shared.params, &mut self.substreams, id)?;
        if watermark > ctx.finalized_watermark() {
            self.strategy
                .finalize(&mut self.shared, ctx, &ChunkContext::shared(watermark))?;
        }
        Ok(())
    }

    /// Advances every substream whose finalized watermark is behind
    /// `watermark`, in ascending id order.
    ///
    /// All substreams are visited even if one fails.
    ///
    /// # Errors
    ///
    /// Returns the first finalization error.
    pub fn on_global_watermark(&mut self, watermark: Watermark) -> Result<(), AggregationError> {
        let chunk_context = ChunkContext::shared(watermark);
        let mut first_error = None;
        for id in self.substream_ids() {
            let Some(ctx) = self.substreams.get_mut(&id) else {
                continue;
            };
            if watermark <= ctx.finalized_watermark() {
                continue;
            }
            if let Err(e) = self.strategy.finalize(&mut self.shared, ctx, &chunk_context) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Finalizes substream `id` at `watermark` unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError`] if finalization fails.
    pub fn finalize_substream(
        &mut self,
        id: SubstreamId,
        watermark: Watermark,
    ) -> Result<(), AggregationError> {
        let ctx = Self::context_entry(&self.strategy, &self.shared.params, &mut self.substreams, id)?;
        self.strategy
            .finalize(&mut self.shared, ctx, &ChunkContext::shared(watermark))
    }

    /// Drops substream `id` and its state.
    pub fn remove_substream(&mut self, id: SubstreamId) -> Option<SubstreamContext> {
        let removed = self.substreams.remove(&id);
        if removed.is_some() {
            tracing::debug!(substream = %id, "Removed substream context");
        }
        removed
    }

    /// Encodes every substream, in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if a substream cannot be encoded.
    pub fn checkpoint(&self) -> Result<Vec<SubstreamCheckpoint>, CheckpointError> {
        self.substream_ids()
            .into_iter()
            .filter_map(|id| self.substreams.get(&id))
            .map(encode_substream)
            .collect()
    }

    /// Writes every substream to `store`. Returns the number written.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error`] if encoding or storing fails.
    pub fn checkpoint_to(&self, store: &dyn CheckpointStore) -> crate::Result<usize> {
        let records = self.checkpoint()?;
        for record in &records {
            store.put_record(record)?;
        }
        tracing::debug!(
            transform = self.name(),
            substreams = records.len(),
            bytes = records.iter().map(|r| r.data.len()).sum::<usize>(),
            "Checkpointed aggregation state"
        );
        Ok(records.len())
    }

    /// Restores substreams from `records`.
    ///
    /// Each record is decoded into a freshly prepared context. Either every
    /// record is applied or none is; restored substreams replace live ones
    /// with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Aggregation`] if a context cannot be prepared
    /// and [`crate::Error::Checkpoint`] if a record cannot be decoded.
    pub fn restore(&mut self, records: &[SubstreamCheckpoint]) -> crate::Result<usize> {
        let mut restored = Vec::with_capacity(records.len());
        for record in records {
            let mut ctx = SubstreamContext::new(record.substream_id);
            self.strategy
                .on_substream_context(&self.shared.params, &mut ctx)?;
            if let Err(e) = decode_substream_into(&mut ctx, record) {
                tracing::error!(
                    substream = %record.substream_id,
                    version = %record.version,
                    error = %e,
                    "Failed to restore substream checkpoint"
                );
                return Err(e.into());
            }
            restored.push(ctx);
        }
        let count = restored.len();
        for ctx in restored {
            self.substreams.insert(ctx.id(), ctx);
        }
        tracing::info!(transform = self.name(), substreams = count, "Restored aggregation state");
        Ok(count)
    }

    /// Restores every substream stored in `store`.
    ///
    /// # Errors
    ///
    /// See [`restore`](Self::restore); store failures are returned as
    /// [`crate::Error::Store`].
    pub fn recover_from(&mut self, store: &dyn CheckpointStore) -> crate::Result<usize> {
        let records = store.load_all()?;
        self.restore(&records)
    }
}

impl<S: SubstreamAggregation + fmt::Debug> fmt::Debug for AggregatingTransformWithSubstream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatingTransformWithSubstream")
            .field("strategy", &self.strategy)
            .field("shared", &self.shared)
            .field("substreams", &self.substreams.len())
            .finish()
    }
}
