//! Global (un-keyed) aggregation with changelog support.
//!
//! In changelog mode every substream carries a [`RetractState`]. Until the
//! first non-empty changelog is emitted there is nothing to retract, so rows
//! take the plain aggregation path. Afterwards each touched group first
//! stages its previously emitted results, and finalization emits a retract
//! row for them followed by an insert row for the new results.

use std::sync::Arc;

use super::{
    default_execute_or_merge_columns, finalize_with, AggregatedResultSink,
    AggregatingTransformWithSubstream, SubstreamAggregation, TransformShared,
};
use crate::aggregate::AggregationError;
use crate::chunk::{Chunk, ChunkContext};
use crate::helper;
use crate::params::{AggregatingTransformParams, ConfigError, GroupByMode};
use crate::substream::{RetractState, SubstreamContext, SubstreamField};

/// Global aggregation flavour.
#[derive(Debug)]
pub struct GlobalSubstreamAggregation {
    _private: (),
}

impl GlobalSubstreamAggregation {
    /// Validates that `params` describe a global aggregation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidGrouping`] for keyed parameters and
    /// [`ConfigError::Unsupported`] when changelog emission is combined with
    /// result versioning.
    pub fn try_new(params: &AggregatingTransformParams) -> Result<Self, ConfigError> {
        if params.group_by() != GroupByMode::Global {
            return Err(ConfigError::InvalidGrouping(
                "global aggregation requires no group-by keys".to_string(),
            ));
        }
        if params.emit_changelog() && params.emit_version() {
            return Err(ConfigError::Unsupported(
                "'emit_version()' is not supported in global aggregation emit changelog"
                    .to_string(),
            ));
        }
        Ok(Self { _private: () })
    }
}

impl SubstreamAggregation for GlobalSubstreamAggregation {
    fn name(&self) -> &'static str {
        "GlobalAggregatingTransformWithSubstream"
    }

    fn on_substream_context(
        &self,
        params: &AggregatingTransformParams,
        ctx: &mut SubstreamContext,
    ) -> Result<(), AggregationError> {
        if params.emit_changelog() && !ctx.has_field() {
            ctx.set_field(SubstreamField::Retract(RetractState::default()))?;
        }
        Ok(())
    }

    fn execute_or_merge_columns(
        &self,
        params: &AggregatingTransformParams,
        chunk: &Chunk,
        ctx: &mut SubstreamContext,
    ) -> Result<(bool, bool), AggregationError> {
        if !params.emit_changelog() {
            return default_execute_or_merge_columns(params, chunk, ctx);
        }
        if params.only_merge() || ctx.variants.no_more_keys() {
            return Err(AggregationError::PreconditionViolated(
                "changelog emission does not support partial merging or group overflow"
                    .to_string(),
            ));
        }
        let aggregator = params.aggregator();
        if ctx.field::<RetractState>()?.is_enabled() {
            aggregator.execute_and_retract_on_block(chunk, &mut ctx.variants)
        } else {
            aggregator.execute_on_block(chunk, &mut ctx.variants)
        }
    }

    fn finalize(
        &self,
        shared: &mut TransformShared,
        ctx: &mut SubstreamContext,
        chunk_context: &Arc<ChunkContext>,
    ) -> Result<(), AggregationError> {
        if !shared.params().emit_changelog() {
            return finalize_with(shared, ctx, chunk_context, super::default_convert);
        }
        finalize_with(shared, ctx, chunk_context, |params, ctx| {
            let chunks = helper::convert_to_changelog_chunks(&mut ctx.variants, params)?;
            if !chunks.is_empty() {
                ctx.field_mut::<RetractState>()?.enable();
            }
            Ok(chunks)
        })
    }
}

/// Global aggregating transform.
pub type GlobalAggregatingTransformWithSubstream =
    AggregatingTransformWithSubstream<GlobalSubstreamAggregation>;

impl AggregatingTransformWithSubstream<GlobalSubstreamAggregation> {
    /// Creates a global aggregating transform.
    ///
    /// # Errors
    ///
    /// See [`GlobalSubstreamAggregation::try_new`].
    pub fn try_new(
        params: Arc<AggregatingTransformParams>,
        sink: Box<dyn AggregatedResultSink>,
    ) -> Result<Self, ConfigError> {
        let strategy = GlobalSubstreamAggregation::try_new(&params)?;
        Ok(Self::new(strategy, params, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateFunction, AggregateSpec};
    use crate::params::{AggregationConfig, EmitMode};
    use crate::substream::SubstreamId;
    use crate::transform::CollectingSink;
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Int64Type, Int8Type};
    use arrow_array::{Int64Array, RecordBatch};
    use arrow_schema::{DataType, Field, Schema};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]))
    }

    fn changelog_params() -> Arc<AggregatingTransformParams> {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::LastValue, "k", "k"))
            .with_aggregate(AggregateSpec::new(AggregateFunction::LastValue, "v", "v"))
            .with_emit_mode(EmitMode::Changelog);
        AggregatingTransformParams::try_new(config, &schema()).unwrap()
    }

    fn chunk(k: i64, v: i64, watermark: i64) -> Chunk {
        let batch = RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int64Array::from(vec![k])),
                Arc::new(Int64Array::from(vec![v])),
            ],
        )
        .unwrap();
        Chunk::new(batch).with_context(ChunkContext::shared(watermark))
    }

    fn rows(chunk: &Chunk) -> Vec<(i64, i64, i8)> {
        let batch = chunk.batch();
        let k = batch.column(0).as_primitive::<Int64Type>();
        let v = batch.column(1).as_primitive::<Int64Type>();
        let d = batch.column(2).as_primitive::<Int8Type>();
        (0..batch.num_rows())
            .map(|i| (k.value(i), v.value(i), d.value(i)))
            .collect()
    }

    #[test]
    fn test_rejects_changelog_with_version() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::count_star("c"))
            .with_emit_mode(EmitMode::Changelog)
            .with_emit_version(true);
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        let err = GlobalAggregatingTransformWithSubstream::try_new(
            params,
            Box::new(CollectingSink::new()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Unsupported(ref m) if m.contains("emit_version")));
    }

    #[test]
    fn test_rejects_keyed_params() {
        let config = AggregationConfig::new()
            .with_group_by(vec!["k".into()])
            .with_aggregate(AggregateSpec::count_star("c"));
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        assert!(matches!(
            GlobalSubstreamAggregation::try_new(&params),
            Err(ConfigError::InvalidGrouping(_))
        ));
    }

    #[test]
    fn test_retract_field_installed_only_in_changelog_mode() {
        let mut t = GlobalAggregatingTransformWithSubstream::try_new(
            changelog_params(),
            Box::new(CollectingSink::new()),
        )
        .unwrap();
        let ctx = t.get_or_create_substream_context(SubstreamId::GLOBAL).unwrap();
        assert!(!ctx.field::<RetractState>().unwrap().is_enabled());

        let config = AggregationConfig::new().with_aggregate(AggregateSpec::count_star("c"));
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        let mut plain =
            GlobalAggregatingTransformWithSubstream::try_new(params, Box::new(CollectingSink::new()))
                .unwrap();
        assert!(!plain
            .get_or_create_substream_context(SubstreamId::GLOBAL)
            .unwrap()
            .has_field());
    }

    #[test]
    fn test_changelog_retracts_previous_result() {
        let sink = CollectingSink::new();
        let mut t =
            GlobalAggregatingTransformWithSubstream::try_new(changelog_params(), Box::new(sink.clone()))
                .unwrap();

        t.consume(SubstreamId::GLOBAL, &chunk(1, 5, 1)).unwrap();
        let first = sink.take();
        assert_eq!(first.len(), 1);
        assert_eq!(rows(&first[0]), vec![(1, 5, 1)]);
        assert!(t
            .substream(SubstreamId::GLOBAL)
            .unwrap()
            .field::<RetractState>()
            .unwrap()
            .is_enabled());

        t.consume(SubstreamId::GLOBAL, &chunk(1, 9, 2)).unwrap();
        let second = sink.take();
        assert_eq!(second.len(), 1);
        assert_eq!(rows(&second[0]), vec![(1, 5, -1), (1, 9, 1)]);
        assert_eq!(second[0].watermark().map(i64::from), Some(2));
    }

    #[test]
    fn test_changelog_rejects_partial_merge() {
        let merge_schema = Schema::new(vec![Field::new("s", DataType::Binary, true)]);
        let config = AggregationConfig::new()
            .with_aggregate(
                AggregateSpec::new(AggregateFunction::Sum, "s", "s")
                    .with_argument_type(DataType::Int64),
            )
            .with_only_merge(true)
            .with_emit_mode(EmitMode::Changelog);
        let params = AggregatingTransformParams::try_new(config, &merge_schema).unwrap();
        let mut t =
            GlobalAggregatingTransformWithSubstream::try_new(params, Box::new(CollectingSink::new()))
                .unwrap();
        let batch = RecordBatch::try_new(
            Arc::new(merge_schema),
            vec![Arc::new(arrow_array::BinaryArray::from(vec![Some(&b"x"[..])]))],
        )
        .unwrap();
        let err = t.consume(SubstreamId::GLOBAL, &Chunk::new(batch)).unwrap_err();
        assert!(matches!(err, AggregationError::PreconditionViolated(_)));
    }

    #[test]
    fn test_snapshot_with_versions() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "v", "s"))
            .with_emit_version(true);
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        let sink = CollectingSink::new();
        let mut t = GlobalAggregatingTransformWithSubstream::try_new(params, Box::new(sink.clone()))
            .unwrap();

        t.consume(SubstreamId::GLOBAL, &chunk(0, 2, 1)).unwrap();
        t.consume(SubstreamId::GLOBAL, &chunk(0, 3, 2)).unwrap();
        let out = sink.take();
        let versions: Vec<i64> = out
            .iter()
            .map(|c| c.batch().column(1).as_primitive::<Int64Type>().value(0))
            .collect();
        assert_eq!(versions, vec![1, 2]);
        let sums: Vec<i64> = out
            .iter()
            .map(|c| c.batch().column(0).as_primitive::<Int64Type>().value(0))
            .collect();
        assert_eq!(sums, vec![2, 5]);
    }
}
