//! # Aggregating Helper
//!
//! Converts aggregated data variants into output chunks.
//!
//! Three conversions exist, one per [`EmitMode`]:
//!
//! | Mode        | Rows emitted                                   |
//! |-------------|------------------------------------------------|
//! | `Snapshot`  | every live group                               |
//! | `Updates`   | live groups changed since the last finalize    |
//! | `Changelog` | retract (-1) / insert (+1) pairs for changes   |
//!
//! Rows are emitted in ascending key order and split into chunks of at most
//! `max_block_size` rows. A retract/insert pair is never split across two
//! chunks. Groups whose net row count reached zero are not emitted (the
//! changelog still retracts them) and are dropped from the variants.

use std::sync::Arc;

use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder, Int8Builder, StringBuilder,
};
use arrow_array::{ArrayRef, Int64Array, RecordBatch};
use arrow_schema::{DataType, SchemaRef};

use crate::aggregate::{
    AccumulatorState, AggregatedDataVariants, AggregationError, Datum, GroupKey, GroupState,
    KeyValue,
};
use crate::chunk::{Chunk, ChunkList};
use crate::params::{AggregatingTransformParams, EmitMode};

/// Returns true if only changed groups should be emitted.
#[must_use]
pub fn only_emit_updates(emit_mode: EmitMode) -> bool {
    emit_mode == EmitMode::Updates
}

/// Converts every live group into output rows.
///
/// # Errors
///
/// Returns [`AggregationError`] if an output batch cannot be built.
pub fn convert_to_chunks(
    variants: &mut AggregatedDataVariants,
    params: &AggregatingTransformParams,
) -> Result<ChunkList, AggregationError> {
    let mut builder = ChunkBuilder::for_params(params, false)?;
    for (key, group) in variants.sorted_entries_mut() {
        group.clear_update();
        if group.row_count <= 0 {
            continue;
        }
        builder.reserve_rows(1)?;
        push_group(&mut builder, key, group, params.final_results(), None)?;
    }
    variants.remove_dead_groups();
    builder.finish()
}

/// Converts groups changed since the previous emission and clears their
/// change flags.
///
/// # Errors
///
/// Returns [`AggregationError`] if an output batch cannot be built.
pub fn convert_updates_to_chunks(
    variants: &mut AggregatedDataVariants,
    params: &AggregatingTransformParams,
) -> Result<ChunkList, AggregationError> {
    let mut builder = ChunkBuilder::for_params(params, false)?;
    for (key, group) in variants.sorted_entries_mut() {
        if !group.updated {
            continue;
        }
        group.clear_update();
        if group.row_count <= 0 {
            continue;
        }
        builder.reserve_rows(1)?;
        push_group(&mut builder, key, group, params.final_results(), None)?;
    }
    variants.remove_dead_groups();
    builder.finish()
}

/// Converts changed groups into retract/insert pairs with a `_delta`
/// column.
///
/// A group yields a retract row for its previously emitted results (when
/// they were staged) followed by an insert row for its current results,
/// unless no live rows remain.
///
/// # Errors
///
/// Returns [`AggregationError`] if an output batch cannot be built, or
/// [`AggregationError::PreconditionViolated`] if the parameters are not in
/// changelog mode.
pub fn convert_to_changelog_chunks(
    variants: &mut AggregatedDataVariants,
    params: &AggregatingTransformParams,
) -> Result<ChunkList, AggregationError> {
    if !params.emit_changelog() {
        return Err(AggregationError::PreconditionViolated(
            "changelog conversion requires changelog emit mode".to_string(),
        ));
    }
    let mut builder = ChunkBuilder::for_params(params, true)?;
    for (key, group) in variants.sorted_entries_mut() {
        if !group.updated {
            continue;
        }
        let retract = group.take_retract();
        let alive = group.row_count > 0;
        builder.reserve_rows(usize::from(retract.is_some()) + usize::from(alive))?;
        if let Some(prior) = retract {
            builder.push_row(key, RowValues::Final(&prior), Some(-1))?;
        }
        if alive {
            builder.push_row(key, RowValues::Final(&group.results()), Some(1))?;
        }
        group.clear_update();
    }
    variants.remove_dead_groups();
    builder.finish()
}

/// Appends a constant `_version` column to every chunk.
///
/// # Errors
///
/// Returns [`AggregationError::Arrow`] if `output_schema` does not match
/// the chunks plus one Int64 column.
pub fn append_version_column(
    chunks: ChunkList,
    version: i64,
    output_schema: &SchemaRef,
) -> Result<ChunkList, AggregationError> {
    chunks
        .into_iter()
        .map(|chunk| {
            let context = chunk.context().cloned();
            let batch = chunk.into_batch();
            let mut columns = batch.columns().to_vec();
            columns.push(Arc::new(Int64Array::from(vec![version; batch.num_rows()])));
            let chunk = Chunk::new(RecordBatch::try_new(Arc::clone(output_schema), columns)?);
            Ok(match context {
                Some(ctx) => chunk.with_context(ctx),
                None => chunk,
            })
        })
        .collect()
}

fn push_group(
    builder: &mut ChunkBuilder,
    key: &GroupKey,
    group: &GroupState,
    final_results: bool,
    delta: Option<i8>,
) -> Result<(), AggregationError> {
    if final_results {
        builder.push_row(key, RowValues::Final(&group.results()), delta)
    } else {
        builder.push_row(key, RowValues::Partial(&group.accumulators), delta)
    }
}

/// Aggregate cells of one output row.
pub(crate) enum RowValues<'a> {
    /// Finalized values
    Final(&'a [Datum]),
    /// Accumulator states, serialized into Binary cells
    Partial(&'a [AccumulatorState]),
}

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int8(Int8Builder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
}

impl ColumnBuilder {
    fn new(data_type: &DataType, capacity: usize) -> Result<Self, AggregationError> {
        Ok(match data_type {
            DataType::Boolean => Self::Boolean(BooleanBuilder::with_capacity(capacity)),
            DataType::Int8 => Self::Int8(Int8Builder::with_capacity(capacity)),
            DataType::Int64 => Self::Int64(Int64Builder::with_capacity(capacity)),
            DataType::Float64 => Self::Float64(Float64Builder::with_capacity(capacity)),
            DataType::Utf8 => Self::Utf8(StringBuilder::new()),
            DataType::Binary => Self::Binary(BinaryBuilder::new()),
            other => {
                return Err(AggregationError::PreconditionViolated(format!(
                    "no output builder for type {other}"
                )))
            }
        })
    }

    fn append_key(&mut self, key: &KeyValue) -> Result<(), AggregationError> {
        match (self, key) {
            (Self::Boolean(b), KeyValue::Null) => b.append_null(),
            (Self::Int64(b), KeyValue::Null) => b.append_null(),
            (Self::Utf8(b), KeyValue::Null) => b.append_null(),
            (Self::Boolean(b), KeyValue::Boolean(v)) => b.append_value(*v),
            (Self::Int64(b), KeyValue::Int64(v)) => b.append_value(*v),
            (Self::Utf8(b), KeyValue::Utf8(v)) => b.append_value(v),
            (_, key) => {
                return Err(AggregationError::PreconditionViolated(format!(
                    "key value {key} does not match its output column"
                )))
            }
        }
        Ok(())
    }

    fn append_datum(&mut self, value: &Datum) -> Result<(), AggregationError> {
        match (self, value) {
            (Self::Boolean(b), Datum::Null) => b.append_null(),
            (Self::Int64(b), Datum::Null) => b.append_null(),
            (Self::Float64(b), Datum::Null) => b.append_null(),
            (Self::Utf8(b), Datum::Null) => b.append_null(),
            (Self::Boolean(b), Datum::Boolean(v)) => b.append_value(*v),
            (Self::Int64(b), Datum::Int64(v)) => b.append_value(*v),
            (Self::Float64(b), Datum::Float64(v)) => b.append_value(*v),
            (Self::Utf8(b), Datum::Utf8(v)) => b.append_value(v),
            (_, value) => {
                return Err(AggregationError::PreconditionViolated(format!(
                    "value {value} does not match its output column"
                )))
            }
        }
        Ok(())
    }

    fn append_state(&mut self, state: &AccumulatorState) -> Result<(), AggregationError> {
        let Self::Binary(b) = self else {
            return Err(AggregationError::PreconditionViolated(
                "partial states require a binary output column".to_string(),
            ));
        };
        b.append_value(state.to_bytes()?);
        Ok(())
    }

    fn append_delta(&mut self, delta: i8) -> Result<(), AggregationError> {
        let Self::Int8(b) = self else {
            return Err(AggregationError::PreconditionViolated(
                "delta column must be Int8".to_string(),
            ));
        };
        b.append_value(delta);
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Boolean(b) => Arc::new(b.finish()),
            Self::Int8(b) => Arc::new(b.finish()),
            Self::Int64(b) => Arc::new(b.finish()),
            Self::Float64(b) => Arc::new(b.finish()),
            Self::Utf8(b) => Arc::new(b.finish()),
            Self::Binary(b) => Arc::new(b.finish()),
        }
    }
}

/// Row-wise builder producing chunks of bounded size.
pub(crate) struct ChunkBuilder {
    schema: SchemaRef,
    keys: Vec<ColumnBuilder>,
    aggregates: Vec<ColumnBuilder>,
    delta: Option<ColumnBuilder>,
    rows: usize,
    max_block_size: usize,
    chunks: ChunkList,
}

impl ChunkBuilder {
    fn for_params(
        params: &AggregatingTransformParams,
        with_delta: bool,
    ) -> Result<Self, AggregationError> {
        Self::new(
            params.result_schema(),
            params.aggregator().keys().len(),
            with_delta,
            params.max_block_size(),
        )
    }

    /// Creates a builder for `schema`: `num_keys` key columns, then the
    /// aggregate columns, then a trailing Int8 delta column if requested.
    pub(crate) fn new(
        schema: &SchemaRef,
        num_keys: usize,
        with_delta: bool,
        max_block_size: usize,
    ) -> Result<Self, AggregationError> {
        let fields = schema.fields();
        let layout_error = || {
            AggregationError::PreconditionViolated(
                "result schema does not fit the aggregation layout".to_string(),
            )
        };
        let value_end = fields
            .len()
            .checked_sub(usize::from(with_delta))
            .ok_or_else(layout_error)?;
        if num_keys > value_end || max_block_size == 0 {
            return Err(layout_error());
        }
        let capacity = max_block_size.min(1024);
        let build = |range: std::ops::Range<usize>| {
            fields[range]
                .iter()
                .map(|f| ColumnBuilder::new(f.data_type(), capacity))
                .collect::<Result<Vec<_>, _>>()
        };
        let delta = if with_delta {
            Some(ColumnBuilder::new(fields[value_end].data_type(), capacity)?)
        } else {
            None
        };
        Ok(Self {
            schema: Arc::clone(schema),
            keys: build(0..num_keys)?,
            aggregates: build(num_keys..value_end)?,
            delta,
            rows: 0,
            max_block_size,
            chunks: Vec::new(),
        })
    }

    /// Makes room for `rows` rows that must land in the same chunk.
    pub(crate) fn reserve_rows(&mut self, rows: usize) -> Result<(), AggregationError> {
        if self.rows > 0 && self.rows + rows > self.max_block_size {
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn push_row(
        &mut self,
        key: &GroupKey,
        values: RowValues<'_>,
        delta: Option<i8>,
    ) -> Result<(), AggregationError> {
        if key.len() != self.keys.len() {
            return Err(AggregationError::PreconditionViolated(format!(
                "expected {} key values, got {}",
                self.keys.len(),
                key.len()
            )));
        }
        let num_values = match values {
            RowValues::Final(v) => v.len(),
            RowValues::Partial(v) => v.len(),
        };
        if num_values != self.aggregates.len() {
            return Err(AggregationError::PreconditionViolated(format!(
                "expected {} aggregate values, got {num_values}",
                self.aggregates.len()
            )));
        }
        match (&mut self.delta, delta) {
            (Some(column), Some(delta)) => column.append_delta(delta)?,
            (None, None) => {}
            _ => {
                return Err(AggregationError::PreconditionViolated(
                    "delta value does not match the output layout".to_string(),
                ))
            }
        }

        for (column, value) in self.keys.iter_mut().zip(key) {
            column.append_key(value)?;
        }
        match values {
            RowValues::Final(values) => {
                for (column, value) in self.aggregates.iter_mut().zip(values) {
                    column.append_datum(value)?;
                }
            }
            RowValues::Partial(states) => {
                for (column, state) in self.aggregates.iter_mut().zip(states) {
                    column.append_state(state)?;
                }
            }
        }
        self.rows += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AggregationError> {
        let mut columns: Vec<ArrayRef> = self
            .keys
            .iter_mut()
            .chain(self.aggregates.iter_mut())
            .map(ColumnBuilder::finish)
            .collect();
        if let Some(delta) = &mut self.delta {
            columns.push(delta.finish());
        }
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)?;
        self.chunks.push(Chunk::new(batch));
        self.rows = 0;
        Ok(())
    }

    /// Flushes pending rows. Returns no chunks if no row was pushed.
    pub(crate) fn finish(mut self) -> Result<ChunkList, AggregationError> {
        if self.rows > 0 {
            self.flush()?;
        }
        Ok(self.chunks)
    }
}
