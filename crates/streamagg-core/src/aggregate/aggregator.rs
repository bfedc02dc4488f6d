//! Folding input chunks into aggregated data variants.

use arrow_array::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use fxhash::FxHashSet;

use super::accumulator::AccumulatorState;
use super::datum::{is_key_type, ColumnReader, Datum, GroupKey};
use super::variants::{AggregatedDataVariants, GroupState};
use super::{AggregateFunction, AggregateSpec, AggregationError};
use crate::chunk::Chunk;
use crate::params::{AggregationConfig, ConfigError, OverflowMode, DELTA_COLUMN, VERSION_COLUMN};

/// A key column bound to the input schema.
#[derive(Debug, Clone)]
pub struct KeyBinding {
    /// The input field, reused verbatim in the output schema
    pub field: Field,
}

/// An aggregate bound to the input schema.
#[derive(Debug, Clone)]
pub struct AggregateBinding {
    /// The configured aggregate
    pub spec: AggregateSpec,
    /// Type of the aggregate argument (not of the input column when merging)
    pub input_type: DataType,
    /// Type of the finalized result
    pub output_type: DataType,
}

/// Schema-bound aggregation logic shared by all substreams of a transform.
#[derive(Debug)]
pub struct Aggregator {
    keys: Vec<KeyBinding>,
    aggregates: Vec<AggregateBinding>,
    delta_column: Option<String>,
    max_groups: Option<usize>,
    overflow_mode: OverflowMode,
    only_merge: bool,
    retractable: bool,
}

impl Aggregator {
    /// Binds `config` to `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown or mistyped columns, duplicate
    /// output names, an empty aggregate list, a zero group limit, or a
    /// delta column combined with partial merging or a non-retractable
    /// function.
    pub fn try_new(config: &AggregationConfig, schema: &Schema) -> Result<Self, ConfigError> {
        if config.aggregates.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one aggregate is required".to_string(),
            ));
        }
        if config.max_groups == Some(0) {
            return Err(ConfigError::Invalid(
                "max_groups must be greater than zero".to_string(),
            ));
        }

        let mut names: FxHashSet<&str> = FxHashSet::default();
        names.insert(DELTA_COLUMN);
        names.insert(VERSION_COLUMN);

        let mut keys = Vec::with_capacity(config.group_by.len());
        for name in &config.group_by {
            let field = lookup_field(schema, name)?;
            if !is_key_type(field.data_type()) {
                return Err(ConfigError::InvalidColumnType {
                    column: name.clone(),
                    data_type: field.data_type().clone(),
                    usage: "group key".to_string(),
                });
            }
            if !names.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate output column '{name}'"
                )));
            }
            keys.push(KeyBinding {
                field: field.clone(),
            });
        }

        let mut aggregates = Vec::with_capacity(config.aggregates.len());
        for spec in &config.aggregates {
            let input_type = bind_argument(spec, schema, config.only_merge)?;
            if !names.insert(spec.output_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate output column '{}'",
                    spec.output_name
                )));
            }
            aggregates.push(AggregateBinding {
                spec: spec.clone(),
                output_type: spec.function.output_type(&input_type),
                input_type,
            });
        }

        if let Some(delta) = &config.delta_column {
            let field = lookup_field(schema, delta)?;
            if field.data_type() != &DataType::Int8 {
                return Err(ConfigError::InvalidColumnType {
                    column: delta.clone(),
                    data_type: field.data_type().clone(),
                    usage: "change weight".to_string(),
                });
            }
            if config.only_merge {
                return Err(ConfigError::Unsupported(
                    "a delta column cannot be combined with partial-state merging".to_string(),
                ));
            }
            if let Some(binding) = aggregates
                .iter()
                .find(|b| !b.spec.function.supports_retraction())
            {
                return Err(ConfigError::Unsupported(format!(
                    "{} does not support retraction from the delta column",
                    binding.spec
                )));
            }
        }

        Ok(Self {
            keys,
            aggregates,
            delta_column: config.delta_column.clone(),
            max_groups: config.max_groups,
            overflow_mode: config.overflow_mode,
            only_merge: config.only_merge,
            retractable: config.delta_column.is_some(),
        })
    }

    /// Bound key columns.
    #[must_use]
    pub fn keys(&self) -> &[KeyBinding] {
        &self.keys
    }

    /// Bound aggregates, in output order.
    #[must_use]
    pub fn aggregates(&self) -> &[AggregateBinding] {
        &self.aggregates
    }

    /// Whether inputs carry a change-weight column.
    #[must_use]
    pub fn has_delta_column(&self) -> bool {
        self.delta_column.is_some()
    }

    /// Whether inputs are partial states.
    #[must_use]
    pub fn only_merge(&self) -> bool {
        self.only_merge
    }

    /// Fresh accumulators for a new group.
    #[must_use]
    pub fn create_accumulators(&self) -> Vec<AccumulatorState> {
        self.aggregates
            .iter()
            .map(|b| AccumulatorState::new(b.spec.function, &b.input_type, self.retractable))
            .collect()
    }

    /// Folds raw rows or merges partial states, depending on configuration.
    ///
    /// Returns `(state_changed, new_keys_added)`.
    ///
    /// # Errors
    ///
    /// See [`execute_on_block`](Self::execute_on_block) and
    /// [`merge_on_block`](Self::merge_on_block).
    pub fn execute_or_merge(
        &self,
        chunk: &Chunk,
        variants: &mut AggregatedDataVariants,
    ) -> Result<(bool, bool), AggregationError> {
        if self.only_merge {
            self.merge_on_block(chunk, variants)
        } else {
            self.execute_on_block(chunk, variants)
        }
    }

    /// Folds the rows of `chunk` into `variants`.
    ///
    /// Returns `(state_changed, new_keys_added)`.
    ///
    /// # Errors
    ///
    /// Fails on missing or mistyped columns, on group overflow in `throw`
    /// mode, and when a value cannot be accumulated.
    pub fn execute_on_block(
        &self,
        chunk: &Chunk,
        variants: &mut AggregatedDataVariants,
    ) -> Result<(bool, bool), AggregationError> {
        self.execute_impl(chunk.batch(), variants, false)
    }

    /// Like [`execute_on_block`](Self::execute_on_block), but first stages
    /// each touched group's previously emitted results so a retract row can
    /// be produced on the next finalize.
    ///
    /// # Errors
    ///
    /// Same as [`execute_on_block`](Self::execute_on_block).
    pub fn execute_and_retract_on_block(
        &self,
        chunk: &Chunk,
        variants: &mut AggregatedDataVariants,
    ) -> Result<(bool, bool), AggregationError> {
        self.execute_impl(chunk.batch(), variants, true)
    }

    /// Merges serialized partial states from `chunk` into `variants`.
    ///
    /// # Errors
    ///
    /// Fails on missing or mistyped columns, undecodable states and
    /// states of the wrong function.
    pub fn merge_on_block(
        &self,
        chunk: &Chunk,
        variants: &mut AggregatedDataVariants,
    ) -> Result<(bool, bool), AggregationError> {
        let batch = chunk.batch();
        if batch.num_rows() == 0 {
            return Ok((false, false));
        }
        let key_readers = self.key_readers(batch)?;
        let state_readers = self
            .aggregates
            .iter()
            .map(|b| {
                let name = b.spec.input.as_deref().ok_or_else(|| {
                    AggregationError::PreconditionViolated(format!(
                        "{} has no partial-state column",
                        b.spec
                    ))
                })?;
                column_reader(batch, name, &DataType::Binary)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut folded = 0u64;
        let mut new_keys = false;
        let result = (|| -> Result<(), AggregationError> {
            for row in 0..batch.num_rows() {
                let key = read_key(&key_readers, row)?;
                let (group, created) = self.lookup_or_create(variants, key, true)?;
                new_keys |= created;
                let Some(group) = group else { continue };

                group.row_count += 1;
                group.updated = true;
                folded += 1;
                for (reader, acc) in state_readers.iter().zip(group.accumulators.iter_mut()) {
                    if let Some(bytes) = reader.bytes(row) {
                        acc.merge(&AccumulatorState::from_bytes(bytes)?)?;
                    }
                }
            }
            Ok(())
        })();
        variants.add_folded_rows(folded);
        result.map(|()| (folded > 0, new_keys))
    }

    fn execute_impl(
        &self,
        batch: &RecordBatch,
        variants: &mut AggregatedDataVariants,
        track_retract: bool,
    ) -> Result<(bool, bool), AggregationError> {
        if batch.num_rows() == 0 {
            return Ok((false, false));
        }
        let key_readers = self.key_readers(batch)?;
        let value_readers = self
            .aggregates
            .iter()
            .map(|b| {
                b.spec
                    .input
                    .as_deref()
                    .map(|name| column_reader(batch, name, &b.input_type))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let delta_reader = self
            .delta_column
            .as_deref()
            .map(|name| column_reader(batch, name, &DataType::Int8))
            .transpose()?;

        // Rows folded before a failure stay folded and are still counted.
        let mut folded = 0u64;
        let mut new_keys = false;
        let result = (|| -> Result<(), AggregationError> {
            for row in 0..batch.num_rows() {
                let weight = delta_reader.as_ref().map_or(1, |r| r.weight(row));
                if weight == 0 {
                    continue;
                }
                let key = read_key(&key_readers, row)?;
                let (group, created) = self.lookup_or_create(variants, key, weight > 0)?;
                new_keys |= created;
                let Some(group) = group else { continue };

                if track_retract {
                    group.stage_retract();
                }
                group.row_count += weight;
                group.updated = true;
                folded += 1;
                for ((binding, reader), acc) in self
                    .aggregates
                    .iter()
                    .zip(&value_readers)
                    .zip(group.accumulators.iter_mut())
                {
                    let value = match reader {
                        Some(reader) => reader.datum(row),
                        None if binding.spec.function == AggregateFunction::Count => {
                            Datum::Int64(1)
                        }
                        None => Datum::Null,
                    };
                    acc.update(&value, weight)?;
                }
            }
            Ok(())
        })();
        variants.add_folded_rows(folded);
        result.map(|()| (folded > 0, new_keys))
    }

    /// Finds the group for `key`, creating it if allowed.
    ///
    /// Returns `None` for rows that must be dropped: retractions of unknown
    /// groups and new keys once the table stopped accepting them.
    fn lookup_or_create<'v>(
        &self,
        variants: &'v mut AggregatedDataVariants,
        key: GroupKey,
        allow_create: bool,
    ) -> Result<(Option<&'v mut GroupState>, bool), AggregationError> {
        let mut created = false;
        if !variants.groups_mut().contains_key(&key) {
            if !allow_create || variants.no_more_keys() {
                return Ok((None, false));
            }
            if let Some(limit) = self.max_groups {
                if variants.len() >= limit {
                    match self.overflow_mode {
                        OverflowMode::Throw => return Err(AggregationError::TooManyGroups { limit }),
                        OverflowMode::Any => {
                            tracing::warn!(
                                limit,
                                "Group limit reached, ignoring new keys from now on"
                            );
                            variants.set_no_more_keys();
                            return Ok((None, false));
                        }
                    }
                }
            }
            variants
                .groups_mut()
                .insert(key.clone(), GroupState::new(self.create_accumulators()));
            created = true;
        }
        Ok((variants.groups_mut().get_mut(&key), created))
    }

    fn key_readers<'a>(
        &self,
        batch: &'a RecordBatch,
    ) -> Result<Vec<ColumnReader<'a>>, AggregationError> {
        self.keys
            .iter()
            .map(|k| column_reader(batch, k.field.name(), k.field.data_type()))
            .collect()
    }
}

fn lookup_field<'s>(schema: &'s Schema, name: &str) -> Result<&'s Field, ConfigError> {
    schema
        .field_with_name(name)
        .map_err(|_| ConfigError::UnknownColumn(name.to_string()))
}

/// Resolves the argument type of `spec`, validating its input column.
fn bind_argument(
    spec: &AggregateSpec,
    schema: &Schema,
    only_merge: bool,
) -> Result<DataType, ConfigError> {
    let Some(input) = &spec.input else {
        if spec.function == AggregateFunction::Count {
            return Ok(DataType::Int64);
        }
        return Err(ConfigError::Invalid(format!(
            "{} requires an input column",
            spec.function
        )));
    };
    let field = lookup_field(schema, input)?;

    let argument_type = if only_merge {
        if field.data_type() != &DataType::Binary {
            return Err(ConfigError::InvalidColumnType {
                column: input.clone(),
                data_type: field.data_type().clone(),
                usage: "partial state".to_string(),
            });
        }
        spec.argument_type.clone().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "{spec} merges partial states and needs an explicit argument type"
            ))
        })?
    } else {
        field.data_type().clone()
    };

    if !spec.function.accepts(&argument_type) {
        return Err(ConfigError::InvalidColumnType {
            column: input.clone(),
            data_type: argument_type,
            usage: spec.function.to_string(),
        });
    }
    Ok(argument_type)
}

fn column_reader<'a>(
    batch: &'a RecordBatch,
    name: &str,
    expected: &DataType,
) -> Result<ColumnReader<'a>, AggregationError> {
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| AggregationError::MissingColumn(name.to_string()))?;
    let mismatch = || AggregationError::ColumnTypeMismatch {
        column: name.to_string(),
        expected: expected.clone(),
        found: array.data_type().clone(),
    };
    if array.data_type() != expected {
        return Err(mismatch());
    }
    ColumnReader::try_new(array).ok_or_else(mismatch)
}

fn read_key(readers: &[ColumnReader<'_>], row: usize) -> Result<GroupKey, AggregationError> {
    readers
        .iter()
        .map(|r| r.key(row))
        .collect::<Option<GroupKey>>()
        .ok_or_else(|| {
            AggregationError::PreconditionViolated("group key column is not keyable".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::KeyValue;
    use crate::params::AggregationConfig;
    use arrow_array::{ArrayRef, BinaryArray, Int64Array, Int8Array, StringArray};
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
            Field::new("_delta", DataType::Int8, true),
        ]))
    }

    fn chunk(keys: Vec<&str>, values: Vec<Option<i64>>, deltas: Vec<i8>) -> Chunk {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Int64Array::from(values)),
            Arc::new(Int8Array::from(deltas)),
        ];
        Chunk::new(RecordBatch::try_new(schema(), columns).unwrap())
    }

    fn keyed_sum() -> AggregationConfig {
        AggregationConfig::new()
            .with_group_by(vec!["k".into()])
            .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "v", "total"))
            .with_aggregate(AggregateSpec::count_star("cnt"))
    }

    fn key(k: &str) -> GroupKey {
        vec![KeyValue::Utf8(k.to_string())]
    }

    #[test]
    fn test_execute_groups_rows() {
        let agg = Aggregator::try_new(&keyed_sum(), &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        let (changed, new_keys) = agg
            .execute_on_block(
                &chunk(vec!["a", "b", "a"], vec![Some(1), Some(2), None], vec![1, 1, 1]),
                &mut variants,
            )
            .unwrap();
        assert!(changed);
        assert!(new_keys);
        assert_eq!(variants.len(), 2);

        let a = variants.group(&key("a")).unwrap();
        assert_eq!(a.results(), vec![Datum::Int64(1), Datum::Int64(2)]);
        assert_eq!(a.row_count, 2);
        assert!(a.updated);
    }

    #[test]
    fn test_existing_keys_are_not_new() {
        let agg = Aggregator::try_new(&keyed_sum(), &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        let c = chunk(vec!["a"], vec![Some(1)], vec![1]);
        agg.execute_on_block(&c, &mut variants).unwrap();
        let (changed, new_keys) = agg.execute_on_block(&c, &mut variants).unwrap();
        assert!(changed);
        assert!(!new_keys);
    }

    #[test]
    fn test_delta_column_retracts() {
        let config = keyed_sum().with_delta_column("_delta");
        let agg = Aggregator::try_new(&config, &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        agg.execute_on_block(
            &chunk(vec!["a", "a", "a"], vec![Some(5), Some(7), Some(5)], vec![1, 1, -1]),
            &mut variants,
        )
        .unwrap();
        let a = variants.group(&key("a")).unwrap();
        assert_eq!(a.results(), vec![Datum::Int64(7), Datum::Int64(1)]);
        assert_eq!(a.row_count, 1);
    }

    #[test]
    fn test_retraction_of_unknown_group_is_dropped() {
        let config = keyed_sum().with_delta_column("_delta");
        let agg = Aggregator::try_new(&config, &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        let (changed, _) = agg
            .execute_on_block(&chunk(vec!["z"], vec![Some(1)], vec![-1]), &mut variants)
            .unwrap();
        assert!(!changed);
        assert!(variants.is_empty());
        assert_eq!(variants.take_folded_rows(), 0);
    }

    #[test]
    fn test_retract_path_stages_prior_results() {
        let agg = Aggregator::try_new(&keyed_sum(), &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        agg.execute_and_retract_on_block(&chunk(vec!["a"], vec![Some(3)], vec![1]), &mut variants)
            .unwrap();
        assert!(variants.group(&key("a")).unwrap().retract.is_none());

        for (_, group) in variants.sorted_entries_mut() {
            group.clear_update();
        }
        agg.execute_and_retract_on_block(&chunk(vec!["a"], vec![Some(4)], vec![1]), &mut variants)
            .unwrap();
        let a = variants.group(&key("a")).unwrap();
        assert_eq!(a.retract, Some(vec![Datum::Int64(3), Datum::Int64(1)]));
        assert_eq!(a.results(), vec![Datum::Int64(7), Datum::Int64(2)]);
    }

    #[test]
    fn test_overflow_throw() {
        let config = keyed_sum().with_max_groups(1, OverflowMode::Throw);
        let agg = Aggregator::try_new(&config, &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        let err = agg
            .execute_on_block(&chunk(vec!["a", "b"], vec![Some(1), Some(2)], vec![1, 1]), &mut variants)
            .unwrap_err();
        assert!(matches!(err, AggregationError::TooManyGroups { limit: 1 }));
        // The row folded before the overflow is kept and reported
        assert!(variants.group(&key("a")).unwrap().updated);
        assert_eq!(variants.take_folded_rows(), 1);
    }

    #[test]
    fn test_overflow_any_keeps_existing_groups() {
        let config = keyed_sum().with_max_groups(1, OverflowMode::Any);
        let agg = Aggregator::try_new(&config, &schema()).unwrap();
        let mut variants = AggregatedDataVariants::new();
        agg.execute_on_block(
            &chunk(vec!["a", "b", "a"], vec![Some(1), Some(2), Some(3)], vec![1, 1, 1]),
            &mut variants,
        )
        .unwrap();
        assert!(variants.no_more_keys());
        assert_eq!(variants.len(), 1);
        assert_eq!(variants.take_folded_rows(), 2);
        assert_eq!(variants.take_folded_rows(), 0);
        assert_eq!(
            variants.group(&key("a")).unwrap().results()[0],
            Datum::Int64(4)
        );
    }

    #[test]
    fn test_missing_column() {
        let agg = Aggregator::try_new(&keyed_sum(), &schema()).unwrap();
        let other = Arc::new(Schema::new(vec![Field::new("k", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(
            other,
            vec![Arc::new(StringArray::from(vec!["a"])) as ArrayRef],
        )
        .unwrap();
        let err = agg
            .execute_on_block(&Chunk::new(batch), &mut AggregatedDataVariants::new())
            .unwrap_err();
        assert!(matches!(err, AggregationError::MissingColumn(c) if c == "v"));
    }

    #[test]
    fn test_config_validation() {
        let s = schema();
        let unknown = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "nope", "x"));
        assert!(matches!(
            Aggregator::try_new(&unknown, &s),
            Err(ConfigError::UnknownColumn(_))
        ));

        let bad_sum = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "k", "x"));
        assert!(matches!(
            Aggregator::try_new(&bad_sum, &s),
            Err(ConfigError::InvalidColumnType { .. })
        ));

        let dup = AggregationConfig::new()
            .with_aggregate(AggregateSpec::count_star("x"))
            .with_aggregate(AggregateSpec::count_star("x"));
        assert!(matches!(
            Aggregator::try_new(&dup, &s),
            Err(ConfigError::Invalid(_))
        ));

        let reserved = AggregationConfig::new().with_aggregate(AggregateSpec::count_star("_delta"));
        assert!(Aggregator::try_new(&reserved, &s).is_err());

        let empty = AggregationConfig::new();
        assert!(Aggregator::try_new(&empty, &s).is_err());

        let last_with_delta = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::LastValue, "v", "l"))
            .with_delta_column("_delta");
        assert!(matches!(
            Aggregator::try_new(&last_with_delta, &s),
            Err(ConfigError::Unsupported(_))
        ));

        let wrong_delta = AggregationConfig::new()
            .with_aggregate(AggregateSpec::count_star("c"))
            .with_delta_column("v");
        assert!(matches!(
            Aggregator::try_new(&wrong_delta, &s),
            Err(ConfigError::InvalidColumnType { .. })
        ));
    }

    #[test]
    fn test_merge_partial_states() {
        let mut partial = AccumulatorState::new(AggregateFunction::Sum, &DataType::Int64, false);
        partial.update(&Datum::Int64(10), 1).unwrap();
        let bytes = partial.to_bytes().unwrap();

        let merge_schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, false),
            Field::new("total", DataType::Binary, true),
        ]));
        let config = AggregationConfig::new()
            .with_group_by(vec!["k".into()])
            .with_aggregate(
                AggregateSpec::new(AggregateFunction::Sum, "total", "total")
                    .with_argument_type(DataType::Int64),
            )
            .with_only_merge(true);
        let agg = Aggregator::try_new(&config, &merge_schema).unwrap();
        assert_eq!(agg.aggregates()[0].output_type, DataType::Int64);

        let batch = RecordBatch::try_new(
            merge_schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "a"])) as ArrayRef,
                Arc::new(BinaryArray::from(vec![Some(bytes.as_slice()), Some(bytes.as_slice())])),
            ],
        )
        .unwrap();
        let mut variants = AggregatedDataVariants::new();
        agg.execute_or_merge(&Chunk::new(batch), &mut variants)
            .unwrap();
        assert_eq!(
            variants.group(&key("a")).unwrap().results(),
            vec![Datum::Int64(20)]
        );
    }

    #[test]
    fn test_merge_requires_argument_type() {
        let merge_schema = Schema::new(vec![Field::new("total", DataType::Binary, true)]);
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "total", "total"))
            .with_only_merge(true);
        assert!(matches!(
            Aggregator::try_new(&config, &merge_schema),
            Err(ConfigError::Invalid(_))
        ));
    }
}
