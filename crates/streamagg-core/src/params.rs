//! # Aggregation Parameters
//!
//! [`AggregationConfig`] is the user-facing configuration; it is validated
//! against an input schema by [`AggregatingTransformParams::try_new`],
//! which binds column indices and derives the output schemas.
//!
//! ```rust
//! use arrow_schema::{DataType, Field, Schema};
//! use streamagg_core::aggregate::{AggregateFunction, AggregateSpec};
//! use streamagg_core::params::{AggregatingTransformParams, AggregationConfig, EmitMode};
//!
//! let schema = Schema::new(vec![
//!     Field::new("k", DataType::Utf8, false),
//!     Field::new("v", DataType::Int64, true),
//! ]);
//! let config = AggregationConfig::new()
//!     .with_group_by(vec!["k".to_string()])
//!     .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "v", "total"))
//!     .with_emit_mode(EmitMode::Updates);
//! let params = AggregatingTransformParams::try_new(config, &schema).unwrap();
//! assert_eq!(params.output_schema().fields().len(), 2);
//! ```

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::aggregate::{AggregateSpec, Aggregator};

/// Name of the change-weight column (+1 insert, -1 retract).
pub const DELTA_COLUMN: &str = "_delta";

/// Name of the result version column.
pub const VERSION_COLUMN: &str = "_version";

/// Default upper bound on rows per output chunk.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 65_536;

/// Grouping mode, derived from the key columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupByMode {
    /// No key columns: a single group per substream
    Global,
    /// One group per distinct key tuple
    Keyed,
}

/// How finalized results are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
    /// Every group on every finalize
    #[default]
    Snapshot,
    /// Only groups changed since the previous finalize
    Updates,
    /// Retract/insert pairs for changed groups, with a `_delta` column
    Changelog,
}

/// What to do when `max_groups` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowMode {
    /// Fail the chunk with `TooManyGroups`
    #[default]
    Throw,
    /// Stop creating groups and keep aggregating the existing ones
    Any,
}

/// Errors raised while validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The combination of options is not supported
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The grouping mode does not fit the transform
    #[error("Invalid grouping: {0}")]
    InvalidGrouping(String),

    /// A configured column is not in the input schema
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    /// A configured column has a type the aggregation cannot use
    #[error("Column '{column}' has unsupported type {data_type} for {usage}")]
    InvalidColumnType {
        /// Column name
        column: String,
        /// Its type
        data_type: DataType,
        /// How it was meant to be used
        usage: String,
    },

    /// Any other invalid setting
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// User-facing aggregation configuration.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Key columns; empty for global aggregation
    pub group_by: Vec<String>,
    /// Aggregates in output order
    pub aggregates: Vec<AggregateSpec>,
    /// Emission mode
    pub emit_mode: EmitMode,
    /// Append a `_version` column to final results
    pub emit_version: bool,
    /// Emit finalized values; when false, emit serialized partial states
    pub final_results: bool,
    /// Input aggregate columns hold partial states to merge
    pub only_merge: bool,
    /// Maximum number of groups per substream (`None` = unlimited)
    pub max_groups: Option<usize>,
    /// Behaviour once `max_groups` is reached
    pub overflow_mode: OverflowMode,
    /// Optional Int8 change-weight input column
    pub delta_column: Option<String>,
    /// Maximum rows per output chunk
    pub max_block_size: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            group_by: Vec::new(),
            aggregates: Vec::new(),
            emit_mode: EmitMode::default(),
            emit_version: false,
            final_results: true,
            only_merge: false,
            max_groups: None,
            overflow_mode: OverflowMode::default(),
            delta_column: None,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

impl AggregationConfig {
    /// Creates a default configuration (global, snapshot, final).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key columns.
    #[must_use]
    pub fn with_group_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    /// Appends an aggregate.
    #[must_use]
    pub fn with_aggregate(mut self, spec: AggregateSpec) -> Self {
        self.aggregates.push(spec);
        self
    }

    /// Sets the emit mode.
    #[must_use]
    pub fn with_emit_mode(mut self, mode: EmitMode) -> Self {
        self.emit_mode = mode;
        self
    }

    /// Enables or disables result versioning.
    #[must_use]
    pub fn with_emit_version(mut self, enabled: bool) -> Self {
        self.emit_version = enabled;
        self
    }

    /// Chooses between finalized values and partial states.
    #[must_use]
    pub fn with_final_results(mut self, final_results: bool) -> Self {
        self.final_results = final_results;
        self
    }

    /// Enables partial-state merging.
    #[must_use]
    pub fn with_only_merge(mut self, only_merge: bool) -> Self {
        self.only_merge = only_merge;
        self
    }

    /// Limits the number of groups.
    #[must_use]
    pub fn with_max_groups(mut self, max_groups: usize, mode: OverflowMode) -> Self {
        self.max_groups = Some(max_groups);
        self.overflow_mode = mode;
        self
    }

    /// Sets the change-weight input column.
    #[must_use]
    pub fn with_delta_column(mut self, column: impl Into<String>) -> Self {
        self.delta_column = Some(column.into());
        self
    }

    /// Sets the maximum rows per output chunk.
    #[must_use]
    pub fn with_max_block_size(mut self, rows: usize) -> Self {
        self.max_block_size = rows;
        self
    }

    /// Grouping mode implied by the key columns.
    #[must_use]
    pub fn group_by_mode(&self) -> GroupByMode {
        if self.group_by.is_empty() {
            GroupByMode::Global
        } else {
            GroupByMode::Keyed
        }
    }
}

/// Validated, schema-bound parameters shared by a transform and its
/// substreams.
#[derive(Debug)]
pub struct AggregatingTransformParams {
    config: AggregationConfig,
    aggregator: Aggregator,
    result_schema: SchemaRef,
    output_schema: SchemaRef,
}

impl AggregatingTransformParams {
    /// Validates `config` against `input_schema`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a column is missing or mistyped, or if the
    /// options are inconsistent (changelog on partial results, zero block
    /// size, ...).
    pub fn try_new(
        config: AggregationConfig,
        input_schema: &Schema,
    ) -> Result<Arc<Self>, ConfigError> {
        if config.max_block_size == 0 {
            return Err(ConfigError::Invalid(
                "max_block_size must be greater than zero".to_string(),
            ));
        }
        if config.emit_mode == EmitMode::Changelog && !config.final_results {
            return Err(ConfigError::Unsupported(
                "changelog emission requires final results".to_string(),
            ));
        }

        let aggregator = Aggregator::try_new(&config, input_schema)?;

        let mut fields: Vec<Field> = aggregator
            .keys()
            .iter()
            .map(|key| key.field.clone())
            .collect();
        for binding in aggregator.aggregates() {
            let data_type = if config.final_results {
                binding.output_type.clone()
            } else {
                DataType::Binary
            };
            fields.push(Field::new(&binding.spec.output_name, data_type, true));
        }
        if config.emit_mode == EmitMode::Changelog {
            fields.push(Field::new(DELTA_COLUMN, DataType::Int8, false));
        }
        let result_schema = Arc::new(Schema::new(fields.clone()));

        let output_schema = if config.final_results && config.emit_version {
            fields.push(Field::new(VERSION_COLUMN, DataType::Int64, false));
            Arc::new(Schema::new(fields))
        } else {
            Arc::clone(&result_schema)
        };

        Ok(Arc::new(Self {
            config,
            aggregator,
            result_schema,
            output_schema,
        }))
    }

    /// The configuration these parameters were built from.
    #[must_use]
    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Grouping mode.
    #[must_use]
    pub fn group_by(&self) -> GroupByMode {
        self.config.group_by_mode()
    }

    /// Emission mode.
    #[must_use]
    pub fn emit_mode(&self) -> EmitMode {
        self.config.emit_mode
    }

    /// Whether output is a changelog stream.
    #[must_use]
    pub fn emit_changelog(&self) -> bool {
        self.config.emit_mode == EmitMode::Changelog
    }

    /// Whether a `_version` column is requested.
    #[must_use]
    pub fn emit_version(&self) -> bool {
        self.config.emit_version
    }

    /// Whether results are finalized values.
    #[must_use]
    pub fn final_results(&self) -> bool {
        self.config.final_results
    }

    /// Whether input columns are partial states to merge.
    #[must_use]
    pub fn only_merge(&self) -> bool {
        self.config.only_merge
    }

    /// Maximum rows per output chunk.
    #[must_use]
    pub fn max_block_size(&self) -> usize {
        self.config.max_block_size
    }

    /// The schema-bound aggregator.
    #[must_use]
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Schema of converted results (keys, aggregates, optional `_delta`).
    #[must_use]
    pub fn result_schema(&self) -> &SchemaRef {
        &self.result_schema
    }

    /// Schema of emitted chunks (result schema plus optional `_version`).
    #[must_use]
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateFunction;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Float64, true),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = AggregationConfig::default();
        assert_eq!(config.emit_mode, EmitMode::Snapshot);
        assert_eq!(config.overflow_mode, OverflowMode::Throw);
        assert!(config.final_results);
        assert_eq!(config.max_block_size, DEFAULT_MAX_BLOCK_SIZE);
        assert_eq!(config.group_by_mode(), GroupByMode::Global);
    }

    #[test]
    fn test_keyed_output_schema() {
        let config = AggregationConfig::new()
            .with_group_by(vec!["k".into()])
            .with_aggregate(AggregateSpec::count_star("cnt"))
            .with_aggregate(AggregateSpec::new(AggregateFunction::Avg, "v", "avg_v"));
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        assert_eq!(params.group_by(), GroupByMode::Keyed);
        let out = params.output_schema();
        assert_eq!(out.field(0).name(), "k");
        assert_eq!(out.field(1).data_type(), &DataType::Int64);
        assert_eq!(out.field(2).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_changelog_schema_has_delta() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::Sum, "v", "s"))
            .with_emit_mode(EmitMode::Changelog);
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        assert!(params.emit_changelog());
        let out = params.output_schema();
        assert_eq!(out.fields().len(), 2);
        assert_eq!(out.field(1).name(), DELTA_COLUMN);
        assert_eq!(out.field(1).data_type(), &DataType::Int8);
    }

    #[test]
    fn test_version_column() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::count_star("c"))
            .with_emit_version(true);
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        assert_eq!(params.result_schema().fields().len(), 1);
        assert_eq!(params.output_schema().fields().len(), 2);
        assert_eq!(params.output_schema().field(1).name(), VERSION_COLUMN);
    }

    #[test]
    fn test_partial_results_are_binary() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::new(AggregateFunction::Max, "v", "m"))
            .with_final_results(false)
            .with_emit_version(true);
        let params = AggregatingTransformParams::try_new(config, &schema()).unwrap();
        let out = params.output_schema();
        assert_eq!(out.fields().len(), 1);
        assert_eq!(out.field(0).data_type(), &DataType::Binary);
    }

    #[test]
    fn test_rejects_changelog_partials() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::count_star("c"))
            .with_emit_mode(EmitMode::Changelog)
            .with_final_results(false);
        assert!(matches!(
            AggregatingTransformParams::try_new(config, &schema()),
            Err(ConfigError::Unsupported(_))
        ));
    }

    #[test]
    fn test_rejects_zero_block_size() {
        let config = AggregationConfig::new()
            .with_aggregate(AggregateSpec::count_star("c"))
            .with_max_block_size(0);
        assert!(matches!(
            AggregatingTransformParams::try_new(config, &schema()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
