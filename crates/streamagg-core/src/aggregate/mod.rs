//! # Aggregate Module
//!
//! Incremental group-by aggregation over Arrow chunks.
//!
//! - [`AggregateFunction`] / [`AggregateSpec`]: what to compute
//! - [`AccumulatorState`]: per-group, per-function state with insert,
//!   retract and merge
//! - [`AggregatedDataVariants`]: the group table of one substream
//! - [`Aggregator`]: binds a configuration to an input schema and folds
//!   chunks into variants
//!
//! Input rows carry an optional Int8 change weight (`_delta`): `+1` inserts
//! a row, `-1` retracts a previously inserted one. Rows without the column
//! are inserts.

// rkyv-derived `AccumulatorStateResolver` has undocumented variant fields.
#[allow(missing_docs)]
pub mod accumulator;
pub mod aggregator;
pub mod datum;
pub mod variants;

use std::fmt;

use arrow_schema::{ArrowError, DataType};

use crate::substream::FieldKind;

pub use accumulator::{AccumulatorState, ValueCount};
pub use aggregator::Aggregator;
pub use datum::{Datum, GroupKey, KeyValue};
pub use variants::{AggregatedDataVariants, GroupState};

/// Supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// Number of non-null inputs, or of rows for `count(*)`
    Count,
    /// Sum of numeric inputs
    Sum,
    /// Arithmetic mean of numeric inputs
    Avg,
    /// Smallest input
    Min,
    /// Largest input
    Max,
    /// Most recently inserted non-null input
    LastValue,
}

impl AggregateFunction {
    /// Whether the function can absorb retractions.
    #[must_use]
    pub fn supports_retraction(&self) -> bool {
        !matches!(self, Self::LastValue)
    }

    /// Whether `data_type` is a valid argument for this function.
    #[must_use]
    pub fn accepts(&self, data_type: &DataType) -> bool {
        match self {
            Self::Count | Self::Min | Self::Max | Self::LastValue => {
                datum::is_value_type(data_type)
            }
            Self::Sum | Self::Avg => matches!(data_type, DataType::Int64 | DataType::Float64),
        }
    }

    /// Type of the finalized result for an argument of `input_type`.
    #[must_use]
    pub fn output_type(&self, input_type: &DataType) -> DataType {
        match self {
            Self::Count => DataType::Int64,
            Self::Avg => DataType::Float64,
            Self::Sum | Self::Min | Self::Max | Self::LastValue => input_type.clone(),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::LastValue => "last_value",
        };
        f.write_str(name)
    }
}

/// One aggregate in the output: function, input column and output name.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    /// Function to apply
    pub function: AggregateFunction,
    /// Input column; `None` only for `count(*)`
    pub input: Option<String>,
    /// Name of the output column
    pub output_name: String,
    /// Argument type, required when merging partial states because the
    /// input column then holds serialized states
    pub argument_type: Option<DataType>,
}

impl AggregateSpec {
    /// `function(input) AS output_name`.
    #[must_use]
    pub fn new(
        function: AggregateFunction,
        input: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            function,
            input: Some(input.into()),
            output_name: output_name.into(),
            argument_type: None,
        }
    }

    /// `count(*) AS output_name`.
    #[must_use]
    pub fn count_star(output_name: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            input: None,
            output_name: output_name.into(),
            argument_type: None,
        }
    }

    /// Declares the argument type explicitly.
    #[must_use]
    pub fn with_argument_type(mut self, data_type: DataType) -> Self {
        self.argument_type = Some(data_type);
        self
    }
}

impl fmt::Display for AggregateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            Some(input) => write!(f, "{}({input}) AS {}", self.function, self.output_name),
            None => write!(f, "{}(*) AS {}", self.function, self.output_name),
        }
    }
}

/// Errors raised while folding rows or producing output.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    /// An internal precondition of the aggregation path does not hold
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    /// The group limit was reached with overflow mode `throw`
    #[error("Too many groups: limit of {limit} exceeded")]
    TooManyGroups {
        /// Configured `max_groups`
        limit: usize,
    },

    /// An input column does not have the type bound at construction
    #[error("Column '{column}' has type {found}, expected {expected}")]
    ColumnTypeMismatch {
        /// Column name
        column: String,
        /// Type bound at construction
        expected: DataType,
        /// Type found in the chunk
        found: DataType,
    },

    /// An input column is missing from the chunk
    #[error("Missing column '{0}'")]
    MissingColumn(String),

    /// A value does not fit the accumulator it was fed to
    #[error("{function} cannot accumulate value {value}")]
    AccumulatorTypeMismatch {
        /// Function of the accumulator
        function: AggregateFunction,
        /// Offending value
        value: String,
    },

    /// A retraction reached a function that cannot absorb it
    #[error("{0} does not support retraction")]
    RetractionUnsupported(AggregateFunction),

    /// Two accumulator states of different functions were merged
    #[error("Cannot merge {found} state into {expected} state")]
    AccumulatorMismatch {
        /// Function of the target state
        expected: AggregateFunction,
        /// Function of the merged state
        found: AggregateFunction,
    },

    /// The substream's auxiliary field was read before being installed
    #[error("Substream field is not set")]
    FieldNotSet,

    /// The substream's auxiliary field holds a different kind
    #[error("Substream field is {found}, expected {expected}")]
    FieldTypeMismatch {
        /// Requested kind
        expected: FieldKind,
        /// Installed kind
        found: FieldKind,
    },

    /// A partial state or variants snapshot could not be (de)serialized
    #[error("Partial state error: {0}")]
    PartialState(String),

    /// Arrow failed to build an output batch
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// The downstream sink rejected the output
    #[error("Sink error: {0}")]
    Sink(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_display() {
        assert_eq!(AggregateFunction::LastValue.to_string(), "last_value");
        assert_eq!(
            AggregateSpec::count_star("cnt").to_string(),
            "count(*) AS cnt"
        );
        assert_eq!(
            AggregateSpec::new(AggregateFunction::Sum, "v", "total").to_string(),
            "sum(v) AS total"
        );
    }

    #[test]
    fn test_function_types() {
        assert!(AggregateFunction::Sum.accepts(&DataType::Float64));
        assert!(!AggregateFunction::Avg.accepts(&DataType::Utf8));
        assert!(AggregateFunction::Max.accepts(&DataType::Utf8));
        assert_eq!(
            AggregateFunction::Count.output_type(&DataType::Utf8),
            DataType::Int64
        );
        assert_eq!(
            AggregateFunction::Avg.output_type(&DataType::Int64),
            DataType::Float64
        );
        assert!(!AggregateFunction::LastValue.supports_retraction());
    }
}
