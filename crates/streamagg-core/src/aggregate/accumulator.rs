//! Per-group accumulator state.
//!
//! [`AccumulatorState`] is a closed sum type over the supported aggregate
//! functions. Each variant supports insert and merge; `count`, `sum`,
//! `avg`, `min` and `max` also support retraction (negative weights),
//! which is what lets a changelog input shrink a group.
//!
//! States are `rkyv`-archivable so that whole variants can be written to a
//! checkpoint and individual states can travel as partial results between
//! a non-final and a merging transform.

use arrow_schema::DataType;
use rkyv::{
    rancor::Error as RkyvError, util::AlignedVec, Archive, Deserialize as RkyvDeserialize,
    Serialize as RkyvSerialize,
};

use super::datum::Datum;
use super::{AggregateFunction, AggregationError};

/// A distinct value and its multiplicity, kept sorted for min/max.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct ValueCount {
    /// The value
    pub value: Datum,
    /// How many live rows carry it
    pub count: i64,
}

/// Accumulated state of one aggregate function for one group.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum AccumulatorState {
    /// `count(*)` / `count(col)`
    Count {
        /// Signed count to support retraction
        count: i64,
    },
    /// `sum` over an integer column
    SumInt64 {
        /// Running sum
        sum: i64,
        /// Non-null inputs contributing to the sum
        count: i64,
    },
    /// `sum` over a float column
    SumFloat64 {
        /// Running sum
        sum: f64,
        /// Non-null inputs contributing to the sum
        count: i64,
    },
    /// `avg` over a numeric column
    Avg {
        /// Running sum
        sum: f64,
        /// Non-null inputs contributing to the sum
        count: i64,
    },
    /// `min`
    Min {
        /// Live values in ascending order
        values: Vec<ValueCount>,
        /// Whether every distinct value is tracked (needed for retraction)
        retractable: bool,
    },
    /// `max`
    Max {
        /// Live values in ascending order
        values: Vec<ValueCount>,
        /// Whether every distinct value is tracked (needed for retraction)
        retractable: bool,
    },
    /// `last_value`
    LastValue {
        /// Most recently inserted non-null value
        value: Option<Datum>,
    },
}

impl AccumulatorState {
    /// Creates an empty accumulator for `function` over `input_type`.
    ///
    /// `retractable` only affects `min`/`max`, which otherwise keep just
    /// the current extreme.
    #[must_use]
    pub fn new(function: AggregateFunction, input_type: &DataType, retractable: bool) -> Self {
        match function {
            AggregateFunction::Count => Self::Count { count: 0 },
            AggregateFunction::Sum => {
                if matches!(input_type, DataType::Float64) {
                    Self::SumFloat64 { sum: 0.0, count: 0 }
                } else {
                    Self::SumInt64 { sum: 0, count: 0 }
                }
            }
            AggregateFunction::Avg => Self::Avg { sum: 0.0, count: 0 },
            AggregateFunction::Min => Self::Min {
                values: Vec::new(),
                retractable,
            },
            AggregateFunction::Max => Self::Max {
                values: Vec::new(),
                retractable,
            },
            AggregateFunction::LastValue => Self::LastValue { value: None },
        }
    }

    /// The aggregate function this state belongs to.
    #[must_use]
    pub fn function(&self) -> AggregateFunction {
        match self {
            Self::Count { .. } => AggregateFunction::Count,
            Self::SumInt64 { .. } | Self::SumFloat64 { .. } => AggregateFunction::Sum,
            Self::Avg { .. } => AggregateFunction::Avg,
            Self::Min { .. } => AggregateFunction::Min,
            Self::Max { .. } => AggregateFunction::Max,
            Self::LastValue { .. } => AggregateFunction::LastValue,
        }
    }

    /// Applies `value` with the given weight (positive inserts, negative
    /// retracts). NULL inputs are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::RetractionUnsupported`] for a negative
    /// weight on `last_value`, and [`AggregationError::AccumulatorTypeMismatch`]
    /// when the value type does not fit the state.
    pub fn update(&mut self, value: &Datum, weight: i64) -> Result<(), AggregationError> {
        if value.is_null() || weight == 0 {
            return Ok(());
        }
        let function = self.function();
        let mismatch = || AggregationError::AccumulatorTypeMismatch {
            function,
            value: value.to_string(),
        };
        match self {
            Self::Count { count } => *count += weight,
            Self::SumInt64 { sum, count } => {
                let Datum::Int64(v) = value else {
                    return Err(mismatch());
                };
                *sum = sum.wrapping_add(v.wrapping_mul(weight));
                *count += weight;
            }
            Self::SumFloat64 { sum, count } | Self::Avg { sum, count } => {
                let Some(v) = value.as_f64() else {
                    return Err(mismatch());
                };
                #[allow(clippy::cast_precision_loss)]
                {
                    *sum += v * weight as f64;
                }
                *count += weight;
            }
            Self::Min {
                values,
                retractable,
            } => apply_extreme(values, value, weight, *retractable, false),
            Self::Max {
                values,
                retractable,
            } => apply_extreme(values, value, weight, *retractable, true),
            Self::LastValue { value: last } => {
                if weight < 0 {
                    return Err(AggregationError::RetractionUnsupported(
                        AggregateFunction::LastValue,
                    ));
                }
                *last = Some(value.clone());
            }
        }
        Ok(())
    }

    /// Merges another state of the same function into this one.
    ///
    /// For `last_value` the other state is considered more recent.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::AccumulatorMismatch`] if the states belong
    /// to different functions or input types.
    pub fn merge(&mut self, other: &Self) -> Result<(), AggregationError> {
        match (self, other) {
            (Self::Count { count }, Self::Count { count: other }) => *count += other,
            (
                Self::SumInt64 { sum, count },
                Self::SumInt64 {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum = sum.wrapping_add(*other_sum);
                *count += other_count;
            }
            (
                Self::SumFloat64 { sum, count },
                Self::SumFloat64 {
                    sum: other_sum,
                    count: other_count,
                },
            )
            | (
                Self::Avg { sum, count },
                Self::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (
                Self::Min {
                    values,
                    retractable,
                },
                Self::Min { values: other, .. },
            ) => {
                for entry in other {
                    apply_extreme(values, &entry.value, entry.count, *retractable, false);
                }
            }
            (
                Self::Max {
                    values,
                    retractable,
                },
                Self::Max { values: other, .. },
            ) => {
                for entry in other {
                    apply_extreme(values, &entry.value, entry.count, *retractable, true);
                }
            }
            (Self::LastValue { value }, Self::LastValue { value: other }) => {
                if other.is_some() {
                    value.clone_from(other);
                }
            }
            (this, other) => {
                return Err(AggregationError::AccumulatorMismatch {
                    expected: this.function(),
                    found: other.function(),
                })
            }
        }
        Ok(())
    }

    /// Finalized value of the aggregate. Empty inputs yield NULL, except
    /// `count` which yields zero.
    #[must_use]
    pub fn result(&self) -> Datum {
        match self {
            Self::Count { count } => Datum::Int64(*count),
            Self::SumInt64 { sum, count } => {
                if *count > 0 {
                    Datum::Int64(*sum)
                } else {
                    Datum::Null
                }
            }
            Self::SumFloat64 { sum, count } => {
                if *count > 0 {
                    Datum::Float64(*sum)
                } else {
                    Datum::Null
                }
            }
            Self::Avg { sum, count } => {
                if *count > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    Datum::Float64(*sum / *count as f64)
                } else {
                    Datum::Null
                }
            }
            Self::Min { values, .. } => values
                .first()
                .map_or(Datum::Null, |entry| entry.value.clone()),
            Self::Max { values, .. } => values
                .last()
                .map_or(Datum::Null, |entry| entry.value.clone()),
            Self::LastValue { value } => value.clone().unwrap_or(Datum::Null),
        }
    }

    /// Serializes the state for transport as a partial aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::PartialState`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AggregationError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| AggregationError::PartialState(e.to_string()))
    }

    /// Deserializes a state produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::PartialState`] if the bytes are not a
    /// valid archived state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregationError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::access::<rkyv::Archived<Self>, RkyvError>(&aligned)
            .map_err(|e| AggregationError::PartialState(e.to_string()))?;
        rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| AggregationError::PartialState(e.to_string()))
    }
}

/// Adds `weight` occurrences of `value` to a sorted multiset.
///
/// Without retraction only the extreme is kept, so the set never grows
/// beyond one entry.
fn apply_extreme(
    values: &mut Vec<ValueCount>,
    value: &Datum,
    weight: i64,
    retractable: bool,
    keep_max: bool,
) {
    match values.binary_search_by(|entry| entry.value.total_cmp(value)) {
        Ok(pos) => {
            values[pos].count += weight;
            if values[pos].count <= 0 {
                values.remove(pos);
            }
        }
        Err(pos) => {
            if weight <= 0 {
                return;
            }
            values.insert(
                pos,
                ValueCount {
                    value: value.clone(),
                    count: weight,
                },
            );
        }
    }
    if !retractable && values.len() > 1 {
        if keep_max {
            values.drain(..values.len() - 1);
        } else {
            values.truncate(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Datum {
        Datum::Int64(v)
    }

    #[test]
    fn test_count_with_retraction() {
        let mut acc = AccumulatorState::new(AggregateFunction::Count, &DataType::Int64, true);
        acc.update(&int(1), 1).unwrap();
        acc.update(&int(1), 1).unwrap();
        acc.update(&int(1), -1).unwrap();
        assert_eq!(acc.result(), int(1));
    }

    #[test]
    fn test_count_ignores_nulls() {
        let mut acc = AccumulatorState::new(AggregateFunction::Count, &DataType::Int64, false);
        acc.update(&Datum::Null, 1).unwrap();
        assert_eq!(acc.result(), int(0));
    }

    #[test]
    fn test_sum_int_and_empty_is_null() {
        let mut acc = AccumulatorState::new(AggregateFunction::Sum, &DataType::Int64, false);
        assert_eq!(acc.result(), Datum::Null);
        acc.update(&int(5), 1).unwrap();
        acc.update(&int(7), 1).unwrap();
        assert_eq!(acc.result(), int(12));
        acc.update(&int(5), -1).unwrap();
        acc.update(&int(7), -1).unwrap();
        assert_eq!(acc.result(), Datum::Null);
    }

    #[test]
    fn test_sum_float() {
        let mut acc = AccumulatorState::new(AggregateFunction::Sum, &DataType::Float64, false);
        acc.update(&Datum::Float64(1.5), 1).unwrap();
        acc.update(&Datum::Float64(2.0), 1).unwrap();
        assert_eq!(acc.result(), Datum::Float64(3.5));
    }

    #[test]
    fn test_sum_rejects_wrong_type() {
        let mut acc = AccumulatorState::new(AggregateFunction::Sum, &DataType::Int64, false);
        let err = acc.update(&Datum::Utf8("x".into()), 1).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::AccumulatorTypeMismatch { .. }
        ));
    }

    #[test]
    fn test_avg() {
        let mut acc = AccumulatorState::new(AggregateFunction::Avg, &DataType::Int64, true);
        acc.update(&int(2), 1).unwrap();
        acc.update(&int(4), 1).unwrap();
        assert_eq!(acc.result(), Datum::Float64(3.0));
        acc.update(&int(4), -1).unwrap();
        assert_eq!(acc.result(), Datum::Float64(2.0));
    }

    #[test]
    fn test_min_max_retraction() {
        let mut min = AccumulatorState::new(AggregateFunction::Min, &DataType::Int64, true);
        let mut max = AccumulatorState::new(AggregateFunction::Max, &DataType::Int64, true);
        for v in [5, 1, 9] {
            min.update(&int(v), 1).unwrap();
            max.update(&int(v), 1).unwrap();
        }
        assert_eq!(min.result(), int(1));
        assert_eq!(max.result(), int(9));

        min.update(&int(1), -1).unwrap();
        max.update(&int(9), -1).unwrap();
        assert_eq!(min.result(), int(5));
        assert_eq!(max.result(), int(5));
    }

    #[test]
    fn test_min_without_retraction_keeps_one_value() {
        let mut min = AccumulatorState::new(AggregateFunction::Min, &DataType::Int64, false);
        for v in [5, 3, 8, 4] {
            min.update(&int(v), 1).unwrap();
        }
        assert_eq!(min.result(), int(3));
        let AccumulatorState::Min { values, .. } = &min else {
            panic!("expected min state");
        };
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_max_without_retraction_keeps_one_value() {
        let mut max = AccumulatorState::new(AggregateFunction::Max, &DataType::Utf8, false);
        for v in ["b", "c", "a"] {
            max.update(&Datum::Utf8(v.into()), 1).unwrap();
        }
        assert_eq!(max.result(), Datum::Utf8("c".into()));
    }

    #[test]
    fn test_last_value_rejects_retraction() {
        let mut acc = AccumulatorState::new(AggregateFunction::LastValue, &DataType::Int64, false);
        acc.update(&int(5), 1).unwrap();
        acc.update(&int(9), 1).unwrap();
        assert_eq!(acc.result(), int(9));
        assert!(matches!(
            acc.update(&int(9), -1),
            Err(AggregationError::RetractionUnsupported(_))
        ));
    }

    #[test]
    fn test_merge() {
        let mut a = AccumulatorState::new(AggregateFunction::Sum, &DataType::Int64, false);
        let mut b = a.clone();
        a.update(&int(3), 1).unwrap();
        b.update(&int(4), 1).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.result(), int(7));

        let mut max = AccumulatorState::new(AggregateFunction::Max, &DataType::Int64, false);
        let mut other = max.clone();
        max.update(&int(3), 1).unwrap();
        other.update(&int(11), 1).unwrap();
        max.merge(&other).unwrap();
        assert_eq!(max.result(), int(11));
    }

    #[test]
    fn test_merge_mismatch() {
        let mut a = AccumulatorState::new(AggregateFunction::Count, &DataType::Int64, false);
        let b = AccumulatorState::new(AggregateFunction::Avg, &DataType::Int64, false);
        assert!(matches!(
            a.merge(&b),
            Err(AggregationError::AccumulatorMismatch { .. })
        ));
    }

    #[test]
    fn test_partial_state_bytes() {
        let mut acc = AccumulatorState::new(AggregateFunction::Avg, &DataType::Float64, false);
        acc.update(&Datum::Float64(1.0), 1).unwrap();
        acc.update(&Datum::Float64(3.0), 1).unwrap();
        let bytes = acc.to_bytes().unwrap();
        let restored = AccumulatorState::from_bytes(&bytes).unwrap();
        assert_eq!(restored, acc);
        assert_eq!(restored.result(), Datum::Float64(2.0));
    }

    #[test]
    fn test_partial_state_garbage() {
        assert!(AccumulatorState::from_bytes(&[1, 2, 3]).is_err());
    }
}
