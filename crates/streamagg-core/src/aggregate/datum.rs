//! Scalar values flowing between Arrow columns and accumulators.

use std::cmp::Ordering;
use std::fmt;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, Int8Type};
use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, Int8Array, StringArray,
};
use arrow_schema::DataType;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// A single aggregate input or result value.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum Datum {
    /// SQL NULL
    Null,
    /// Boolean value
    Boolean(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
    /// UTF-8 string
    Utf8(String),
}

impl Datum {
    /// Returns true if this is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value, if it has one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order over datums: NULL first, then by variant, then by value.
    ///
    /// Floats use IEEE total ordering so NaN has a stable position.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Float64(a), Self::Float64(b)) => a.total_cmp(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Int64(_) => 2,
            Self::Float64(_) => 3,
            Self::Utf8(_) => 4,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
        }
    }
}

/// One component of a group key.
///
/// Floats are deliberately excluded: group keys must hash and compare
/// exactly.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub enum KeyValue {
    /// SQL NULL (all NULLs group together)
    Null,
    /// Boolean key
    Boolean(bool),
    /// Integer key
    Int64(i64),
    /// String key
    Utf8(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
        }
    }
}

/// Group key tuple. Empty for global aggregation.
pub type GroupKey = Vec<KeyValue>;

/// Returns true if `data_type` may be used as a group key column.
#[must_use]
pub fn is_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean | DataType::Int64 | DataType::Utf8
    )
}

/// Returns true if `data_type` may be used as an aggregate argument.
#[must_use]
pub fn is_value_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean | DataType::Int64 | DataType::Float64 | DataType::Utf8
    )
}

/// Typed, downcast-once view over an input column.
pub(crate) enum ColumnReader<'a> {
    Boolean(&'a BooleanArray),
    Int8(&'a Int8Array),
    Int64(&'a Int64Array),
    Float64(&'a Float64Array),
    Utf8(&'a StringArray),
    Binary(&'a BinaryArray),
}

impl<'a> ColumnReader<'a> {
    /// Downcasts `array`, returning `None` for unsupported types.
    pub(crate) fn try_new(array: &'a ArrayRef) -> Option<Self> {
        match array.data_type() {
            DataType::Boolean => array.as_boolean_opt().map(Self::Boolean),
            DataType::Int8 => array.as_primitive_opt::<Int8Type>().map(Self::Int8),
            DataType::Int64 => array.as_primitive_opt::<Int64Type>().map(Self::Int64),
            DataType::Float64 => array.as_primitive_opt::<Float64Type>().map(Self::Float64),
            DataType::Utf8 => array.as_string_opt::<i32>().map(Self::Utf8),
            DataType::Binary => array.as_binary_opt::<i32>().map(Self::Binary),
            _ => None,
        }
    }

    fn is_null(&self, row: usize) -> bool {
        match self {
            Self::Boolean(a) => a.is_null(row),
            Self::Int8(a) => a.is_null(row),
            Self::Int64(a) => a.is_null(row),
            Self::Float64(a) => a.is_null(row),
            Self::Utf8(a) => a.is_null(row),
            Self::Binary(a) => a.is_null(row),
        }
    }

    /// Reads row `row` as a [`Datum`].
    pub(crate) fn datum(&self, row: usize) -> Datum {
        if self.is_null(row) {
            return Datum::Null;
        }
        match self {
            Self::Boolean(a) => Datum::Boolean(a.value(row)),
            Self::Int8(a) => Datum::Int64(i64::from(a.value(row))),
            Self::Int64(a) => Datum::Int64(a.value(row)),
            Self::Float64(a) => Datum::Float64(a.value(row)),
            Self::Utf8(a) => Datum::Utf8(a.value(row).to_string()),
            Self::Binary(_) => Datum::Null,
        }
    }

    /// Reads row `row` as a group key component.
    ///
    /// Returns `None` for column types that cannot be keys.
    pub(crate) fn key(&self, row: usize) -> Option<KeyValue> {
        if self.is_null(row) {
            return Some(KeyValue::Null);
        }
        match self {
            Self::Boolean(a) => Some(KeyValue::Boolean(a.value(row))),
            Self::Int8(a) => Some(KeyValue::Int64(i64::from(a.value(row)))),
            Self::Int64(a) => Some(KeyValue::Int64(a.value(row))),
            Self::Utf8(a) => Some(KeyValue::Utf8(a.value(row).to_string())),
            Self::Float64(_) | Self::Binary(_) => None,
        }
    }

    /// Reads a change weight. NULL weights count as inserts.
    pub(crate) fn weight(&self, row: usize) -> i64 {
        if self.is_null(row) {
            return 1;
        }
        match self {
            Self::Int8(a) => i64::from(a.value(row)),
            Self::Int64(a) => a.value(row),
            _ => 1,
        }
    }

    /// Reads a binary cell, `None` when NULL or not a binary column.
    pub(crate) fn bytes(&self, row: usize) -> Option<&'a [u8]> {
        match self {
            Self::Binary(a) if !a.is_null(row) => Some(a.value(row)),
            _ => None,
        }
    }
}
