//! # Substreams
//!
//! An aggregating transform keeps independent state per input partition,
//! called a substream. [`SubstreamContext`] is that state: the group table,
//! row counters, the finalized-watermark bookmark, the result version
//! counter and an optional auxiliary field.
//!
//! A context is owned by exactly one transform and only reached through
//! `&mut`, so accumulation and finalization never overlap.

pub mod field;

use std::fmt;

use crate::aggregate::{AggregatedDataVariants, AggregationError};
use crate::time::Watermark;

pub use field::{FieldCodec, FieldKind, FieldValue, RetractState, SubstreamField};

/// Identity of a substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubstreamId(u64);

impl SubstreamId {
    /// The single substream used by un-partitioned (global) input.
    pub const GLOBAL: Self = Self(0);

    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Derives an id from a partition key.
    #[must_use]
    pub fn from_partition_key(key: &[u8]) -> Self {
        Self(fxhash::hash64(key))
    }

    /// The raw id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-substream aggregation state.
#[derive(Debug)]
pub struct SubstreamContext {
    id: SubstreamId,
    /// Group table of this substream
    pub variants: AggregatedDataVariants,
    rows_since_finalize: u64,
    total_rows: u64,
    finalized_watermark: Watermark,
    emitted_version: i64,
    field: Option<SubstreamField>,
}

impl SubstreamContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(id: SubstreamId) -> Self {
        Self {
            id,
            variants: AggregatedDataVariants::new(),
            rows_since_finalize: 0,
            total_rows: 0,
            finalized_watermark: Watermark::MIN,
            emitted_version: 0,
            field: None,
        }
    }

    /// This context's substream id.
    #[must_use]
    pub fn id(&self) -> SubstreamId {
        self.id
    }

    /// Whether rows were accumulated since the last finalize.
    #[must_use]
    pub fn has_new_data(&self) -> bool {
        self.rows_since_finalize > 0
    }

    /// Rows accumulated since the last finalize.
    #[must_use]
    pub fn rows_since_finalize(&self) -> u64 {
        self.rows_since_finalize
    }

    /// Rows accumulated over the context's lifetime.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Records `rows` accumulated rows.
    pub fn add_row_count(&mut self, rows: u64) {
        self.rows_since_finalize += rows;
        self.total_rows += rows;
    }

    /// Clears the since-finalize counter.
    pub fn reset_row_counts(&mut self) {
        self.rows_since_finalize = 0;
    }

    /// Watermark of the last finalize.
    #[must_use]
    pub fn finalized_watermark(&self) -> Watermark {
        self.finalized_watermark
    }

    /// Moves the finalized watermark forward. Older watermarks are ignored.
    pub fn advance_finalized_watermark(&mut self, watermark: Watermark) {
        self.finalized_watermark = self.finalized_watermark.max(watermark);
    }

    /// Last emitted result version (0 before the first).
    #[must_use]
    pub fn emitted_version(&self) -> i64 {
        self.emitted_version
    }

    /// Allocates the next result version.
    pub fn next_version(&mut self) -> i64 {
        self.emitted_version += 1;
        self.emitted_version
    }

    /// Whether an auxiliary field is installed.
    #[must_use]
    pub fn has_field(&self) -> bool {
        self.field.is_some()
    }

    /// Installs the auxiliary field.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::PreconditionViolated`] if a field is
    /// already installed.
    pub fn set_field(&mut self, field: SubstreamField) -> Result<(), AggregationError> {
        if let Some(existing) = &self.field {
            return Err(AggregationError::PreconditionViolated(format!(
                "substream {} already has field {}",
                self.id,
                existing.kind()
            )));
        }
        self.field = Some(field);
        Ok(())
    }

    /// Borrows the auxiliary field as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::FieldNotSet`] or
    /// [`AggregationError::FieldTypeMismatch`].
    pub fn field<T: FieldValue>(&self) -> Result<&T, AggregationError> {
        let field = self.field.as_ref().ok_or(AggregationError::FieldNotSet)?;
        T::from_field(field).ok_or(AggregationError::FieldTypeMismatch {
            expected: T::KIND,
            found: field.kind(),
        })
    }

    /// Mutably borrows the auxiliary field as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::FieldNotSet`] or
    /// [`AggregationError::FieldTypeMismatch`].
    pub fn field_mut<T: FieldValue>(&mut self) -> Result<&mut T, AggregationError> {
        let field = self.field.as_mut().ok_or(AggregationError::FieldNotSet)?;
        let found = field.kind();
        T::from_field_mut(field).ok_or(AggregationError::FieldTypeMismatch {
            expected: T::KIND,
            found,
        })
    }

    pub(crate) fn raw_field(&self) -> Option<&SubstreamField> {
        self.field.as_ref()
    }

    pub(crate) fn raw_field_mut(&mut self) -> Option<&mut SubstreamField> {
        self.field.as_mut()
    }

    pub(crate) fn restore_bookkeeping(
        &mut self,
        finalized_watermark: Watermark,
        emitted_version: i64,
        total_rows: u64,
    ) {
        self.finalized_watermark = finalized_watermark;
        self.emitted_version = emitted_version;
        self.total_rows = total_rows;
        self.rows_since_finalize = 0;
    }
}
