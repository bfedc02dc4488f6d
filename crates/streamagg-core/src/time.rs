//! # Time Module
//!
//! Watermarks drive finalization: when a substream observes a watermark
//! newer than the one it last finalized at, its accumulated state is
//! converted into output and emitted downstream.

use std::fmt;

/// A watermark indicating event time progress.
///
/// Watermarks are monotonically increasing timestamps that signal no events
/// with timestamps earlier than the watermark will arrive. The aggregation
/// operator uses them to:
///
/// - Trigger finalization of a substream's accumulated state
/// - Bookmark the last finalized point for checkpoint/recovery
///
/// # Example
///
/// ```rust
/// use streamagg_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// assert!(Watermark::MIN < watermark);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// The watermark before any progress has been observed.
    pub const MIN: Self = Self(i64::MIN);

    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if an event is late relative to this watermark.
    ///
    /// An event is considered late if its timestamp is strictly less than
    /// the watermark timestamp.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }

    /// Returns the maximum (later) of two watermarks.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::MIN
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MIN {
            f.write_str("-inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
