//! Finalization metrics.

use std::time::Duration;

/// Counters describing the finalize path of one transform.
#[derive(Debug, Clone, Default)]
pub struct AggregationMetrics {
    /// Finalize calls that produced output
    finalize_total: u64,
    /// Finalize calls with nothing to emit
    finalize_skipped: u64,
    /// Chunks pushed to the sink
    chunks_emitted: u64,
    /// Rows pushed to the sink
    rows_emitted: u64,
    /// Sum of conversion durations
    finalize_duration_total: Duration,
    /// Longest conversion observed
    finalize_duration_max: Duration,
    /// Finalize calls whose output failed to convert or push
    emit_failures: u64,
}

impl AggregationMetrics {
    /// Creates a new metrics tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of finalize calls that produced output.
    #[must_use]
    pub fn finalize_total(&self) -> u64 {
        self.finalize_total
    }

    /// Returns the number of finalize calls with nothing to emit.
    #[must_use]
    pub fn finalize_skipped(&self) -> u64 {
        self.finalize_skipped
    }

    /// Returns the number of chunks pushed downstream.
    #[must_use]
    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted
    }

    /// Returns the number of rows pushed downstream.
    #[must_use]
    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    /// Returns the number of failed emissions.
    #[must_use]
    pub fn emit_failures(&self) -> u64 {
        self.emit_failures
    }

    /// Returns the longest finalize duration observed.
    #[must_use]
    pub fn max_finalize_duration(&self) -> Duration {
        self.finalize_duration_max
    }

    /// Returns the average finalize duration.
    ///
    /// Returns zero if nothing was finalized.
    #[must_use]
    pub fn avg_finalize_duration(&self) -> Duration {
        if self.finalize_total == 0 {
            Duration::ZERO
        } else {
            self.finalize_duration_total / u32::try_from(self.finalize_total).unwrap_or(u32::MAX)
        }
    }

    pub(crate) fn record_finalize(&mut self, elapsed: Duration, chunks: usize, rows: usize) {
        self.finalize_total += 1;
        self.chunks_emitted += chunks as u64;
        self.rows_emitted += rows as u64;
        self.finalize_duration_total += elapsed;
        self.finalize_duration_max = self.finalize_duration_max.max(elapsed);
    }

    pub(crate) fn record_skip(&mut self) {
        self.finalize_skipped += 1;
    }

    pub(crate) fn record_failure(&mut self) {
        self.emit_failures += 1;
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
