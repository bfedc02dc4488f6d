//! Periodic checkpointing of an aggregating transform into a store.

use std::time::{Duration, Instant};

use streamagg_core::checkpoint::CheckpointStore;
use streamagg_core::transform::{AggregatingTransformWithSubstream, SubstreamAggregation};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Minimum time between periodic checkpoints
    pub interval: Duration,
    /// Delete stored records of substreams the transform no longer holds
    pub prune_removed: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            prune_removed: true,
        }
    }
}

impl CheckpointConfig {
    /// Sets the checkpoint interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enables or disables pruning of removed substreams.
    #[must_use]
    pub fn with_prune_removed(mut self, prune: bool) -> Self {
        self.prune_removed = prune;
        self
    }
}

/// Snapshots a transform into a [`CheckpointStore`] and restores it.
///
/// Checkpointing borrows the transform immutably, so it never overlaps
/// with accumulation or finalization on the same transform.
#[derive(Debug)]
pub struct CheckpointCoordinator<St> {
    store: St,
    config: CheckpointConfig,
    last_checkpoint: Option<Instant>,
    checkpoints_taken: u64,
}

impl<St: CheckpointStore> CheckpointCoordinator<St> {
    /// Creates a coordinator writing into `store`.
    pub fn new(store: St, config: CheckpointConfig) -> Self {
        Self {
            store,
            config,
            last_checkpoint: None,
            checkpoints_taken: 0,
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &St {
        &self.store
    }

    /// Returns the checkpoint interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Number of checkpoints completed by this coordinator.
    #[must_use]
    pub fn checkpoints_taken(&self) -> u64 {
        self.checkpoints_taken
    }

    /// Returns true if a periodic checkpoint is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_checkpoint
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.interval)
    }

    /// Checkpoints `transform` if the interval has elapsed.
    ///
    /// Returns `true` if a checkpoint was taken.
    ///
    /// # Errors
    ///
    /// See [`checkpoint`](Self::checkpoint).
    pub fn maybe_checkpoint<S: SubstreamAggregation>(
        &mut self,
        transform: &AggregatingTransformWithSubstream<S>,
    ) -> streamagg_core::Result<bool> {
        if !self.is_due(Instant::now()) {
            return Ok(false);
        }
        self.checkpoint(transform)?;
        Ok(true)
    }

    /// Writes every substream of `transform` to the store.
    ///
    /// With pruning enabled, records of substreams the transform no longer
    /// holds are deleted afterwards. Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns [`streamagg_core::Error`] if encoding or storing fails. The
    /// checkpoint does not count as taken in that case.
    pub fn checkpoint<S: SubstreamAggregation>(
        &mut self,
        transform: &AggregatingTransformWithSubstream<S>,
    ) -> streamagg_core::Result<usize> {
        let start = Instant::now();
        let written = transform.checkpoint_to(&self.store)?;

        let mut pruned = 0usize;
        if self.config.prune_removed {
            for id in self.store.list()? {
                if transform.substream(id).is_none() && self.store.remove(id)? {
                    pruned += 1;
                }
            }
        }

        self.last_checkpoint = Some(Instant::now());
        self.checkpoints_taken += 1;

        tracing::info!(
            transform = transform.name(),
            checkpoint = self.checkpoints_taken,
            substreams = written,
            pruned,
            elapsed_ms = start.elapsed().as_millis(),
            "Checkpoint complete"
        );
        Ok(written)
    }

    /// Restores `transform` from the store. Returns the number of
    /// substreams restored.
    ///
    /// # Errors
    ///
    /// Returns [`streamagg_core::Error`] if the store cannot be read or a
    /// record cannot be decoded; the transform is left untouched then.
    pub fn recover<S: SubstreamAggregation>(
        &self,
        transform: &mut AggregatingTransformWithSubstream<S>,
    ) -> streamagg_core::Result<usize> {
        transform.recover_from(&self.store)
    }
}
