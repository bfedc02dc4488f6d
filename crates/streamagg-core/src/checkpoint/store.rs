//! Checkpoint persistence via the [`CheckpointStore`] trait.
//!
//! The store keeps the latest record per substream. An in-memory
//! implementation lives here; the storage crate provides a filesystem one.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{CheckpointVersion, SubstreamCheckpoint};
use crate::substream::SubstreamId;

/// Errors from checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointStoreError {
    /// I/O error during checkpoint persistence.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record failed validation.
    #[error("checkpoint for substream {substream} is corrupted: {reason}")]
    Corrupted {
        /// Affected substream
        substream: SubstreamId,
        /// What failed
        reason: String,
    },

    /// A write would replace a record with an older format version.
    #[error("substream {substream} already stored at {stored}, refusing {attempted}")]
    VersionRegression {
        /// Affected substream
        substream: SubstreamId,
        /// Version currently stored
        stored: CheckpointVersion,
        /// Version of the rejected write
        attempted: CheckpointVersion,
    },
}

/// Trait for checkpoint persistence backends.
///
/// Implementations must make `put` atomic: a concurrent or subsequent `get`
/// observes either the previous record or the new one, never a mix.
pub trait CheckpointStore: Send + Sync {
    /// Stores the record for `substream`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError::VersionRegression`] if a record with a
    /// newer version is already stored, or an I/O error.
    fn put(
        &self,
        substream: SubstreamId,
        version: CheckpointVersion,
        data: &[u8],
    ) -> Result<(), CheckpointStoreError>;

    /// Loads the record for `substream`.
    ///
    /// Returns `Ok(None)` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError`] on I/O failure or corruption.
    fn get(
        &self,
        substream: SubstreamId,
    ) -> Result<Option<(CheckpointVersion, Vec<u8>)>, CheckpointStoreError>;

    /// Lists stored substreams in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError`] on I/O failure.
    fn list(&self) -> Result<Vec<SubstreamId>, CheckpointStoreError>;

    /// Removes the record for `substream`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError`] on I/O failure.
    fn remove(&self, substream: SubstreamId) -> Result<bool, CheckpointStoreError>;

    /// Stores a full record.
    ///
    /// # Errors
    ///
    /// See [`put`](Self::put).
    fn put_record(&self, record: &SubstreamCheckpoint) -> Result<(), CheckpointStoreError> {
        self.put(record.substream_id, record.version, &record.data)
    }

    /// Loads every stored record in substream order.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    fn load_all(&self) -> Result<Vec<SubstreamCheckpoint>, CheckpointStoreError> {
        let mut records = Vec::new();
        for substream_id in self.list()? {
            if let Some((version, data)) = self.get(substream_id)? {
                records.push(SubstreamCheckpoint {
                    substream_id,
                    version,
                    data,
                });
            }
        }
        Ok(records)
    }
}

/// Volatile store, mainly for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<BTreeMap<SubstreamId, (CheckpointVersion, Vec<u8>)>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn put(
        &self,
        substream: SubstreamId,
        version: CheckpointVersion,
        data: &[u8],
    ) -> Result<(), CheckpointStoreError> {
        let mut records = self.records.write();
        if let Some((stored, _)) = records.get(&substream) {
            if *stored > version {
                return Err(CheckpointStoreError::VersionRegression {
                    substream,
                    stored: *stored,
                    attempted: version,
                });
            }
        }
        records.insert(substream, (version, data.to_vec()));
        Ok(())
    }

    fn get(
        &self,
        substream: SubstreamId,
    ) -> Result<Option<(CheckpointVersion, Vec<u8>)>, CheckpointStoreError> {
        Ok(self.records.read().get(&substream).cloned())
    }

    fn list(&self) -> Result<Vec<SubstreamId>, CheckpointStoreError> {
        Ok(self.records.read().keys().copied().collect())
    }

    fn remove(&self, substream: SubstreamId) -> Result<bool, CheckpointStoreError> {
        Ok(self.records.write().remove(&substream).is_some())
    }
}
