//! Aggregated data variants: the per-substream group table.

use fxhash::FxHashMap;
use rkyv::{
    rancor::Error as RkyvError, util::AlignedVec, Archive, Deserialize as RkyvDeserialize,
    Serialize as RkyvSerialize,
};

use super::accumulator::AccumulatorState;
use super::datum::{Datum, GroupKey};
use super::AggregationError;

/// State of one group.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct GroupState {
    /// One accumulator per aggregate, in declaration order
    pub accumulators: Vec<AccumulatorState>,
    /// Net number of live rows (inserts minus retractions)
    pub row_count: i64,
    /// Whether the group changed since the last finalization
    pub updated: bool,
    /// Results as last emitted, staged before the first change after a
    /// finalization so a retract row can be produced
    pub retract: Option<Vec<Datum>>,
}

impl GroupState {
    /// Creates a fresh group with the given accumulators.
    #[must_use]
    pub fn new(accumulators: Vec<AccumulatorState>) -> Self {
        Self {
            accumulators,
            row_count: 0,
            updated: false,
            retract: None,
        }
    }

    /// Current finalized results of every accumulator.
    #[must_use]
    pub fn results(&self) -> Vec<Datum> {
        self.accumulators
            .iter()
            .map(AccumulatorState::result)
            .collect()
    }

    /// Snapshots the currently emitted results before the first change of
    /// this finalization interval.
    ///
    /// A group that was never emitted (no live rows) has nothing to retract.
    pub fn stage_retract(&mut self) {
        if !self.updated && self.row_count > 0 && self.retract.is_none() {
            self.retract = Some(self.results());
        }
    }

    /// Takes the staged retract results, if any.
    pub fn take_retract(&mut self) -> Option<Vec<Datum>> {
        self.retract.take()
    }

    /// Clears the change flag after the group was emitted.
    pub fn clear_update(&mut self) {
        self.updated = false;
        self.retract = None;
    }
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
struct GroupEntry {
    key: GroupKey,
    state: GroupState,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
struct VariantsSnapshot {
    groups: Vec<GroupEntry>,
    no_more_keys: bool,
}

/// Hash table from group key to [`GroupState`].
///
/// Global aggregation uses a single group under the empty key.
#[derive(Debug, Clone, Default)]
pub struct AggregatedDataVariants {
    groups: FxHashMap<GroupKey, GroupState>,
    no_more_keys: bool,
    /// Rows folded into groups since the last `take_folded_rows`; not persisted
    folded_rows: u64,
}

impl AggregatedDataVariants {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if there are no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether new groups are refused after reaching the group limit.
    #[must_use]
    pub fn no_more_keys(&self) -> bool {
        self.no_more_keys
    }

    pub(crate) fn set_no_more_keys(&mut self) {
        self.no_more_keys = true;
    }

    pub(crate) fn add_folded_rows(&mut self, rows: u64) {
        self.folded_rows += rows;
    }

    /// Returns the number of rows folded into groups since the previous
    /// call and resets the counter.
    ///
    /// Rows that were dropped (zero weight, retractions of unknown groups,
    /// new keys after overflow) are not counted. The count survives a fold
    /// that failed part-way.
    pub fn take_folded_rows(&mut self) -> u64 {
        std::mem::take(&mut self.folded_rows)
    }

    /// Looks up a group.
    #[must_use]
    pub fn group(&self, key: &GroupKey) -> Option<&GroupState> {
        self.groups.get(key)
    }

    pub(crate) fn groups_mut(&mut self) -> &mut FxHashMap<GroupKey, GroupState> {
        &mut self.groups
    }

    /// All groups in ascending key order.
    #[must_use]
    pub fn sorted_entries(&self) -> Vec<(&GroupKey, &GroupState)> {
        let mut entries: Vec<_> = self.groups.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// All groups in ascending key order, mutably.
    pub fn sorted_entries_mut(&mut self) -> Vec<(&GroupKey, &mut GroupState)> {
        let mut entries: Vec<_> = self.groups.iter_mut().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Drops groups whose net row count is no longer positive.
    ///
    /// Returns the number of groups removed.
    pub fn remove_dead_groups(&mut self) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, state| state.row_count > 0);
        before - self.groups.len()
    }

    /// Serializes the table. Groups are written in key order so equal
    /// tables produce equal bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::PartialState`] if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>, AggregationError> {
        let groups = self
            .sorted_entries()
            .into_iter()
            .map(|(key, state)| GroupEntry {
                key: key.clone(),
                state: state.clone(),
            })
            .collect();
        let snapshot = VariantsSnapshot {
            groups,
            no_more_keys: self.no_more_keys,
        };
        rkyv::to_bytes::<RkyvError>(&snapshot)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| AggregationError::PartialState(e.to_string()))
    }

    /// Rebuilds a table from [`serialize`](Self::serialize) output.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::PartialState`] if the bytes are invalid.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, AggregationError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::access::<rkyv::Archived<VariantsSnapshot>, RkyvError>(&aligned)
            .map_err(|e| AggregationError::PartialState(e.to_string()))?;
        let snapshot = rkyv::deserialize::<VariantsSnapshot, RkyvError>(archived)
            .map_err(|e| AggregationError::PartialState(e.to_string()))?;

        let mut groups =
            FxHashMap::with_capacity_and_hasher(snapshot.groups.len(), Default::default());
        for entry in snapshot.groups {
            groups.insert(entry.key, entry.state);
        }
        Ok(Self {
            groups,
            no_more_keys: snapshot.no_more_keys,
            folded_rows: 0,
        })
    }
}
