//! Keyed (group-by) aggregation.

use std::sync::Arc;

use super::{AggregatedResultSink, AggregatingTransformWithSubstream, SubstreamAggregation};
use crate::params::{AggregatingTransformParams, ConfigError, GroupByMode};

/// Keyed aggregation flavour: snapshot or updates emission with the base
/// behaviour.
#[derive(Debug)]
pub struct KeyedSubstreamAggregation {
    _private: (),
}

impl KeyedSubstreamAggregation {
    /// Validates that `params` describe a keyed aggregation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidGrouping`] for global parameters and
    /// [`ConfigError::Unsupported`] for changelog emission.
    pub fn try_new(params: &AggregatingTransformParams) -> Result<Self, ConfigError> {
        if params.group_by() != GroupByMode::Keyed {
            return Err(ConfigError::InvalidGrouping(
                "keyed aggregation requires at least one group-by key".to_string(),
            ));
        }
        if params.emit_changelog() {
            return Err(ConfigError::Unsupported(
                "changelog emission is only supported for global aggregation".to_string(),
            ));
        }
        Ok(Self { _private: () })
    }
}

impl SubstreamAggregation for KeyedSubstreamAggregation {
    fn name(&self) -> &'static str {
        "KeyedAggregatingTransformWithSubstream"
    }
}

/// Keyed aggregating transform.
pub type KeyedAggregatingTransformWithSubstream =
    AggregatingTransformWithSubstream<KeyedSubstreamAggregation>;

impl AggregatingTransformWithSubstream<KeyedSubstreamAggregation> {
    /// Creates a keyed aggregating transform.
    ///
    /// # Errors
    ///
    /// See [`KeyedSubstreamAggregation::try_new`].
    pub fn try_new(
        params: Arc<AggregatingTransformParams>,
        sink: Box<dyn AggregatedResultSink>,
    ) -> Result<Self, ConfigError> {
        let strategy = KeyedSubstreamAggregation::try_new(&params)?;
        Ok(Self::new(strategy, params, sink))
    }
}
