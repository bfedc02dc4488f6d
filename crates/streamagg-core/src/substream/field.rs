//! Auxiliary per-substream fields.
//!
//! A [`SubstreamContext`](super::SubstreamContext) may carry a single piece of
//! operator-specific state. Fields form a closed set ([`SubstreamField`]);
//! each knows how to write itself into a checkpoint and the minimum
//! checkpoint version able to carry it.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::checkpoint::{CheckpointError, CheckpointVersion};

/// Discriminant of a [`SubstreamField`], persisted in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldKind {
    /// [`RetractState`]
    RetractState = 1,
}

/// Minimum checkpoint version that can carry each field kind.
pub const FIELD_MIN_VERSIONS: &[(FieldKind, CheckpointVersion)] =
    &[(FieldKind::RetractState, CheckpointVersion::V2)];

impl FieldKind {
    /// Decodes a persisted discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RetractState),
            _ => None,
        }
    }

    /// Minimum checkpoint version able to carry this field.
    #[must_use]
    pub fn min_version(self) -> CheckpointVersion {
        FIELD_MIN_VERSIONS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or(CheckpointVersion::CURRENT, |(_, version)| *version)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetractState => f.write_str("retract_state"),
        }
    }
}

/// Checkpoint codec of a field value.
pub trait FieldCodec {
    /// The field's kind.
    fn kind(&self) -> FieldKind;

    /// Appends the encoded value to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::FieldRequiresVersion`] if `version` is too
    /// old to carry this field.
    fn serialize(&self, out: &mut Vec<u8>, version: CheckpointVersion)
        -> Result<(), CheckpointError>;

    /// Replaces this value with one decoded from `input`, advancing it.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::RecoverCheckpointFailed`] if `version` is
    /// too old to carry this field, or a decoding error.
    fn deserialize(
        &mut self,
        input: &mut &[u8],
        version: CheckpointVersion,
    ) -> Result<(), CheckpointError>;
}

/// Whether a changelog aggregation has started producing retractions.
///
/// Starts disabled; switches to enabled after the first non-empty changelog
/// emission and never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetractState {
    /// No output has been emitted yet
    #[default]
    RetractionDisabled,
    /// Prior results must be retracted before new ones are emitted
    RetractionEnabled,
}

impl RetractState {
    /// Returns true once retraction is enabled.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        self == Self::RetractionEnabled
    }

    /// Enables retraction. Idempotent.
    pub fn enable(&mut self) {
        *self = Self::RetractionEnabled;
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::RetractionDisabled => 0,
            Self::RetractionEnabled => 1,
        }
    }
}

/// The auxiliary field of a substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstreamField {
    /// Retract state of a global changelog aggregation
    Retract(RetractState),
}

impl FieldCodec for SubstreamField {
    fn kind(&self) -> FieldKind {
        match self {
            Self::Retract(_) => FieldKind::RetractState,
        }
    }

    fn serialize(
        &self,
        out: &mut Vec<u8>,
        version: CheckpointVersion,
    ) -> Result<(), CheckpointError> {
        let required = self.kind().min_version();
        if version < required {
            return Err(CheckpointError::FieldRequiresVersion {
                field: self.kind(),
                version,
                required,
            });
        }
        match self {
            Self::Retract(state) => out.put_u8(state.as_u8()),
        }
        Ok(())
    }

    fn deserialize(
        &mut self,
        input: &mut &[u8],
        version: CheckpointVersion,
    ) -> Result<(), CheckpointError> {
        let required = self.kind().min_version();
        if version < required {
            return Err(CheckpointError::RecoverCheckpointFailed {
                field: self.kind(),
                version,
                required,
            });
        }
        match self {
            Self::Retract(state) => {
                if !input.has_remaining() {
                    return Err(CheckpointError::Truncated);
                }
                *state = match input.get_u8() {
                    0 => RetractState::RetractionDisabled,
                    1 => RetractState::RetractionEnabled,
                    other => {
                        return Err(CheckpointError::Corrupted(format!(
                            "invalid retract state {other}"
                        )))
                    }
                };
            }
        }
        Ok(())
    }
}

/// Typed access to a [`SubstreamField`] variant.
pub trait FieldValue: Sized {
    /// Kind of the variant holding this value.
    const KIND: FieldKind;

    /// Borrows the value if `field` holds it.
    fn from_field(field: &SubstreamField) -> Option<&Self>;

    /// Mutably borrows the value if `field` holds it.
    fn from_field_mut(field: &mut SubstreamField) -> Option<&mut Self>;
}

impl FieldValue for RetractState {
    const KIND: FieldKind = FieldKind::RetractState;

    fn from_field(field: &SubstreamField) -> Option<&Self> {
        match field {
            SubstreamField::Retract(state) => Some(state),
        }
    }

    fn from_field_mut(field: &mut SubstreamField) -> Option<&mut Self> {
        match field {
            SubstreamField::Retract(state) => Some(state),
        }
    }
}
