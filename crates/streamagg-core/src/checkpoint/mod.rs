//! # Checkpoint Module
//!
//! Versioned snapshots of substream state.
//!
//! Each substream is written as one [`SubstreamCheckpoint`] record. The
//! payload is little-endian:
//!
//! ```text
//! [u64 len][variants]                    rkyv-encoded group table
//! [i64 finalized_watermark]
//! [i64 emitted_version]
//! [u64 total_rows]
//! [u8 has_field]                         V2 and later
//!   [u8 kind][u64 len][field bytes]      only when has_field == 1
//! ```
//!
//! The version travels beside the payload. Readers reject versions newer
//! than [`CheckpointVersion::CURRENT`], and reject fields whose minimum
//! version is newer than the version found.

pub mod store;

use std::fmt;

use bytes::{Buf, BufMut};

use crate::aggregate::AggregatedDataVariants;
use crate::substream::{FieldCodec, FieldKind, SubstreamContext, SubstreamId};
use crate::time::Watermark;

pub use store::{CheckpointStore, CheckpointStoreError, InMemoryCheckpointStore};

/// Ordered version tag of a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointVersion(u32);

impl CheckpointVersion {
    /// Variants and bookkeeping only.
    pub const V1: Self = Self(1);
    /// Adds the auxiliary field segment.
    pub const V2: Self = Self(2);
    /// Version written by this build.
    pub const CURRENT: Self = Self::V2;

    /// Wraps a raw version number.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// The raw version number.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this build can read and write the version.
    #[must_use]
    pub fn is_supported(self) -> bool {
        self >= Self::V1 && self <= Self::CURRENT
    }
}

impl fmt::Display for CheckpointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Errors raised while writing or restoring checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A field cannot be recovered from a checkpoint this old
    #[error("Failed to recover checkpoint: {field} requires {required}, checkpoint is {version}")]
    RecoverCheckpointFailed {
        /// Field that could not be recovered
        field: FieldKind,
        /// Version of the checkpoint
        version: CheckpointVersion,
        /// Minimum version carrying the field
        required: CheckpointVersion,
    },

    /// A field cannot be written at the requested version
    #[error("{field} requires checkpoint version {required}, requested {version}")]
    FieldRequiresVersion {
        /// Field to write
        field: FieldKind,
        /// Requested version
        version: CheckpointVersion,
        /// Minimum version carrying the field
        required: CheckpointVersion,
    },

    /// The version is outside the range this build understands
    #[error("Unsupported checkpoint version {found} (current is {current})")]
    UnsupportedVersion {
        /// Version found
        found: CheckpointVersion,
        /// Newest supported version
        current: CheckpointVersion,
    },

    /// The payload is malformed
    #[error("Corrupted checkpoint: {0}")]
    Corrupted(String),

    /// The payload ended early
    #[error("Truncated checkpoint")]
    Truncated,

    /// The group table could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The checkpoint holds a different field than the one installed
    #[error("Checkpoint holds field {found}, substream has {expected}")]
    FieldMismatch {
        /// Installed field kind
        expected: FieldKind,
        /// Field kind in the checkpoint
        found: FieldKind,
    },

    /// The checkpoint holds a field but the substream has none
    #[error("Checkpoint holds field {0}, substream has none")]
    UnexpectedField(FieldKind),

    /// The substream has a field but the checkpoint holds none
    #[error("Checkpoint is missing field {0}")]
    MissingField(FieldKind),
}

/// Serialized state of one substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstreamCheckpoint {
    /// Substream the record belongs to
    pub substream_id: SubstreamId,
    /// Format version of `data`
    pub version: CheckpointVersion,
    /// Encoded payload
    pub data: Vec<u8>,
}

/// Encodes `ctx` at [`CheckpointVersion::CURRENT`].
///
/// # Errors
///
/// Returns [`CheckpointError`] if the state cannot be encoded.
pub fn encode_substream(ctx: &SubstreamContext) -> Result<SubstreamCheckpoint, CheckpointError> {
    encode_substream_with_version(ctx, CheckpointVersion::CURRENT)
}

/// Encodes `ctx` at an explicit version.
///
/// # Errors
///
/// Returns [`CheckpointError::UnsupportedVersion`] for unknown versions and
/// [`CheckpointError::FieldRequiresVersion`] if the installed field cannot
/// be represented at `version`.
pub fn encode_substream_with_version(
    ctx: &SubstreamContext,
    version: CheckpointVersion,
) -> Result<SubstreamCheckpoint, CheckpointError> {
    if !version.is_supported() {
        return Err(CheckpointError::UnsupportedVersion {
            found: version,
            current: CheckpointVersion::CURRENT,
        });
    }
    let variants = ctx
        .variants
        .serialize()
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

    let mut data = Vec::with_capacity(variants.len() + 64);
    data.put_u64_le(variants.len() as u64);
    data.extend_from_slice(&variants);
    data.put_i64_le(ctx.finalized_watermark().timestamp());
    data.put_i64_le(ctx.emitted_version());
    data.put_u64_le(ctx.total_rows());

    if version >= CheckpointVersion::V2 {
        match ctx.raw_field() {
            None => data.put_u8(0),
            Some(field) => {
                let mut encoded = Vec::new();
                field.serialize(&mut encoded, version)?;
                data.put_u8(1);
                data.put_u8(field.kind() as u8);
                data.put_u64_le(encoded.len() as u64);
                data.extend_from_slice(&encoded);
            }
        }
    } else if let Some(field) = ctx.raw_field() {
        field.serialize(&mut Vec::new(), version)?;
    }

    tracing::debug!(
        substream = %ctx.id(),
        %version,
        bytes = data.len(),
        groups = ctx.variants.len(),
        "Encoded substream checkpoint"
    );
    Ok(SubstreamCheckpoint {
        substream_id: ctx.id(),
        version,
        data,
    })
}

/// Restores `ctx` from `record`.
///
/// The context's installed field (if any) decides how the field segment is
/// read. Nothing is modified unless the whole record decodes.
///
/// # Errors
///
/// Returns [`CheckpointError::RecoverCheckpointFailed`] if the installed
/// field is newer than the record's version, and other
/// [`CheckpointError`]s for unsupported versions or malformed payloads.
pub fn decode_substream_into(
    ctx: &mut SubstreamContext,
    record: &SubstreamCheckpoint,
) -> Result<(), CheckpointError> {
    let version = record.version;
    if !version.is_supported() {
        return Err(CheckpointError::UnsupportedVersion {
            found: version,
            current: CheckpointVersion::CURRENT,
        });
    }
    let mut input = record.data.as_slice();

    let variants_len = read_len(&mut input)?;
    let variants = AggregatedDataVariants::deserialize(read_bytes(&mut input, variants_len)?)
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    let finalized_watermark = Watermark::new(read_i64(&mut input)?);
    let emitted_version = read_i64(&mut input)?;
    let total_rows = read_u64(&mut input)?;

    let mut field = ctx.raw_field().copied();
    if version >= CheckpointVersion::V2 {
        match read_u8(&mut input)? {
            0 => {
                if let Some(field) = &field {
                    return Err(CheckpointError::MissingField(field.kind()));
                }
            }
            1 => {
                let kind = read_u8(&mut input)?;
                let kind = FieldKind::from_u8(kind)
                    .ok_or_else(|| CheckpointError::Corrupted(format!("unknown field kind {kind}")))?;
                let Some(field) = field.as_mut() else {
                    return Err(CheckpointError::UnexpectedField(kind));
                };
                if field.kind() != kind {
                    return Err(CheckpointError::FieldMismatch {
                        expected: field.kind(),
                        found: kind,
                    });
                }
                let len = read_len(&mut input)?;
                let mut segment = read_bytes(&mut input, len)?;
                field.deserialize(&mut segment, version)?;
                if !segment.is_empty() {
                    return Err(CheckpointError::Corrupted(
                        "trailing bytes in field segment".to_string(),
                    ));
                }
            }
            other => {
                return Err(CheckpointError::Corrupted(format!(
                    "invalid field marker {other}"
                )))
            }
        }
    } else if let Some(field) = field.as_mut() {
        // No field segment before V2; the codec reports why it cannot recover.
        field.deserialize(&mut &[][..], version)?;
    }

    if input.has_remaining() {
        return Err(CheckpointError::Corrupted(format!(
            "{} trailing bytes",
            input.remaining()
        )));
    }

    ctx.variants = variants;
    ctx.restore_bookkeeping(finalized_watermark, emitted_version, total_rows);
    if let (Some(slot), Some(field)) = (ctx.raw_field_mut(), field) {
        *slot = field;
    }
    tracing::debug!(
        substream = %ctx.id(),
        %version,
        groups = ctx.variants.len(),
        %finalized_watermark,
        "Restored substream checkpoint"
    );
    Ok(())
}

fn read_u8(input: &mut &[u8]) -> Result<u8, CheckpointError> {
    if input.remaining() < 1 {
        return Err(CheckpointError::Truncated);
    }
    Ok(input.get_u8())
}

fn read_u64(input: &mut &[u8]) -> Result<u64, CheckpointError> {
    if input.remaining() < 8 {
        return Err(CheckpointError::Truncated);
    }
    Ok(input.get_u64_le())
}

fn read_i64(input: &mut &[u8]) -> Result<i64, CheckpointError> {
    if input.remaining() < 8 {
        return Err(CheckpointError::Truncated);
    }
    Ok(input.get_i64_le())
}

fn read_len(input: &mut &[u8]) -> Result<usize, CheckpointError> {
    let len = read_u64(input)?;
    usize::try_from(len).map_err(|_| CheckpointError::Corrupted(format!("length {len} overflows")))
}

fn read_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], CheckpointError> {
    let data: &'a [u8] = *input;
    if data.len() < len {
        return Err(CheckpointError::Truncated);
    }
    let (head, tail) = data.split_at(len);
    *input = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AccumulatorState, AggregateFunction, Datum, GroupState};
    use crate::substream::{RetractState, SubstreamField};
    use arrow_schema::DataType;

    fn context_with_group() -> SubstreamContext {
        let mut ctx = SubstreamContext::new(SubstreamId::new(7));
        let mut acc = AccumulatorState::new(AggregateFunction::Count, &DataType::Int64, false);
        acc.update(&Datum::Int64(1), 3).unwrap();
        let mut group = GroupState::new(vec![acc]);
        group.row_count = 3;
        ctx.variants.groups_mut().insert(Vec::new(), group);
        ctx.add_row_count(3);
        ctx.advance_finalized_watermark(Watermark::new(42));
        ctx.next_version();
        ctx
    }

    fn retract_context(state: RetractState) -> SubstreamContext {
        let mut ctx = context_with_group();
        ctx.set_field(SubstreamField::Retract(state)).unwrap();
        ctx
    }

    #[test]
    fn test_version_ordering() {
        assert!(CheckpointVersion::V1 < CheckpointVersion::V2);
        assert_eq!(CheckpointVersion::CURRENT, CheckpointVersion::V2);
        assert!(!CheckpointVersion::new(0).is_supported());
        assert!(!CheckpointVersion::new(3).is_supported());
        assert_eq!(CheckpointVersion::V2.to_string(), "V2");
    }

    #[test]
    fn test_restore_retract_state() {
        let source = retract_context(RetractState::RetractionEnabled);
        let record = encode_substream(&source).unwrap();
        assert_eq!(record.version, CheckpointVersion::CURRENT);

        let mut target = SubstreamContext::new(SubstreamId::new(7));
        target
            .set_field(SubstreamField::Retract(RetractState::default()))
            .unwrap();
        decode_substream_into(&mut target, &record).unwrap();

        assert!(target.field::<RetractState>().unwrap().is_enabled());
        assert_eq!(target.finalized_watermark(), Watermark::new(42));
        assert_eq!(target.emitted_version(), 1);
        assert_eq!(target.total_rows(), 3);
        assert!(!target.has_new_data());
        assert_eq!(
            target.variants.group(&Vec::new()).unwrap().results(),
            vec![Datum::Int64(3)]
        );
    }

    #[test]
    fn test_v1_record_cannot_restore_retract_state() {
        let source = context_with_group();
        let record = encode_substream_with_version(&source, CheckpointVersion::V1).unwrap();

        let mut target = SubstreamContext::new(SubstreamId::new(7));
        target
            .set_field(SubstreamField::Retract(RetractState::default()))
            .unwrap();
        let err = decode_substream_into(&mut target, &record).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::RecoverCheckpointFailed {
                version: CheckpointVersion::V1,
                required: CheckpointVersion::V2,
                ..
            }
        ));
        assert!(target.variants.is_empty());
    }

    #[test]
    fn test_v1_record_without_field() {
        let source = context_with_group();
        let record = encode_substream_with_version(&source, CheckpointVersion::V1).unwrap();
        let mut target = SubstreamContext::new(SubstreamId::new(7));
        decode_substream_into(&mut target, &record).unwrap();
        assert_eq!(target.variants.len(), 1);
    }

    #[test]
    fn test_v1_cannot_carry_field() {
        let source = retract_context(RetractState::RetractionDisabled);
        assert!(matches!(
            encode_substream_with_version(&source, CheckpointVersion::V1),
            Err(CheckpointError::FieldRequiresVersion { .. })
        ));
    }

    #[test]
    fn test_rejects_newer_version() {
        let source = context_with_group();
        let mut record = encode_substream(&source).unwrap();
        record.version = CheckpointVersion::new(3);
        let mut target = SubstreamContext::new(SubstreamId::new(7));
        assert!(matches!(
            decode_substream_into(&mut target, &record),
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_field_presence_must_match() {
        let with_field = encode_substream(&retract_context(RetractState::default())).unwrap();
        let mut plain = SubstreamContext::new(SubstreamId::new(7));
        assert!(matches!(
            decode_substream_into(&mut plain, &with_field),
            Err(CheckpointError::UnexpectedField(FieldKind::RetractState))
        ));

        let without_field = encode_substream(&context_with_group()).unwrap();
        let mut expecting = SubstreamContext::new(SubstreamId::new(7));
        expecting
            .set_field(SubstreamField::Retract(RetractState::default()))
            .unwrap();
        assert!(matches!(
            decode_substream_into(&mut expecting, &without_field),
            Err(CheckpointError::MissingField(FieldKind::RetractState))
        ));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let mut record = encode_substream(&context_with_group()).unwrap();
        let full = record.data.clone();

        record.data.truncate(full.len() - 1);
        let mut target = SubstreamContext::new(SubstreamId::new(7));
        assert!(matches!(
            decode_substream_into(&mut target, &record),
            Err(CheckpointError::Truncated)
        ));

        record.data = full;
        record.data.push(0);
        assert!(matches!(
            decode_substream_into(&mut target, &record),
            Err(CheckpointError::Corrupted(_))
        ));
    }
}
