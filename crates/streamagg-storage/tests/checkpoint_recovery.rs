//! Recovery of aggregation state through the filesystem store.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, Int8Type};
use arrow_array::{Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use streamagg_core::checkpoint::{
    encode_substream_with_version, CheckpointError, CheckpointStore, CheckpointVersion,
};
use streamagg_core::chunk::{Chunk, ChunkContext};
use streamagg_core::params::{AggregatingTransformParams, AggregationConfig, EmitMode};
use streamagg_core::substream::{RetractState, SubstreamId};
use streamagg_core::transform::{CollectingSink, GlobalAggregatingTransformWithSubstream};
use streamagg_core::{AggregateFunction, AggregateSpec, Error};
use streamagg_storage::{CheckpointConfig, CheckpointCoordinator, FileSystemCheckpointStore};
use tempfile::TempDir;

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

fn params(mode: EmitMode) -> Arc<AggregatingTransformParams> {
    let config = AggregationConfig::new()
        .with_aggregate(AggregateSpec::new(AggregateFunction::LastValue, "k", "k"))
        .with_aggregate(AggregateSpec::new(AggregateFunction::LastValue, "v", "v"))
        .with_emit_mode(mode);
    AggregatingTransformParams::try_new(config, &schema()).unwrap()
}

fn transform(mode: EmitMode, sink: &CollectingSink) -> GlobalAggregatingTransformWithSubstream {
    GlobalAggregatingTransformWithSubstream::try_new(params(mode), Box::new(sink.clone())).unwrap()
}

fn chunk(k: i64, v: i64, watermark: i64) -> Chunk {
    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(vec![k])),
            Arc::new(Int64Array::from(vec![v])),
        ],
    )
    .unwrap();
    Chunk::new(batch).with_context(ChunkContext::shared(watermark))
}

fn changelog_rows(chunk: &Chunk) -> Vec<(i64, i64, i8)> {
    let batch = chunk.batch();
    let k = batch.column(0).as_primitive::<Int64Type>();
    let v = batch.column(1).as_primitive::<Int64Type>();
    let d = batch.column(2).as_primitive::<Int8Type>();
    (0..batch.num_rows())
        .map(|i| (k.value(i), v.value(i), d.value(i)))
        .collect()
}

#[test]
fn test_changelog_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let sink = CollectingSink::new();
    let mut coordinator = CheckpointCoordinator::new(
        FileSystemCheckpointStore::new(dir.path()),
        CheckpointConfig::default(),
    );

    let mut before = transform(EmitMode::Changelog, &sink);
    before.consume(SubstreamId::GLOBAL, &chunk(1, 5, 1)).unwrap();
    assert_eq!(changelog_rows(&sink.take()[0]), vec![(1, 5, 1)]);
    assert_eq!(coordinator.checkpoint(&before).unwrap(), 1);
    drop(before);

    let mut after = transform(EmitMode::Changelog, &sink);
    assert_eq!(coordinator.recover(&mut after).unwrap(), 1);
    let ctx = after.substream(SubstreamId::GLOBAL).unwrap();
    assert!(ctx.field::<RetractState>().unwrap().is_enabled());
    assert_eq!(i64::from(ctx.finalized_watermark()), 1);

    // The restored substream retracts the result emitted before the restart
    after.consume(SubstreamId::GLOBAL, &chunk(1, 9, 2)).unwrap();
    let out = sink.take();
    assert_eq!(out.len(), 1);
    assert_eq!(changelog_rows(&out[0]), vec![(1, 5, -1), (1, 9, 1)]);
}

#[test]
fn test_pre_v2_record_cannot_restore_retract_state() {
    let dir = TempDir::new().unwrap();
    let store = FileSystemCheckpointStore::new(dir.path());
    let sink = CollectingSink::new();

    // A snapshot-mode substream has no field and still encodes at V1
    let mut legacy = transform(EmitMode::Snapshot, &sink);
    legacy.consume(SubstreamId::GLOBAL, &chunk(1, 5, 1)).unwrap();
    let record = encode_substream_with_version(
        legacy.substream(SubstreamId::GLOBAL).unwrap(),
        CheckpointVersion::V1,
    )
    .unwrap();
    store.put_record(&record).unwrap();

    let mut changelog = transform(EmitMode::Changelog, &sink);
    let err = changelog.recover_from(&store).unwrap_err();
    assert!(matches!(
        err,
        Error::Checkpoint(CheckpointError::RecoverCheckpointFailed { version, .. })
            if version == CheckpointVersion::V1
    ));
    assert_eq!(changelog.num_substreams(), 0);
}

#[test]
fn test_corrupted_record_fails_recovery() {
    let dir = TempDir::new().unwrap();
    let sink = CollectingSink::new();
    let mut coordinator = CheckpointCoordinator::new(
        FileSystemCheckpointStore::new(dir.path()),
        CheckpointConfig::default(),
    );
    let mut t = transform(EmitMode::Changelog, &sink);
    t.consume(SubstreamId::new(3), &chunk(1, 5, 1)).unwrap();
    coordinator.checkpoint(&t).unwrap();

    let path = dir.path().join("substreams/0000000000000003.ckpt");
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2 + 10;
    bytes[mid] ^= 0x55;
    std::fs::write(&path, bytes).unwrap();

    let mut restored = transform(EmitMode::Changelog, &sink);
    assert!(matches!(coordinator.recover(&mut restored), Err(Error::Store(_))));
    assert_eq!(restored.num_substreams(), 0);
}
