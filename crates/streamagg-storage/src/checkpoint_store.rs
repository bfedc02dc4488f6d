//! Filesystem-backed [`CheckpointStore`].
//!
//! ## Disk Layout
//!
//! ```text
//! {base_dir}/substreams/
//!   00000000000000ff.ckpt     # latest record of substream 0xff
//!   00000000000000ff.ckpt.tmp # in-flight write, ignored by readers
//! ```
//!
//! ## Record Format
//!
//! ```text
//! [4 bytes magic "SAGC"][u32 version][u32 crc32c(payload)][u64 len][payload]
//! ```
//!
//! All integers are little-endian. Records are written to a temp file,
//! fsynced and renamed into place, so readers see either the old or the new
//! record.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use streamagg_core::checkpoint::{CheckpointStore, CheckpointStoreError, CheckpointVersion};
use streamagg_core::substream::SubstreamId;

const MAGIC: &[u8; 4] = b"SAGC";
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const EXTENSION: &str = "ckpt";

/// Fsync a file to ensure its contents are durable on disk.
fn sync_file(path: &Path) -> Result<(), std::io::Error> {
    // Must open with write access: Windows requires it for FlushFileBuffers.
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()
}

/// Fsync a directory to make rename operations durable.
///
/// On Windows, directory sync is not supported; the OS handles durability.
#[allow(clippy::unnecessary_wraps)]
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    version: CheckpointVersion,
    crc: u32,
    len: u64,
}

impl RecordHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_slice(MAGIC);
        out.put_u32_le(self.version.as_u32());
        out.put_u32_le(self.crc);
        out.put_u64_le(self.len);
    }

    fn decode(mut input: &[u8]) -> Result<Self, String> {
        if input.len() < HEADER_LEN {
            return Err(format!("header is {} bytes, expected {HEADER_LEN}", input.len()));
        }
        if &input[..4] != MAGIC {
            return Err("bad magic".to_string());
        }
        input.advance(4);
        Ok(Self {
            version: CheckpointVersion::new(input.get_u32_le()),
            crc: input.get_u32_le(),
            len: input.get_u64_le(),
        })
    }
}

/// Stores one checksummed file per substream.
#[derive(Debug, Clone)]
pub struct FileSystemCheckpointStore {
    base_dir: PathBuf,
}

impl FileSystemCheckpointStore {
    /// Creates a store rooted at `base_dir`.
    ///
    /// Records live under `{base_dir}/substreams/`, created lazily on the
    /// first write.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn substreams_dir(&self) -> PathBuf {
        self.base_dir.join("substreams")
    }

    fn record_path(&self, substream: SubstreamId) -> PathBuf {
        self.substreams_dir()
            .join(format!("{substream}.{EXTENSION}"))
    }

    /// Parses a substream id from a file name like `00000000000000ff.ckpt`.
    fn parse_substream_id(name: &str) -> Option<SubstreamId> {
        let stem = name.strip_suffix(".ckpt")?;
        u64::from_str_radix(stem, 16).ok().map(SubstreamId::new)
    }

    fn read_header(&self, substream: SubstreamId) -> Result<Option<RecordHeader>, CheckpointStoreError> {
        use std::io::Read;

        let path = self.record_path(substream);
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_LEN];
        let mut file = std::fs::File::open(&path)?;
        file.read_exact(&mut buf)?;
        RecordHeader::decode(&buf)
            .map(Some)
            .map_err(|reason| CheckpointStoreError::Corrupted { substream, reason })
    }
}

impl CheckpointStore for FileSystemCheckpointStore {
    fn put(
        &self,
        substream: SubstreamId,
        version: CheckpointVersion,
        data: &[u8],
    ) -> Result<(), CheckpointStoreError> {
        match self.read_header(substream) {
            Ok(Some(existing)) if existing.version > version => {
                return Err(CheckpointStoreError::VersionRegression {
                    substream,
                    stored: existing.version,
                    attempted: version,
                });
            }
            Ok(_) => {}
            // Unreadable records are replaced
            Err(e) => {
                tracing::warn!(
                    %substream,
                    %version,
                    error = %e,
                    "Existing checkpoint record is unreadable, overwriting it"
                );
            }
        }

        let dir = self.substreams_dir();
        std::fs::create_dir_all(&dir)?;

        let header = RecordHeader {
            version,
            crc: crc32c::crc32c(data),
            len: data.len() as u64,
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + data.len());
        header.encode(&mut buf);
        buf.put_slice(data);

        // Write to a temp file, fsync, then rename for atomic durability
        let path = self.record_path(substream);
        let tmp_path = path.with_extension("ckpt.tmp");
        std::fs::write(&tmp_path, &buf)?;
        sync_file(&tmp_path)?;
        std::fs::rename(&tmp_path, &path)?;
        sync_dir(&dir)?;

        tracing::debug!(%substream, %version, bytes = data.len(), "Wrote checkpoint record");
        Ok(())
    }

    fn get(
        &self,
        substream: SubstreamId,
    ) -> Result<Option<(CheckpointVersion, Vec<u8>)>, CheckpointStoreError> {
        let path = self.record_path(substream);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = std::fs::read(&path)?;
        let corrupted = |reason: String| CheckpointStoreError::Corrupted { substream, reason };

        let header = RecordHeader::decode(&bytes).map_err(corrupted)?;
        let payload_len = bytes.len() - HEADER_LEN;
        if header.len != payload_len as u64 {
            return Err(corrupted(format!(
                "header declares {} payload bytes, file has {payload_len}",
                header.len
            )));
        }
        let payload = bytes.split_off(HEADER_LEN);
        let crc = crc32c::crc32c(&payload);
        if crc != header.crc {
            return Err(corrupted(format!(
                "checksum mismatch: expected {:08x}, computed {crc:08x}",
                header.crc
            )));
        }
        Ok(Some((header.version, payload)))
    }

    fn list(&self) -> Result<Vec<SubstreamId>, CheckpointStoreError> {
        let dir = self.substreams_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<SubstreamId> = std::fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().and_then(Self::parse_substream_id))
            .collect();

        ids.sort_unstable();
        Ok(ids)
    }

    fn remove(&self, substream: SubstreamId) -> Result<bool, CheckpointStoreError> {
        let path = self.record_path(substream);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        sync_dir(&self.substreams_dir())?;
        tracing::debug!(%substream, "Removed checkpoint record");
        Ok(true)
    }
}
