//! Resume data: a bencoded snapshot of what is on disk, verified against
//! the filesystem before trusting it.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use riptide_bencode::{DictBuilder, ListBuilder, Value};
use tracing::debug;

use crate::error::{StorageError, StorageErrorKind, StorageOp};
use crate::storage::FileStorage;
use crate::type_aliases::BF;

/// Files newer than recorded by more than this are rejected.
const MTIME_FORWARD_SLACK: i64 = 5 * 60;
/// FAT stores mtimes at two-second granularity; allow a little drift back.
const MTIME_BACKWARD_SLACK: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Allocation {
    Compact,
    #[default]
    Full,
}

/// Outcome of a successful verification.
#[derive(Debug)]
pub struct ResumeCheck {
    pub have: BF,
    /// Every piece present: storage can skip straight to seeding.
    pub seed: bool,
    pub allocation: Allocation,
}

fn err(op: StorageOp, file: Option<usize>, kind: StorageErrorKind) -> StorageError {
    StorageError::new(op, file, kind)
}

fn mtime_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

impl FileStorage {
    /// Validate a resume-data blob against the torrent and the files on
    /// disk. Applies `mapped_files` and `file_priority` on success paths
    /// before any stat happens.
    pub fn verify_resume_data(&self, blob: &[u8]) -> Result<ResumeCheck, StorageError> {
        let cfg = self.config.load();
        let root = riptide_bencode::from_bytes(blob)
            .map_err(|_| err(StorageOp::CheckResume, None, StorageErrorKind::NotADictionary))?;
        if root.as_dict().is_none() {
            return Err(err(
                StorageOp::CheckResume,
                None,
                StorageErrorKind::NotADictionary,
            ));
        }

        let num_files = self.files.len();
        let num_pieces = self.lengths.total_pieces() as usize;

        // Renames first, so the stats below look at the right paths.
        if let Some(mapped) = root.get("mapped_files").and_then(Value::as_list) {
            if mapped.len() != num_files {
                return Err(err(
                    StorageOp::CheckResume,
                    None,
                    StorageErrorKind::MismatchingNumberOfFiles,
                ));
            }
            let mut state = self.state.write();
            for (idx, name) in mapped.iter().enumerate() {
                if let Some(name) = name.as_str() {
                    if !name.is_empty() {
                        state.paths[idx] = PathBuf::from(name);
                    }
                }
            }
        }

        if let Some(prio) = root.get("file_priority").and_then(Value::as_list) {
            if prio.len() == num_files {
                let parsed: Vec<u8> = prio
                    .iter()
                    .map(|v| v.as_integer().unwrap_or(4).clamp(0, 7) as u8)
                    .collect();
                self.state.write().priorities = parsed;
            }
        }

        if let Some(bpp) = root.get("blocks per piece").and_then(Value::as_integer) {
            if bpp != self.lengths.default_blocks_per_piece() as i64 {
                return Err(err(
                    StorageOp::CheckResume,
                    None,
                    StorageErrorKind::InvalidBlocksPerPiece,
                ));
            }
        }

        let allocation = match root.get("allocation").and_then(Value::as_str) {
            Some("compact") => Allocation::Compact,
            _ => Allocation::Full,
        };

        // Piece state: either a `slots` list or a `pieces` byte string.
        let mut have = BF::repeat(false, num_pieces);
        match (
            root.get("slots").and_then(Value::as_list),
            root.get("pieces").and_then(Value::as_bytes),
        ) {
            (Some(slots), _) => {
                if slots.len() != num_pieces {
                    return Err(err(
                        StorageOp::CheckResume,
                        None,
                        StorageErrorKind::MissingPieces,
                    ));
                }
                for (idx, slot) in slots.iter().enumerate() {
                    if slot.as_integer().unwrap_or(-1) >= 0 {
                        have.set(idx, true);
                    }
                }
            }
            (None, Some(pieces)) => {
                if pieces.len() != num_pieces {
                    return Err(err(
                        StorageOp::CheckResume,
                        None,
                        StorageErrorKind::MissingPieces,
                    ));
                }
                for (idx, byte) in pieces.iter().enumerate() {
                    if byte & 1 != 0 {
                        have.set(idx, true);
                    }
                }
            }
            (None, None) => {
                return Err(err(
                    StorageOp::CheckResume,
                    None,
                    StorageErrorKind::MissingPieces,
                ));
            }
        }

        // File sizes and timestamps.
        let sizes = root
            .get("file sizes")
            .and_then(Value::as_list)
            .ok_or_else(|| {
                err(
                    StorageOp::CheckResume,
                    None,
                    StorageErrorKind::MissingFileSizes,
                )
            })?;
        if sizes.is_empty() {
            return Err(err(
                StorageOp::CheckResume,
                None,
                StorageErrorKind::NoFilesInResumeData,
            ));
        }
        if sizes.len() != num_files {
            return Err(err(
                StorageOp::CheckResume,
                None,
                StorageErrorKind::MismatchingNumberOfFiles,
            ));
        }

        for (idx, entry) in sizes.iter().enumerate() {
            if self.files[idx].padding {
                continue;
            }
            let entry = entry.as_list().unwrap_or_default();
            let expected_size = entry.first().and_then(Value::as_integer).unwrap_or(0);
            let expected_mtime = entry.get(1).and_then(Value::as_integer).unwrap_or(0);

            let stat = self.stat(idx)?;
            let Some(stat) = stat else {
                if expected_size != 0 {
                    return Err(err(
                        StorageOp::CheckResume,
                        Some(idx),
                        StorageErrorKind::MismatchingFileSize,
                    ));
                }
                continue;
            };
            if expected_size > stat.size as i64 {
                return Err(err(
                    StorageOp::CheckResume,
                    Some(idx),
                    StorageErrorKind::MismatchingFileSize,
                ));
            }
            if !cfg.ignore_resume_timestamps && expected_mtime != 0 {
                if let Some(actual) = stat.mtime.map(mtime_secs) {
                    if actual > expected_mtime + MTIME_FORWARD_SLACK
                        || actual < expected_mtime - MTIME_BACKWARD_SLACK
                    {
                        // The file exists with a plausible size; callers
                        // may choose to trust it rather than recheck.
                        if cfg.no_recheck_incomplete_resume {
                            debug!(file = idx, "stale mtime tolerated by policy");
                            continue;
                        }
                        return Err(err(
                            StorageOp::CheckResume,
                            Some(idx),
                            StorageErrorKind::MismatchingFileTimestamp,
                        ));
                    }
                }
            }
        }

        let seed = have.all();
        debug!(storage = %self.storage_id(), seed, "resume data verified");
        Ok(ResumeCheck {
            have,
            seed,
            allocation,
        })
    }

    /// Emit a resume-data blob that `verify_resume_data` accepts against
    /// unchanged files.
    pub fn write_resume_data(&self, have: &BF) -> Result<Vec<u8>, StorageError> {
        let num_files = self.files.len();
        let mut sizes = ListBuilder::new();
        for (idx, meta) in self.files.iter().enumerate() {
            let (size, mtime) = if meta.padding {
                (meta.length as i64, 0)
            } else {
                match self.stat(idx)? {
                    Some(s) => (s.size as i64, s.mtime.map(mtime_secs).unwrap_or(0)),
                    None => (0, 0),
                }
            };
            sizes = sizes.push_list(ListBuilder::new().push_integer(size).push_integer(mtime));
        }

        let pieces: Vec<u8> = have.iter().map(|b| u8::from(*b)).collect();
        debug_assert_eq!(pieces.len(), self.lengths.total_pieces() as usize);

        let mut d = DictBuilder::new()
            .push_str("allocation", "full")
            .push_integer(
                "blocks per piece",
                self.lengths.default_blocks_per_piece() as i64,
            )
            .push_list("file sizes", sizes);

        let state = self.state.read();
        if state.priorities.iter().any(|p| *p != 4) {
            let mut prio = ListBuilder::new();
            for p in &state.priorities {
                prio = prio.push_integer(*p as i64);
            }
            d = d.push_list("file_priority", prio);
        }
        let renamed = (0..num_files).any(|i| state.paths[i] != self.files[i].relative_path);
        if renamed {
            let mut mapped = ListBuilder::new();
            for path in &state.paths {
                mapped = mapped.push_bytes(path.to_string_lossy().as_bytes());
            }
            d = d.push_list("mapped_files", mapped);
        }
        drop(state);

        Ok(d.push_bytes("pieces", &pieces).finish())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use riptide_core::lengths::Lengths;
    use riptide_core::metainfo::MetaFile;

    use super::*;
    use crate::storage::file_pool::FilePool;
    use crate::storage::tests::test_config;
    use crate::type_aliases::StorageId;

    fn storage_with_files(dir: &Path) -> FileStorage {
        let files = vec![
            MetaFile {
                relative_path: "a".into(),
                length: 64,
                padding: false,
                offset_in_torrent: 0,
            },
            MetaFile {
                relative_path: "b".into(),
                length: 64,
                padding: false,
                offset_in_torrent: 64,
            },
        ];
        let lengths = Lengths::new(128, 32).unwrap();
        FileStorage::new(
            StorageId(1),
            1,
            files,
            lengths,
            dir.to_path_buf(),
            Arc::new(FilePool::new(4)),
            test_config(),
        )
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();

        let mut have = BF::repeat(false, 4);
        have.set(0, true);
        have.set(2, true);

        let blob = storage.write_resume_data(&have).unwrap();
        let check = storage.verify_resume_data(&blob).unwrap();
        assert_eq!(check.have, have);
        assert!(!check.seed);
        assert_eq!(check.allocation, Allocation::Full);
    }

    #[test]
    fn test_seed_shortcut() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();
        let have = BF::repeat(true, 4);
        let blob = storage.write_resume_data(&have).unwrap();
        assert!(storage.verify_resume_data(&blob).unwrap().seed);
    }

    #[test]
    fn test_not_a_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        let e = storage.verify_resume_data(b"le").unwrap_err();
        assert!(matches!(e.kind, StorageErrorKind::NotADictionary));
        let e = storage.verify_resume_data(b"junk").unwrap_err();
        assert!(matches!(e.kind, StorageErrorKind::NotADictionary));
    }

    #[test]
    fn test_shrunk_file_is_rejected_with_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();
        let blob = storage.write_resume_data(&BF::repeat(true, 4)).unwrap();

        // Shrink the second file after the snapshot.
        std::fs::write(dir.path().join("b"), b"tiny").unwrap();
        let e = storage.verify_resume_data(&blob).unwrap_err();
        assert!(matches!(e.kind, StorageErrorKind::MismatchingFileSize));
        assert_eq!(e.file, Some(1));
    }

    #[test]
    fn test_mtime_window() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();
        let blob = storage.write_resume_data(&BF::repeat(true, 4)).unwrap();

        // Rewrite the blob with an mtime far in the past: the file on disk
        // is now too new by more than the forward slack.
        let now = mtime_secs(SystemTime::now());
        let stale = now - MTIME_FORWARD_SLACK - 60;
        let mut sizes = ListBuilder::new();
        for _ in 0..2 {
            sizes = sizes.push_list(ListBuilder::new().push_integer(64).push_integer(stale));
        }
        let pieces = vec![1u8; 4];
        let tampered = DictBuilder::new()
            .push_list("file sizes", sizes)
            .push_bytes("pieces", &pieces)
            .finish();
        let e = storage.verify_resume_data(&tampered).unwrap_err();
        assert!(matches!(e.kind, StorageErrorKind::MismatchingFileTimestamp));
        let _ = blob;
    }

    #[test]
    fn test_missing_pieces_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();
        let mut sizes = ListBuilder::new();
        for _ in 0..2 {
            sizes = sizes.push_list(ListBuilder::new().push_integer(64).push_integer(0));
        }
        let blob = DictBuilder::new().push_list("file sizes", sizes).finish();
        let e = storage.verify_resume_data(&blob).unwrap_err();
        assert!(matches!(e.kind, StorageErrorKind::MissingPieces));
    }

    #[test]
    fn test_slots_variant() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();
        let mut sizes = ListBuilder::new();
        for _ in 0..2 {
            sizes = sizes.push_list(ListBuilder::new().push_integer(64).push_integer(0));
        }
        let slots = ListBuilder::new()
            .push_integer(0)
            .push_integer(-1)
            .push_integer(2)
            .push_integer(-1);
        let blob = DictBuilder::new()
            .push_list("file sizes", sizes)
            .push_list("slots", slots)
            .finish();
        let check = storage.verify_resume_data(&blob).unwrap();
        assert!(check.have[0]);
        assert!(!check.have[1]);
        assert!(check.have[2]);
        assert!(!check.have[3]);
    }

    #[test]
    fn test_mapped_files_applied_before_stat() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        storage.initialize(true).unwrap();
        // Move "a" on disk, then hand resume data that maps to the new name.
        std::fs::rename(dir.path().join("a"), dir.path().join("a.moved")).unwrap();

        let mut sizes = ListBuilder::new();
        for _ in 0..2 {
            sizes = sizes.push_list(ListBuilder::new().push_integer(64).push_integer(0));
        }
        let mapped = ListBuilder::new().push_bytes(b"a.moved").push_bytes(b"b");
        let blob = DictBuilder::new()
            .push_list("file sizes", sizes)
            .push_list("mapped_files", mapped)
            .push_bytes("pieces", &[1, 1, 1, 1])
            .finish();
        assert!(storage.verify_resume_data(&blob).is_ok());
    }

    #[test]
    fn test_wrong_blocks_per_piece() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_files(dir.path());
        let blob = DictBuilder::new().push_integer("blocks per piece", 99).finish();
        let e = storage.verify_resume_data(&blob).unwrap_err();
        assert!(matches!(e.kind, StorageErrorKind::InvalidBlocksPerPiece));
    }
}
