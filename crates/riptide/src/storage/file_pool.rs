use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageErrorKind, StorageOp};
use crate::type_aliases::StorageId;

/// Key of one pooled handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub storage: StorageId,
    pub file_index: usize,
}

/// Flags applied when a file is opened through the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    pub write: bool,
    /// Advisory whole-file lock while the handle is pooled.
    pub lock_file: bool,
    /// Avoid updating atime on reads where the platform allows it.
    pub no_atime: bool,
}

struct PoolEntry {
    file: Arc<File>,
    writable: bool,
    /// Which storage instance opened this handle. Two instances may share a
    /// read handle; any writer demands exclusivity.
    owner: u64,
}

/// Process-wide LRU of open file handles, shared by every storage.
///
/// The mutex only guards the map. Opens and closes happen outside it; a
/// close on some platforms can take long enough to stall every disk worker
/// otherwise.
pub struct FilePool {
    cache: Mutex<LruCache<FileKey, PoolEntry>>,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Look up or open the handle for `key`. `owner` identifies the storage
    /// instance for the same-file contention rule.
    pub fn get_or_open(
        &self,
        key: FileKey,
        owner: u64,
        mode: OpenMode,
        path: &Path,
    ) -> Result<Arc<File>, StorageError> {
        let stale = {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(entry) => {
                    if entry.owner != owner && (mode.write || entry.writable) {
                        return Err(StorageError::new(
                            StorageOp::Open,
                            Some(key.file_index),
                            StorageErrorKind::FileCollision,
                        ));
                    }
                    if !mode.write || entry.writable {
                        return Ok(entry.file.clone());
                    }
                    // Mode-insufficient: drop the read-only handle, reopen
                    // read-write below.
                    cache.pop(&key)
                }
                None => None,
            }
        };
        // The close (if any) and the open run without the lock held.
        drop(stale);

        let file = open_with_mode(path, mode)
            .map_err(|e| StorageError::io(StorageOp::Open, Some(key.file_index), e))?;
        let file = Arc::new(file);

        let evicted = {
            let mut cache = self.cache.lock();
            // Racing opens: keep whichever satisfies the stronger mode.
            if let Some(existing) = cache.get(&key) {
                if existing.owner == owner && (!mode.write || existing.writable) {
                    return Ok(existing.file.clone());
                }
                if existing.owner != owner && (mode.write || existing.writable) {
                    return Err(StorageError::new(
                        StorageOp::Open,
                        Some(key.file_index),
                        StorageErrorKind::FileCollision,
                    ));
                }
                cache.pop(&key);
            }
            let evicted = if cache.len() == usize::from(cache.cap()) {
                let lru = cache.pop_lru();
                if let Some((evicted_key, _)) = &lru {
                    debug!(?evicted_key, "file pool full, evicting oldest handle");
                }
                lru
            } else {
                None
            };
            cache.put(
                key,
                PoolEntry {
                    file: file.clone(),
                    writable: mode.write,
                    owner,
                },
            );
            evicted
        };
        // The close syscall for the evicted handle runs outside the lock.
        drop(evicted);
        Ok(file)
    }

    /// Drop every handle belonging to one storage. Used by
    /// `release_files`, `move_storage` and `delete_files`.
    pub fn release(&self, storage: StorageId) {
        let dropped: Vec<PoolEntry> = {
            let mut cache = self.cache.lock();
            let keys: Vec<FileKey> = cache
                .iter()
                .filter(|(k, _)| k.storage == storage)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().filter_map(|k| cache.pop(k)).collect()
        };
        // Closes happen here, outside the lock.
        drop(dropped);
    }

    /// Drop one handle (e.g. before renaming or deleting that file).
    pub fn evict(&self, key: FileKey) {
        let entry = self.cache.lock().pop(&key);
        drop(entry);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn base_options(mode: OpenMode) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if mode.write {
        opts.write(true).create(true);
    }
    opts
}

#[cfg(target_os = "linux")]
fn open_with_mode(path: &Path, mode: OpenMode) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = if mode.no_atime {
        let mut opts = base_options(mode);
        opts.custom_flags(libc::O_NOATIME);
        match opts.open(path) {
            Ok(f) => f,
            // O_NOATIME fails with EPERM unless we own the file; retry plain.
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => base_options(mode).open(path)?,
            Err(e) => return Err(e),
        }
    } else {
        base_options(mode).open(path)?
    };
    lock_if_requested(&file, mode);
    Ok(file)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn open_with_mode(path: &Path, mode: OpenMode) -> std::io::Result<File> {
    let file = base_options(mode).open(path)?;
    lock_if_requested(&file, mode);
    Ok(file)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, mode: OpenMode) -> std::io::Result<File> {
    base_options(mode).open(path)
}

#[cfg(unix)]
fn lock_if_requested(file: &File, mode: OpenMode) {
    if mode.lock_file {
        use std::os::unix::io::AsRawFd;
        // Advisory only; failure to lock is not fatal.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(storage: u32, file_index: usize) -> FileKey {
        FileKey {
            storage: StorageId(storage),
            file_index,
        }
    }

    fn tempdir_with_files(n: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..n {
            std::fs::write(dir.path().join(format!("f{i}")), b"data").unwrap();
        }
        dir
    }

    #[test]
    fn test_hit_and_mode_upgrade() {
        let dir = tempdir_with_files(1);
        let pool = FilePool::new(4);
        let path = dir.path().join("f0");

        let read_only = pool
            .get_or_open(key(1, 0), 1, OpenMode::default(), &path)
            .unwrap();
        // Same mode: same handle.
        let again = pool
            .get_or_open(key(1, 0), 1, OpenMode::default(), &path)
            .unwrap();
        assert!(Arc::ptr_eq(&read_only, &again));
        // Write wanted: the read-only handle is replaced.
        let writable = pool
            .get_or_open(
                key(1, 0),
                1,
                OpenMode {
                    write: true,
                    ..Default::default()
                },
                &path,
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&read_only, &writable));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_collision_between_owners() {
        let dir = tempdir_with_files(1);
        let pool = FilePool::new(4);
        let path = dir.path().join("f0");
        let k = key(7, 0);

        pool.get_or_open(k, 1, OpenMode::default(), &path).unwrap();
        // A different owner asking to write the same file is a collision.
        let err = pool
            .get_or_open(
                k,
                2,
                OpenMode {
                    write: true,
                    ..Default::default()
                },
                &path,
            )
            .unwrap_err();
        assert!(matches!(err.kind, StorageErrorKind::FileCollision));
        // Two readers are fine.
        assert!(pool.get_or_open(k, 2, OpenMode::default(), &path).is_ok());
    }

    #[test]
    fn test_lru_eviction() {
        let dir = tempdir_with_files(3);
        let pool = FilePool::new(2);
        for i in 0..3 {
            pool.get_or_open(
                key(1, i),
                1,
                OpenMode::default(),
                &dir.path().join(format!("f{i}")),
            )
            .unwrap();
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_storage() {
        let dir = tempdir_with_files(2);
        let pool = FilePool::new(4);
        pool.get_or_open(key(1, 0), 1, OpenMode::default(), &dir.path().join("f0"))
            .unwrap();
        pool.get_or_open(key(2, 1), 2, OpenMode::default(), &dir.path().join("f1"))
            .unwrap();
        pool.release(StorageId(1));
        assert_eq!(pool.len(), 1);
    }
}
