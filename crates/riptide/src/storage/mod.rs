pub mod file_pool;
pub mod resume;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use riptide_core::lengths::{Lengths, ValidPieceIndex};
use riptide_core::metainfo::MetaFile;
use tracing::debug;

use crate::config::ConfigHandle;
use crate::error::{StorageError, StorageErrorKind, StorageOp};
use crate::storage::file_pool::{FileKey, FilePool, OpenMode};
use crate::type_aliases::StorageId;

/// One file region a piece-space request maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub offset: u64,
    pub len: u64,
    pub padding: bool,
}

/// Map `(piece, offset, len)` onto file regions, crossing file boundaries
/// in torrent order. Pad files come back flagged so callers can skip the
/// I/O (writes) or zero-fill (reads).
pub fn map_request(
    files: &[MetaFile],
    lengths: &Lengths,
    piece: ValidPieceIndex,
    offset: u32,
    len: u64,
) -> Vec<FileSlice> {
    debug_assert!(offset as u64 + len <= lengths.piece_length(piece) as u64);
    let mut absolute = lengths.piece_offset(piece) + offset as u64;
    let mut remaining = len;
    let mut out = Vec::new();

    // First file containing `absolute`.
    let mut idx = files
        .partition_point(|f| f.offset_in_torrent + f.length <= absolute)
        .min(files.len());

    while remaining > 0 && idx < files.len() {
        let f = &files[idx];
        let in_file = absolute - f.offset_in_torrent;
        let slice_len = remaining.min(f.length - in_file);
        if slice_len > 0 {
            out.push(FileSlice {
                file_index: idx,
                offset: in_file,
                len: slice_len,
                padding: f.padding,
            });
        }
        absolute += slice_len;
        remaining -= slice_len;
        idx += 1;
    }
    out
}

/// Cached stat result from `initialize`, reused by resume verification.
#[derive(Debug, Clone, Copy)]
pub struct StatEntry {
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

struct FileState {
    root: PathBuf,
    /// Current relative paths; diverges from the descriptor after
    /// `rename_file` or resume-data `mapped_files`.
    paths: Vec<PathBuf>,
    /// 0 filters a file out of allocation entirely.
    priorities: Vec<u8>,
}

/// File-backed storage for one torrent.
pub struct FileStorage {
    storage_id: StorageId,
    /// Pool contention token; unique per storage instance.
    owner: u64,
    files: Vec<MetaFile>,
    lengths: Lengths,
    pool: Arc<FilePool>,
    config: Arc<ConfigHandle>,
    state: RwLock<FileState>,
    stat_cache: Mutex<Vec<Option<StatEntry>>>,
}

impl FileStorage {
    pub fn new(
        storage_id: StorageId,
        owner: u64,
        files: Vec<MetaFile>,
        lengths: Lengths,
        root: PathBuf,
        pool: Arc<FilePool>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        let paths = files.iter().map(|f| f.relative_path.clone()).collect();
        let priorities = vec![4u8; files.len()];
        let stat_cache = Mutex::new(vec![None; files.len()]);
        Self {
            storage_id,
            owner,
            files,
            lengths,
            pool,
            config,
            state: RwLock::new(FileState {
                root,
                paths,
                priorities,
            }),
            stat_cache,
        }
    }

    pub fn storage_id(&self) -> StorageId {
        self.storage_id
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn files(&self) -> &[MetaFile] {
        &self.files
    }

    pub fn set_file_priorities(&self, priorities: Vec<u8>) {
        let mut state = self.state.write();
        if priorities.len() == state.priorities.len() {
            state.priorities = priorities;
        }
    }

    fn full_path(&self, file_index: usize) -> PathBuf {
        let state = self.state.read();
        state.root.join(&state.paths[file_index])
    }

    fn open_mode(&self, write: bool) -> OpenMode {
        let cfg = self.config.load();
        OpenMode {
            write,
            lock_file: cfg.lock_files,
            no_atime: cfg.no_atime_storage,
        }
    }

    fn with_file<T>(
        &self,
        file_index: usize,
        write: bool,
        op: StorageOp,
        f: impl FnOnce(&File) -> std::io::Result<T>,
    ) -> Result<T, StorageError> {
        let key = FileKey {
            storage: self.storage_id,
            file_index,
        };
        let path = self.full_path(file_index);
        let file = self
            .pool
            .get_or_open(key, self.owner, self.open_mode(write), &path)?;
        f(&file).map_err(|e| StorageError::io(op, Some(file_index), e))
    }

    /// Stat/create/truncate every non-pad, non-filtered file. With
    /// `allocate`, files are grown to their declared size up front;
    /// otherwise they stay sparse and grow on write.
    pub fn initialize(&self, allocate: bool) -> Result<(), StorageError> {
        for (idx, meta) in self.files.iter().enumerate() {
            if meta.padding {
                continue;
            }
            if self.state.read().priorities[idx] == 0 {
                continue;
            }
            let path = self.full_path(idx);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io(StorageOp::Mkdir, Some(idx), e))?;
            }
            let existing = match std::fs::metadata(&path) {
                Ok(m) => Some(m),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(StorageError::io(StorageOp::Stat, Some(idx), e)),
            };
            match existing {
                Some(m) if m.len() > meta.length => {
                    // Truncate files that are larger than declared.
                    self.with_file(idx, true, StorageOp::Fallocate, |f| {
                        f.set_len(meta.length)
                    })?;
                }
                Some(_) => {}
                None => {
                    if allocate || meta.length == 0 {
                        self.with_file(idx, true, StorageOp::Fallocate, |f| {
                            if meta.length > 0 {
                                f.set_len(meta.length)?;
                            }
                            Ok(())
                        })?;
                    }
                }
            }
            // Cache the post-initialize stat for resume verification.
            if let Ok(m) = std::fs::metadata(&path) {
                self.stat_cache.lock()[idx] = Some(StatEntry {
                    size: m.len(),
                    mtime: m.modified().ok(),
                });
            }
        }
        debug!(storage = %self.storage_id, allocate, "storage initialized");
        Ok(())
    }

    pub fn stat(&self, file_index: usize) -> Result<Option<StatEntry>, StorageError> {
        let path = self.full_path(file_index);
        match std::fs::metadata(&path) {
            Ok(m) => {
                let entry = StatEntry {
                    size: m.len(),
                    mtime: m.modified().ok(),
                };
                self.stat_cache.lock()[file_index] = Some(entry);
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(StorageOp::Stat, Some(file_index), e)),
        }
    }

    /// Scatter-read into `bufs`. Pad regions are zero-filled without I/O.
    pub fn readv(
        &self,
        piece: ValidPieceIndex,
        offset: u32,
        bufs: &mut [&mut [u8]],
    ) -> Result<usize, StorageError> {
        let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        let slices = map_request(&self.files, &self.lengths, piece, offset, total);
        let coalesce = self.config.load().coalesce_reads;
        let mut cursor = BufCursor::new(bufs);
        for slice in &slices {
            if slice.padding {
                cursor.for_each_fragment(slice.len, |_pos, frag| {
                    frag.fill(0);
                    Ok(())
                })?;
            } else if coalesce && cursor.fragments_for(slice.len) > 1 {
                let mut scratch = vec![0u8; slice.len as usize];
                self.with_file(slice.file_index, false, StorageOp::Read, |f| {
                    pread_exact(f, slice.offset, &mut scratch)
                })?;
                let mut consumed = 0usize;
                cursor.for_each_fragment(slice.len, |_pos, frag| {
                    frag.copy_from_slice(&scratch[consumed..consumed + frag.len()]);
                    consumed += frag.len();
                    Ok(())
                })?;
            } else {
                let base = slice.offset;
                let file_index = slice.file_index;
                cursor.for_each_fragment(slice.len, |pos, frag| {
                    self.with_file(file_index, false, StorageOp::Read, |f| {
                        pread_exact(f, base + pos, frag)
                    })
                    .map_err(io_from_storage)
                })?;
            }
        }
        if self.config.load().disk_io_read_mode == crate::config::IoMode::DisableOsCache {
            self.drop_os_cache(&slices);
        }
        Ok(total as usize)
    }

    /// Tell the kernel we are done with this range when the OS cache is
    /// configured off. Buffers here are never aligned for true direct I/O,
    /// so the post-I/O advice is as far as the hint can go.
    fn drop_os_cache(&self, slices: &[FileSlice]) {
        #[cfg(unix)]
        for slice in slices.iter().filter(|s| !s.padding) {
            let _ = self.with_file(slice.file_index, false, StorageOp::Read, |f| {
                use std::os::unix::io::AsRawFd;
                unsafe {
                    libc::posix_fadvise(
                        f.as_raw_fd(),
                        slice.offset as libc::off_t,
                        slice.len as libc::off_t,
                        libc::POSIX_FADV_DONTNEED,
                    );
                }
                Ok(())
            });
        }
        #[cfg(not(unix))]
        let _ = slices;
    }

    /// Gather-write from `bufs`. Pad regions are skipped without I/O.
    pub fn writev(
        &self,
        piece: ValidPieceIndex,
        offset: u32,
        bufs: &[&[u8]],
    ) -> Result<usize, StorageError> {
        let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        let slices = map_request(&self.files, &self.lengths, piece, offset, total);
        let coalesce = self.config.load().coalesce_writes;
        let mut cursor = ReadCursor::new(bufs);
        for slice in &slices {
            if slice.padding {
                cursor.skip(slice.len);
            } else if coalesce && cursor.fragments_for(slice.len) > 1 {
                let mut scratch = Vec::with_capacity(slice.len as usize);
                cursor.for_each_fragment(slice.len, |frag| {
                    scratch.extend_from_slice(frag);
                });
                self.with_file(slice.file_index, true, StorageOp::Write, |f| {
                    pwrite_all(f, slice.offset, &scratch)
                })?;
            } else {
                let base = slice.offset;
                let file_index = slice.file_index;
                let mut pos = 0u64;
                let mut result = Ok(());
                cursor.for_each_fragment(slice.len, |frag| {
                    if result.is_ok() {
                        result = self.with_file(file_index, true, StorageOp::Write, |f| {
                            pwrite_all(f, base + pos, frag)
                        });
                        pos += frag.len() as u64;
                    }
                });
                result?;
            }
        }
        if self.config.load().disk_io_write_mode == crate::config::IoMode::DisableOsCache {
            self.drop_os_cache(&slices);
        }
        Ok(total as usize)
    }

    /// Advise the OS a read is coming.
    pub fn hint_read(&self, piece: ValidPieceIndex, offset: u32, len: u64) {
        let slices = map_request(&self.files, &self.lengths, piece, offset, len);
        for slice in slices.iter().filter(|s| !s.padding) {
            #[cfg(unix)]
            {
                let _ = self.with_file(slice.file_index, false, StorageOp::Read, |f| {
                    use std::os::unix::io::AsRawFd;
                    unsafe {
                        libc::posix_fadvise(
                            f.as_raw_fd(),
                            slice.offset as libc::off_t,
                            slice.len as libc::off_t,
                            libc::POSIX_FADV_WILLNEED,
                        );
                    }
                    Ok(())
                });
            }
            #[cfg(not(unix))]
            let _ = slice;
        }
    }

    /// Where a piece-space byte lives. When the filesystem can't report a
    /// physical block, this is the logical offset within the torrent, which
    /// keeps the reorder pass monotonic.
    pub fn physical_offset(&self, piece: ValidPieceIndex, offset: u32) -> u64 {
        self.lengths.piece_offset(piece) + offset as u64
    }

    pub fn has_any_file(&self) -> Result<bool, StorageError> {
        for (idx, meta) in self.files.iter().enumerate() {
            if meta.padding {
                continue;
            }
            if let Some(stat) = self.stat(idx)? {
                if stat.size > 0 || meta.length == 0 {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn rename_file(&self, file_index: usize, new_name: &Path) -> Result<(), StorageError> {
        if file_index >= self.files.len() {
            return Err(StorageError::new(
                StorageOp::Rename,
                Some(file_index),
                StorageErrorKind::MismatchingNumberOfFiles,
            ));
        }
        self.pool.evict(FileKey {
            storage: self.storage_id,
            file_index,
        });
        let old_path = self.full_path(file_index);
        let new_path = self.state.read().root.join(new_name);
        if old_path.exists() {
            if let Some(parent) = new_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io(StorageOp::Mkdir, Some(file_index), e))?;
            }
            std::fs::rename(&old_path, &new_path)
                .map_err(|e| StorageError::io(StorageOp::Rename, Some(file_index), e))?;
        }
        self.state.write().paths[file_index] = new_name.to_path_buf();
        Ok(())
    }

    pub fn move_storage(&self, new_root: &Path) -> Result<(), StorageError> {
        self.pool.release(self.storage_id);
        std::fs::create_dir_all(new_root)
            .map_err(|e| StorageError::io(StorageOp::Mkdir, None, e))?;
        let mut state = self.state.write();
        for (idx, rel) in state.paths.iter().enumerate() {
            if self.files[idx].padding {
                continue;
            }
            let from = state.root.join(rel);
            if !from.exists() {
                continue;
            }
            let to = new_root.join(rel);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io(StorageOp::Mkdir, Some(idx), e))?;
            }
            std::fs::rename(&from, &to)
                .map_err(|e| StorageError::io(StorageOp::Rename, Some(idx), e))?;
        }
        state.root = new_root.to_path_buf();
        Ok(())
    }

    pub fn release_files(&self) {
        self.pool.release(self.storage_id);
    }

    pub fn delete_files(&self) -> Result<(), StorageError> {
        self.pool.release(self.storage_id);
        let state = self.state.read();
        for (idx, rel) in state.paths.iter().enumerate() {
            if self.files[idx].padding {
                continue;
            }
            let path = state.root.join(rel);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(StorageOp::Remove, Some(idx), e)),
            }
            // Prune now-empty parent directories up to the root.
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == state.root || std::fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        Ok(())
    }
}

fn io_from_storage(e: StorageError) -> std::io::Error {
    match e.kind {
        StorageErrorKind::Io(io) => io,
        other => std::io::Error::other(other.to_string()),
    }
}

/// Walks a scatter list of mutable buffers as one logical byte stream.
struct BufCursor<'a, 'b> {
    bufs: &'a mut [&'b mut [u8]],
    buf_idx: usize,
    buf_off: usize,
}

impl<'a, 'b> BufCursor<'a, 'b> {
    fn new(bufs: &'a mut [&'b mut [u8]]) -> Self {
        Self {
            bufs,
            buf_idx: 0,
            buf_off: 0,
        }
    }

    /// How many separate fragments the next `len` bytes span.
    fn fragments_for(&self, len: u64) -> usize {
        let mut remaining = len;
        let mut idx = self.buf_idx;
        let mut off = self.buf_off;
        let mut count = 0;
        while remaining > 0 && idx < self.bufs.len() {
            let avail = (self.bufs[idx].len() - off) as u64;
            let take = avail.min(remaining);
            if take > 0 {
                count += 1;
            }
            remaining -= take;
            idx += 1;
            off = 0;
        }
        count
    }

    /// Visit the fragments covering the next `len` bytes. The callback gets
    /// the byte position relative to the start of this call.
    fn for_each_fragment(
        &mut self,
        len: u64,
        mut f: impl FnMut(u64, &mut [u8]) -> std::io::Result<()>,
    ) -> Result<(), StorageError> {
        let mut remaining = len;
        let mut pos = 0u64;
        while remaining > 0 {
            debug_assert!(self.buf_idx < self.bufs.len(), "request exceeds buffers");
            let buf = &mut self.bufs[self.buf_idx];
            let avail = buf.len() - self.buf_off;
            let take = (avail as u64).min(remaining) as usize;
            if take > 0 {
                f(pos, &mut buf[self.buf_off..self.buf_off + take])
                    .map_err(|e| StorageError::io(StorageOp::Read, None, e))?;
            }
            pos += take as u64;
            remaining -= take as u64;
            self.buf_off += take;
            if self.buf_off == buf.len() {
                self.buf_idx += 1;
                self.buf_off = 0;
            }
        }
        Ok(())
    }
}

/// Read-side twin of [`BufCursor`].
struct ReadCursor<'a, 'b> {
    bufs: &'a [&'b [u8]],
    buf_idx: usize,
    buf_off: usize,
}

impl<'a, 'b> ReadCursor<'a, 'b> {
    fn new(bufs: &'a [&'b [u8]]) -> Self {
        Self {
            bufs,
            buf_idx: 0,
            buf_off: 0,
        }
    }

    fn fragments_for(&self, len: u64) -> usize {
        let mut remaining = len;
        let mut idx = self.buf_idx;
        let mut off = self.buf_off;
        let mut count = 0;
        while remaining > 0 && idx < self.bufs.len() {
            let avail = (self.bufs[idx].len() - off) as u64;
            let take = avail.min(remaining);
            if take > 0 {
                count += 1;
            }
            remaining -= take;
            idx += 1;
            off = 0;
        }
        count
    }

    fn skip(&mut self, len: u64) {
        self.for_each_fragment(len, |_| {});
    }

    fn for_each_fragment(&mut self, len: u64, mut f: impl FnMut(&[u8])) {
        let mut remaining = len;
        while remaining > 0 {
            debug_assert!(self.buf_idx < self.bufs.len(), "request exceeds buffers");
            let buf = self.bufs[self.buf_idx];
            let avail = buf.len() - self.buf_off;
            let take = (avail as u64).min(remaining) as usize;
            if take > 0 {
                f(&buf[self.buf_off..self.buf_off + take]);
            }
            remaining -= take as u64;
            self.buf_off += take;
            if self.buf_off == buf.len() {
                self.buf_idx += 1;
                self.buf_off = 0;
            }
        }
    }
}

#[cfg(unix)]
fn pread_exact(f: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn pwrite_all(f: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pread_exact(f: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = f.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite_all(f: &File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = f.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// The storage backends a torrent can run on. `Disabled` rejects all I/O
/// (torrent paused/aborted); `ZeroFilled` reads zeros and swallows writes
/// (used while draining jobs after removal, and by tests).
pub enum StorageVariant {
    Default(FileStorage),
    Disabled,
    ZeroFilled(Lengths),
}

impl StorageVariant {
    pub fn readv(
        &self,
        piece: ValidPieceIndex,
        offset: u32,
        bufs: &mut [&mut [u8]],
    ) -> Result<usize, StorageError> {
        match self {
            StorageVariant::Default(s) => s.readv(piece, offset, bufs),
            StorageVariant::Disabled => Err(StorageError::new(
                StorageOp::Read,
                None,
                StorageErrorKind::StorageDisabled,
            )),
            StorageVariant::ZeroFilled(_) => {
                let mut total = 0;
                for buf in bufs.iter_mut() {
                    buf.fill(0);
                    total += buf.len();
                }
                Ok(total)
            }
        }
    }

    pub fn writev(
        &self,
        piece: ValidPieceIndex,
        offset: u32,
        bufs: &[&[u8]],
    ) -> Result<usize, StorageError> {
        match self {
            StorageVariant::Default(s) => s.writev(piece, offset, bufs),
            StorageVariant::Disabled => Err(StorageError::new(
                StorageOp::Write,
                None,
                StorageErrorKind::StorageDisabled,
            )),
            StorageVariant::ZeroFilled(_) => Ok(bufs.iter().map(|b| b.len()).sum()),
        }
    }

    pub fn physical_offset(&self, piece: ValidPieceIndex, offset: u32) -> u64 {
        match self {
            StorageVariant::Default(s) => s.physical_offset(piece, offset),
            StorageVariant::Disabled => 0,
            StorageVariant::ZeroFilled(lengths) => lengths.piece_offset(piece) + offset as u64,
        }
    }

    pub fn hint_read(&self, piece: ValidPieceIndex, offset: u32, len: u64) {
        if let StorageVariant::Default(s) = self {
            s.hint_read(piece, offset, len)
        }
    }

    pub fn release_files(&self) {
        if let StorageVariant::Default(s) = self {
            s.release_files()
        }
    }

    pub fn delete_files(&self) -> Result<(), StorageError> {
        match self {
            StorageVariant::Default(s) => s.delete_files(),
            _ => Ok(()),
        }
    }

    pub fn as_file_storage(&self) -> Option<&FileStorage> {
        match self {
            StorageVariant::Default(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StorageVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageVariant::Default(s) => write!(f, "FileStorage({})", s.storage_id),
            StorageVariant::Disabled => write!(f, "Disabled"),
            StorageVariant::ZeroFilled(_) => write!(f, "ZeroFilled"),
        }
    }
}
