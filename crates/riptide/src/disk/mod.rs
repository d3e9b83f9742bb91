//! The disk subsystem: a bounded pool of worker threads owning the block
//! cache and the storage backends. The network side talks to it through
//! [`DiskHandle`] only; completions travel back over per-job channels and
//! the shared event channel.

pub mod cache;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use riptide_core::constants::BLOCK_SIZE;
use riptide_core::lengths::BlockInfo;
use riptide_core::metainfo::Metainfo;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::ConfigHandle;
use crate::error::{StorageError, StorageErrorKind, StorageOp};
use crate::storage::StorageVariant;
use crate::storage::resume::ResumeCheck;
use crate::type_aliases::{BF, PeerHandle, StorageId};

use self::cache::{BlockCache, CacheKey, ReadResult};

/// One torrent as the disk side sees it.
pub struct DiskTorrent {
    pub storage: RwLock<StorageVariant>,
    pub meta: Arc<Metainfo>,
    /// Per-torrent random salt for the block digests handed to the
    /// ban logic. Prevents digest replay across sessions.
    pub salt: u64,
}

type Ack<T> = oneshot::Sender<Result<T, StorageError>>;

pub enum JobKind {
    WriteBlock {
        block: BlockInfo,
        data: Box<[u8]>,
        from: PeerHandle,
        done: Ack<()>,
    },
    ReadBlock {
        block: BlockInfo,
        requester: PeerHandle,
        volatile: bool,
        done: Ack<Vec<u8>>,
    },
    HintRead {
        block: BlockInfo,
    },
    /// Drop a piece's dirty data (hash failure, deselection). Fenced.
    ClearPiece {
        piece: u32,
    },
    FlushPiece {
        piece: u32,
    },
    Initialize {
        allocate: bool,
        done: Ack<()>,
    },
    VerifyResume {
        blob: Vec<u8>,
        done: Ack<ResumeCheck>,
    },
    WriteResume {
        have: BF,
        done: Ack<Vec<u8>>,
    },
    RenameFile {
        file_index: usize,
        new_name: PathBuf,
        done: Ack<()>,
    },
    MoveStorage {
        new_root: PathBuf,
        done: Ack<()>,
    },
    ReleaseFiles,
    /// Tear the torrent down: fence busy pieces, drop cached state, swap
    /// the storage out, optionally delete the files.
    Abort {
        delete_files: bool,
        done: Ack<()>,
    },
    #[cfg(test)]
    Marker(u32),
}

pub struct DiskJob {
    pub storage: StorageId,
    pub kind: JobKind,
}

impl DiskJob {
    /// The piece this job serializes against, if any. Only piece-targeted
    /// jobs participate in fencing.
    fn piece_target(&self) -> Option<u32> {
        match &self.kind {
            JobKind::WriteBlock { block, .. }
            | JobKind::ReadBlock { block, .. }
            | JobKind::HintRead { block } => Some(block.piece_index.get()),
            JobKind::ClearPiece { piece } | JobKind::FlushPiece { piece } => Some(*piece),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_marker(n: u32) -> Self {
        DiskJob {
            storage: StorageId(0),
            kind: JobKind::Marker(n),
        }
    }

    #[cfg(test)]
    pub(crate) fn marker_value(&self) -> Option<u32> {
        match self.kind {
            JobKind::Marker(n) => Some(n),
            _ => None,
        }
    }
}

/// Completions that concern the torrent rather than a single requester.
#[derive(Debug)]
pub enum DiskEvent {
    /// A piece finished hashing. `digests` holds one salted digest per
    /// block, in block order, for contributor attribution.
    PieceHashed {
        storage: StorageId,
        piece: u32,
        ok: bool,
        digests: Vec<[u8; 20]>,
    },
    Error {
        storage: StorageId,
        error: StorageError,
    },
}

struct Shared {
    queue: Mutex<VecDeque<DiskJob>>,
    cond: Condvar,
    cache: Mutex<BlockCache>,
    torrents: RwLock<std::collections::HashMap<StorageId, Arc<DiskTorrent>>>,
    events: mpsc::UnboundedSender<DiskEvent>,
    config: Arc<ConfigHandle>,
    shutdown: AtomicBool,
}

/// Cloneable handle the network side uses to talk to the disk pool.
#[derive(Clone)]
pub struct DiskHandle {
    shared: Arc<Shared>,
}

pub struct DiskIo {
    shared: Arc<Shared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl DiskIo {
    pub fn spawn(
        config: Arc<ConfigHandle>,
        events: mpsc::UnboundedSender<DiskEvent>,
    ) -> (Self, DiskHandle) {
        let cfg = config.load();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            cache: Mutex::new(BlockCache::new(cfg.cache_size, cfg.read_cache_line_size)),
            torrents: RwLock::new(Default::default()),
            events,
            config,
            shutdown: AtomicBool::new(false),
        });
        let n = cfg.disk_threads.max(1);
        let workers = (0..n)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("disk-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawning disk worker")
            })
            .collect();
        (
            DiskIo {
                shared: shared.clone(),
                workers,
            },
            DiskHandle { shared },
        )
    }

    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Drop for DiskIo {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
    }
}

impl DiskHandle {
    pub fn register_torrent(&self, storage_id: StorageId, torrent: DiskTorrent) {
        self.shared
            .torrents
            .write()
            .insert(storage_id, Arc::new(torrent));
    }

    pub fn submit(&self, job: DiskJob) {
        let mut queue = self.shared.queue.lock();
        // Reads may be sorted by physical offset among themselves; the
        // per-piece ordering guarantee only covers writes.
        let reorder = matches!(job.kind, JobKind::ReadBlock { .. })
            && self.shared.config.load().allow_reordered_disk_operations;
        if reorder {
            let key = read_sort_key(&job);
            let mut at = queue.len();
            while at > 0 {
                let prev = &queue[at - 1];
                match read_sort_key(prev) {
                    Some(prev_key) if prev.storage == job.storage && prev_key > key.unwrap() => {
                        at -= 1;
                    }
                    _ => break,
                }
            }
            queue.insert(at, job);
        } else {
            queue.push_back(job);
        }
        drop(queue);
        self.shared.cond.notify_one();
    }

    pub fn write_block(
        &self,
        storage: StorageId,
        block: BlockInfo,
        data: Box<[u8]>,
        from: PeerHandle,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::WriteBlock {
                block,
                data,
                from,
                done,
            },
        });
        rx
    }

    pub fn read_block(
        &self,
        storage: StorageId,
        block: BlockInfo,
        requester: PeerHandle,
        volatile: bool,
    ) -> oneshot::Receiver<Result<Vec<u8>, StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::ReadBlock {
                block,
                requester,
                volatile,
                done,
            },
        });
        rx
    }

    pub fn initialize(
        &self,
        storage: StorageId,
        allocate: bool,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::Initialize { allocate, done },
        });
        rx
    }

    pub fn verify_resume(
        &self,
        storage: StorageId,
        blob: Vec<u8>,
    ) -> oneshot::Receiver<Result<ResumeCheck, StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::VerifyResume { blob, done },
        });
        rx
    }

    pub fn write_resume(
        &self,
        storage: StorageId,
        have: BF,
    ) -> oneshot::Receiver<Result<Vec<u8>, StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::WriteResume { have, done },
        });
        rx
    }

    pub fn clear_piece(&self, storage: StorageId, piece: u32) {
        self.submit(DiskJob {
            storage,
            kind: JobKind::ClearPiece { piece },
        });
    }

    pub fn hint_read(&self, storage: StorageId, block: BlockInfo) {
        self.submit(DiskJob {
            storage,
            kind: JobKind::HintRead { block },
        });
    }

    pub fn rename_file(
        &self,
        storage: StorageId,
        file_index: usize,
        new_name: PathBuf,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::RenameFile {
                file_index,
                new_name,
                done,
            },
        });
        rx
    }

    pub fn move_storage(
        &self,
        storage: StorageId,
        new_root: PathBuf,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::MoveStorage { new_root, done },
        });
        rx
    }

    pub fn release_files(&self, storage: StorageId) {
        self.submit(DiskJob {
            storage,
            kind: JobKind::ReleaseFiles,
        });
    }

    pub fn abort_torrent(
        &self,
        storage: StorageId,
        delete_files: bool,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (done, rx) = oneshot::channel();
        self.submit(DiskJob {
            storage,
            kind: JobKind::Abort { delete_files, done },
        });
        rx
    }
}

/// Monotone stand-in for the physical offset: logical position within the
/// torrent, which tracks it for every backend we have.
fn read_sort_key(job: &DiskJob) -> Option<(u32, u32)> {
    match &job.kind {
        JobKind::ReadBlock { block, .. } => Some((block.piece_index.get(), block.offset)),
        _ => None,
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.cond.wait(&mut queue);
            }
        };
        process_job(&shared, job);
    }
}

fn process_job(shared: &Shared, job: DiskJob) {
    let torrent = shared.torrents.read().get(&job.storage).cloned();
    let Some(torrent) = torrent else {
        trace!(storage = %job.storage, "job for unregistered storage dropped");
        // Any cache state the job targets is torn down and its waiter told.
        if let Some(piece) = job.piece_target() {
            let key: CacheKey = (job.storage, piece);
            let mut cache = shared.cache.lock();
            cache.abort_dirty(key);
            cache.free_piece(key);
        }
        fail_job(job);
        return;
    };

    // Fenced pieces defer their jobs instead of consuming a worker.
    if let Some(piece) = job.piece_target() {
        let key: CacheKey = (job.storage, piece);
        let mut cache = shared.cache.lock();
        if cache.is_fenced(&key) {
            trace!(?key, "piece fenced, deferring job");
            cache.defer_job(key, job);
            return;
        }
        cache.job_started(key);
        drop(cache);

        execute(shared, &torrent, job);

        let released = shared.cache.lock().job_completed(key);
        if !released.is_empty() {
            let mut queue = shared.queue.lock();
            for j in released {
                queue.push_back(j);
            }
            drop(queue);
            shared.cond.notify_all();
        }
    } else {
        execute(shared, &torrent, job);
    }
}

fn execute(shared: &Shared, torrent: &DiskTorrent, job: DiskJob) {
    let storage_id = job.storage;
    match job.kind {
        JobKind::WriteBlock {
            block,
            data,
            from,
            done,
        } => {
            let result = handle_write(shared, torrent, storage_id, block, data, from);
            match result {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(e) => {
                    report_error(shared, storage_id, &e);
                    let _ = done.send(Err(e));
                }
            }
        }
        JobKind::ReadBlock {
            block,
            requester,
            volatile,
            done,
        } => {
            let result = handle_read(shared, torrent, storage_id, block, requester, volatile);
            if let Err(e) = &result {
                report_error(shared, storage_id, e);
            }
            let _ = done.send(result);
        }
        JobKind::HintRead { block } => {
            torrent.storage.read().hint_read(
                block.piece_index,
                block.offset,
                block.size as u64,
            );
        }
        JobKind::ClearPiece { piece } => {
            let key = (storage_id, piece);
            let mut cache = shared.cache.lock();
            cache.abort_dirty(key);
            cache.free_piece(key);
        }
        JobKind::FlushPiece { piece } => {
            if let Err(e) = flush_piece(shared, torrent, (storage_id, piece)) {
                report_error(shared, storage_id, &e);
            }
        }
        JobKind::Initialize { allocate, done } => {
            let result = match &*torrent.storage.read() {
                StorageVariant::Default(fs) => fs.initialize(allocate),
                _ => Ok(()),
            };
            if let Err(e) = &result {
                report_error(shared, storage_id, e);
            }
            let _ = done.send(result);
        }
        JobKind::VerifyResume { blob, done } => {
            let result = match &*torrent.storage.read() {
                StorageVariant::Default(fs) => fs.verify_resume_data(&blob),
                _ => Err(StorageError::new(
                    StorageOp::CheckResume,
                    None,
                    StorageErrorKind::StorageDisabled,
                )),
            };
            let _ = done.send(result);
        }
        JobKind::WriteResume { have, done } => {
            // Settle dirty data first so sizes and mtimes are final.
            let keys = piece_keys_of(shared, storage_id);
            for key in keys {
                if let Err(e) = flush_piece(shared, torrent, key) {
                    let _ = done.send(Err(e));
                    return;
                }
            }
            let result = match &*torrent.storage.read() {
                StorageVariant::Default(fs) => fs.write_resume_data(&have),
                _ => Err(StorageError::new(
                    StorageOp::CheckResume,
                    None,
                    StorageErrorKind::StorageDisabled,
                )),
            };
            let _ = done.send(result);
        }
        JobKind::RenameFile {
            file_index,
            new_name,
            done,
        } => {
            let result = match &*torrent.storage.read() {
                StorageVariant::Default(fs) => fs.rename_file(file_index, &new_name),
                _ => Ok(()),
            };
            let _ = done.send(result);
        }
        JobKind::MoveStorage { new_root, done } => {
            let result = match &*torrent.storage.read() {
                StorageVariant::Default(fs) => fs.move_storage(&new_root),
                _ => Ok(()),
            };
            if let Err(e) = &result {
                report_error(shared, storage_id, e);
            }
            let _ = done.send(result);
        }
        JobKind::ReleaseFiles => {
            torrent.storage.read().release_files();
        }
        JobKind::Abort { delete_files, done } => {
            let result = handle_abort(shared, torrent, storage_id, delete_files);
            let _ = done.send(result);
        }
        #[cfg(test)]
        JobKind::Marker(_) => {}
    }
}

/// Answer the waiter of a job that will never run.
fn fail_job(job: DiskJob) {
    use JobKind::*;
    fn aborted<T>(op: StorageOp) -> Result<T, StorageError> {
        Err(StorageError::new(op, None, StorageErrorKind::Aborted))
    }
    match job.kind {
        WriteBlock { done, .. } => {
            let _ = done.send(aborted(StorageOp::Write));
        }
        Initialize { done, .. } => {
            let _ = done.send(aborted(StorageOp::Fallocate));
        }
        RenameFile { done, .. } => {
            let _ = done.send(aborted(StorageOp::Rename));
        }
        MoveStorage { done, .. } => {
            let _ = done.send(aborted(StorageOp::Rename));
        }
        Abort { done, .. } => {
            let _ = done.send(aborted(StorageOp::Remove));
        }
        ReadBlock { done, .. } => {
            let _ = done.send(aborted(StorageOp::Read));
        }
        VerifyResume { done, .. } => {
            let _ = done.send(aborted(StorageOp::CheckResume));
        }
        WriteResume { done, .. } => {
            let _ = done.send(aborted(StorageOp::CheckResume));
        }
        HintRead { .. } | ClearPiece { .. } | FlushPiece { .. } | ReleaseFiles => {}
        #[cfg(test)]
        Marker(_) => {}
    }
}

fn report_error(shared: &Shared, storage: StorageId, error: &StorageError) {
    warn!(%storage, %error, "disk job failed");
    let _ = shared.events.send(DiskEvent::Error {
        storage,
        error: error.duplicate(),
    });
}

fn piece_keys_of(shared: &Shared, storage: StorageId) -> Vec<CacheKey> {
    shared.cache.lock().keys_of_storage(storage)
}

fn handle_write(
    shared: &Shared,
    torrent: &DiskTorrent,
    storage_id: StorageId,
    block: BlockInfo,
    data: Box<[u8]>,
    from: PeerHandle,
) -> Result<(), StorageError> {
    debug_assert_eq!(data.len(), block.size as usize);
    let key: CacheKey = (storage_id, block.piece_index.get());
    let lengths = torrent.meta.lengths;
    let blocks_in_piece = lengths.blocks_per_piece(block.piece_index) as u16;
    let piece_len = lengths.piece_length(block.piece_index);
    let block_index = block.block_index as u16;

    fn oom() -> StorageError {
        StorageError::new(StorageOp::Write, None, StorageErrorKind::OutOfMemory)
    }

    let complete = {
        let mut cache = shared.cache.lock();
        match cache.add_dirty_block(key, block_index, data, blocks_in_piece, piece_len) {
            Ok(()) => cache.get(&key).expect("just inserted").num_blocks() == blocks_in_piece,
            Err(cache::CacheFull(rejected)) => {
                // Saturated with dirty data: flush the oldest write piece
                // and retry once.
                let victim = cache.oldest_write_piece();
                drop(cache);
                let victim = victim.filter(|v| *v != key).ok_or_else(oom)?;
                flush_piece(shared, torrent, victim)?;
                let mut cache = shared.cache.lock();
                cache.try_evict_blocks(1);
                match cache.add_dirty_block(key, block_index, rejected, blocks_in_piece, piece_len)
                {
                    Ok(()) => {
                        cache.get(&key).expect("just inserted").num_blocks() == blocks_in_piece
                    }
                    Err(_) => return Err(oom()),
                }
            }
        }
    };

    trace!(%storage_id, piece = block.piece_index.get(), block = block.block_index, %from, complete, "block written to cache");

    if complete {
        flush_piece(shared, torrent, key)?;
        finish_hash(shared, torrent, storage_id, key)?;
    }
    Ok(())
}

/// Write every dirty block of the piece to storage and mark it clean.
fn flush_piece(
    shared: &Shared,
    torrent: &DiskTorrent,
    key: CacheKey,
) -> Result<(), StorageError> {
    let batch = shared.cache.lock().begin_flush(key);
    if batch.is_empty() {
        return Ok(());
    }
    let lengths = torrent.meta.lengths;
    let piece = lengths
        .validate_piece_index(key.1)
        .expect("cached piece index is valid");

    let coalesce = shared.config.load().coalesce_writes;
    let storage = torrent.storage.read();
    let result = (|| {
        let mut i = 0;
        while i < batch.len() {
            // Coalesce contiguous runs into one vectored write.
            let mut j = i + 1;
            while coalesce && j < batch.len() && batch[j].0 == batch[j - 1].0 + 1 {
                j += 1;
            }
            let offset = batch[i].0 as u32 * BLOCK_SIZE;
            let bufs: Vec<&[u8]> = batch[i..j].iter().map(|(_, d)| d.as_slice()).collect();
            let write = storage.writev(piece, offset, &bufs);
            match write {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    // Missing file: create it and retry once.
                    if let StorageVariant::Default(fs) = &*storage {
                        fs.initialize(false)?;
                    }
                    storage.writev(piece, offset, &bufs)?;
                }
                Err(e) => return Err(e),
            }
            i = j;
        }
        Ok(())
    })();
    drop(storage);

    let indices: Vec<u16> = batch.iter().map(|(i, _)| *i).collect();
    let mut cache = shared.cache.lock();
    match &result {
        Ok(()) => cache.blocks_flushed(key, &indices),
        Err(_) => cache.flush_failed(key, &indices),
    }
    result
}

/// Advance the partial hash; when the piece digest lands, verify it and
/// publish the outcome.
fn finish_hash(
    shared: &Shared,
    torrent: &DiskTorrent,
    storage_id: StorageId,
    key: CacheKey,
) -> Result<(), StorageError> {
    let (digest, salted) = {
        let mut cache = shared.cache.lock();
        let digest = cache.update_partial_hash(key);
        let salted = match digest {
            Some(_) => cache.salted_block_digests(key, torrent.salt),
            None => Vec::new(),
        };
        (digest, salted)
    };
    let Some(digest) = digest else {
        return Ok(());
    };

    let expected = torrent.meta.piece_hash(key.1);
    let ok = expected.is_some_and(|e| e.0 == digest);
    debug!(%storage_id, piece = key.1, ok, "piece hashed");

    if !ok {
        // The cache entry is garbage now; drop it so the piece can be
        // fetched again.
        let mut cache = shared.cache.lock();
        cache.abort_dirty(key);
        cache.free_piece(key);
    }
    let _ = shared.events.send(DiskEvent::PieceHashed {
        storage: storage_id,
        piece: key.1,
        ok,
        digests: salted,
    });
    Ok(())
}

fn handle_read(
    shared: &Shared,
    torrent: &DiskTorrent,
    storage_id: StorageId,
    block: BlockInfo,
    requester: PeerHandle,
    volatile: bool,
) -> Result<Vec<u8>, StorageError> {
    let key: CacheKey = (storage_id, block.piece_index.get());
    if let ReadResult::Hit(data) =
        shared
            .cache
            .lock()
            .try_read(key, block.block_index as u16, requester, volatile)
    {
        return Ok(data);
    }

    // Miss: read a cache line worth of blocks starting at the requested
    // one, prime the cache, and answer from the local buffer.
    let lengths = torrent.meta.lengths;
    let blocks_in_piece = lengths.blocks_per_piece(block.piece_index) as u16;
    let piece_len = lengths.piece_length(block.piece_index);
    let line = shared.config.load().read_cache_line_size.max(1) as u32;
    let first = block.block_index;
    let last = (first + line).min(blocks_in_piece as u32);

    let mut buffers: Vec<(u16, Box<[u8]>)> = Vec::with_capacity((last - first) as usize);
    for idx in first..last {
        let info = lengths
            .block_info(block.piece_index, idx)
            .expect("block index within piece");
        buffers.push((idx as u16, vec![0u8; info.size as usize].into_boxed_slice()));
    }
    {
        let storage = torrent.storage.read();
        let mut slices: Vec<&mut [u8]> = buffers.iter_mut().map(|(_, b)| &mut b[..]).collect();
        storage.readv(block.piece_index, block.offset, &mut slices)?;
    }

    let answer = buffers
        .first()
        .map(|(_, b)| b.to_vec())
        .expect("at least the requested block");
    shared.cache.lock().insert_blocks(
        key,
        buffers,
        blocks_in_piece,
        piece_len,
        volatile,
        Some(requester),
    );
    Ok(answer)
}

fn handle_abort(
    shared: &Shared,
    torrent: &DiskTorrent,
    storage_id: StorageId,
    delete_files: bool,
) -> Result<(), StorageError> {
    // Fence every busy piece so in-flight jobs drain before their state
    // disappears; quiet pieces are dropped immediately.
    {
        let mut cache = shared.cache.lock();
        for key in cache.keys_of_storage(storage_id) {
            if cache.piece_busy(&key) {
                cache.raise_fence(key);
                cache.defer_job(
                    key,
                    DiskJob {
                        storage: storage_id,
                        kind: JobKind::ClearPiece { piece: key.1 },
                    },
                );
            } else {
                cache.abort_dirty(key);
                cache.free_piece(key);
            }
        }
    }
    let old = {
        let mut storage = torrent.storage.write();
        std::mem::replace(&mut *storage, StorageVariant::ZeroFilled(torrent.meta.lengths))
    };
    let result = if delete_files {
        old.delete_files()
    } else {
        old.release_files();
        Ok(())
    };
    shared.torrents.write().remove(&storage_id);
    debug!(%storage_id, delete_files, "torrent storage aborted");
    result
}
