//! The block cache: an ARC variant with ghost lists, block pinning and
//! per-piece job fences. Only disk workers touch it.

use std::collections::{HashMap, VecDeque};

use lru::LruCache;
use riptide_core::constants::BLOCK_SIZE;
use riptide_sha1::{Sha1, Sha1Engine};
use tracing::trace;

use super::DiskJob;
use crate::type_aliases::{PeerHandle, StorageId};

pub type CacheKey = (StorageId, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Pieces holding at least one dirty block.
    WriteLru,
    /// Tagged "do not retain": evicted before anything else.
    VolatileReadLru,
    /// Recency list.
    ReadLru1,
    ReadLru1Ghost,
    /// Frequency list: pieces re-read by a different requester.
    ReadLru2,
    ReadLru2Ghost,
}

impl CacheState {
    pub fn is_ghost(&self) -> bool {
        matches!(self, CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinReason {
    /// A send buffer or completion still references the block.
    Reading,
    /// The hash worker is consuming it.
    Hashing,
    /// A flush is in flight.
    Flushing,
}

/// Refcounted handle to a cached block, held outside the cache. Validated
/// against the piece generation on reclaim so stale handles are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub key: CacheKey,
    pub block: u16,
    pub generation: u32,
}

#[derive(Default)]
struct CachedBlock {
    buf: Option<Box<[u8]>>,
    refcount: u16,
    dirty: bool,
    /// Flush in flight.
    pending: bool,
}

struct PartialHash {
    hasher: Sha1,
    /// Bytes hashed so far, always a prefix of the piece.
    offset: u32,
}

pub struct CachedPiece {
    state: CacheState,
    blocks: Box<[CachedBlock]>,
    piece_len: u32,
    num_blocks: u16,
    num_dirty: u16,
    piece_refcount: u16,
    last_requester: Option<PeerHandle>,
    hash: Option<PartialHash>,
    fenced: bool,
    blocked_jobs: VecDeque<DiskJob>,
    outstanding_jobs: u16,
    marked_for_deletion: bool,
    generation: u32,
}

impl CachedPiece {
    fn new(blocks_in_piece: u16, piece_len: u32, state: CacheState, generation: u32) -> Self {
        let blocks = (0..blocks_in_piece)
            .map(|_| CachedBlock::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            state,
            blocks,
            piece_len,
            num_blocks: 0,
            num_dirty: 0,
            piece_refcount: 0,
            last_requester: None,
            hash: None,
            fenced: false,
            blocked_jobs: VecDeque::new(),
            outstanding_jobs: 0,
            marked_for_deletion: false,
            generation,
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn num_blocks(&self) -> u16 {
        self.num_blocks
    }

    pub fn num_dirty(&self) -> u16 {
        self.num_dirty
    }

    fn hash_offset(&self) -> u32 {
        self.hash.as_ref().map(|h| h.offset).unwrap_or(0)
    }

    fn is_pinned(&self) -> bool {
        self.piece_refcount > 0 || self.blocks.iter().any(|b| b.refcount > 0)
    }
}

/// Ordered set of cache keys: push to the MRU end, evict from the LRU end.
struct KeyList {
    inner: LruCache<CacheKey, ()>,
}

impl KeyList {
    fn new() -> Self {
        Self {
            inner: LruCache::unbounded(),
        }
    }

    fn push_mru(&mut self, key: CacheKey) {
        self.inner.put(key, ());
    }

    fn remove(&mut self, key: &CacheKey) {
        self.inner.pop(key);
    }

    fn pop_oldest(&mut self) -> Option<CacheKey> {
        self.inner.pop_lru().map(|(k, ())| k)
    }

    fn oldest(&self) -> Option<CacheKey> {
        self.inner.peek_lru().map(|(k, ())| *k)
    }

    fn oldest_first(&self) -> Vec<CacheKey> {
        // LruCache iterates MRU first.
        let mut keys: Vec<CacheKey> = self.inner.iter().map(|(k, ())| *k).collect();
        keys.reverse();
        keys
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// What the last cache operation was, biasing which list the next eviction
/// drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictBias {
    None,
    /// Miss inserted fresh: start with the larger read list.
    Miss,
    /// Ghost hit on lru1: lru1 looked too small, evict from lru2 first.
    GhostHitLru1,
    /// Ghost hit on lru2: the opposite.
    GhostHitLru2,
}

/// Result of a cache read.
pub enum ReadResult {
    /// Data copied out; the piece saw its ARC promotion.
    Hit(Vec<u8>),
    /// Not cached. A ghost entry may have been revived to live (empty).
    Miss,
}

pub struct BlockCache {
    map: HashMap<CacheKey, CachedPiece>,
    write_lru: KeyList,
    volatile_read_lru: KeyList,
    read_lru1: KeyList,
    read_lru1_ghost: KeyList,
    read_lru2: KeyList,
    read_lru2_ghost: KeyList,
    bias: EvictBias,
    /// Block-count cap from config.
    cache_size: usize,
    read_line_size: usize,
    read_cache_size: usize,
    write_cache_size: usize,
    generation: u32,
}

impl BlockCache {
    pub fn new(cache_size: usize, read_line_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            write_lru: KeyList::new(),
            volatile_read_lru: KeyList::new(),
            read_lru1: KeyList::new(),
            read_lru1_ghost: KeyList::new(),
            read_lru2: KeyList::new(),
            read_lru2_ghost: KeyList::new(),
            bias: EvictBias::None,
            cache_size,
            read_line_size,
            read_cache_size: 0,
            write_cache_size: 0,
            generation: 0,
        }
    }

    pub fn set_limits(&mut self, cache_size: usize, read_line_size: usize) {
        self.cache_size = cache_size;
        self.read_line_size = read_line_size;
    }

    fn ghost_bound(&self) -> usize {
        8usize.max(self.cache_size / self.read_line_size.max(4) / 2)
    }

    pub fn blocks_in_use(&self) -> usize {
        self.read_cache_size + self.write_cache_size
    }

    pub fn read_cache_size(&self) -> usize {
        self.read_cache_size
    }

    pub fn write_cache_size(&self) -> usize {
        self.write_cache_size
    }

    pub fn pinned_blocks(&self) -> usize {
        self.map
            .values()
            .map(|p| p.blocks.iter().filter(|b| b.refcount > 0).count())
            .sum()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CachedPiece> {
        self.map.get(key)
    }

    fn list_mut(&mut self, state: CacheState) -> &mut KeyList {
        match state {
            CacheState::WriteLru => &mut self.write_lru,
            CacheState::VolatileReadLru => &mut self.volatile_read_lru,
            CacheState::ReadLru1 => &mut self.read_lru1,
            CacheState::ReadLru1Ghost => &mut self.read_lru1_ghost,
            CacheState::ReadLru2 => &mut self.read_lru2,
            CacheState::ReadLru2Ghost => &mut self.read_lru2_ghost,
        }
    }

    fn move_to(&mut self, key: CacheKey, to: CacheState) {
        let from = match self.map.get_mut(&key) {
            Some(p) => {
                let from = p.state;
                p.state = to;
                from
            }
            None => return,
        };
        self.list_mut(from).remove(&key);
        self.list_mut(to).push_mru(key);
    }

    /// Look up or create the entry for a piece. A ghost entry is revived in
    /// place, keeping its list position semantics.
    pub fn allocate_piece(
        &mut self,
        key: CacheKey,
        blocks_in_piece: u16,
        piece_len: u32,
        state: CacheState,
    ) -> &mut CachedPiece {
        debug_assert!(!state.is_ghost());
        if !self.map.contains_key(&key) {
            self.generation = self.generation.wrapping_add(1);
            let piece = CachedPiece::new(blocks_in_piece, piece_len, state, self.generation);
            self.map.insert(key, piece);
            self.list_mut(state).push_mru(key);
            self.bias = EvictBias::Miss;
        }
        self.map.get_mut(&key).unwrap()
    }

    /// Insert one dirty block arriving from a peer. The piece lands on (or
    /// moves to) the write list. When the cache is saturated with data that
    /// cannot be evicted, the buffer comes back in the error so the caller
    /// can flush and retry.
    pub fn add_dirty_block(
        &mut self,
        key: CacheKey,
        block: u16,
        data: Box<[u8]>,
        blocks_in_piece: u16,
        piece_len: u32,
    ) -> Result<(), CacheFull> {
        if self.blocks_in_use() >= self.cache_size
            && self.try_evict_blocks(self.blocks_in_use() - self.cache_size + 1) == 0
        {
            return Err(CacheFull(data));
        }
        self.allocate_piece(key, blocks_in_piece, piece_len, CacheState::WriteLru);
        if self.map[&key].state != CacheState::WriteLru {
            self.move_to(key, CacheState::WriteLru);
        } else {
            self.write_lru.push_mru(key);
        }
        let piece = self.map.get_mut(&key).unwrap();
        let slot = &mut piece.blocks[block as usize];
        let had_buf = slot.buf.is_some();
        let was_dirty = slot.dirty;
        slot.buf = Some(data);
        slot.pending = false;
        if !had_buf {
            piece.num_blocks += 1;
            self.write_cache_size += 1;
        } else if !was_dirty {
            // A clean cached block is being overwritten by a fresh write.
            self.read_cache_size = self.read_cache_size.saturating_sub(1);
            self.write_cache_size += 1;
        }
        if !was_dirty {
            slot.dirty = true;
            piece.num_dirty += 1;
        }
        Ok(())
    }

    /// Insert blocks read back from storage (read-ahead fill). The piece
    /// lands in `read_lru1`, or `volatile_read_lru` when tagged volatile,
    /// unless it already lives in a warmer list.
    pub fn insert_blocks(
        &mut self,
        key: CacheKey,
        blocks: impl IntoIterator<Item = (u16, Box<[u8]>)>,
        blocks_in_piece: u16,
        piece_len: u32,
        volatile: bool,
        requester: Option<PeerHandle>,
    ) {
        let state = if volatile {
            CacheState::VolatileReadLru
        } else {
            CacheState::ReadLru1
        };
        self.allocate_piece(key, blocks_in_piece, piece_len, state);
        let piece = self.map.get_mut(&key).unwrap();
        if requester.is_some() {
            piece.last_requester = requester;
        }
        let mut added = 0usize;
        for (idx, data) in blocks {
            let slot = &mut piece.blocks[idx as usize];
            if slot.buf.is_none() {
                slot.buf = Some(data);
                piece.num_blocks += 1;
                added += 1;
            }
        }
        self.read_cache_size += added;
        // Keep within budget; freshly inserted blocks are MRU so they
        // survive this pass.
        if self.blocks_in_use() > self.cache_size {
            let over = self.blocks_in_use() - self.cache_size;
            self.try_evict_blocks(over);
        }
    }

    /// Cache read with the ARC promotion rules applied.
    pub fn try_read(
        &mut self,
        key: CacheKey,
        block: u16,
        requester: PeerHandle,
        volatile: bool,
    ) -> ReadResult {
        let Some(piece) = self.map.get_mut(&key) else {
            self.bias = EvictBias::Miss;
            return ReadResult::Miss;
        };

        match piece.state {
            CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost => {
                // Ghost hit: revive to the live list on the same side and
                // bias the next eviction toward the other side.
                let (live, bias) = if piece.state == CacheState::ReadLru1Ghost {
                    (CacheState::ReadLru1, EvictBias::GhostHitLru1)
                } else {
                    (CacheState::ReadLru2, EvictBias::GhostHitLru2)
                };
                piece.last_requester = Some(requester);
                self.move_to(key, live);
                self.bias = bias;
                trace!(?key, ?bias, "ghost hit");
                return ReadResult::Miss;
            }
            CacheState::ReadLru1 => {
                // Reuse by a *different* requester is the frequency signal;
                // one chatty peer re-reading does not count.
                let promote = match piece.last_requester {
                    Some(prev) => prev != requester,
                    None => true,
                };
                piece.last_requester = Some(requester);
                if promote {
                    self.move_to(key, CacheState::ReadLru2);
                } else {
                    self.read_lru1.push_mru(key);
                }
            }
            CacheState::ReadLru2 => {
                piece.last_requester = Some(requester);
                self.read_lru2.push_mru(key);
            }
            CacheState::VolatileReadLru => {
                piece.last_requester = Some(requester);
                if !volatile {
                    self.move_to(key, CacheState::ReadLru1);
                } else {
                    self.volatile_read_lru.push_mru(key);
                }
            }
            CacheState::WriteLru => {
                piece.last_requester = Some(requester);
                self.write_lru.push_mru(key);
            }
        }

        let piece = self.map.get_mut(&key).unwrap();
        match piece.blocks.get(block as usize).and_then(|b| b.buf.as_deref()) {
            Some(buf) => ReadResult::Hit(buf.to_vec()),
            None => {
                self.bias = EvictBias::Miss;
                ReadResult::Miss
            }
        }
    }

    /// Free at most `n` clean, unpinned blocks. Returns how many were
    /// freed. Dirty blocks are never touched here.
    pub fn try_evict_blocks(&mut self, n: usize) -> usize {
        let mut freed = 0usize;

        // Volatile pieces go first.
        freed += self.evict_from_read_list(CacheState::VolatileReadLru, n);
        if freed >= n {
            return freed;
        }

        let (first, second) = match self.bias {
            EvictBias::GhostHitLru1 => (CacheState::ReadLru2, CacheState::ReadLru1),
            EvictBias::GhostHitLru2 => (CacheState::ReadLru1, CacheState::ReadLru2),
            EvictBias::Miss => {
                if self.read_lru1.len() >= self.read_lru2.len() {
                    (CacheState::ReadLru1, CacheState::ReadLru2)
                } else {
                    (CacheState::ReadLru2, CacheState::ReadLru1)
                }
            }
            EvictBias::None => (CacheState::ReadLru1, CacheState::ReadLru2),
        };
        freed += self.evict_from_read_list(first, n - freed);
        if freed >= n {
            return freed;
        }
        freed += self.evict_from_read_list(second, n - freed);
        if freed >= n {
            return freed;
        }

        // Final pass: clean blocks parked on the write list. Blocks below
        // the partial-hash offset are preferred since they'll never be
        // needed for hashing again.
        for below_hash_cursor in [true, false] {
            for key in self.write_lru.oldest_first() {
                if freed >= n {
                    break;
                }
                let Some(piece) = self.map.get_mut(&key) else {
                    continue;
                };
                let hashed_blocks = (piece.hash_offset() / BLOCK_SIZE) as usize;
                for (idx, slot) in piece.blocks.iter_mut().enumerate() {
                    if freed >= n {
                        break;
                    }
                    if slot.dirty || slot.pending || slot.refcount > 0 || slot.buf.is_none() {
                        continue;
                    }
                    if below_hash_cursor && idx >= hashed_blocks {
                        continue;
                    }
                    slot.buf = None;
                    piece.num_blocks -= 1;
                    self.read_cache_size = self.read_cache_size.saturating_sub(1);
                    freed += 1;
                }
            }
        }
        freed
    }

    fn evict_from_read_list(&mut self, state: CacheState, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut freed = 0usize;
        for key in self.list_mut(state).oldest_first() {
            if freed >= n {
                break;
            }
            let Some(piece) = self.map.get_mut(&key) else {
                continue;
            };
            if piece.fenced || piece.piece_refcount > 0 {
                continue;
            }
            for slot in piece.blocks.iter_mut() {
                if freed >= n {
                    break;
                }
                if slot.dirty || slot.pending || slot.refcount > 0 || slot.buf.is_none() {
                    continue;
                }
                slot.buf = None;
                piece.num_blocks -= 1;
                self.read_cache_size = self.read_cache_size.saturating_sub(1);
                freed += 1;
            }
            if piece.num_blocks == 0 && !piece.is_pinned() {
                self.retire_empty_piece(key);
            }
        }
        freed
    }

    /// An emptied piece either becomes a ghost (read lists) or goes away
    /// entirely (write/volatile). Either way, outstanding block refs go
    /// stale: the generation is bumped.
    fn retire_empty_piece(&mut self, key: CacheKey) {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let Some(piece) = self.map.get_mut(&key) else {
            return;
        };
        piece.generation = generation;
        debug_assert_eq!(piece.num_blocks, 0);
        let state = piece.state;
        match state {
            CacheState::ReadLru1 => {
                self.move_to(key, CacheState::ReadLru1Ghost);
                self.bound_ghost(CacheState::ReadLru1Ghost);
            }
            CacheState::ReadLru2 => {
                self.move_to(key, CacheState::ReadLru2Ghost);
                self.bound_ghost(CacheState::ReadLru2Ghost);
            }
            state => {
                self.list_mut(state).remove(&key);
                self.map.remove(&key);
            }
        }
    }

    fn bound_ghost(&mut self, state: CacheState) {
        let bound = self.ghost_bound();
        while self.list_mut(state).len() > bound {
            if let Some(dropped) = self.list_mut(state).pop_oldest() {
                self.map.remove(&dropped);
            } else {
                break;
            }
        }
    }

    /// Mark flushed blocks clean and move their accounting from the write
    /// side to the read side.
    pub fn blocks_flushed(&mut self, key: CacheKey, blocks: &[u16]) {
        let Some(piece) = self.map.get_mut(&key) else {
            return;
        };
        let mut count = 0usize;
        for &idx in blocks {
            let slot = &mut piece.blocks[idx as usize];
            debug_assert!(slot.pending);
            if slot.dirty {
                slot.dirty = false;
                piece.num_dirty -= 1;
                count += 1;
            }
            slot.pending = false;
            if slot.refcount > 0 {
                slot.refcount -= 1; // Flushing pin
            }
        }
        self.write_cache_size = self.write_cache_size.saturating_sub(count);
        self.read_cache_size += count;
    }

    /// A flush failed: the blocks stay dirty, the in-flight markers and
    /// pins come off so the flush can be retried.
    pub fn flush_failed(&mut self, key: CacheKey, blocks: &[u16]) {
        let Some(piece) = self.map.get_mut(&key) else {
            return;
        };
        for &idx in blocks {
            if let Some(slot) = piece.blocks.get_mut(idx as usize) {
                if slot.pending {
                    slot.pending = false;
                    slot.refcount = slot.refcount.saturating_sub(1);
                }
            }
        }
    }

    /// Salted SHA-1 of every present block, in block order. The salt keeps
    /// digests session-local so recorded values cannot be replayed.
    pub fn salted_block_digests(&self, key: CacheKey, salt: u64) -> Vec<[u8; 20]> {
        let Some(piece) = self.map.get(&key) else {
            return Vec::new();
        };
        piece
            .blocks
            .iter()
            .map(|slot| {
                let mut h = Sha1::new();
                h.update(&salt.to_be_bytes());
                if let Some(buf) = &slot.buf {
                    h.update(buf);
                }
                h.finish()
            })
            .collect()
    }

    pub fn keys_of_storage(&self, storage: StorageId) -> Vec<CacheKey> {
        self.map.keys().filter(|k| k.0 == storage).copied().collect()
    }

    /// Whether any job is currently executing against this piece.
    pub fn piece_busy(&self, key: &CacheKey) -> bool {
        self.map.get(key).is_some_and(|p| p.outstanding_jobs > 0)
    }

    /// The least-recently-touched piece on the write list, the flush
    /// victim under cache pressure.
    pub fn oldest_write_piece(&self) -> Option<CacheKey> {
        self.write_lru.oldest()
    }

    /// Mark dirty blocks as having a flush in flight; pins each. Returns
    /// the block indices and buffer copies to write.
    pub fn begin_flush(&mut self, key: CacheKey) -> Vec<(u16, Vec<u8>)> {
        let Some(piece) = self.map.get_mut(&key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (idx, slot) in piece.blocks.iter_mut().enumerate() {
            if slot.dirty && !slot.pending {
                if let Some(buf) = &slot.buf {
                    slot.pending = true;
                    slot.refcount += 1; // Flushing pin
                    out.push((idx as u16, buf.to_vec()));
                }
            }
        }
        out
    }

    /// Abort dirty data (hash failure, torrent removal): drop dirty,
    /// unpinned blocks without writing them.
    pub fn abort_dirty(&mut self, key: CacheKey) {
        let Some(piece) = self.map.get_mut(&key) else {
            return;
        };
        let mut dropped = 0usize;
        for slot in piece.blocks.iter_mut() {
            if slot.dirty && !slot.pending && slot.refcount == 0 && slot.buf.is_some() {
                slot.buf = None;
                slot.dirty = false;
                piece.num_blocks -= 1;
                piece.num_dirty -= 1;
                dropped += 1;
            }
        }
        piece.hash = None;
        self.write_cache_size = self.write_cache_size.saturating_sub(dropped);
        if piece.num_blocks == 0 && !piece.is_pinned() {
            let state = piece.state;
            self.list_mut(state).remove(&key);
            self.map.remove(&key);
        }
    }

    /// Drop the whole piece if nothing pins it; otherwise mark it for
    /// deletion so the last unpin frees it.
    pub fn free_piece(&mut self, key: CacheKey) {
        let Some(piece) = self.map.get_mut(&key) else {
            return;
        };
        if piece.is_pinned() || piece.outstanding_jobs > 0 {
            piece.marked_for_deletion = true;
            return;
        }
        let state = piece.state;
        let clean = piece
            .blocks
            .iter()
            .filter(|b| b.buf.is_some() && !b.dirty)
            .count();
        let dirty = piece.num_dirty as usize;
        self.read_cache_size = self.read_cache_size.saturating_sub(clean);
        self.write_cache_size = self.write_cache_size.saturating_sub(dirty);
        self.list_mut(state).remove(&key);
        self.map.remove(&key);
    }

    pub fn mark_for_deletion(&mut self, key: CacheKey) {
        self.free_piece(key);
    }

    /// Evict a piece's buffers outright, moving read pieces to their ghost.
    pub fn evict_piece(&mut self, key: CacheKey) -> bool {
        let Some(piece) = self.map.get_mut(&key) else {
            return false;
        };
        if piece.is_pinned() || piece.num_dirty > 0 {
            return false;
        }
        let mut freed = 0usize;
        for slot in piece.blocks.iter_mut() {
            if slot.buf.take().is_some() {
                freed += 1;
            }
        }
        piece.num_blocks = 0;
        self.read_cache_size = self.read_cache_size.saturating_sub(freed);
        self.retire_empty_piece(key);
        true
    }

    pub fn inc_block_refcount(
        &mut self,
        key: CacheKey,
        block: u16,
        _reason: PinReason,
    ) -> Option<BlockRef> {
        let piece = self.map.get_mut(&key)?;
        let generation = piece.generation;
        let slot = piece.blocks.get_mut(block as usize)?;
        slot.buf.as_ref()?;
        slot.refcount += 1;
        Some(BlockRef {
            key,
            block,
            generation,
        })
    }

    pub fn dec_block_refcount(&mut self, key: CacheKey, block: u16, _reason: PinReason) {
        let Some(piece) = self.map.get_mut(&key) else {
            return;
        };
        if let Some(slot) = piece.blocks.get_mut(block as usize) {
            debug_assert!(slot.refcount > 0);
            slot.refcount = slot.refcount.saturating_sub(1);
        }
        if piece.marked_for_deletion && !piece.is_pinned() && piece.outstanding_jobs == 0 {
            self.free_piece(key);
        }
    }

    /// Return a handle taken with `inc_block_refcount`. Stale handles
    /// (piece re-allocated since) are ignored.
    pub fn reclaim_block(&mut self, block_ref: BlockRef) {
        let valid = self
            .map
            .get(&block_ref.key)
            .is_some_and(|p| p.generation == block_ref.generation);
        if valid {
            self.dec_block_refcount(block_ref.key, block_ref.block, PinReason::Reading);
        }
    }

    pub fn pin_piece(&mut self, key: CacheKey) {
        if let Some(piece) = self.map.get_mut(&key) {
            piece.piece_refcount += 1;
        }
    }

    pub fn unpin_piece(&mut self, key: CacheKey) {
        if let Some(piece) = self.map.get_mut(&key) {
            piece.piece_refcount = piece.piece_refcount.saturating_sub(1);
            if piece.marked_for_deletion && !piece.is_pinned() && piece.outstanding_jobs == 0 {
                self.free_piece(key);
            }
        }
    }

    // ---- fences ----

    pub fn raise_fence(&mut self, key: CacheKey) {
        if let Some(piece) = self.map.get_mut(&key) {
            piece.fenced = true;
        }
    }

    pub fn is_fenced(&self, key: &CacheKey) -> bool {
        self.map.get(key).is_some_and(|p| p.fenced)
    }

    /// Park a job behind the piece's fence.
    pub fn defer_job(&mut self, key: CacheKey, job: DiskJob) {
        if let Some(piece) = self.map.get_mut(&key) {
            piece.blocked_jobs.push_back(job);
        }
    }

    pub fn job_started(&mut self, key: CacheKey) {
        if let Some(piece) = self.map.get_mut(&key) {
            piece.outstanding_jobs += 1;
        }
    }

    /// Complete a job. When the last outstanding job on a fenced piece
    /// finishes, the fence drops and the parked jobs come back in FIFO
    /// order for re-scheduling.
    pub fn job_completed(&mut self, key: CacheKey) -> VecDeque<DiskJob> {
        let Some(piece) = self.map.get_mut(&key) else {
            return VecDeque::new();
        };
        piece.outstanding_jobs = piece.outstanding_jobs.saturating_sub(1);
        if piece.outstanding_jobs == 0 && piece.fenced {
            piece.fenced = false;
            let released = std::mem::take(&mut piece.blocked_jobs);
            if piece.marked_for_deletion && !piece.is_pinned() {
                self.free_piece(key);
            }
            return released;
        }
        if piece.marked_for_deletion && piece.outstanding_jobs == 0 && !piece.is_pinned() {
            self.free_piece(key);
        }
        VecDeque::new()
    }

    // ---- hash pipelining ----

    /// Advance the piece's running hash over clean blocks, in order from
    /// offset 0. Returns the digest once the whole piece has been hashed.
    pub fn update_partial_hash(&mut self, key: CacheKey) -> Option<[u8; 20]> {
        let piece = self.map.get_mut(&key)?;
        let mut partial = piece.hash.take().unwrap_or_else(|| PartialHash {
            hasher: Sha1::new(),
            offset: 0,
        });
        while partial.offset < piece.piece_len {
            let block_idx = (partial.offset / BLOCK_SIZE) as usize;
            let slot = &piece.blocks[block_idx];
            let extend = match &slot.buf {
                Some(buf) if !slot.dirty => buf,
                _ => break,
            };
            partial.hasher.update(extend);
            partial.offset += extend.len() as u32;
        }
        if partial.offset >= piece.piece_len {
            piece.hash = None;
            Some(partial.hasher.finish())
        } else {
            piece.hash = Some(partial);
            None
        }
    }
}

/// The cache cannot take another block right now; the rejected buffer is
/// handed back for a retry after flushing.
#[derive(Debug)]
pub struct CacheFull(pub Box<[u8]>);

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> PeerHandle {
        format!("10.0.0.{n}:6881").parse().unwrap()
    }

    fn key(piece: u32) -> CacheKey {
        (StorageId(1), piece)
    }

    fn block(fill: u8) -> Box<[u8]> {
        vec![fill; 16].into_boxed_slice()
    }

    fn cache() -> BlockCache {
        BlockCache::new(64, 4)
    }

    #[test]
    fn test_arc_promotion_same_vs_different_requester() {
        let mut c = cache();
        c.insert_blocks(key(5), [(0u16, block(1))], 2, 32768, false, Some(addr(1)));
        assert_eq!(c.get(&key(5)).unwrap().state(), CacheState::ReadLru1);

        // First read from X.
        assert!(matches!(
            c.try_read(key(5), 0, addr(1), false),
            ReadResult::Hit(_)
        ));
        // Same requester again: stays in lru1.
        assert!(matches!(
            c.try_read(key(5), 0, addr(1), false),
            ReadResult::Hit(_)
        ));
        assert_eq!(c.get(&key(5)).unwrap().state(), CacheState::ReadLru1);
        // Different requester: promoted to lru2.
        assert!(matches!(
            c.try_read(key(5), 0, addr(2), false),
            ReadResult::Hit(_)
        ));
        assert_eq!(c.get(&key(5)).unwrap().state(), CacheState::ReadLru2);
    }

    #[test]
    fn test_ghost_hit_revives_and_biases() {
        let mut c = cache();
        c.insert_blocks(key(7), [(0u16, block(1))], 1, 16384, false, None);
        // Evict everything: the emptied piece moves to the lru1 ghost.
        assert_eq!(c.try_evict_blocks(8), 1);
        assert_eq!(c.get(&key(7)).unwrap().state(), CacheState::ReadLru1Ghost);
        assert_eq!(c.blocks_in_use(), 0);

        // Accessing the ghost is a miss, but revives the entry to lru1.
        assert!(matches!(
            c.try_read(key(7), 0, addr(1), false),
            ReadResult::Miss
        ));
        assert_eq!(c.get(&key(7)).unwrap().state(), CacheState::ReadLru1);
        assert_eq!(c.bias, EvictBias::GhostHitLru1);

        // With the lru1-ghost bias, eviction prefers lru2.
        c.insert_blocks(key(7), [(0u16, block(1))], 1, 16384, false, None);
        // insert_blocks on an existing entry must not reset its state.
        assert_eq!(c.get(&key(7)).unwrap().state(), CacheState::ReadLru1);
    }

    #[test]
    fn test_eviction_bias_prefers_other_side_after_ghost_hit() {
        let mut c = cache();
        // One piece in lru1, one in lru2.
        c.insert_blocks(key(1), [(0u16, block(1))], 1, 16384, false, None);
        c.insert_blocks(key(2), [(0u16, block(2))], 1, 16384, false, Some(addr(1)));
        let _ = c.try_read(key(2), 0, addr(1), false);
        let _ = c.try_read(key(2), 0, addr(2), false); // promote 2 to lru2
        assert_eq!(c.get(&key(2)).unwrap().state(), CacheState::ReadLru2);

        c.bias = EvictBias::GhostHitLru1;
        // Evicting one block should come from lru2 (the other side).
        assert_eq!(c.try_evict_blocks(1), 1);
        assert_eq!(c.get(&key(2)).unwrap().num_blocks(), 0);
        assert_eq!(c.get(&key(1)).unwrap().num_blocks(), 1);
    }

    #[test]
    fn test_volatile_evicted_first_and_promotes_on_plain_access() {
        let mut c = cache();
        c.insert_blocks(key(1), [(0u16, block(1))], 1, 16384, true, None);
        c.insert_blocks(key(2), [(0u16, block(2))], 1, 16384, false, None);
        assert_eq!(c.get(&key(1)).unwrap().state(), CacheState::VolatileReadLru);

        // Volatile access does not promote.
        let _ = c.try_read(key(1), 0, addr(1), true);
        assert_eq!(c.get(&key(1)).unwrap().state(), CacheState::VolatileReadLru);

        // Eviction hits the volatile list first.
        assert_eq!(c.try_evict_blocks(1), 1);
        assert!(c.get(&key(1)).is_none(), "volatile pieces are erased, not ghosted");

        // A non-volatile access promotes a volatile piece to lru1.
        c.insert_blocks(key(3), [(0u16, block(3))], 1, 16384, true, None);
        let _ = c.try_read(key(3), 0, addr(1), false);
        assert_eq!(c.get(&key(3)).unwrap().state(), CacheState::ReadLru1);
    }

    #[test]
    fn test_pinned_blocks_are_never_evicted() {
        let mut c = cache();
        c.insert_blocks(key(1), [(0u16, block(1))], 1, 16384, false, None);
        let r = c
            .inc_block_refcount(key(1), 0, PinReason::Reading)
            .unwrap();
        assert_eq!(c.try_evict_blocks(10), 0);
        assert_eq!(c.blocks_in_use(), 1);
        c.reclaim_block(r);
        assert_eq!(c.try_evict_blocks(10), 1);
    }

    #[test]
    fn test_stale_block_ref_is_ignored() {
        let mut c = cache();
        c.insert_blocks(key(1), [(0u16, block(1))], 1, 16384, false, None);
        let r = c
            .inc_block_refcount(key(1), 0, PinReason::Reading)
            .unwrap();
        c.reclaim_block(r);
        c.try_evict_blocks(10);
        // Re-allocate the same piece; the old handle must not touch it.
        let _ = c.try_read(key(1), 0, addr(1), false); // revive ghost
        c.insert_blocks(key(1), [(0u16, block(9))], 1, 16384, false, None);
        let before = c.get(&key(1)).unwrap().num_blocks();
        c.reclaim_block(r); // stale generation
        assert_eq!(c.get(&key(1)).unwrap().num_blocks(), before);
    }

    #[test]
    fn test_dirty_blocks_never_evicted() {
        let mut c = cache();
        c.add_dirty_block(key(1), 0, block(1), 2, 32768).unwrap();
        assert_eq!(c.try_evict_blocks(10), 0);
        assert_eq!(c.write_cache_size(), 1);
        // Flush, then it becomes evictable via the write-list final pass.
        let batch = c.begin_flush(key(1));
        assert_eq!(batch.len(), 1);
        let indices: Vec<u16> = batch.iter().map(|(i, _)| *i).collect();
        c.blocks_flushed(key(1), &indices);
        assert_eq!(c.write_cache_size(), 0);
        assert_eq!(c.read_cache_size(), 1);
        assert_eq!(c.try_evict_blocks(10), 1);
    }

    #[test]
    fn test_accounting_invariant() {
        let mut c = BlockCache::new(8, 4);
        for p in 0..4u32 {
            c.add_dirty_block(key(p), 0, block(p as u8), 1, 16384).unwrap();
        }
        c.insert_blocks(key(10), [(0u16, block(9))], 1, 16384, false, None);
        assert!(c.read_cache_size() + c.write_cache_size() <= c.blocks_in_use());
        assert!(c.blocks_in_use() <= 8 + c.pinned_blocks());
    }

    #[test]
    fn test_cache_full_when_all_dirty() {
        let mut c = BlockCache::new(2, 4);
        c.add_dirty_block(key(1), 0, block(1), 1, 16384).unwrap();
        c.add_dirty_block(key(2), 0, block(2), 1, 16384).unwrap();
        let err = c.add_dirty_block(key(3), 0, block(3), 1, 16384).unwrap_err();
        // The rejected buffer comes back intact for a retry.
        assert_eq!(err.0.len(), 16);
    }

    #[test]
    fn test_fence_parks_and_releases_fifo() {
        let mut c = cache();
        c.allocate_piece(key(1), 1, 16384, CacheState::ReadLru1);
        c.job_started(key(1));
        c.raise_fence(key(1));
        assert!(c.is_fenced(&key(1)));

        c.defer_job(key(1), DiskJob::test_marker(1));
        c.defer_job(key(1), DiskJob::test_marker(2));

        let released = c.job_completed(key(1));
        assert!(!c.is_fenced(&key(1)));
        let order: Vec<u32> = released.iter().filter_map(DiskJob::marker_value).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_fence_holds_until_outstanding_drains() {
        let mut c = cache();
        c.allocate_piece(key(1), 1, 16384, CacheState::ReadLru1);
        c.job_started(key(1));
        c.job_started(key(1));
        c.raise_fence(key(1));
        c.defer_job(key(1), DiskJob::test_marker(7));
        assert!(c.job_completed(key(1)).is_empty());
        assert!(c.is_fenced(&key(1)));
        let released = c.job_completed(key(1));
        assert_eq!(released.len(), 1);
    }

    #[test]
    fn test_partial_hash_pipelines_in_order() {
        let mut c = cache();
        let piece_len = BLOCK_SIZE * 2 + 100;
        let b0 = vec![1u8; BLOCK_SIZE as usize].into_boxed_slice();
        let b1 = vec![2u8; BLOCK_SIZE as usize].into_boxed_slice();
        let b2 = vec![3u8; 100].into_boxed_slice();

        let mut expected = Sha1::new();
        expected.update(&b0);
        expected.update(&b1);
        expected.update(&b2);
        let expected = expected.finish();

        // Blocks become clean out of order: 0, 2, then 1.
        c.insert_blocks(key(1), [(0u16, b0)], 3, piece_len, false, None);
        assert!(c.update_partial_hash(key(1)).is_none());
        c.insert_blocks(key(1), [(2u16, b2)], 3, piece_len, false, None);
        // Block 1 is missing: hash stalls at its offset.
        assert!(c.update_partial_hash(key(1)).is_none());
        c.insert_blocks(key(1), [(1u16, b1)], 3, piece_len, false, None);
        assert_eq!(c.update_partial_hash(key(1)), Some(expected));
    }

    #[test]
    fn test_evict_piece_respects_pins_and_dirt() {
        let mut c = cache();
        c.insert_blocks(key(1), [(0u16, block(1))], 1, 16384, false, None);
        let r = c.inc_block_refcount(key(1), 0, PinReason::Reading).unwrap();
        assert!(!c.evict_piece(key(1)), "pinned piece must not evict");
        c.reclaim_block(r);
        assert!(c.evict_piece(key(1)));
        assert_eq!(c.get(&key(1)).unwrap().state(), CacheState::ReadLru1Ghost);
        assert_eq!(c.blocks_in_use(), 0);

        // A dirty piece refuses wholesale eviction too.
        c.add_dirty_block(key(2), 0, block(2), 1, 16384).unwrap();
        assert!(!c.evict_piece(key(2)));
    }

    #[test]
    fn test_ghost_bound() {
        let mut c = BlockCache::new(16, 4);
        // bound = max(8, 16/4/2) = 8
        for p in 0..12u32 {
            c.insert_blocks(key(p), [(0u16, block(p as u8))], 1, 16384, false, None);
            c.try_evict_blocks(1);
        }
        assert!(c.read_lru1_ghost.len() <= 8);
    }
}
