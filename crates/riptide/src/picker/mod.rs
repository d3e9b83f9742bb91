//! The piece picker: decides which block each peer should request next,
//! given rarity, in-flight state, parole status and end-game constraints.
//!
//! Candidate pieces live in a flat array partitioned into priority buckets;
//! order inside a bucket is randomized so a swarm of peers with the same
//! view does not stampede the same piece.

use rand::Rng;
use rand::seq::SliceRandom;
use riptide_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};
use tracing::trace;

use crate::type_aliases::{BF, PeerHandle};

const NOT_PLACED: u32 = u32::MAX;
const PRIO_LEVELS: u32 = 8;
pub const DEFAULT_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    None,
    Requested,
    Writing,
    Finished,
}

/// Transfer-rate class of a peer; a downloading piece is locked to the
/// class of its first requester so slow and fast peers don't share pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceSpeed {
    #[default]
    None,
    Slow,
    Medium,
    Fast,
}

#[derive(Debug, Clone, Default)]
struct BlockSlot {
    state: BlockState,
    /// Peers with an outstanding request for this block; above 1 only
    /// during end-game.
    num_peers: u16,
    last_peer: Option<PeerHandle>,
}

#[derive(Debug)]
pub struct DownloadingPiece {
    pub index: u32,
    pub speed: PieceSpeed,
    blocks: Box<[BlockSlot]>,
    pub requested: u16,
    pub writing: u16,
    pub finished: u16,
}

impl DownloadingPiece {
    fn new(index: u32, blocks_in_piece: u16) -> Self {
        Self {
            index,
            speed: PieceSpeed::None,
            blocks: vec![BlockSlot::default(); blocks_in_piece as usize].into_boxed_slice(),
            requested: 0,
            writing: 0,
            finished: 0,
        }
    }

    /// True when no other peer than `peer` has touched any block.
    fn exclusive_to(&self, peer: PeerHandle) -> bool {
        self.blocks
            .iter()
            .all(|b| b.state == BlockState::None || b.last_peer == Some(peer))
    }

    fn has_other_requester(&self, peer: PeerHandle) -> bool {
        self.blocks
            .iter()
            .any(|b| b.state != BlockState::None && b.last_peer != Some(peer))
    }

    pub fn block_state(&self, block: u32) -> BlockState {
        self.blocks[block as usize].state
    }

    pub fn block_peer(&self, block: u32) -> Option<PeerHandle> {
        self.blocks[block as usize].last_peer
    }

    fn non_none_blocks(&self) -> u16 {
        self.requested + self.writing + self.finished
    }
}

#[derive(Debug, Clone, Copy)]
struct PiecePos {
    peer_count: u16,
    priority: u8,
    downloading: bool,
    have: bool,
    /// Position in `pieces`, or NOT_PLACED.
    index: u32,
}

pub struct PiecePicker {
    piece_map: Vec<PiecePos>,
    /// Candidate pieces, partitioned into priority buckets.
    pieces: Vec<u32>,
    /// `priority_boundaries[b]` is one past the end of bucket `b`.
    priority_boundaries: Vec<u32>,
    downloads: Vec<DownloadingPiece>,
    lengths: Lengths,
    /// Connected peers that have everything; counts toward availability
    /// of every piece without a per-piece walk.
    seeds: u32,
    num_have: u32,
    have_bits: BF,
    dirty: bool,
    sequential: bool,
}

impl PiecePicker {
    pub fn new(lengths: Lengths) -> Self {
        let n = lengths.total_pieces() as usize;
        Self {
            piece_map: vec![
                PiecePos {
                    peer_count: 0,
                    priority: DEFAULT_PRIORITY,
                    downloading: false,
                    have: false,
                    index: NOT_PLACED,
                };
                n
            ],
            pieces: Vec::new(),
            priority_boundaries: Vec::new(),
            downloads: Vec::new(),
            lengths,
            seeds: 0,
            num_have: 0,
            have_bits: BF::repeat(false, n),
            dirty: false,
            sequential: false,
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.lengths.total_pieces()
    }

    pub fn num_have(&self) -> u32 {
        self.num_have
    }

    pub fn is_seed(&self) -> bool {
        self.num_have == self.num_pieces()
    }

    pub fn have_bitfield(&self) -> &BF {
        &self.have_bits
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.piece_map
            .get(piece as usize)
            .map(|p| p.have)
            .unwrap_or(false)
    }

    pub fn is_downloading(&self, piece: u32) -> bool {
        self.piece_map
            .get(piece as usize)
            .map(|p| p.downloading)
            .unwrap_or(false)
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        if self.sequential && !sequential {
            // Bucket placement went stale while sequential mode ignored it.
            self.dirty = true;
        }
        self.sequential = sequential;
    }

    pub fn downloads(&self) -> &[DownloadingPiece] {
        &self.downloads
    }

    // ---- priority bucket machinery ----

    /// Bucket index for a piece, None when it is not a candidate. Lower
    /// bucket = picked sooner: rarity dominates, user priority breaks
    /// ties, a downloading piece beats its equal-rarity siblings.
    fn bucket_of(&self, piece: u32) -> Option<u32> {
        let p = &self.piece_map[piece as usize];
        let avail = p.peer_count as u32 + self.seeds;
        if p.have || p.priority == 0 || avail == 0 {
            return None;
        }
        // Top user priority disregards availability entirely.
        if p.priority == 7 {
            return Some(if p.downloading { 0 } else { 1 });
        }
        // Low priorities weigh availability double, pushing them back.
        let (avail, prio) = if p.priority < DEFAULT_PRIORITY {
            (avail * 2, p.priority as u32 + 3)
        } else {
            (avail, p.priority as u32)
        };
        if p.downloading {
            return Some(avail * PRIO_LEVELS);
        }
        Some(avail * PRIO_LEVELS + (PRIO_LEVELS - 1 - prio))
    }

    fn priority_range(&self, bucket: usize) -> (usize, usize) {
        let start = if bucket == 0 {
            0
        } else {
            self.priority_boundaries[bucket - 1] as usize
        };
        (start, self.priority_boundaries[bucket] as usize)
    }

    /// Place a candidate piece at a random slot of its bucket, rippling
    /// the displaced first element of every later bucket along.
    fn add(&mut self, piece: u32) {
        debug_assert!(!self.dirty);
        let Some(bucket) = self.bucket_of(piece) else {
            return;
        };
        let bucket = bucket as usize;
        while self.priority_boundaries.len() <= bucket {
            self.priority_boundaries.push(self.pieces.len() as u32);
        }
        let (start, end) = self.priority_range(bucket);
        let mut new_index = if end == start {
            start
        } else {
            rand::rng().random_range(start..=end)
        };
        self.pieces.push(NOT_PLACED);

        let mut index = piece;
        let mut bucket = bucket;
        loop {
            let displaced = self.pieces[new_index];
            self.pieces[new_index] = index;
            self.piece_map[index as usize].index = new_index as u32;
            index = displaced;
            let mut temp;
            loop {
                temp = self.priority_boundaries[bucket] as usize;
                self.priority_boundaries[bucket] += 1;
                bucket += 1;
                if !(temp == new_index && bucket < self.priority_boundaries.len()) {
                    break;
                }
            }
            new_index = temp;
            if bucket >= self.priority_boundaries.len() {
                break;
            }
        }
        if index != NOT_PLACED {
            debug_assert_eq!(new_index, self.pieces.len() - 1);
            self.pieces[new_index] = index;
            self.piece_map[index as usize].index = new_index as u32;
        }
    }

    /// Remove the element at `elem_index` (which belongs to `bucket`),
    /// closing the gap by pulling the first element of each later bucket
    /// back.
    fn remove(&mut self, bucket: usize, elem_index: usize) {
        debug_assert!(!self.dirty);
        let mut bucket = bucket;
        let mut elem_index = elem_index;
        let mut next_index = elem_index;
        loop {
            let mut temp;
            loop {
                self.priority_boundaries[bucket] -= 1;
                temp = self.priority_boundaries[bucket] as usize;
                bucket += 1;
                if !(next_index == temp && bucket < self.priority_boundaries.len()) {
                    break;
                }
            }
            if next_index == temp {
                break;
            }
            next_index = temp;
            let piece = self.pieces[next_index];
            self.pieces[elem_index] = piece;
            self.piece_map[piece as usize].index = elem_index as u32;
            elem_index = next_index;
            if bucket == self.priority_boundaries.len() {
                break;
            }
        }
        self.pieces.pop();
        debug_assert_eq!(next_index, self.pieces.len());
    }

    /// Re-place one piece after its state changed. `mutate` applies the
    /// change; placement is fixed up around it.
    fn update_piece(&mut self, piece: u32, mutate: impl FnOnce(&mut PiecePos)) {
        if self.dirty || self.sequential {
            mutate(&mut self.piece_map[piece as usize]);
            return;
        }
        let old_bucket = self.bucket_of(piece);
        let elem = self.piece_map[piece as usize].index;
        mutate(&mut self.piece_map[piece as usize]);
        let new_bucket = self.bucket_of(piece);
        match (old_bucket, new_bucket) {
            (Some(o), Some(n)) if o == n => {}
            (Some(o), _) => {
                debug_assert_ne!(elem, NOT_PLACED);
                self.piece_map[piece as usize].index = NOT_PLACED;
                self.remove(o as usize, elem as usize);
                if new_bucket.is_some() {
                    self.add(piece);
                }
            }
            (None, Some(_)) => self.add(piece),
            (None, None) => {}
        }
    }

    /// Rebuild the bucket array from scratch and shuffle each bucket.
    /// Used after mass updates set the dirty flag.
    fn rebuild(&mut self) {
        self.pieces.clear();
        self.priority_boundaries.clear();
        let buckets: Vec<Option<u32>> = (0..self.piece_map.len() as u32)
            .map(|p| self.bucket_of(p))
            .collect();
        let max_bucket = match buckets.iter().flatten().max() {
            Some(m) => *m as usize,
            None => {
                for pos in self.piece_map.iter_mut() {
                    pos.index = NOT_PLACED;
                }
                self.dirty = false;
                return;
            }
        };
        let mut counts = vec![0u32; max_bucket + 1];
        for b in buckets.iter().flatten() {
            counts[*b as usize] += 1;
        }
        let mut running = 0u32;
        self.priority_boundaries = counts
            .iter()
            .map(|c| {
                running += c;
                running
            })
            .collect();
        self.pieces.resize(running as usize, NOT_PLACED);
        let mut cursors: Vec<u32> = std::iter::once(0)
            .chain(self.priority_boundaries.iter().copied())
            .take(counts.len())
            .collect();
        for (piece, bucket) in buckets.iter().enumerate() {
            match bucket {
                Some(b) => {
                    let at = cursors[*b as usize];
                    cursors[*b as usize] += 1;
                    self.pieces[at as usize] = piece as u32;
                    self.piece_map[piece].index = at;
                }
                None => self.piece_map[piece].index = NOT_PLACED,
            }
        }
        // Randomize within each bucket.
        let mut rng = rand::rng();
        for b in 0..self.priority_boundaries.len() {
            let (start, end) = self.priority_range(b);
            self.pieces[start..end].shuffle(&mut rng);
            for i in start..end {
                let piece = self.pieces[i];
                self.piece_map[piece as usize].index = i as u32;
            }
        }
        self.dirty = false;
        trace!(
            candidates = self.pieces.len(),
            buckets = self.priority_boundaries.len(),
            "picker rebuilt"
        );
    }

    // ---- availability ----

    pub fn inc_refcount(&mut self, piece: u32) {
        self.update_piece(piece, |p| p.peer_count += 1);
    }

    pub fn dec_refcount(&mut self, piece: u32) {
        self.update_piece(piece, |p| p.peer_count = p.peer_count.saturating_sub(1));
    }

    /// A whole bitfield arrived or left: too many single updates, rebuild
    /// lazily instead.
    pub fn inc_refcount_bitfield(&mut self, bits: &BF) {
        for piece in bits.iter_ones() {
            if let Some(p) = self.piece_map.get_mut(piece) {
                p.peer_count += 1;
            }
        }
        self.dirty = true;
    }

    pub fn dec_refcount_bitfield(&mut self, bits: &BF) {
        for piece in bits.iter_ones() {
            if let Some(p) = self.piece_map.get_mut(piece) {
                p.peer_count = p.peer_count.saturating_sub(1);
            }
        }
        self.dirty = true;
    }

    /// A seed connected: every piece gets one more source.
    pub fn inc_seed_count(&mut self) {
        self.seeds += 1;
        self.dirty = true;
    }

    pub fn dec_seed_count(&mut self) {
        self.seeds = self.seeds.saturating_sub(1);
        self.dirty = true;
    }

    pub fn set_piece_priority(&mut self, piece: u32, priority: u8) {
        let priority = priority.min(7);
        self.update_piece(piece, |p| p.priority = priority);
    }

    pub fn piece_priority(&self, piece: u32) -> u8 {
        self.piece_map[piece as usize].priority
    }

    // ---- have-state ----

    /// The piece verified: it leaves candidacy for good. Calling this for
    /// a piece already recorded does nothing.
    pub fn we_have(&mut self, piece: u32) {
        if self.piece_map[piece as usize].have {
            return;
        }
        self.remove_download(piece);
        self.update_piece(piece, |p| {
            p.have = true;
            p.downloading = false;
        });
        self.have_bits.set(piece as usize, true);
        self.num_have += 1;
    }

    /// A verified piece was lost (corruption found later).
    pub fn we_dont_have(&mut self, piece: u32) {
        if !self.piece_map[piece as usize].have {
            return;
        }
        self.update_piece(piece, |p| p.have = false);
        self.have_bits.set(piece as usize, false);
        self.num_have -= 1;
    }

    // ---- block state machine ----

    fn download_index(&self, piece: u32) -> Option<usize> {
        self.downloads.iter().position(|d| d.index == piece)
    }

    fn remove_download(&mut self, piece: u32) {
        if let Some(i) = self.download_index(piece) {
            self.downloads.swap_remove(i);
        }
    }

    fn ensure_download(&mut self, piece: u32, speed: PieceSpeed) -> usize {
        match self.download_index(piece) {
            Some(i) => i,
            None => {
                let index = self
                    .lengths
                    .validate_piece_index(piece)
                    .expect("picker piece index valid");
                let blocks = self.lengths.blocks_per_piece(index) as u16;
                let mut dp = DownloadingPiece::new(piece, blocks);
                // The class is fixed at first request.
                dp.speed = speed;
                self.downloads.push(dp);
                self.update_piece(piece, |p| p.downloading = true);
                self.downloads.len() - 1
            }
        }
    }

    /// `none -> requested`. Creates the downloading entry on first use.
    pub fn mark_as_downloading(
        &mut self,
        block: BlockInfo,
        peer: PeerHandle,
        speed: PieceSpeed,
    ) -> bool {
        let piece = block.piece_index.get();
        let i = self.ensure_download(piece, speed);
        let dp = &mut self.downloads[i];
        let slot = &mut dp.blocks[block.block_index as usize];
        match slot.state {
            BlockState::None => {
                slot.state = BlockState::Requested;
                slot.num_peers = 1;
                slot.last_peer = Some(peer);
                dp.requested += 1;
                true
            }
            BlockState::Requested => {
                // End-game: a second peer races the same block.
                slot.num_peers += 1;
                slot.last_peer = Some(peer);
                true
            }
            _ => false,
        }
    }

    /// `requested -> writing`: the payload arrived and went to disk. The
    /// racing-peers accounting resets.
    pub fn mark_as_writing(&mut self, block: BlockInfo, peer: PeerHandle) -> bool {
        let piece = block.piece_index.get();
        let Some(i) = self.download_index(piece) else {
            return false;
        };
        let dp = &mut self.downloads[i];
        let slot = &mut dp.blocks[block.block_index as usize];
        if slot.state != BlockState::Requested {
            return false;
        }
        slot.state = BlockState::Writing;
        slot.num_peers = 0;
        slot.last_peer = Some(peer);
        dp.requested -= 1;
        dp.writing += 1;
        true
    }

    /// `writing -> finished`: durable within this session.
    pub fn mark_as_finished(&mut self, block: BlockInfo) {
        let piece = block.piece_index.get();
        let Some(i) = self.download_index(piece) else {
            return;
        };
        let dp = &mut self.downloads[i];
        let slot = &mut dp.blocks[block.block_index as usize];
        match slot.state {
            BlockState::Writing => {
                slot.state = BlockState::Finished;
                dp.writing -= 1;
                dp.finished += 1;
            }
            BlockState::Requested => {
                // Fast path for writes acknowledged before the explicit
                // writing transition was recorded.
                slot.state = BlockState::Finished;
                slot.num_peers = 0;
                dp.requested -= 1;
                dp.finished += 1;
            }
            _ => {}
        }
    }

    /// `writing -> requested | none`: the disk write failed.
    pub fn write_failed(&mut self, block: BlockInfo) {
        let piece = block.piece_index.get();
        let Some(i) = self.download_index(piece) else {
            return;
        };
        let dp = &mut self.downloads[i];
        let slot = &mut dp.blocks[block.block_index as usize];
        if slot.state != BlockState::Writing {
            return;
        }
        dp.writing -= 1;
        if slot.num_peers > 0 {
            slot.state = BlockState::Requested;
            dp.requested += 1;
        } else {
            slot.state = BlockState::None;
            slot.last_peer = None;
        }
        self.maybe_clear_download(piece);
    }

    /// A peer went away or timed out with this block outstanding.
    pub fn abort_download(&mut self, block: BlockInfo, peer: PeerHandle) {
        let piece = block.piece_index.get();
        let Some(i) = self.download_index(piece) else {
            return;
        };
        let dp = &mut self.downloads[i];
        let slot = &mut dp.blocks[block.block_index as usize];
        if slot.state != BlockState::Requested {
            return;
        }
        slot.num_peers = slot.num_peers.saturating_sub(1);
        if slot.last_peer == Some(peer) {
            slot.last_peer = None;
        }
        if slot.num_peers == 0 {
            slot.state = BlockState::None;
            dp.requested -= 1;
        }
        self.maybe_clear_download(piece);
    }

    fn maybe_clear_download(&mut self, piece: u32) {
        let Some(i) = self.download_index(piece) else {
            return;
        };
        if self.downloads[i].non_none_blocks() == 0 {
            self.downloads.swap_remove(i);
            self.update_piece(piece, |p| p.downloading = false);
        }
    }

    /// The piece failed verification: name the contributor of every block,
    /// then put the piece back up for grabs.
    pub fn piece_failed(&mut self, piece: u32) -> Vec<Option<PeerHandle>> {
        let contributors = match self.download_index(piece) {
            Some(i) => self.downloads[i]
                .blocks
                .iter()
                .map(|b| b.last_peer)
                .collect(),
            None => Vec::new(),
        };
        self.remove_download(piece);
        self.update_piece(piece, |p| p.downloading = false);
        contributors
    }

    /// Sum of non-none blocks across downloading pieces; the picker's own
    /// books must agree with it.
    pub fn count_requested_blocks(&self) -> usize {
        self.downloads
            .iter()
            .map(|d| d.non_none_blocks() as usize)
            .sum()
    }

    // ---- picking ----

    fn can_pick(&self, piece: u32, peer_bits: &BF) -> bool {
        let p = &self.piece_map[piece as usize];
        !p.have
            && !p.downloading
            && p.priority != 0
            && peer_bits.get(piece as usize).map(|b| *b).unwrap_or(false)
    }

    fn push_piece_blocks(&self, piece: u32, out: &mut Vec<BlockInfo>) {
        let index = self.lengths.validate_piece_index(piece).unwrap();
        out.extend(self.lengths.iter_blocks(index));
    }

    /// Choose up to `n_blocks` blocks for `peer` to request.
    ///
    /// Preference order: partially-downloaded pieces the peer can serve,
    /// then suggested pieces, then new pieces (rarest-first bucket walk,
    /// or a random starting offset), then whatever landed on the backup
    /// list. Parole peers only touch pieces nobody else contributed to,
    /// and cross-speed-class picks are deferred to backup.
    #[allow(clippy::too_many_arguments)]
    pub fn pick_pieces(
        &mut self,
        peer_bits: &BF,
        n_blocks: usize,
        prefer_whole: usize,
        peer: PeerHandle,
        speed: PieceSpeed,
        rarest_first: bool,
        on_parole: bool,
        suggested: &[u32],
    ) -> Vec<BlockInfo> {
        if self.dirty && !self.sequential {
            self.rebuild();
        }
        let mut picked: Vec<BlockInfo> = Vec::new();
        let mut backup: Vec<BlockInfo> = Vec::new();
        let mut endgame: Vec<BlockInfo> = Vec::new();

        // Phase 1: pieces already in flight.
        for dp in &self.downloads {
            if picked.len() >= n_blocks {
                break;
            }
            if !peer_bits.get(dp.index as usize).map(|b| *b).unwrap_or(false) {
                continue;
            }
            if self.piece_map[dp.index as usize].priority == 0 {
                continue;
            }
            let exclusive = dp.exclusive_to(peer);
            if on_parole && !exclusive {
                continue;
            }
            let speed_match = dp.speed == speed || exclusive;
            let defer_whole = prefer_whole > 0 && dp.has_other_requester(peer);
            let index = self.lengths.validate_piece_index(dp.index).unwrap();
            for (block_idx, slot) in dp.blocks.iter().enumerate() {
                let info = self.lengths.block_info(index, block_idx as u32).unwrap();
                match slot.state {
                    BlockState::None => {
                        if defer_whole || !speed_match {
                            backup.push(info);
                        } else if picked.len() < n_blocks {
                            picked.push(info);
                        }
                    }
                    BlockState::Requested => {
                        // Only worth racing when someone else holds it.
                        if slot.num_peers > 0 && slot.last_peer != Some(peer) {
                            endgame.push(info);
                        }
                    }
                    BlockState::Writing | BlockState::Finished => {}
                }
            }
        }

        // Phase 2: suggested / allowed-fast hints.
        for &s in suggested {
            if picked.len() >= n_blocks {
                break;
            }
            if s < self.num_pieces() && self.can_pick(s, peer_bits) {
                self.push_piece_blocks(s, &mut picked);
            }
        }

        // Phase 3: new pieces.
        if picked.len() < n_blocks {
            if self.sequential {
                let start = self
                    .piece_map
                    .iter()
                    .position(|p| !p.have && p.priority != 0)
                    .unwrap_or(self.piece_map.len());
                for piece in start as u32..self.num_pieces() {
                    if picked.len() >= n_blocks {
                        break;
                    }
                    if self.can_pick(piece, peer_bits) {
                        self.push_piece_blocks(piece, &mut picked);
                    }
                }
            } else {
                let order: Vec<u32> = if rarest_first {
                    self.pieces.clone()
                } else {
                    // Random start, then wrap.
                    let len = self.pieces.len();
                    if len == 0 {
                        Vec::new()
                    } else {
                        let start = rand::rng().random_range(0..len);
                        self.pieces[start..]
                            .iter()
                            .chain(self.pieces[..start].iter())
                            .copied()
                            .collect()
                    }
                };
                let mut whole_left = prefer_whole;
                for piece in order {
                    if picked.len() >= n_blocks && whole_left == 0 {
                        break;
                    }
                    if !self.can_pick(piece, peer_bits) {
                        continue;
                    }
                    self.push_piece_blocks(piece, &mut picked);
                    whole_left = whole_left.saturating_sub(1);
                }
            }
        }

        // Phase 4: leftovers.
        backup.extend(endgame);
        for info in backup {
            if picked.len() >= n_blocks {
                break;
            }
            if !picked.contains(&info) {
                picked.push(info);
            }
        }
        if prefer_whole == 0 {
            picked.truncate(n_blocks);
        }
        picked
    }
}
