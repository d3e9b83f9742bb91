use crate::constants::BLOCK_SIZE;

fn last_element_size(total: u64, unit: u64) -> u64 {
    let rem = total % unit;
    if rem == 0 { unit } else { rem }
}

/// A piece index that has been validated against the torrent geometry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

/// Identifies one block within a piece, with its size and byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,
    pub block_index: u32,
    pub offset: u32,
    pub size: u32,
}

/// Piece/block geometry of a torrent. Cheap to copy, derived once from the
/// descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    blocks_per_piece: u32,
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32) -> anyhow::Result<Self> {
        if total_length == 0 {
            anyhow::bail!("torrent with 0 length is useless");
        }
        if piece_length == 0 {
            anyhow::bail!("piece length of 0 is invalid");
        }
        let total_pieces = total_length.div_ceil(piece_length as u64) as u32;
        Ok(Self {
            total_length,
            piece_length,
            blocks_per_piece: piece_length.div_ceil(BLOCK_SIZE),
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }

    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }

    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }

    pub const fn default_blocks_per_piece(&self) -> u32 {
        self.blocks_per_piece
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }

    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length.div_ceil(BLOCK_SIZE);
        }
        self.blocks_per_piece
    }

    pub fn block_size(&self, index: ValidPieceIndex, block: u32) -> Option<u32> {
        let piece_length = self.piece_length(index);
        let last_block = piece_length.div_ceil(BLOCK_SIZE) - 1;
        match block.cmp(&last_block) {
            std::cmp::Ordering::Less => Some(BLOCK_SIZE),
            std::cmp::Ordering::Equal => {
                Some(last_element_size(piece_length as u64, BLOCK_SIZE as u64) as u32)
            }
            std::cmp::Ordering::Greater => None,
        }
    }

    pub fn block_info(&self, index: ValidPieceIndex, block: u32) -> Option<BlockInfo> {
        let size = self.block_size(index, block)?;
        Some(BlockInfo {
            piece_index: index,
            block_index: block,
            offset: block * BLOCK_SIZE,
            size,
        })
    }

    /// Validate an incoming (piece, begin, length) triple from the wire.
    /// The begin offset must be block-aligned and the length must match the
    /// block exactly.
    pub fn block_from_wire(&self, piece: u32, begin: u32, len: u32) -> Option<BlockInfo> {
        let index = self.validate_piece_index(piece)?;
        if begin % BLOCK_SIZE != 0 {
            return None;
        }
        let block = begin / BLOCK_SIZE;
        let info = self.block_info(index, block)?;
        if info.size != len {
            return None;
        }
        Some(info)
    }

    pub fn iter_blocks(&self, index: ValidPieceIndex) -> impl Iterator<Item = BlockInfo> + '_ {
        let n = self.blocks_per_piece(index);
        (0..n).map(move |b| self.block_info(index, b).unwrap())
    }

    pub fn iter_pieces(&self) -> impl Iterator<Item = ValidPieceIndex> {
        (0..self.total_pieces()).map(ValidPieceIndex)
    }

    /// Bytes needed for a piece bitfield (one bit per piece, MSB first).
    pub const fn piece_bitfield_bytes(&self) -> usize {
        self.total_pieces().div_ceil(8) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let l = Lengths::new(1174243328, 262144).unwrap();
        assert_eq!(l.total_pieces(), 4480);
        let last = l.validate_piece_index(4479).unwrap();
        assert_eq!(l.piece_length(last), 100352);
        assert_eq!(l.blocks_per_piece(last), 7);
        assert_eq!(l.block_size(last, 0), Some(16384));
        assert_eq!(l.block_size(last, 6), Some(2048));
        assert_eq!(l.block_size(last, 7), None);
        assert!(l.validate_piece_index(4480).is_none());
    }

    #[test]
    fn test_uneven_last_block() {
        // 2 pieces, last piece is a single truncated block.
        let l = Lengths::new(40000, 32768).unwrap();
        assert_eq!(l.total_pieces(), 2);
        let last = l.last_piece_id();
        assert_eq!(l.piece_length(last), 40000 - 32768);
        assert_eq!(l.blocks_per_piece(last), 1);
        assert_eq!(l.block_size(last, 0), Some(40000 - 32768));
    }

    #[test]
    fn test_block_from_wire() {
        let l = Lengths::new(65536, 32768).unwrap();
        let ok = l.block_from_wire(0, 16384, 16384).unwrap();
        assert_eq!(ok.block_index, 1);
        // misaligned begin
        assert!(l.block_from_wire(0, 100, 16384).is_none());
        // wrong length
        assert!(l.block_from_wire(0, 16384, 10000).is_none());
        // piece out of range
        assert!(l.block_from_wire(2, 0, 16384).is_none());
    }

    #[test]
    fn test_iter_blocks() {
        let l = Lengths::new(50000, 32768).unwrap();
        let blocks: Vec<_> = l.iter_blocks(l.last_piece_id()).collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].size, 16384);
        assert_eq!(blocks[1].size, 50000 - 32768 - 16384);
        assert_eq!(blocks[1].offset, 16384);
    }

    #[test]
    fn test_bitfield_bytes() {
        assert_eq!(Lengths::new(9, 1).unwrap().piece_bitfield_bytes(), 2);
        assert_eq!(Lengths::new(8, 1).unwrap().piece_bitfield_bytes(), 1);
    }
}
