use crate::constants::BLOCK_SIZE;
use crate::peer::Bitfield;

use super::layout::StorageLayout;

/// Outcome of recording a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMark {
    /// The block was already present.
    Duplicate,
    /// Newly recorded; the piece still has missing blocks.
    Added,
    /// Newly recorded and it was the piece's last missing block.
    PieceFull,
}

/// Per-piece record of which blocks have arrived.
///
/// Blocks are [`BLOCK_SIZE`] bytes; the last block of a piece holds the
/// remainder.
#[derive(Debug, Clone)]
pub struct PieceProgress {
    blocks: Vec<Bitfield>,
    piece_length: u64,
    total_length: u64,
}

impl PieceProgress {
    /// Pieces set in `have` start out with every block present.
    pub fn new(layout: &StorageLayout, have: &Bitfield) -> Self {
        let blocks = (0..layout.piece_count())
            .map(|i| {
                let size = layout.piece_size(i as u32).unwrap_or(0);
                let count = size.div_ceil(BLOCK_SIZE as u64) as usize;
                if have.has(i) {
                    Bitfield::full(count)
                } else {
                    Bitfield::new(count)
                }
            })
            .collect();
        Self {
            blocks,
            piece_length: layout.piece_length(),
            total_length: layout.total_length(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_count(&self, index: u32) -> usize {
        self.blocks.get(index as usize).map_or(0, Bitfield::len)
    }

    /// Length of the block at `begin`, or `None` when `begin` is not a block
    /// boundary of piece `index`.
    pub fn block_length(&self, index: u32, begin: u32) -> Option<u32> {
        let count = self.block_count(index);
        if begin % BLOCK_SIZE != 0 || (begin / BLOCK_SIZE) as usize >= count {
            return None;
        }
        let piece_start = index as u64 * self.piece_length;
        let piece_size = self.piece_length.min(self.total_length - piece_start);
        Some((piece_size - begin as u64).min(BLOCK_SIZE as u64) as u32)
    }

    pub fn is_done(&self, index: u32, begin: u32) -> bool {
        self.blocks
            .get(index as usize)
            .is_some_and(|b| b.has((begin / BLOCK_SIZE) as usize))
    }

    /// Records the block at `begin`; `None` if it is not a valid block.
    pub fn mark(&mut self, index: u32, begin: u32) -> Option<BlockMark> {
        self.block_length(index, begin)?;
        let blocks = &mut self.blocks[index as usize];
        let block = (begin / BLOCK_SIZE) as usize;
        if blocks.has(block) {
            return Some(BlockMark::Duplicate);
        }
        blocks.set(block);
        Some(if blocks.is_complete() {
            BlockMark::PieceFull
        } else {
            BlockMark::Added
        })
    }

    /// Forgets every block of piece `index`.
    pub fn reset(&mut self, index: u32) {
        if let Some(blocks) = self.blocks.get_mut(index as usize) {
            *blocks = Bitfield::new(blocks.len());
        }
    }

    /// `(begin, length)` of each block of piece `index` not yet received.
    pub fn missing(&self, index: u32) -> Vec<(u32, u32)> {
        let Some(blocks) = self.blocks.get(index as usize) else {
            return Vec::new();
        };
        (0..blocks.len())
            .filter(|&b| !blocks.has(b))
            .filter_map(|b| {
                let begin = b as u32 * BLOCK_SIZE;
                self.block_length(index, begin).map(|len| (begin, len))
            })
            .collect()
    }
}
