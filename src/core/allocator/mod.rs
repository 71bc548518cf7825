//! Block allocation for the block store
//!
//! Blocks are handed out as linked chains recorded in a file allocation
//! table ([`fat::Fat`]). A chain is identified by its first block, the head.

pub mod fat;

use crate::error::Result;

/// Index of a block in the table
pub type BlockId = i32;

/// Table marker for a free block
pub const UNUSED_BLOCK: BlockId = -2;

/// Table marker for the final block of a chain
pub const LAST_BLOCK: BlockId = -1;

/// One proposed block move produced while planning a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactSuggestion {
    /// Used block to move
    pub from: BlockId,
    /// Free block to move it into
    pub to: BlockId,
    /// Whether `from` is the head of its chain
    pub is_head: bool,
}

/// Block allocator trait
///
/// Defines the interface for allocating and releasing block chains.
pub trait BlockAllocator {
    /// Allocate a chain of `count` blocks
    ///
    /// Returns the block IDs in chain order; the first one is the head.
    fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>>;

    /// Release the chain starting at `head`
    fn release(&mut self, head: BlockId) -> Result<()>;

    /// Block IDs of the chain starting at `head`, in chain order
    fn blocks_in_sequence(&self, head: BlockId) -> Result<Vec<BlockId>>;

    /// Calculate fragmentation score (0.0 = no fragmentation, higher = more fragmented)
    fn fragmentation_score(&self) -> f64;

    /// Get total number of blocks managed
    fn total_blocks(&self) -> usize;

    /// Get number of free blocks available
    fn free_blocks(&self) -> usize;
}
