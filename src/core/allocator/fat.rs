//! File allocation table
//!
//! The table is an array of `max_blocks` link entries mirrored onto a table
//! stream. Each entry is either [`UNUSED_BLOCK`], [`LAST_BLOCK`] or the index
//! of the next block of its chain. Chain heads are not persisted: on load,
//! every used block that no other entry links to is a head.
//!
//! Every link change is written and flushed on its own, so the persisted
//! table never lags the in-memory mirror by more than one entry. Chains are
//! written tail first and released head first: an interrupted allocation or
//! release leaves a shorter chain behind, never a link into a free block.

use crate::allocator::{BlockAllocator, BlockId, CompactSuggestion, LAST_BLOCK, UNUSED_BLOCK};
use crate::error::{StoreError, Result};
use crate::header::{FatHeader, ENTRY_SIZE, HEADER_SIZE};
use crate::medium::StoreStream;
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::{debug, info, warn};

/// File allocation table over a table stream
pub struct Fat {
    /// Backing table stream
    stream: Box<dyn StoreStream>,

    /// Start of the FAT region in the stream
    offset: u64,

    /// Number of blocks tracked
    max_blocks: i32,

    /// In-memory mirror of the persisted entries
    entries: Vec<BlockId>,

    /// Chain heads (valid arguments to `blocks_in_sequence`)
    heads: BTreeSet<BlockId>,

    /// Number of `UNUSED_BLOCK` entries
    free_blocks: usize,

    /// Number of entries physically present in the stream
    persisted_entries: usize,

    /// Reverse links, built on the first compaction move and dropped by any
    /// allocation or release
    predecessors: Option<Vec<Option<BlockId>>>,
}

impl std::fmt::Debug for Fat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fat")
            .field("offset", &self.offset)
            .field("max_blocks", &self.max_blocks)
            .field("free_blocks", &self.free_blocks)
            .field("heads", &self.heads.len())
            .finish()
    }
}

impl Fat {
    /// Write a fresh table header at `offset` and drop every entry after it
    pub fn initialize(mut stream: Box<dyn StoreStream>, offset: u64, max_blocks: i32) -> Result<Self> {
        Self::check_max_blocks(max_blocks)?;

        stream.seek(SeekFrom::Start(offset))?;
        stream.write_all(&FatHeader::new(max_blocks).to_bytes())?;
        stream.set_len(offset + HEADER_SIZE)?;
        stream.flush()?;

        info!("Initialized allocation table with {} blocks at offset {}", max_blocks, offset);
        Self::open(stream, offset, max_blocks)
    }

    /// Load a table previously written at `offset`
    ///
    /// Entries missing from the end of the stream are free. The load rejects
    /// tables whose links point out of range, at free blocks, at a block that
    /// is already linked to, or form chains unreachable from any head.
    pub fn open(stream: Box<dyn StoreStream>, offset: u64, max_blocks: i32) -> Result<Self> {
        Self::open_reconciling(stream, offset, max_blocks, |_, _| Ok(false))
    }

    /// Load a table, repairing compaction moves cut off between link writes
    ///
    /// A move copies block `from` into the free block `to`, then relinks and
    /// frees `from`. Interrupted in between, both blocks link to the same
    /// successor. When exactly one of the two has no referrer of its own (or
    /// both are chain heads), `is_copy(lower, higher)` decides whether the
    /// lower block holds a copy of the higher one. If it does, the
    /// unreferenced duplicate (the lower block when both are heads) is freed
    /// and the repair is written back. Every other shared successor is
    /// rejected like in [`Fat::open`].
    pub fn open_reconciling<F>(
        mut stream: Box<dyn StoreStream>,
        offset: u64,
        max_blocks: i32,
        is_copy: F,
    ) -> Result<Self>
    where
        F: FnMut(BlockId, BlockId) -> Result<bool>,
    {
        Self::check_max_blocks(max_blocks)?;

        let len = stream.len()?;
        let entries_start = offset + HEADER_SIZE;
        if len < entries_start {
            return Err(StoreError::HeaderMismatch(format!(
                "table stream holds {} bytes, header needs {}",
                len, entries_start
            )));
        }

        let mut header = vec![0u8; HEADER_SIZE as usize];
        stream.seek(SeekFrom::Start(offset))?;
        stream.read_exact(&mut header)?;
        FatHeader::from_bytes(&header)?.validate(max_blocks)?;

        let capacity = max_blocks as usize;
        let persisted_entries = (((len - entries_start) / ENTRY_SIZE) as usize).min(capacity);
        let mut raw = vec![0u8; persisted_entries * ENTRY_SIZE as usize];
        stream.read_exact(&mut raw)?;

        let mut entries = vec![UNUSED_BLOCK; capacity];
        for (slot, chunk) in entries.iter_mut().zip(raw.chunks_exact(ENTRY_SIZE as usize)) {
            *slot = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let (heads, free_blocks, repaired) = Self::infer_heads(&mut entries, max_blocks, is_copy)?;

        let mut fat = Fat {
            stream,
            offset,
            max_blocks,
            entries,
            heads,
            free_blocks,
            persisted_entries,
            predecessors: None,
        };
        fat.verify_reachability()?;

        for id in repaired {
            // Read-only streams keep the duplicate on disk; the next writer repairs it
            if let Err(e) = fat.write_entry(id) {
                warn!("Could not persist release of duplicate block {}: {}", id, e);
            }
        }

        debug!(
            "Loaded allocation table: {} blocks, {} free, {} chains",
            max_blocks,
            fat.free_blocks,
            fat.heads.len()
        );
        Ok(fat)
    }

    fn check_max_blocks(max_blocks: i32) -> Result<()> {
        if max_blocks <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "max blocks must be positive, got {}",
                max_blocks
            )));
        }
        Ok(())
    }

    /// Every used block is a head unless some other entry links to it
    ///
    /// Returns the heads, the free count and the blocks freed as leftovers of
    /// an interrupted compaction move.
    fn infer_heads<F>(
        entries: &mut [BlockId],
        max_blocks: i32,
        mut is_copy: F,
    ) -> Result<(BTreeSet<BlockId>, usize, Vec<BlockId>)>
    where
        F: FnMut(BlockId, BlockId) -> Result<bool>,
    {
        let mut referrers: Vec<Option<usize>> = vec![None; entries.len()];
        // (successor, first referrer, second referrer)
        let mut shared: Vec<(usize, usize, usize)> = Vec::new();

        for (index, &link) in entries.iter().enumerate() {
            match link {
                UNUSED_BLOCK | LAST_BLOCK => {}
                next if (0..max_blocks).contains(&next) => {
                    let next = next as usize;
                    if entries[next] == UNUSED_BLOCK {
                        return Err(StoreError::CorruptedTable(format!(
                            "block {} links to free block {}",
                            index, next
                        )));
                    }
                    match referrers[next] {
                        None => referrers[next] = Some(index),
                        Some(first) => {
                            if shared.iter().any(|&(successor, _, _)| successor == next) {
                                return Err(StoreError::CorruptedTable(format!(
                                    "block {} is linked from more than two blocks",
                                    next
                                )));
                            }
                            shared.push((next, first, index));
                        }
                    }
                }
                invalid => {
                    return Err(StoreError::CorruptedTable(format!(
                        "block {} holds invalid link {}",
                        index, invalid
                    )));
                }
            }
        }

        let mut repaired = Vec::new();
        for (next, a, b) in shared {
            let (lower, higher) = (a.min(b), a.max(b));
            let duplicate = match (referrers[a].is_some(), referrers[b].is_some()) {
                (false, true) => Some(a),
                (true, false) => Some(b),
                (false, false) => Some(lower),
                (true, true) => None,
            };

            let duplicate = match duplicate {
                Some(block) if is_copy(lower as BlockId, higher as BlockId)? => block,
                _ => {
                    return Err(StoreError::CorruptedTable(format!(
                        "block {} is linked from both {} and {}",
                        next, a, b
                    )))
                }
            };

            warn!(
                "Freeing block {} left over from an interrupted compaction move",
                duplicate
            );
            entries[duplicate] = UNUSED_BLOCK;
            referrers[next] = Some(if duplicate == a { b } else { a });
            repaired.push(duplicate as BlockId);
        }

        let mut heads = BTreeSet::new();
        let mut free_blocks = 0;
        for (index, &link) in entries.iter().enumerate() {
            if link == UNUSED_BLOCK {
                free_blocks += 1;
            } else if referrers[index].is_none() {
                heads.insert(index as BlockId);
            }
        }

        Ok((heads, free_blocks, repaired))
    }

    /// Used blocks not reachable from a head can only sit on a cycle
    fn verify_reachability(&self) -> Result<()> {
        let mut reached = 0;
        for &head in &self.heads {
            reached += self.blocks_in_sequence(head)?.len();
        }

        let used = self.entries.len() - self.free_blocks;
        if reached != used {
            return Err(StoreError::CorruptedTable(format!(
                "{} used blocks are not reachable from any chain head",
                used - reached
            )));
        }
        Ok(())
    }

    fn entry_position(&self, index: usize) -> u64 {
        self.offset + HEADER_SIZE + index as u64 * ENTRY_SIZE
    }

    /// Persist one entry, padding any gap before it with free markers
    fn write_entry(&mut self, id: BlockId) -> Result<()> {
        let index = id as usize;

        if index > self.persisted_entries {
            let gap = index - self.persisted_entries;
            let padding: Vec<u8> = UNUSED_BLOCK
                .to_le_bytes()
                .iter()
                .copied()
                .cycle()
                .take(gap * ENTRY_SIZE as usize)
                .collect();
            let position = self.entry_position(self.persisted_entries);
            self.stream.seek(SeekFrom::Start(position))?;
            self.stream.write_all(&padding)?;
            self.persisted_entries = index;
        }

        let position = self.entry_position(index);
        self.stream.seek(SeekFrom::Start(position))?;
        self.stream.write_all(&self.entries[index].to_le_bytes())?;
        self.stream.flush()?;
        self.persisted_entries = self.persisted_entries.max(index + 1);
        Ok(())
    }

    /// Undo a failed allocation, best effort
    ///
    /// `written` is in chain order, so the blocks still linked on disk stay a
    /// valid chain until each is freed.
    fn rollback(&mut self, written: &[BlockId]) {
        self.predecessors = None;
        for &id in written {
            self.entries[id as usize] = UNUSED_BLOCK;
            if let Err(e) = self.write_entry(id) {
                warn!("Rollback of block {} failed: {}", id, e);
            }
        }
    }

    /// Allocate `count` free blocks, lowest index first, linked into one chain
    pub fn allocate_block_sequence(&mut self, count: usize) -> Result<Vec<BlockId>> {
        if count == 0 {
            return Err(StoreError::Allocation(
                "cannot allocate an empty block sequence".to_string(),
            ));
        }

        if count > self.free_blocks {
            return Err(StoreError::OutOfSpace {
                requested: count,
                available: self.free_blocks,
            });
        }

        let ids: Vec<BlockId> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, &link)| link == UNUSED_BLOCK)
            .map(|(index, _)| index as BlockId)
            .take(count)
            .collect();

        if ids.len() != count {
            return Err(StoreError::CorruptedTable(format!(
                "free count says {} blocks are free, found {}",
                self.free_blocks,
                ids.len()
            )));
        }

        self.predecessors = None;

        // Tail first: until the head is written the finished part loads as a
        // spare chain of its own
        for k in (0..ids.len()).rev() {
            let id = ids[k];
            self.entries[id as usize] = ids.get(k + 1).copied().unwrap_or(LAST_BLOCK);
            if let Err(e) = self.write_entry(id) {
                warn!("Allocation of {} blocks failed at block {}: {}", count, id, e);
                self.rollback(&ids[k..]);
                return Err(e);
            }
        }

        self.free_blocks -= count;
        self.heads.insert(ids[0]);

        debug!("Allocated {} blocks starting at {}", count, ids[0]);
        Ok(ids)
    }

    /// Block IDs of the chain starting at `head`, in chain order
    pub fn get_blocks_in_sequence(&self, head: BlockId) -> Result<Vec<BlockId>> {
        if head < 0 || head >= self.max_blocks {
            return Err(StoreError::InvalidArgument(format!(
                "block {} is outside the table (0..{})",
                head, self.max_blocks
            )));
        }

        if !self.heads.contains(&head) || self.entries[head as usize] == UNUSED_BLOCK {
            return Err(StoreError::InvalidArgument(format!(
                "block {} is not the head of an allocated sequence",
                head
            )));
        }

        let mut chain = Vec::new();
        let mut current = head;
        loop {
            chain.push(current);
            match self.entries[current as usize] {
                LAST_BLOCK => return Ok(chain),
                next if (0..self.max_blocks).contains(&next) => {
                    if self.entries[next as usize] == UNUSED_BLOCK {
                        return Err(StoreError::CorruptedChain {
                            head,
                            reason: format!("block {} links to free block {}", current, next),
                        });
                    }
                    if chain.len() >= self.max_blocks as usize {
                        return Err(StoreError::CorruptedChain {
                            head,
                            reason: format!("chain exceeds {} blocks (cycle)", self.max_blocks),
                        });
                    }
                    current = next;
                }
                invalid => {
                    return Err(StoreError::CorruptedChain {
                        head,
                        reason: format!("block {} holds invalid link {}", current, invalid),
                    });
                }
            }
        }
    }

    /// Free every block of the chain starting at `head`
    ///
    /// Blocks are persisted head first, so an interrupted release leaves the
    /// remaining tail as a valid chain of its own rather than a dangling link.
    pub fn release_block_sequence(&mut self, head: BlockId) -> Result<()> {
        let chain = self.get_blocks_in_sequence(head)?;
        self.predecessors = None;

        for &id in &chain {
            self.entries[id as usize] = UNUSED_BLOCK;
        }
        self.heads.remove(&head);
        self.free_blocks += chain.len();

        let mut first_error = None;
        for &id in &chain {
            if let Err(e) = self.write_entry(id) {
                warn!("Failed to persist release of block {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }

        debug!("Released {} blocks starting at {}", chain.len(), head);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot of all chain heads
    pub fn current_block_sequence_ids(&self) -> BTreeSet<BlockId> {
        self.heads.clone()
    }

    /// Plan moves that pack used blocks towards the start of the table
    ///
    /// Walks one cursor up from the bottom over free blocks and one down from
    /// the top over used blocks, pairing them until the cursors meet.
    pub fn get_compact_suggestions(&self) -> Vec<CompactSuggestion> {
        let mut suggestions = Vec::new();
        let mut low = 0usize;
        let mut high = self.entries.len();

        loop {
            while low < self.entries.len() && self.entries[low] != UNUSED_BLOCK {
                low += 1;
            }
            while high > 0 && self.entries[high - 1] == UNUSED_BLOCK {
                high -= 1;
            }
            if high == 0 || low >= high - 1 {
                break;
            }

            let from = (high - 1) as BlockId;
            suggestions.push(CompactSuggestion {
                from,
                to: low as BlockId,
                is_head: self.heads.contains(&from),
            });
            low += 1;
            high -= 1;
        }

        suggestions
    }

    /// Apply one move planned by [`Fat::get_compact_suggestions`]
    pub fn accept_compact_suggestion(&mut self, suggestion: CompactSuggestion) -> Result<()> {
        let CompactSuggestion { from, to, is_head } = suggestion;

        for id in [from, to] {
            if id < 0 || id >= self.max_blocks {
                return Err(StoreError::InvalidArgument(format!(
                    "block {} is outside the table (0..{})",
                    id, self.max_blocks
                )));
            }
        }

        if self.entries[to as usize] != UNUSED_BLOCK {
            return Err(StoreError::InvalidArgument(format!(
                "compaction target {} is not free",
                to
            )));
        }

        if self.entries[from as usize] == UNUSED_BLOCK {
            return Err(StoreError::InvalidArgument(format!(
                "compaction source {} is free",
                from
            )));
        }

        if self.heads.contains(&from) != is_head {
            return Err(StoreError::InvalidArgument(format!(
                "block {} head flag does not match the table (expected head: {})",
                from, is_head
            )));
        }

        let mut predecessors = match self.predecessors.take() {
            Some(predecessors) => predecessors,
            None => self.build_predecessors(),
        };

        let predecessor = match is_head {
            true => None,
            false => match predecessors[from as usize] {
                Some(index) => Some(index),
                None => {
                    return Err(StoreError::CorruptedTable(format!(
                        "non-head block {} has no predecessor",
                        from
                    )))
                }
            },
        };

        let successor = self.entries[from as usize];
        self.entries[to as usize] = successor;
        self.write_entry(to)?;

        match predecessor {
            Some(predecessor) => {
                self.entries[predecessor as usize] = to;
                self.write_entry(predecessor)?;
            }
            None => {
                self.heads.remove(&from);
                self.heads.insert(to);
            }
        }

        self.entries[from as usize] = UNUSED_BLOCK;
        self.write_entry(from)?;

        if successor >= 0 {
            predecessors[successor as usize] = Some(to);
        }
        predecessors[to as usize] = predecessor;
        predecessors[from as usize] = None;
        self.predecessors = Some(predecessors);

        debug!("Moved block {} to {} (head: {})", from, to, is_head);
        Ok(())
    }

    fn build_predecessors(&self) -> Vec<Option<BlockId>> {
        let mut predecessors = vec![None; self.entries.len()];
        for (index, &link) in self.entries.iter().enumerate() {
            if link >= 0 {
                predecessors[link as usize] = Some(index as BlockId);
            }
        }
        predecessors
    }

    /// Cut the table stream after the last used entry
    ///
    /// Returns the index of the first block after the last used one, which is
    /// also the number of blocks the content stream still has to cover.
    pub fn trim(&mut self) -> Result<usize> {
        let first_free = self
            .entries
            .iter()
            .rposition(|&link| link != UNUSED_BLOCK)
            .map_or(0, |index| index + 1);

        if self.persisted_entries > first_free {
            let len = self.entry_position(first_free);
            self.stream.set_len(len)?;
            self.stream.flush()?;
            self.persisted_entries = first_free;
        }

        debug!("Trimmed allocation table to {} entries", first_free);
        Ok(first_free)
    }

    pub fn max_blocks(&self) -> i32 {
        self.max_blocks
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the backing table stream in bytes
    pub fn stream_len(&self) -> Result<u64> {
        Ok(self.stream.len()?)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }
}

impl BlockAllocator for Fat {
    fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>> {
        self.allocate_block_sequence(count)
    }

    fn release(&mut self, head: BlockId) -> Result<()> {
        self.release_block_sequence(head)
    }

    fn blocks_in_sequence(&self, head: BlockId) -> Result<Vec<BlockId>> {
        self.get_blocks_in_sequence(head)
    }

    fn fragmentation_score(&self) -> f64 {
        // Count used/free transitions across the table
        let mut transitions = 0usize;
        let mut prev_used = false;

        for &link in &self.entries {
            let used = link != UNUSED_BLOCK;
            if used != prev_used {
                transitions += 1;
            }
            prev_used = used;
        }

        (transitions as f64) / (self.entries.len() as f64)
    }

    fn total_blocks(&self) -> usize {
        self.entries.len()
    }

    fn free_blocks(&self) -> usize {
        self.free_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::{MemoryMedium, OpenMode, StorageMedium};

    const TABLE: &str = "Cache_test/fat";

    fn stream(medium: &MemoryMedium) -> Box<dyn StoreStream> {
        medium.open_stream(TABLE, OpenMode::ReadWrite).unwrap()
    }

    fn new_fat(max_blocks: i32) -> (MemoryMedium, Fat) {
        let medium = MemoryMedium::new();
        let fat = Fat::initialize(stream(&medium), 0, max_blocks).unwrap();
        (medium, fat)
    }

    fn reopen(medium: &MemoryMedium, max_blocks: i32) -> Result<Fat> {
        Fat::open(stream(medium), 0, max_blocks)
    }

    fn poke(medium: &MemoryMedium, index: usize, value: BlockId) {
        let mut s = stream(medium);
        s.seek(SeekFrom::Start(HEADER_SIZE + index as u64 * ENTRY_SIZE)).unwrap();
        s.write_all(&value.to_le_bytes()).unwrap();
    }

    #[test]
    fn test_initialize_writes_header() {
        let (medium, fat) = new_fat(100);
        let bytes = medium.contents(TABLE).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE as usize);
        assert_eq!(&bytes[0..2], &crate::header::FAT_MAGIC);
        assert_eq!(fat.free_blocks(), 100);
        assert_eq!(fat.total_blocks(), 100);
        assert!(fat.current_block_sequence_ids().is_empty());
    }

    #[test]
    fn test_initialize_at_offset_keeps_prefix() {
        let medium = MemoryMedium::new();
        let mut s = stream(&medium);
        s.write_all(&[0xAA; 8]).unwrap();
        let fat = Fat::initialize(s, 8, 10).unwrap();
        assert_eq!(fat.offset(), 8);

        let bytes = medium.contents(TABLE).unwrap();
        assert_eq!(&bytes[0..8], &[0xAA; 8]);
        assert_eq!(bytes.len(), 8 + HEADER_SIZE as usize);
    }

    #[test]
    fn test_initialize_rejects_bad_max_blocks() {
        let medium = MemoryMedium::new();
        assert!(matches!(
            Fat::initialize(stream(&medium), 0, 0),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            Fat::initialize(stream(&medium), 0, -5),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_allocate_first_fit_chain() {
        let (_medium, mut fat) = new_fat(10);

        let a = fat.allocate_block_sequence(3).unwrap();
        assert_eq!(a, vec![0, 1, 2]);
        let b = fat.allocate_block_sequence(2).unwrap();
        assert_eq!(b, vec![3, 4]);

        fat.release_block_sequence(0).unwrap();
        // Reuses the lowest free blocks first
        let c = fat.allocate_block_sequence(4).unwrap();
        assert_eq!(c, vec![0, 1, 2, 5]);

        assert_eq!(fat.get_blocks_in_sequence(0).unwrap(), c);
        assert_eq!(fat.free_blocks(), 4);
    }

    #[test]
    fn test_allocate_invalid_counts() {
        let (_medium, mut fat) = new_fat(4);
        assert!(matches!(
            fat.allocate_block_sequence(0),
            Err(StoreError::Allocation(_))
        ));
        assert!(matches!(
            fat.allocate_block_sequence(5),
            Err(StoreError::OutOfSpace {
                requested: 5,
                available: 4
            })
        ));
        fat.allocate_block_sequence(4).unwrap();
        assert!(fat.allocate_block_sequence(1).is_err());
        assert_eq!(fat.free_blocks(), 0);
    }

    #[test]
    fn test_allocate_release_round_trip() {
        let (_medium, mut fat) = new_fat(50);
        let mut heads = Vec::new();
        for n in 1..=9 {
            heads.push(fat.allocate_block_sequence(n).unwrap()[0]);
        }
        assert_eq!(fat.free_blocks(), 50 - 45);

        for head in heads {
            fat.release_block_sequence(head).unwrap();
        }
        assert_eq!(fat.free_blocks(), 50);
        assert!(fat.current_block_sequence_ids().is_empty());
    }

    #[test]
    fn test_chain_survives_reopen() {
        let (medium, mut fat) = new_fat(20);
        let a = fat.allocate_block_sequence(3).unwrap();
        let b = fat.allocate_block_sequence(5).unwrap();
        fat.release_block_sequence(a[0]).unwrap();
        let c = fat.allocate_block_sequence(4).unwrap();
        drop(fat);

        let fat = reopen(&medium, 20).unwrap();
        assert_eq!(fat.get_blocks_in_sequence(b[0]).unwrap(), b);
        assert_eq!(fat.get_blocks_in_sequence(c[0]).unwrap(), c);
        assert_eq!(fat.current_block_sequence_ids(), BTreeSet::from([b[0], c[0]]));
        assert_eq!(fat.free_blocks(), 20 - 9);
    }

    #[test]
    fn test_open_treats_missing_entries_as_free() {
        let (medium, mut fat) = new_fat(100);
        fat.allocate_block_sequence(2).unwrap();
        drop(fat);

        // Only two entries were ever written
        assert_eq!(
            medium.contents(TABLE).unwrap().len(),
            HEADER_SIZE as usize + 2 * ENTRY_SIZE as usize
        );
        let fat = reopen(&medium, 100).unwrap();
        assert_eq!(fat.free_blocks(), 98);
    }

    #[test]
    fn test_open_header_mismatch() {
        let (medium, fat) = new_fat(10);
        drop(fat);
        assert!(matches!(
            reopen(&medium, 11),
            Err(StoreError::HeaderMismatch(_))
        ));

        poke_header(&medium);
        assert!(matches!(reopen(&medium, 10), Err(StoreError::InvalidMagic)));
    }

    fn poke_header(medium: &MemoryMedium) {
        let mut s = stream(medium);
        s.write_all(&[0, 0]).unwrap();
    }

    #[test]
    fn test_open_empty_stream_fails() {
        let medium = MemoryMedium::new();
        assert!(matches!(
            reopen(&medium, 10),
            Err(StoreError::HeaderMismatch(_))
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let (_medium, mut fat) = new_fat(10);
        let chain = fat.allocate_block_sequence(2).unwrap();
        // Induce 0 -> 1 -> 0
        fat.entries[chain[1] as usize] = chain[0];

        let err = fat.get_blocks_in_sequence(chain[0]).unwrap_err();
        assert!(err.is_corruption(), "expected corruption, got {:?}", err);
        assert!(fat.release_block_sequence(chain[0]).is_err());
    }

    #[test]
    fn test_free_block_inside_chain_detected() {
        let (_medium, mut fat) = new_fat(10);
        let chain = fat.allocate_block_sequence(3).unwrap();
        fat.entries[chain[1] as usize] = UNUSED_BLOCK;

        assert!(matches!(
            fat.get_blocks_in_sequence(chain[0]),
            Err(StoreError::CorruptedChain { .. })
        ));
    }

    #[test]
    fn test_persisted_cycle_rejected_on_open() {
        let (medium, mut fat) = new_fat(10);
        fat.allocate_block_sequence(3).unwrap();
        drop(fat);

        // 0 -> 1 -> 2 -> 1
        poke(&medium, 2, 1);
        assert!(matches!(
            reopen(&medium, 10),
            Err(StoreError::CorruptedTable(_))
        ));
    }

    #[test]
    fn test_orphan_cycle_rejected_on_open() {
        let (medium, mut fat) = new_fat(10);
        fat.allocate_block_sequence(2).unwrap();
        drop(fat);

        // 0 -> 1 -> 0 with no head left
        poke(&medium, 1, 0);
        assert!(matches!(
            reopen(&medium, 10),
            Err(StoreError::CorruptedTable(_))
        ));
    }

    #[test]
    fn test_corrupted_link_is_not_misattributed() {
        let (medium, mut fat) = new_fat(10);
        let a = fat.allocate_block_sequence(3).unwrap();
        let b = fat.allocate_block_sequence(2).unwrap();
        drop(fat);

        // Second block of chain A now points into chain B
        poke(&medium, a[1] as usize, b[1]);
        let err = reopen(&medium, 10).unwrap_err();
        assert!(err.is_corruption());

        // Or at a free block
        poke(&medium, a[1] as usize, 9);
        let err = reopen(&medium, 10).unwrap_err();
        assert!(err.is_corruption());

        // Or out of range
        poke(&medium, a[1] as usize, 1000);
        let err = reopen(&medium, 10).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_interrupted_allocation_loads_as_spare_chain() {
        let (medium, mut fat) = new_fat(10);
        let kept = fat.allocate_block_sequence(2).unwrap();
        drop(fat);

        // A 3-block allocation at 2, 3, 4 that wrote its last two links only
        poke(&medium, 2, UNUSED_BLOCK);
        poke(&medium, 4, LAST_BLOCK);
        poke(&medium, 3, 4);

        let mut fat = reopen(&medium, 10).unwrap();
        assert_eq!(fat.current_block_sequence_ids(), BTreeSet::from([kept[0], 3]));
        assert_eq!(fat.get_blocks_in_sequence(kept[0]).unwrap(), kept);
        assert_eq!(fat.get_blocks_in_sequence(3).unwrap(), vec![3, 4]);

        fat.release_block_sequence(3).unwrap();
        assert_eq!(fat.free_blocks(), 8);
    }

    /// Chain 0 -> 1 -> 2 with block 1 copied to 5 by a move that stopped
    /// there, plus `extra` links written on top
    fn torn_move(extra: &[(usize, BlockId)]) -> MemoryMedium {
        let (medium, mut fat) = new_fat(10);
        fat.allocate_block_sequence(3).unwrap();
        drop(fat);

        poke(&medium, 3, UNUSED_BLOCK);
        poke(&medium, 4, UNUSED_BLOCK);
        poke(&medium, 5, 2);
        for &(index, value) in extra {
            poke(&medium, index, value);
        }
        medium
    }

    #[test]
    fn test_torn_move_before_relink_frees_the_copy() {
        let medium = torn_move(&[]);
        assert!(matches!(reopen(&medium, 10), Err(StoreError::CorruptedTable(_))));

        let mut checked = Vec::new();
        let fat = Fat::open_reconciling(stream(&medium), 0, 10, |copy, source| {
            checked.push((copy, source));
            Ok(true)
        })
        .unwrap();
        assert_eq!(checked, vec![(1, 5)]);
        assert_eq!(fat.current_block_sequence_ids(), BTreeSet::from([0]));
        assert_eq!(fat.get_blocks_in_sequence(0).unwrap(), vec![0, 1, 2]);
        assert_eq!(fat.free_blocks(), 7);
        drop(fat);

        // The repair is persisted: a strict load now succeeds
        let fat = reopen(&medium, 10).unwrap();
        assert_eq!(fat.free_blocks(), 7);
    }

    #[test]
    fn test_torn_move_after_relink_frees_the_original() {
        let medium = torn_move(&[(0, 5)]);

        let fat = Fat::open_reconciling(stream(&medium), 0, 10, |_, _| Ok(true)).unwrap();
        assert_eq!(fat.current_block_sequence_ids(), BTreeSet::from([0]));
        assert_eq!(fat.get_blocks_in_sequence(0).unwrap(), vec![0, 5, 2]);
        assert_eq!(fat.free_blocks(), 7);
    }

    #[test]
    fn test_shared_successor_without_copy_is_rejected() {
        let medium = torn_move(&[]);
        assert!(matches!(
            Fat::open_reconciling(stream(&medium), 0, 10, |_, _| Ok(false)),
            Err(StoreError::CorruptedTable(_))
        ));

        // Both referrers still referenced themselves: never a torn move
        let (medium, mut fat) = new_fat(10);
        let a = fat.allocate_block_sequence(3).unwrap();
        let b = fat.allocate_block_sequence(3).unwrap();
        drop(fat);
        poke(&medium, a[1] as usize, b[2]);
        assert!(matches!(
            Fat::open_reconciling(stream(&medium), 0, 10, |_, _| Ok(true)),
            Err(StoreError::CorruptedTable(_))
        ));
    }

    #[test]
    fn test_get_blocks_invalid_arguments() {
        let (_medium, mut fat) = new_fat(10);
        let chain = fat.allocate_block_sequence(3).unwrap();

        for bad in [-1, 10, 100, chain[1], 7] {
            assert!(
                matches!(
                    fat.get_blocks_in_sequence(bad),
                    Err(StoreError::InvalidArgument(_))
                ),
                "block {} should be rejected",
                bad
            );
        }
        assert!(fat.release_block_sequence(chain[2]).is_err());
    }

    #[test]
    fn test_allocation_rolls_back_when_stream_cannot_grow() {
        // Room for the header and two entries only
        let medium = MemoryMedium::with_capacity(HEADER_SIZE + 2 * ENTRY_SIZE);
        let mut fat = Fat::initialize(stream(&medium), 0, 10).unwrap();

        let err = fat.allocate_block_sequence(3).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(fat.free_blocks(), 10);
        assert!(fat.current_block_sequence_ids().is_empty());
        drop(fat);

        let fat = reopen(&medium, 10).unwrap();
        assert_eq!(fat.free_blocks(), 10);

        // Smaller allocations still fit
        let mut fat = fat;
        assert_eq!(fat.allocate_block_sequence(2).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_compact_suggestions() {
        let (_medium, mut fat) = new_fat(8);
        let a = fat.allocate_block_sequence(2).unwrap(); // 0, 1
        let b = fat.allocate_block_sequence(2).unwrap(); // 2, 3
        let c = fat.allocate_block_sequence(3).unwrap(); // 4, 5, 6
        fat.release_block_sequence(a[0]).unwrap();
        fat.release_block_sequence(b[0]).unwrap();
        assert_eq!(c, vec![4, 5, 6]);

        let suggestions = fat.get_compact_suggestions();
        assert_eq!(
            suggestions,
            vec![
                CompactSuggestion { from: 6, to: 0, is_head: false },
                CompactSuggestion { from: 5, to: 1, is_head: false },
                CompactSuggestion { from: 4, to: 2, is_head: true },
            ]
        );

        for suggestion in suggestions {
            fat.accept_compact_suggestion(suggestion).unwrap();
        }

        assert_eq!(fat.current_block_sequence_ids(), BTreeSet::from([2]));
        assert_eq!(fat.get_blocks_in_sequence(2).unwrap(), vec![2, 1, 0]);
        assert_eq!(fat.free_blocks(), 5);
        assert_eq!(fat.trim().unwrap(), 3);
    }

    #[test]
    fn test_compaction_survives_reopen_and_trim() {
        let (medium, mut fat) = new_fat(16);
        let a = fat.allocate_block_sequence(4).unwrap();
        let b = fat.allocate_block_sequence(4).unwrap();
        fat.release_block_sequence(a[0]).unwrap();

        for suggestion in fat.get_compact_suggestions() {
            fat.accept_compact_suggestion(suggestion).unwrap();
        }
        let first_free = fat.trim().unwrap();
        assert_eq!(first_free, 4);
        drop(fat);

        assert_eq!(
            medium.contents(TABLE).unwrap().len() as u64,
            HEADER_SIZE + 4 * ENTRY_SIZE
        );

        let fat = reopen(&medium, 16).unwrap();
        let heads = fat.current_block_sequence_ids();
        assert_eq!(heads.len(), 1);
        let head = *heads.iter().next().unwrap();
        assert_ne!(head, b[0]);
        assert_eq!(fat.get_blocks_in_sequence(head).unwrap().len(), 4);
        assert_eq!(fat.free_blocks(), 12);
    }

    #[test]
    fn test_compaction_interleaved_with_allocation() {
        let (_medium, mut fat) = new_fat(12);
        let a = fat.allocate_block_sequence(3).unwrap(); // 0..3
        let b = fat.allocate_block_sequence(4).unwrap(); // 3..7
        let c = fat.allocate_block_sequence(3).unwrap(); // 7..10
        fat.release_block_sequence(a[0]).unwrap();

        let first = fat.get_compact_suggestions()[0];
        fat.accept_compact_suggestion(first).unwrap();

        // Invalidates the reverse links built by the first move
        fat.release_block_sequence(b[0]).unwrap();
        let d = fat.allocate_block_sequence(2).unwrap();

        for suggestion in fat.get_compact_suggestions() {
            fat.accept_compact_suggestion(suggestion).unwrap();
        }

        let heads = fat.current_block_sequence_ids();
        assert_eq!(heads.len(), 2);
        let lengths: BTreeSet<usize> = heads
            .iter()
            .map(|&head| fat.get_blocks_in_sequence(head).unwrap().len())
            .collect();
        assert_eq!(lengths, BTreeSet::from([c.len(), d.len()]));
        assert_eq!(fat.trim().unwrap(), 5);
    }

    #[test]
    fn test_no_suggestions_when_packed() {
        let (_medium, mut fat) = new_fat(8);
        fat.allocate_block_sequence(3).unwrap();
        assert!(fat.get_compact_suggestions().is_empty());

        let (_medium, fat) = new_fat(8);
        assert!(fat.get_compact_suggestions().is_empty());
    }

    #[test]
    fn test_accept_rejects_stale_suggestions() {
        let (_medium, mut fat) = new_fat(8);
        let a = fat.allocate_block_sequence(2).unwrap();
        fat.allocate_block_sequence(2).unwrap();
        fat.release_block_sequence(a[0]).unwrap();

        // Target in use
        assert!(fat
            .accept_compact_suggestion(CompactSuggestion { from: 3, to: 2, is_head: false })
            .is_err());
        // Source free
        assert!(fat
            .accept_compact_suggestion(CompactSuggestion { from: 1, to: 0, is_head: false })
            .is_err());
        // Wrong head flag
        assert!(fat
            .accept_compact_suggestion(CompactSuggestion { from: 2, to: 0, is_head: false })
            .is_err());
        // Out of range
        assert!(fat
            .accept_compact_suggestion(CompactSuggestion { from: 9, to: 0, is_head: false })
            .is_err());

        assert!(fat
            .accept_compact_suggestion(CompactSuggestion { from: 2, to: 0, is_head: true })
            .is_ok());
    }

    #[test]
    fn test_trim_empty_table() {
        let (medium, mut fat) = new_fat(8);
        let a = fat.allocate_block_sequence(5).unwrap();
        fat.release_block_sequence(a[0]).unwrap();
        assert_eq!(fat.trim().unwrap(), 0);
        assert_eq!(medium.contents(TABLE).unwrap().len(), HEADER_SIZE as usize);
        assert_eq!(fat.stream_len().unwrap(), HEADER_SIZE);
    }

    #[test]
    fn test_fragmentation_score() {
        let (_medium, mut fat) = new_fat(10);
        let empty = fat.fragmentation_score();

        let a = fat.allocate_block_sequence(1).unwrap();
        fat.allocate_block_sequence(1).unwrap();
        let b = fat.allocate_block_sequence(1).unwrap();
        fat.allocate_block_sequence(1).unwrap();
        fat.release_block_sequence(a[0]).unwrap();
        fat.release_block_sequence(b[0]).unwrap();

        assert!(fat.fragmentation_score() > empty);
    }
}
