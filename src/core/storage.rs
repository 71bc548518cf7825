//! Block-oriented content store
//!
//! A [`BlockStorage`] keeps variable-length entries in fixed-size blocks of a
//! content stream. Which blocks belong to which entry is recorded by a
//! [`Fat`] living in the table stream of the same store.
//!
//! Each entry is laid out as one logical byte run spread over its chain:
//!
//! ```text
//! [length: i32 LE][!length: i32 LE][payload: length bytes]
//! ```
//!
//! The run is cut into `block_size` pieces in chain order, so blocks need not
//! be physically contiguous. The head block ID is the entry's public ID.

use crate::allocator::fat::Fat;
use crate::allocator::{BlockAllocator, BlockId};
use crate::config::{StoreConfig, MIN_BLOCK_SIZE};
use crate::error::{StoreError, Result};
use crate::header::{StorageHeader, STORAGE_HEADER_SIZE};
use crate::medium::{MediumLock, OpenMode, StorageMedium, StoreStream};
use crate::validation::StoreName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of the length + checksum header in front of every payload
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Largest payload an entry can hold
pub const MAX_CONTENT_LENGTH: usize = i32::MAX as usize - ENTRY_HEADER_SIZE;

/// Point-in-time usage figures of a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub name: String,
    pub block_size: u32,
    pub max_size: u64,
    pub used_size: u64,
    pub used_physical_size: u64,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub entries: usize,
    pub fragmentation_score: f64,
    pub writable: bool,
}

impl StorageStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Persistent block store over a table stream and a content stream
///
/// All methods take `&self`/`&mut self`; callers serialize access.
pub struct BlockStorage {
    name: StoreName,
    medium: Arc<dyn StorageMedium>,
    block_size: u32,
    max_size: u64,
    fat: Fat,
    content: Box<dyn StoreStream>,

    /// Exclusive writer lock; `None` when opened read-only
    lock: Option<MediumLock>,
}

impl std::fmt::Debug for BlockStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStorage")
            .field("name", &self.name.as_str())
            .field("block_size", &self.block_size)
            .field("max_size", &self.max_size)
            .field("fat", &self.fat)
            .field("writable", &self.lock.is_some())
            .finish()
    }
}

impl BlockStorage {
    /// Open the store `name` on `medium`, creating it if needed
    ///
    /// A store written with a different block size, or whose persisted state
    /// is damaged or incomplete, is wiped and initialized from scratch. If
    /// another owner holds the store lock, the store opens read-only and
    /// damaged state is reported instead of repaired.
    pub fn open(
        medium: Arc<dyn StorageMedium>,
        name: &str,
        block_size: u32,
        max_size: u64,
    ) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE || block_size as u64 > max_size {
            return Err(StoreError::InvalidBlockSize {
                block_size,
                min: MIN_BLOCK_SIZE,
                max_size,
            });
        }

        let name = StoreName::new(name)?;
        let max_blocks = i32::try_from(max_size.div_ceil(block_size as u64)).map_err(|_| {
            StoreError::InvalidArgument(format!(
                "max size {} with block size {} needs more blocks than the table can address",
                max_size, block_size
            ))
        })?;

        let lock = medium.try_lock(&name.lock_path())?;
        let (fat, content) = match lock {
            Some(_) => Self::load_or_initialize(&*medium, &name, block_size, max_blocks)?,
            None => {
                warn!("Store {} is locked by another owner, opening read-only", name);
                Self::load(&*medium, &name, block_size, max_blocks, OpenMode::ReadOnly)?
            }
        };

        info!(
            "Opened store {} ({} blocks of {} bytes, {} free)",
            name,
            max_blocks,
            block_size,
            fat.free_blocks()
        );

        Ok(BlockStorage {
            name,
            medium,
            block_size,
            max_size,
            fat,
            content,
            lock,
        })
    }

    /// Open a store described by a validated configuration
    pub fn open_with_config(medium: Arc<dyn StorageMedium>, config: &StoreConfig) -> Result<Self> {
        config.check()?;
        Self::open(medium, &config.name, config.block_size, config.max_size)
    }

    /// Delete every persisted resource of the store `name`
    ///
    /// Fails if the store is currently open for writing elsewhere.
    pub fn delete_store(medium: &dyn StorageMedium, name: &str) -> Result<()> {
        let name = StoreName::new(name)?;
        let lock = medium.try_lock(&name.lock_path())?.ok_or_else(|| {
            StoreError::Unavailable(format!("store {} is in use", name))
        })?;

        medium.delete(&name.fat_path())?;
        medium.delete(&name.content_path())?;
        drop(lock);
        medium.delete_dir(name.as_str())?;

        info!("Deleted store {}", name);
        Ok(())
    }

    fn load_or_initialize(
        medium: &dyn StorageMedium,
        name: &StoreName,
        block_size: u32,
        max_blocks: i32,
    ) -> Result<(Fat, Box<dyn StoreStream>)> {
        let fat_exists = medium.exists(&name.fat_path());
        let content_exists = medium.exists(&name.content_path());

        if !fat_exists && !content_exists {
            info!("Creating store {}", name);
            return Self::initialize(medium, name, block_size, max_blocks);
        }

        match Self::load(medium, name, block_size, max_blocks, OpenMode::ReadWrite) {
            Ok(loaded) => Ok(loaded),
            Err(e) if e.is_corruption() => {
                warn!("Reinitializing store {}: {}", name, e);
                Self::initialize(medium, name, block_size, max_blocks)
            }
            Err(e) => Err(e),
        }
    }

    fn load(
        medium: &dyn StorageMedium,
        name: &StoreName,
        block_size: u32,
        max_blocks: i32,
        mode: OpenMode,
    ) -> Result<(Fat, Box<dyn StoreStream>)> {
        for path in [name.fat_path(), name.content_path()] {
            if !medium.exists(&path) {
                return Err(StoreError::HeaderMismatch(format!("{} is missing", path)));
            }
        }

        let mut table = medium.open_stream(&name.fat_path(), mode)?;
        if table.len()? < STORAGE_HEADER_SIZE {
            return Err(StoreError::HeaderMismatch(
                "table stream is shorter than the storage header".to_string(),
            ));
        }

        let mut preamble = [0u8; STORAGE_HEADER_SIZE as usize];
        table.seek(SeekFrom::Start(0))?;
        table.read_exact(&mut preamble)?;
        let stored = StorageHeader::from_bytes(&preamble)?;
        if stored.block_size != block_size {
            return Err(StoreError::HeaderMismatch(format!(
                "store was written with block size {}, {} requested",
                stored.block_size, block_size
            )));
        }

        let mut content = medium.open_stream(&name.content_path(), mode)?;
        let fat = Fat::open_reconciling(table, STORAGE_HEADER_SIZE, max_blocks, |copy, source| {
            Self::holds_copy(&mut *content, block_size, copy, source)
        })?;
        Ok((fat, content))
    }

    /// Whether block `copy` starts with the bytes a compaction move of block
    /// `source` would have written into it
    fn holds_copy(
        content: &mut dyn StoreStream,
        block_size: u32,
        copy: BlockId,
        source: BlockId,
    ) -> Result<bool> {
        let block_size = block_size as u64;
        let len = content.len()?;
        let source_start = source as u64 * block_size;
        let copy_start = copy as u64 * block_size;
        let available = len.saturating_sub(source_start).min(block_size);
        if available == 0 || copy_start + available > len {
            return Ok(false);
        }

        let mut blocks = [vec![0u8; available as usize], vec![0u8; available as usize]];
        for (buffer, start) in blocks.iter_mut().zip([copy_start, source_start]) {
            content.seek(SeekFrom::Start(start))?;
            content.read_exact(buffer)?;
        }
        Ok(blocks[0] == blocks[1])
    }

    fn initialize(
        medium: &dyn StorageMedium,
        name: &StoreName,
        block_size: u32,
        max_blocks: i32,
    ) -> Result<(Fat, Box<dyn StoreStream>)> {
        medium.delete(&name.fat_path())?;
        medium.delete(&name.content_path())?;

        let mut table = medium.open_stream(&name.fat_path(), OpenMode::ReadWrite)?;
        table.write_all(&StorageHeader::new(block_size).to_bytes())?;
        let fat = Fat::initialize(table, STORAGE_HEADER_SIZE, max_blocks)?;

        let mut content = medium.open_stream(&name.content_path(), OpenMode::ReadWrite)?;
        content.flush()?;
        Ok((fat, content))
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.lock {
            Some(_) => Ok(()),
            None => Err(StoreError::ReadOnly),
        }
    }

    /// Byte capacity of a chain
    fn chain_capacity(&self, blocks: &[BlockId]) -> usize {
        blocks.len() * self.block_size as usize
    }

    /// Split a logical byte range of a chain into physical stream segments
    ///
    /// Yields `(physical_offset, range_in_data)` pairs.
    fn segments(
        &self,
        blocks: &[BlockId],
        start: usize,
        len: usize,
    ) -> Vec<(u64, std::ops::Range<usize>)> {
        let block_size = self.block_size as usize;
        let mut segments = Vec::new();
        let mut done = 0;

        while done < len {
            let logical = start + done;
            let block = blocks[logical / block_size];
            let within = logical % block_size;
            let n = (block_size - within).min(len - done);
            let physical = block as u64 * block_size as u64 + within as u64;
            segments.push((physical, done..done + n));
            done += n;
        }

        segments
    }

    fn write_chain(&mut self, blocks: &[BlockId], start: usize, data: &[u8]) -> Result<()> {
        for (physical, range) in self.segments(blocks, start, data.len()) {
            self.content.seek(SeekFrom::Start(physical))?;
            self.content.write_all(&data[range])?;
        }
        Ok(())
    }

    fn read_chain(&mut self, id: BlockId, blocks: &[BlockId], start: usize, len: usize) -> Result<Vec<u8>> {
        let available = self.content.len()?;
        let mut data = vec![0u8; len];

        for (physical, range) in self.segments(blocks, start, len) {
            let needed = physical + range.len() as u64;
            if needed > available {
                return Err(StoreError::TruncatedContent { id, needed, available });
            }
            self.content.seek(SeekFrom::Start(physical))?;
            self.content.read_exact(&mut data[range])?;
        }

        Ok(data)
    }

    /// Read and verify the length header of an entry
    fn read_length(&mut self, id: BlockId, blocks: &[BlockId]) -> Result<usize> {
        let header = self.read_chain(id, blocks, 0, ENTRY_HEADER_SIZE)?;
        let length = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let complement = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length != !complement || length < 0 {
            return Err(StoreError::ChecksumMismatch { id, length, complement });
        }

        let length = length as usize;
        let capacity = self.chain_capacity(blocks);
        if ENTRY_HEADER_SIZE + length > capacity {
            return Err(StoreError::CorruptedChain {
                head: id,
                reason: format!(
                    "entry claims {} bytes but its {} blocks hold {}",
                    length,
                    blocks.len(),
                    capacity
                ),
            });
        }

        Ok(length)
    }

    /// Store `content` as a new entry and return its ID
    pub fn save(&mut self, content: &[u8]) -> Result<BlockId> {
        self.ensure_writable()?;

        if content.len() > MAX_CONTENT_LENGTH {
            return Err(StoreError::InvalidArgument(format!(
                "content of {} bytes exceeds the entry limit of {}",
                content.len(),
                MAX_CONTENT_LENGTH
            )));
        }

        let total = ENTRY_HEADER_SIZE + content.len();
        let count = total.div_ceil(self.block_size as usize);

        let blocks = self.fat.allocate_block_sequence(count).map_err(|e| match e {
            StoreError::Io(io) => StoreError::Allocation(format!("not enough space: {}", io)),
            other => other,
        })?;
        let id = blocks[0];

        let length = content.len() as i32;
        let mut data = Vec::with_capacity(total);
        data.extend_from_slice(&length.to_le_bytes());
        data.extend_from_slice(&(!length).to_le_bytes());
        data.extend_from_slice(content);

        let written = self
            .write_chain(&blocks, 0, &data)
            .and_then(|_| Ok(self.content.flush()?));
        if let Err(e) = written {
            if let Err(release) = self.fat.release_block_sequence(id) {
                warn!("Failed to release blocks of unsaved entry {}: {}", id, release);
            }
            return Err(match e {
                StoreError::Io(io) => StoreError::Allocation(format!("not enough space: {}", io)),
                other => other,
            });
        }

        debug!("Saved {} bytes as entry {} ({} blocks)", content.len(), id, count);
        Ok(id)
    }

    /// Write `content` at payload `offset` of entry `id`
    ///
    /// The stored length is not consulted: the caller guarantees the write
    /// stays within the entry. Only the allocated block span is enforced.
    pub fn overwrite(&mut self, id: BlockId, content: &[u8], offset: usize) -> Result<()> {
        self.ensure_writable()?;

        let blocks = self.fat.get_blocks_in_sequence(id)?;
        let capacity = self.chain_capacity(&blocks);
        let end = ENTRY_HEADER_SIZE
            .checked_add(offset)
            .and_then(|start| start.checked_add(content.len()));

        match end {
            Some(end) if end <= capacity => {}
            _ => {
                return Err(StoreError::SpanOverflow {
                    id,
                    offset,
                    len: content.len(),
                    capacity: capacity - ENTRY_HEADER_SIZE,
                })
            }
        }

        self.write_chain(&blocks, ENTRY_HEADER_SIZE + offset, content)?;
        self.content.flush()?;

        debug!("Overwrote {} bytes of entry {} at offset {}", content.len(), id, offset);
        Ok(())
    }

    /// Like [`BlockStorage::overwrite`], but refuses writes past the stored length
    pub fn overwrite_checked(&mut self, id: BlockId, content: &[u8], offset: usize) -> Result<()> {
        self.ensure_writable()?;

        let blocks = self.fat.get_blocks_in_sequence(id)?;
        let length = self.read_length(id, &blocks)?;
        match offset.checked_add(content.len()) {
            Some(end) if end <= length => self.overwrite(id, content, offset),
            _ => Err(StoreError::SpanOverflow {
                id,
                offset,
                len: content.len(),
                capacity: length,
            }),
        }
    }

    /// Read the payload of entry `id`
    pub fn read(&mut self, id: BlockId) -> Result<Vec<u8>> {
        let blocks = self.fat.get_blocks_in_sequence(id)?;
        let length = self.read_length(id, &blocks)?;
        let data = self.read_chain(id, &blocks, ENTRY_HEADER_SIZE, length)?;

        debug!("Read {} bytes from entry {}", length, id);
        Ok(data)
    }

    /// Free the blocks of entry `id`
    pub fn remove(&mut self, id: BlockId) -> Result<()> {
        self.ensure_writable()?;
        self.fat.release_block_sequence(id)?;
        debug!("Removed entry {}", id);
        Ok(())
    }

    /// IDs of all stored entries
    pub fn get_ids(&self) -> BTreeSet<BlockId> {
        self.fat.current_block_sequence_ids()
    }

    fn copy_block(&mut self, from: BlockId, to: BlockId) -> Result<()> {
        let block_size = self.block_size as u64;
        let source = from as u64 * block_size;
        let available = self.content.len()?.saturating_sub(source).min(block_size);
        if available == 0 {
            return Ok(());
        }

        let mut buffer = vec![0u8; available as usize];
        self.content.seek(SeekFrom::Start(source))?;
        self.content.read_exact(&mut buffer)?;
        self.content.seek(SeekFrom::Start(to as u64 * block_size))?;
        self.content.write_all(&buffer)?;
        Ok(())
    }

    /// Pack used blocks to the front and shrink both streams
    ///
    /// Returns `old_id -> new_id` for every entry whose head block moved.
    /// Entries missing from the map keep their ID.
    pub fn compact(&mut self) -> Result<HashMap<BlockId, BlockId>> {
        self.ensure_writable()?;

        let before = self.used_physical_size()?;
        let suggestions = self.fat.get_compact_suggestions();
        let mut moved = HashMap::new();

        for suggestion in &suggestions {
            self.copy_block(suggestion.from, suggestion.to)?;
            self.content.flush()?;
            self.fat.accept_compact_suggestion(*suggestion)?;
            if suggestion.is_head {
                moved.insert(suggestion.from, suggestion.to);
            }
        }

        let first_free = self.fat.trim()?;
        let keep = first_free as u64 * self.block_size as u64;
        if self.content.len()? > keep {
            self.content.set_len(keep)?;
        }
        self.content.flush()?;

        info!(
            "Compacted store {}: {} blocks moved, {} entries renumbered, {} -> {} bytes",
            self.name,
            suggestions.len(),
            moved.len(),
            before,
            self.used_physical_size()?
        );
        Ok(moved)
    }

    /// Flush both streams and release the store lock
    pub fn close(mut self) -> Result<()> {
        self.fat.flush()?;
        self.content.flush()?;
        debug!("Closed store {}", self.name);
        Ok(())
    }

    pub fn name(&self) -> &StoreName {
        &self.name
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Configured quota in bytes
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes taken by allocated blocks
    pub fn used_size(&self) -> u64 {
        (self.fat.total_blocks() - self.fat.free_blocks()) as u64 * self.block_size as u64
    }

    /// Bytes taken by the table and content streams on the medium
    pub fn used_physical_size(&self) -> Result<u64> {
        Ok(self.content.len()? + self.fat.stream_len()?)
    }

    pub fn free_blocks(&self) -> usize {
        self.fat.free_blocks()
    }

    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    pub fn medium(&self) -> &Arc<dyn StorageMedium> {
        &self.medium
    }

    pub fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            name: self.name.raw().to_string(),
            block_size: self.block_size,
            max_size: self.max_size,
            used_size: self.used_size(),
            used_physical_size: self.used_physical_size()?,
            total_blocks: self.fat.total_blocks(),
            free_blocks: self.fat.free_blocks(),
            entries: self.fat.current_block_sequence_ids().len(),
            fragmentation_score: self.fat.fragmentation_score(),
            writable: self.is_writable(),
        })
    }
}
