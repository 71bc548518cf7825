//! Binary preambles for the table stream
//!
//! The table stream of a store starts with a [`StorageHeader`] recording the
//! block size the content stream was written with, followed by the FAT region.
//! The FAT region itself starts with a [`FatHeader`] and then holds one
//! little-endian `i32` link entry per block.
//!
//! ```text
//! offset 0                 8                                  8 + 32
//! ┌────────────────────────┬──────────────────────────────────┬───────────────────────┐
//! │ blockSize | !blockSize │ magic(2) | maxBlocks(4) | 0 ...  │ entry 0 | entry 1 ... │
//! └────────────────────────┴──────────────────────────────────┴───────────────────────┘
//!   StorageHeader            FatHeader (HEADER_SIZE bytes)      4 bytes per block
//! ```

use crate::error::{StoreError, Result};

/// FAT magic number
pub const FAT_MAGIC: [u8; 2] = [0xFA, 0x7B];

/// Bytes reserved at the front of the FAT region
pub const HEADER_SIZE: u64 = 32;

/// Size of one persisted FAT entry
pub const ENTRY_SIZE: u64 = 4;

/// Size of the storage preamble in front of the FAT region
pub const STORAGE_HEADER_SIZE: u64 = 8;

/// Header of the FAT region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatHeader {
    pub magic: [u8; 2],
    pub max_blocks: i32,
}

impl FatHeader {
    pub fn new(max_blocks: i32) -> Self {
        FatHeader {
            magic: FAT_MAGIC,
            max_blocks,
        }
    }

    /// Check magic and the expected table size
    pub fn validate(&self, expected_max_blocks: i32) -> Result<()> {
        if self.magic != FAT_MAGIC {
            return Err(StoreError::InvalidMagic);
        }

        if self.max_blocks != expected_max_blocks {
            return Err(StoreError::HeaderMismatch(format!(
                "table holds {} blocks, expected {}",
                self.max_blocks, expected_max_blocks
            )));
        }

        Ok(())
    }

    /// Serialize to exactly `HEADER_SIZE` bytes, reserved tail zeroed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE as usize);
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.max_blocks.to_le_bytes());
        bytes.resize(HEADER_SIZE as usize, 0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(StoreError::HeaderMismatch(format!(
                "FAT header needs 6 bytes, got {}",
                bytes.len()
            )));
        }

        Ok(FatHeader {
            magic: [bytes[0], bytes[1]],
            max_blocks: i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }
}

/// Preamble recording the block size of the content stream
///
/// The block size is stored next to its bitwise complement so a torn or
/// zeroed preamble is told apart from a legitimate one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageHeader {
    pub block_size: u32,
}

impl StorageHeader {
    pub fn new(block_size: u32) -> Self {
        StorageHeader { block_size }
    }

    pub fn to_bytes(&self) -> [u8; STORAGE_HEADER_SIZE as usize] {
        let mut bytes = [0u8; STORAGE_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[4..8].copy_from_slice(&(!self.block_size).to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STORAGE_HEADER_SIZE as usize {
            return Err(StoreError::HeaderMismatch(format!(
                "storage header needs {} bytes, got {}",
                STORAGE_HEADER_SIZE,
                bytes.len()
            )));
        }

        let block_size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let complement = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if block_size != !complement {
            return Err(StoreError::HeaderMismatch(format!(
                "block size {:#010x} does not match its complement {:#010x}",
                block_size, complement
            )));
        }

        Ok(StorageHeader { block_size })
    }
}
