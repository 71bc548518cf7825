//! Block storage core
//!
//! Persistent, quota-bounded storage of variable-length blobs on top of a
//! file allocation table.
//!
//! - [`error`] - Error types for store operations
//! - [`config`] - Store and scavenging configuration
//! - [`validation`] - Store name sanitizing
//! - [`header`] - Binary preambles of the table stream
//! - [`medium`] - Storage media the streams live on
//! - [`allocator`] - Block allocation:
//!   - [`allocator::fat`] - File allocation table with chain links
//! - [`storage`] - Entry store over a table and a content stream
//! - [`scavenging`] - Size-based eviction and compaction policy
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ <store>/fat                                  │
//! │  - Storage header: block size + complement   │
//! │  - FAT header (32 bytes): magic, max blocks  │
//! │  - One i32 link per block                    │
//! ├──────────────────────────────────────────────┤
//! │ <store>/content                              │
//! │  - block_size-byte blocks                    │
//! │  - Entry: [len][!len][payload] over a chain  │
//! ├──────────────────────────────────────────────┤
//! │ <store>/lock                                 │
//! │  - Exclusive writer lock                     │
//! └──────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod header;
pub mod medium;
pub mod scavenging;
pub mod storage;
pub mod validation;

pub use allocator::{fat::Fat, BlockAllocator, BlockId, CompactSuggestion};
pub use error::{Result, StoreError};
pub use storage::{BlockStorage, StorageStats};
