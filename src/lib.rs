//! # blockstore-rs - Quota-Bounded Block Storage for Caches
//!
//! `blockstore-rs` persists variable-length binary blobs inside a fixed storage
//! quota, for use as the backing store of a client-side object cache:
//!
//! - **FAT block allocation** with linked block chains and first-fit allocation
//! - **Overwrite in place** for entries whose size does not change
//! - **Online compaction** that packs blocks and shrinks the backing streams
//! - **Corruption detection** with wipe-and-reinitialize recovery
//! - **Size-based scavenging** deciding when to evict and what to evict first
//!
//! ## Quick Start
//!
//! ```rust
//! use blockstore_rs::{CacheStoreBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! // In-memory medium; use `.directory(..)` for a store on disk
//! let mut store = CacheStoreBuilder::new()
//!     .name("thumbnails")
//!     .block_size(64)
//!     .max_size(64 * 1024)
//!     .build()?;
//!
//! let id = store.save(b"Hello, World!")?.expect("store is writable");
//! assert_eq!(store.read(id)?.as_deref(), Some(&b"Hello, World!"[..]));
//!
//! store.remove(id)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lower-Level Access
//!
//! ```rust
//! use blockstore_rs::{BlockStorage, MemoryMedium, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let medium = Arc::new(MemoryMedium::new());
//! let mut storage = BlockStorage::open(medium, "images", 32, 4096)?;
//!
//! let id = storage.save(&[7u8; 100])?;
//! storage.overwrite(id, &[9u8; 10], 0)?;
//! let moved = storage.compact()?;
//! let id = moved.get(&id).copied().unwrap_or(id);
//! assert_eq!(&storage.read(id)?[..10], &[9u8; 10]);
//! # Ok(())
//! # }
//! ```

// Storage core
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{allocator, config, error, header, medium, scavenging, storage, validation};

// Re-export core types that users need
pub use crate::core::{
    allocator::{fat::Fat, BlockAllocator, BlockId, CompactSuggestion, LAST_BLOCK, UNUSED_BLOCK},
    config::{CacheConfig, ScavengingConfig, StoreConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_SIZE, MIN_BLOCK_SIZE},
    error::{Result, StoreError},
    medium::{FileMedium, MediumLock, MemoryMedium, OpenMode, StorageMedium, StoreStream},
    scavenging::{
        CacheEntry, CacheIndex, CacheItemPriority, EntryIdRemap, EntrySnapshot, ScavengeEntry,
        ScavengeTarget, SizeBasedScavengingStrategy,
    },
    storage::{BlockStorage, StorageStats},
    validation::StoreName,
};

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache-facing block store
///
/// Wraps a [`BlockStorage`] and degrades instead of failing:
/// - if the medium is unavailable at open, the store runs disabled and every
///   operation behaves as a cache miss or a no-op
/// - if another owner holds the store, writes are skipped
/// - if a read hits corrupted state, the whole store is wiped and
///   reinitialized and the read reports a miss
///
/// # Examples
///
/// ```rust
/// use blockstore_rs::{CacheStore, MemoryMedium, StoreConfig};
/// use std::sync::Arc;
///
/// # fn main() -> blockstore_rs::Result<()> {
/// let medium = MemoryMedium::new();
/// let store = CacheStore::open(Arc::new(medium.clone()), StoreConfig::new("a", 32, 1024))?;
/// assert!(store.is_enabled() && store.is_writable());
///
/// medium.set_unavailable(true);
/// let mut disabled = CacheStore::open(Arc::new(medium), StoreConfig::new("b", 32, 1024))?;
/// assert!(!disabled.is_enabled());
/// assert_eq!(disabled.save(b"dropped")?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CacheStore {
    medium: Arc<dyn StorageMedium>,
    config: StoreConfig,
    storage: Option<BlockStorage>,
}

impl CacheStore {
    /// Open the store described by `config` on `medium`
    ///
    /// Invalid configuration is an error. An unusable medium is not: the
    /// store comes up disabled.
    pub fn open(medium: Arc<dyn StorageMedium>, config: StoreConfig) -> Result<Self> {
        config.check()?;
        info!("Opening cache store '{}'", config.name);

        let storage = Self::open_storage(&medium, &config);
        Ok(CacheStore {
            medium,
            config,
            storage,
        })
    }

    fn open_storage(medium: &Arc<dyn StorageMedium>, config: &StoreConfig) -> Option<BlockStorage> {
        match BlockStorage::open_with_config(medium.clone(), config) {
            Ok(storage) => {
                if !storage.is_writable() {
                    warn!("Cache store '{}' is read-only", config.name);
                }
                Some(storage)
            }
            Err(e) => {
                warn!("Cache store '{}' disabled: {}", config.name, e);
                None
            }
        }
    }

    /// Whether a backing store is available
    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    /// Whether writes reach the backing store
    pub fn is_writable(&self) -> bool {
        self.storage.as_ref().is_some_and(BlockStorage::is_writable)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn writable_storage(&mut self) -> Option<&mut BlockStorage> {
        self.storage.as_mut().filter(|storage| storage.is_writable())
    }

    /// Persist `content`, returning its ID, or `None` if nothing was written
    pub fn save(&mut self, content: &[u8]) -> Result<Option<BlockId>> {
        match self.writable_storage() {
            Some(storage) => storage.save(content).map(Some),
            None => {
                debug!("Skipping save of {} bytes: store not writable", content.len());
                Ok(None)
            }
        }
    }

    /// Write `content` at payload `offset` of entry `id`
    ///
    /// Returns false if the store is not writable. Writes past the stored
    /// length are refused.
    pub fn overwrite(&mut self, id: BlockId, content: &[u8], offset: usize) -> Result<bool> {
        match self.writable_storage() {
            Some(storage) => storage.overwrite_checked(id, content, offset).map(|_| true),
            None => Ok(false),
        }
    }

    /// Read entry `id`, or `None` on a miss
    ///
    /// Corrupted state is recovered from by reinitializing the store.
    pub fn read(&mut self, id: BlockId) -> Result<Option<Vec<u8>>> {
        let Some(storage) = self.storage.as_mut() else {
            return Ok(None);
        };

        match storage.read(id) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_corruption() => {
                self.recover(&e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove(&mut self, id: BlockId) -> Result<()> {
        match self.writable_storage() {
            Some(storage) => storage.remove(id),
            None => Ok(()),
        }
    }

    /// IDs of all persisted entries
    pub fn ids(&self) -> BTreeSet<BlockId> {
        self.storage
            .as_ref()
            .map(BlockStorage::get_ids)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Result<Option<StorageStats>> {
        self.storage.as_ref().map(BlockStorage::stats).transpose()
    }

    /// Wipe and reinitialize the backing store
    ///
    /// A read-only store belongs to another owner and is left alone.
    fn recover(&mut self, cause: &StoreError) {
        if !self.is_writable() {
            warn!(
                "Cache store '{}' is corrupted but read-only, keeping it: {}",
                self.config.name, cause
            );
            return;
        }

        warn!("Cache store '{}' is corrupted, reinitializing: {}", self.config.name, cause);
        self.storage = None;

        if let Err(e) = BlockStorage::delete_store(&*self.medium, &self.config.name) {
            warn!("Failed to delete cache store '{}': {}", self.config.name, e);
        }
        self.storage = Self::open_storage(&self.medium, &self.config);
    }

    pub fn storage(&self) -> Option<&BlockStorage> {
        self.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> Option<&mut BlockStorage> {
        self.storage.as_mut()
    }

    /// Flush and release the backing store
    pub fn close(self) -> Result<()> {
        match self.storage {
            Some(storage) => storage.close(),
            None => Ok(()),
        }
    }
}

impl ScavengeTarget for CacheStore {
    fn max_size(&self) -> u64 {
        self.config.max_size
    }

    fn used_size(&self) -> u64 {
        self.storage.as_ref().map_or(0, BlockStorage::used_size)
    }

    fn used_physical_size(&self) -> Result<u64> {
        match &self.storage {
            Some(storage) => storage.used_physical_size(),
            None => Ok(0),
        }
    }

    fn available_free_space(&self) -> Result<u64> {
        Ok(self.medium.available_free_space()?)
    }

    fn is_writable(&self) -> bool {
        CacheStore::is_writable(self)
    }

    fn compact(&mut self) -> Result<HashMap<BlockId, BlockId>> {
        match self.writable_storage() {
            Some(storage) => storage.compact(),
            None => Ok(HashMap::new()),
        }
    }
}

/// Builder for customizing CacheStore creation
///
/// Provides a fluent API for the medium and store shape.
///
/// # Examples
///
/// ```rust,no_run
/// use blockstore_rs::CacheStoreBuilder;
///
/// # fn main() -> blockstore_rs::Result<()> {
/// let store = CacheStoreBuilder::new()
///     .name("images")
///     .directory("/var/cache/app", 50 * 1024 * 1024)?
///     .block_size(1024)
///     .max_size(20 * 1024 * 1024)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct CacheStoreBuilder {
    medium: Option<Arc<dyn StorageMedium>>,
    name: Option<String>,
    block_size: u32,
    max_size: u64,
}

impl CacheStoreBuilder {
    /// Create a new CacheStoreBuilder with default settings
    pub fn new() -> Self {
        CacheStoreBuilder {
            medium: None,
            name: None,
            block_size: DEFAULT_BLOCK_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    /// Set the store name (sanitized into the store namespace)
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the store quota in bytes
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Take name, block size and quota from a configuration
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.name = Some(config.name);
        self.block_size = config.block_size;
        self.max_size = config.max_size;
        self
    }

    /// Use a custom medium (defaults to a fresh in-memory medium)
    pub fn medium(mut self, medium: Arc<dyn StorageMedium>) -> Self {
        self.medium = Some(medium);
        self
    }

    /// Store under `root` on the local file system, bounded by `quota`
    pub fn directory<P: AsRef<Path>>(self, root: P, quota: u64) -> Result<Self> {
        let medium = FileMedium::new(root, quota)?;
        Ok(self.medium(Arc::new(medium)))
    }

    /// Build the CacheStore instance
    pub fn build(self) -> Result<CacheStore> {
        let name = self
            .name
            .ok_or_else(|| StoreError::InvalidConfig("store name must be set".to_string()))?;

        let medium = self
            .medium
            .unwrap_or_else(|| Arc::new(MemoryMedium::new()));

        debug!(
            "Building cache store '{}' ({} byte blocks, {} byte quota)",
            name, self.block_size, self.max_size
        );
        CacheStore::open(medium, StoreConfig::new(name, self.block_size, self.max_size))
    }
}

impl Default for CacheStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store(medium: &MemoryMedium, name: &str) -> CacheStore {
        CacheStore::open(Arc::new(medium.clone()), StoreConfig::new(name, 32, 32 * 32)).unwrap()
    }

    #[test]
    fn test_builder_requires_name() {
        assert!(matches!(
            CacheStoreBuilder::new().build(),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(CacheStoreBuilder::new().name("x").build().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_shape() {
        let result = CacheStoreBuilder::new().name("x").block_size(8).build();
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_round_trip() {
        let medium = MemoryMedium::new();
        let mut store = memory_store(&medium, "rt");

        let id = store.save(b"value").unwrap().unwrap();
        assert!(store.overwrite(id, b"V", 0).unwrap());
        assert_eq!(store.read(id).unwrap(), Some(b"Value".to_vec()));
        assert!(store.overwrite(id, b"too long", 0).is_err());

        store.remove(id).unwrap();
        assert!(store.ids().is_empty());
        assert_eq!(store.stats().unwrap().unwrap().entries, 0);
    }

    #[test]
    fn test_disabled_store_is_a_miss() {
        let medium = MemoryMedium::new();
        medium.set_unavailable(true);
        let mut store = memory_store(&medium, "off");

        assert!(!store.is_enabled());
        assert!(!store.is_writable());
        assert_eq!(store.save(b"x").unwrap(), None);
        assert_eq!(store.read(0).unwrap(), None);
        assert!(!store.overwrite(0, b"x", 0).unwrap());
        store.remove(0).unwrap();
        assert!(store.stats().unwrap().is_none());
        assert_eq!(ScavengeTarget::used_physical_size(&store).unwrap(), 0);
        assert!(store.compact().unwrap().is_empty());
    }

    #[test]
    fn test_read_only_store_skips_writes() {
        let medium = MemoryMedium::new();
        let mut owner = memory_store(&medium, "shared");
        let id = owner.save(b"owned").unwrap().unwrap();

        let mut guest = memory_store(&medium, "shared");
        assert!(guest.is_enabled());
        assert!(!guest.is_writable());
        assert_eq!(guest.save(b"x").unwrap(), None);
        assert_eq!(guest.read(id).unwrap(), Some(b"owned".to_vec()));
    }

    #[test]
    fn test_corrupted_read_reinitializes() {
        use std::io::{Seek, SeekFrom, Write};

        let medium = MemoryMedium::new();
        let mut store = memory_store(&medium, "heal");
        let id = store.save(b"payload").unwrap().unwrap();
        store.save(b"other").unwrap().unwrap();

        // Break the length checksum of the first entry
        let mut content = medium
            .open_stream("Cache_heal/content", OpenMode::ReadWrite)
            .unwrap();
        content.seek(SeekFrom::Start(0)).unwrap();
        content.write_all(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap();
        drop(content);

        assert_eq!(store.read(id).unwrap(), None);
        assert!(store.is_writable());
        assert!(store.ids().is_empty());

        let id = store.save(b"fresh").unwrap().unwrap();
        assert_eq!(store.read(id).unwrap(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_invalid_ids_are_errors_not_misses() {
        let medium = MemoryMedium::new();
        let mut store = memory_store(&medium, "ids");
        assert!(matches!(store.read(5), Err(StoreError::InvalidArgument(_))));
    }
}
