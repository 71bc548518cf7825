//! Size-based scavenging
//!
//! [`SizeBasedScavengingStrategy`] decides from store usage whether cache
//! entries should be evicted, in which order, and whether the store should be
//! compacted once an eviction pass is over. It never mutates cache state
//! itself: entries are handed in as an [`EntrySnapshot`], and the only change
//! it may request is an ID remap through [`EntryIdRemap`] after compaction.

use crate::allocator::BlockId;
use crate::config::ScavengingConfig;
use crate::error::{StoreError, Result};
use crate::storage::BlockStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Share of the effective maximum size that physical usage must exceed
/// logical usage by before compaction is worth running
pub const COMPACTION_SLACK_RATIO: f64 = 0.1;

/// Eviction priority of a cache entry, lowest evicted first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheItemPriority {
    Low,
    #[default]
    Normal,
    High,
    /// Never evicted
    NotRemovable,
}

/// Read-only view of a cache entry
pub trait ScavengeEntry {
    fn priority(&self) -> CacheItemPriority;

    fn last_access(&self) -> DateTime<Utc>;

    /// Block storage ID of the persisted entry, if it has been persisted
    fn storage_id(&self) -> Option<BlockId>;
}

/// Borrowed collection of cache entries
pub trait EntrySnapshot {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &dyn ScavengeEntry> + '_>;
}

/// Storage ID rewrite applied after compaction moved an entry
pub trait EntryIdRemap {
    /// Point the entry stored under `old` at `new`
    ///
    /// Returns false if no entry was stored under `old`.
    fn remap_storage_id(&mut self, old: BlockId, new: BlockId) -> bool;
}

/// Store whose usage drives scavenging decisions
pub trait ScavengeTarget {
    /// Configured quota in bytes
    fn max_size(&self) -> u64;

    /// Bytes taken by allocated blocks
    fn used_size(&self) -> u64;

    /// Bytes taken on the medium
    fn used_physical_size(&self) -> Result<u64>;

    /// Free space left on the underlying medium
    fn available_free_space(&self) -> Result<u64>;

    fn is_writable(&self) -> bool;

    /// Compact the store, returning `old_id -> new_id` for moved entries
    fn compact(&mut self) -> Result<HashMap<BlockId, BlockId>>;
}

impl ScavengeTarget for BlockStorage {
    fn max_size(&self) -> u64 {
        BlockStorage::max_size(self)
    }

    fn used_size(&self) -> u64 {
        BlockStorage::used_size(self)
    }

    fn used_physical_size(&self) -> Result<u64> {
        BlockStorage::used_physical_size(self)
    }

    fn available_free_space(&self) -> Result<u64> {
        Ok(self.medium().available_free_space()?)
    }

    fn is_writable(&self) -> bool {
        BlockStorage::is_writable(self)
    }

    fn compact(&mut self) -> Result<HashMap<BlockId, BlockId>> {
        BlockStorage::compact(self)
    }
}

/// In-memory cache entry tracked by a [`CacheIndex`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub priority: CacheItemPriority,
    pub last_access: DateTime<Utc>,
    pub storage_id: Option<BlockId>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, storage_id: Option<BlockId>, priority: CacheItemPriority) -> Self {
        CacheEntry {
            key: key.into(),
            priority,
            last_access: Utc::now(),
            storage_id,
        }
    }

    /// Mark the entry as accessed now
    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }
}

impl ScavengeEntry for CacheEntry {
    fn priority(&self) -> CacheItemPriority {
        self.priority
    }

    fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    fn storage_id(&self) -> Option<BlockId> {
        self.storage_id
    }
}

/// Key to entry map of a cache, with a reverse storage ID index
#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    by_storage_id: HashMap<BlockId, String>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for its key, returning the previous one
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let previous = self.remove(&entry.key);
        if let Some(id) = entry.storage_id {
            self.by_storage_id.insert(id, entry.key.clone());
        }
        self.entries.insert(entry.key.clone(), entry);
        previous
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(id) = entry.storage_id {
            self.by_storage_id.remove(&id);
        }
        Some(entry)
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Look an entry up and mark it as accessed
    pub fn touch(&mut self, key: &str) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.touch();
        Some(entry)
    }

    pub fn get_by_storage_id(&self, id: BlockId) -> Option<&CacheEntry> {
        self.by_storage_id.get(&id).and_then(|key| self.entries.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }
}

impl EntrySnapshot for CacheIndex {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &dyn ScavengeEntry> + '_> {
        Box::new(self.entries.values().map(|entry| entry as &dyn ScavengeEntry))
    }
}

impl EntryIdRemap for CacheIndex {
    fn remap_storage_id(&mut self, old: BlockId, new: BlockId) -> bool {
        let Some(key) = self.by_storage_id.remove(&old) else {
            return false;
        };

        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.storage_id = Some(new);
                self.by_storage_id.insert(new, key);
                true
            }
            None => false,
        }
    }
}

/// Scavenging policy bounded by a share of the effective maximum size
///
/// The effective maximum is the lesser of the store quota and what the medium
/// could hold: its free space plus what the store already occupies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeBasedScavengingStrategy {
    max_percent_before: f64,
    percent_after: f64,
}

impl SizeBasedScavengingStrategy {
    pub fn new(config: ScavengingConfig) -> Result<Self> {
        let (max_percent_before, percent_after) = config.resolve()?;
        Ok(SizeBasedScavengingStrategy {
            max_percent_before,
            percent_after,
        })
    }

    /// Shorthand for `new(ScavengingConfig::new(before, after))`
    pub fn with_thresholds(before: f64, after: f64) -> Result<Self> {
        Self::new(ScavengingConfig::new(before, after))
    }

    pub fn max_percent_used_before_scavenging(&self) -> f64 {
        self.max_percent_before
    }

    pub fn percent_used_left_after_scavenging(&self) -> f64 {
        self.percent_after
    }

    pub fn effective_max_size(&self, target: &dyn ScavengeTarget) -> Result<u64> {
        let ceiling = target
            .available_free_space()?
            .saturating_add(target.used_physical_size()?);
        Ok(target.max_size().min(ceiling))
    }

    /// Whether the store holds enough dead space under enough pressure to compact
    pub fn is_compaction_warranted(&self, target: &dyn ScavengeTarget) -> Result<bool> {
        if !target.is_writable() {
            return Ok(false);
        }

        let physical = target.used_physical_size()?;
        let max = self.effective_max_size(target)? as f64;
        let under_pressure = physical as f64 > self.max_percent_before * max;
        let slack = physical.saturating_sub(target.used_size()) as f64;

        Ok(under_pressure && slack > COMPACTION_SLACK_RATIO * max)
    }

    pub fn should_scavenge(&self, target: &dyn ScavengeTarget, entries: &dyn EntrySnapshot) -> Result<bool> {
        if !target.is_writable() {
            return Ok(false);
        }

        if self.is_compaction_warranted(target)? {
            return Ok(true);
        }

        if entries.is_empty() {
            return Ok(false);
        }

        let physical = target.used_physical_size()? as f64;
        let max = self.effective_max_size(target)? as f64;
        Ok(physical > self.max_percent_before * max)
    }

    /// Whether an eviction loop should evict another entry
    pub fn should_scavenge_more(&self, target: &dyn ScavengeTarget, entries: &dyn EntrySnapshot) -> Result<bool> {
        if !target.is_writable() || entries.is_empty() {
            return Ok(false);
        }

        let physical = target.used_physical_size()? as f64;
        let max = self.effective_max_size(target)? as f64;
        Ok(physical > self.percent_after * max)
    }

    /// Removable entries, lowest priority first, then least recently accessed
    pub fn entries_to_scavenge<'a>(&self, entries: &'a dyn EntrySnapshot) -> Vec<&'a dyn ScavengeEntry> {
        let mut candidates: Vec<&dyn ScavengeEntry> = entries
            .entries()
            .filter(|entry| entry.priority() != CacheItemPriority::NotRemovable)
            .collect();
        candidates.sort_by_key(|entry| (entry.priority(), entry.last_access()));
        candidates
    }

    /// Compact the store if warranted and remap moved entries
    ///
    /// Returns the applied `old_id -> new_id` map (empty when no compaction
    /// ran).
    pub fn on_finishing_scavenging(
        &self,
        target: &mut dyn ScavengeTarget,
        entries: &mut dyn EntryIdRemap,
    ) -> Result<HashMap<BlockId, BlockId>> {
        if !self.is_compaction_warranted(target)? {
            debug!("Compaction not warranted after scavenging");
            return Ok(HashMap::new());
        }

        let moved = target.compact()?;
        for (&old, &new) in &moved {
            if !entries.remap_storage_id(old, new) {
                return Err(StoreError::DataConsistency(format!(
                    "compaction moved entry {} to {} but no cache entry is stored under {}",
                    old, new, old
                )));
            }
        }

        info!("Compaction after scavenging remapped {} entries", moved.len());
        Ok(moved)
    }
}

impl Default for SizeBasedScavengingStrategy {
    fn default() -> Self {
        SizeBasedScavengingStrategy {
            max_percent_before: crate::config::DEFAULT_MAX_PERCENT_BEFORE,
            percent_after: crate::config::DEFAULT_PERCENT_AFTER,
        }
    }
}
