use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid block size: {block_size} (must be >= {min} and <= max size {max_size})")]
    InvalidBlockSize {
        block_size: u32,
        min: u32,
        max_size: u64,
    },

    #[error("Invalid store name: {0}")]
    InvalidStoreName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Out of space: not enough space ({requested} blocks requested, {available} free)")]
    OutOfSpace { requested: usize, available: usize },

    #[error("Write of {len} bytes at payload offset {offset} overflows the {capacity} bytes allocated to entry {id}")]
    SpanOverflow {
        id: i32,
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Corrupted block chain at {head}: {reason}")]
    CorruptedChain { head: i32, reason: String },

    #[error("Corrupted allocation table: {0}")]
    CorruptedTable(String),

    #[error("Header checksum mismatch for entry {id} (length {length:#010x}, complement {complement:#010x})")]
    ChecksumMismatch { id: i32, length: i32, complement: i32 },

    #[error("Truncated content for entry {id}: needed {needed} bytes, stream holds {available}")]
    TruncatedContent { id: i32, needed: u64, available: u64 },

    #[error("Header mismatch: {0}")]
    HeaderMismatch(String),

    #[error("Invalid magic number in header")]
    InvalidMagic,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is open read-only")]
    ReadOnly,

    #[error("Storage medium unavailable: {0}")]
    Unavailable(String),

    #[error("Data consistency error: {0}")]
    DataConsistency(String),

    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors caused by damaged persisted state.
    ///
    /// Callers use this to decide between wiping the store and retrying.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptedChain { .. }
                | StoreError::CorruptedTable(_)
                | StoreError::ChecksumMismatch { .. }
                | StoreError::TruncatedContent { .. }
                | StoreError::HeaderMismatch(_)
                | StoreError::InvalidMagic
        )
    }

    /// True for errors caused by running out of blocks or medium space.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            StoreError::Allocation(_) | StoreError::OutOfSpace { .. } | StoreError::SpanOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
