use thiserror::Error;

pub type ArborResult<T> = Result<T, ArborError>;

#[derive(Error, Debug)]
pub enum ArborError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt superblock: {0}")]
    CorruptSuperblock(String),

    #[error("Block {block} is out of range (file holds {extent} blocks)")]
    BlockOutOfRange { block: u64, extent: u64 },

    #[error("Torn chain read at block {block}: expected {expected} bytes, got {actual}")]
    TornChainRead {
        block: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid handle: missing {0} capability")]
    InvalidHandle(&'static str),

    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Database is closed")]
    Closed,
}

impl ArborError {
    /// Short error kind name, stable across message changes.
    pub fn kind(&self) -> &'static str {
        match self {
            ArborError::Io(_) => "io_error",
            ArborError::CorruptSuperblock(_) => "corrupt_superblock",
            ArborError::BlockOutOfRange { .. } => "block_out_of_range",
            ArborError::TornChainRead { .. } => "torn_chain_read",
            ArborError::InvalidHandle(_) => "invalid_handle",
            ArborError::InvalidPointer(_) => "invalid_pointer",
            ArborError::Codec(_) => "codec_error",
            ArborError::Storage(_) => "storage_error",
            ArborError::Config(_) => "config_error",
            ArborError::Index(_) => "index_error",
            ArborError::Closed => "closed",
        }
    }
}
