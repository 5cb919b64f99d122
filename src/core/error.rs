use crate::compression::Algorithm;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Format mismatch: {0}")]
    Format(String),

    #[error("Corrupt directory at {offset:#x}: {reason}")]
    CorruptDirectory { offset: u64, reason: String },

    #[error("Index corruption at {offset:#x}: {reason}")]
    IndexCorruption { offset: u64, reason: String },

    #[error("Invalid free of {length:#x} bytes at {offset:#x}: {reason}")]
    InvalidFree {
        offset: u64,
        length: u64,
        reason: &'static str,
    },

    #[error("Address overflow: {offset:#x} + {length:#x}")]
    AddressOverflow { offset: u64, length: u64 },

    #[error("Area full: block {block:#x} exceeds capacity of area starting at block {area_start:#x}")]
    AreaFull { block: u64, area_start: u64 },

    #[error("Compression backend unavailable for {0}")]
    Unavailable(Algorithm),

    #[error("Position {pos:#x} out of range (limit {limit:#x})")]
    OutOfRange { pos: u64, limit: u64 },

    #[error("Write to read-only store")]
    ReadOnlyViolation,

    #[error("Overlapping allocation of {length:#x} bytes at {offset:#x} ({tag})")]
    Overlap {
        offset: u64,
        length: u64,
        tag: String,
    },

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Executable reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlashError {
    /// Shorthand for a [`FlashError::Format`] with a formatted message.
    pub fn format(msg: impl Into<String>) -> Self {
        FlashError::Format(msg.into())
    }

    /// True for signature/structure mismatches that mean "try the next candidate format".
    pub fn is_format(&self) -> bool {
        matches!(self, FlashError::Format(_))
    }

    /// True when the error only affects a single entry and the container stays usable.
    pub fn is_entry_local(&self) -> bool {
        matches!(
            self,
            FlashError::CorruptDirectory { .. }
                | FlashError::IndexCorruption { .. }
                | FlashError::Unavailable(_)
                | FlashError::Codec(_)
                | FlashError::Reconstruction(_)
                | FlashError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlashError>;
