use thiserror::Error;

#[derive(Error, Debug)]
pub enum HfaError {
    #[error("Invalid magic: file is not an HFA container")]
    InvalidMagic,

    #[error("Corrupt container: {0}")]
    Corrupt(String),

    #[error("Corrupt block {block}: {reason}")]
    CorruptBlock { block: usize, reason: String },

    #[error("Malformed type definition: {0}")]
    MalformedType(String),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    #[error("Container is open read-only")]
    ReadOnly,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid band index: {0}")]
    BandIndex(usize),

    #[error("Invalid overview index {overview} for band {band}")]
    OverviewIndex { band: usize, overview: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, HfaError>;
