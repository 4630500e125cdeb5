/// Errors that can occur while reading or writing a snapshot stream.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The stream ended before a complete value could be read.
    #[error("snapshot stream truncated ({needed} more bytes needed)")]
    Truncated { needed: usize },

    /// A length-prefixed buffer exceeds the sanity limit.
    #[error("snapshot buffer too large ({size} bytes, max {max})")]
    BufferTooLarge { size: usize, max: usize },

    /// A length-prefixed string is not valid UTF-8.
    #[error("snapshot string is not valid UTF-8")]
    InvalidString,

    /// A decoded field holds a value the current format does not allow.
    #[error("invalid snapshot field: {0}")]
    InvalidField(String),

    /// An I/O error from the underlying stream.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
