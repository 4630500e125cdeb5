/// Errors that can occur while framing or sending serial packets.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A header field does not decode as ASCII hex.
    #[error("malformed serial header {0:?}")]
    MalformedHeader(String),

    /// A payload exceeds what the framing layer can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A channel id outside the 2-hex-digit wire range.
    #[error("channel id out of range: {0}")]
    InvalidChannel(i32),

    /// An I/O error from the serial transport.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
