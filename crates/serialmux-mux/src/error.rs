use serialmux_frame::FrameError;
use serialmux_snapshot::SnapshotError;

/// Errors surfaced by the multiplexer's host-facing API and snapshot codec.
///
/// Guest protocol violations never appear here; they are answered on the
/// control channel (or dropped) and the stream keeps running.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// No service registered under this name.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The service refused the connection or is at capacity.
    #[error("service '{0}' is busy")]
    ServiceBusy(String),

    /// No live client on this channel.
    #[error("no client on channel {0}")]
    UnknownChannel(i32),

    /// A client already occupies this channel.
    #[error("channel {0} already connected")]
    ChannelInUse(i32),

    /// Channel id outside the wire range (2 hex digits, 0 reserved).
    #[error("channel id out of range: {0}")]
    InvalidChannel(i32),

    /// The snapshot was written by an incompatible format version.
    #[error("snapshot version mismatch (found {found}, expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    /// The snapshot names a service that is not currently registered.
    #[error("snapshot references unregistered service '{0}'")]
    MissingService(String),

    /// The snapshot contains a client on a reserved or out-of-range channel.
    #[error("snapshot contains invalid client channel {0}")]
    InvalidSnapshotChannel(i32),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, MuxError>;
