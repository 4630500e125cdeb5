//! Typed sequential streams for emulator snapshot persistence.
//!
//! A snapshot is written as a flat sequence of fixed-width big-endian
//! integers and length-prefixed byte buffers. The [`SnapshotSink`] and
//! [`SnapshotSource`] traits abstract over where those bytes live: the
//! in-memory [`bytes`] implementations back the tests, while the
//! [`IoSink`]/[`IoSource`] adapters plug into whatever file stream the
//! emulator's snapshot machinery provides.

pub mod error;
pub mod stream;

pub use error::{Result, SnapshotError};
pub use stream::{IoSink, IoSource, SnapshotSink, SnapshotSource, MAX_SNAPSHOT_BUFFER};
