//! Serial-level framing for the guest/host control channel.
//!
//! Every packet on the shared serial line carries a 6-byte ASCII-hex header
//! holding a channel id and a payload length. Two header layouts exist:
//! - Normal: 2-digit channel, then 4-digit length
//! - Legacy: 4-digit length, then 2-digit channel
//!
//! The layout in use is auto-detected from the very first header received.
//! Incoming bytes may be chunked arbitrarily; [`SerialFramer::feed`] hides
//! that and hands back complete `(channel, payload)` messages.

pub mod codec;
pub mod error;
pub mod framer;
pub mod sink;

pub use codec::{
    decode_header, decode_hex, encode_header, encode_hex, Dialect, FRAME_HEADER_SIZE, HEADER_SIZE,
    LEGACY_PROBE_ACK_HEADER, LEGACY_SERVICES, MAX_LOGICAL_PAYLOAD, MAX_SERIAL_PAYLOAD,
};
pub use error::{FrameError, Result};
pub use framer::{SerialFrame, SerialFramer};
pub use sink::Sink;
