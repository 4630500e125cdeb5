use crate::error::{FrameError, Result};

/// Serial header: 2 hex digits of channel + 4 hex digits of length = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Logical sub-frame header: 4 hex digits of total logical length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum payload a single serial packet may declare.
pub const MAX_SERIAL_PAYLOAD: usize = 4000;

/// Maximum total length of a sub-framed logical message (4 hex digits).
pub const MAX_LOGICAL_PAYLOAD: usize = 0xffff;

/// First header a legacy daemon sends after the probe: the legacy-layout
/// header of its fixed `ok:connect:gsm:01` acknowledgement (17 bytes on
/// channel 0). Receiving it as the very first header latches the dialect.
pub const LEGACY_PROBE_ACK_HEADER: [u8; HEADER_SIZE] = *b"001100";

/// Services a legacy daemon expects the host to connect during the probe,
/// with their pre-assigned channel ids.
pub const LEGACY_SERVICES: [(&str, i32); 3] = [("gsm", 1), ("gps", 2), ("control", 3)];

/// Byte order of the two serial header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// No header seen yet; encodes like [`Dialect::Normal`].
    #[default]
    Unknown,
    /// Length first, then channel.
    Legacy,
    /// Channel first, then length.
    Normal,
}

impl Dialect {
    pub fn as_u8(self) -> u8 {
        match self {
            Dialect::Unknown => 0,
            Dialect::Legacy => 1,
            Dialect::Normal => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Dialect::Unknown),
            1 => Some(Dialect::Legacy),
            2 => Some(Dialect::Normal),
            _ => None,
        }
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Decode an ASCII hex field. Accepts both cases; `None` on any non-digit.
pub fn decode_hex(field: &[u8]) -> Option<usize> {
    let mut value = 0usize;
    for &byte in field {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | digit as usize;
    }
    Some(value)
}

/// Encode `value` as lowercase hex, zero-padded to fill `dest`.
///
/// `value` must fit in `dest.len()` digits.
pub fn encode_hex(mut value: usize, dest: &mut [u8]) {
    debug_assert!(value < 1 << (4 * dest.len()));
    for slot in dest.iter_mut().rev() {
        *slot = HEX_DIGITS[value & 0xf];
        value >>= 4;
    }
}

/// Build a serial header for the given dialect.
///
/// [`Dialect::Unknown`] encodes with the normal field order.
pub fn encode_header(dialect: Dialect, channel: i32, length: usize) -> [u8; HEADER_SIZE] {
    debug_assert!((0..=0xff).contains(&channel));
    let mut header = [0u8; HEADER_SIZE];
    match dialect {
        Dialect::Legacy => {
            encode_hex(length, &mut header[..4]);
            encode_hex(channel as usize, &mut header[4..]);
        }
        Dialect::Unknown | Dialect::Normal => {
            encode_hex(channel as usize, &mut header[..2]);
            encode_hex(length, &mut header[2..]);
        }
    }
    header
}

/// Decode a serial header in the given dialect.
pub fn decode_header(dialect: Dialect, header: &[u8; HEADER_SIZE]) -> Result<(i32, usize)> {
    let (channel_field, length_field) = match dialect {
        Dialect::Legacy => (&header[4..], &header[..4]),
        Dialect::Unknown | Dialect::Normal => (&header[..2], &header[2..]),
    };
    let channel = decode_hex(channel_field);
    let length = decode_hex(length_field);
    match (channel, length) {
        (Some(channel), Some(length)) => Ok((channel as i32, length)),
        _ => Err(FrameError::MalformedHeader(
            String::from_utf8_lossy(header).into_owned(),
        )),
    }
}
