//! Text commands exchanged on channel 0.

use serialmux_frame::decode_hex;

/// Channel reserved for the connect/disconnect negotiation protocol.
pub const CONTROL_CHANNEL: i32 = 0;

/// Service name legacy daemons use for the hardware control service.
pub const LEGACY_CONTROL_SERVICE: &str = "control";

/// Current name of the hardware control service.
pub const CONTROL_SERVICE: &str = "hw-control";

/// Reply to a command the control channel does not recognize.
pub const KO_UNKNOWN_COMMAND: &str = "ko:unknown command";

pub const REASON_UNKNOWN_SERVICE: &str = "unknown service";
pub const REASON_SERVICE_BUSY: &str = "service busy";

/// A parsed control-channel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand<'a> {
    /// `connect:<service>:<2-hex-id>` — guest asks to open a channel.
    Connect { service: &'a str, channel: i32 },
    /// `disconnect:<2-hex-id>` — guest released its end; close silently.
    Disconnect { channel: i32 },
    /// `ok:connect:<service>:<2-hex-id>` — legacy daemon acknowledging the
    /// probe; treated as a connect with no reply.
    LegacyConnectAck { service: &'a str, channel: i32 },
    /// Anything else.
    Unknown,
}

/// Parse one control message. A trailing NUL is tolerated.
pub fn parse_command(payload: &[u8]) -> ControlCommand<'_> {
    let payload = payload.strip_suffix(b"\0").unwrap_or(payload);
    let Ok(text) = std::str::from_utf8(payload) else {
        return ControlCommand::Unknown;
    };

    if let Some(rest) = text.strip_prefix("ok:connect:") {
        if let Some((service, channel)) = parse_service_channel(rest) {
            return ControlCommand::LegacyConnectAck { service, channel };
        }
        return ControlCommand::Unknown;
    }

    if let Some(rest) = text.strip_prefix("disconnect:") {
        // The command is exactly "disconnect:" + 2 hex digits, 13 bytes.
        if text.len() == 13 {
            if let Some(channel) = parse_channel(rest) {
                return ControlCommand::Disconnect { channel };
            }
        }
        return ControlCommand::Unknown;
    }

    if let Some(rest) = text.strip_prefix("connect:") {
        if let Some((service, channel)) = parse_service_channel(rest) {
            return ControlCommand::Connect { service, channel };
        }
    }

    ControlCommand::Unknown
}

/// `<service>:<2-hex-id>` with a non-empty service and a non-zero id.
/// An extra separator lands in the id field and fails the length check.
fn parse_service_channel(rest: &str) -> Option<(&str, i32)> {
    let (service, id) = rest.split_once(':')?;
    if service.is_empty() {
        return None;
    }
    Some((service, parse_channel(id)?))
}

fn parse_channel(id: &str) -> Option<i32> {
    if id.len() != 2 {
        return None;
    }
    let channel = decode_hex(id.as_bytes())? as i32;
    (channel > 0).then_some(channel)
}

pub fn ok_connect(channel: i32) -> String {
    format!("ok:connect:{channel:02x}")
}

pub fn ko_connect(channel: i32, reason: &str) -> String {
    format!("ko:connect:{channel:02x}:{reason}")
}

pub fn disconnect_message(channel: i32) -> String {
    format!("disconnect:{channel:02x}")
}
