use std::io::{ErrorKind, Write};

use bytes::{BufMut, Bytes, BytesMut};
use serialmux_snapshot::{
    Result as SnapshotResult, SnapshotError, SnapshotSink, SnapshotSource,
};
use tracing::{debug, trace, warn};

use crate::codec::{
    decode_header, encode_header, encode_hex, Dialect, FRAME_HEADER_SIZE, HEADER_SIZE,
    LEGACY_PROBE_ACK_HEADER, LEGACY_SERVICES, MAX_LOGICAL_PAYLOAD, MAX_SERIAL_PAYLOAD,
};
use crate::error::{FrameError, Result};
use crate::sink::Sink;

/// One complete message extracted from the serial stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    /// The channel this message belongs to.
    pub channel: i32,
    /// The message payload, copied out of the framer's scratch buffer.
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingPayload,
    SkippingOverflow,
}

impl DecodeState {
    fn as_u8(self) -> u8 {
        match self {
            DecodeState::AwaitingHeader => 0,
            DecodeState::AwaitingPayload => 1,
            DecodeState::SkippingOverflow => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DecodeState::AwaitingHeader),
            1 => Some(DecodeState::AwaitingPayload),
            2 => Some(DecodeState::SkippingOverflow),
            _ => None,
        }
    }
}

/// Parses the shared serial stream into per-channel messages and serializes
/// outgoing messages back into MTU-sized packets.
///
/// Exactly one of awaiting-header, awaiting-payload, or skipping-overflow
/// holds at any time. Input chunking is arbitrary; [`feed`](Self::feed)
/// loops until the input is exhausted.
pub struct SerialFramer<W> {
    transport: W,
    state: DecodeState,
    header: [u8; HEADER_SIZE],
    header_sink: Sink,
    scratch: Box<[u8; MAX_SERIAL_PAYLOAD + 1]>,
    payload_sink: Sink,
    channel: i32,
    length: usize,
    overflow_remaining: usize,
    dialect: Dialect,
    first_header_seen: bool,
}

impl<W: Write> SerialFramer<W> {
    /// Create a framer bound to the given serial transport.
    pub fn new(transport: W) -> Self {
        Self {
            transport,
            state: DecodeState::AwaitingHeader,
            header: [0u8; HEADER_SIZE],
            header_sink: Sink::new(HEADER_SIZE),
            scratch: Box::new([0u8; MAX_SERIAL_PAYLOAD + 1]),
            payload_sink: Sink::new(0),
            channel: 0,
            length: 0,
            overflow_remaining: 0,
            dialect: Dialect::Unknown,
            first_header_seen: false,
        }
    }

    /// Currently detected header dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Force the dialect, e.g. when a legacy acknowledgement is recognized
    /// at the control layer or when restoring a snapshot.
    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &W {
        &self.transport
    }

    /// Mutably borrow the underlying transport.
    pub fn transport_mut(&mut self) -> &mut W {
        &mut self.transport
    }

    /// Consume the framer and return the transport.
    pub fn into_transport(self) -> W {
        self.transport
    }

    /// Push freshly received serial bytes through the decode state machine.
    ///
    /// Returns every message completed by this chunk, in order. Payloads are
    /// owned copies; the internal scratch buffer is reused immediately.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<SerialFrame> {
        let mut out = Vec::new();
        while !data.is_empty() {
            match self.state {
                DecodeState::SkippingOverflow => {
                    let n = self.overflow_remaining.min(data.len());
                    data = &data[n..];
                    self.overflow_remaining -= n;
                    if self.overflow_remaining == 0 {
                        self.enter_awaiting_header();
                    }
                }
                DecodeState::AwaitingHeader => {
                    if self.header_sink.fill(&mut self.header, &mut data) {
                        self.on_header_complete();
                    }
                }
                DecodeState::AwaitingPayload => {
                    if self.payload_sink.fill(&mut self.scratch[..], &mut data) {
                        // NUL-terminate so the scratch region reads as text
                        // when inspected; not counted in the length.
                        self.scratch[self.length] = 0;
                        out.push(SerialFrame {
                            channel: self.channel,
                            payload: Bytes::copy_from_slice(&self.scratch[..self.length]),
                        });
                        self.enter_awaiting_header();
                    }
                }
            }
        }
        out
    }

    fn enter_awaiting_header(&mut self) {
        self.state = DecodeState::AwaitingHeader;
        self.header_sink.reset(HEADER_SIZE);
    }

    fn on_header_complete(&mut self) {
        if !self.first_header_seen {
            self.first_header_seen = true;
            if self.dialect == Dialect::Unknown {
                self.dialect = if self.header == LEGACY_PROBE_ACK_HEADER {
                    Dialect::Legacy
                } else {
                    Dialect::Normal
                };
                debug!(dialect = ?self.dialect, "serial dialect detected");
            }
        }

        let (channel, length) = match decode_header(self.dialect, &self.header) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "rejecting serial header");
                self.enter_awaiting_header();
                return;
            }
        };

        if length == 0 || channel < 0 {
            warn!(channel, length, "rejecting serial header with empty payload");
            self.enter_awaiting_header();
            return;
        }

        if length > MAX_SERIAL_PAYLOAD {
            warn!(channel, length, "declared payload exceeds MTU, discarding");
            self.overflow_remaining = length;
            self.state = DecodeState::SkippingOverflow;
            return;
        }

        self.channel = channel;
        self.length = length;
        self.payload_sink.reset(length);
        self.state = DecodeState::AwaitingPayload;
    }

    /// Frame, packetize, and write a message for `channel`.
    ///
    /// The payload is split into packets of at most [`MAX_SERIAL_PAYLOAD`]
    /// bytes. When `framed` is true the first packet additionally carries a
    /// 4-hex-digit total logical length, consumed from that packet's budget.
    pub fn send(&mut self, channel: i32, framed: bool, payload: &[u8]) -> Result<()> {
        if !(0..=0xff).contains(&channel) {
            return Err(FrameError::InvalidChannel(channel));
        }
        if framed && payload.len() > MAX_LOGICAL_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_LOGICAL_PAYLOAD,
            });
        }
        if !framed && payload.is_empty() {
            trace!(channel, "skipping empty unframed send");
            return Ok(());
        }

        let mut remaining = payload;
        let mut first = true;
        let mut packet = BytesMut::with_capacity(HEADER_SIZE + MAX_SERIAL_PAYLOAD);
        while first || !remaining.is_empty() {
            let budget = if first && framed {
                MAX_SERIAL_PAYLOAD - FRAME_HEADER_SIZE
            } else {
                MAX_SERIAL_PAYLOAD
            };
            let take = remaining.len().min(budget);
            let wire_len = take + if first && framed { FRAME_HEADER_SIZE } else { 0 };

            packet.clear();
            packet.put_slice(&encode_header(self.dialect, channel, wire_len));
            if first && framed {
                let mut prefix = [0u8; FRAME_HEADER_SIZE];
                encode_hex(payload.len(), &mut prefix);
                packet.put_slice(&prefix);
            }
            packet.put_slice(&remaining[..take]);
            self.write_all(&packet)?;

            remaining = &remaining[take..];
            first = false;
        }
        Ok(())
    }

    /// One-time legacy compatibility handshake.
    ///
    /// Writes a byte sequence that a legacy-dialect peer parses as channel-0
    /// `connect:` messages for the hard-coded legacy services, while a
    /// normal-dialect peer parses the identical bytes as a single oversized
    /// but valid channel-0 packet it will not recognize and simply ignore.
    /// No acknowledgement is expected.
    pub fn write_legacy_probe(&mut self) -> Result<()> {
        let (first_name, first_channel) = LEGACY_SERVICES[0];
        let first_payload = connect_message(first_name, first_channel);

        // The shared first header doubles as: legacy header of the first
        // connect message, and normal header of one packet spanning the
        // whole remainder of the probe.
        let shared = encode_header(Dialect::Legacy, 0, first_payload.len());
        let (_, body_len) = decode_header(Dialect::Normal, &shared)?;

        let mut body = BytesMut::with_capacity(body_len);
        body.put_slice(first_payload.as_bytes());
        for &(name, channel) in &LEGACY_SERVICES[1..] {
            let msg = connect_message(name, channel);
            body.put_slice(&encode_header(Dialect::Legacy, 0, msg.len()));
            body.put_slice(msg.as_bytes());
        }

        // Pad to the exact length the normal-dialect reading promised, as
        // one final legacy message of NUL filler.
        let filler = body_len - body.len() - HEADER_SIZE;
        debug_assert!(filler > 0 && filler <= MAX_SERIAL_PAYLOAD);
        body.put_slice(&encode_header(Dialect::Legacy, 0, filler));
        BufMut::put_bytes(&mut body, 0, filler);
        debug_assert_eq!(body.len(), body_len);

        let mut probe = BytesMut::with_capacity(HEADER_SIZE + body_len);
        probe.put_slice(&shared);
        probe.put_slice(&body);
        debug!(bytes = probe.len(), "writing legacy probe");
        self.write_all(&probe.freeze())
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.transport.write(buf) {
                Ok(0) => return Err(FrameError::Io(ErrorKind::WriteZero.into())),
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        loop {
            match self.transport.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Persist decode state, both sink cursors, and the scratch buffer.
    pub fn save(&self, out: &mut dyn SnapshotSink) -> SnapshotResult<()> {
        out.put_u8(self.dialect.as_u8())?;
        out.put_u8(self.state.as_u8())?;
        out.put_u8(self.first_header_seen as u8)?;
        out.put_u64(self.overflow_remaining as u64)?;
        out.put_i32(self.channel)?;
        out.put_u32(self.length as u32)?;
        self.header_sink.save(out)?;
        out.put_raw(&self.header)?;
        self.payload_sink.save(out)?;
        out.put_bytes(&self.scratch[..])
    }

    /// Restore state saved by [`save`](Self::save).
    ///
    /// Fails without touching `self` if any field is out of range, so a
    /// corrupt snapshot never leaves the framer half-applied.
    pub fn load(&mut self, source: &mut dyn SnapshotSource) -> SnapshotResult<()> {
        let dialect = Dialect::from_u8(source.get_u8()?)
            .ok_or_else(|| SnapshotError::InvalidField("framer dialect".into()))?;
        let state = DecodeState::from_u8(source.get_u8()?)
            .ok_or_else(|| SnapshotError::InvalidField("framer decode state".into()))?;
        let first_header_seen = source.get_u8()? != 0;
        let overflow_remaining = source.get_u64()? as usize;
        let channel = source.get_i32()?;
        let length = source.get_u32()? as usize;

        let header_sink = Sink::load(source)?;
        if header_sink.capacity() != HEADER_SIZE {
            return Err(SnapshotError::InvalidField("header sink capacity".into()));
        }
        let mut header = [0u8; HEADER_SIZE];
        source.get_raw(&mut header)?;

        let payload_sink = Sink::load(source)?;
        if payload_sink.capacity() > MAX_SERIAL_PAYLOAD || length > MAX_SERIAL_PAYLOAD {
            return Err(SnapshotError::InvalidField("payload length".into()));
        }
        let scratch = source.get_bytes()?;
        if scratch.len() != self.scratch.len() {
            return Err(SnapshotError::InvalidField("scratch buffer size".into()));
        }
        if channel < 0 {
            return Err(SnapshotError::InvalidField("framer channel".into()));
        }

        self.dialect = dialect;
        self.state = state;
        self.first_header_seen = first_header_seen;
        self.overflow_remaining = overflow_remaining;
        self.channel = channel;
        self.length = length;
        self.header_sink = header_sink;
        self.header = header;
        self.payload_sink = payload_sink;
        self.scratch.copy_from_slice(&scratch);
        Ok(())
    }
}

fn connect_message(service: &str, channel: i32) -> String {
    format!("connect:{service}:{channel:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(channel: i32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = encode_header(Dialect::Normal, channel, payload.len()).to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn decodes_single_message() {
        let mut framer = SerialFramer::new(Vec::new());
        let frames = framer.feed(&packet(5, b"hello"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 5);
        assert_eq!(frames[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn one_byte_chunks_decode_identically() {
        let mut wire = packet(2, b"first");
        wire.extend_from_slice(&packet(7, b"second message"));

        let mut whole = SerialFramer::new(Vec::new());
        let expected = whole.feed(&wire);

        let mut trickled = SerialFramer::new(Vec::new());
        let mut got = Vec::new();
        for byte in &wire {
            got.extend(trickled.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(got, expected);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn coalesced_messages_all_decode() {
        let mut wire = packet(1, b"a");
        wire.extend_from_slice(&packet(2, b"bb"));
        wire.extend_from_slice(&packet(3, b"ccc"));

        let mut framer = SerialFramer::new(Vec::new());
        let frames = framer.feed(&wire);
        let got: Vec<(i32, &[u8])> = frames
            .iter()
            .map(|f| (f.channel, f.payload.as_ref()))
            .collect();
        assert_eq!(
            got,
            vec![(1, b"a".as_ref()), (2, b"bb".as_ref()), (3, b"ccc".as_ref())]
        );
    }

    #[test]
    fn oversized_declared_length_is_skipped_not_buffered() {
        let mut framer = SerialFramer::new(Vec::new());

        // 4001 bytes declared: one past the MTU.
        let mut wire = encode_header(Dialect::Normal, 4, 4001).to_vec();
        wire.extend_from_slice(&vec![b'x'; 4001]);
        wire.extend_from_slice(&packet(4, b"after"));

        let frames = framer.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"after");
    }

    #[test]
    fn overflow_skip_survives_chunking() {
        let mut framer = SerialFramer::new(Vec::new());
        let mut wire = encode_header(Dialect::Normal, 4, 4001).to_vec();
        wire.extend_from_slice(&vec![0u8; 4001]);
        wire.extend_from_slice(&packet(9, b"ok"));

        let mut frames = Vec::new();
        for chunk in wire.chunks(37) {
            frames.extend(framer.feed(chunk));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 9);
    }

    #[test]
    fn zero_length_header_is_rejected_and_recovered() {
        let mut framer = SerialFramer::new(Vec::new());
        let mut wire = encode_header(Dialect::Normal, 3, 0).to_vec();
        wire.extend_from_slice(&packet(3, b"next"));

        let frames = framer.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"next");
    }

    #[test]
    fn malformed_header_is_rejected_and_recovered() {
        let mut framer = SerialFramer::new(Vec::new());
        // Force dialect first so the garbage header is not the detection one.
        framer.set_dialect(Dialect::Normal);
        let mut wire = b"zzzzzz".to_vec();
        wire.extend_from_slice(&packet(1, b"good"));

        let frames = framer.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"good");
    }

    #[test]
    fn first_normal_header_latches_normal_dialect() {
        let mut framer = SerialFramer::new(Vec::new());
        assert_eq!(framer.dialect(), Dialect::Unknown);
        framer.feed(&packet(5, b"hi"));
        assert_eq!(framer.dialect(), Dialect::Normal);
    }

    #[test]
    fn probe_ack_header_latches_legacy_dialect() {
        let mut framer = SerialFramer::new(Vec::new());
        let mut wire = LEGACY_PROBE_ACK_HEADER.to_vec();
        wire.extend_from_slice(b"ok:connect:gsm:01");

        let frames = framer.feed(&wire);
        assert_eq!(framer.dialect(), Dialect::Legacy);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 0);
        assert_eq!(frames[0].payload.as_ref(), b"ok:connect:gsm:01");
    }

    #[test]
    fn send_emits_header_and_payload() {
        let mut framer = SerialFramer::new(Vec::new());
        framer.send(5, false, b"hello").unwrap();
        assert_eq!(framer.transport(), b"050005hello");
    }

    #[test]
    fn send_uses_legacy_field_order_once_detected() {
        let mut framer = SerialFramer::new(Vec::new());
        framer.set_dialect(Dialect::Legacy);
        framer.send(5, false, b"hello").unwrap();
        assert_eq!(framer.transport(), b"000505hello");
    }

    #[test]
    fn send_splits_at_mtu() {
        let mut framer = SerialFramer::new(Vec::new());
        let payload = vec![b'p'; 4100];
        framer.send(1, false, &payload).unwrap();

        let wire = framer.transport();
        assert_eq!(&wire[..HEADER_SIZE], b"010fa0");
        let second = HEADER_SIZE + 4000;
        assert_eq!(&wire[second..second + HEADER_SIZE], b"010064");
        assert_eq!(wire.len(), 2 * HEADER_SIZE + 4100);
    }

    #[test]
    fn framed_send_prefixes_total_length_once() {
        let mut framer = SerialFramer::new(Vec::new());
        let payload = vec![b'q'; 10000];
        framer.send(5, true, &payload).unwrap();

        let wire = framer.transport();
        // First packet: full MTU, 4 of which are the logical length prefix.
        assert_eq!(&wire[..HEADER_SIZE], b"050fa0");
        assert_eq!(&wire[HEADER_SIZE..HEADER_SIZE + FRAME_HEADER_SIZE], b"2710");
        // Continuations carry no prefix.
        let second = HEADER_SIZE + 4000;
        assert_eq!(&wire[second..second + HEADER_SIZE], b"050fa0");
        let third = second + HEADER_SIZE + 4000;
        assert_eq!(&wire[third..third + HEADER_SIZE], b"0507d4");
        assert_eq!(wire.len(), third + HEADER_SIZE + 2004);
    }

    #[test]
    fn framed_empty_payload_sends_prefix_only() {
        let mut framer = SerialFramer::new(Vec::new());
        framer.send(2, true, b"").unwrap();
        assert_eq!(framer.transport(), b"0200040000");
    }

    #[test]
    fn unframed_empty_payload_sends_nothing() {
        let mut framer = SerialFramer::new(Vec::new());
        framer.send(2, false, b"").unwrap();
        assert!(framer.transport().is_empty());
    }

    #[test]
    fn framed_send_rejects_oversized_logical_payload() {
        let mut framer = SerialFramer::new(Vec::new());
        let payload = vec![0u8; MAX_LOGICAL_PAYLOAD + 1];
        assert!(matches!(
            framer.send(1, true, &payload),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn send_rejects_out_of_range_channel() {
        let mut framer = SerialFramer::new(Vec::new());
        assert!(matches!(
            framer.send(0x100, false, b"x"),
            Err(FrameError::InvalidChannel(0x100))
        ));
        assert!(matches!(
            framer.send(-2, false, b"x"),
            Err(FrameError::InvalidChannel(-2))
        ));
    }

    #[test]
    fn legacy_probe_parses_as_connect_burst_for_legacy_peer() {
        let mut host = SerialFramer::new(Vec::new());
        host.write_legacy_probe().unwrap();
        let wire = host.into_transport();

        let mut legacy_peer = SerialFramer::new(Vec::new());
        legacy_peer.set_dialect(Dialect::Legacy);
        let frames = legacy_peer.feed(&wire);

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].payload.as_ref(), b"connect:gsm:01");
        assert_eq!(frames[1].payload.as_ref(), b"connect:gps:02");
        assert_eq!(frames[2].payload.as_ref(), b"connect:control:03");
        assert!(frames[3].payload.iter().all(|&b| b == 0));
        assert!(frames.iter().all(|f| f.channel == 0));
    }

    #[test]
    fn legacy_probe_parses_as_one_packet_for_normal_peer() {
        let mut host = SerialFramer::new(Vec::new());
        host.write_legacy_probe().unwrap();
        let wire = host.into_transport();

        let mut normal_peer = SerialFramer::new(Vec::new());
        normal_peer.set_dialect(Dialect::Normal);
        let frames = normal_peer.feed(&wire);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 0);
        assert_eq!(frames[0].payload.len(), wire.len() - HEADER_SIZE);
    }

    #[test]
    fn snapshot_roundtrip_mid_payload() {
        let mut framer = SerialFramer::new(Vec::new());
        let wire = packet(6, b"split right here");
        let (before, after) = wire.split_at(HEADER_SIZE + 5);
        assert!(framer.feed(before).is_empty());

        let mut saved = bytes::BytesMut::new();
        framer.save(&mut saved).unwrap();

        let mut restored = SerialFramer::new(Vec::new());
        restored.load(&mut saved.freeze()).unwrap();
        assert_eq!(restored.dialect(), Dialect::Normal);

        let frames = restored.feed(after);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 6);
        assert_eq!(frames[0].payload.as_ref(), b"split right here");
    }

    #[test]
    fn snapshot_rejects_bad_decode_state() {
        let mut framer = SerialFramer::new(Vec::new());
        let mut saved = bytes::BytesMut::new();
        framer.save(&mut saved).unwrap();

        let mut corrupt = saved.to_vec();
        corrupt[1] = 9; // decode state byte
        let mut fresh = SerialFramer::new(Vec::new());
        let err = fresh
            .load(&mut Bytes::copy_from_slice(&corrupt))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidField(_)));
    }
}
