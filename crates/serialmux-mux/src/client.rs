use serialmux_frame::{decode_hex, Sink, FRAME_HEADER_SIZE, MAX_LOGICAL_PAYLOAD};
use serialmux_snapshot::{
    Result as SnapshotResult, SnapshotError, SnapshotSink, SnapshotSource,
};
use tracing::warn;

/// Service-side behavior of one connected client.
///
/// Handlers never hold a reference back into the multiplexer; anything they
/// want done — sending a reply, closing their own channel — is queued on the
/// [`ClientActions`] passed to [`on_message`](Self::on_message) and applied
/// once the dispatch returns. That makes it safe for a handler to request the
/// closure of the very client being dispatched.
pub trait ClientHandler {
    /// One complete (possibly sub-frame-reassembled) message from the guest.
    fn on_message(&mut self, payload: &[u8], actions: &mut ClientActions);

    /// The channel is going away. Called exactly once.
    fn on_close(&mut self) {}

    /// Persist handler-specific state into the snapshot.
    fn save(&self, _out: &mut dyn SnapshotSink) -> SnapshotResult<()> {
        Ok(())
    }

    /// Restore handler-specific state from the snapshot.
    fn load(&mut self, _source: &mut dyn SnapshotSource) -> SnapshotResult<()> {
        Ok(())
    }
}

/// Deferred requests a handler makes during a dispatch.
#[derive(Default)]
pub struct ClientActions {
    pub(crate) sends: Vec<Vec<u8>>,
    pub(crate) close_requested: bool,
}

impl ClientActions {
    /// Queue a message to the guest on this client's channel.
    pub fn send(&mut self, payload: impl Into<Vec<u8>>) {
        self.sends.push(payload.into());
    }

    /// Request closure of this client after the dispatch returns.
    pub fn close(&mut self) {
        self.close_requested = true;
    }
}

/// One live logical channel.
pub(crate) struct Client {
    pub(crate) service: String,
    pub(crate) handler: Box<dyn ClientHandler>,
    pub(crate) framing: bool,
    pub(crate) assembler: MessageAssembler,
}

impl Client {
    pub(crate) fn new(service: String, handler: Box<dyn ClientHandler>) -> Self {
        Self {
            service,
            handler,
            framing: false,
            assembler: MessageAssembler::new(),
        }
    }

    /// Feed one serial payload to this client.
    pub(crate) fn on_payload(&mut self, data: &[u8], actions: &mut ClientActions) {
        if !self.framing {
            self.handler.on_message(data, actions);
            return;
        }
        let handler = &mut *self.handler;
        self.assembler
            .push(data, &mut |msg| handler.on_message(msg, actions));
    }

    /// Enable or disable logical sub-framing.
    ///
    /// Disabling drops any partially reassembled message.
    pub(crate) fn set_framing(&mut self, enabled: bool) {
        if self.framing && !enabled {
            self.assembler.clear();
        }
        self.framing = enabled;
    }

    pub(crate) fn save(&self, out: &mut dyn SnapshotSink) -> SnapshotResult<()> {
        self.handler.save(out)?;
        out.put_u8(self.framing as u8)?;
        self.assembler.save(out)
    }
}

/// Reassembles logical messages from their 4-hex-digit length prefix.
///
/// A logical message may span several serial packets; the assembler
/// accumulates the prefix, allocates a buffer of exactly the declared
/// length, and fills it across calls.
pub(crate) struct MessageAssembler {
    header: [u8; FRAME_HEADER_SIZE],
    header_sink: Sink,
    pending: Option<PendingMessage>,
}

struct PendingMessage {
    sink: Sink,
    buf: Vec<u8>,
}

impl MessageAssembler {
    pub(crate) fn new() -> Self {
        Self {
            header: [0u8; FRAME_HEADER_SIZE],
            header_sink: Sink::new(FRAME_HEADER_SIZE),
            pending: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.header_sink.used() == 0 && self.pending.is_none()
    }

    /// Drop any partial reassembly.
    pub(crate) fn clear(&mut self) {
        self.header_sink.reset(FRAME_HEADER_SIZE);
        self.pending = None;
    }

    /// Consume `data`, invoking `emit` for each completed logical message.
    pub(crate) fn push(&mut self, mut data: &[u8], emit: &mut dyn FnMut(&[u8])) {
        // Fast path: a whole logical message in one piece, nothing pending.
        if self.is_idle() && data.len() > FRAME_HEADER_SIZE {
            if let Some(length) = decode_hex(&data[..FRAME_HEADER_SIZE]) {
                if length > 0 && data.len() == FRAME_HEADER_SIZE + length {
                    emit(&data[FRAME_HEADER_SIZE..]);
                    return;
                }
            }
        }

        while !data.is_empty() {
            match &mut self.pending {
                None => {
                    if self.header_sink.fill(&mut self.header, &mut data) {
                        self.header_sink.reset(FRAME_HEADER_SIZE);
                        match decode_hex(&self.header) {
                            Some(0) => {}
                            Some(length) => {
                                self.pending = Some(PendingMessage {
                                    sink: Sink::new(length),
                                    buf: vec![0u8; length],
                                });
                            }
                            None => {
                                warn!(
                                    prefix = %String::from_utf8_lossy(&self.header),
                                    "skipping malformed logical length prefix"
                                );
                            }
                        }
                    }
                }
                Some(pending) => {
                    if pending.sink.fill(&mut pending.buf, &mut data) {
                        // Move the buffer out before dispatching; the
                        // assembler is back to idle when `emit` runs.
                        if let Some(done) = self.pending.take() {
                            emit(&done.buf);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn save(&self, out: &mut dyn SnapshotSink) -> SnapshotResult<()> {
        let pending = !self.is_idle();
        out.put_u8(pending as u8)?;
        if !pending {
            return Ok(());
        }
        self.header_sink.save(out)?;
        out.put_raw(&self.header)?;
        match &self.pending {
            Some(message) => {
                out.put_u8(1)?;
                message.sink.save(out)?;
                out.put_bytes(&message.buf)
            }
            None => out.put_u8(0),
        }
    }

    pub(crate) fn load(source: &mut dyn SnapshotSource) -> SnapshotResult<Self> {
        let mut assembler = Self::new();
        if source.get_u8()? == 0 {
            return Ok(assembler);
        }
        let header_sink = Sink::load(source)?;
        if header_sink.capacity() != FRAME_HEADER_SIZE {
            return Err(SnapshotError::InvalidField(
                "logical header sink capacity".into(),
            ));
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        source.get_raw(&mut header)?;
        assembler.header_sink = header_sink;
        assembler.header = header;

        if source.get_u8()? != 0 {
            let sink = Sink::load(source)?;
            let buf = source.get_bytes()?;
            if sink.capacity() != buf.len() || buf.len() > MAX_LOGICAL_PAYLOAD {
                return Err(SnapshotError::InvalidField(
                    "partial logical payload size".into(),
                ));
            }
            assembler.pending = Some(PendingMessage { sink, buf });
        }
        Ok(assembler)
    }
}
