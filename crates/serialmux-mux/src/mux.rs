use std::collections::BTreeMap;
use std::io::Write;

use serialmux_frame::{Dialect, SerialFramer};
use tracing::{debug, warn};

use crate::client::{Client, ClientActions};
use crate::control::{
    disconnect_message, ko_connect, ok_connect, parse_command, ControlCommand, CONTROL_CHANNEL,
    CONTROL_SERVICE, KO_UNKNOWN_COMMAND, LEGACY_CONTROL_SERVICE, REASON_SERVICE_BUSY,
    REASON_UNKNOWN_SERVICE,
};
use crate::error::{MuxError, Result};
use crate::service::{Service, ServiceHandler};

/// Whether closing a channel is announced to the guest.
///
/// Guest-originated `disconnect:` messages close silently; echoing a
/// disconnect back for a channel the guest already released would loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notify {
    Peer,
    Silent,
}

/// Routes the shared serial stream to per-channel clients and speaks the
/// connect/disconnect negotiation protocol on channel 0.
///
/// The multiplexer is an explicit context object: one instance per serial
/// link, owning the framer, the client arena, and the service registry.
/// Everything runs on the thread that calls [`feed`](Self::feed).
pub struct Multiplexer<W: Write> {
    pub(crate) framer: SerialFramer<W>,
    pub(crate) clients: BTreeMap<i32, Client>,
    pub(crate) services: Vec<Service>,
}

impl<W: Write> Multiplexer<W> {
    /// Create a multiplexer bound to the serial transport.
    pub fn new(transport: W) -> Self {
        Self {
            framer: SerialFramer::new(transport),
            clients: BTreeMap::new(),
            services: Vec::new(),
        }
    }

    /// Create a multiplexer and immediately write the one-time legacy
    /// compatibility probe to the transport.
    pub fn with_legacy_probe(transport: W) -> Result<Self> {
        let mut mux = Self::new(transport);
        mux.framer.write_legacy_probe()?;
        Ok(mux)
    }

    /// Register a named service.
    ///
    /// Names must not contain `:` (the control-protocol separator) and are
    /// assumed unique; a duplicate name shadows the earlier registration on
    /// lookup and is a caller bug.
    pub fn register_service(&mut self, name: &str, max_clients: u32, hook: Box<dyn ServiceHandler>) {
        assert!(!name.contains(':'), "service name must not contain ':'");
        self.services
            .push(Service::new(name.to_string(), max_clients, hook));
    }

    /// Push freshly received serial bytes through the framer and dispatch
    /// every completed message.
    pub fn feed(&mut self, data: &[u8]) {
        for frame in self.framer.feed(data) {
            self.dispatch(frame.channel, &frame.payload);
        }
    }

    fn dispatch(&mut self, channel: i32, payload: &[u8]) {
        if channel == CONTROL_CHANNEL {
            self.on_control(payload);
            return;
        }
        let Some(client) = self.clients.get_mut(&channel) else {
            warn!(channel, len = payload.len(), "dropping message for unknown channel");
            return;
        };
        let mut actions = ClientActions::default();
        client.on_payload(payload, &mut actions);
        self.apply_actions(channel, actions);
    }

    fn apply_actions(&mut self, channel: i32, actions: ClientActions) {
        for payload in actions.sends {
            if let Err(err) = self.send(channel, &payload) {
                warn!(channel, %err, "failed sending queued reply");
            }
        }
        if actions.close_requested {
            self.disconnect(channel, Notify::Peer);
        }
    }

    fn on_control(&mut self, payload: &[u8]) {
        match parse_command(payload) {
            ControlCommand::Connect { service, channel } => {
                let service = service.to_string();
                match self.try_connect(&service, channel) {
                    Ok(()) => self.send_control(&ok_connect(channel)),
                    Err(MuxError::UnknownService(_)) => {
                        warn!(service, channel, "connect for unknown service");
                        self.send_control(&ko_connect(channel, REASON_UNKNOWN_SERVICE));
                    }
                    Err(err) => {
                        warn!(service, channel, %err, "connect refused");
                        self.send_control(&ko_connect(channel, REASON_SERVICE_BUSY));
                    }
                }
            }
            ControlCommand::Disconnect { channel } => {
                if !self.disconnect(channel, Notify::Silent) {
                    debug!(channel, "guest disconnect for unknown channel");
                }
            }
            ControlCommand::LegacyConnectAck { service, channel } => {
                if self.framer.dialect() == Dialect::Unknown {
                    self.framer.set_dialect(Dialect::Legacy);
                }
                let service = if service == LEGACY_CONTROL_SERVICE {
                    CONTROL_SERVICE
                } else {
                    service
                };
                let service = service.to_string();
                if let Err(err) = self.try_connect(&service, channel) {
                    warn!(service, channel, %err, "legacy connect acknowledgement refused");
                }
            }
            ControlCommand::Unknown => {
                warn!(
                    payload = %String::from_utf8_lossy(payload),
                    "unknown control command"
                );
                // Legacy daemons do not expect a reply to unrecognized input.
                if self.framer.dialect() != Dialect::Legacy {
                    self.send_control(KO_UNKNOWN_COMMAND);
                }
            }
        }
    }

    /// Attach a new client of `service` on `channel` from the host side.
    ///
    /// Same capacity rules as a guest connect, but nothing is written to the
    /// guest.
    pub fn connect_client(&mut self, service: &str, channel: i32) -> Result<()> {
        self.try_connect(service, channel)
    }

    fn try_connect(&mut self, service_name: &str, channel: i32) -> Result<()> {
        if !(1..=0xff).contains(&channel) {
            return Err(MuxError::InvalidChannel(channel));
        }
        if self.clients.contains_key(&channel) {
            return Err(MuxError::ChannelInUse(channel));
        }
        let Some(index) = self.services.iter().position(|s| s.name == service_name) else {
            return Err(MuxError::UnknownService(service_name.to_string()));
        };
        if !self.services[index].has_capacity() {
            return Err(MuxError::ServiceBusy(service_name.to_string()));
        }
        let Some(handler) = self.services[index].hook.connect(channel) else {
            return Err(MuxError::ServiceBusy(service_name.to_string()));
        };
        self.clients
            .insert(channel, Client::new(service_name.to_string(), handler));
        self.services[index].channels.insert(channel);
        debug!(service = service_name, channel, "client connected");
        Ok(())
    }

    /// Send a message to the guest on a live channel, applying that
    /// client's sub-framing setting.
    pub fn send(&mut self, channel: i32, payload: &[u8]) -> Result<()> {
        let Some(client) = self.clients.get(&channel) else {
            return Err(MuxError::UnknownChannel(channel));
        };
        self.framer.send(channel, client.framing, payload)?;
        Ok(())
    }

    /// Send a message to every current member of a service.
    pub fn broadcast(&mut self, service: &str, payload: &[u8]) -> Result<()> {
        let Some(entry) = self.services.iter().find(|s| s.name == service) else {
            return Err(MuxError::UnknownService(service.to_string()));
        };
        let channels: Vec<i32> = entry.channels.iter().copied().collect();
        for channel in channels {
            self.send(channel, payload)?;
        }
        Ok(())
    }

    /// Enable or disable logical sub-framing on a channel.
    pub fn set_framing(&mut self, channel: i32, enabled: bool) -> Result<()> {
        let Some(client) = self.clients.get_mut(&channel) else {
            return Err(MuxError::UnknownChannel(channel));
        };
        client.set_framing(enabled);
        Ok(())
    }

    /// Close a channel from the host side, announcing the disconnect to the
    /// guest. Returns false if the channel was already gone.
    ///
    /// Closing the control channel is a caller bug and panics.
    pub fn close(&mut self, channel: i32) -> bool {
        self.disconnect(channel, Notify::Peer)
    }

    pub(crate) fn disconnect(&mut self, channel: i32, notify: Notify) -> bool {
        assert_ne!(
            channel, CONTROL_CHANNEL,
            "control channel is never disconnected"
        );
        // Removing the entry first makes a second close, however it is
        // triggered, a no-op.
        let Some(mut client) = self.clients.remove(&channel) else {
            return false;
        };
        if notify == Notify::Peer {
            let message = disconnect_message(channel);
            if let Err(err) = self
                .framer
                .send(CONTROL_CHANNEL, false, message.as_bytes())
            {
                warn!(channel, %err, "failed announcing disconnect");
            }
        }
        client.handler.on_close();
        if let Some(service) = self.services.iter_mut().find(|s| s.name == client.service) {
            service.channels.remove(&channel);
        }
        debug!(channel, service = %client.service, "client disconnected");
        true
    }

    fn send_control(&mut self, text: &str) {
        if let Err(err) = self.framer.send(CONTROL_CHANNEL, false, text.as_bytes()) {
            warn!(%err, reply = text, "failed sending control reply");
        }
    }

    /// Currently detected serial dialect.
    pub fn dialect(&self) -> Dialect {
        self.framer.dialect()
    }

    /// Number of live clients (the control channel is not a client).
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_connected(&self, channel: i32) -> bool {
        self.clients.contains_key(&channel)
    }

    /// Channels currently attached to a service.
    pub fn service_channels(&self, service: &str) -> Option<Vec<i32>> {
        self.services
            .iter()
            .find(|s| s.name == service)
            .map(|s| s.channels.iter().copied().collect())
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &W {
        self.framer.transport()
    }

    /// Mutably borrow the underlying transport.
    pub fn transport_mut(&mut self) -> &mut W {
        self.framer.transport_mut()
    }
}
