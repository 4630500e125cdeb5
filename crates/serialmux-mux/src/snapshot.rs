//! Versioned save/restore of the whole multiplexing stack.
//!
//! Restore assumes the emulator registers the same fixed set of services
//! before loading, so clients can be re-materialized through their services'
//! connect hooks without renegotiating anything with the guest.

use std::io::Write;

use serialmux_snapshot::{SnapshotSink, SnapshotSource};
use tracing::debug;

use crate::client::{Client, MessageAssembler};
use crate::error::{MuxError, Result};
use crate::mux::Multiplexer;

/// Current snapshot format version. Any mismatch aborts the restore.
pub const SNAPSHOT_VERSION: u32 = 1;

impl<W: Write> Multiplexer<W> {
    /// Serialize framer state, services, and clients.
    pub fn save(&self, out: &mut dyn SnapshotSink) -> Result<()> {
        out.put_u32(SNAPSHOT_VERSION)?;
        self.framer.save(out)?;

        out.put_u32(self.services.len() as u32)?;
        for service in &self.services {
            out.put_str(&service.name)?;
            out.put_u32(service.max_clients)?;
            out.put_u32(service.channels.len() as u32)?;
            service.hook.save(out)?;
        }

        out.put_u32(self.clients.len() as u32)?;
        for (channel, client) in &self.clients {
            out.put_str(&client.service)?;
            out.put_i32(*channel)?;
            client.save(out)?;
        }
        Ok(())
    }

    /// Restore state saved by [`save`](Self::save).
    ///
    /// All currently connected clients are purged silently first: nothing is
    /// written to the guest, which resumes as if nothing happened. Every
    /// service named in the snapshot must already be registered; a missing
    /// service, a client on channel 0, or any decode failure aborts the
    /// restore with an error.
    pub fn load(&mut self, source: &mut dyn SnapshotSource) -> Result<()> {
        let version = source.get_u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(MuxError::VersionMismatch {
                found: version,
                expected: SNAPSHOT_VERSION,
            });
        }
        self.framer.load(source)?;

        let service_count = source.get_u32()?;
        for _ in 0..service_count {
            let name = source.get_str()?;
            let max_clients = source.get_u32()?;
            let _saved_count = source.get_u32()?;
            let Some(service) = self.services.iter_mut().find(|s| s.name == name) else {
                return Err(MuxError::MissingService(name));
            };
            service.max_clients = max_clients;
            service.hook.load(source)?;
        }

        // Purge live clients without notifying the guest. Channels are
        // captured up front so removal never walks freed entries.
        let live: Vec<i32> = self.clients.keys().copied().collect();
        for channel in live {
            if let Some(mut client) = self.clients.remove(&channel) {
                client.handler.on_close();
            }
        }
        for service in &mut self.services {
            service.channels.clear();
        }

        let client_count = source.get_u32()?;
        for _ in 0..client_count {
            let service_name = source.get_str()?;
            let channel = source.get_i32()?;
            if !(1..=0xff).contains(&channel) {
                return Err(MuxError::InvalidSnapshotChannel(channel));
            }
            let Some(index) = self
                .services
                .iter()
                .position(|s| s.name == service_name)
            else {
                return Err(MuxError::MissingService(service_name));
            };
            let Some(handler) = self.services[index].hook.connect(channel) else {
                return Err(MuxError::ServiceBusy(service_name));
            };

            let mut client = Client::new(service_name, handler);
            client.handler.load(source)?;
            client.framing = source.get_u8()? != 0;
            client.assembler = MessageAssembler::load(source)?;

            if self.clients.insert(channel, client).is_some() {
                return Err(MuxError::ChannelInUse(channel));
            }
            self.services[index].channels.insert(channel);
        }

        debug!(
            services = service_count,
            clients = client_count,
            "multiplexer state restored"
        );
        Ok(())
    }
}
