use std::collections::BTreeSet;

use serialmux_snapshot::{Result as SnapshotResult, SnapshotSink, SnapshotSource};

use crate::client::ClientHandler;

/// Host-side implementation of one named service (modem, GPS, ...).
pub trait ServiceHandler {
    /// A new client wants to attach on `channel`. Return its handler to
    /// accept, or `None` to refuse (reported to the guest as busy).
    fn connect(&mut self, channel: i32) -> Option<Box<dyn ClientHandler>>;

    /// Persist service-wide state into the snapshot.
    fn save(&self, _out: &mut dyn SnapshotSink) -> SnapshotResult<()> {
        Ok(())
    }

    /// Restore service-wide state from the snapshot.
    fn load(&mut self, _source: &mut dyn SnapshotSource) -> SnapshotResult<()> {
        Ok(())
    }
}

/// Registry entry for one service.
pub(crate) struct Service {
    pub(crate) name: String,
    /// 0 means unlimited.
    pub(crate) max_clients: u32,
    pub(crate) channels: BTreeSet<i32>,
    pub(crate) hook: Box<dyn ServiceHandler>,
}

impl Service {
    pub(crate) fn new(name: String, max_clients: u32, hook: Box<dyn ServiceHandler>) -> Self {
        Self {
            name,
            max_clients,
            channels: BTreeSet::new(),
            hook,
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.max_clients == 0 || (self.channels.len() as u32) < self.max_clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientActions;

    struct Null;

    impl ClientHandler for Null {
        fn on_message(&mut self, _payload: &[u8], _actions: &mut ClientActions) {}
    }

    struct AlwaysAccept;

    impl ServiceHandler for AlwaysAccept {
        fn connect(&mut self, _channel: i32) -> Option<Box<dyn ClientHandler>> {
            Some(Box::new(Null))
        }
    }

    #[test]
    fn zero_max_clients_means_unlimited() {
        let mut service = Service::new("gps".into(), 0, Box::new(AlwaysAccept));
        for channel in 1..100 {
            assert!(service.has_capacity());
            service.channels.insert(channel);
        }
        assert!(service.has_capacity());
    }

    #[test]
    fn capacity_is_enforced_at_max() {
        let mut service = Service::new("modem".into(), 2, Box::new(AlwaysAccept));
        assert!(service.has_capacity());
        service.channels.insert(1);
        assert!(service.has_capacity());
        service.channels.insert(2);
        assert!(!service.has_capacity());

        service.channels.remove(&1);
        assert!(service.has_capacity());
    }
}
