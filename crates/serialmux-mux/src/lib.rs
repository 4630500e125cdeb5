//! Channel multiplexing over the emulator's guest serial link.
//!
//! One serial transport carries many independent logical services. The
//! [`Multiplexer`] owns the serial framer, a registry of named services,
//! and the arena of live per-channel clients; channel 0 carries the
//! connect/disconnect negotiation protocol. The whole arrangement is
//! snapshot-safe: [`Multiplexer::save`] and [`Multiplexer::load`] persist
//! and resume it without renegotiating with the guest.

pub mod client;
pub mod control;
pub mod error;
pub mod mux;
pub mod service;
pub mod snapshot;

pub use client::{ClientActions, ClientHandler};
pub use control::{ControlCommand, CONTROL_CHANNEL, CONTROL_SERVICE, KO_UNKNOWN_COMMAND};
pub use error::{MuxError, Result};
pub use mux::Multiplexer;
pub use service::ServiceHandler;
pub use snapshot::SNAPSHOT_VERSION;
