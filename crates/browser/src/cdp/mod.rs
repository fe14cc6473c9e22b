//! CDP (Chrome DevTools Protocol) Client Implementation
//!
//! Core principle: one websocket per DevTools endpoint, responses matched by
//! id, every inbound frame fanned out to event queues.

pub mod connection;
pub mod events;
pub mod protocol;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{CdpConnection, CdpError, ConnectionEvent, EventReceiver};
pub use events::PageEvent;
pub use protocol::{CdpEvent, CdpMessage, CdpRequest, CdpResponse};
