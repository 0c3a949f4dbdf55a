//! Address-based message bus
//!
//! A [`Bus`] serves any number of connections. A peer on one connection
//! registers an address with [`NetClient::register`]; a peer on any connection
//! sends to that address with [`NetClient::message`] and the bus forwards the
//! value to the registered receiver.
//!
//! Duplicate registrations follow [`ReregistrationPolicy`](crate::config::ReregistrationPolicy):
//! by default the newest one wins. Messages to an address nobody registered are
//! dropped and logged by the bus; [`NetClient::message_confirmed`] reports them
//! to the sender as [`BusError::NoRoute`](crate::error::BusError::NoRoute).

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::NetClient;
pub use protocol::{BusRequest, Delivery};
pub use registry::{ConnectionId, RegisterOutcome, Registration, Registry};
pub use server::{Bus, BusStats};
