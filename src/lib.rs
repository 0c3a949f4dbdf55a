//! chanbridge - address-routed messaging over channel transports
//!
//! Two pieces share one channel model:
//!
//! 1. **Bus**: accepts connections, lets peers register named receivers and
//!    routes addressed messages to them ([`bus::Bus`], [`bus::NetClient`]).
//! 2. **Process bridge**: spawns a child process, or an in-process plugin,
//!    over a private socket pair and verifies the link with an echo handshake
//!    before handing out channels ([`process::spawn`]).
//!
//! Both sit on [`transport::Transport`], which multiplexes typed channels over
//! one duplex byte stream.
//!
//! ## Design Principles
//!
//! 1. **No built-in timeouts**: callers race operations against their own
//!    deadlines ([`utils::with_deadline`])
//! 2. **Failures are reported, not retried**: a dead connection ends only its
//!    own task; a failed spawn returns no handle
//! 3. **Launch is injected**: how a counterpart starts is a launcher closure,
//!    so tests swap real processes for plugins

pub mod bus;
pub mod config;
pub mod error;
#[cfg(unix)]
pub mod process;
pub mod transport;
pub mod utils;

pub use bus::{Bus, NetClient};
pub use config::ChanConfig;
pub use error::{BusError, ProcessError, TransportError};
#[cfg(unix)]
pub use process::{spawn, ProcessHandle, ProcessHandler};
pub use transport::{pipe, Receiver, Sender, Transport};
