//! Channel transport
//!
//! Turns one duplex byte stream into any number of unidirectional, typed
//! channels. Either side may open a channel with
//! [`Transport::new_send_channel`]; the other side picks it up with
//! [`Transport::wait_receive_channel`]. A message may carry a [`Sender`] so the
//! receiver can answer, which is how request/reply and handshakes are built.
//!
//! ```text
//!  client                                   server
//!  new_send_channel() ──Open{1}────────────► wait_receive_channel()
//!  send_with_reply(v, pipe tx)
//!                     ──Data{1, v, reply 3}► receive_with_reply() -> (v, Sender{3})
//!  pipe rx ◄──────────  Data{3, answer}───── Sender{3}.send(answer)
//! ```

pub mod channel;
pub mod frame;
pub mod link;

pub use crate::error::TransportError;
pub use channel::{pipe, Receiver, Sender};
pub use frame::{ChannelId, Frame, DEFAULT_MAX_FRAME_LENGTH, PROTOCOL_VERSION};
pub use link::{Role, Transport};
