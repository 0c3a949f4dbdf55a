//! Channel endpoints
//!
//! A [`Sender`] is either local (one half of a [`pipe`]) or remote (a channel
//! opened on a [`Transport`](crate::transport::Transport)). Receivers look the
//! same either way. Values are JSON-encoded on send, so a sender and receiver only
//! need to agree on the shape of the data, not on the Rust type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::frame::{ChannelId, Frame};
use crate::transport::link::Link;
use crate::transport::TransportError;

/// One message as it travels between endpoints
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) payload: Vec<u8>,
    pub(crate) reply: Option<Sender>,
}

impl Envelope {
    pub(crate) fn encode<T: Serialize + ?Sized>(
        value: &T,
        reply: Option<Sender>,
    ) -> Result<Self, TransportError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(Self { payload, reply })
    }
}

/// Sending half of a channel
#[derive(Clone)]
pub struct Sender {
    kind: SenderKind,
}

#[derive(Clone)]
enum SenderKind {
    Local(mpsc::UnboundedSender<Envelope>),
    Remote { channel: ChannelId, link: Arc<Link> },
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SenderKind::Local(_) => f.debug_struct("Sender").field("kind", &"local").finish(),
            SenderKind::Remote { channel, link } => f
                .debug_struct("Sender")
                .field("channel", channel)
                .field("role", &link.role())
                .finish(),
        }
    }
}

impl Sender {
    pub(crate) fn remote(channel: ChannelId, link: Arc<Link>) -> Self {
        Self {
            kind: SenderKind::Remote { channel, link },
        }
    }

    /// Send a value.
    ///
    /// Succeeds once the value is queued on the connection; it does not wait
    /// for the receiver to read it. A value whose frame would exceed the
    /// connection's frame limit fails with [`TransportError::FrameTooLarge`].
    pub fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        self.send_envelope(Envelope::encode(value, None)?)
    }

    /// Send a value together with a channel the receiver can answer on
    pub fn send_with_reply<T: Serialize + ?Sized>(
        &self,
        value: &T,
        reply: Sender,
    ) -> Result<(), TransportError> {
        self.send_envelope(Envelope::encode(value, Some(reply))?)
    }

    pub(crate) fn send_envelope(&self, envelope: Envelope) -> Result<(), TransportError> {
        match &self.kind {
            SenderKind::Local(tx) => tx.send(envelope).map_err(|_| TransportError::Closed),
            SenderKind::Remote { channel, link } => {
                let reply = match envelope.reply {
                    Some(reply) => Some(link.export(reply)?),
                    None => None,
                };
                let queued = link.enqueue(Frame::Data {
                    channel: *channel,
                    payload: envelope.payload,
                    reply,
                });
                if let (Err(_), Some(reply)) = (&queued, reply) {
                    link.unexport(reply);
                }
                queued
            }
        }
    }

    /// Tell the paired receiver that nothing more will be sent.
    ///
    /// Local pipes only close once every clone of the sender is dropped, so this
    /// is a no-op for them.
    pub fn close(&self) -> Result<(), TransportError> {
        match &self.kind {
            SenderKind::Local(_) => Ok(()),
            SenderKind::Remote { channel, link } => link.enqueue(Frame::Close { channel: *channel }),
        }
    }

    /// Whether sends are known to fail
    pub fn is_closed(&self) -> bool {
        match &self.kind {
            SenderKind::Local(tx) => tx.is_closed(),
            SenderKind::Remote { link, .. } => link.is_shut_down(),
        }
    }

    /// Take the local queue out of a pipe sender; remote senders are handed back
    pub(crate) fn into_local(self) -> Result<mpsc::UnboundedSender<Envelope>, Sender> {
        match self.kind {
            SenderKind::Local(tx) => Ok(tx),
            kind @ SenderKind::Remote { .. } => Err(Sender { kind }),
        }
    }
}

/// Receiving half of a channel
#[derive(Debug)]
pub struct Receiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
    link: Option<Arc<Link>>,
}

impl Receiver {
    pub(crate) fn remote(rx: mpsc::UnboundedReceiver<Envelope>, link: Arc<Link>) -> Self {
        Self {
            rx,
            link: Some(link),
        }
    }

    /// Wait for the next value
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let (value, _) = self.receive_with_reply().await?;
        Ok(value)
    }

    /// Wait for the next value and the reply channel attached to it, if any
    pub async fn receive_with_reply<T: DeserializeOwned>(
        &mut self,
    ) -> Result<(T, Option<Sender>), TransportError> {
        let envelope = self.receive_envelope().await?;
        let value = serde_json::from_slice(&envelope.payload)?;
        Ok((value, envelope.reply))
    }

    pub(crate) async fn receive_envelope(&mut self) -> Result<Envelope, TransportError> {
        match self.rx.recv().await {
            Some(envelope) => Ok(envelope),
            None => Err(self
                .link
                .as_ref()
                .map(|link| link.closed_error())
                .unwrap_or(TransportError::Closed)),
        }
    }
}

/// Create a linked local sender/receiver pair
pub fn pipe() -> (Receiver, Sender) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Receiver { rx, link: None },
        Sender {
            kind: SenderKind::Local(tx),
        },
    )
}

/// Pump everything arriving on `rx` into `target` until either side goes away
pub(crate) async fn forward(mut rx: Receiver, target: Sender) {
    while let Ok(envelope) = rx.receive_envelope().await {
        if let Err(e) = target.send_envelope(envelope) {
            debug!("Stopped forwarding to {:?}: {}", target, e);
            break;
        }
    }
}
