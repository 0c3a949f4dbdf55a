//! Connection state and the reader/writer tasks behind a [`Transport`]
//!
//! A connection is split into a read half and a write half, each driven by its
//! own task. Everything that wants to write queues a [`Frame`] on the writer's
//! channel; the reader routes inbound frames to per-channel queues.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::transport::channel::{forward, pipe, Envelope, Receiver, Sender};
use crate::transport::frame::{codec, ChannelId, Frame, PROTOCOL_VERSION};
use crate::transport::TransportError;

/// How long a closing writer keeps flushing frames that were already queued
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which end of the connection this transport is.
///
/// Only affects channel id allocation: clients use odd ids, servers even ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_channel(self) -> ChannelId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Shared state of one connection
pub(crate) struct Link {
    role: Role,
    outgoing: mpsc::UnboundedSender<Bytes>,
    max_frame_length: usize,
    routes: Mutex<HashMap<ChannelId, mpsc::UnboundedSender<Envelope>>>,
    next_channel: AtomicU64,
    shutdown: CancellationToken,
    /// The write half is gone; inbound frames are still routed until EOF
    write_broken: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("role", &self.role)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Link {
    fn new(role: Role, outgoing: mpsc::UnboundedSender<Bytes>, max_frame_length: usize) -> Self {
        Self {
            role,
            outgoing,
            max_frame_length,
            routes: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(role.first_channel()),
            shutdown: CancellationToken::new(),
            write_broken: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<ChannelId, mpsc::UnboundedSender<Envelope>>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate(&self) -> ChannelId {
        self.next_channel.fetch_add(2, Ordering::Relaxed)
    }

    /// Whether outbound frames are refused
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled() || self.write_broken.load(Ordering::Acquire)
    }

    /// Error reported to anyone touching the connection after it went away
    pub(crate) fn closed_error(&self) -> TransportError {
        match self.failure.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(reason) => TransportError::ConnectionLost(reason.clone()),
            None => TransportError::Closed,
        }
    }

    /// Encode `frame` and queue it for the writer.
    ///
    /// A frame over the configured limit is refused here and the connection
    /// stays usable.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(self.closed_error());
        }
        let bytes = frame.encode()?;
        if bytes.len() > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_length,
            });
        }
        self.outgoing.send(bytes).map_err(|_| self.closed_error())
    }

    /// Make `reply` reachable from the peer and return the channel id to announce.
    ///
    /// Local pipe senders are routed directly. Senders that belong to some other
    /// connection are proxied through a fresh pipe and a forwarding task.
    pub(crate) fn export(&self, reply: Sender) -> Result<ChannelId, TransportError> {
        let tx = match reply.into_local() {
            Ok(tx) => tx,
            Err(foreign) => {
                let runtime =
                    tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
                let (proxy_rx, proxy_tx) = pipe();
                runtime.spawn(forward(proxy_rx, foreign));
                proxy_tx
                    .into_local()
                    .map_err(|_| TransportError::Encode("pipe produced a remote sender".into()))?
            }
        };
        let channel = self.allocate();
        self.routes().insert(channel, tx);
        Ok(channel)
    }

    /// Undo [`export`](Self::export) for a reply that was never announced
    pub(crate) fn unexport(&self, channel: ChannelId) {
        self.routes().remove(&channel);
    }

    fn deliver(&self, channel: ChannelId, envelope: Envelope) {
        let mut routes = self.routes();
        match routes.get(&channel) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    trace!("Receiver for channel {} is gone, dropping route", channel);
                    routes.remove(&channel);
                }
            }
            None => warn!("Data for unknown channel {} dropped", channel),
        }
    }

    /// Keep the first reason the connection failed
    fn record_failure(&self, reason: String) {
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    /// The write half failed. Sends are refused from now on, but the reader
    /// keeps routing what the peer already sent until it sees EOF.
    fn break_writes(&self, reason: String) {
        self.record_failure(reason);
        self.write_broken.store(true, Ordering::Release);
    }

    /// Tear the connection down. The first recorded reason wins.
    fn shut_down(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            self.record_failure(reason);
        }
        self.shutdown.cancel();
        self.routes().clear();
    }
}

/// A channel-oriented transport over one duplex byte stream
pub struct Transport {
    link: Arc<Link>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Receiver>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("link", &self.link).finish()
    }
}

impl Transport {
    /// Build a client-side transport with default settings
    pub fn client<S>(stream: S) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(stream, Role::Client, &TransportConfig::default())
    }

    /// Build a server-side transport with default settings
    pub fn server<S>(stream: S) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(stream, Role::Server, &TransportConfig::default())
    }

    /// Attach a connected std Unix socket
    #[cfg(unix)]
    pub fn from_std_unix(
        stream: std::os::unix::net::UnixStream,
        role: Role,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        // Surface a pending socket error (e.g. peer reset) before attaching
        if let Some(e) = stream.take_error()? {
            return Err(TransportError::Io(e));
        }
        stream.set_nonblocking(true)?;
        tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let stream = tokio::net::UnixStream::from_std(stream)?;
        Self::new(stream, role, config)
    }

    /// Build a transport over `stream` and start its reader and writer tasks.
    ///
    /// Must be called inside a Tokio runtime. The `Hello` preface is queued
    /// immediately; the peer's preface is checked by the reader, and a bad one
    /// closes the connection with [`TransportError::ConnectionLost`].
    pub fn new<S>(stream: S, role: Role, config: &TransportConfig) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, codec(config.max_frame_length));
        let writer = FramedWrite::new(write_half, codec(config.max_frame_length));

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let link = Arc::new(Link::new(role, outgoing_tx, config.max_frame_length));
        link.enqueue(Frame::Hello {
            version: PROTOCOL_VERSION,
        })?;

        let writer = runtime.spawn(write_loop(writer, outgoing_rx, Arc::clone(&link)));
        runtime.spawn(read_loop(reader, Arc::clone(&link), incoming_tx));

        debug!("Transport started ({:?})", role);

        Ok(Self {
            link,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Open a new outbound channel
    pub fn new_send_channel(&self) -> Result<Sender, TransportError> {
        let channel = self.link.allocate();
        self.link.enqueue(Frame::Open { channel })?;
        trace!("Opened channel {}", channel);
        Ok(Sender::remote(channel, Arc::clone(&self.link)))
    }

    /// Wait for the peer to open a channel
    pub async fn wait_receive_channel(&self) -> Result<Receiver, TransportError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(|| self.link.closed_error())
    }

    /// Close the connection. Parties blocked on it, on either side, get an error.
    pub fn close(&self) {
        if !self.link.is_shut_down() {
            debug!("Closing transport ({:?})", self.link.role());
        }
        self.link.shut_down(None);
    }

    /// Close the connection and wait until frames queued before the close
    /// have been written (bounded by the drain timeout)
    pub async fn shutdown(&self) {
        self.close();
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    /// Resolves once the connection is gone, whoever closed it
    pub async fn closed(&self) {
        self.link.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_shut_down()
    }

    pub fn role(&self) -> Role {
        self.link.role()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.link.shut_down(None);
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, LengthDelimitedCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    link: Arc<Link>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outgoing.recv() => frame,
            _ = link.shutdown.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.send(frame).await {
            debug!("Write failed ({:?}): {}", link.role(), e);
            link.break_writes(format!("write failed: {}", e));
            return;
        }
    }

    // Frames queued before the close still go out, so fire-and-forget sends
    // followed by a close are not lost.
    let drain = async {
        while let Ok(frame) = outgoing.try_recv() {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("Gave up flushing queued frames ({:?})", link.role());
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    link: Arc<Link>,
    incoming: mpsc::UnboundedSender<Receiver>,
) where
    R: AsyncRead + Unpin,
{
    let mut greeted = false;

    let reason = loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = link.shutdown.cancelled() => break None,
        };
        let bytes = match next {
            None => break None,
            Some(Err(e)) => break Some(format!("read failed: {}", e)),
            Some(Ok(bytes)) => bytes,
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => break Some(e.to_string()),
        };

        if !greeted {
            match frame {
                Frame::Hello { version } if version == PROTOCOL_VERSION => {
                    greeted = true;
                    continue;
                }
                Frame::Hello { version } => {
                    break Some(format!(
                        "peer speaks protocol version {}, expected {}",
                        version, PROTOCOL_VERSION
                    ))
                }
                other => break Some(format!("expected Hello preface, got {:?}", other)),
            }
        }

        match frame {
            Frame::Hello { .. } => warn!("Duplicate Hello preface ignored"),
            Frame::Open { channel } => {
                let (tx, rx) = mpsc::unbounded_channel();
                link.routes().insert(channel, tx);
                trace!("Peer opened channel {}", channel);
                if incoming.send(Receiver::remote(rx, Arc::clone(&link))).is_err() {
                    debug!("Inbound channel {} opened after transport was dropped", channel);
                }
            }
            Frame::Data {
                channel,
                payload,
                reply,
            } => {
                let reply = reply.map(|id| Sender::remote(id, Arc::clone(&link)));
                link.deliver(channel, Envelope { payload, reply });
            }
            Frame::Close { channel } => {
                link.routes().remove(&channel);
            }
        }
    };

    match &reason {
        Some(reason) => debug!("Connection lost ({:?}): {}", link.role(), reason),
        None => debug!("Connection closed ({:?})", link.role()),
    }
    link.shut_down(reason);
}
