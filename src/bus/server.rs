//! The bus: accepts connections and routes addressed messages between them
//!
//! Each attached connection gets its own task. The task waits for the peer to
//! open a channel, reads the single [`BusRequest`] on it and acts on it before
//! waiting for the next channel. The only state shared between tasks is the
//! [`Registry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::protocol::{BusRequest, Delivery};
use crate::bus::registry::{ConnectionId, RegisterOutcome, Registry};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::transport::{Receiver, Role, Sender, Transport, TransportError};

/// Routing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Messages handed to a registered receiver
    pub routed: u64,
    /// Messages with no live registration for their address
    pub missed: u64,
    /// Registrations refused under [`ReregistrationPolicy::Reject`](crate::config::ReregistrationPolicy::Reject)
    pub rejected: u64,
}

/// Address-based message router
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    registry: Registry,
    connections: TokioMutex<HashMap<ConnectionId, Arc<Transport>>>,
    next_connection: AtomicU64,
    routed: AtomicU64,
    missed: AtomicU64,
    rejected: AtomicU64,
    shutdown: CancellationToken,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Create an empty bus with default settings
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        let registry = Registry::new(config.reregistration);
        Self {
            inner: Arc::new(BusInner {
                config,
                registry,
                connections: TokioMutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                routed: AtomicU64::new(0),
                missed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Attach a connection and start serving it.
    ///
    /// Returns as soon as the connection's task is running; routing happens in
    /// the background.
    pub async fn connect<S>(&self, stream: S) -> Result<ConnectionId, BusError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let transport = Transport::new(stream, Role::Server, &self.inner.config.transport)?;
        self.attach(transport).await
    }

    /// Attach a connected std Unix socket
    #[cfg(unix)]
    pub async fn connect_std(
        &self,
        stream: std::os::unix::net::UnixStream,
    ) -> Result<ConnectionId, BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let transport =
            Transport::from_std_unix(stream, Role::Server, &self.inner.config.transport)?;
        self.attach(transport).await
    }

    async fn attach(&self, transport: Transport) -> Result<ConnectionId, BusError> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(transport);

        {
            let mut connections = self.inner.connections.lock().await;
            if self.inner.shutdown.is_cancelled() {
                transport.close();
                return Err(BusError::Closed);
            }
            connections.insert(id, Arc::clone(&transport));
        }

        tokio::spawn(serve_connection(Arc::clone(&self.inner), id, transport));
        info!("Bus accepted connection {}", id);
        Ok(id)
    }

    /// Currently registered addresses, sorted
    pub async fn addresses(&self) -> Vec<String> {
        self.inner.registry.addresses().await
    }

    /// Number of connections still being served
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            routed: self.inner.routed.load(Ordering::Relaxed),
            missed: self.inner.missed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close every connection and forget every registration
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let connections: Vec<_> = self.inner.connections.lock().await.drain().collect();
        for (id, transport) in connections {
            debug!("Closing bus connection {}", id);
            transport.close();
        }
        self.inner.registry.clear().await;
        info!("Bus closed");
    }
}

async fn serve_connection(inner: Arc<BusInner>, id: ConnectionId, transport: Arc<Transport>) {
    loop {
        let receiver = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = transport.wait_receive_channel() => match result {
                Ok(receiver) => receiver,
                Err(e) => {
                    debug!("Connection {} ended: {}", id, e);
                    break;
                }
            },
        };

        let request = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = read_request(receiver) => result,
        };

        match request {
            Ok((request, reply)) => inner.handle_request(id, request, reply).await,
            Err(TransportError::Decode(e)) => {
                warn!("Connection {} sent a malformed bus request: {}", id, e);
            }
            Err(e) => debug!("Channel on connection {} closed before a request: {}", id, e),
        }
    }

    inner.connections.lock().await.remove(&id);
    transport.close();
    info!("Bus connection {} closed", id);
}

async fn read_request(
    mut receiver: Receiver,
) -> Result<(BusRequest, Option<Sender>), TransportError> {
    receiver.receive_with_reply::<BusRequest>().await
}

impl BusInner {
    async fn handle_request(&self, id: ConnectionId, request: BusRequest, reply: Option<Sender>) {
        match request {
            BusRequest::Register { address, confirm } => {
                let Some(sender) = reply else {
                    warn!(
                        "Connection {} registered {:?} without a delivery channel",
                        id, address
                    );
                    return;
                };
                let outcome = self.registry.register(&address, sender, id, confirm).await;
                if let RegisterOutcome::Rejected { .. } = outcome {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            BusRequest::Message {
                address,
                payload,
                confirm,
            } => {
                let verdict = self.route(id, &address, &payload).await;
                if let (true, Some(reply)) = (confirm, reply) {
                    if let Err(e) = reply.send(&verdict) {
                        debug!("Could not report delivery of {:?}: {}", address, e);
                    }
                    let _ = reply.close();
                }
            }
        }
    }

    async fn route(&self, id: ConnectionId, address: &str, payload: &serde_json::Value) -> Delivery {
        let Some(registration) = self.registry.lookup(address).await else {
            self.missed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "No receiver registered for {:?}; dropping message from connection {}",
                address, id
            );
            return Delivery::NoRoute;
        };

        match registration.sender.send(payload) {
            Ok(()) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Routed message for {:?} from connection {} to connection {}",
                    address, id, registration.connection
                );
                Delivery::Delivered
            }
            Err(e) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Receiver for {:?} on connection {} is gone: {}",
                    address, registration.connection, e
                );
                Delivery::NoRoute
            }
        }
    }
}
