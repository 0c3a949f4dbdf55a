//! Name-based view of one bus connection

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::bus::protocol::{BusRequest, Delivery};
use crate::config::TransportConfig;
use crate::error::BusError;
use crate::transport::{pipe, Receiver, Role, Transport, TransportError};

/// Client for a connection into a [`Bus`](crate::bus::Bus)
#[derive(Debug)]
pub struct NetClient {
    identity: String,
    transport: Transport,
}

impl NetClient {
    /// Wrap `stream`, which must lead to a bus connection.
    ///
    /// `identity` only labels log lines.
    pub fn new<S>(stream: S, identity: impl Into<String>) -> Result<Self, BusError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, identity, &TransportConfig::default())
    }

    pub fn with_config<S>(
        stream: S,
        identity: impl Into<String>,
        config: &TransportConfig,
    ) -> Result<Self, BusError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = Transport::new(stream, Role::Client, config)?;
        Ok(Self {
            identity: identity.into(),
            transport,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Register `address` and return the receiver its values will arrive on.
    ///
    /// Does not wait for the bus to process the registration; use
    /// [`register_exclusive`](Self::register_exclusive) for that.
    pub fn register(&self, address: &str) -> Result<Receiver, BusError> {
        self.send_registration(address, false)
    }

    /// Register `address` and wait for the bus to accept it.
    ///
    /// Fails with [`BusError::AddressInUse`] when the bus rejects duplicate
    /// registrations and the address is taken.
    pub async fn register_exclusive(&self, address: &str) -> Result<Receiver, BusError> {
        let mut receiver = self.send_registration(address, true)?;
        match receiver.receive::<Delivery>().await {
            Ok(Delivery::Registered) => Ok(receiver),
            Ok(Delivery::AddressInUse) => Err(BusError::AddressInUse(address.to_string())),
            Ok(other) => Err(BusError::Protocol(format!(
                "{:?} in reply to a registration",
                other
            ))),
            // A rejected registration is closed right after the verdict; anything
            // else closing first means the connection went away
            Err(e) => Err(BusError::Transport(e)),
        }
    }

    fn send_registration(&self, address: &str, confirm: bool) -> Result<Receiver, BusError> {
        let (receiver, delivery) = pipe();
        let channel = self.transport.new_send_channel()?;
        channel.send_with_reply(
            &BusRequest::Register {
                address: address.to_string(),
                confirm,
            },
            delivery,
        )?;
        channel.close()?;
        debug!("{} registered {:?}", self.identity, address);
        Ok(receiver)
    }

    /// Send `value` to whoever registered `address`.
    ///
    /// Returns once the value is queued on the connection. An address nobody
    /// registered is not an error here; the bus logs and counts the miss.
    pub fn message<T: Serialize + ?Sized>(&self, address: &str, value: &T) -> Result<(), BusError> {
        let channel = self.transport.new_send_channel()?;
        channel.send(&Self::request(address, value, false)?)?;
        channel.close()?;
        debug!("{} sent a message to {:?}", self.identity, address);
        Ok(())
    }

    /// Send `value` to `address` and wait for the bus to route it.
    ///
    /// Fails with [`BusError::NoRoute`] when nobody is registered under `address`.
    pub async fn message_confirmed<T: Serialize + ?Sized>(
        &self,
        address: &str,
        value: &T,
    ) -> Result<(), BusError> {
        let (mut verdict, reply) = pipe();
        let channel = self.transport.new_send_channel()?;
        channel.send_with_reply(&Self::request(address, value, true)?, reply)?;
        channel.close()?;

        match verdict.receive::<Delivery>().await? {
            Delivery::Delivered => Ok(()),
            Delivery::NoRoute => Err(BusError::NoRoute(address.to_string())),
            other => Err(BusError::Protocol(format!(
                "{:?} in reply to a message",
                other
            ))),
        }
    }

    fn request<T: Serialize + ?Sized>(
        address: &str,
        value: &T,
        confirm: bool,
    ) -> Result<BusRequest, BusError> {
        let payload =
            serde_json::to_value(value).map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(BusRequest::Message {
            address: address.to_string(),
            payload,
            confirm,
        })
    }

    /// Drop the connection to the bus
    pub fn close(&self) {
        self.transport.close();
    }
}
