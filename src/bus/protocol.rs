//! Bus request and reply messages
//!
//! Every channel a peer opens to the bus carries exactly one [`BusRequest`].
//! Replies, when asked for, travel back as a [`Delivery`] on the sender attached
//! to the request.

use serde::{Deserialize, Serialize};

/// What a peer asks the bus to do on a fresh channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusRequest {
    /// Deliver values sent to `address` to the sender attached to this request
    Register {
        address: String,
        /// Answer with [`Delivery::Registered`] or [`Delivery::AddressInUse`]
        /// on the attached sender before any routed value
        #[serde(default)]
        confirm: bool,
    },
    /// Route `payload` to whoever registered `address`
    Message {
        address: String,
        payload: serde_json::Value,
        /// Answer with a [`Delivery`] verdict on the attached sender
        #[serde(default)]
        confirm: bool,
    },
}

impl BusRequest {
    pub fn address(&self) -> &str {
        match self {
            BusRequest::Register { address, .. } | BusRequest::Message { address, .. } => address,
        }
    }

    pub fn wants_confirmation(&self) -> bool {
        match self {
            BusRequest::Register { confirm, .. } | BusRequest::Message { confirm, .. } => *confirm,
        }
    }
}

/// The bus's verdict on a confirmed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// The payload was handed to the registered receiver's connection
    Delivered,
    /// The address now routes to the attached sender
    Registered,
    /// Nobody is registered under the address
    NoRoute,
    /// The address is taken and the bus rejects re-registration
    AddressInUse,
}
