//! Address registry shared by every bus connection

use std::collections::HashMap;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::bus::protocol::Delivery;
use crate::config::ReregistrationPolicy;
use crate::transport::Sender;

/// Bus-assigned identifier of an attached connection
pub type ConnectionId = u64;

/// Where values for one address go
#[derive(Debug, Clone)]
pub struct Registration {
    pub sender: Sender,
    /// Connection that registered the address
    pub connection: ConnectionId,
}

/// Result of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// An earlier registration from `previous` was dropped
    Replaced { previous: ConnectionId },
    /// The address stays with `holder`
    Rejected { holder: ConnectionId },
}

/// Address -> receiver map
pub struct Registry {
    policy: ReregistrationPolicy,
    entries: TokioMutex<HashMap<String, Registration>>,
}

impl Registry {
    pub fn new(policy: ReregistrationPolicy) -> Self {
        Self {
            policy,
            entries: TokioMutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ReregistrationPolicy {
        self.policy
    }

    /// Record `address -> sender`.
    ///
    /// A registration displaced under `Replace` has its sender closed, so the
    /// peer that held it sees its receiver end.
    ///
    /// With `confirm` set, the verdict is sent on `sender` while the map is
    /// still locked, so it always precedes the first routed value. A rejected
    /// sender is closed, which ends the registering peer's receiver.
    pub async fn register(
        &self,
        address: &str,
        sender: Sender,
        connection: ConnectionId,
        confirm: bool,
    ) -> RegisterOutcome {
        let mut entries = self.entries.lock().await;

        let holder = entries.get(address).map(|r| r.connection);
        if let (Some(holder), ReregistrationPolicy::Reject) = (holder, self.policy) {
            warn!(
                "Rejecting registration of {:?} from connection {} (held by connection {})",
                address, connection, holder
            );
            if confirm {
                let _ = sender.send(&Delivery::AddressInUse);
            }
            let _ = sender.close();
            return RegisterOutcome::Rejected { holder };
        }

        if confirm {
            if let Err(e) = sender.send(&Delivery::Registered) {
                debug!("Could not confirm registration of {:?}: {}", address, e);
            }
        }

        let displaced = entries.insert(address.to_string(), Registration { sender, connection });
        if let Some(displaced) = displaced {
            // Ends the displaced peer's receiver instead of leaving it waiting
            let _ = displaced.sender.close();
        }
        match holder {
            Some(previous) => {
                debug!(
                    "Address {:?} moved from connection {} to connection {}",
                    address, previous, connection
                );
                RegisterOutcome::Replaced { previous }
            }
            None => {
                debug!("Address {:?} registered by connection {}", address, connection);
                RegisterOutcome::Inserted
            }
        }
    }

    /// Current registration for `address`
    pub async fn lookup(&self, address: &str) -> Option<Registration> {
        self.entries.lock().await.get(address).cloned()
    }

    /// Registered addresses, sorted
    pub async fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop every registration
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
