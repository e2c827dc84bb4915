//! Tunnel listener registry

use crate::error::ClientError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tunnel_proto::{MessageBody, TransactionId, TunnelName};

/// A message received on a tunnel the client listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub transaction_id: TransactionId,
    pub tunnel: TunnelName,
    pub message: MessageBody,
}

/// Outcome of routing one inbound message
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    UnknownTunnel,
    Closed,
}

struct Slot {
    registration: u64,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

/// Maps tunnel names to their delivery channel
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    tunnels: Arc<DashMap<String, Slot>>,
    next_registration: Arc<AtomicU64>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` and return the receiving end of its channel
    ///
    /// Messages for the tunnel are queued from this point on, even before the
    /// broker has acknowledged the subscription. The claim is released when
    /// the returned [`Reservation`] is dropped without being committed.
    pub fn reserve(
        &self,
        name: &TunnelName,
    ) -> Result<(Reservation, mpsc::UnboundedReceiver<InboundMessage>), ClientError> {
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);

        let rx = match self.tunnels.entry(name.as_str().to_string()) {
            Entry::Occupied(_) => return Err(ClientError::AlreadyListening(name.to_string())),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                entry.insert(Slot { registration, tx });
                rx
            }
        };

        let reservation = Reservation {
            name: name.as_str().to_string(),
            registration,
            committed: false,
            tunnels: self.tunnels.clone(),
        };
        Ok((reservation, rx))
    }

    /// Queue `message` for its tunnel; never blocks
    pub fn deliver(&self, message: InboundMessage) -> Delivery {
        match self.tunnels.get(message.tunnel.as_str()) {
            Some(slot) => match slot.tx.send(message) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
            None => Delivery::UnknownTunnel,
        }
    }

    pub fn clear(&self) {
        self.tunnels.clear();
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }
}

/// Claim on a tunnel name held while its subscription is in flight
pub(crate) struct Reservation {
    name: String,
    registration: u64,
    committed: bool,
    tunnels: Arc<DashMap<String, Slot>>,
}

impl Reservation {
    /// Keep the tunnel claimed for the lifetime of the client
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let registration = self.registration;
        self.tunnels
            .remove_if(&self.name, |_, slot| slot.registration == registration);
    }
}
