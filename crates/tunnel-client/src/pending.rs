//! Pending acknowledgements
//!
//! Every outbound request registers a waiter under its transaction id before
//! the PDU is sent. The inbound router resolves it with the Ack or Nack that
//! carries the same id.

use crate::error::ClientError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;
use tunnel_proto::TransactionId;

struct Slot {
    registration: u64,
    tx: oneshot::Sender<bool>,
}

/// Tracks requests awaiting an Ack or Nack
#[derive(Clone, Default)]
pub(crate) struct PendingAcks {
    waiters: Arc<DashMap<TransactionId, Slot>>,
    next_registration: Arc<AtomicU64>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `transaction_id`
    ///
    /// Fails if another request is still waiting on the same id.
    pub fn register(&self, transaction_id: TransactionId) -> Result<AckWaiter, ClientError> {
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.waiters.entry(transaction_id) {
            Entry::Occupied(_) => return Err(ClientError::TransactionInUse(transaction_id)),
            Entry::Vacant(entry) => {
                entry.insert(Slot { registration, tx });
            }
        }

        Ok(AckWaiter {
            transaction_id,
            registration,
            rx,
            waiters: self.waiters.clone(),
        })
    }

    /// Resolve the waiter for `transaction_id` with an Ack (`true`) or Nack
    ///
    /// Returns false if nobody was waiting on that id.
    pub fn resolve(&self, transaction_id: TransactionId, acked: bool) -> bool {
        match self.waiters.remove(&transaction_id) {
            Some((_, slot)) => slot.tx.send(acked).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their requests fail with [`ClientError::Stopped`]
    pub fn fail_all(&self) {
        let count = self.waiters.len();
        self.waiters.clear();
        if count > 0 {
            debug!("Failed {} pending acknowledgements", count);
        }
    }

    pub fn count(&self) -> usize {
        self.waiters.len()
    }
}

/// Registration guard for one pending request
///
/// Dropping it unregisters the waiter, whatever the outcome.
pub(crate) struct AckWaiter {
    transaction_id: TransactionId,
    registration: u64,
    rx: oneshot::Receiver<bool>,
    waiters: Arc<DashMap<TransactionId, Slot>>,
}

impl AckWaiter {
    /// Wait for the acknowledgement
    pub async fn wait(&mut self) -> Result<(), ClientError> {
        match (&mut self.rx).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClientError::Rejected),
            Err(_) => Err(ClientError::Stopped),
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        let registration = self.registration;
        self.waiters
            .remove_if(&self.transaction_id, |_, slot| slot.registration == registration);
    }
}
