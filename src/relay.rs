//! Addressable per-endpoint outbound queues.
//!
//! Every connected endpoint gets a bounded queue drained by its socket writer. Delivery
//! never waits, so the directory is never held up by a slow or vanished endpoint. A
//! closed queue drops the message. A full one evicts the endpoint: its writer drains
//! what is queued and closes the socket, and the disconnect becomes an implicit leave.
//! Losing frames silently would leave a client waiting for a reply that never comes.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::EndpointId;
use crate::signaling::ServerMessage;

/// Non-blocking delivery of directory messages to one endpoint.
pub trait Outbox: Send + Sync {
    /// Returns false when the message was dropped.
    fn deliver(&self, to: &EndpointId, message: &ServerMessage) -> bool;
}

/// Registry of connected endpoints and their outbound queues.
pub struct RelayHub {
    connections: DashMap<EndpointId, mpsc::Sender<String>>,
    max_send_queue: usize,
}

impl RelayHub {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection under a fresh, unguessable id.
    pub fn register(&self) -> (EndpointId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        loop {
            let id = EndpointId::generate();
            if let Entry::Vacant(slot) = self.connections.entry(id.clone()) {
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    pub fn unregister(&self, id: &EndpointId) {
        if self.connections.remove(id).is_some() {
            debug!(endpoint_id = %id, "endpoint unregistered from relay");
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Outbox for RelayHub {
    fn deliver(&self, to: &EndpointId, message: &ServerMessage) -> bool {
        let Some(tx) = self.connections.get(to).map(|e| e.value().clone()) else {
            debug!(endpoint_id = %to, "dropping message for disconnected endpoint");
            return false;
        };
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                warn!(endpoint_id = %to, error = %e, "failed to serialize message");
                return false;
            }
        };
        match tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(endpoint_id = %to, msg_len = msg.len(), "send queue full, evicting endpoint");
                self.connections
                    .remove_if(to, |_, current| current.same_channel(&tx));
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(endpoint_id = %to, "send queue closed, dropping message");
                false
            }
        }
    }
}
