//! The media transport engine as seen by negotiation: it turns opaque descriptions
//! and candidates into a connection, and reports back what it gathers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::peer::types::{Connectivity, IceCandidate, SessionDescription};
use crate::session::EndpointId;

/// Notifications raised by a transport handle on its own schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
}

/// Factory for per-peer transport handles.
#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    async fn open(
        &self,
        peer: &EndpointId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// One transport handle towards one remote endpoint.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it locally.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Drop a local offer that has not been answered.
    async fn rollback(&self) -> Result<(), TransportError>;

    /// Apply a remote offer, then create and apply the answer.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Release the handle. Safe to call more than once.
    async fn close(&self);
}
