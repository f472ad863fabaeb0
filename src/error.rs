use thiserror::Error;

use crate::peer::state::SignalingState;
use crate::session::SessionId;
use crate::signaling::ErrorKind;

/// Failures surfaced to the endpoint that issued a directory request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// Operational failure, never a protocol error.
    #[error("no free session code after {attempts} attempts")]
    ResourceExhausted { attempts: usize },
}

/// Protocol violations detected by one side of a pair. They stay local to that pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("answer received in state {0:?}")]
    UnexpectedAnswer(SignalingState),

    #[error("offer received in state {0:?}")]
    UnexpectedOffer(SignalingState),

    #[error("cannot initiate from state {0:?}")]
    InvalidInitiate(SignalingState),
}

impl NegotiationError {
    /// Whether the pair must be torn down and renegotiated after this violation.
    pub fn requires_reset(&self) -> bool {
        match self {
            NegotiationError::UnexpectedAnswer(_) | NegotiationError::UnexpectedOffer(_) => true,
            NegotiationError::InvalidInitiate(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport engine: {0}")]
    Engine(String),

    #[error("transport handle already closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::Engine(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to directory: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("unexpected reply from directory: {0}")]
    Protocol(String),

    #[error("directory rejected request ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("relay connection closed")]
    Closed,
}
