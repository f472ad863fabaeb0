//! Relay wire protocol. One JSON text frame per message, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{EndpointId, Participant, SessionId};

/// Directed negotiation payload. The directory never looks inside it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }
}

/// Endpoint → directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    SetDisplayName {
        name: String,
    },
    CreateSession {
        #[serde(default)]
        display_name: Option<String>,
    },
    JoinSession {
        session_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    LeaveSession {
        session_id: String,
    },
    Signal {
        target: EndpointId,
        payload: SignalPayload,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    ResourceExhausted,
    Malformed,
}

/// Directory → endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        endpoint_id: EndpointId,
    },
    CreateSessionResult {
        session_id: SessionId,
    },
    JoinSessionResult {
        session_id: SessionId,
        participants: Vec<Participant>,
    },
    LeaveSessionResult {
        session_id: SessionId,
    },
    ParticipantJoined {
        endpoint_id: EndpointId,
        display_name: String,
    },
    ParticipantLeft {
        endpoint_id: EndpointId,
    },
    Signal {
        from: EndpointId,
        payload: SignalPayload,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn malformed(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind: ErrorKind::Malformed,
            message: message.into(),
        }
    }
}

impl From<&DirectoryError> for ServerMessage {
    fn from(e: &DirectoryError) -> Self {
        let kind = match e {
            DirectoryError::NotFound(_) => ErrorKind::NotFound,
            DirectoryError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
        };
        ServerMessage::Error {
            kind,
            message: e.to_string(),
        }
    }
}
