//! Authoritative registry of sessions and their members.
//!
//! Each session sits behind its own mutex, so membership changes to one session are
//! linearizable while unrelated sessions proceed in parallel. Membership events are
//! pushed to the outbox while the session lock is held, which keeps every member's
//! view of joins and leaves in the same order as the mutations themselves.
//!
//! Lock order is session mutex, then map shard; no code path locks a session while
//! holding a guard into `sessions` or `endpoints`. An endpoint's session is recorded
//! before any other member can learn of it.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::code::{CodeSource, RandomCodes};
use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::relay::Outbox;
use crate::session::{EndpointId, Participant, Session, SessionId};
use crate::signaling::{ServerMessage, SignalPayload};
use crate::utils::display_name_or_default;

#[derive(Debug, Clone)]
struct EndpointRecord {
    name: String,
    session: Option<SessionId>,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub session_id: SessionId,
    /// Everybody already in the session, excluding the joiner.
    pub participants: Vec<Participant>,
}

pub struct Directory {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    endpoints: DashMap<EndpointId, EndpointRecord>,
    codes: Box<dyn CodeSource>,
    outbox: Arc<dyn Outbox>,
    config: DirectoryConfig,
}

impl Directory {
    pub fn new(outbox: Arc<dyn Outbox>, config: DirectoryConfig) -> Self {
        Self::with_codes(outbox, config, Box::new(RandomCodes))
    }

    pub fn with_codes(
        outbox: Arc<dyn Outbox>,
        config: DirectoryConfig,
        codes: Box<dyn CodeSource>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            endpoints: DashMap::new(),
            codes,
            outbox,
            config,
        }
    }

    /// Make an endpoint known. Its display name starts as "Anonymous".
    pub fn connect(&self, endpoint: &EndpointId) {
        self.endpoints.insert(
            endpoint.clone(),
            EndpointRecord {
                name: display_name_or_default(None),
                session: None,
            },
        );
    }

    pub fn set_display_name(&self, endpoint: &EndpointId, name: &str) {
        if let Some(mut record) = self.endpoints.get_mut(endpoint) {
            record.name = display_name_or_default(Some(name));
            debug!(endpoint_id = %endpoint, name = %record.name, "display name set");
        }
    }

    /// Create a session with the caller as sole member. The caller is associated and
    /// answered before the code becomes visible to joiners.
    pub fn create_session(
        &self,
        caller: &EndpointId,
        display_name: Option<&str>,
    ) -> Result<SessionId, DirectoryError> {
        let name = self.resolve_name(caller, display_name);
        self.leave_current(caller);

        for _ in 0..self.config.max_code_attempts {
            let code = self.codes.next_code();
            if let Entry::Vacant(slot) = self.sessions.entry(code.clone()) {
                self.associate(caller, Some(code.clone()));
                self.outbox.deliver(
                    caller,
                    &ServerMessage::CreateSessionResult {
                        session_id: code.clone(),
                    },
                );
                let session = Session::new(code.clone(), caller.clone(), name.clone());
                slot.insert(Arc::new(Mutex::new(session)));
                info!(session_id = %code, endpoint_id = %caller, name = %name, "session created");
                return Ok(code);
            }
            debug!(session_id = %code, "session code collision, retrying");
        }

        let err = DirectoryError::ResourceExhausted {
            attempts: self.config.max_code_attempts,
        };
        warn!(endpoint_id = %caller, error = %err, "session creation failed");
        self.reject(caller, err)
    }

    /// Join by code. The roster snapshot, the joined event to every other member and
    /// the reply to the caller all happen under the session lock.
    pub fn join_session(
        &self,
        caller: &EndpointId,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<Joined, DirectoryError> {
        let code = SessionId::normalized(code);
        let Some(session) = self.lookup(&code) else {
            debug!(session_id = %code, endpoint_id = %caller, "join for unknown session");
            return self.reject(caller, DirectoryError::NotFound(code));
        };
        let name = self.resolve_name(caller, display_name);

        if self.session_of(caller).as_ref() != Some(&code) {
            self.leave_current(caller);
        }

        let participants = {
            let mut s = session.lock();
            if s.is_closed() {
                drop(s);
                return self.reject(caller, DirectoryError::NotFound(code));
            }
            // Before anyone hears of the joiner, so their first signal to it is relayed.
            self.associate(caller, Some(code.clone()));
            if s.add(caller.clone(), name.clone()) {
                let event = ServerMessage::ParticipantJoined {
                    endpoint_id: caller.clone(),
                    display_name: name.clone(),
                };
                for member in s.members_except(caller) {
                    self.outbox.deliver(&member, &event);
                }
                info!(session_id = %code, endpoint_id = %caller, name = %name, size = s.len(), "participant joined");
            }
            let participants = s.roster_excluding(caller);
            self.outbox.deliver(
                caller,
                &ServerMessage::JoinSessionResult {
                    session_id: code.clone(),
                    participants: participants.clone(),
                },
            );
            participants
        };

        Ok(Joined {
            session_id: code,
            participants,
        })
    }

    /// Leaving a session the caller is not in, or one that does not exist, is a no-op.
    /// The caller is acknowledged either way.
    pub fn leave_session(&self, caller: &EndpointId, code: &str) {
        let code = SessionId::normalized(code);
        self.leave_quietly(caller, &code);
        self.outbox
            .deliver(caller, &ServerMessage::LeaveSessionResult { session_id: code });
    }

    /// Transport loss: implicit leave, then forget the endpoint. Idempotent.
    pub fn disconnect(&self, endpoint: &EndpointId) {
        let Some((_, record)) = self.endpoints.remove(endpoint) else {
            return;
        };
        if let Some(session) = record.session.as_ref().and_then(|code| self.lookup(code)) {
            self.remove_member(&session, endpoint);
        }
        info!(endpoint_id = %endpoint, name = %record.name, "endpoint disconnected");
    }

    /// Forward a negotiation payload to `to` when both endpoints share a session.
    /// Anything else is dropped; the sender is never told.
    pub fn relay_signal(&self, from: &EndpointId, to: &EndpointId, payload: SignalPayload) -> bool {
        let kind = payload.kind();
        match (self.session_of(from), self.session_of(to)) {
            (Some(a), Some(b)) if a == b => {
                let delivered = self.outbox.deliver(
                    to,
                    &ServerMessage::Signal {
                        from: from.clone(),
                        payload,
                    },
                );
                debug!(session_id = %a, from = %from, to = %to, kind, delivered, "relayed signal");
                delivered
            }
            _ => {
                debug!(from = %from, to = %to, kind, "dropping signal outside a shared session");
                false
            }
        }
    }

    pub fn session_of(&self, endpoint: &EndpointId) -> Option<SessionId> {
        self.endpoints.get(endpoint).and_then(|r| r.session.clone())
    }

    pub fn participants(&self, code: &SessionId) -> Option<Vec<Participant>> {
        let session = self.lookup(code)?;
        let s = session.lock();
        (!s.is_closed()).then(|| s.roster())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn lookup(&self, code: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(code).map(|e| Arc::clone(e.value()))
    }

    fn resolve_name(&self, caller: &EndpointId, requested: Option<&str>) -> String {
        let requested = requested.filter(|n| !n.trim().is_empty());
        let name = match requested {
            Some(n) => display_name_or_default(Some(n)),
            None => self
                .endpoints
                .get(caller)
                .map(|r| r.name.clone())
                .unwrap_or_else(|| display_name_or_default(None)),
        };
        if let Some(mut record) = self.endpoints.get_mut(caller) {
            record.name = name.clone();
        }
        name
    }

    fn associate(&self, endpoint: &EndpointId, session: Option<SessionId>) {
        match self.endpoints.get_mut(endpoint) {
            Some(mut record) => record.session = session,
            None => {
                self.endpoints.insert(
                    endpoint.clone(),
                    EndpointRecord {
                        name: display_name_or_default(None),
                        session,
                    },
                );
            }
        }
    }

    fn leave_current(&self, endpoint: &EndpointId) {
        if let Some(code) = self.session_of(endpoint) {
            debug!(session_id = %code, endpoint_id = %endpoint, "leaving previous session");
            self.leave_quietly(endpoint, &code);
        }
    }

    fn leave_quietly(&self, endpoint: &EndpointId, code: &SessionId) {
        if let Some(session) = self.lookup(code) {
            self.remove_member(&session, endpoint);
        }
        if let Some(mut record) = self.endpoints.get_mut(endpoint) {
            if record.session.as_ref() == Some(code) {
                record.session = None;
            }
        }
    }

    fn reject<T>(&self, caller: &EndpointId, err: DirectoryError) -> Result<T, DirectoryError> {
        self.outbox.deliver(caller, &ServerMessage::from(&err));
        Err(err)
    }

    fn remove_member(&self, session: &Arc<Mutex<Session>>, endpoint: &EndpointId) {
        let mut s = session.lock();
        if !s.remove(endpoint) {
            return;
        }
        let event = ServerMessage::ParticipantLeft {
            endpoint_id: endpoint.clone(),
        };
        for member in s.members_except(endpoint) {
            self.outbox.deliver(&member, &event);
        }
        info!(session_id = %s.id, endpoint_id = %endpoint, size = s.len(), "participant left");

        if s.is_closed() {
            self.sessions.remove_if(&s.id, |_, current| Arc::ptr_eq(current, session));
            let lifetime = Utc::now() - s.created_at;
            info!(
                session_id = %s.id,
                creator = %s.creator,
                lifetime_secs = lifetime.num_seconds(),
                "session deleted (empty)"
            );
        }
    }
}
