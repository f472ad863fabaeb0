use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::random_id;

/// Six-character session code, e.g. `K4Q9ZD`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Normalise user input the way codes are typed: trimmed and upper-cased.
    pub fn normalized(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one relay connection. Stable for the connection's lifetime.
///
/// Ids are compared byte-wise as strings; `Role::for_pair` relies on this
/// ordering being total and identical on every endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn generate() -> Self {
        Self(random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roster entry as seen by other members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: EndpointId,
    pub name: String,
}

/// Membership of one session. Only the directory mutates it, under the session lock.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub creator: EndpointId,
    pub created_at: DateTime<Utc>,
    participants: HashMap<EndpointId, String>,
    // Set when the last member leaves; a racing joiner holding the Arc must treat it as gone.
    closed: bool,
}

impl Session {
    pub fn new(id: SessionId, creator: EndpointId, creator_name: String) -> Self {
        let mut participants = HashMap::new();
        participants.insert(creator.clone(), creator_name);
        Self {
            id,
            creator,
            created_at: Utc::now(),
            participants,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Returns false if the endpoint was already a member.
    pub fn add(&mut self, endpoint: EndpointId, name: String) -> bool {
        self.participants.insert(endpoint, name).is_none()
    }

    /// Removes a member and marks the session closed once nobody is left.
    pub fn remove(&mut self, endpoint: &EndpointId) -> bool {
        let removed = self.participants.remove(endpoint).is_some();
        if removed && self.is_empty() {
            self.closed = true;
        }
        removed
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .map(|(id, name)| Participant {
                id: id.clone(),
                name: name.clone(),
            })
            .collect()
    }

    /// Everybody except `endpoint`.
    pub fn roster_excluding(&self, endpoint: &EndpointId) -> Vec<Participant> {
        self.roster()
            .into_iter()
            .filter(|p| &p.id != endpoint)
            .collect()
    }

    pub fn members_except(&self, endpoint: &EndpointId) -> Vec<EndpointId> {
        self.participants
            .keys()
            .filter(|id| *id != endpoint)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_normalised() {
        assert_eq!(SessionId::normalized("  ab12cd "), SessionId::from("AB12CD"));
    }

    #[test]
    fn new_session_has_only_the_creator() {
        let creator = EndpointId::from("x");
        let session = Session::new("AAAAAA".into(), creator.clone(), "X".into());
        assert_eq!(session.len(), 1);
        assert_eq!(session.members_except(&EndpointId::from("nobody")), vec![creator]);
        assert!(!session.is_closed());
    }

    #[test]
    fn removing_last_member_closes_session() {
        let x = EndpointId::from("x");
        let y = EndpointId::from("y");
        let mut session = Session::new("AAAAAA".into(), x.clone(), "X".into());
        assert!(session.add(y.clone(), "Y".into()));
        assert!(!session.add(y.clone(), "Y".into()));

        assert!(session.remove(&x));
        assert!(!session.is_closed());
        assert!(!session.remove(&x));
        assert!(session.remove(&y));
        assert!(session.is_closed());
        assert!(session.is_empty());
    }

    #[test]
    fn roster_excludes_caller() {
        let x = EndpointId::from("x");
        let y = EndpointId::from("y");
        let mut session = Session::new("AAAAAA".into(), x.clone(), "X".into());
        session.add(y.clone(), "Y".into());

        let roster = session.roster_excluding(&y);
        assert_eq!(
            roster,
            vec![Participant {
                id: x.clone(),
                name: "X".into()
            }]
        );
        assert_eq!(session.members_except(&x), vec![y]);
    }
}
