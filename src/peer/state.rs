use serde::{Deserialize, Serialize};

use crate::session::EndpointId;

/// Signaling state of one side of a pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    /// Terminal.
    Closed,
}

impl SignalingState {
    pub fn can_initiate(self) -> bool {
        matches!(self, SignalingState::Idle | SignalingState::Stable)
    }
}

/// Glare tie-break role, fixed for the lifetime of a pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Yields on glare: rolls back its own offer and answers the peer's.
    Polite,
    /// Keeps its own offer on glare and ignores the peer's.
    Impolite,
}

impl Role {
    /// Role of `local` when negotiating with `remote`.
    ///
    /// Endpoint ids are compared as byte strings (`EndpointId: Ord`). The smaller id is
    /// impolite, the larger polite. Both sides evaluate the same comparison with the
    /// arguments swapped, so they always end up with opposite roles without talking to
    /// each other. Equal ids cannot occur between two live connections; they resolve to
    /// impolite.
    pub fn for_pair(local: &EndpointId, remote: &EndpointId) -> Role {
        if local > remote {
            Role::Polite
        } else {
            Role::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        self == Role::Polite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_complementary() {
        let a = EndpointId::from("0a1f");
        let b = EndpointId::from("9c00");
        assert_eq!(Role::for_pair(&a, &b), Role::Impolite);
        assert_eq!(Role::for_pair(&b, &a), Role::Polite);
    }

    #[test]
    fn roles_agree_for_generated_ids() {
        for _ in 0..50 {
            let a = EndpointId::generate();
            let b = EndpointId::generate();
            assert_ne!(Role::for_pair(&a, &b), Role::for_pair(&b, &a));
        }
    }

    #[test]
    fn only_idle_and_stable_can_initiate() {
        assert!(SignalingState::Idle.can_initiate());
        assert!(SignalingState::Stable.can_initiate());
        assert!(!SignalingState::HaveLocalOffer.can_initiate());
        assert!(!SignalingState::HaveRemoteOffer.can_initiate());
        assert!(!SignalingState::Closed.can_initiate());
    }
}
