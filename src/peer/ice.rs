use std::collections::VecDeque;

use crate::peer::types::IceCandidate;

/// Remote candidates that arrived before any remote description was applied.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Takes every queued candidate in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateKind {
    pub fn of(candidate: &IceCandidate) -> Self {
        let c = &candidate.candidate;
        if c.contains("typ host") {
            CandidateKind::Host
        } else if c.contains("typ srflx") {
            CandidateKind::ServerReflexive
        } else if c.contains("typ prflx") {
            CandidateKind::PeerReflexive
        } else if c.contains("typ relay") {
            CandidateKind::Relay
        } else {
            CandidateKind::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_arrival_order() {
        let mut q = CandidateQueue::new();
        q.push(IceCandidate::new("c1"));
        q.push(IceCandidate::new("c2"));
        q.push(IceCandidate::new("c3"));
        assert_eq!(q.len(), 3);

        let drained: Vec<_> = q.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c1", "c2", "c3"]);
        assert!(q.is_empty());
    }

    #[test]
    fn classifies_candidate_types() {
        let host = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host");
        let srflx = IceCandidate::new("candidate:2 1 udp 1694498815 1.2.3.4 6000 typ srflx raddr 10.0.0.2 rport 5000");
        let relay = IceCandidate::new("candidate:3 1 udp 16777215 5.6.7.8 7000 typ relay");
        assert_eq!(CandidateKind::of(&host), CandidateKind::Host);
        assert_eq!(CandidateKind::of(&srflx), CandidateKind::ServerReflexive);
        assert_eq!(CandidateKind::of(&relay), CandidateKind::Relay);
        assert_eq!(CandidateKind::of(&IceCandidate::new("garbage")), CandidateKind::Unknown);
    }
}
