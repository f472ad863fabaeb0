//! One side of the offer/answer exchange with a single remote endpoint.
//!
//! [`Negotiation`] is a pure state machine: it consumes [`Input`]s and returns the
//! [`Effect`]s the caller has to carry out against the transport engine and the relay,
//! in order. Results of those effects (a created offer, a created answer) come back in
//! as further inputs. Nothing here performs I/O, which keeps every glare interleaving
//! reproducible in a plain unit test.
//!
//! Glare is resolved by [`Role`]: the polite side rolls back its own offer and answers
//! the incoming one, the impolite side ignores the incoming offer and waits for its own
//! to be answered. After a rollback the polite side does not send a fresh offer; the
//! accepted offer already gives the pair one agreed description.
//!
//! A reset normally starts over with a fresh offer. The polite side is the exception
//! while it is answering: the impolite side ignores offers until its own is answered,
//! so the polite side re-applies the pending remote offer on the fresh transport instead.

use tracing::{debug, trace};

use crate::error::NegotiationError;
use crate::peer::ice::CandidateQueue;
use crate::peer::state::{Role, SignalingState};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::SignalPayload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Start (or restart) an offer round.
    Initiate,
    /// The engine produced and applied our local offer.
    OfferCreated(SessionDescription),
    RemoteOffer(SessionDescription),
    /// The engine applied the remote offer and produced our answer.
    AnswerCreated(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// Gathered by our own engine, to be trickled to the peer.
    LocalCandidate(IceCandidate),
    Reset,
    Close,
}

impl Input {
    pub fn from_signal(payload: SignalPayload) -> Self {
        match payload {
            SignalPayload::Offer { description } => Input::RemoteOffer(description),
            SignalPayload::Answer { description } => Input::RemoteAnswer(description),
            SignalPayload::Candidate { candidate } => Input::RemoteCandidate(candidate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create an offer and apply it as the local description; report `OfferCreated`.
    CreateOffer,
    /// Discard the pending local offer.
    Rollback,
    /// Apply the remote offer, create and apply an answer; report `AnswerCreated`.
    AcceptOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    Send(SignalPayload),
    /// Close the transport handle and open a fresh one.
    ReopenTransport,
    CloseTransport,
}

#[derive(Debug)]
pub struct Negotiation {
    role: Role,
    state: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: CandidateQueue,
    // Handed to the engine since `remote` was set; replayed if that offer is re-applied.
    applied: Vec<IceCandidate>,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SignalingState::Idle,
            local: None,
            remote: None,
            candidates: CandidateQueue::new(),
            applied: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == SignalingState::Closed
    }

    pub fn step(&mut self, input: Input) -> Result<Vec<Effect>, NegotiationError> {
        trace!(state = ?self.state, role = ?self.role, ?input, "negotiation step");
        if self.is_closed() {
            return Ok(Vec::new());
        }

        match input {
            Input::Initiate => {
                if !self.state.can_initiate() {
                    return Err(NegotiationError::InvalidInitiate(self.state));
                }
                self.state = SignalingState::HaveLocalOffer;
                self.local = None;
                Ok(vec![Effect::CreateOffer])
            }

            Input::OfferCreated(offer) => {
                if self.state != SignalingState::HaveLocalOffer || self.local.is_some() {
                    debug!(state = ?self.state, "dropping stale local offer");
                    return Ok(Vec::new());
                }
                self.local = Some(offer.clone());
                Ok(vec![Effect::Send(SignalPayload::Offer { description: offer })])
            }

            Input::RemoteOffer(offer) => match self.state {
                SignalingState::Idle | SignalingState::Stable => Ok(self.accept(offer, Vec::new())),
                SignalingState::HaveLocalOffer if self.role.is_polite() => {
                    debug!("glare: polite side rolling back local offer");
                    self.local = None;
                    self.state = SignalingState::Idle;
                    Ok(self.accept(offer, vec![Effect::Rollback]))
                }
                SignalingState::HaveLocalOffer => {
                    debug!("glare: impolite side ignoring remote offer");
                    Ok(Vec::new())
                }
                state => Err(NegotiationError::UnexpectedOffer(state)),
            },

            Input::AnswerCreated(answer) => {
                if self.state != SignalingState::HaveRemoteOffer {
                    debug!(state = ?self.state, "dropping stale local answer");
                    return Ok(Vec::new());
                }
                self.state = SignalingState::Stable;
                self.local = Some(answer.clone());
                Ok(vec![Effect::Send(SignalPayload::Answer { description: answer })])
            }

            Input::RemoteAnswer(answer) => {
                if self.state != SignalingState::HaveLocalOffer || self.local.is_none() {
                    return Err(NegotiationError::UnexpectedAnswer(self.state));
                }
                self.state = SignalingState::Stable;
                self.remote = Some(answer.clone());
                let mut effects = vec![Effect::ApplyAnswer(answer)];
                effects.extend(self.flush_candidates());
                Ok(effects)
            }

            Input::RemoteCandidate(candidate) => {
                if self.remote.is_some() {
                    self.applied.push(candidate.clone());
                    Ok(vec![Effect::AddCandidate(candidate)])
                } else {
                    self.candidates.push(candidate);
                    Ok(Vec::new())
                }
            }

            Input::LocalCandidate(candidate) => {
                Ok(vec![Effect::Send(SignalPayload::Candidate { candidate })])
            }

            Input::Reset => {
                let answering = self.role.is_polite() && self.state == SignalingState::HaveRemoteOffer;
                let pending = if answering { self.remote.take() } else { None };
                let replay = std::mem::take(&mut self.applied);
                self.discard();
                match pending {
                    Some(offer) => {
                        debug!(replayed = replay.len(), "reset: re-applying pending remote offer");
                        let mut effects = self.accept(offer, vec![Effect::ReopenTransport]);
                        self.applied.extend(replay.iter().cloned());
                        effects.extend(replay.into_iter().map(Effect::AddCandidate));
                        Ok(effects)
                    }
                    None => {
                        self.state = SignalingState::HaveLocalOffer;
                        Ok(vec![Effect::ReopenTransport, Effect::CreateOffer])
                    }
                }
            }

            Input::Close => {
                self.discard();
                self.state = SignalingState::Closed;
                Ok(vec![Effect::CloseTransport])
            }
        }
    }

    fn accept(&mut self, offer: SessionDescription, mut effects: Vec<Effect>) -> Vec<Effect> {
        self.state = SignalingState::HaveRemoteOffer;
        self.local = None;
        self.remote = Some(offer.clone());
        self.applied.clear();
        effects.push(Effect::AcceptOffer(offer));
        effects.extend(self.flush_candidates());
        effects
    }

    fn flush_candidates(&mut self) -> Vec<Effect> {
        let drained = self.candidates.drain();
        self.applied.extend(drained.iter().cloned());
        drained.into_iter().map(Effect::AddCandidate).collect()
    }

    fn discard(&mut self) {
        if !self.candidates.is_empty() {
            debug!(dropped = self.candidates.len(), "discarding buffered remote candidates");
        }
        self.local = None;
        self.remote = None;
        self.candidates.clear();
        self.applied.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(tag: &str) -> SessionDescription {
        SessionDescription::offer(format!("offer-{tag}"))
    }

    fn answer(tag: &str) -> SessionDescription {
        SessionDescription::answer(format!("answer-{tag}"))
    }

    fn sent(effects: &[Effect]) -> Vec<SignalPayload> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Run `Initiate` and feed back the engine's offer, returning the sent offer.
    fn initiate(n: &mut Negotiation, tag: &str) -> SignalPayload {
        assert_eq!(n.step(Input::Initiate).unwrap(), vec![Effect::CreateOffer]);
        assert_eq!(n.state(), SignalingState::HaveLocalOffer);
        let effects = n.step(Input::OfferCreated(offer(tag))).unwrap();
        sent(&effects).pop().unwrap()
    }

    #[test]
    fn offerer_path_reaches_stable() {
        let mut n = Negotiation::new(Role::Impolite);
        let sent_offer = initiate(&mut n, "a");
        assert_eq!(sent_offer, SignalPayload::Offer { description: offer("a") });

        let effects = n.step(Input::RemoteAnswer(answer("b"))).unwrap();
        assert_eq!(effects, vec![Effect::ApplyAnswer(answer("b"))]);
        assert_eq!(n.state(), SignalingState::Stable);
        assert_eq!(n.local_description(), Some(&offer("a")));
        assert_eq!(n.remote_description(), Some(&answer("b")));
    }

    #[test]
    fn answerer_path_reaches_stable() {
        let mut n = Negotiation::new(Role::Polite);
        let effects = n.step(Input::RemoteOffer(offer("a"))).unwrap();
        assert_eq!(effects, vec![Effect::AcceptOffer(offer("a"))]);
        assert_eq!(n.state(), SignalingState::HaveRemoteOffer);

        let effects = n.step(Input::AnswerCreated(answer("b"))).unwrap();
        assert_eq!(sent(&effects), vec![SignalPayload::Answer { description: answer("b") }]);
        assert_eq!(n.state(), SignalingState::Stable);
    }

    #[test]
    fn polite_side_rolls_back_on_glare() {
        let mut n = Negotiation::new(Role::Polite);
        initiate(&mut n, "mine");

        let effects = n.step(Input::RemoteOffer(offer("theirs"))).unwrap();
        assert_eq!(
            effects,
            vec![Effect::Rollback, Effect::AcceptOffer(offer("theirs"))]
        );
        assert_eq!(n.state(), SignalingState::HaveRemoteOffer);
        assert_eq!(n.local_description(), None);
    }

    #[test]
    fn impolite_side_ignores_offer_on_glare() {
        let mut n = Negotiation::new(Role::Impolite);
        initiate(&mut n, "mine");

        let effects = n.step(Input::RemoteOffer(offer("theirs"))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(n.state(), SignalingState::HaveLocalOffer);
        assert_eq!(n.local_description(), Some(&offer("mine")));
        assert_eq!(n.remote_description(), None);
    }

    /// Deliver everything `from` sent to `to`, feeding engine results back on `to`.
    fn deliver(to: &mut Negotiation, payloads: Vec<SignalPayload>, tag: &str) -> Vec<SignalPayload> {
        let mut out = Vec::new();
        for p in payloads {
            let effects = to.step(Input::from_signal(p)).unwrap();
            for e in effects {
                match e {
                    Effect::AcceptOffer(_) => {
                        let more = to.step(Input::AnswerCreated(answer(tag))).unwrap();
                        out.extend(sent(&more));
                    }
                    Effect::Send(p) => out.push(p),
                    _ => {}
                }
            }
        }
        out
    }

    #[test]
    fn simultaneous_initiate_converges_on_impolite_offer() {
        let mut x = Negotiation::new(Role::Impolite);
        let mut y = Negotiation::new(Role::Polite);

        let from_x = initiate(&mut x, "x");
        let from_y = initiate(&mut y, "y");

        // Both offers cross on the wire.
        let x_replies = deliver(&mut x, vec![from_y], "x");
        assert!(x_replies.is_empty());
        let y_replies = deliver(&mut y, vec![from_x], "y");
        assert_eq!(y_replies, vec![SignalPayload::Answer { description: answer("y") }]);

        let x_replies = deliver(&mut x, y_replies, "x");
        assert!(x_replies.is_empty());

        assert_eq!(x.state(), SignalingState::Stable);
        assert_eq!(y.state(), SignalingState::Stable);
        // One agreed description: X's offer, answered by Y.
        assert_eq!(x.local_description(), Some(&offer("x")));
        assert_eq!(y.remote_description(), Some(&offer("x")));
        assert_eq!(x.remote_description(), Some(&answer("y")));
        assert_eq!(y.local_description(), Some(&answer("y")));
    }

    #[test]
    fn early_candidates_are_flushed_in_order_after_remote_offer() {
        let mut n = Negotiation::new(Role::Polite);
        assert!(n.step(Input::RemoteCandidate(IceCandidate::new("c1"))).unwrap().is_empty());
        assert!(n.step(Input::RemoteCandidate(IceCandidate::new("c2"))).unwrap().is_empty());
        assert_eq!(n.pending_candidates(), 2);

        let effects = n.step(Input::RemoteOffer(offer("a"))).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::AcceptOffer(offer("a")),
                Effect::AddCandidate(IceCandidate::new("c1")),
                Effect::AddCandidate(IceCandidate::new("c2")),
            ]
        );
        assert_eq!(n.pending_candidates(), 0);

        // Later candidates go straight through.
        let effects = n.step(Input::RemoteCandidate(IceCandidate::new("c3"))).unwrap();
        assert_eq!(effects, vec![Effect::AddCandidate(IceCandidate::new("c3"))]);
    }

    #[test]
    fn early_candidates_are_flushed_after_remote_answer() {
        let mut n = Negotiation::new(Role::Impolite);
        initiate(&mut n, "a");
        n.step(Input::RemoteCandidate(IceCandidate::new("c1"))).unwrap();

        let effects = n.step(Input::RemoteAnswer(answer("b"))).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::ApplyAnswer(answer("b")),
                Effect::AddCandidate(IceCandidate::new("c1")),
            ]
        );
    }

    #[test]
    fn answer_without_offer_is_a_violation() {
        let mut n = Negotiation::new(Role::Impolite);
        let err = n.step(Input::RemoteAnswer(answer("b"))).unwrap_err();
        assert_eq!(err, NegotiationError::UnexpectedAnswer(SignalingState::Idle));
        assert!(err.requires_reset());
        assert_eq!(n.state(), SignalingState::Idle);
    }

    #[test]
    fn offer_while_answering_is_a_violation() {
        let mut n = Negotiation::new(Role::Polite);
        n.step(Input::RemoteOffer(offer("a"))).unwrap();
        let err = n.step(Input::RemoteOffer(offer("b"))).unwrap_err();
        assert_eq!(err, NegotiationError::UnexpectedOffer(SignalingState::HaveRemoteOffer));
    }

    #[test]
    fn initiate_only_from_idle_or_stable() {
        let mut n = Negotiation::new(Role::Polite);
        initiate(&mut n, "a");
        let err = n.step(Input::Initiate).unwrap_err();
        assert_eq!(err, NegotiationError::InvalidInitiate(SignalingState::HaveLocalOffer));
        assert!(!err.requires_reset());
    }

    #[test]
    fn offer_in_stable_renegotiates() {
        let mut n = Negotiation::new(Role::Impolite);
        initiate(&mut n, "a");
        n.step(Input::RemoteAnswer(answer("b"))).unwrap();

        let effects = n.step(Input::RemoteOffer(offer("c"))).unwrap();
        assert_eq!(effects, vec![Effect::AcceptOffer(offer("c"))]);
        assert_eq!(n.remote_description(), Some(&offer("c")));
    }

    #[test]
    fn reset_discards_state_and_reinitiates() {
        let mut n = Negotiation::new(Role::Impolite);
        initiate(&mut n, "a");
        n.step(Input::RemoteCandidate(IceCandidate::new("c1"))).unwrap();

        let effects = n.step(Input::Reset).unwrap();
        assert_eq!(effects, vec![Effect::ReopenTransport, Effect::CreateOffer]);
        assert_eq!(n.state(), SignalingState::HaveLocalOffer);
        assert_eq!(n.local_description(), None);
        assert_eq!(n.pending_candidates(), 0);

        let effects = n.step(Input::OfferCreated(offer("a2"))).unwrap();
        assert_eq!(sent(&effects), vec![SignalPayload::Offer { description: offer("a2") }]);
    }

    #[test]
    fn polite_reset_while_answering_reapplies_the_remote_offer() {
        let mut n = Negotiation::new(Role::Polite);
        n.step(Input::RemoteCandidate(IceCandidate::new("c1"))).unwrap();
        initiate(&mut n, "mine");
        n.step(Input::RemoteOffer(offer("theirs"))).unwrap();
        n.step(Input::RemoteCandidate(IceCandidate::new("c2"))).unwrap();

        // Applying "theirs" failed on the engine.
        let effects = n.step(Input::Reset).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::ReopenTransport,
                Effect::AcceptOffer(offer("theirs")),
                Effect::AddCandidate(IceCandidate::new("c1")),
                Effect::AddCandidate(IceCandidate::new("c2")),
            ]
        );
        assert_eq!(n.state(), SignalingState::HaveRemoteOffer);
        assert_eq!(n.remote_description(), Some(&offer("theirs")));

        // The same candidates come back if the second attempt fails too.
        let effects = n.step(Input::Reset).unwrap();
        assert_eq!(effects.len(), 4);

        let effects = n.step(Input::AnswerCreated(answer("mine"))).unwrap();
        assert_eq!(sent(&effects), vec![SignalPayload::Answer { description: answer("mine") }]);
        assert_eq!(n.state(), SignalingState::Stable);
    }

    #[test]
    fn impolite_reset_while_answering_offers_afresh() {
        let mut n = Negotiation::new(Role::Impolite);
        n.step(Input::RemoteOffer(offer("theirs"))).unwrap();

        let effects = n.step(Input::Reset).unwrap();
        assert_eq!(effects, vec![Effect::ReopenTransport, Effect::CreateOffer]);
        assert_eq!(n.state(), SignalingState::HaveLocalOffer);
        assert_eq!(n.remote_description(), None);
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let mut n = Negotiation::new(Role::Impolite);
        initiate(&mut n, "a");

        assert_eq!(n.step(Input::Close).unwrap(), vec![Effect::CloseTransport]);
        assert!(n.is_closed());
        assert!(n.step(Input::Close).unwrap().is_empty());

        // Anything arriving for a closed pair is moot.
        assert!(n.step(Input::RemoteAnswer(answer("b"))).unwrap().is_empty());
        assert!(n.step(Input::RemoteOffer(offer("c"))).unwrap().is_empty());
        assert!(n.step(Input::LocalCandidate(IceCandidate::new("c"))).unwrap().is_empty());
        assert!(n.step(Input::Initiate).unwrap().is_empty());
        assert_eq!(n.state(), SignalingState::Closed);
    }

    #[test]
    fn local_candidates_are_trickled() {
        let mut n = Negotiation::new(Role::Impolite);
        let effects = n.step(Input::LocalCandidate(IceCandidate::new("l1"))).unwrap();
        assert_eq!(
            sent(&effects),
            vec![SignalPayload::Candidate { candidate: IceCandidate::new("l1") }]
        );
    }

    #[test]
    fn stale_engine_results_are_dropped() {
        let mut n = Negotiation::new(Role::Impolite);
        assert!(n.step(Input::OfferCreated(offer("a"))).unwrap().is_empty());
        assert!(n.step(Input::AnswerCreated(answer("a"))).unwrap().is_empty());
        assert_eq!(n.state(), SignalingState::Idle);
    }
}
