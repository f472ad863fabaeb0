//! Async execution of [`Negotiation`] effects.
//!
//! Every remote endpoint gets its own [`PairDriver`] task. The task owns the pure state
//! machine and the transport handle and handles one input at a time, so offer creation,
//! description application and candidate application for a pair never overlap. Pairs
//! run independently of each other. A departure aborts the pair's task and closes its
//! transport before anything still queued for that peer can be applied.
//!
//! An offer that stays unanswered for `answer_timeout` resets the pair, so a peer that
//! lost or ignored it cannot leave this side waiting in `HaveLocalOffer` for good.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NegotiationConfig;
use crate::error::TransportError;
use crate::peer::negotiation::{Effect, Input, Negotiation};
use crate::peer::state::{Role, SignalingState};
use crate::peer::transport::{PeerTransport, TransportEngine, TransportEvent};
use crate::peer::types::Connectivity;
use crate::session::EndpointId;
use crate::signaling::{ClientMessage, SignalPayload};

/// Consecutive resets tolerated before a pair gives up and closes.
const MAX_RESETS: u32 = 3;

/// What the application hears about its pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Signaling {
        peer: EndpointId,
        state: SignalingState,
    },
    Connectivity {
        peer: EndpointId,
        connectivity: Connectivity,
    },
    Closed {
        peer: EndpointId,
    },
}

type TransportSlot = Arc<Mutex<Option<Arc<dyn PeerTransport>>>>;

struct PairHandle {
    inbox: mpsc::UnboundedSender<Input>,
    state: Arc<watch::Sender<SignalingState>>,
    transport: TransportSlot,
    task: JoinHandle<()>,
}

impl PairHandle {
    fn is_live(&self) -> bool {
        !self.inbox.is_closed() && *self.state.borrow() != SignalingState::Closed
    }
}

/// All negotiation pairs of one local endpoint.
pub struct PeerManager {
    local: EndpointId,
    engine: Arc<dyn TransportEngine>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<PeerEvent>,
    config: NegotiationConfig,
    pairs: Mutex<HashMap<EndpointId, PairHandle>>,
}

impl PeerManager {
    /// `outbound` carries signals towards the relay; peer events come back on the receiver.
    pub fn new(
        local: EndpointId,
        engine: Arc<dyn TransportEngine>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        config: NegotiationConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local,
            engine,
            outbound,
            events,
            config,
            pairs: Mutex::new(HashMap::new()),
        };
        (manager, events_rx)
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local
    }

    /// A peer appeared (join roster or participant-joined): open a pair and offer.
    pub fn peer_known(&self, peer: &EndpointId) {
        self.send_input(peer, Input::Initiate);
    }

    /// Route an incoming signal. Offers from unknown peers open a pair; anything else
    /// for an unknown peer is dropped.
    pub fn on_signal(&self, from: &EndpointId, payload: SignalPayload) {
        let live = self.pairs.lock().get(from).is_some_and(PairHandle::is_live);
        if !live && !matches!(payload, SignalPayload::Offer { .. }) {
            debug!(peer = %from, kind = payload.kind(), "dropping signal for unknown peer");
            return;
        }
        self.send_input(from, Input::from_signal(payload));
    }

    /// Tear down the pair for a departed peer. Returns false if there was none.
    pub async fn peer_left(&self, peer: &EndpointId) -> bool {
        let Some(handle) = self.pairs.lock().remove(peer) else {
            return false;
        };
        handle.task.abort();
        let _ = handle.task.await;

        let transport = handle.transport.lock().take();
        if let Some(t) = transport {
            t.close().await;
        }
        handle.state.send_replace(SignalingState::Closed);
        info!(local = %self.local, peer = %peer, "pair closed");
        let _ = self.events.send(PeerEvent::Signaling {
            peer: peer.clone(),
            state: SignalingState::Closed,
        });
        let _ = self.events.send(PeerEvent::Closed { peer: peer.clone() });
        true
    }

    /// Close every pair, e.g. when the local endpoint leaves its session.
    pub async fn close_all(&self) {
        for peer in self.peers() {
            self.peer_left(&peer).await;
        }
    }

    pub fn peers(&self) -> Vec<EndpointId> {
        self.pairs.lock().keys().cloned().collect()
    }

    pub fn state_of(&self, peer: &EndpointId) -> Option<SignalingState> {
        self.pairs.lock().get(peer).map(|h| *h.state.borrow())
    }

    /// Subscribe to signaling state changes of one pair.
    pub fn watch_state(&self, peer: &EndpointId) -> Option<watch::Receiver<SignalingState>> {
        self.pairs.lock().get(peer).map(|h| h.state.subscribe())
    }

    /// A pair whose task gave up is replaced by a fresh one.
    fn send_input(&self, peer: &EndpointId, input: Input) {
        let mut pairs = self.pairs.lock();
        if pairs.get(peer).is_some_and(|h| !h.is_live()) {
            debug!(peer = %peer, "replacing finished pair");
            pairs.remove(peer);
        }
        let handle = pairs
            .entry(peer.clone())
            .or_insert_with(|| self.spawn_pair(peer.clone()));
        if handle.inbox.send(input).is_err() {
            debug!(peer = %peer, "pair task already finished, input dropped");
        }
    }

    fn spawn_pair(&self, peer: EndpointId) -> PairHandle {
        let role = Role::for_pair(&self.local, &peer);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SignalingState::Idle);
        let state = Arc::new(state_tx);
        let transport: TransportSlot = Arc::new(Mutex::new(None));
        // Replaced by the first successful open.
        let (_, transport_rx) = mpsc::unbounded_channel();

        debug!(local = %self.local, peer = %peer, ?role, "opening pair");
        let driver = PairDriver {
            peer,
            negotiation: Negotiation::new(role),
            engine: Arc::clone(&self.engine),
            slot: Arc::clone(&transport),
            transport_rx,
            outbound: self.outbound.clone(),
            events: self.events.clone(),
            state: Arc::clone(&state),
            settle_delay: self.config.settle_delay,
            answer_timeout: self.config.answer_timeout,
            offer_sent_at: None,
            resets: 0,
        };
        let task = tokio::spawn(driver.run(inbox_rx));

        PairHandle {
            inbox: inbox_tx,
            state,
            transport,
            task,
        }
    }
}

/// Sequential executor for one pair.
struct PairDriver {
    peer: EndpointId,
    negotiation: Negotiation,
    engine: Arc<dyn TransportEngine>,
    slot: TransportSlot,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Arc<watch::Sender<SignalingState>>,
    settle_delay: Duration,
    answer_timeout: Duration,
    offer_sent_at: Option<Instant>,
    resets: u32,
}

impl PairDriver {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>) {
        if let Err(e) = self.open_transport().await {
            warn!(peer = %self.peer, error = %e, "failed to open transport");
        }

        loop {
            let deadline = self.answer_deadline();
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break,
                },
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(peer = %self.peer, timeout = ?self.answer_timeout, "offer went unanswered, resetting pair");
                    self.offer_sent_at = None;
                    let next = self.recovery();
                    self.handle(next).await;
                }
            }
            if self.negotiation.is_closed() {
                break;
            }
        }
        debug!(peer = %self.peer, "pair driver stopped");
    }

    fn answer_deadline(&self) -> Option<Instant> {
        if self.answer_timeout.is_zero() || self.negotiation.state() != SignalingState::HaveLocalOffer {
            return None;
        }
        self.offer_sent_at.map(|sent| sent + self.answer_timeout)
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.handle(Input::LocalCandidate(candidate)).await
            }
            TransportEvent::Connectivity(connectivity) => {
                info!(peer = %self.peer, ?connectivity, "connectivity changed");
                let _ = self.events.send(PeerEvent::Connectivity {
                    peer: self.peer.clone(),
                    connectivity,
                });
            }
        }
    }

    async fn handle(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let effects = match self.negotiation.step(input) {
                Ok(effects) => effects,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "protocol violation");
                    if e.requires_reset() {
                        queue.push_back(self.recovery());
                    }
                    continue;
                }
            };

            for effect in effects {
                match self.execute(effect).await {
                    Ok(Some(next)) => queue.push_back(next),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "transport failure, resetting pair");
                        queue.clear();
                        queue.push_back(self.recovery());
                        break;
                    }
                }
            }
            self.publish_state();
        }
    }

    /// Reset, or close once resets keep failing.
    fn recovery(&mut self) -> Input {
        if self.resets >= MAX_RESETS {
            warn!(peer = %self.peer, resets = self.resets, "giving up on pair");
            Input::Close
        } else {
            self.resets += 1;
            Input::Reset
        }
    }

    fn publish_state(&mut self) {
        let state = self.negotiation.state();
        if state == SignalingState::Stable {
            self.resets = 0;
        }
        if state != SignalingState::HaveLocalOffer {
            self.offer_sent_at = None;
        }
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            debug!(peer = %self.peer, ?state, "signaling state changed");
            let _ = self.events.send(PeerEvent::Signaling {
                peer: self.peer.clone(),
                state,
            });
            if state == SignalingState::Closed {
                let _ = self.events.send(PeerEvent::Closed {
                    peer: self.peer.clone(),
                });
            }
        }
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        self.slot.lock().clone().ok_or(TransportError::Closed)
    }

    async fn execute(&mut self, effect: Effect) -> Result<Option<Input>, TransportError> {
        match effect {
            Effect::CreateOffer => {
                let offer = self.transport()?.create_offer().await?;
                Ok(Some(Input::OfferCreated(offer)))
            }
            Effect::Rollback => {
                self.transport()?.rollback().await?;
                Ok(None)
            }
            Effect::AcceptOffer(offer) => {
                let answer = self.transport()?.accept_offer(offer).await?;
                Ok(Some(Input::AnswerCreated(answer)))
            }
            Effect::ApplyAnswer(answer) => {
                self.transport()?.apply_answer(answer).await?;
                Ok(None)
            }
            Effect::AddCandidate(candidate) => {
                // A bad candidate costs one path, not the pair.
                if let Err(e) = self.transport()?.add_candidate(candidate).await {
                    warn!(peer = %self.peer, error = %e, "failed to add remote candidate");
                }
                Ok(None)
            }
            Effect::Send(payload) => {
                self.send(payload).await;
                Ok(None)
            }
            Effect::ReopenTransport => {
                self.offer_sent_at = None;
                self.close_transport().await;
                self.open_transport().await?;
                Ok(None)
            }
            Effect::CloseTransport => {
                self.close_transport().await;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, payload: SignalPayload) {
        if !matches!(payload, SignalPayload::Candidate { .. }) && !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        if matches!(payload, SignalPayload::Offer { .. }) {
            self.offer_sent_at = Some(Instant::now());
        }
        debug!(peer = %self.peer, kind = payload.kind(), "sending signal");
        let message = ClientMessage::Signal {
            target: self.peer.clone(),
            payload,
        };
        if self.outbound.send(message).is_err() {
            debug!(peer = %self.peer, "relay gone, signal dropped");
        }
    }

    async fn open_transport(&mut self) -> Result<(), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.engine.open(&self.peer, tx).await?;
        *self.slot.lock() = Some(transport);
        self.transport_rx = rx;
        Ok(())
    }

    async fn close_transport(&mut self) {
        let transport = self.slot.lock().take();
        if let Some(t) = transport {
            t.close().await;
        }
    }
}
