//! Scripted in-memory transport engine shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roomlink::error::TransportError;
use roomlink::peer::{IceCandidate, PeerTransport, SessionDescription, TransportEngine, TransportEvent};
use roomlink::session::EndpointId;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct Script {
    pub failing_accepts: AtomicUsize,
    pub fail_offers: AtomicBool,
}

pub struct FakeTransport {
    label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    script: Arc<Script>,
    pub closed: AtomicBool,
    pub offers: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub accepted: Mutex<Vec<SessionDescription>>,
    pub answers: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
}

impl FakeTransport {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn gather(&self, n: usize) {
        let candidate = IceCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host ufrag {}",
            self.label
        ));
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        if self.script.fail_offers.load(Ordering::SeqCst) {
            return Err(TransportError::Engine("offer refused".into()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        self.gather(n);
        Ok(SessionDescription::offer(format!("offer/{}/{n}", self.label)))
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.check_open()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let remaining = self.script.failing_accepts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.script
                .failing_accepts
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Engine("bad remote description".into()));
        }
        self.accepted.lock().unwrap().push(offer);
        self.gather(9);
        Ok(SessionDescription::answer(format!("answer/{}", self.label)))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        self.answers.lock().unwrap().push(answer);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check_open()?;
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeEngine {
    label: String,
    pub script: Arc<Script>,
    opened: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeEngine {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            script: Arc::new(Script::default()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn current(&self) -> Arc<FakeTransport> {
        self.transports().pop().expect("no transport opened")
    }
}

#[async_trait]
impl TransportEngine for FakeEngine {
    async fn open(
        &self,
        _peer: &EndpointId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(FakeTransport {
            label: self.label.clone(),
            events,
            script: Arc::clone(&self.script),
            closed: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
        });
        self.opened.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

