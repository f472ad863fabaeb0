//! Endpoint side of the relay: one WebSocket to the directory server plus the
//! [`PeerManager`] that negotiates with every other member of the current session.
//!
//! Directory requests are answered strictly in order, so replies are matched to
//! requests through a FIFO of waiters. Membership events and signals are handled on
//! the reader task as they arrive; a join roster is applied there too, before any
//! frame that follows it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::NegotiationConfig;
use crate::directory::Joined;
use crate::error::ClientError;
use crate::peer::driver::{PeerEvent, PeerManager};
use crate::peer::transport::TransportEngine;
use crate::session::{EndpointId, Participant, SessionId};
use crate::signaling::{ClientMessage, ServerMessage};

type Waiters = Arc<Mutex<VecDeque<oneshot::Sender<ServerMessage>>>>;

#[derive(Default)]
struct Membership {
    session: Option<SessionId>,
    roster: HashMap<EndpointId, String>,
}

pub struct RelayClient {
    id: EndpointId,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    waiters: Waiters,
    request_gate: tokio::sync::Mutex<()>,
    membership: Arc<Mutex<Membership>>,
    peers: Arc<PeerManager>,
    shutdown: Arc<Notify>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to `url` (e.g. `ws://host:3000/ws`) and wait for the welcome frame.
    pub async fn connect(
        url: &str,
        engine: Arc<dyn TransportEngine>,
        config: NegotiationConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        let id = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
                    Ok(ServerMessage::Welcome { endpoint_id }) => break endpoint_id,
                    Ok(other) => {
                        return Err(ClientError::Protocol(format!(
                            "expected welcome, got {other:?}"
                        )))
                    }
                    Err(e) => return Err(ClientError::Protocol(e.to_string())),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ClientError::Connect(e)),
                None => return Err(ClientError::Closed),
            }
        };
        info!(endpoint_id = %id, url, "connected to directory");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (manager, events) = PeerManager::new(id.clone(), engine, outbound.clone(), config);
        let peers = Arc::new(manager);
        let waiters: Waiters = Arc::new(Mutex::new(VecDeque::new()));
        let membership = Arc::new(Mutex::new(Membership::default()));
        let shutdown = Arc::new(Notify::new());

        let writer_shutdown = Arc::clone(&shutdown);
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let json = match serde_json::to_string(&msg) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize client message");
                                continue;
                            }
                        };
                        if sink.send(Message::text(json)).await.is_err() {
                            break;
                        }
                    }
                    _ = writer_shutdown.notified() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        let router = Router {
            peers: Arc::clone(&peers),
            waiters: Arc::clone(&waiters),
            membership: Arc::clone(&membership),
        };
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                        Ok(message) => router.route(message).await,
                        Err(e) => warn!(error = %e, "malformed directory frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "directory socket read failed");
                        break;
                    }
                }
            }
            router.lost().await;
        });

        let client = Self {
            id,
            outbound,
            waiters,
            request_gate: tokio::sync::Mutex::new(()),
            membership,
            peers,
            shutdown,
            reader,
            writer,
        };
        Ok((client, events))
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn session(&self) -> Option<SessionId> {
        self.membership.lock().session.clone()
    }

    /// Other members of the current session, as last reported by the directory.
    pub fn roster(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self
            .membership
            .lock()
            .roster
            .iter()
            .map(|(id, name)| Participant {
                id: id.clone(),
                name: name.clone(),
            })
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    pub fn set_display_name(&self, name: &str) -> Result<(), ClientError> {
        self.outbound
            .send(ClientMessage::SetDisplayName { name: name.into() })
            .map_err(|_| ClientError::Closed)
    }

    pub async fn create_session(&self, display_name: Option<&str>) -> Result<SessionId, ClientError> {
        self.peers.close_all().await;
        let reply = self
            .request(ClientMessage::CreateSession {
                display_name: display_name.map(str::to_owned),
            })
            .await?;
        match reply {
            ServerMessage::CreateSessionResult { session_id } => Ok(session_id),
            other => Err(unexpected(other)),
        }
    }

    /// Join by code. Pairs with every listed participant are opened before this returns.
    pub async fn join_session(
        &self,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<Joined, ClientError> {
        let switching = self
            .session()
            .is_some_and(|current| current != SessionId::normalized(code));
        if switching {
            self.peers.close_all().await;
        }
        let reply = self
            .request(ClientMessage::JoinSession {
                session_id: code.into(),
                display_name: display_name.map(str::to_owned),
            })
            .await?;
        match reply {
            ServerMessage::JoinSessionResult {
                session_id,
                participants,
            } => Ok(Joined {
                session_id,
                participants,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Leave the current session and close every pair. No-op outside a session.
    pub async fn leave_session(&self) -> Result<(), ClientError> {
        let Some(code) = self.session() else {
            return Ok(());
        };
        let reply = self
            .request(ClientMessage::LeaveSession {
                session_id: code.as_str().into(),
            })
            .await?;
        match reply {
            ServerMessage::LeaveSessionResult { .. } => {
                self.peers.close_all().await;
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Close the socket. The directory treats this as an implicit leave.
    pub async fn disconnect(mut self) {
        self.shutdown.notify_one();
        let _ = (&mut self.writer).await;
        let _ = (&mut self.reader).await;
        self.peers.close_all().await;
    }

    async fn request(&self, message: ClientMessage) -> Result<ServerMessage, ClientError> {
        let _gate = self.request_gate.lock().await;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(tx);
        if self.outbound.send(message).is_err() {
            self.waiters.lock().pop_back();
            return Err(ClientError::Closed);
        }
        let reply = rx.await.map_err(|_| ClientError::Closed)?;
        match reply {
            ServerMessage::Error { kind, message } => Err(ClientError::Rejected { kind, message }),
            reply => Ok(reply),
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn unexpected(reply: ServerMessage) -> ClientError {
    ClientError::Protocol(format!("unexpected reply {reply:?}"))
}

/// Reader-side dispatch of directory frames.
struct Router {
    peers: Arc<PeerManager>,
    waiters: Waiters,
    membership: Arc<Mutex<Membership>>,
}

impl Router {
    async fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::ParticipantJoined {
                endpoint_id,
                display_name,
            } => {
                info!(peer = %endpoint_id, name = %display_name, "participant joined");
                self.membership
                    .lock()
                    .roster
                    .insert(endpoint_id.clone(), display_name);
                self.peers.peer_known(&endpoint_id);
            }
            ServerMessage::ParticipantLeft { endpoint_id } => {
                info!(peer = %endpoint_id, "participant left");
                self.membership.lock().roster.remove(&endpoint_id);
                self.peers.peer_left(&endpoint_id).await;
            }
            ServerMessage::Signal { from, payload } => self.peers.on_signal(&from, payload),
            ServerMessage::Welcome { .. } => {}
            reply => {
                self.apply_reply(&reply);
                let waiter = self.waiters.lock().pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(?reply, "unsolicited directory reply"),
                }
            }
        }
    }

    /// Membership bookkeeping for replies, done before the next frame is read.
    fn apply_reply(&self, reply: &ServerMessage) {
        match reply {
            ServerMessage::CreateSessionResult { session_id } => {
                let mut m = self.membership.lock();
                m.session = Some(session_id.clone());
                m.roster.clear();
            }
            ServerMessage::JoinSessionResult {
                session_id,
                participants,
            } => {
                let fresh: Vec<EndpointId> = {
                    let mut m = self.membership.lock();
                    let rejoin = m.session.as_ref() == Some(session_id);
                    let fresh = participants
                        .iter()
                        .filter(|p| !rejoin || !m.roster.contains_key(&p.id))
                        .map(|p| p.id.clone())
                        .collect();
                    m.session = Some(session_id.clone());
                    m.roster = participants
                        .iter()
                        .map(|p| (p.id.clone(), p.name.clone()))
                        .collect();
                    fresh
                };
                for peer in &fresh {
                    self.peers.peer_known(peer);
                }
            }
            ServerMessage::LeaveSessionResult { .. } => {
                let mut m = self.membership.lock();
                m.session = None;
                m.roster.clear();
            }
            _ => {}
        }
    }

    async fn lost(&self) {
        info!("directory connection closed");
        self.waiters.lock().clear();
        {
            let mut m = self.membership.lock();
            m.session = None;
            m.roster.clear();
        }
        self.peers.close_all().await;
    }
}
