use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::NegotiationConfig;
use crate::error::TransportError;
use crate::logger::dump_candidate;
use crate::peer::transport::{PeerTransport, TransportEngine, TransportEvent};
use crate::peer::types::{Connectivity, IceCandidate, SdpKind, ServerConfig, SessionDescription};
use crate::session::EndpointId;
use crate::utils::add_ice_url_scheme;

/// Transport engine backed by the `webrtc` crate.
pub struct WebRtcEngine {
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn open(
        &self,
        peer: &EndpointId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = rtc_config(&self.ice_servers);
        let pc = new_peer(peer.clone(), config.clone(), events.clone()).await?;
        Ok(Arc::new(WebRtcTransport {
            peer: peer.clone(),
            config,
            events,
            pc: Mutex::new(pc),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Create a peer connection wired to report candidates and connectivity on `events`
async fn new_peer(
    peer: EndpointId,
    config: RTCConfiguration,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(config).await?);

    let candidate_events = events.clone();
    let candidate_peer = peer.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand.map(|c| c.to_json()) {
            Some(Ok(init)) => {
                let candidate = IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                };
                dump_candidate(&candidate_peer, "local", &candidate);
                let _ = candidate_events.send(TransportEvent::LocalCandidate(candidate));
            }
            Some(Err(e)) => warn!(peer = %candidate_peer, error = %e, "failed to serialize local candidate"),
            // end of gathering
            None => debug!(peer = %candidate_peer, "ICE candidate gathering completed"),
        }
        Box::pin(async {})
    }));

    let state_peer = peer.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(peer = %state_peer, state = ?st, "peer connection state changed");
        if let Some(connectivity) = map_state(st) {
            let _ = events.send(TransportEvent::Connectivity(connectivity));
        }
        Box::pin(async {})
    }));

    let dc_peer = peer.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        debug!(peer = %dc_peer, label = dc.label(), "remote data channel opened");
        Box::pin(async {})
    }));

    // An application section keeps every offer non-empty so ICE gathering starts.
    pc.create_data_channel("roomlink", None).await?;
    Ok(pc)
}

fn map_state(st: RTCPeerConnectionState) -> Option<Connectivity> {
    match st {
        RTCPeerConnectionState::New => Some(Connectivity::New),
        RTCPeerConnectionState::Connecting => Some(Connectivity::Connecting),
        RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
        RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
        RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
        RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
        _ => None,
    }
}

/// Peer connection configuration for the given ICE servers
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(parsed)
}

struct WebRtcTransport {
    peer: EndpointId,
    config: RTCConfiguration,
    events: mpsc::UnboundedSender<TransportEvent>,
    // Swapped out on rollback.
    pc: Mutex<Arc<RTCPeerConnection>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn pc(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.lock())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn local_description(pc: &RTCPeerConnection) -> Result<String, TransportError> {
        pc.local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| TransportError::Engine("local description missing".into()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let pc = self.pc();
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(Self::local_description(&pc).await?))
    }

    /// `webrtc` refuses a local rollback description, so the unanswered offer goes away
    /// together with its connection and a fresh one takes its place.
    async fn rollback(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let fresh = new_peer(self.peer.clone(), self.config.clone(), self.events.clone()).await?;
        let stale = std::mem::replace(&mut *self.pc.lock(), fresh);
        // Its candidates and final state belong to no offer anymore.
        stale.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        stale.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        if let Err(e) = stale.close().await {
            warn!(peer = %self.peer, error = %e, "failed to close rolled back connection");
        }
        debug!(peer = %self.peer, "local offer rolled back");
        Ok(())
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let pc = self.pc();
        pc.set_remote_description(to_rtc(offer)?).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(Self::local_description(&pc).await?))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc().set_remote_description(to_rtc(answer)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc().add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc().close().await {
            warn!(error = %e, "failed to close peer connection");
        }
    }
}
