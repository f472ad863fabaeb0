use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::peer::ice::CandidateKind;
use crate::peer::types::IceCandidate;
use crate::session::EndpointId;

// Debug builds log negotiation detail, release builds stay at info
#[cfg(debug_assertions)]
pub const DEFAULT_FILTER: &str = "roomlink=debug,info";

#[cfg(not(debug_assertions))]
pub const DEFAULT_FILTER: &str = "roomlink=info,warn";

/// Install the global fmt subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Trickle-ICE trace of a candidate
pub fn dump_candidate(peer: &EndpointId, label: &str, cand: &IceCandidate) {
    debug!(
        peer = %peer,
        label,
        kind = ?CandidateKind::of(cand),
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}
