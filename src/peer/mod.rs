pub mod connection;
pub mod driver;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::WebRtcEngine;
pub use driver::{PeerEvent, PeerManager};
pub use negotiation::{Effect, Input, Negotiation};
pub use state::{Role, SignalingState};
pub use transport::{PeerTransport, TransportEngine, TransportEvent};
pub use types::{Connectivity, IceCandidate, SdpKind, ServerConfig, SessionDescription};
