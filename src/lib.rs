pub mod client;
pub mod code;
pub mod config;
pub mod directory;
pub mod error;
pub mod logger;
pub mod peer;
pub mod relay;
pub mod server;
pub mod session;
pub mod signaling;
pub mod utils;

pub use client::RelayClient;
pub use directory::{Directory, Joined};
pub use error::{ClientError, DirectoryError, NegotiationError, TransportError};
pub use server::{start, ServerHandle};
pub use session::{EndpointId, Participant, SessionId};
