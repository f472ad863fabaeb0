// Runtime settings for the directory server and for the negotiation side of an endpoint.
// Every struct has a Default matching what the server binary uses without flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::peer::types::ServerConfig as IceServerConfig;

/// Public STUN servers used when nothing else is configured.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    (0..5)
        .map(|i| {
            let host = if i == 0 {
                "stun.l.google.com".to_string()
            } else {
                format!("stun{i}.l.google.com")
            };
            IceServerConfig {
                id: format!("default-stun-{i}"),
                r#type: "stun".into(),
                url: format!("stun:{host}:19302"),
                username: None,
                credential: None,
            }
        })
        .collect()
});

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Code generation attempts before giving up with `ResourceExhausted`.
    pub max_code_attempts: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_code_attempts: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// 0 picks a free port.
    pub port: u16,
    /// Outbound frames buffered per connection before messages are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub directory: DirectoryConfig,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            directory: DirectoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Pause between creating a description and sending it, so early candidates
    /// can be gathered first. Not needed for correctness.
    pub settle_delay: Duration,
    /// How long a sent offer may go unanswered before the pair resets. Zero waits forever.
    pub answer_timeout: Duration,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            answer_timeout: Duration::from_secs(15),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 3000);
        assert_eq!(server.addr().to_string(), "0.0.0.0:3000");
        assert_eq!(server.directory.max_code_attempts, 64);

        let negotiation = NegotiationConfig::default();
        assert_eq!(negotiation.settle_delay, Duration::from_millis(500));
        assert_eq!(negotiation.answer_timeout, Duration::from_secs(15));
        assert_eq!(negotiation.ice_servers.len(), 5);
        assert_eq!(negotiation.ice_servers[0].url, "stun:stun.l.google.com:19302");
        assert_eq!(negotiation.ice_servers[4].url, "stun:stun4.l.google.com:19302");
    }
}
