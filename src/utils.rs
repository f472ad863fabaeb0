use crate::peer::types::ServerConfig;
use rand::Rng;

/// 16 random bytes, hex encoded. Used for endpoint ids, so it must stay unguessable.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 16]>())
}

// Prefix an ICE server url with its scheme when the user left it out
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Trim a user-supplied display name, falling back to "Anonymous".
pub fn display_name_or_default(name: Option<&str>) -> String {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => "Anonymous".to_string(),
    }
}
