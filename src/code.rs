//! Short, typable session codes.

use rand::Rng;

use crate::session::SessionId;

pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const CODE_LEN: usize = 6;

/// Source of candidate session codes. The directory retries on collision.
pub trait CodeSource: Send + Sync {
    fn next_code(&self) -> SessionId;
}

/// Uniformly random codes over [`CODE_ALPHABET`]. Not cryptographic, just hard to guess.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodes;

impl CodeSource for RandomCodes {
    fn next_code(&self) -> SessionId {
        let mut rng = rand::rng();
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        SessionId::from(code)
    }
}

pub fn is_valid_code(code: &SessionId) -> bool {
    code.as_str().len() == CODE_LEN && code.as_str().bytes().all(|b| CODE_ALPHABET.contains(&b))
}
