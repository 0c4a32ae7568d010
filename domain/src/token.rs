//! Random token generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{Token, TokenGenerator};

/// Smallest accepted byte count (48 bits of entropy).
pub const MIN_TOKEN_BYTES: usize = 6;
/// Largest accepted byte count; keeps encoded tokens under `MAX_TOKEN_LEN`.
pub const MAX_TOKEN_BYTES: usize = 64;
pub const DEFAULT_TOKEN_BYTES: usize = 16;

/// Draws `bytes` bytes from the OS CSPRNG and encodes them as unpadded
/// URL-safe base64.
#[derive(Clone, Copy, Debug)]
pub struct RandomTokenGenerator {
    bytes: usize,
}

impl RandomTokenGenerator {
    /// `bytes` is clamped to `MIN_TOKEN_BYTES..=MAX_TOKEN_BYTES`.
    pub fn new(bytes: usize) -> Self {
        Self {
            bytes: bytes.clamp(MIN_TOKEN_BYTES, MAX_TOKEN_BYTES),
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Encode fresh random bytes without wrapping them in a `Token`.
    pub fn random_string(&self) -> String {
        let mut buf = vec![0u8; self.bytes];
        OsRng.fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(&buf)
    }
}

impl Default for RandomTokenGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_BYTES)
    }
}

impl TokenGenerator for RandomTokenGenerator {
    fn next_token(&self) -> Token {
        let s = self.random_string();
        // The URL-safe alphabet and the length clamp make this valid by construction
        Token::new(s).unwrap_or_else(|_| Token(String::from("0")))
    }
}
