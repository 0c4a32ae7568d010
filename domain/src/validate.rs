//! Lightweight input validation helpers. Keep logic minimal and deterministic.

use crate::CoreError;
use crate::Token;

/// Longest accepted target URL.
pub const MAX_URL_LEN: usize = 2048;

/// Validate a redirect target. Ensures an http/https scheme, a non-empty host
/// part, no whitespace or control characters, and a reasonable length.
pub fn validate_target_url(s: &str) -> Result<(), CoreError> {
    if s.is_empty() {
        return Err(CoreError::InvalidUrl("empty".into()));
    }
    if s.len() > MAX_URL_LEN {
        return Err(CoreError::InvalidUrl("too long".into()));
    }
    let rest = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .ok_or_else(|| CoreError::InvalidUrl("must start with http:// or https://".into()))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(CoreError::InvalidUrl("missing host".into()));
    }
    // Must be usable verbatim as a Location header value
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::InvalidUrl("contains whitespace".into()));
    }
    if !s.is_ascii() {
        return Err(CoreError::InvalidUrl("non-ascii characters must be percent-encoded".into()));
    }
    Ok(())
}

/// Parse a token taken from a request path.
pub fn parse_token(s: &str) -> Result<Token, CoreError> {
    Token::new(s.to_string())
}
