//! Domain library for the redirect token service.
//!
//! Holds the domain types, ports (traits), error definitions and the
//! consumption engine that decides whether a token may be redeemed. Storage
//! and HTTP concerns live in the adapter and app crates.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest token accepted from a request path.
pub const MAX_TOKEN_LEN: usize = 128;

const TOKEN_HINT_LEN: usize = 4;

/// An opaque, URL-safe redemption key for a [`Link`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(String);

impl Token {
    pub fn new<S: Into<String>>(s: S) -> Result<Self, CoreError> {
        let val = s.into();
        if val.is_empty() {
            return Err(CoreError::InvalidToken("empty".into()));
        }
        if val.len() > MAX_TOKEN_LEN {
            return Err(CoreError::InvalidToken("too long".into()));
        }
        // URL-safe base64 alphabet
        if !val
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidToken("invalid characters".into()));
        }
        Ok(Self(val))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters only, for log lines. A full token is a credential.
    pub fn hint(&self) -> &str {
        // ASCII-only, so any byte index is a char boundary
        &self.0[..self.0.len().min(TOKEN_HINT_LEN)]
    }
}

/// How many successful redemptions a link permits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    Reusable,
    #[serde(alias = "single-use")]
    SingleUse,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Reusable => "reusable",
            LinkMode::SingleUse => "single_use",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reusable" => Some(LinkMode::Reusable),
            "single_use" | "single-use" | "singleuse" => Some(LinkMode::SingleUse),
            _ => None,
        }
    }
}

/// Lifecycle state of a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Consumed,
    /// Transition target only: stores remove the row instead of keeping it.
    Deleted,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Consumed => "consumed",
            LinkStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(LinkStatus::Active),
            "consumed" => Some(LinkStatus::Consumed),
            "deleted" => Some(LinkStatus::Deleted),
            _ => None,
        }
    }
}

/// Input data for creating a new link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLink {
    /// Redirect destination; `None` falls back to the service default.
    pub target_url: Option<String>,
    pub mode: LinkMode,
}

/// Stored token → target mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub token: Token,
    pub target_url: String,
    pub mode: LinkMode,
    pub status: LinkStatus,
    pub created_at: SystemTime,
    /// Time of the last successful status transition.
    pub status_changed_at: Option<SystemTime>,
}

impl Link {
    /// Create an `Active` link.
    pub fn new(token: Token, target_url: String, mode: LinkMode, created_at: SystemTime) -> Self {
        Self {
            token,
            target_url,
            mode,
            status: LinkStatus::Active,
            created_at,
            status_changed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LinkStatus::Active
    }
}

/// Store-assigned identifier of a visit row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VisitId(pub u64);

/// What the engine decided for the attempt a visit records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitOutcome {
    Admitted,
    AlreadyConsumed,
    Conflict,
}

impl VisitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitOutcome::Admitted => "admitted",
            VisitOutcome::AlreadyConsumed => "already_consumed",
            VisitOutcome::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admitted" => Some(VisitOutcome::Admitted),
            "already_consumed" => Some(VisitOutcome::AlreadyConsumed),
            "conflict" => Some(VisitOutcome::Conflict),
            _ => None,
        }
    }
}

/// A visit waiting to be appended to the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewVisit {
    pub link_token: Token,
    pub ip: String,
    pub user_agent: String,
    pub timestamp: SystemTime,
    pub outcome: VisitOutcome,
}

/// A logged access attempt. Holds the token only as a back-reference; the
/// link may have been removed since.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Visit {
    pub id: VisitId,
    pub link_token: Token,
    pub ip: String,
    pub user_agent: String,
    pub timestamp: SystemTime,
    pub outcome: VisitOutcome,
}

impl Visit {
    pub fn from_new(id: VisitId, v: NewVisit) -> Self {
        Self {
            id,
            link_token: v.link_token,
            ip: v.ip,
            user_agent: v.user_agent,
            timestamp: v.timestamp,
            outcome: v.outcome,
        }
    }
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Token generator interface.
pub trait TokenGenerator: Send + Sync {
    fn next_token(&self) -> Token;
}

/// Registry port: durable token → link mapping.
pub trait LinkRegistry: Send + Sync {
    /// Insert a fresh link. Fails with `TokenCollision` if the token exists.
    fn insert(&self, link: Link) -> Result<(), CoreError>;
    fn get(&self, token: &Token) -> Result<Option<Link>, CoreError>;
    /// All links, newest first.
    fn list_all(&self) -> Result<Vec<Link>, CoreError>;
    /// Atomically move `token` from `expected` to `new`.
    ///
    /// Returns `Conflict` without mutating when the current status differs and
    /// `NotFound` when no row exists. A transition to `Deleted` removes the row.
    fn transition(
        &self,
        token: &Token,
        expected: LinkStatus,
        new: LinkStatus,
        at: SystemTime,
    ) -> Result<(), CoreError>;
}

/// Visit log port: append-only access records.
pub trait VisitLog: Send + Sync {
    fn append(&self, visit: NewVisit) -> Result<VisitId, CoreError>;
    /// Visits for one token, newest first.
    fn list_for(&self, token: &Token) -> Result<Vec<Visit>, CoreError>;
    /// Most recent visits across all tokens, newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<Visit>, CoreError>;
}

/// Persisted admin credential: a single password hash.
pub trait AdminSecretStore: Send + Sync {
    fn load_admin_secret(&self) -> Result<Option<String>, CoreError>;
    /// Store `hash` only when no secret exists yet. Returns whether it was stored.
    fn seed_admin_secret(&self, hash: &str) -> Result<bool, CoreError>;
    /// Replace the stored secret.
    fn save_admin_secret(&self, hash: &str) -> Result<(), CoreError>;
}

impl<T: LinkRegistry + ?Sized> LinkRegistry for std::sync::Arc<T> {
    fn insert(&self, link: Link) -> Result<(), CoreError> {
        (**self).insert(link)
    }

    fn get(&self, token: &Token) -> Result<Option<Link>, CoreError> {
        (**self).get(token)
    }

    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        (**self).list_all()
    }

    fn transition(
        &self,
        token: &Token,
        expected: LinkStatus,
        new: LinkStatus,
        at: SystemTime,
    ) -> Result<(), CoreError> {
        (**self).transition(token, expected, new, at)
    }
}

impl<T: VisitLog + ?Sized> VisitLog for std::sync::Arc<T> {
    fn append(&self, visit: NewVisit) -> Result<VisitId, CoreError> {
        (**self).append(visit)
    }

    fn list_for(&self, token: &Token) -> Result<Vec<Visit>, CoreError> {
        (**self).list_for(token)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Visit>, CoreError> {
        (**self).list_recent(limit)
    }
}

impl<T: AdminSecretStore + ?Sized> AdminSecretStore for std::sync::Arc<T> {
    fn load_admin_secret(&self) -> Result<Option<String>, CoreError> {
        (**self).load_admin_secret()
    }

    fn seed_admin_secret(&self, hash: &str) -> Result<bool, CoreError> {
        (**self).seed_admin_secret(hash)
    }

    fn save_admin_secret(&self, hash: &str) -> Result<(), CoreError> {
        (**self).save_admin_secret(hash)
    }
}

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("not found")]
    NotFound,
    #[error("link already consumed")]
    AlreadyConsumed,
    #[error("status changed concurrently")]
    Conflict,
    #[error("token collision")]
    TokenCollision,
    #[error("repository error: {0}")]
    Repository(String),
}

pub mod adapters;
pub mod engine;
pub mod service;
pub mod token;
pub mod validate;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_new_accepts_url_safe_values() {
        let t = Token::new("aB3-_x").expect("valid token");
        assert_eq!(t.as_str(), "aB3-_x");
    }

    #[test]
    fn token_hint_truncates() {
        assert_eq!(Token::new("abcdefgh").unwrap().hint(), "abcd");
        assert_eq!(Token::new("ab").unwrap().hint(), "ab");
    }

    #[test]
    fn token_rejects_empty_and_bad_chars() {
        assert!(matches!(Token::new(""), Err(CoreError::InvalidToken(_))));
        assert!(matches!(Token::new("a/b"), Err(CoreError::InvalidToken(_))));
        assert!(matches!(Token::new("a+b="), Err(CoreError::InvalidToken(_))));
        assert!(matches!(
            Token::new("a".repeat(MAX_TOKEN_LEN + 1)),
            Err(CoreError::InvalidToken(_))
        ));
    }

    #[test]
    fn mode_and_status_parse() {
        assert_eq!(LinkMode::parse("single-use"), Some(LinkMode::SingleUse));
        assert_eq!(LinkMode::parse("REUSABLE"), Some(LinkMode::Reusable));
        assert_eq!(LinkMode::parse("twice"), None);
        for s in [LinkStatus::Active, LinkStatus::Consumed, LinkStatus::Deleted] {
            assert_eq!(LinkStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(
            VisitOutcome::parse("already_consumed"),
            Some(VisitOutcome::AlreadyConsumed)
        );
    }

    #[test]
    fn new_link_starts_active() {
        let link = Link::new(
            Token::new("abc").unwrap(),
            "https://a.example".into(),
            LinkMode::SingleUse,
            SystemTime::UNIX_EPOCH,
        );
        assert!(link.is_active());
        assert!(link.status_changed_at.is_none());
    }
}
