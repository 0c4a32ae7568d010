use tracing::{info, warn};

use crate::validate::validate_target_url;
use crate::{
    Clock, CoreError, Link, LinkRegistry, LinkStatus, NewLink, Token, TokenGenerator, Visit,
    VisitLog,
};

/// Generation attempts before `create` gives up on a colliding generator.
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Application service for the admin side: creating, listing and revoking
/// links, and reading the visit log.
///
/// Redemption itself goes through [`crate::engine::ConsumptionEngine`].
pub struct LinkService<R: LinkRegistry, V: VisitLog, G: TokenGenerator, C: Clock> {
    registry: R,
    visits: V,
    tokens: G,
    clock: C,
    default_target: Option<String>,
}

impl<R: LinkRegistry, V: VisitLog, G: TokenGenerator, C: Clock> LinkService<R, V, G, C> {
    pub fn new(registry: R, visits: V, tokens: G, clock: C) -> Self {
        Self {
            registry,
            visits,
            tokens,
            clock,
            default_target: None,
        }
    }

    /// Target used when a create request does not supply one.
    pub fn with_default_target(mut self, target: Option<String>) -> Self {
        self.default_target = target;
        self
    }

    /// Create a new active link under a freshly generated token.
    pub fn create(&self, input: NewLink) -> Result<Link, CoreError> {
        let target_url = match input.target_url {
            Some(url) => url.trim().to_string(),
            None => self
                .default_target
                .clone()
                .ok_or_else(|| CoreError::InvalidUrl("no target url given".into()))?,
        };
        validate_target_url(&target_url)?;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let link = Link::new(
                self.tokens.next_token(),
                target_url.clone(),
                input.mode,
                self.clock.now(),
            );
            match self.registry.insert(link.clone()) {
                Ok(()) => {
                    info!(token = %link.token.hint(), mode = link.mode.as_str(), "link created");
                    return Ok(link);
                }
                Err(CoreError::TokenCollision) => {
                    warn!("token collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Repository("failed to generate unique token".into()))
    }

    pub fn get(&self, token: &Token) -> Result<Option<Link>, CoreError> {
        self.registry.get(token)
    }

    /// All links, newest first.
    pub fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        self.registry.list_all()
    }

    /// Withdraw an active link. Only `Active` links can be revoked; a consumed
    /// link yields `Conflict`.
    pub fn revoke(&self, token: &Token) -> Result<(), CoreError> {
        self.registry.transition(
            token,
            LinkStatus::Active,
            LinkStatus::Deleted,
            self.clock.now(),
        )?;
        info!(token = %token.hint(), "link revoked");
        Ok(())
    }

    /// Visits for a token, newest first.
    pub fn visits_for(&self, token: &Token) -> Result<Vec<Visit>, CoreError> {
        self.visits.list_for(token)
    }

    pub fn recent_visits(&self, limit: usize) -> Result<Vec<Visit>, CoreError> {
        self.visits.list_recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::{InMemoryRegistry, InMemoryVisitLog};
    use crate::token::RandomTokenGenerator;
    use crate::LinkMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    struct TestClock;
    impl Clock for TestClock {
        fn now(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
    }

    /// Yields the same token for the first `repeats` calls, then distinct ones.
    struct StickyGenerator {
        calls: AtomicUsize,
        repeats: usize,
    }

    impl TokenGenerator for StickyGenerator {
        fn next_token(&self) -> Token {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            if n < self.repeats {
                Token::new("same").unwrap()
            } else {
                Token::new(format!("t{n}")).unwrap()
            }
        }
    }

    fn svc() -> LinkService<InMemoryRegistry, InMemoryVisitLog, RandomTokenGenerator, TestClock> {
        LinkService::new(
            InMemoryRegistry::new(),
            InMemoryVisitLog::new(),
            RandomTokenGenerator::default(),
            TestClock,
        )
    }

    #[test]
    fn create_generates_token_and_persists() {
        let svc = svc();
        let created = svc
            .create(NewLink {
                target_url: Some("https://a.example".into()),
                mode: LinkMode::SingleUse,
            })
            .expect("created");
        let got = svc.get(&created.token).unwrap().unwrap();
        assert_eq!(got.target_url, "https://a.example");
        assert_eq!(got.mode, LinkMode::SingleUse);
        assert_eq!(got.status, LinkStatus::Active);
    }

    #[test]
    fn create_uses_default_target() {
        let svc = svc().with_default_target(Some("https://fixed.example".into()));
        let created = svc
            .create(NewLink {
                target_url: None,
                mode: LinkMode::Reusable,
            })
            .unwrap();
        assert_eq!(created.target_url, "https://fixed.example");
    }

    #[test]
    fn create_rejects_missing_or_invalid_target() {
        let svc = svc();
        let err = svc
            .create(NewLink {
                target_url: None,
                mode: LinkMode::Reusable,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidUrl(_)));

        let err = svc
            .create(NewLink {
                target_url: Some("javascript:alert(1)".into()),
                mode: LinkMode::Reusable,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidUrl(_)));
    }

    #[test]
    fn create_retries_on_collision() {
        let svc = LinkService::new(
            InMemoryRegistry::new(),
            InMemoryVisitLog::new(),
            StickyGenerator {
                calls: AtomicUsize::new(0),
                repeats: 3,
            },
            TestClock,
        );
        let new = || NewLink {
            target_url: Some("https://a.example".into()),
            mode: LinkMode::Reusable,
        };
        let first = svc.create(new()).unwrap();
        assert_eq!(first.token.as_str(), "same");
        // Two more collisions on "same", then a fresh token
        let second = svc.create(new()).unwrap();
        assert_eq!(second.token.as_str(), "t3");
        assert_eq!(svc.list_all().unwrap().len(), 2);
    }

    #[test]
    fn create_gives_up_after_repeated_collisions() {
        let svc = LinkService::new(
            InMemoryRegistry::new(),
            InMemoryVisitLog::new(),
            StickyGenerator {
                calls: AtomicUsize::new(0),
                repeats: usize::MAX,
            },
            TestClock,
        );
        let new = || NewLink {
            target_url: Some("https://a.example".into()),
            mode: LinkMode::Reusable,
        };
        svc.create(new()).unwrap();
        let err = svc.create(new()).unwrap_err();
        assert!(matches!(err, CoreError::Repository(_)));
    }

    #[test]
    fn revoke_removes_active_link_once() {
        let svc = svc();
        let link = svc
            .create(NewLink {
                target_url: Some("https://a.example".into()),
                mode: LinkMode::Reusable,
            })
            .unwrap();
        svc.revoke(&link.token).unwrap();
        assert!(svc.get(&link.token).unwrap().is_none());
        assert!(matches!(
            svc.revoke(&link.token).unwrap_err(),
            CoreError::NotFound
        ));
    }
}
