//! Consumption engine: decides whether an access attempt may redeem a token
//! and performs the matching state transition and visit record.
//!
//! The read-check-mutate sequence for a single-use token goes through
//! [`LinkRegistry::transition`], an atomic compare-and-swap in the store, so
//! concurrent attempts on the same token are totally ordered and exactly one
//! wins. Attempts on different tokens never contend.

use tracing::{debug, info, warn};

use crate::{
    Clock, CoreError, LinkMode, LinkRegistry, LinkStatus, NewVisit, Token, VisitId, VisitLog,
    VisitOutcome,
};

/// Which attempts are written to the visit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AttemptLogging {
    /// Every attempt against an existing link, admitted or not.
    #[default]
    All,
    /// Only attempts that received a redirect.
    AdmittedOnly,
}

impl AttemptLogging {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "all" => Some(Self::All),
            "admitted" | "admitted_only" | "admitted-only" => Some(Self::AdmittedOnly),
            _ => None,
        }
    }
}

/// What happens to a single-use link on its first redemption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SingleUseAction {
    /// Keep the row with status `Consumed`.
    #[default]
    Consume,
    /// Remove the row. Later attempts look like unknown tokens.
    Delete,
}

impl SingleUseAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "consume" | "consumed" => Some(Self::Consume),
            "delete" | "deleted" => Some(Self::Delete),
            _ => None,
        }
    }

    fn target_status(self) -> LinkStatus {
        match self {
            Self::Consume => LinkStatus::Consumed,
            Self::Delete => LinkStatus::Deleted,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConsumptionPolicy {
    pub attempt_logging: AttemptLogging,
    pub single_use_action: SingleUseAction,
}

/// The requester side of an access attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessEvent {
    pub ip: String,
    pub user_agent: String,
}

impl AccessEvent {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// Why an attempt was refused. Never shown to the client; all variants map
/// to the same response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    NotFound,
    AlreadyConsumed,
    /// Another attempt changed the status between our read and our transition.
    Conflict,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Denial::NotFound => "not_found",
            Denial::AlreadyConsumed => "already_consumed",
            Denial::Conflict => "conflict",
        }
    }

    fn outcome(self) -> Option<VisitOutcome> {
        match self {
            Denial::NotFound => None,
            Denial::AlreadyConsumed => Some(VisitOutcome::AlreadyConsumed),
            Denial::Conflict => Some(VisitOutcome::Conflict),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Redirect to the contained target URL.
    Redirect(String),
    NotAdmitted(Denial),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Redirect(_))
    }
}

/// Result of [`ConsumptionEngine::evaluate`]: the committed decision plus the
/// visit still to be recorded, if policy wants one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redemption {
    pub admission: Admission,
    pub visit: Option<NewVisit>,
}

pub struct ConsumptionEngine<R: LinkRegistry, V: VisitLog, C: Clock> {
    registry: R,
    visits: V,
    clock: C,
    policy: ConsumptionPolicy,
}

impl<R: LinkRegistry, V: VisitLog, C: Clock> ConsumptionEngine<R, V, C> {
    pub fn new(registry: R, visits: V, clock: C, policy: ConsumptionPolicy) -> Self {
        Self {
            registry,
            visits,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> ConsumptionPolicy {
        self.policy
    }

    /// Decide admission and commit any registry transition, returning the
    /// visit without writing it. Pair with [`Self::record`].
    pub fn evaluate(&self, token: &Token, access: &AccessEvent) -> Result<Redemption, CoreError> {
        let now = self.clock.now();
        let Some(link) = self.registry.get(token)? else {
            debug!(token = %token.hint(), "redeem: unknown token");
            return Ok(self.denied(token, access, now, Denial::NotFound));
        };

        if link.status != LinkStatus::Active {
            warn!(token = %token.hint(), status = link.status.as_str(), "redeem: link not active");
            return Ok(self.denied(token, access, now, Denial::AlreadyConsumed));
        }

        if link.mode == LinkMode::SingleUse {
            let next = self.policy.single_use_action.target_status();
            match self
                .registry
                .transition(token, LinkStatus::Active, next, now)
            {
                Ok(()) => {}
                // A concurrent winner either changed the status or removed the row
                Err(CoreError::Conflict) | Err(CoreError::NotFound) => {
                    warn!(token = %token.hint(), "redeem: lost race for single-use link");
                    return Ok(self.denied(token, access, now, Denial::Conflict));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            token = %token.hint(),
            mode = link.mode.as_str(),
            redirect_to = %link.target_url,
            "redeem: admitted"
        );
        Ok(Redemption {
            admission: Admission::Redirect(link.target_url),
            visit: Some(Self::visit(token, access, now, VisitOutcome::Admitted)),
        })
    }

    /// Append a visit. Failures are logged and swallowed; the registry state
    /// already committed by `evaluate` stands regardless.
    pub fn record(&self, visit: NewVisit) -> Option<VisitId> {
        let token = visit.link_token.clone();
        match self.visits.append(visit) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(token = %token.hint(), err = %e, "visit append failed");
                None
            }
        }
    }

    /// Evaluate and record as one synchronous unit.
    pub fn redeem(&self, token: &Token, access: &AccessEvent) -> Result<Admission, CoreError> {
        let redemption = self.evaluate(token, access)?;
        if let Some(visit) = redemption.visit {
            self.record(visit);
        }
        Ok(redemption.admission)
    }

    fn denied(
        &self,
        token: &Token,
        access: &AccessEvent,
        now: std::time::SystemTime,
        denial: Denial,
    ) -> Redemption {
        let visit = match (denial.outcome(), self.policy.attempt_logging) {
            (Some(outcome), AttemptLogging::All) => Some(Self::visit(token, access, now, outcome)),
            _ => None,
        };
        Redemption {
            admission: Admission::NotAdmitted(denial),
            visit,
        }
    }

    fn visit(
        token: &Token,
        access: &AccessEvent,
        now: std::time::SystemTime,
        outcome: VisitOutcome,
    ) -> NewVisit {
        NewVisit {
            link_token: token.clone(),
            ip: access.ip.clone(),
            user_agent: access.user_agent.clone(),
            timestamp: now,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::{InMemoryRegistry, InMemoryVisitLog};
    use crate::{Link, Visit};
    use std::sync::{Arc, Barrier};
    use std::time::SystemTime;

    struct TestClock;
    impl Clock for TestClock {
        fn now(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
    }

    struct FailingVisitLog;
    impl VisitLog for FailingVisitLog {
        fn append(&self, _visit: NewVisit) -> Result<VisitId, CoreError> {
            Err(CoreError::Repository("disk full".into()))
        }
        fn list_for(&self, _token: &Token) -> Result<Vec<Visit>, CoreError> {
            Ok(Vec::new())
        }
        fn list_recent(&self, _limit: usize) -> Result<Vec<Visit>, CoreError> {
            Ok(Vec::new())
        }
    }

    type Engine = ConsumptionEngine<Arc<InMemoryRegistry>, Arc<InMemoryVisitLog>, TestClock>;

    fn setup(policy: ConsumptionPolicy) -> (Engine, Arc<InMemoryRegistry>, Arc<InMemoryVisitLog>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let visits = Arc::new(InMemoryVisitLog::new());
        let engine = ConsumptionEngine::new(registry.clone(), visits.clone(), TestClock, policy);
        (engine, registry, visits)
    }

    fn seed(registry: &InMemoryRegistry, token: &str, mode: LinkMode) -> Token {
        let token = Token::new(token).unwrap();
        registry
            .insert(Link::new(
                token.clone(),
                "https://a.example".into(),
                mode,
                SystemTime::UNIX_EPOCH,
            ))
            .unwrap();
        token
    }

    fn access() -> AccessEvent {
        AccessEvent::new("203.0.113.7", "curl/8")
    }

    #[test]
    fn single_use_admits_once_then_denies() {
        let (engine, registry, visits) = setup(ConsumptionPolicy::default());
        let t = seed(&registry, "T", LinkMode::SingleUse);

        let first = engine.redeem(&t, &access()).unwrap();
        assert_eq!(first, Admission::Redirect("https://a.example".into()));

        let second = engine.redeem(&t, &access()).unwrap();
        assert_eq!(second, Admission::NotAdmitted(Denial::AlreadyConsumed));

        let link = registry.get(&t).unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Consumed);

        let logged = visits.list_for(&t).unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].outcome, VisitOutcome::AlreadyConsumed);
        assert_eq!(logged[1].outcome, VisitOutcome::Admitted);
        assert_eq!(logged[1].ip, "203.0.113.7");
        assert_eq!(logged[1].user_agent, "curl/8");
    }

    #[test]
    fn reusable_admits_indefinitely() {
        let (engine, registry, visits) = setup(ConsumptionPolicy::default());
        let u = seed(&registry, "U", LinkMode::Reusable);

        for _ in 0..10 {
            let a = engine.redeem(&u, &access()).unwrap();
            assert_eq!(a, Admission::Redirect("https://a.example".into()));
        }
        let link = registry.get(&u).unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Active);
        assert!(link.status_changed_at.is_none());
        assert_eq!(visits.list_for(&u).unwrap().len(), 10);
    }

    #[test]
    fn unknown_token_is_denied_without_visit() {
        let (engine, _registry, visits) = setup(ConsumptionPolicy::default());
        let missing = Token::new("missing").unwrap();
        let a = engine.redeem(&missing, &access()).unwrap();
        assert_eq!(a, Admission::NotAdmitted(Denial::NotFound));
        assert!(visits.list_recent(10).unwrap().is_empty());
    }

    #[test]
    fn admitted_only_policy_skips_failed_attempts() {
        let policy = ConsumptionPolicy {
            attempt_logging: AttemptLogging::AdmittedOnly,
            ..Default::default()
        };
        let (engine, registry, visits) = setup(policy);
        let t = seed(&registry, "T", LinkMode::SingleUse);

        assert!(engine.redeem(&t, &access()).unwrap().is_admitted());
        assert!(!engine.redeem(&t, &access()).unwrap().is_admitted());
        let logged = visits.list_for(&t).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].outcome, VisitOutcome::Admitted);
    }

    #[test]
    fn delete_action_removes_link_but_keeps_visits() {
        let policy = ConsumptionPolicy {
            single_use_action: SingleUseAction::Delete,
            ..Default::default()
        };
        let (engine, registry, visits) = setup(policy);
        let t = seed(&registry, "T", LinkMode::SingleUse);

        assert!(engine.redeem(&t, &access()).unwrap().is_admitted());
        assert!(registry.get(&t).unwrap().is_none());
        assert_eq!(
            engine.redeem(&t, &access()).unwrap(),
            Admission::NotAdmitted(Denial::NotFound)
        );
        assert_eq!(visits.list_for(&t).unwrap().len(), 1);
    }

    #[test]
    fn evaluate_leaves_recording_to_caller() {
        let (engine, registry, visits) = setup(ConsumptionPolicy::default());
        let t = seed(&registry, "T", LinkMode::SingleUse);

        let r = engine.evaluate(&t, &access()).unwrap();
        assert!(r.admission.is_admitted());
        assert!(visits.list_for(&t).unwrap().is_empty());
        // Transition is already committed before the visit is written
        assert_eq!(
            registry.get(&t).unwrap().unwrap().status,
            LinkStatus::Consumed
        );

        let id = engine.record(r.visit.expect("visit"));
        assert!(id.is_some());
        assert_eq!(visits.list_for(&t).unwrap().len(), 1);
    }

    #[test]
    fn failing_visit_log_does_not_change_outcome() {
        let registry = Arc::new(InMemoryRegistry::new());
        let engine = ConsumptionEngine::new(
            registry.clone(),
            FailingVisitLog,
            TestClock,
            ConsumptionPolicy::default(),
        );
        let t = seed(&registry, "T", LinkMode::SingleUse);

        let a = engine.redeem(&t, &access()).unwrap();
        assert_eq!(a, Admission::Redirect("https://a.example".into()));
        assert_eq!(
            registry.get(&t).unwrap().unwrap().status,
            LinkStatus::Consumed
        );
    }

    fn race(n: usize, action: SingleUseAction) -> (usize, Arc<InMemoryVisitLog>, Token) {
        let policy = ConsumptionPolicy {
            single_use_action: action,
            ..Default::default()
        };
        let (engine, registry, visits) = setup(policy);
        let t = seed(&registry, "race", LinkMode::SingleUse);
        let barrier = Barrier::new(n);

        let admitted = std::thread::scope(|s| {
            let handles: Vec<_> = (0..n)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        engine.redeem(&t, &access()).unwrap().is_admitted()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        (admitted, visits, t)
    }

    #[test]
    fn single_use_exclusivity_under_contention() {
        for n in [1, 2, 8, 50] {
            let (admitted, visits, t) = race(n, SingleUseAction::Consume);
            assert_eq!(admitted, 1, "n = {n}");
            let logged = visits.list_for(&t).unwrap();
            assert_eq!(logged.len(), n, "one visit per attempt, n = {n}");
            assert_eq!(
                logged
                    .iter()
                    .filter(|v| v.outcome == VisitOutcome::Admitted)
                    .count(),
                1
            );
        }
    }

    #[test]
    fn single_use_exclusivity_with_delete_action() {
        let (admitted, visits, t) = race(50, SingleUseAction::Delete);
        assert_eq!(admitted, 1);
        let admitted_visits = visits
            .list_for(&t)
            .unwrap()
            .into_iter()
            .filter(|v| v.outcome == VisitOutcome::Admitted)
            .count();
        assert_eq!(admitted_visits, 1);
    }

    #[test]
    fn parse_policies() {
        assert_eq!(AttemptLogging::parse("ALL"), Some(AttemptLogging::All));
        assert_eq!(
            AttemptLogging::parse("admitted"),
            Some(AttemptLogging::AdmittedOnly)
        );
        assert_eq!(AttemptLogging::parse("some"), None);
        assert_eq!(SingleUseAction::parse("delete"), Some(SingleUseAction::Delete));
        assert_eq!(SingleUseAction::parse("consume"), Some(SingleUseAction::Consume));
        assert_eq!(SingleUseAction::parse("keep"), None);
    }
}
