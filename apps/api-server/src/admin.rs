//! Admin API under `/admin`: login/logout, password rotation, link
//! management and visit inspection.
//!
//! Callers authenticate with `Authorization: Bearer <password>` or the
//! session cookie issued by `POST /admin/login`.

use std::collections::VecDeque;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use domain::token::RandomTokenGenerator;
use domain::validate::parse_token;
use domain::{
    AdminSecretStore, CoreError, Link, LinkMode, LinkStatus, NewLink, Visit, VisitOutcome,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use crate::password::{hash_password, verify_password};
use crate::store::AnyStore;
use crate::AppState;

pub const SESSION_COOKIE: &str = "admin_session";
const MAX_SESSIONS: usize = 64;
const DEFAULT_VISIT_LIMIT: usize = 100;

/// Admin secret (argon2 hash, persisted through the store) plus the set of
/// live session ids.
pub struct AdminGate {
    secrets: AnyStore,
    hash: RwLock<String>,
    /// Last password that verified against `hash`; skips re-hashing per request.
    verified: Mutex<Option<String>>,
    sessions: Mutex<VecDeque<String>>,
    ids: RandomTokenGenerator,
}

impl AdminGate {
    /// Load the stored secret, seeding it from `seed` when none exists.
    pub fn open(secrets: AnyStore, seed: &str) -> Result<Self, CoreError> {
        let hash = match secrets.load_admin_secret()? {
            Some(stored) => {
                if !verify_password(seed, &stored) {
                    warn!("ADMIN_PASSWORD differs from the stored admin password; the stored one applies");
                }
                stored
            }
            None => {
                let fresh = hash_password(seed)?;
                if secrets.seed_admin_secret(&fresh)? {
                    info!("admin password seeded from ADMIN_PASSWORD");
                    fresh
                } else {
                    // another process seeded first
                    secrets
                        .load_admin_secret()?
                        .ok_or_else(|| CoreError::Repository("admin secret missing after seed".into()))?
                }
            }
        };
        Ok(Self {
            secrets,
            hash: RwLock::new(hash),
            verified: Mutex::new(None),
            sessions: Mutex::new(VecDeque::new()),
            ids: RandomTokenGenerator::new(32),
        })
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        if let Some(known) = self.verified.lock().as_deref() {
            if bool::from(candidate.as_bytes().ct_eq(known.as_bytes())) {
                return true;
            }
        }
        let hash = self.hash.read();
        if !verify_password(candidate, &hash) {
            return false;
        }
        *self.verified.lock() = Some(candidate.to_string());
        true
    }

    /// Issue a new session id. The oldest session is evicted past the cap.
    pub fn open_session(&self) -> String {
        let id = self.ids.random_string();
        let mut sessions = self.sessions.lock();
        if sessions.len() >= MAX_SESSIONS {
            sessions.pop_front();
        }
        sessions.push_back(id.clone());
        id
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .iter()
            .any(|s| bool::from(s.as_bytes().ct_eq(id.as_bytes())))
    }

    pub fn close_session(&self, id: &str) {
        self.sessions.lock().retain(|s| s != id);
    }

    /// Persist a new secret and drop every session.
    pub fn set_password(&self, password: &str) -> Result<(), CoreError> {
        let fresh = hash_password(password)?;
        self.secrets.save_admin_secret(&fresh)?;
        let mut hash = self.hash.write();
        *hash = fresh;
        *self.verified.lock() = Some(password.to_string());
        self.sessions.lock().clear();
        Ok(())
    }

    pub fn authorize(&self, bearer: Option<&str>, session: Option<&str>) -> bool {
        bearer.is_some_and(|p| self.check_password(p)) || session.is_some_and(|s| self.has_session(s))
    }
}

pub fn routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/password", post(change_password))
        .route("/links", post(create_link).get(list_links))
        .route("/links/:token", get(get_link).delete(revoke_link))
        .route("/links/:token/visits", get(link_visits))
        .route("/visits", get(recent_visits))
        .route_layer(middleware::from_fn_with_state(state, require_admin));

    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .merge(protected)
}

async fn require_admin(
    State(state): State<AppState>,
    jar: CookieJar,
    req: Request,
    next: Next,
) -> Response {
    let allowed = {
        let bearer = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let session = jar.get(SESSION_COOKIE).map(|c| c.value());
        state.admin.authorize(bearer, session)
    };
    if allowed {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "admin request rejected");
        unauthorized()
    }
}

#[derive(Deserialize)]
struct PasswordReq {
    password: String,
}

#[derive(Deserialize)]
struct CreateLinkReq {
    #[serde(default)]
    target_url: Option<String>,
    #[serde(default)]
    mode: Option<LinkMode>,
}

#[derive(Deserialize)]
struct VisitsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct LinkOut {
    token: String,
    target_url: String,
    mode: LinkMode,
    status: LinkStatus,
    created_at: String,
    status_changed_at: Option<String>,
    redeem_url: String,
}

#[derive(Serialize)]
struct VisitOut {
    id: u64,
    link_token: String,
    ip: String,
    user_agent: String,
    timestamp: String,
    outcome: VisitOutcome,
}

impl From<Visit> for VisitOut {
    fn from(v: Visit) -> Self {
        Self {
            id: v.id.0,
            link_token: v.link_token.as_str().to_string(),
            ip: v.ip,
            user_agent: v.user_agent,
            timestamp: http_common::system_time_to_rfc3339(v.timestamp),
            outcome: v.outcome,
        }
    }
}

fn link_to_out(state: &AppState, headers: &HeaderMap, link: Link) -> LinkOut {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    LinkOut {
        redeem_url: http_common::build_redeem_url(
            state.cfg.public_base_url.as_deref(),
            host,
            &state.cfg.redirect_prefix,
            link.token.as_str(),
        ),
        token: link.token.as_str().to_string(),
        target_url: link.target_url,
        mode: link.mode,
        status: link.status,
        created_at: http_common::system_time_to_rfc3339(link.created_at),
        status_changed_at: link.status_changed_at.map(http_common::system_time_to_rfc3339),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(http_common::json_err("unauthorized")),
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(http_common::json_err("not_found"))).into_response()
}

fn error_response(e: CoreError) -> Response {
    match e {
        CoreError::InvalidUrl(msg) => (
            StatusCode::BAD_REQUEST,
            Json(http_common::json_error_with_message("invalid_request", &msg)),
        )
            .into_response(),
        CoreError::InvalidToken(_) | CoreError::NotFound => not_found(),
        CoreError::Conflict | CoreError::AlreadyConsumed => (
            StatusCode::CONFLICT,
            Json(http_common::json_error_with_message(
                "conflict",
                "link is not active",
            )),
        )
            .into_response(),
        other => {
            error!(err = %other, "admin: store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(http_common::json_err("internal")),
            )
                .into_response()
        }
    }
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<PasswordReq>,
) -> Response {
    if !state.admin.check_password(&body.password) {
        warn!("admin login failed");
        return unauthorized();
    }
    let cookie = Cookie::build((SESSION_COOKIE, state.admin.open_session()))
        .path("/admin")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build();
    info!("admin session opened");
    (jar.add(cookie), StatusCode::NO_CONTENT).into_response()
}

async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    if let Some(c) = jar.get(SESSION_COOKIE) {
        state.admin.close_session(c.value());
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/admin"));
    (jar, StatusCode::NO_CONTENT).into_response()
}

async fn change_password(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<PasswordReq>,
) -> Response {
    if body.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(http_common::json_error_with_message(
                "invalid_request",
                "password must not be empty",
            )),
        )
            .into_response();
    }
    if let Err(e) = state.admin.set_password(&body.password) {
        return error_response(e);
    }
    info!("admin password changed; sessions cleared");
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/admin"));
    (jar, StatusCode::NO_CONTENT).into_response()
}

async fn create_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateLinkReq>,
) -> Response {
    let input = NewLink {
        target_url: body.target_url,
        mode: body.mode.unwrap_or(state.cfg.default_link_mode),
    };
    match state.links.create(input) {
        Ok(link) => (
            StatusCode::CREATED,
            Json(link_to_out(&state, &headers, link)),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_links(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.links.list_all() {
        Ok(links) => {
            let out: Vec<LinkOut> = links
                .into_iter()
                .map(|l| link_to_out(&state, &headers, l))
                .collect();
            Json(out).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw): Path<String>,
) -> Response {
    let Ok(token) = parse_token(&raw) else {
        return not_found();
    };
    match state.links.get(&token) {
        Ok(Some(link)) => Json(link_to_out(&state, &headers, link)).into_response(),
        Ok(None) => not_found(),
        Err(e) => error_response(e),
    }
}

async fn revoke_link(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let Ok(token) = parse_token(&raw) else {
        return not_found();
    };
    match state.links.revoke(&token) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn link_visits(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let Ok(token) = parse_token(&raw) else {
        return not_found();
    };
    match state.links.visits_for(&token) {
        Ok(visits) => {
            Json(visits.into_iter().map(VisitOut::from).collect::<Vec<_>>()).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn recent_visits(State(state): State<AppState>, Query(q): Query<VisitsQuery>) -> Response {
    let Some(limit) = http_common::resolve_limit(q.limit, DEFAULT_VISIT_LIMIT) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(http_common::json_error_with_message(
                "invalid_request",
                "limit must be between 1 and 500",
            )),
        )
            .into_response();
    };
    match state.links.recent_visits(limit) {
        Ok(visits) => {
            Json(visits.into_iter().map(VisitOut::from).collect::<Vec<_>>()).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(password: &str) -> AdminGate {
        AdminGate::open(AnyStore::memory(), password).unwrap()
    }

    #[test]
    fn gate_checks_password_and_sessions() {
        let gate = gate("first secret");
        assert!(gate.check_password("first secret"));
        assert!(!gate.check_password("first"));
        assert!(!gate.authorize(None, None));
        assert!(gate.authorize(Some("first secret"), None));

        let sid = gate.open_session();
        assert!(gate.authorize(None, Some(&sid)));
        assert!(!gate.authorize(None, Some("forged")));

        gate.close_session(&sid);
        assert!(!gate.has_session(&sid));
    }

    #[test]
    fn password_change_drops_sessions() {
        let gate = gate("old");
        assert!(gate.check_password("old"));
        let sid = gate.open_session();
        gate.set_password("new").unwrap();
        assert!(!gate.has_session(&sid));
        assert!(!gate.check_password("old"));
        assert!(gate.check_password("new"));
    }

    #[test]
    fn secret_is_stored_hashed() {
        let store = AnyStore::memory();
        let _gate = AdminGate::open(store.clone(), "plain words").unwrap();
        let stored = store.load_admin_secret().unwrap().unwrap();
        assert!(!stored.contains("plain words"));
        assert!(verify_password("plain words", &stored));
    }

    #[test]
    fn stored_secret_wins_over_seed() {
        let store = AnyStore::memory();
        let first = AdminGate::open(store.clone(), "original").unwrap();
        first.set_password("rotated").unwrap();
        drop(first);

        let reopened = AdminGate::open(store, "original").unwrap();
        assert!(reopened.check_password("rotated"));
        assert!(!reopened.check_password("original"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn rotated_password_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.db");

        let store = AnyStore::sqlite(&path).unwrap();
        let gate = AdminGate::open(store.clone(), "from env").unwrap();
        gate.set_password("changed at runtime").unwrap();
        drop(gate);
        store.close().unwrap();

        let store = AnyStore::sqlite(&path).unwrap();
        let gate = AdminGate::open(store, "from env").unwrap();
        assert!(gate.check_password("changed at runtime"));
        assert!(!gate.check_password("from env"));
    }

    #[test]
    fn sessions_are_capped() {
        let gate = gate("pw");
        let first = gate.open_session();
        for _ in 0..MAX_SESSIONS {
            gate.open_session();
        }
        assert!(!gate.has_session(&first));
        assert_eq!(gate.sessions.lock().len(), MAX_SESSIONS);
    }
}
