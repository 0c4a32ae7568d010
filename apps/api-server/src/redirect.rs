//! Public redemption endpoint: `GET /<prefix>/:token`.
//!
//! Every refusal (unknown, consumed, lost race, malformed) produces the same
//! status and body so a caller cannot tell the cases apart. Only GET redeems;
//! HEAD (link previews, URL checkers) is refused without touching the link.

use std::net::SocketAddr;

use axum::{
    extract::{rejection::PathRejection, ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use domain::engine::{AccessEvent, Admission};
use domain::validate::parse_token;
use tracing::{debug, error, info};

use crate::config::VisitLogging;
use crate::AppState;

pub async fn redeem(
    State(state): State<AppState>,
    method: Method,
    raw: Result<Path<String>, PathRejection>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if method != Method::GET {
        debug!(%method, "redeem: refused non-GET request");
        return not_admitted(state.cfg.not_admitted_status);
    }
    let token = match raw {
        Ok(Path(raw)) => match parse_token(&raw) {
            Ok(t) => t,
            Err(e) => {
                debug!(err = %e, "redeem: malformed token");
                return not_admitted(state.cfg.not_admitted_status);
            }
        },
        Err(e) => {
            debug!(err = %e, "redeem: undecodable path");
            return not_admitted(state.cfg.not_admitted_status);
        }
    };

    let peer = peer.map(|ConnectInfo(addr)| addr.ip().to_string());
    let ip = http_common::client_ip(
        headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        peer.as_deref(),
    );
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let access = AccessEvent::new(ip, user_agent);

    let result = match state.cfg.visit_logging {
        VisitLogging::Sync => state.engine.redeem(&token, &access),
        VisitLogging::Deferred => state.engine.evaluate(&token, &access).map(|r| {
            if let Some(visit) = r.visit {
                let engine = state.engine.clone();
                tokio::task::spawn_blocking(move || {
                    engine.record(visit);
                });
            }
            r.admission
        }),
    };

    match result {
        Ok(Admission::Redirect(url)) => found(&url),
        Ok(Admission::NotAdmitted(denial)) => {
            info!(denial = denial.as_str(), "redeem: not admitted");
            not_admitted(state.cfg.not_admitted_status)
        }
        Err(e) => {
            error!(err = %e, "redeem: store failure");
            internal_error()
        }
    }
}

/// Fallback for paths no route matches, shaped like a refused redemption.
pub async fn fallback(State(state): State<AppState>) -> Response {
    not_admitted(state.cfg.not_admitted_status)
}

fn found(url: &str) -> Response {
    match HeaderValue::from_str(url) {
        Ok(location) => (
            StatusCode::FOUND,
            [
                (header::LOCATION, location),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            ],
        )
            .into_response(),
        Err(e) => {
            error!(err = %e, "stored target is not a valid header value");
            internal_error()
        }
    }
}

pub(crate) fn not_admitted(status: StatusCode) -> Response {
    (
        status,
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(http_common::json_err("not_found")),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(http_common::json_err("internal")),
    )
        .into_response()
}
