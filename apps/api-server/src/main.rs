//! api-server: HTTP front for the redirect token service.
//!
//! Serves the public redemption endpoint (`GET /<prefix>/:token`) and the
//! password-protected admin API under `/admin`. Storage is SQLite (default
//! `sqlite` feature) or in-memory.
//!
//! Run:
//! ```bash
//! ADMIN_PASSWORD=change-me cargo run -p api-server
//!
//! # JSON logs, reusable links by default, 410 for refused redemptions
//! ADMIN_PASSWORD=change-me LOG_FORMAT=json DEFAULT_LINK_MODE=reusable \
//! NOT_ADMITTED_STATUS=410 cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.

mod admin;
mod config;
mod password;
mod redirect;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use domain::engine::ConsumptionEngine;
use domain::service::LinkService;
use domain::token::RandomTokenGenerator;
use domain::{CoreError, SystemClock};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::admin::AdminGate;
use crate::store::AnyStore;

type Engine = ConsumptionEngine<AnyStore, AnyStore, SystemClock>;
type Links = LinkService<AnyStore, AnyStore, RandomTokenGenerator, SystemClock>;

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<config::Config>,
    engine: Arc<Engine>,
    links: Arc<Links>,
    admin: Arc<AdminGate>,
}

impl AppState {
    fn new(cfg: config::Config, store: AnyStore) -> Result<Self, CoreError> {
        let admin = AdminGate::open(store.clone(), &cfg.admin_password)?;
        let engine = ConsumptionEngine::new(store.clone(), store.clone(), SystemClock, cfg.policy);
        let links = LinkService::new(
            store.clone(),
            store,
            RandomTokenGenerator::new(cfg.token_bytes),
            SystemClock,
        )
        .with_default_target(cfg.default_target_url.clone());
        Ok(Self {
            admin: Arc::new(admin),
            cfg: Arc::new(cfg),
            engine: Arc::new(engine),
            links: Arc::new(links),
        })
    }
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_insecure();

    let store = match AnyStore::from_config(&cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to open storage");
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let prefix = cfg.redirect_prefix.clone();
    let state = match AppState::new(cfg, store.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to load admin secret");
            std::process::exit(1);
        }
    };
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, prefix = %prefix, storage = store.describe(), "api-server listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = served {
        error!(err = %e, "server error");
    }

    if let Err(e) = store.close() {
        error!(err = %e, "failed to close storage");
    }
    info!("api-server stopped");
}

fn build_router(state: AppState) -> Router {
    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");
    let redirect_path = format!("/{}/:token", state.cfg.redirect_prefix);
    let prefix = state.cfg.redirect_prefix.clone();

    Router::new()
        .route(&redirect_path, get(redirect::redeem))
        .route("/healthz", get(|| async { "ok" }))
        .nest("/admin", admin::routes(state.clone()))
        .fallback(redirect::fallback)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(move |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %span_path(request.uri().path(), &prefix),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .with_state(state)
}

/// Request path for the trace span with any token segment masked.
fn span_path(path: &str, prefix: &str) -> String {
    let redeem = format!("/{prefix}/");
    for base in [redeem.as_str(), "/admin/links/"] {
        if let Some(rest) = path.strip_prefix(base) {
            return match rest.split_once('/') {
                Some((_, tail)) => format!("{base}:token/{tail}"),
                None => format!("{base}:token"),
            };
        }
    }
    path.to_string()
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(err = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(err = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
