//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time.

use axum::http::StatusCode;
use domain::engine::{AttemptLogging, ConsumptionPolicy, SingleUseAction};
use domain::token::{DEFAULT_TOKEN_BYTES, MAX_TOKEN_BYTES, MIN_TOKEN_BYTES};
use domain::LinkMode;
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on restart)
    Memory,
    /// SQLite file-based storage
    Sqlite,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("memory") {
            Self::Memory
        } else {
            Self::Sqlite
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// When the visit for a redemption is written relative to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitLogging {
    /// Append before the response is returned.
    Sync,
    /// Append on a blocking task after the decision; failures are swallowed.
    Deferred,
}

impl VisitLogging {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sync" | "synchronous" => Some(Self::Sync),
            "deferred" | "async" => Some(Self::Deferred),
            _ => None,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError {
        field,
        message: message.into(),
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Clone)]
pub struct Config {
    /// Server port (default: 3000)
    pub port: u16,
    /// Storage provider (default: sqlite)
    pub storage_provider: StorageProvider,
    /// SQLite database path (default: ./data/links.db)
    pub db_path: PathBuf,
    /// Log format
    pub log_format: LogFormat,
    /// Path segment in front of tokens, without slashes (default: go)
    pub redirect_prefix: String,
    /// Base used for `redeem_url`; Host header when unset
    pub public_base_url: Option<String>,
    /// Shared admin secret
    pub admin_password: String,
    /// Target used when a create request omits one
    pub default_target_url: Option<String>,
    /// Mode used when a create request omits one
    pub default_link_mode: LinkMode,
    /// Random bytes per generated token
    pub token_bytes: usize,
    pub visit_logging: VisitLogging,
    pub policy: ConsumptionPolicy,
    /// Response status for every refused redemption (404 or 410)
    pub not_admitted_status: StatusCode,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("storage_provider", &self.storage_provider)
            .field("db_path", &self.db_path)
            .field("log_format", &self.log_format)
            .field("redirect_prefix", &self.redirect_prefix)
            .field("public_base_url", &self.public_base_url)
            .field("admin_password", &"<redacted>")
            .field("default_target_url", &self.default_target_url)
            .field("default_link_mode", &self.default_link_mode)
            .field("token_bytes", &self.token_bytes)
            .field("visit_logging", &self.visit_logging)
            .field("policy", &self.policy)
            .field("not_admitted_status", &self.not_admitted_status)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; `from_env` passes the process env.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Treat empty values as unset
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        // Port
        let port = match get("PORT") {
            Some(s) => s
                .parse()
                .map_err(|_| invalid("PORT", format!("not a port number: '{s}'")))?,
            None => 3000,
        };

        // Storage provider
        let storage_provider =
            StorageProvider::from_str(&get("STORAGE_PROVIDER").unwrap_or_else(|| "sqlite".into()));

        // DB path (for sqlite)
        let db_path = PathBuf::from(get("DB_PATH").unwrap_or_else(|| "./data/links.db".into()));

        // Log format
        let log_format = LogFormat::from_str(&get("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        // Redirect prefix: one path segment
        let redirect_prefix = get("REDIRECT_PREFIX")
            .unwrap_or_else(|| "go".into())
            .trim_matches('/')
            .to_string();
        if redirect_prefix.is_empty()
            || !redirect_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                "REDIRECT_PREFIX",
                "must be a single path segment of [A-Za-z0-9_-]",
            ));
        }
        if matches!(redirect_prefix.as_str(), "admin" | "healthz") {
            return Err(invalid("REDIRECT_PREFIX", "collides with a reserved route"));
        }

        let public_base_url = get("PUBLIC_BASE_URL");

        // Admin secret is mandatory
        let admin_password = get("ADMIN_PASSWORD")
            .ok_or_else(|| invalid("ADMIN_PASSWORD", "Required"))?;

        let default_target_url = get("DEFAULT_TARGET_URL");
        if let Some(url) = &default_target_url {
            domain::validate::validate_target_url(url)
                .map_err(|e| invalid("DEFAULT_TARGET_URL", e.to_string()))?;
        }

        let default_link_mode = match get("DEFAULT_LINK_MODE") {
            Some(s) => LinkMode::parse(&s)
                .ok_or_else(|| invalid("DEFAULT_LINK_MODE", format!("unknown mode '{s}'")))?,
            None => LinkMode::SingleUse,
        };

        let token_bytes = match get("TOKEN_BYTES") {
            Some(s) => s
                .parse::<usize>()
                .ok()
                .filter(|n| (MIN_TOKEN_BYTES..=MAX_TOKEN_BYTES).contains(n))
                .ok_or_else(|| {
                    invalid(
                        "TOKEN_BYTES",
                        format!("must be between {MIN_TOKEN_BYTES} and {MAX_TOKEN_BYTES}"),
                    )
                })?,
            None => DEFAULT_TOKEN_BYTES,
        };

        let visit_logging = match get("VISIT_LOGGING") {
            Some(s) => VisitLogging::parse(&s)
                .ok_or_else(|| invalid("VISIT_LOGGING", "expected 'sync' or 'deferred'"))?,
            None => VisitLogging::Sync,
        };

        let attempt_logging = match get("ATTEMPT_LOGGING") {
            Some(s) => AttemptLogging::parse(&s)
                .ok_or_else(|| invalid("ATTEMPT_LOGGING", "expected 'all' or 'admitted'"))?,
            None => AttemptLogging::All,
        };

        let single_use_action = match get("SINGLE_USE_ACTION") {
            Some(s) => SingleUseAction::parse(&s)
                .ok_or_else(|| invalid("SINGLE_USE_ACTION", "expected 'consume' or 'delete'"))?,
            None => SingleUseAction::Consume,
        };

        let not_admitted_status = match get("NOT_ADMITTED_STATUS").as_deref() {
            None | Some("404") => StatusCode::NOT_FOUND,
            Some("410") => StatusCode::GONE,
            Some(other) => {
                return Err(invalid(
                    "NOT_ADMITTED_STATUS",
                    format!("expected 404 or 410, got '{other}'"),
                ))
            }
        };

        Ok(Self {
            port,
            storage_provider,
            db_path,
            log_format,
            redirect_prefix,
            public_base_url,
            admin_password,
            default_target_url,
            default_link_mode,
            token_bytes,
            visit_logging,
            policy: ConsumptionPolicy {
                attempt_logging,
                single_use_action,
            },
            not_admitted_status,
        })
    }

    /// Log warnings about risky configuration.
    /// Settings that are accepted but weaken the deployment.
    pub fn insecure_warnings(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.admin_password.len() < 12 {
            out.push("ADMIN_PASSWORD is shorter than 12 characters");
        }
        if self.storage_provider == StorageProvider::Memory {
            out.push(
                "STORAGE_PROVIDER=memory: links and visits are lost on restart and \
                 single-use guarantees do not extend across processes",
            );
        }
        if self.visit_logging == VisitLogging::Deferred {
            out.push("VISIT_LOGGING=deferred: visit append failures are not reported");
        }
        if self.public_base_url.is_none() {
            out.push(
                "PUBLIC_BASE_URL is unset: redeem_url is built from the request Host header",
            );
        }
        out
    }

    pub fn warn_if_insecure(&self) {
        for msg in self.insecure_warnings() {
            tracing::warn!("{msg}");
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: std::collections::HashMap<String, String> = [
        ("ADMIN_PASSWORD", "correct horse battery"),
        ("STORAGE_PROVIDER", "memory"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|k| vars.get(k).cloned()).expect("valid test config")
}
