//! Storage selection for the server: one handle that dispatches to the
//! in-memory adapters or SQLite (feature-gated) and implements every port.

use std::sync::Arc;
use std::time::SystemTime;

use domain::adapters::memory_repo::{InMemoryAdminSecret, InMemoryRegistry, InMemoryVisitLog};
use domain::{
    AdminSecretStore, CoreError, Link, LinkRegistry, LinkStatus, NewVisit, Token, Visit, VisitId,
    VisitLog,
};
use tracing::{info, warn};

use crate::config::{Config, StorageProvider};

enum StoreKind {
    Memory {
        registry: InMemoryRegistry,
        visits: InMemoryVisitLog,
        secret: InMemoryAdminSecret,
    },
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite_adapter::SqliteStore),
}

#[derive(Clone)]
pub struct AnyStore {
    kind: Arc<StoreKind>,
}

impl AnyStore {
    pub fn memory() -> Self {
        Self {
            kind: Arc::new(StoreKind::Memory {
                registry: InMemoryRegistry::new(),
                visits: InMemoryVisitLog::new(),
                secret: InMemoryAdminSecret::new(),
            }),
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: &std::path::Path) -> Result<Self, CoreError> {
        Ok(Self {
            kind: Arc::new(StoreKind::Sqlite(
                sqlite_adapter::SqliteStore::open_creating_dirs(path)?,
            )),
        })
    }

    /// Open the backend named by the config.
    pub fn from_config(cfg: &Config) -> Result<Self, CoreError> {
        match cfg.storage_provider {
            StorageProvider::Memory => {
                info!("using in-memory storage");
                Ok(Self::memory())
            }
            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => {
                info!(path = %cfg.db_path.display(), "using SQLite storage");
                Self::sqlite(&cfg.db_path)
            }
            #[cfg(not(feature = "sqlite"))]
            StorageProvider::Sqlite => Err(CoreError::Repository(
                "STORAGE_PROVIDER=sqlite but the `sqlite` feature is disabled".into(),
            )),
        }
    }

    pub fn describe(&self) -> &'static str {
        match &*self.kind {
            StoreKind::Memory { .. } => "memory",
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(_) => "sqlite",
        }
    }

    /// Release the backend. When other handles are still alive (a deferred
    /// visit write, say) the backend closes when the last one drops.
    pub fn close(self) -> Result<(), CoreError> {
        match Arc::try_unwrap(self.kind) {
            #[cfg(feature = "sqlite")]
            Ok(StoreKind::Sqlite(s)) => s.close(),
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("store still referenced at shutdown; closing on last drop");
                Ok(())
            }
        }
    }
}

impl LinkRegistry for AnyStore {
    fn insert(&self, link: Link) -> Result<(), CoreError> {
        match &*self.kind {
            StoreKind::Memory { registry, .. } => registry.insert(link),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.insert(link),
        }
    }

    fn get(&self, token: &Token) -> Result<Option<Link>, CoreError> {
        match &*self.kind {
            StoreKind::Memory { registry, .. } => registry.get(token),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => LinkRegistry::get(s, token),
        }
    }

    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        match &*self.kind {
            StoreKind::Memory { registry, .. } => registry.list_all(),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.list_all(),
        }
    }

    fn transition(
        &self,
        token: &Token,
        expected: LinkStatus,
        new: LinkStatus,
        at: SystemTime,
    ) -> Result<(), CoreError> {
        match &*self.kind {
            StoreKind::Memory { registry, .. } => registry.transition(token, expected, new, at),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.transition(token, expected, new, at),
        }
    }
}

impl VisitLog for AnyStore {
    fn append(&self, visit: NewVisit) -> Result<VisitId, CoreError> {
        match &*self.kind {
            StoreKind::Memory { visits, .. } => visits.append(visit),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.append(visit),
        }
    }

    fn list_for(&self, token: &Token) -> Result<Vec<Visit>, CoreError> {
        match &*self.kind {
            StoreKind::Memory { visits, .. } => visits.list_for(token),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.list_for(token),
        }
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Visit>, CoreError> {
        match &*self.kind {
            StoreKind::Memory { visits, .. } => visits.list_recent(limit),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.list_recent(limit),
        }
    }
}

impl AdminSecretStore for AnyStore {
    fn load_admin_secret(&self) -> Result<Option<String>, CoreError> {
        match &*self.kind {
            StoreKind::Memory { secret, .. } => secret.load_admin_secret(),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.load_admin_secret(),
        }
    }

    fn seed_admin_secret(&self, hash: &str) -> Result<bool, CoreError> {
        match &*self.kind {
            StoreKind::Memory { secret, .. } => secret.seed_admin_secret(hash),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.seed_admin_secret(hash),
        }
    }

    fn save_admin_secret(&self, hash: &str) -> Result<(), CoreError> {
        match &*self.kind {
            StoreKind::Memory { secret, .. } => secret.save_admin_secret(hash),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite(s) => s.save_admin_secret(hash),
        }
    }
}
