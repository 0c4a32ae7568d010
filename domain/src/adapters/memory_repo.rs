use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::{
    AdminSecretStore, CoreError, Link, LinkRegistry, LinkStatus, NewVisit, Token, Visit, VisitId,
    VisitLog,
};

/// In-memory link registry. The map guard makes `transition` an atomic
/// compare-and-swap, which only holds within a single process.
pub struct InMemoryRegistry {
    inner: Mutex<BTreeMap<String, Link>>,
}

/// In-memory append-only visit log.
pub struct InMemoryVisitLog {
    visits: Mutex<Vec<Visit>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    fn key(token: &Token) -> String {
        token.as_str().to_string()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRegistry for InMemoryRegistry {
    fn insert(&self, link: Link) -> Result<(), CoreError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let key = Self::key(&link.token);
        if map.contains_key(&key) {
            return Err(CoreError::TokenCollision);
        }
        map.insert(key, link);
        Ok(())
    }

    fn get(&self, token: &Token) -> Result<Option<Link>, CoreError> {
        let map = self
            .inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        Ok(map.get(&Self::key(token)).cloned())
    }

    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        let map = self
            .inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let mut items: Vec<_> = map.values().cloned().collect();
        // Sort by created_at desc
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    fn transition(
        &self,
        token: &Token,
        expected: LinkStatus,
        new: LinkStatus,
        at: SystemTime,
    ) -> Result<(), CoreError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let key = Self::key(token);
        match map.get(&key).map(|l| l.status) {
            None => Err(CoreError::NotFound),
            Some(current) if current != expected => Err(CoreError::Conflict),
            Some(_) if new == LinkStatus::Deleted => {
                map.remove(&key);
                Ok(())
            }
            Some(_) => {
                if let Some(link) = map.get_mut(&key) {
                    link.status = new;
                    link.status_changed_at = Some(at);
                }
                Ok(())
            }
        }
    }
}

impl InMemoryVisitLog {
    pub fn new() -> Self {
        Self {
            visits: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryVisitLog {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory admin secret; gone on restart.
#[derive(Default)]
pub struct InMemoryAdminSecret {
    hash: Mutex<Option<String>>,
}

impl InMemoryAdminSecret {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>, CoreError> {
        self.hash
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl AdminSecretStore for InMemoryAdminSecret {
    fn load_admin_secret(&self) -> Result<Option<String>, CoreError> {
        Ok(self.lock()?.clone())
    }

    fn seed_admin_secret(&self, hash: &str) -> Result<bool, CoreError> {
        let mut current = self.lock()?;
        if current.is_some() {
            return Ok(false);
        }
        *current = Some(hash.to_string());
        Ok(true)
    }

    fn save_admin_secret(&self, hash: &str) -> Result<(), CoreError> {
        *self.lock()? = Some(hash.to_string());
        Ok(())
    }
}

/// Newest first; ids break timestamp ties.
fn newest_first(a: &Visit, b: &Visit) -> std::cmp::Ordering {
    b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id))
}

impl VisitLog for InMemoryVisitLog {
    fn append(&self, visit: NewVisit) -> Result<VisitId, CoreError> {
        let mut visits = self
            .visits
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let id = VisitId(visits.len() as u64 + 1);
        visits.push(Visit::from_new(id, visit));
        Ok(id)
    }

    fn list_for(&self, token: &Token) -> Result<Vec<Visit>, CoreError> {
        let visits = self
            .visits
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let mut matching: Vec<_> = visits
            .iter()
            .filter(|v| v.link_token == *token)
            .cloned()
            .collect();
        matching.sort_by(newest_first);
        Ok(matching)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Visit>, CoreError> {
        let visits = self
            .visits
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let mut all: Vec<_> = visits.to_vec();
        all.sort_by(newest_first);
        Ok(all.into_iter().take(limit).collect())
    }
}
