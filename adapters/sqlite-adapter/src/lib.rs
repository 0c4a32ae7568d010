//! sqlite-adapter: SQLite implementation of the `LinkRegistry`, `VisitLog`
//! and `AdminSecretStore` ports.
//!
//! Purpose
//! - Provide a file-based durable store for links and visits.
//! - Make `transition` a single conditional `UPDATE`/`DELETE`, so the
//!   compare-and-swap is enforced by SQLite itself and holds across processes
//!   sharing the same database file.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Stores timestamps as milliseconds since UNIX_EPOCH.
//! - Visits carry no foreign key: they outlive deleted links.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::{
    AdminSecretStore, CoreError, Link, LinkMode, LinkRegistry, LinkStatus, NewVisit, Token, Visit, VisitId,
    VisitLog, VisitOutcome,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// How long a writer waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LINK_COLUMNS: &str = "token, target_url, mode, status, created_at, status_changed_at";
const VISIT_COLUMNS: &str = "id, link_token, ip, user_agent, visited_at, outcome";

/// SQLite-backed link registry and visit log.
pub struct SqliteStore {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqerr)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqerr)?;
        // WAL lets readers proceed while a redemption commits
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))
            .map_err(map_sqerr)?;
        init_schema(&conn)?;
        info!(path = %path.as_ref().display(), "sqlite store opened");
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    /// Open at `path`, creating missing parent directories first.
    pub fn open_creating_dirs<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| CoreError::Repository(format!("create db dir: {e}")))?;
            }
        }
        Self::new(path)
    }

    /// Close the underlying connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<(), CoreError> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        conn.close().map_err(|(_, e)| map_sqerr(e))?;
        info!("sqlite store closed");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            token TEXT PRIMARY KEY,
            target_url TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            status_changed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_links_created_at ON links(created_at);
        CREATE TABLE IF NOT EXISTS visits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            link_token TEXT NOT NULL,
            ip TEXT NOT NULL,
            user_agent TEXT NOT NULL,
            visited_at INTEGER NOT NULL,
            outcome TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_visits_link_token ON visits(link_token, visited_at);
        CREATE INDEX IF NOT EXISTS idx_visits_visited_at ON visits(visited_at);
        CREATE TABLE IF NOT EXISTS admin_secret (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            password_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(map_sqerr)
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

fn system_time_to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

fn millis_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

fn row_to_link(row: &rusqlite::Row) -> Result<Link, CoreError> {
    let token: String = row.get(0).map_err(map_sqerr)?;
    let target_url: String = row.get(1).map_err(map_sqerr)?;
    let mode: String = row.get(2).map_err(map_sqerr)?;
    let status: String = row.get(3).map_err(map_sqerr)?;
    let created_at: i64 = row.get(4).map_err(map_sqerr)?;
    let status_changed_at: Option<i64> = row.get(5).map_err(map_sqerr)?;

    Ok(Link {
        token: Token::new(token)
            .map_err(|e| CoreError::Repository(format!("bad token in db: {e}")))?,
        target_url,
        mode: LinkMode::parse(&mode)
            .ok_or_else(|| CoreError::Repository(format!("bad mode in db: {mode}")))?,
        status: LinkStatus::parse(&status)
            .ok_or_else(|| CoreError::Repository(format!("bad status in db: {status}")))?,
        created_at: millis_to_system_time(created_at),
        status_changed_at: status_changed_at.map(millis_to_system_time),
    })
}

fn row_to_visit(row: &rusqlite::Row) -> Result<Visit, CoreError> {
    let id: i64 = row.get(0).map_err(map_sqerr)?;
    let token: String = row.get(1).map_err(map_sqerr)?;
    let ip: String = row.get(2).map_err(map_sqerr)?;
    let user_agent: String = row.get(3).map_err(map_sqerr)?;
    let visited_at: i64 = row.get(4).map_err(map_sqerr)?;
    let outcome: String = row.get(5).map_err(map_sqerr)?;

    Ok(Visit {
        id: VisitId(id as u64),
        link_token: Token::new(token)
            .map_err(|e| CoreError::Repository(format!("bad token in db: {e}")))?,
        ip,
        user_agent,
        timestamp: millis_to_system_time(visited_at),
        outcome: VisitOutcome::parse(&outcome)
            .ok_or_else(|| CoreError::Repository(format!("bad outcome in db: {outcome}")))?,
    })
}

impl LinkRegistry for SqliteStore {
    fn insert(&self, link: Link) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let res = conn.execute(
            "INSERT INTO links(token, target_url, mode, status, created_at, status_changed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                link.token.as_str(),
                link.target_url,
                link.mode.as_str(),
                link.status.as_str(),
                system_time_to_millis(link.created_at),
                link.status_changed_at.map(system_time_to_millis),
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(CoreError::TokenCollision)
            }
            Err(e) => Err(map_sqerr(e)),
        }
    }

    fn get(&self, token: &Token) -> Result<Option<Link>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {LINK_COLUMNS} FROM links WHERE token = ?1"))
            .map_err(map_sqerr)?;
        let mut rows = stmt.query(params![token.as_str()]).map_err(map_sqerr)?;
        if let Some(row) = rows.next().map_err(map_sqerr)? {
            Ok(Some(row_to_link(row)?))
        } else {
            Ok(None)
        }
    }

    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LINK_COLUMNS} FROM links ORDER BY created_at DESC, rowid DESC"
            ))
            .map_err(map_sqerr)?;
        let mut rows = stmt.query([]).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_link(row)?);
        }
        Ok(out)
    }

    fn transition(
        &self,
        token: &Token,
        expected: LinkStatus,
        new: LinkStatus,
        at: SystemTime,
    ) -> Result<(), CoreError> {
        let conn = self.lock()?;
        // The status predicate in the WHERE clause is the compare half of the CAS
        let changed = (if new == LinkStatus::Deleted {
            conn.execute(
                "DELETE FROM links WHERE token = ?1 AND status = ?2",
                params![token.as_str(), expected.as_str()],
            )
        } else {
            conn.execute(
                "UPDATE links SET status = ?1, status_changed_at = ?2 WHERE token = ?3 AND status = ?4",
                params![
                    new.as_str(),
                    system_time_to_millis(at),
                    token.as_str(),
                    expected.as_str()
                ],
            )
        })
        .map_err(map_sqerr)?;
        if changed == 1 {
            return Ok(());
        }

        let exists = conn
            .query_row(
                "SELECT 1 FROM links WHERE token = ?1",
                params![token.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(map_sqerr)?
            .is_some();
        if exists {
            Err(CoreError::Conflict)
        } else {
            Err(CoreError::NotFound)
        }
    }
}

impl VisitLog for SqliteStore {
    fn append(&self, visit: NewVisit) -> Result<VisitId, CoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO visits(link_token, ip, user_agent, visited_at, outcome) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                visit.link_token.as_str(),
                visit.ip,
                visit.user_agent,
                system_time_to_millis(visit.timestamp),
                visit.outcome.as_str(),
            ],
        )
        .map_err(map_sqerr)?;
        Ok(VisitId(conn.last_insert_rowid() as u64))
    }

    fn list_for(&self, token: &Token) -> Result<Vec<Visit>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {VISIT_COLUMNS} FROM visits WHERE link_token = ?1 ORDER BY visited_at DESC, id DESC"
            ))
            .map_err(map_sqerr)?;
        let mut rows = stmt.query(params![token.as_str()]).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_visit(row)?);
        }
        Ok(out)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Visit>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {VISIT_COLUMNS} FROM visits ORDER BY visited_at DESC, id DESC LIMIT ?1"
            ))
            .map_err(map_sqerr)?;
        let mut rows = stmt.query(params![limit as i64]).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_visit(row)?);
        }
        Ok(out)
    }
}

impl AdminSecretStore for SqliteStore {
    fn load_admin_secret(&self) -> Result<Option<String>, CoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT password_hash FROM admin_secret WHERE id = 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(map_sqerr)
    }

    fn seed_admin_secret(&self, hash: &str) -> Result<bool, CoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO admin_secret(id, password_hash, updated_at) VALUES (1, ?1, ?2)",
                params![hash, system_time_to_millis(SystemTime::now())],
            )
            .map_err(map_sqerr)?;
        Ok(inserted == 1)
    }

    fn save_admin_secret(&self, hash: &str) -> Result<(), CoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO admin_secret(id, password_hash, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET password_hash = excluded.password_hash, updated_at = excluded.updated_at",
            params![hash, system_time_to_millis(SystemTime::now())],
        )
        .map_err(map_sqerr)?;
        info!("admin secret updated");
        Ok(())
    }
}
