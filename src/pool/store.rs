//! SQLite-backed proxy repository.
//!
//! Handles are short-lived: callers go through [`StoreFactory::open`] for
//! each logical operation and drop (or [`ProxyStore::close`]) the handle
//! when done. No transaction is held across a probe cycle.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::model::{Proxy, ProxyStatus};
use super::scoring;

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    CREATE TABLE IF NOT EXISTS proxies (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        uri            TEXT NOT NULL UNIQUE,
        scheme         TEXT NOT NULL,
        host           TEXT NOT NULL,
        port           INTEGER NOT NULL,
        label          TEXT,
        status         TEXT NOT NULL DEFAULT 'unknown',
        score          REAL NOT NULL DEFAULT 50.0,
        success_count  INTEGER NOT NULL DEFAULT 0,
        fail_count     INTEGER NOT NULL DEFAULT 0,
        avg_latency_ms REAL NOT NULL DEFAULT -1.0,
        last_checked   TEXT,
        last_ok        TEXT,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_proxies_score ON proxies(score DESC, id ASC);
    CREATE TABLE IF NOT EXISTS token_counters (
        token      TEXT PRIMARY KEY,
        count      INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );";

const SELECT_COLUMNS: &str = "id, uri, scheme, host, port, label, status, score, success_count, \
     fail_count, avg_latency_ms, last_checked, last_ok, created_at, updated_at";

/// Opens short-lived handles on one database file.
#[derive(Debug, Clone)]
pub struct StoreFactory {
    path: PathBuf,
}

impl StoreFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a repository handle, creating the schema on first use.
    pub fn open(&self) -> Result<ProxyStore> {
        Ok(ProxyStore {
            conn: self.connection()?,
        })
    }

    /// Run `f` against a fresh handle on the blocking pool, closing it afterwards.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ProxyStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let factory = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut store = factory.open()?;
            let out = f(&mut store)?;
            store.close()?;
            Ok(out)
        })
        .await
        .context("pool database task panicked")?
    }

    /// Raw connection with the schema applied; used by the token counter.
    pub fn connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open pool database {}", self.path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialise pool database schema")?;
        Ok(conn)
    }
}

/// Repository over the `proxies` table.
pub struct ProxyStore {
    conn: Connection,
}

impl ProxyStore {
    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialise pool database schema")?;
        Ok(Self { conn })
    }

    /// Insert new entries or refresh identity fields of existing ones.
    /// Health fields of existing rows are never touched.
    pub fn upsert_many(&mut self, proxies: &[Proxy]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().context("failed to begin upsert")?;
        let mut count = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO proxies (uri, scheme, host, port, label, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(uri) DO UPDATE SET
                   scheme=excluded.scheme,
                   host=excluded.host,
                   port=excluded.port,
                   label=excluded.label,
                   updated_at=excluded.updated_at",
            )?;
            for p in proxies {
                stmt.execute(params![p.uri, p.scheme, p.host, p.port, p.label, now])
                    .with_context(|| format!("failed to upsert {}", p.uri))?;
                count += 1;
            }
        }
        tx.commit().context("failed to commit upsert")?;
        Ok(count)
    }

    /// Entries with `score >= min_score`, best first, ties in insertion order.
    pub fn list(&self, min_score: f64, limit: usize) -> Result<Vec<Proxy>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM proxies
             WHERE score >= ?1 ORDER BY score DESC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![min_score, limit], row_to_proxy)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read proxy row")?);
        }
        Ok(out)
    }

    pub fn get_by_uri(&self, uri: &str) -> Result<Option<Proxy>> {
        self.conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM proxies WHERE uri = ?1"),
                [uri],
                row_to_proxy,
            )
            .optional()
            .with_context(|| format!("failed to load {uri}"))
    }

    /// Record one probe outcome. Unknown uris are ignored (`Ok(None)`).
    pub fn update_health(
        &mut self,
        uri: &str,
        ok: bool,
        latency_ms: Option<f64>,
    ) -> Result<Option<Proxy>> {
        let tx = self.conn.transaction().context("failed to begin health update")?;
        let current = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM proxies WHERE uri = ?1"),
                [uri],
                row_to_proxy,
            )
            .optional()?;
        let Some(mut proxy) = current else {
            return Ok(None);
        };

        let now = Utc::now();
        scoring::apply_outcome(&mut proxy, ok, latency_ms, now);
        tx.execute(
            "UPDATE proxies SET status=?1, score=?2, success_count=?3, fail_count=?4,
               avg_latency_ms=?5, last_checked=?6, last_ok=?7, updated_at=?8
             WHERE uri=?9",
            params![
                proxy.status.as_str(),
                proxy.score,
                count_to_sql(proxy.success_count),
                count_to_sql(proxy.fail_count),
                proxy.avg_latency_ms,
                proxy.last_checked.map(|t| t.to_rfc3339()),
                proxy.last_ok.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
                uri,
            ],
        )
        .with_context(|| format!("failed to update health of {uri}"))?;
        tx.commit().context("failed to commit health update")?;
        proxy.updated_at = Some(now);
        Ok(Some(proxy))
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM proxies", [], |r| r.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    /// Release the handle, surfacing any close error.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| anyhow::anyhow!("failed to close pool database: {e}"))
    }
}

fn count_to_sql(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_proxy(row: &Row<'_>) -> rusqlite::Result<Proxy> {
    let status: String = row.get(6)?;
    let success: i64 = row.get(8)?;
    let fail: i64 = row.get(9)?;
    let port: i64 = row.get(4)?;
    Ok(Proxy {
        id: row.get(0)?,
        uri: row.get(1)?,
        scheme: row.get(2)?,
        host: row.get(3)?,
        port: u16::try_from(port).unwrap_or(0),
        label: row.get(5)?,
        status: status.parse().unwrap_or(ProxyStatus::Unknown),
        score: row.get(7)?,
        success_count: u64::try_from(success).unwrap_or(0),
        fail_count: u64::try_from(fail).unwrap_or(0),
        avg_latency_ms: row.get(10)?,
        last_checked: parse_time(row.get(11)?),
        last_ok: parse_time(row.get(12)?),
        created_at: parse_time(row.get(13)?),
        updated_at: parse_time(row.get(14)?),
    })
}
