//! Deterministic per-token proxy rotation.
//!
//! Each call for a token bumps a counter; every `rotate_every` calls the
//! token moves to a new rotation step, and the step picks a candidate by
//! hashing `"<token>:<step>"`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::params;
use sha2::{Digest, Sha256};

use super::model::Proxy;
use super::store::StoreFactory;

/// Counter lifetime, measured from the first increment.
pub const DEFAULT_COUNTER_TTL: Duration = Duration::from_secs(86_400);

/// Candidates considered per pick.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 200;

/// Minimum score for rotation candidates.
pub const DEFAULT_MIN_SCORE: f64 = 20.0;

/// Per-token call counter with expiry.
pub trait TokenCounter: Send + Sync {
    /// Increment and return the new count. The first increment (or the first
    /// after expiry) returns 1 and starts a fresh TTL window.
    fn incr(&self, token: &str) -> Result<u64>;
}

/// Counters in the pool database, shared by every process using the same file.
pub struct SqliteTokenCounter {
    stores: StoreFactory,
    ttl: Duration,
}

impl SqliteTokenCounter {
    pub fn new(stores: StoreFactory, ttl: Duration) -> Self {
        Self { stores, ttl }
    }
}

impl TokenCounter for SqliteTokenCounter {
    fn incr(&self, token: &str) -> Result<u64> {
        let conn = self.stores.connection()?;
        let now = chrono::Utc::now().timestamp();
        let expires = now.saturating_add(i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX));
        let count: i64 = conn
            .query_row(
                "INSERT INTO token_counters (token, count, expires_at) VALUES (?1, 1, ?3)
                 ON CONFLICT(token) DO UPDATE SET
                   count = CASE WHEN expires_at <= ?2 THEN 1 ELSE count + 1 END,
                   expires_at = CASE WHEN expires_at <= ?2 THEN ?3 ELSE expires_at END
                 RETURNING count",
                params![token, now, expires],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to bump counter for token {token}"))?;
        Ok(u64::try_from(count).unwrap_or(1))
    }
}

/// Process-local counters.
pub struct MemoryTokenCounter {
    ttl: Duration,
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryTokenCounter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl TokenCounter for MemoryTokenCounter {
    fn incr(&self, token: &str) -> Result<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let entry = counters
            .entry(token.to_string())
            .or_insert((0, now + self.ttl));
        if entry.1 <= now {
            *entry = (0, now + self.ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Rotation step for the `count`-th call (1-based).
pub fn rotation_step(count: u64, rotate_every: i64) -> u64 {
    let every = u64::try_from(rotate_every).ok().filter(|n| *n > 0).unwrap_or(1);
    count.saturating_sub(1) / every
}

/// Candidate index for `token` at `step`: first four bytes of
/// SHA-256(`"<token>:<step>"`), big-endian, modulo `len`.
pub fn pick_index(token: &str, step: u64, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let digest = Sha256::digest(format!("{token}:{step}").as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Some(n as usize % len)
}

/// Picks one proxy per caller token.
pub struct RotationSelector {
    stores: StoreFactory,
    counter: Arc<dyn TokenCounter>,
    candidate_limit: usize,
}

impl RotationSelector {
    pub fn new(stores: StoreFactory, counter: Arc<dyn TokenCounter>, candidate_limit: usize) -> Self {
        Self {
            stores,
            counter,
            candidate_limit,
        }
    }

    /// Count this call for `token` and return its current proxy, if any
    /// candidate scores at least `min_score`. `rotate_every <= 0` means 1.
    pub fn rotated_proxy(
        &self,
        token: &str,
        rotate_every: i64,
        min_score: f64,
    ) -> Result<Option<Proxy>> {
        let count = self.counter.incr(token)?;
        let step = rotation_step(count, rotate_every);
        let mut candidates = self.stores.open()?.list(min_score, self.candidate_limit)?;
        let picked = pick_index(token, step, candidates.len()).map(|i| candidates.swap_remove(i));
        tracing::debug!(
            "rotation token={token} count={count} step={step} picked={:?}",
            picked.as_ref().map(|p| p.uri.as_str())
        );
        Ok(picked)
    }
}
