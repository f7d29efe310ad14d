use super::key::{cache_key, SamplingParams};
use super::stats::{CacheKind, CacheStats, HitMiss};
use crate::pricing::{Pricing, TokenUsage, UsageRecord};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Source of "now" for TTL decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: chrono::Duration,
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::hours(24),
            enabled: true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredUsage {
    tokens: TokenUsage,
    model_id: String,
}

struct Inner {
    conn: Connection,
    /// Counters as persisted when the store was opened or last flushed.
    baseline: CacheStats,
    /// Counters accumulated since then.
    pending: CacheStats,
}

/// Content-addressed, TTL-bound store of model responses.
///
/// The connection and every counter sit behind one mutex, so a stale-entry
/// delete and its eviction count are a single step. I/O failures never
/// escape `load`/`save`: they are logged and behave like a miss.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Mutex<Inner>>,
    settings: CacheSettings,
    pricing: Pricing,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn open(path: &Path, settings: CacheSettings, pricing: Pricing) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache db {}", path.display()))?;
        Self::from_connection(conn, settings, pricing)
    }

    /// Opens the store at `path`, falling back to an in-memory store when the
    /// file cannot be opened or is not a usable database. Entries then live
    /// for this process only.
    pub fn open_or_memory(
        path: &Path,
        settings: CacheSettings,
        pricing: Pricing,
    ) -> anyhow::Result<Self> {
        match Self::open(path, settings.clone(), pricing) {
            Ok(store) => Ok(store),
            Err(e) => {
                tracing::warn!(
                    event = "cache_io_error",
                    op = "open",
                    path = %path.display(),
                    error = %format!("{:#}", e),
                    fallback = "memory",
                );
                Self::memory(settings, pricing)
            }
        }
    }

    pub fn memory(settings: CacheSettings, pricing: Pricing) -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, settings, pricing)
    }

    fn from_connection(
        conn: Connection,
        settings: CacheSettings,
        pricing: Pricing,
    ) -> anyhow::Result<Self> {
        conn.execute_batch(super::schema::DDL)?;
        let mut baseline = CacheStats::default();
        baseline.merge(&read_persisted_stats(&conn)?);
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                baseline,
                pending: CacheStats::default(),
            })),
            settings,
            pricing,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn key(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: &SamplingParams,
        model_id: &str,
    ) -> String {
        cache_key(prompt, system_prompt, params, model_id)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the cached response and its usage, or `None` when absent,
    /// stale, disabled or unreadable. Stale rows are deleted here.
    pub fn load(&self, key: &str) -> Option<(String, UsageRecord)> {
        if !self.settings.enabled {
            return None;
        }
        let mut inner = self.lock();
        match self.load_locked(&mut inner, key) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    event = "cache_io_error",
                    op = "load",
                    key = %key,
                    error = %e,
                    "cache read failed, treating as miss"
                );
                None
            }
        }
    }

    fn load_locked(
        &self,
        inner: &mut Inner,
        key: &str,
    ) -> anyhow::Result<Option<(String, UsageRecord)>> {
        let row = inner
            .conn
            .query_row(
                "SELECT response_text, usage_json, created_at FROM response_cache WHERE key=?1",
                params![key],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((text, usage_json, created_at)) = row else {
            return Ok(None);
        };

        let age_ms = self.clock.now().timestamp_millis() - created_at;
        if age_ms >= self.settings.ttl.num_milliseconds() {
            inner
                .conn
                .execute("DELETE FROM response_cache WHERE key=?1", params![key])?;
            inner.pending.evictions += 1;
            tracing::debug!(event = "cache_evict", key = %key, age_ms, "stale cache entry removed");
            return Ok(None);
        }

        let stored: StoredUsage = serde_json::from_str(&usage_json)?;
        let usage = UsageRecord::priced(stored.tokens, stored.model_id, &self.pricing);
        Ok(Some((text, usage)))
    }

    /// Stores or overwrites the entry for `key`.
    pub fn save(&self, key: &str, kind: CacheKind, response: &str, usage: &UsageRecord) {
        if !self.settings.enabled {
            return;
        }
        let inner = self.lock();
        let res = (|| -> anyhow::Result<()> {
            let usage_json = serde_json::to_string(&StoredUsage {
                tokens: usage.tokens,
                model_id: usage.model_id.clone(),
            })?;
            inner.conn.execute(
                "INSERT INTO response_cache(key, kind, response_text, usage_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    kind=excluded.kind,
                    response_text=excluded.response_text,
                    usage_json=excluded.usage_json,
                    created_at=excluded.created_at",
                params![
                    key,
                    kind.as_str(),
                    response,
                    usage_json,
                    self.clock.now().timestamp_millis()
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = res {
            tracing::warn!(
                event = "cache_io_error",
                op = "save",
                key = %key,
                error = %e,
                "cache write failed, entry not stored"
            );
        }
    }

    pub fn record_hit(&self, kind: CacheKind, hit: bool, savings_usd: f64) {
        let mut inner = self.lock();
        let hm = inner.pending.by_kind.entry(kind).or_insert_with(HitMiss::default);
        if hit {
            hm.hits += 1;
        } else {
            hm.misses += 1;
        }
        if hit {
            inner.pending.savings_usd += savings_usd;
        }
    }

    /// Records server-side prompt cache activity for one call.
    pub fn record_prompt_cache(&self, write_tokens: u64, read_tokens: u64, savings_usd: f64) {
        if write_tokens == 0 && read_tokens == 0 {
            return;
        }
        let mut inner = self.lock();
        let pc = &mut inner.pending.prompt_cache;
        if write_tokens > 0 {
            pc.writes += 1;
            pc.write_tokens += write_tokens;
        }
        if read_tokens > 0 {
            pc.reads += 1;
            pc.read_tokens += read_tokens;
            pc.savings_usd += savings_usd;
        }
    }

    /// Removes every entry older than the TTL, whatever its kind. Returns the
    /// number of rows removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.lock();
        let cutoff = self.clock.now().timestamp_millis() - self.settings.ttl.num_milliseconds();
        let removed = inner
            .conn
            .execute("DELETE FROM response_cache WHERE created_at <= ?1", params![cutoff]);
        match removed {
            Ok(n) => {
                inner.pending.evictions += n as u64;
                if n > 0 {
                    tracing::info!(event = "cache_cleanup", removed = n, "expired cache entries removed");
                }
                n
            }
            Err(e) => {
                tracing::warn!(event = "cache_io_error", op = "cleanup", error = %e, "cache cleanup failed");
                0
            }
        }
    }

    /// Number of stored entries, fresh or stale.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner
            .conn
            .query_row("SELECT COUNT(*) FROM response_cache", [], |r| r.get::<_, i64>(0))
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persisted counters merged with everything recorded since.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut s = inner.baseline.clone();
        s.merge(&inner.pending);
        s
    }

    /// Adds the counters recorded since the last flush to the persisted
    /// record. Other processes' flushes are preserved.
    pub fn flush_stats(&self) -> anyhow::Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = self.clock.now().to_rfc3339();
        let p = &inner.pending;

        let tx = inner.conn.transaction()?;
        for (kind, hm) in &p.by_kind {
            tx.execute(
                "INSERT INTO cache_stats(kind, hits, misses) VALUES (?1, ?2, ?3)
                 ON CONFLICT(kind) DO UPDATE SET
                    hits = hits + excluded.hits,
                    misses = misses + excluded.misses",
                params![kind.as_str(), hm.hits as i64, hm.misses as i64],
            )?;
        }
        tx.execute(
            "INSERT INTO cache_totals(id, evictions, savings_usd, prompt_cache_writes,
                prompt_cache_reads, prompt_cache_write_tokens, prompt_cache_read_tokens,
                prompt_cache_savings_usd, last_updated)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                evictions = evictions + excluded.evictions,
                savings_usd = savings_usd + excluded.savings_usd,
                prompt_cache_writes = prompt_cache_writes + excluded.prompt_cache_writes,
                prompt_cache_reads = prompt_cache_reads + excluded.prompt_cache_reads,
                prompt_cache_write_tokens = prompt_cache_write_tokens + excluded.prompt_cache_write_tokens,
                prompt_cache_read_tokens = prompt_cache_read_tokens + excluded.prompt_cache_read_tokens,
                prompt_cache_savings_usd = prompt_cache_savings_usd + excluded.prompt_cache_savings_usd,
                last_updated = excluded.last_updated",
            params![
                p.evictions as i64,
                p.savings_usd,
                p.prompt_cache.writes as i64,
                p.prompt_cache.reads as i64,
                p.prompt_cache.write_tokens as i64,
                p.prompt_cache.read_tokens as i64,
                p.prompt_cache.savings_usd,
                now
            ],
        )?;
        tx.commit()?;

        let mut flushed = std::mem::take(&mut inner.pending);
        flushed.last_updated = Some(now);
        inner.baseline.merge(&flushed);
        Ok(())
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("settings", &self.settings)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

fn read_persisted_stats(conn: &Connection) -> anyhow::Result<CacheStats> {
    let mut stats = CacheStats::default();
    let mut stmt = conn.prepare("SELECT kind, hits, misses FROM cache_stats")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let kind: String = row.get(0)?;
        let Some(kind) = CacheKind::parse(&kind) else {
            continue;
        };
        stats.by_kind.insert(
            kind,
            HitMiss {
                hits: row.get::<_, i64>(1)? as u64,
                misses: row.get::<_, i64>(2)? as u64,
            },
        );
    }

    let totals = conn
        .query_row(
            "SELECT evictions, savings_usd, prompt_cache_writes, prompt_cache_reads,
                    prompt_cache_write_tokens, prompt_cache_read_tokens,
                    prompt_cache_savings_usd, last_updated
             FROM cache_totals WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, f64>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;
    if let Some((ev, sav, w, rd, wt, rt, psav, last)) = totals {
        stats.evictions = ev as u64;
        stats.savings_usd = sav;
        stats.prompt_cache.writes = w as u64;
        stats.prompt_cache.reads = rd as u64;
        stats.prompt_cache.write_tokens = wt as u64;
        stats.prompt_cache.read_tokens = rt as u64;
        stats.prompt_cache.savings_usd = psav;
        stats.last_updated = last;
    }
    Ok(stats)
}
