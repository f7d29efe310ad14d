pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
  key TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  response_text TEXT NOT NULL,
  usage_json TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_created ON response_cache(created_at);

CREATE TABLE IF NOT EXISTS cache_stats (
  kind TEXT PRIMARY KEY,
  hits INTEGER NOT NULL DEFAULT 0,
  misses INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cache_totals (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  evictions INTEGER NOT NULL DEFAULT 0,
  savings_usd REAL NOT NULL DEFAULT 0,
  prompt_cache_writes INTEGER NOT NULL DEFAULT 0,
  prompt_cache_reads INTEGER NOT NULL DEFAULT 0,
  prompt_cache_write_tokens INTEGER NOT NULL DEFAULT 0,
  prompt_cache_read_tokens INTEGER NOT NULL DEFAULT 0,
  prompt_cache_savings_usd REAL NOT NULL DEFAULT 0,
  last_updated TEXT
);
"#;
