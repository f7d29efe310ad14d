use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which flow a cached response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Extraction,
    Evaluation,
    Improvement,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Extraction => "extraction",
            CacheKind::Evaluation => "evaluation",
            CacheKind::Improvement => "improvement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(CacheKind::Extraction),
            "evaluation" => Some(CacheKind::Evaluation),
            "improvement" => Some(CacheKind::Improvement),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitMiss {
    pub hits: u64,
    pub misses: u64,
}

impl HitMiss {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }
}

/// Server-side prompt cache activity reported by the model provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptCacheStats {
    pub writes: u64,
    pub reads: u64,
    pub write_tokens: u64,
    pub read_tokens: u64,
    pub savings_usd: f64,
}

impl PromptCacheStats {
    pub fn hit_rate(&self) -> f64 {
        match self.writes + self.reads {
            0 => 0.0,
            n => self.reads as f64 / n as f64,
        }
    }
}

/// Counters for both cache layers. Merging is additive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub by_kind: BTreeMap<CacheKind, HitMiss>,
    pub evictions: u64,
    /// Spend avoided by answering from the response cache.
    pub savings_usd: f64,
    pub prompt_cache: PromptCacheStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl CacheStats {
    pub fn kind(&self, kind: CacheKind) -> HitMiss {
        self.by_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn overall(&self) -> HitMiss {
        self.by_kind.values().fold(HitMiss::default(), |acc, hm| HitMiss {
            hits: acc.hits + hm.hits,
            misses: acc.misses + hm.misses,
        })
    }

    pub fn hit_rate(&self) -> f64 {
        self.overall().hit_rate()
    }

    pub fn merge(&mut self, other: &CacheStats) {
        for (kind, hm) in &other.by_kind {
            let e = self.by_kind.entry(*kind).or_default();
            e.hits += hm.hits;
            e.misses += hm.misses;
        }
        self.evictions += other.evictions;
        self.savings_usd += other.savings_usd;
        self.prompt_cache.writes += other.prompt_cache.writes;
        self.prompt_cache.reads += other.prompt_cache.reads;
        self.prompt_cache.write_tokens += other.prompt_cache.write_tokens;
        self.prompt_cache.read_tokens += other.prompt_cache.read_tokens;
        self.prompt_cache.savings_usd += other.prompt_cache.savings_usd;
        if other.last_updated > self.last_updated {
            self.last_updated = other.last_updated.clone();
        }
    }
}
