pub mod key;
pub mod schema;
pub mod stats;
pub mod store;

pub use key::{cache_key, SamplingParams};
pub use stats::{CacheKind, CacheStats, HitMiss, PromptCacheStats};
pub use store::{CacheSettings, CacheStore, Clock, SystemClock};
