use crate::cache::{CacheKind, CacheStore, SamplingParams};
use crate::errors::GatewayError;
use crate::pricing::UsageRecord;
use crate::providers::{GenerateRequest, ModelClient};
use crate::usage::UsageAccumulator;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Total attempts for one request, including the first.
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Multiplied by the attempt number between retries.
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(240),
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub text: String,
    pub usage: UsageRecord,
    pub cached: bool,
    /// Live attempts made; zero for a cache hit.
    pub attempts: u32,
}

/// A model call that gave up, with the live attempts it made.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CallFailure {
    pub error: GatewayError,
    pub attempts: u32,
}

/// Answers from the cache when possible, otherwise calls the model with
/// bounded retries on transient failures and stores the answer.
///
/// Cache hits are not added to `usage`: the spend they represent is counted
/// as savings instead.
pub async fn cached_generate(
    client: &dyn ModelClient,
    cache: &CacheStore,
    usage: &UsageAccumulator,
    kind: CacheKind,
    req: &GenerateRequest,
    policy: &CallPolicy,
) -> Result<CallOutcome, CallFailure> {
    let params = SamplingParams::new(req.max_tokens, req.temperature);
    let key = cache.key(&req.prompt, req.system.as_deref(), &params, client.model_id());

    if let Some((text, record)) = cache.load(&key) {
        cache.record_hit(kind, true, record.total_cost());
        tracing::info!(
            event = "cache_hit",
            kind = %kind,
            key = %&key[..16],
            saved_usd = record.total_cost(),
        );
        return Ok(CallOutcome {
            text,
            usage: record,
            cached: true,
            attempts: 0,
        });
    }
    cache.record_hit(kind, false, 0.0);

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout, client.generate(req)).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Transient(format!(
                "model call timed out after {}s",
                policy.timeout.as_secs_f64()
            ))),
        };
        match result {
            Ok(generation) => {
                let u = &generation.usage;
                usage.accumulate(u);
                cache.record_prompt_cache(
                    u.tokens.cache_write_tokens,
                    u.tokens.cache_read_tokens,
                    usage.pricing().prompt_cache_savings(&u.tokens),
                );
                cache.save(&key, kind, &generation.text, u);
                return Ok(CallOutcome {
                    text: generation.text,
                    usage: generation.usage,
                    cached: false,
                    attempts: attempt,
                });
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    event = "model_retry",
                    kind = %kind,
                    attempt,
                    max_attempts,
                    error = %e,
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(error) => {
                return Err(CallFailure {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}
