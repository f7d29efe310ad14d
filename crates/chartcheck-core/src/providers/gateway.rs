use super::transport::Transport;
use super::{GenerateRequest, Generation, ModelClient};
use crate::errors::GatewayError;
use crate::pricing::{Pricing, TokenUsage, UsageRecord};
use async_trait::async_trait;
use serde_json::{json, Value};

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub model_id: String,
    /// Used once when the primary model cannot serve a request.
    pub fallback_model_id: Option<String>,
    /// Provider minimum for server-side prompt caching, in tokens.
    pub min_cache_tokens: usize,
}

/// Rough token estimate used for the caching eligibility check.
pub fn estimated_tokens(text: &str) -> f64 {
    text.split_whitespace().count() as f64 * 1.3
}

/// Thread-safe client for the hosted model.
///
/// Holds no per-call state; concurrency safety comes from the transport,
/// which gives each in-flight call its own handle.
pub struct ModelGateway<T> {
    transport: T,
    settings: GatewaySettings,
    pricing: Pricing,
}

impl<T: Transport> ModelGateway<T> {
    pub fn new(transport: T, settings: GatewaySettings, pricing: Pricing) -> Self {
        Self {
            transport,
            settings,
            pricing,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Anthropic messages body. With the caching hint the system text becomes
    /// a block list marked `cache_control: ephemeral`.
    pub fn build_body(&self, req: &GenerateRequest) -> Value {
        let mut body = json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": req.prompt}],
            }],
        });
        if let Some(system) = req.system.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = if req.prompt_caching {
                json!([{
                    "type": "text",
                    "text": system,
                    "cache_control": {"type": "ephemeral"},
                }])
            } else {
                json!(system)
            };
        }
        body
    }

    fn warn_if_below_cache_minimum(&self, req: &GenerateRequest) {
        let Some(system) = req.system.as_deref().filter(|_| req.prompt_caching) else {
            return;
        };
        let estimate = estimated_tokens(system);
        if estimate < self.settings.min_cache_tokens as f64 {
            tracing::warn!(
                event = "prompt_cache_below_minimum",
                estimated_tokens = estimate.round() as u64,
                min_cache_tokens = self.settings.min_cache_tokens,
                "system text may be too short for prompt caching; sending anyway"
            );
        }
    }

    async fn invoke_with_fallback(&self, body: &Value) -> Result<(Value, String), GatewayError> {
        let primary = self.settings.model_id.as_str();
        match self.transport.invoke(primary, body).await {
            Ok(payload) => Ok((payload, primary.to_string())),
            Err(e) if e.is_capability_mismatch() => {
                let Some(fallback) = self
                    .settings
                    .fallback_model_id
                    .as_deref()
                    .filter(|f| *f != primary)
                else {
                    return Err(e);
                };
                tracing::warn!(
                    event = "model_fallback",
                    primary = %primary,
                    fallback = %fallback,
                    error = %e,
                    "primary model cannot serve request; retrying once on fallback"
                );
                let payload = self.transport.invoke(fallback, body).await?;
                Ok((payload, fallback.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Joins the text segments of a messages response. Any other shape is
/// returned serialized, with zeroed usage.
pub fn assemble_output(payload: &Value, model_id: &str, pricing: &Pricing) -> Generation {
    let segments = payload
        .get("content")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty());
    let Some(segments) = segments else {
        tracing::warn!(event = "model_unexpected_shape", model = %model_id);
        return Generation {
            text: payload.to_string(),
            usage: UsageRecord::priced(TokenUsage::default(), model_id, pricing),
        };
    };

    let text = segments
        .iter()
        .filter_map(|c| c.get("text").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let count = |k: &str| payload.pointer(&format!("/usage/{}", k)).and_then(Value::as_u64).unwrap_or(0);
    let tokens = TokenUsage {
        input_tokens: count("input_tokens"),
        output_tokens: count("output_tokens"),
        cache_write_tokens: count("cache_creation_input_tokens"),
        cache_read_tokens: count("cache_read_input_tokens"),
    };
    Generation {
        text,
        usage: UsageRecord::priced(tokens, model_id, pricing),
    }
}

#[async_trait]
impl<T: Transport> ModelClient for ModelGateway<T> {
    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, GatewayError> {
        self.warn_if_below_cache_minimum(req);
        let body = self.build_body(req);
        let (payload, served_by) = self.invoke_with_fallback(&body).await?;
        let generation = assemble_output(&payload, &served_by, &self.pricing);

        let u = &generation.usage;
        if u.cache_created() {
            tracing::debug!(event = "prompt_cache_write", tokens = u.tokens.cache_write_tokens);
        }
        if u.cache_hit() {
            tracing::debug!(event = "prompt_cache_read", tokens = u.tokens.cache_read_tokens);
        }
        tracing::info!(
            target: "chartcheck_billing",
            event = "model_usage",
            model = %u.model_id,
            input_tokens = u.tokens.input_tokens,
            output_tokens = u.tokens.output_tokens,
            cache_write_tokens = u.tokens.cache_write_tokens,
            cache_read_tokens = u.tokens.cache_read_tokens,
            cost_usd = u.total_cost(),
        );
        Ok(generation)
    }

    fn model_id(&self) -> &str {
        &self.settings.model_id
    }

    fn provider_name(&self) -> &'static str {
        "anthropic-messages"
    }
}
