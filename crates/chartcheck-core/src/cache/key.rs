use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sampling parameters that influence the response and therefore the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f64,
    /// Provider-specific knobs. Ordering never affects the key.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SamplingParams {
    pub fn new(max_tokens: u32, temperature: f64) -> Self {
        Self {
            max_tokens,
            temperature,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    prompt: &'a str,
    system_prompt: Option<&'a str>,
    params: &'a SamplingParams,
    model_id: &'a str,
}

/// Deterministic fingerprint of one model request.
///
/// The request is serialized as canonical JSON (RFC 8785: sorted keys, fixed
/// number formatting) and hashed with SHA-256.
pub fn cache_key(
    prompt: &str,
    system_prompt: Option<&str>,
    params: &SamplingParams,
    model_id: &str,
) -> String {
    let material = KeyMaterial {
        prompt,
        system_prompt,
        params,
        model_id,
    };
    let canonical = match serde_jcs::to_string(&material) {
        Ok(s) => s,
        // Non-finite floats are the only way canonicalization fails; fold them
        // into a stable textual form instead of dropping the request.
        Err(_) => format!(
            "{}\u{0}{}\u{0}{:?}\u{0}{}",
            prompt,
            system_prompt.unwrap_or(""),
            params,
            model_id
        ),
    };
    let mut h = Sha256::new();
    h.update(canonical.as_bytes());
    hex::encode(h.finalize())
}
