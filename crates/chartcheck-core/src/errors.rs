use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Failure classes surfaced by a model call.
///
/// Only `Transient` is retried by callers; `CapabilityMismatch` is consumed by
/// the gateway's one-shot fallback and only escapes when no fallback model is
/// configured.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient model failure: {0}")]
    Transient(String),

    #[error("model '{model}' cannot serve this request: {message}")]
    CapabilityMismatch { model: String, message: String },

    #[error("model call rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self, GatewayError::CapabilityMismatch { .. })
    }
}

/// Why a target's verdict could not be recovered from model output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryFailure {
    #[error("No JSON object found in response")]
    NoCandidate,

    #[error("Missing '{0}' in response")]
    TargetMissing(String),

    #[error("Invalid response structure: {0}")]
    InvalidStructure(String),
}
