pub mod gateway;
pub mod pool;
pub mod transport;

pub use gateway::{GatewaySettings, ModelGateway};
pub use pool::{HandlePool, PooledHandle};
pub use transport::{HttpSettings, HttpTransport, Transport};

use crate::errors::GatewayError;
use crate::pricing::UsageRecord;
use async_trait::async_trait;

/// One generation request, as the caller sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Ask the provider to cache the system text server-side.
    pub prompt_caching: bool,
}

/// Model output plus the usage of the call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// `model_id` is the model that served the call, which differs from the
    /// requested one after a fallback.
    pub usage: UsageRecord,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, GatewayError>;

    /// Model requested by default; part of every cache key.
    fn model_id(&self) -> &str;

    fn provider_name(&self) -> &'static str;
}
