use super::pool::HandlePool;
use crate::errors::GatewayError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Raw request/response exchange with the hosted model endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Value, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_size: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".into(),
            api_key: None,
            connect_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(180),
            pool_size: 4,
        }
    }
}

/// Posts request bodies to `{endpoint}/model/{model_id}/invoke`.
pub struct HttpTransport {
    endpoint: String,
    api_key: Option<String>,
    pool: HandlePool<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> Self {
        let connect = settings.connect_timeout;
        let read = settings.read_timeout;
        let pool = HandlePool::new(settings.pool_size, move || {
            Ok(reqwest::Client::builder()
                .connect_timeout(connect)
                .read_timeout(read)
                .build()?)
        });
        Self {
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            pool,
        }
    }

    pub fn pool(&self) -> &HandlePool<reqwest::Client> {
        &self.pool
    }

    pub fn url_for(&self, model_id: &str) -> String {
        format!("{}/model/{}/invoke", self.endpoint, model_id)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Value, GatewayError> {
        let client = self
            .pool
            .acquire()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let mut req = client
            .post(self.url_for(model_id))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(classify_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text, model_id));
        }
        resp.json::<Value>().await.map_err(classify_reqwest)
    }
}

fn classify_reqwest(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() || e.is_connect() {
        GatewayError::Transient(e.to_string())
    } else {
        GatewayError::Transport(e.to_string())
    }
}

/// Maps a non-success HTTP status and body to an error class.
pub fn classify_status(status: u16, body: &str, model_id: &str) -> GatewayError {
    let lower = body.to_lowercase();
    match status {
        408 | 429 | 500..=599 => GatewayError::Transient(format!("status {}: {}", status, body)),
        400 if lower.contains("inference profile")
            || lower.contains("on-demand throughput")
            || lower.contains("cache_control")
            || lower.contains("caching") =>
        {
            GatewayError::CapabilityMismatch {
                model: model_id.to_string(),
                message: body.to_string(),
            }
        }
        _ => GatewayError::Rejected {
            status,
            message: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_classified() {
        assert!(classify_status(429, "slow down", "m").is_transient());
        assert!(classify_status(503, "", "m").is_transient());
        assert!(classify_status(
            400,
            "ValidationException: Invocation with on-demand throughput isn't supported",
            "m"
        )
        .is_capability_mismatch());
        assert!(matches!(
            classify_status(400, "max_tokens too large", "m"),
            GatewayError::Rejected { status: 400, .. }
        ));
        assert!(matches!(
            classify_status(403, "denied", "m"),
            GatewayError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn url_has_no_double_slash() {
        let t = HttpTransport::new(HttpSettings {
            endpoint: "https://models.internal/".into(),
            ..Default::default()
        });
        assert_eq!(t.url_for("m-1"), "https://models.internal/model/m-1/invoke");
        assert_eq!(t.pool().created(), 0);
    }
}
