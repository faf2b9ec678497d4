//! HTTP text-generation client.
//!
//! Posts `{system, user, model, options}` as JSON to a configured endpoint and
//! expects `{content, usage?}` back. Provider-specific adapters live behind
//! that endpoint, not here.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{GenerationError, GenerationRequest, GenerationResponse, TextGeneration};
use crate::metrics::METRICS;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Generation endpoint configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Transport timeout for a single call.
    pub timeout: Duration,
}

impl GenerationConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - EVOLVE_GENERATION_URL (required)
    /// - EVOLVE_GENERATION_API_KEY (optional)
    /// - EVOLVE_GENERATION_MODEL (optional)
    /// - EVOLVE_GENERATION_TIMEOUT_SECS (optional, default: 120)
    pub fn from_env() -> std::result::Result<Self, GenerationError> {
        let endpoint = std::env::var("EVOLVE_GENERATION_URL").map_err(|_| {
            GenerationError::NotConfigured("EVOLVE_GENERATION_URL not set".to_string())
        })?;
        let mut config = Self::new(endpoint);
        config.api_key = std::env::var("EVOLVE_GENERATION_API_KEY").ok();
        config.model = std::env::var("EVOLVE_GENERATION_MODEL").ok();
        if let Some(secs) = std::env::var("EVOLVE_GENERATION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    system: &'a str,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a serde_json::Value>,
}

/// [`TextGeneration`] over a JSON HTTP endpoint.
pub struct HttpTextGeneration {
    config: GenerationConfig,
    http_client: reqwest::Client,
}

impl HttpTextGeneration {
    pub fn new(config: GenerationConfig) -> std::result::Result<Self, GenerationError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("evolve-core/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn from_env() -> std::result::Result<Self, GenerationError> {
        Self::new(GenerationConfig::from_env()?)
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }
}

#[async_trait]
impl TextGeneration for HttpTextGeneration {
    #[instrument(skip(self, request), fields(endpoint = %self.config.endpoint))]
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        METRICS.inc_generation_calls();

        let body = WireRequest {
            system: &request.system,
            user: &request.user,
            model: self.config.model.as_deref(),
            options: request.options.as_ref(),
        };
        let mut builder = self.http_client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerationResponse = response.json().await?;
        debug!(
            tokens = parsed.usage.total(),
            chars = parsed.content.len(),
            "generation complete"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = GenerationConfig::new("http://localhost:9000/generate")
            .with_api_key("k")
            .with_model("m")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert_eq!(config.model.as_deref(), Some("m"));
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn wire_request_omits_empty_fields() {
        let body = WireRequest {
            system: "s",
            user: "u",
            model: None,
            options: None,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json, serde_json::json!({"system": "s", "user": "u"}));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let client = HttpTextGeneration::new(
            GenerationConfig::new("http://127.0.0.1:9/generate")
                .with_timeout(Duration::from_millis(500)),
        )
        .expect("client");
        let err = client
            .generate(GenerationRequest::new("s", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Transport(_)));
    }
}
