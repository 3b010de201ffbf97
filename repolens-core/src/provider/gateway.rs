//! Managed multi-model gateway client (OpenRouter-style API)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};

use super::wire;
use super::{ChatOutcome, ChatRequest, ProviderClient};

/// Client for the managed gateway.
///
/// The gateway multiplexes many vendors behind one OpenAI-style endpoint;
/// model identifiers carry a vendor prefix ("anthropic/claude-3-haiku").
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    /// Create a gateway client from configuration
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .gateway_key()
            .ok_or_else(|| Error::Config("provider.gateway_api_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::Config(format!("invalid gateway api key: {}", e)))?,
        );

        // Gateway attribution headers, when configured
        if let Some(app_url) = &config.app_url {
            headers.insert(
                "HTTP-Referer",
                HeaderValue::from_str(app_url)
                    .map_err(|e| Error::Config(format!("invalid app_url: {}", e)))?,
            );
        }
        if let Some(app_name) = &config.app_name {
            headers.insert(
                "X-Title",
                HeaderValue::from_str(app_name)
                    .map_err(|e| Error::Config(format!("invalid app_name: {}", e)))?,
            );
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let base_url = config
            .gateway_base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::Gateway.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl ProviderClient for GatewayClient {
    fn tag(&self) -> &'static str {
        ProviderKind::Gateway.tag()
    }

    async fn chat_once(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = wire::build_request(request);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider {
                status: None,
                message: format!("gateway request failed: {}", e),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Provider {
            status: Some(status.as_u16()),
            message: format!("gateway read body failed: {}", e),
        })?;

        if !status.is_success() {
            return Err(wire::error_for_status(self.tag(), status.as_u16(), &text));
        }

        let parsed: wire::ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| Error::Provider {
                status: Some(status.as_u16()),
                message: format!("gateway returned unparseable body: {}", e),
            })?;

        wire::outcome_from_response(parsed, request, self.tag())
    }
}
