//! Direct vendor API client (OpenAI-style API)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};

use super::wire;
use super::{ChatOutcome, ChatRequest, ProviderClient};

/// Client for the direct vendor API.
///
/// Model identifiers are bare ("gpt-4o-mini"); gateway-prefixed identifiers
/// are stripped so runtime settings can name models either way.
pub struct DirectClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectClient {
    /// Create a direct-vendor client from configuration
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .direct_key()
            .ok_or_else(|| Error::Config("provider.direct_api_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::Config(format!("invalid direct api key: {}", e)))?,
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let base_url = config
            .direct_base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::Direct.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self { http, base_url })
    }

    /// Strip a gateway vendor prefix ("openai/gpt-4o-mini" -> "gpt-4o-mini")
    fn vendor_model(model: &str) -> &str {
        model.rsplit_once('/').map(|(_, m)| m).unwrap_or(model)
    }
}

#[async_trait]
impl ProviderClient for DirectClient {
    fn tag(&self) -> &'static str {
        ProviderKind::Direct.tag()
    }

    async fn chat_once(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = wire::build_request(request);
        body.model = Self::vendor_model(&request.model).to_string();

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider {
                status: None,
                message: format!("direct request failed: {}", e),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Provider {
            status: Some(status.as_u16()),
            message: format!("direct read body failed: {}", e),
        })?;

        if !status.is_success() {
            return Err(wire::error_for_status(self.tag(), status.as_u16(), &text));
        }

        let parsed: wire::ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| Error::Provider {
                status: Some(status.as_u16()),
                message: format!("direct returned unparseable body: {}", e),
            })?;

        wire::outcome_from_response(parsed, request, self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_prefixes_are_stripped() {
        assert_eq!(DirectClient::vendor_model("openai/gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(DirectClient::vendor_model("gpt-4o"), "gpt-4o");
    }
}
