//! AI provider abstraction
//!
//! A single [`ProviderClient`] capability with two implementations: the
//! managed multi-model gateway ([`GatewayClient`]) and the direct vendor API
//! ([`DirectClient`]). Selection is configuration-driven; a `direct`
//! preference without a credential falls back to the gateway. All calls go
//! through [`execute`], which applies the shared backoff-retry policy.

pub mod direct;
pub mod gateway;
pub mod retry;
pub mod wire;

pub use direct::DirectClient;
pub use gateway::GatewayClient;
pub use retry::{with_backoff, RetryPolicy};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// One chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System role text
    pub system_prompt: String,
    /// User role text (the assembled analysis prompt)
    pub user_prompt: String,
    /// Model identifier, in the serving backend's naming
    pub model: String,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token cap
    pub max_tokens: Option<u32>,
    /// Function-calling contract; set only for structured extraction
    pub tool: Option<ToolContract>,
}

/// A function-calling contract forced via `tool_choice`.
#[derive(Debug, Clone)]
pub struct ToolContract {
    pub name: String,
    pub description: String,
    /// JSON Schema for the function arguments
    pub parameters: serde_json::Value,
}

/// Result of a chat-completion call, normalized across backends.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Assistant message content (may be empty for tool-call responses)
    pub content: String,
    /// Raw JSON arguments of the first tool call, when one was made
    pub tool_arguments: Option<String>,
    /// Prompt tokens, provider-reported or estimated
    pub input_tokens: i64,
    /// Completion tokens, provider-reported or estimated
    pub output_tokens: i64,
    /// Model that served the call (response-reported when available)
    pub model: String,
    /// Ledger tag of the serving backend
    pub provider: &'static str,
}

/// Chat-completion capability implemented by both backends.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Ledger tag for this backend
    fn tag(&self) -> &'static str;

    /// One attempt, no retry; [`execute`] adds the retry policy
    async fn chat_once(&self, request: &ChatRequest) -> Result<ChatOutcome>;
}

/// Build the configured client.
///
/// Falls back to the gateway when the direct vendor's credential is absent,
/// since the gateway can serve any registered model.
pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn ProviderClient>> {
    match config.kind {
        ProviderKind::Direct => {
            if config.direct_key().is_some() {
                Ok(Arc::new(DirectClient::new(config)?))
            } else {
                tracing::warn!("Direct provider selected without a credential; using gateway");
                Ok(Arc::new(GatewayClient::new(config)?))
            }
        }
        ProviderKind::Gateway => Ok(Arc::new(GatewayClient::new(config)?)),
    }
}

/// Execute a chat call with the standard retry policy.
pub async fn execute(client: &dyn ProviderClient, request: &ChatRequest) -> Result<ChatOutcome> {
    with_backoff(&RetryPolicy::default(), Error::is_retryable, || {
        client.chat_once(request)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    fn config_with(gateway: Option<&str>, direct: Option<&str>, kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            kind,
            gateway_api_key: gateway.map(str::to_string),
            direct_api_key: direct.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn direct_without_credential_falls_back_to_gateway() {
        // Guard against ambient credentials leaking into the test
        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENROUTER_API_KEY");

        let config = config_with(Some("or-key"), None, ProviderKind::Direct);
        let client = create_client(&config).unwrap();
        assert_eq!(client.tag(), "openrouter");
    }

    #[test]
    fn direct_with_credential_is_used() {
        let config = config_with(None, Some("sk-key"), ProviderKind::Direct);
        let client = create_client(&config).unwrap();
        assert_eq!(client.tag(), "openai");
    }

    #[test]
    fn gateway_without_credential_is_a_config_error() {
        std::env::remove_var("OPENROUTER_API_KEY");
        let config = config_with(None, None, ProviderKind::Gateway);
        assert!(matches!(create_client(&config), Err(Error::Config(_))));
    }
}
