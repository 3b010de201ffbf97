//! OpenAI-style chat-completion wire types
//!
//! Both backends (the managed gateway and the direct vendor) speak this
//! request/response shape, including tool calls for structured extraction,
//! so the serde types live here and the clients only differ in endpoint and
//! headers.

use crate::error::{Error, Result};
use crate::pricing;
use serde::{Deserialize, Serialize};

use super::{ChatOutcome, ChatRequest};

// ============================================
// Request
// ============================================

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireToolFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

/// Build the request body shared by both backends
pub fn build_request(request: &ChatRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(2);
    if !request.system_prompt.is_empty() {
        messages.push(WireMessage {
            role: "system".to_string(),
            content: request.system_prompt.clone(),
        });
    }
    messages.push(WireMessage {
        role: "user".to_string(),
        content: request.user_prompt.clone(),
    });

    let (tools, tool_choice) = match &request.tool {
        Some(tool) => (
            Some(vec![WireTool {
                kind: "function".to_string(),
                function: WireToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            }]),
            // Force the model to call the contract function
            Some(serde_json::json!({
                "type": "function",
                "function": { "name": tool.name }
            })),
        ),
        None => (None, None),
    };

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        tools,
        tool_choice,
    }
}

// ============================================
// Response
// ============================================

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<UsageBlock>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallFunction {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments; parsed tolerantly by the caller
    #[serde(default)]
    pub arguments: String,
}

/// Map a non-success HTTP status to the provider error taxonomy
pub fn error_for_status(provider: &str, status: u16, body: &str) -> Error {
    let detail = body.chars().take(400).collect::<String>();
    match status {
        429 => Error::ProviderRateLimited(format!("{} returned 429: {}", provider, detail)),
        402 => Error::PaymentRequired(format!("{} reports insufficient credits: {}", provider, detail)),
        400 => Error::MalformedRequest(format!("{} rejected the request: {}", provider, detail)),
        other => Error::Provider {
            status: Some(other),
            message: format!("{} returned {}: {}", provider, other, detail),
        },
    }
}

/// Convert a parsed response into a [`ChatOutcome`].
///
/// Prefers provider-reported usage; when the usage block is missing, falls
/// back to the `ceil(chars / 4)` estimate over the prompt and completion.
pub fn outcome_from_response(
    response: ChatCompletionResponse,
    request: &ChatRequest,
    provider: &'static str,
) -> Result<ChatOutcome> {
    let choice = response.choices.into_iter().next().ok_or(Error::Provider {
        status: None,
        message: format!("{} response contained no choices", provider),
    })?;

    let content = choice.message.content.unwrap_or_default();
    let tool_arguments = choice
        .message
        .tool_calls
        .and_then(|calls| calls.into_iter().next())
        .map(|call| call.function.arguments);

    let prompt_chars = format!("{}{}", request.system_prompt, request.user_prompt);
    let completion_chars = match &tool_arguments {
        Some(args) => format!("{}{}", content, args),
        None => content.clone(),
    };

    let (input_tokens, output_tokens) = match response.usage {
        Some(usage) => (
            usage
                .prompt_tokens
                .unwrap_or_else(|| pricing::estimate_tokens(&prompt_chars)),
            usage
                .completion_tokens
                .unwrap_or_else(|| pricing::estimate_tokens(&completion_chars)),
        ),
        None => (
            pricing::estimate_tokens(&prompt_chars),
            pricing::estimate_tokens(&completion_chars),
        ),
    };

    Ok(ChatOutcome {
        content,
        tool_arguments,
        input_tokens,
        output_tokens,
        model: response.model.unwrap_or_else(|| request.model.clone()),
        provider,
    })
}

#[derive(Debug, Deserialize)]
pub struct UsageBlock {
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolContract;

    fn request() -> ChatRequest {
        ChatRequest {
            system_prompt: "You are a reviewer.".to_string(),
            user_prompt: "Review this repo.".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.2),
            max_tokens: None,
            tool: None,
        }
    }

    #[test]
    fn parses_reported_usage() {
        let body = r#"{
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{"message": {"content": "looks fine"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 40}
        }"#;
        let response: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let outcome = outcome_from_response(response, &request(), "openai").unwrap();
        assert_eq!(outcome.input_tokens, 120);
        assert_eq!(outcome.output_tokens, 40);
        assert_eq!(outcome.content, "looks fine");
        assert_eq!(outcome.model, "gpt-4o-mini-2024-07-18");
    }

    #[test]
    fn estimates_tokens_when_usage_missing() {
        let body = r#"{"choices": [{"message": {"content": "abcdefgh"}}]}"#;
        let response: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let outcome = outcome_from_response(response, &request(), "openai").unwrap();
        // 8 completion chars -> 2 tokens
        assert_eq!(outcome.output_tokens, 2);
        assert!(outcome.input_tokens > 0);
        // Falls back to the requested model name
        assert_eq!(outcome.model, "gpt-4o-mini");
    }

    #[test]
    fn surfaces_tool_call_arguments() {
        let body = r#"{
            "choices": [{"message": {"tool_calls": [
                {"function": {"name": "create_implementation_items", "arguments": "{\"items\":[]}"}}
            ]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let response: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let outcome = outcome_from_response(response, &request(), "openrouter").unwrap();
        assert_eq!(outcome.tool_arguments.as_deref(), Some("{\"items\":[]}"));
        assert!(outcome.content.is_empty());
    }

    #[test]
    fn empty_choices_is_a_transient_error() {
        let body = r#"{"choices": []}"#;
        let response: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let err = outcome_from_response(response, &request(), "openai").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert!(matches!(
            error_for_status("openai", 429, "slow down"),
            Error::ProviderRateLimited(_)
        ));
        assert!(matches!(
            error_for_status("openrouter", 402, "credits"),
            Error::PaymentRequired(_)
        ));
        assert!(matches!(
            error_for_status("openai", 400, "bad tool schema"),
            Error::MalformedRequest(_)
        ));
        assert!(matches!(
            error_for_status("openai", 503, "overloaded"),
            Error::Provider {
                status: Some(503),
                ..
            }
        ));
    }

    #[test]
    fn tool_contract_serializes_with_forced_choice() {
        let mut req = request();
        req.tool = Some(ToolContract {
            name: "create_implementation_items".to_string(),
            description: "Extract items".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        });
        let wire = build_request(&req);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(
            json["tool_choice"]["function"]["name"],
            "create_implementation_items"
        );
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
    }
}
