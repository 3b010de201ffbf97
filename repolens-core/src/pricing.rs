//! Model registry and cost computation
//!
//! A static, versionable table mapping model identifiers to providers and
//! per-1K-token rates. Consulted at call time for real-time cost computation
//! and for reference estimates when the ledger has no data yet for a
//! model/depth combination. Costs recorded in the ledger are point-in-time:
//! editing this table never rewrites history.

use crate::types::DepthLevel;

/// Per-model pricing entry.
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    /// Model identifier as sent on the wire
    pub model: &'static str,
    /// Provider tag recorded in the ledger
    pub provider: &'static str,
    /// USD per 1K prompt tokens
    pub input_per_1k: f64,
    /// USD per 1K completion tokens
    pub output_per_1k: f64,
    /// Economic models are eligible for tiers restricted to cheap runs
    pub economic: bool,
}

/// Model whose rates are used for identifiers missing from the registry
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Static rate table, USD per 1K tokens.
///
/// Gateway (OpenRouter) identifiers carry a vendor prefix; direct-vendor
/// identifiers are bare. Both spellings of the default model are listed so
/// ledger rows stay priced identically whichever backend served the call.
const REGISTRY: &[ModelRates] = &[
    ModelRates {
        model: "openai/gpt-4o-mini",
        provider: "openrouter",
        input_per_1k: 0.000_15,
        output_per_1k: 0.000_6,
        economic: true,
    },
    ModelRates {
        model: "gpt-4o-mini",
        provider: "openai",
        input_per_1k: 0.000_15,
        output_per_1k: 0.000_6,
        economic: true,
    },
    ModelRates {
        model: "openai/gpt-4o",
        provider: "openrouter",
        input_per_1k: 0.002_5,
        output_per_1k: 0.01,
        economic: false,
    },
    ModelRates {
        model: "gpt-4o",
        provider: "openai",
        input_per_1k: 0.002_5,
        output_per_1k: 0.01,
        economic: false,
    },
    ModelRates {
        model: "anthropic/claude-3.5-sonnet",
        provider: "openrouter",
        input_per_1k: 0.003,
        output_per_1k: 0.015,
        economic: false,
    },
    ModelRates {
        model: "anthropic/claude-3-haiku",
        provider: "openrouter",
        input_per_1k: 0.000_25,
        output_per_1k: 0.001_25,
        economic: true,
    },
    ModelRates {
        model: "google/gemini-flash-1.5",
        provider: "openrouter",
        input_per_1k: 0.000_075,
        output_per_1k: 0.000_3,
        economic: true,
    },
    ModelRates {
        model: "meta-llama/llama-3.1-70b-instruct",
        provider: "openrouter",
        input_per_1k: 0.000_59,
        output_per_1k: 0.000_79,
        economic: true,
    },
    ModelRates {
        model: "deepseek/deepseek-chat",
        provider: "openrouter",
        input_per_1k: 0.000_14,
        output_per_1k: 0.000_28,
        economic: true,
    },
];

/// Look up rates for a model, falling back to [`DEFAULT_MODEL`] for unknown
/// identifiers.
pub fn rates_for(model: &str) -> &'static ModelRates {
    REGISTRY
        .iter()
        .find(|r| r.model == model)
        .unwrap_or_else(|| {
            REGISTRY
                .iter()
                .find(|r| r.model == DEFAULT_MODEL)
                .expect("default model must be registered")
        })
}

/// Compute the USD cost for a call from its token split.
pub fn cost_for(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let rates = rates_for(model);
    (input_tokens as f64 / 1_000.0) * rates.input_per_1k
        + (output_tokens as f64 / 1_000.0) * rates.output_per_1k
}

/// Whether a model is classified as economic.
pub fn is_economic(model: &str) -> bool {
    rates_for(model).economic
}

/// Estimate tokens for a text when the provider reports no usage:
/// `ceil(character_count / 4)`.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    (chars + 3) / 4
}

/// Static per-depth reference estimate, used when no ledger data exists for
/// a model/depth combination.
pub fn reference_tokens(depth: DepthLevel) -> i64 {
    depth.token_estimate()
}
