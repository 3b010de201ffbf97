//! Runtime settings resolved once per job invocation
//!
//! Operator-mutable configuration lives in the `app_settings` table. Each
//! job resolves it into this typed struct exactly once, layering the rows
//! over built-in defaults; malformed values degrade to the default for that
//! key instead of failing the job.

use crate::config::{ProviderConfig, ProviderKind};
use crate::db::Database;
use crate::types::{AnalysisType, DepthLevel};
use std::collections::HashMap;

use super::prompts;

/// Per-depth model and context budget.
#[derive(Debug, Clone)]
pub struct DepthProfile {
    /// Model identifier (gateway naming; the direct client strips prefixes)
    pub model: String,
    /// Character budget for the combined repository context
    pub max_context_chars: usize,
}

/// Default model for a depth level
fn default_model(depth: DepthLevel) -> &'static str {
    match depth {
        DepthLevel::Critical => "openai/gpt-4o-mini",
        DepthLevel::Balanced => "openai/gpt-4o",
        DepthLevel::Complete => "anthropic/claude-3.5-sonnet",
    }
}

/// Typed view over the settings rows, with built-in defaults underneath.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Which backend serves this job's calls
    pub provider_kind: ProviderKind,
    critical: DepthProfile,
    balanced: DepthProfile,
    complete: DepthProfile,
    template_overrides: HashMap<AnalysisType, String>,
}

impl RuntimeSettings {
    /// Resolve current settings; tolerant of missing or malformed rows.
    pub fn resolve(db: &Database, config: &ProviderConfig) -> Self {
        let rows = db.all_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load settings; using defaults");
            HashMap::new()
        });

        let provider_kind = match rows.get("ai_provider").map(String::as_str) {
            Some("gateway") => ProviderKind::Gateway,
            Some("direct") => ProviderKind::Direct,
            Some(other) => {
                tracing::warn!(value = %other, "Unknown ai_provider setting; using configured default");
                config.kind
            }
            None => config.kind,
        };

        let depth_profile = |depth: DepthLevel| -> DepthProfile {
            let model = rows
                .get(&format!("depth.{}.model", depth.as_str()))
                .cloned()
                .unwrap_or_else(|| default_model(depth).to_string());
            let max_context_chars = rows
                .get(&format!("depth.{}.max_context_chars", depth.as_str()))
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| depth.default_context_chars());
            DepthProfile {
                model,
                max_context_chars,
            }
        };

        let template_overrides = AnalysisType::ALL
            .iter()
            .filter_map(|t| {
                rows.get(&format!("prompt.{}", t.as_str()))
                    .map(|tpl| (*t, tpl.clone()))
            })
            .collect();

        Self {
            provider_kind,
            critical: depth_profile(DepthLevel::Critical),
            balanced: depth_profile(DepthLevel::Balanced),
            complete: depth_profile(DepthLevel::Complete),
            template_overrides,
        }
    }

    /// Profile for a depth level
    pub fn depth_profile(&self, depth: DepthLevel) -> &DepthProfile {
        match depth {
            DepthLevel::Critical => &self.critical,
            DepthLevel::Balanced => &self.balanced,
            DepthLevel::Complete => &self.complete,
        }
    }

    /// Active template for an analysis type: operator override, else built-in
    pub fn template_for(&self, analysis_type: AnalysisType) -> &str {
        self.template_overrides
            .get(&analysis_type)
            .map(String::as_str)
            .unwrap_or_else(|| prompts::default_template(analysis_type))
    }
}
