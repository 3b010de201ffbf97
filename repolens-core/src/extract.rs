//! Implementation plan generation (structured extraction)
//!
//! Turns one or more completed analyses into a persisted checklist via a
//! single function-calling provider request. The tool schema is the wire
//! contract with the AI backend; malformed tool output degrades to zero
//! extracted items rather than failing the operation, so the plan row is
//! still created and the call is still ledgered.

use crate::config::ProviderConfig;
use crate::db::{Database, NewUsageRecord};
use crate::error::{Error, Result};
use crate::pricing;
use crate::provider::{self, ChatRequest, ProviderClient, ToolContract};
use crate::queue::{prompts, RuntimeSettings};
use crate::types::{
    AnalysisType, DepthLevel, ImplementationItem, ImplementationPlan, ItemCategory, User,
    EXTRACTION_USAGE_TAG,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Per-analysis character cap when assembling the extraction context
const MAX_ANALYSIS_CONTEXT_CHARS: usize = 15_000;

/// Rolling-window quota for extraction calls
const RATE_LIMIT_MAX_CALLS: i64 = 10;
const RATE_LIMIT_WINDOW_MINS: i64 = 60;

/// Name of the function the model is forced to call
const EXTRACTION_TOOL_NAME: &str = "create_implementation_items";

/// Shape of the tool-call arguments; parsed tolerantly.
#[derive(Debug, Deserialize)]
struct ExtractedPayload {
    #[serde(default)]
    items: Vec<ExtractedItem>,
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
    #[serde(default)]
    category: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    source_analysis: Option<String>,
}

/// The function-calling contract sent to the provider.
///
/// This schema is the de facto wire contract for structured extraction and
/// must stay byte-compatible with what the backends accept.
fn extraction_tool() -> ToolContract {
    ToolContract {
        name: EXTRACTION_TOOL_NAME.to_string(),
        description: "Record the actionable implementation items extracted from the analyses"
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "category": {
                                "type": "string",
                                "enum": ["critical", "implementation", "improvement"]
                            },
                            "title": { "type": "string" },
                            "description": { "type": "string" },
                            "source_analysis": { "type": "string" }
                        },
                        "required": ["category", "title", "source_analysis"]
                    }
                }
            },
            "required": ["items"]
        }),
    }
}

/// Generates implementation plans from completed analyses.
pub struct PlanGenerator {
    db: Arc<Database>,
    provider_config: ProviderConfig,
    client_override: Option<Arc<dyn ProviderClient>>,
}

impl PlanGenerator {
    /// Generator that builds its provider client from runtime settings
    pub fn new(db: Arc<Database>, provider_config: ProviderConfig) -> Self {
        Self {
            db,
            provider_config,
            client_override: None,
        }
    }

    /// Generator with a fixed client (tests, pre-built clients)
    pub fn with_client(db: Arc<Database>, client: Arc<dyn ProviderClient>) -> Self {
        Self {
            db,
            provider_config: ProviderConfig::default(),
            client_override: Some(client),
        }
    }

    /// Create and persist a plan from the latest analyses of the requested
    /// types. Rate-limited per user before any other work happens.
    pub async fn generate(
        &self,
        user: &User,
        project_id: &str,
        analysis_types: &[AnalysisType],
        title: Option<String>,
        focus: Option<&str>,
    ) -> Result<(ImplementationPlan, Vec<ImplementationItem>)> {
        self.check_rate_limit(&user.id)?;

        if analysis_types.is_empty() {
            return Err(Error::InvalidInput(
                "at least one analysis type is required".to_string(),
            ));
        }

        let project = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
        if project.user_id != user.id && !user.is_admin {
            return Err(Error::Forbidden(format!(
                "project {} belongs to another user",
                project_id
            )));
        }

        // Dedup to one (the most recent) analysis per requested type
        let mut requested: Vec<AnalysisType> = Vec::new();
        for t in analysis_types {
            if !requested.contains(t) {
                requested.push(*t);
            }
        }

        let mut analyses = Vec::with_capacity(requested.len());
        let mut missing = Vec::new();
        for t in &requested {
            match self.db.latest_analysis(project_id, *t)? {
                Some(a) => analyses.push(a),
                None => missing.push(t.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::NotFound(format!(
                "analyses for types [{}]",
                missing.join(", ")
            )));
        }

        let context = analyses
            .iter()
            .map(|a| {
                format!(
                    "## {} analysis\n{}",
                    a.analysis_type.display_name(),
                    prompts::truncate_chars(&a.content, MAX_ANALYSIS_CONTEXT_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let focus_line = focus
            .filter(|f| !f.trim().is_empty())
            .map(|f| format!("Focus the extraction on: {}\n\n", f.trim()))
            .unwrap_or_default();

        let runtime = RuntimeSettings::resolve(&self.db, &self.provider_config);
        let model = runtime.depth_profile(DepthLevel::Critical).model.clone();
        let request = ChatRequest {
            system_prompt:
                "You convert software analysis reports into a concrete implementation checklist. \
                 Call the provided function exactly once with every actionable item you can \
                 ground in the analyses."
                    .to_string(),
            user_prompt: format!("{}{}", focus_line, context),
            model,
            temperature: Some(0.1),
            max_tokens: None,
            tool: Some(extraction_tool()),
        };

        let client = self.client_for(&runtime)?;
        let outcome = provider::execute(client.as_ref(), &request).await?;

        let source_tags: Vec<String> = requested.iter().map(|t| t.as_str().to_string()).collect();
        let items = parse_items(outcome.tool_arguments.as_deref(), &source_tags);

        let now = Utc::now();
        let plan = ImplementationPlan {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            user_id: user.id.clone(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Implementation Plan - {}", project.name)),
            source_analyses: source_tags,
            tokens_used: outcome.input_tokens + outcome.output_tokens,
            created_at: now,
        };

        let rows: Vec<ImplementationItem> = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| ImplementationItem {
                id: Uuid::new_v4().to_string(),
                plan_id: plan.id.clone(),
                category: item.category,
                title: item.title,
                description: item.description,
                source_analysis: item.source_analysis,
                completed: false,
                completed_at: None,
                sort_order: idx as i64,
            })
            .collect();

        self.db.insert_implementation_plan(&plan, &rows)?;

        self.db.insert_usage(&NewUsageRecord {
            user_id: &user.id,
            project_id: Some(project_id),
            analysis_type: EXTRACTION_USAGE_TAG,
            depth: None,
            model: &outcome.model,
            provider: outcome.provider,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            estimated_cost: pricing::cost_for(
                &outcome.model,
                outcome.input_tokens,
                outcome.output_tokens,
            ),
            created_at: &now,
        })?;

        tracing::info!(
            plan_id = %plan.id,
            project_id = %project_id,
            items = rows.len(),
            tokens = plan.tokens_used,
            "Implementation plan created"
        );

        Ok((plan, rows))
    }

    /// Rolling 10-per-hour limit, checked before any work begins
    fn check_rate_limit(&self, user_id: &str) -> Result<()> {
        let now = Utc::now();
        let window_start = now - Duration::minutes(RATE_LIMIT_WINDOW_MINS);
        let calls = self
            .db
            .count_usage_tagged_since(user_id, EXTRACTION_USAGE_TAG, &window_start)?;
        if calls < RATE_LIMIT_MAX_CALLS {
            return Ok(());
        }

        let retry_after_secs = self
            .db
            .oldest_usage_tagged_since(user_id, EXTRACTION_USAGE_TAG, &window_start)?
            .map(|oldest| {
                (oldest + Duration::minutes(RATE_LIMIT_WINDOW_MINS) - now)
                    .num_seconds()
                    .max(1) as u64
            })
            .unwrap_or(RATE_LIMIT_WINDOW_MINS as u64 * 60);

        Err(Error::RateLimited {
            retry_after_secs,
            limit: RATE_LIMIT_MAX_CALLS as u32,
        })
    }

    fn client_for(&self, runtime: &RuntimeSettings) -> Result<Arc<dyn ProviderClient>> {
        if let Some(client) = &self.client_override {
            return Ok(client.clone());
        }
        let mut config = self.provider_config.clone();
        config.kind = runtime.provider_kind;
        provider::create_client(&config)
    }
}

/// Validated item, pre-persistence.
struct ValidItem {
    category: ItemCategory,
    title: String,
    description: Option<String>,
    source_analysis: String,
}

/// Parse tool-call arguments tolerantly and order by category priority.
///
/// Unparseable or absent arguments yield an empty list; individual items
/// survive with degraded fields (unknown category becomes `improvement`,
/// missing source falls back to the first requested tag). Items without a
/// title are dropped.
fn parse_items(raw_arguments: Option<&str>, source_tags: &[String]) -> Vec<ValidItem> {
    let payload = raw_arguments
        .and_then(|args| serde_json::from_str::<ExtractedPayload>(args).ok())
        .map(|p| p.items)
        .unwrap_or_default();

    if payload.is_empty() {
        tracing::warn!("Extraction produced no parseable items");
    }

    let fallback_source = source_tags
        .first()
        .cloned()
        .unwrap_or_else(|| "geral".to_string());

    let mut items: Vec<ValidItem> = payload
        .into_iter()
        .filter(|item| !item.title.trim().is_empty())
        .map(|item| ValidItem {
            category: item
                .category
                .parse()
                .unwrap_or(ItemCategory::Improvement),
            title: item.title.trim().to_string(),
            description: item.description.filter(|d| !d.trim().is_empty()),
            source_analysis: item
                .source_analysis
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| fallback_source.clone()),
        })
        .collect();

    // Stable sort: model ordering survives within each category
    items.sort_by_key(|item| item.category.priority());
    items
}
