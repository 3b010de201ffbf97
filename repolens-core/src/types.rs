//! Core domain types for repolens
//!
//! These types model the analysis pipeline: tracked repositories, the durable
//! analysis queue, persisted analysis reports, the usage ledger, subscription
//! tiers, and derived implementation plans.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Project** | A tracked GitHub repository with a cached snapshot |
//! | **QueueItem** | One unit of analysis work for a (project, type, depth) |
//! | **Analysis** | Persisted markdown report; latest per (project, type) wins |
//! | **UsageRecord** | Append-only ledger entry for one billable AI call |
//! | **PlanTier** | A subscription tier with token caps and feature limits |
//! | **ImplementationPlan** | Checklist derived from completed analyses |
//!
//! Analysis-type and depth wire tags are stable strings persisted in the
//! database and exposed over the API; the Rust enums are the single source of
//! truth for everything keyed on them (prompt templates, token estimates,
//! display metadata), so adding a variant fails closed at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Analysis types
// ============================================

/// The closed set of report kinds repolens can generate.
///
/// Wire tags are inherited from the original product and must not change:
/// existing rows and API clients depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    /// Product requirements document
    Prd,
    /// Marketing and positioning plan
    Marketing,
    /// Security review ("seguranca" on the wire)
    #[serde(rename = "seguranca")]
    Security,
    /// Performance review
    Performance,
    /// Architecture review ("arquitetura" on the wire)
    #[serde(rename = "arquitetura")]
    Architecture,
    /// Code quality review ("qualidade" on the wire)
    #[serde(rename = "qualidade")]
    CodeQuality,
}

impl AnalysisType {
    /// Every analysis type, in the order a "full run" executes them.
    pub const ALL: [AnalysisType; 6] = [
        AnalysisType::Prd,
        AnalysisType::Marketing,
        AnalysisType::Security,
        AnalysisType::Performance,
        AnalysisType::Architecture,
        AnalysisType::CodeQuality,
    ];

    /// Returns the identifier used in database storage and API payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Prd => "prd",
            AnalysisType::Marketing => "marketing",
            AnalysisType::Security => "seguranca",
            AnalysisType::Performance => "performance",
            AnalysisType::Architecture => "arquitetura",
            AnalysisType::CodeQuality => "qualidade",
        }
    }

    /// Returns the display name for this analysis type
    pub fn display_name(&self) -> &'static str {
        match self {
            AnalysisType::Prd => "Product Requirements",
            AnalysisType::Marketing => "Marketing Plan",
            AnalysisType::Security => "Security Review",
            AnalysisType::Performance => "Performance Review",
            AnalysisType::Architecture => "Architecture Review",
            AnalysisType::CodeQuality => "Code Quality Review",
        }
    }
}

impl std::str::FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prd" => Ok(AnalysisType::Prd),
            "marketing" => Ok(AnalysisType::Marketing),
            "seguranca" => Ok(AnalysisType::Security),
            "performance" => Ok(AnalysisType::Performance),
            "arquitetura" => Ok(AnalysisType::Architecture),
            "qualidade" => Ok(AnalysisType::CodeQuality),
            _ => Err(format!("unknown analysis type: {}", s)),
        }
    }
}

// ============================================
// Depth levels
// ============================================

/// Requested analysis depth.
///
/// Depth controls the context character budget handed to the model and the
/// per-analysis token estimate used for quota admission and depth suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthLevel {
    /// Essentials only; cheapest, always the admission floor
    Critical,
    /// Balanced coverage
    Balanced,
    /// Full-depth report
    Complete,
}

impl DepthLevel {
    /// Depths ordered deepest first, for depth suggestion.
    pub const DEEPEST_FIRST: [DepthLevel; 3] = [
        DepthLevel::Complete,
        DepthLevel::Balanced,
        DepthLevel::Critical,
    ];

    /// Returns the identifier used in database storage and API payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            DepthLevel::Critical => "critical",
            DepthLevel::Balanced => "balanced",
            DepthLevel::Complete => "complete",
        }
    }

    /// Estimated tokens consumed by one analysis at this depth.
    ///
    /// Static reference numbers used for admission checks and depth
    /// suggestion until the ledger has real data to calibrate against.
    pub fn token_estimate(&self) -> i64 {
        match self {
            DepthLevel::Critical => 2_000,
            DepthLevel::Balanced => 4_000,
            DepthLevel::Complete => 8_000,
        }
    }

    /// Default character budget for project context at this depth.
    ///
    /// Truncation at the budget is a hard cutoff, not semantic.
    pub fn default_context_chars(&self) -> usize {
        match self {
            DepthLevel::Critical => 8_000,
            DepthLevel::Balanced => 20_000,
            DepthLevel::Complete => 48_000,
        }
    }
}

impl std::str::FromStr for DepthLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(DepthLevel::Critical),
            "balanced" => Ok(DepthLevel::Balanced),
            "complete" => Ok(DepthLevel::Complete),
            _ => Err(format!("unknown depth level: {}", s)),
        }
    }
}

// ============================================
// Queue status
// ============================================

/// Queue item state machine: `pending -> processing -> {completed | error}`.
///
/// Transitions are monotonic. An `error` item is never silently retried in
/// place; re-running it means enqueuing a fresh `pending` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl QueueStatus {
    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "error" => Ok(QueueStatus::Error),
            _ => Err(format!("unknown queue status: {}", s)),
        }
    }
}

// ============================================
// Implementation item categories
// ============================================

/// Category of an implementation checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemCategory {
    Critical,
    Implementation,
    Improvement,
}

impl ItemCategory {
    /// Sort priority; lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            ItemCategory::Critical => 0,
            ItemCategory::Implementation => 1,
            ItemCategory::Improvement => 2,
        }
    }

    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::Critical => "critical",
            ItemCategory::Implementation => "implementation",
            ItemCategory::Improvement => "improvement",
        }
    }
}

impl std::str::FromStr for ItemCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(ItemCategory::Critical),
            "implementation" => Ok(ItemCategory::Implementation),
            "improvement" => Ok(ItemCategory::Improvement),
            _ => Err(format!("unknown item category: {}", s)),
        }
    }
}

// ============================================
// Project
// ============================================

/// Coarse project status surfaced to the dashboard.
///
/// Advisory display state only: concurrent jobs on the same project race to
/// overwrite it, which is accepted because nothing correctness-bearing reads
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Idle,
    Generating(AnalysisType),
    Error,
}

impl ProjectStatus {
    /// Returns the tag stored in the database ("idle", "generating_prd", ...)
    pub fn as_tag(&self) -> String {
        match self {
            ProjectStatus::Idle => "idle".to_string(),
            ProjectStatus::Generating(t) => format!("generating_{}", t.as_str()),
            ProjectStatus::Error => "error".to_string(),
        }
    }

    /// Parse a stored tag; unknown tags degrade to `Idle`
    pub fn from_tag(tag: &str) -> ProjectStatus {
        match tag {
            "idle" => ProjectStatus::Idle,
            "error" => ProjectStatus::Error,
            other => match other.strip_prefix("generating_") {
                Some(t) => t
                    .parse::<AnalysisType>()
                    .map(ProjectStatus::Generating)
                    .unwrap_or(ProjectStatus::Idle),
                None => ProjectStatus::Idle,
            },
        }
    }
}

/// Cached repository snapshot captured by the GitHub-ingestion collaborator.
///
/// All fields are optional; the processor fails a job with a data error when
/// nothing at all is cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoSnapshot {
    /// README content
    pub readme: Option<String>,
    /// Rendered file tree
    pub file_structure: Option<String>,
    /// Dependency manifest (package.json, Cargo.toml, ...)
    pub dependency_manifest: Option<String>,
    /// Representative source excerpts
    pub source_excerpts: Option<String>,
    /// Build/CI configuration excerpt
    pub repo_config: Option<String>,
}

impl RepoSnapshot {
    /// True when nothing has been ingested yet
    pub fn is_empty(&self) -> bool {
        self.readme.is_none()
            && self.file_structure.is_none()
            && self.dependency_manifest.is_none()
            && self.source_excerpts.is_none()
            && self.repo_config.is_none()
    }
}

/// A tracked repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Human-friendly name
    pub name: String,
    /// Source repository URL
    pub repo_url: String,
    /// Cached snapshot used for prompt assembly
    pub snapshot: RepoSnapshot,
    /// Coarse status tag for UI feedback
    pub analysis_status: String,
    /// When the project was imported
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Queue
// ============================================

/// A unit of analysis work.
///
/// Created by the enqueuing endpoint, mutated exclusively by the queue
/// processor, retained indefinitely for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier
    pub id: String,
    /// Owning project
    pub project_id: String,
    /// Owning user
    pub user_id: String,
    /// Which report to generate
    pub analysis_type: AnalysisType,
    /// Requested depth
    pub depth: DepthLevel,
    /// Current state-machine position
    pub status: QueueStatus,
    /// Failed processing attempts recorded against this item
    pub retry_count: i64,
    /// Last error message, when status is `error`
    pub error_message: Option<String>,
    /// When the item was enqueued
    pub created_at: DateTime<Utc>,
    /// When processing was claimed
    pub started_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================
// Analysis
// ============================================

/// Persisted output of a successful analysis job.
///
/// Never mutated; a later analysis of the same type supersedes it on the
/// read path (latest wins, older content is not retained for comparison).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Unique identifier
    pub id: String,
    /// Owning project
    pub project_id: String,
    /// Report kind
    pub analysis_type: AnalysisType,
    /// Markdown report content
    pub content: String,
    /// Model that produced the content
    pub model: Option<String>,
    /// SHA-256 of the assembled prompt, for audit
    pub prompt_hash: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

// ============================================
// Usage ledger
// ============================================

/// One append-only ledger entry per billable AI call.
///
/// Cost is a point-in-time estimate computed from the token split and the
/// model's registered rates at call time; it is never recomputed if pricing
/// changes later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Row id
    pub id: i64,
    /// Owning user
    pub user_id: String,
    /// Owning project, when the call belonged to one
    pub project_id: Option<String>,
    /// Analysis-type tag, or `implementation_plan` for extraction calls
    pub analysis_type: String,
    /// Depth level, absent for extraction calls
    pub depth: Option<DepthLevel>,
    /// Model identifier
    pub model: String,
    /// Provider tag ("openrouter", "openai")
    pub provider: String,
    /// Prompt-side tokens
    pub input_tokens: i64,
    /// Completion-side tokens
    pub output_tokens: i64,
    /// Total estimated tokens (input + output)
    pub estimated_tokens: i64,
    /// Estimated cost in USD at call time
    pub estimated_cost: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Ledger tag recorded for structured-extraction calls
pub const EXTRACTION_USAGE_TAG: &str = "implementation_plan";

// ============================================
// Plans & subscriptions
// ============================================

/// Free-form tier configuration, stored as JSON on the plan row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    /// Depths this tier may request
    pub allowed_depths: Vec<DepthLevel>,
    /// Analysis types this tier may request
    pub allowed_types: Vec<AnalysisType>,
    /// Restrict the tier to economic models
    pub economic_models_only: bool,
    /// PDF export enabled
    pub pdf_export: bool,
    /// Human-readable limitations blurb for the pricing page
    pub limitations: Option<String>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            allowed_depths: DepthLevel::DEEPEST_FIRST.to_vec(),
            allowed_types: AnalysisType::ALL.to_vec(),
            economic_models_only: false,
            pdf_export: false,
            limitations: None,
        }
    }
}

/// A named subscription tier.
///
/// Managed by the billing collaborator; read-only from the core's
/// perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTier {
    /// Unique identifier
    pub id: String,
    /// Stable slug ("free", "pro", ...)
    pub slug: String,
    /// Display name
    pub name: String,
    /// Legacy monthly analysis count limit
    pub monthly_limit: Option<i64>,
    /// Legacy daily analysis count limit
    pub daily_limit: Option<i64>,
    /// Monthly token cap; `None` means unlimited
    pub max_tokens_monthly: Option<i64>,
    /// Typed tier configuration
    pub limits: PlanLimits,
}

/// A user's active subscription, synced idempotently from billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Owning user (one active subscription per user)
    pub user_id: String,
    /// Subscribed tier
    pub plan_id: String,
    /// Billing status ("active", "past_due", ...)
    pub status: String,
    /// End of the paid period, when known
    pub current_period_end: Option<DateTime<Utc>>,
    /// Last sync timestamp
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Users
// ============================================

/// Minimal account record backing API authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier
    pub id: String,
    /// Contact email
    pub email: String,
    /// Bearer token for the HTTP surface
    pub api_token: String,
    /// Admins bypass quota admission
    pub is_admin: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

// ============================================
// Implementation plans
// ============================================

/// A derived checklist grouping items extracted from completed analyses.
///
/// Deleted together with its items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    /// Unique identifier
    pub id: String,
    /// Source project
    pub project_id: String,
    /// Owning user
    pub user_id: String,
    /// Plan title
    pub title: String,
    /// Analysis-type tags the plan was derived from
    pub source_analyses: Vec<String>,
    /// Tokens consumed by the extraction call
    pub tokens_used: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One actionable checklist item.
///
/// Mutated only by user-toggled completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationItem {
    /// Unique identifier
    pub id: String,
    /// Owning plan
    pub plan_id: String,
    /// Category driving sort order
    pub category: ItemCategory,
    /// Item title
    pub title: String,
    /// Optional longer description
    pub description: Option<String>,
    /// Which analysis the item came from
    pub source_analysis: String,
    /// Completion flag
    pub completed: bool,
    /// When the item was checked off
    pub completed_at: Option<DateTime<Utc>>,
    /// Position within the plan (category priority first)
    pub sort_order: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_type_tags_round_trip() {
        for t in AnalysisType::ALL {
            assert_eq!(t.as_str().parse::<AnalysisType>(), Ok(t));
        }
        assert_eq!("seguranca".parse::<AnalysisType>(), Ok(AnalysisType::Security));
        assert!("banana".parse::<AnalysisType>().is_err());
    }

    #[test]
    fn depth_estimates_are_ordered() {
        assert!(DepthLevel::Critical.token_estimate() < DepthLevel::Balanced.token_estimate());
        assert!(DepthLevel::Balanced.token_estimate() < DepthLevel::Complete.token_estimate());
    }

    #[test]
    fn project_status_tags() {
        let tag = ProjectStatus::Generating(AnalysisType::Security).as_tag();
        assert_eq!(tag, "generating_seguranca");
        assert_eq!(
            ProjectStatus::from_tag(&tag),
            ProjectStatus::Generating(AnalysisType::Security)
        );
        assert_eq!(ProjectStatus::from_tag("idle"), ProjectStatus::Idle);
        // Unknown tags degrade to idle rather than erroring
        assert_eq!(ProjectStatus::from_tag("generating_nonsense"), ProjectStatus::Idle);
    }

    #[test]
    fn category_priority_orders_critical_first() {
        let mut cats = [
            ItemCategory::Improvement,
            ItemCategory::Critical,
            ItemCategory::Implementation,
        ];
        cats.sort_by_key(|c| c.priority());
        assert_eq!(
            cats,
            [
                ItemCategory::Critical,
                ItemCategory::Implementation,
                ItemCategory::Improvement
            ]
        );
    }
}
