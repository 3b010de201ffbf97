//! Analysis job queue processing
//!
//! The processor is invoked once per queue item by an external trigger; it
//! owns every mutation of the item after enqueue. The state machine is
//! `pending -> processing -> {completed | error}` with a conditional-update
//! claim, so duplicate invocations from at-least-once triggers report
//! "already processing"/"already completed" instead of doing work twice.

pub mod prompts;
pub mod settings;

pub use settings::{DepthProfile, RuntimeSettings};

use crate::config::ProviderConfig;
use crate::db::{Database, NewUsageRecord};
use crate::error::{Error, Result};
use crate::pricing;
use crate::provider::{self, ChatRequest, ProviderClient};
use crate::types::{Analysis, ProjectStatus, QueueItem, QueueStatus};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Result of one trigger invocation for a queue item.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// This invocation ran the job to completion
    Completed {
        analysis_type: crate::types::AnalysisType,
        analysis_id: String,
    },
    /// Another invocation holds the claim; treated as success by callers
    AlreadyProcessing {
        analysis_type: crate::types::AnalysisType,
    },
    /// The item already finished; nothing was mutated
    AlreadyCompleted {
        analysis_type: crate::types::AnalysisType,
    },
    /// The job ran (now or earlier) and ended in the error state
    Failed {
        analysis_type: crate::types::AnalysisType,
        message: String,
        /// The provider refused for billing reasons (maps to HTTP 402)
        payment_required: bool,
    },
}

impl ProcessOutcome {
    /// Queue status implied by this outcome
    pub fn status(&self) -> QueueStatus {
        match self {
            ProcessOutcome::Completed { .. } | ProcessOutcome::AlreadyCompleted { .. } => {
                QueueStatus::Completed
            }
            ProcessOutcome::AlreadyProcessing { .. } => QueueStatus::Processing,
            ProcessOutcome::Failed { .. } => QueueStatus::Error,
        }
    }

    /// Analysis type of the underlying item
    pub fn analysis_type(&self) -> crate::types::AnalysisType {
        match self {
            ProcessOutcome::Completed { analysis_type, .. }
            | ProcessOutcome::AlreadyProcessing { analysis_type }
            | ProcessOutcome::AlreadyCompleted { analysis_type }
            | ProcessOutcome::Failed { analysis_type, .. } => *analysis_type,
        }
    }
}

/// Processes queue items one at a time.
pub struct Processor {
    db: Arc<Database>,
    provider_config: ProviderConfig,
    client_override: Option<Arc<dyn ProviderClient>>,
}

impl Processor {
    /// Processor that builds its provider client from runtime settings
    pub fn new(db: Arc<Database>, provider_config: ProviderConfig) -> Self {
        Self {
            db,
            provider_config,
            client_override: None,
        }
    }

    /// Processor with a fixed client (tests, pre-built clients)
    pub fn with_client(db: Arc<Database>, client: Arc<dyn ProviderClient>) -> Self {
        Self {
            db,
            provider_config: ProviderConfig::default(),
            client_override: Some(client),
        }
    }

    /// Run one queue item to a terminal state.
    ///
    /// Idempotent with respect to duplicate invocation: only the invocation
    /// that wins the `pending -> processing` claim mutates anything.
    pub async fn process_item(&self, item_id: &str) -> Result<ProcessOutcome> {
        let item = self
            .db
            .get_queue_item(item_id)?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", item_id)))?;

        match item.status {
            QueueStatus::Completed => {
                return Ok(ProcessOutcome::AlreadyCompleted {
                    analysis_type: item.analysis_type,
                })
            }
            QueueStatus::Processing => {
                return Ok(ProcessOutcome::AlreadyProcessing {
                    analysis_type: item.analysis_type,
                })
            }
            QueueStatus::Error => {
                // Terminal; re-running requires a fresh pending item
                return Ok(ProcessOutcome::Failed {
                    analysis_type: item.analysis_type,
                    message: item
                        .error_message
                        .unwrap_or_else(|| "analysis failed".to_string()),
                    payment_required: false,
                });
            }
            QueueStatus::Pending => {}
        }

        let started_at = Utc::now();
        if !self.db.claim_queue_item(item_id, &started_at)? {
            // Lost the claim race to a concurrent invocation
            let current = self
                .db
                .get_queue_item(item_id)?
                .ok_or_else(|| Error::NotFound(format!("queue item {}", item_id)))?;
            return Ok(match current.status {
                QueueStatus::Completed => ProcessOutcome::AlreadyCompleted {
                    analysis_type: current.analysis_type,
                },
                _ => ProcessOutcome::AlreadyProcessing {
                    analysis_type: current.analysis_type,
                },
            });
        }

        tracing::info!(
            item_id = %item.id,
            project_id = %item.project_id,
            analysis_type = item.analysis_type.as_str(),
            depth = item.depth.as_str(),
            "Processing queue item"
        );

        match self.run_claimed(&item).await {
            Ok(analysis_id) => Ok(ProcessOutcome::Completed {
                analysis_type: item.analysis_type,
                analysis_id,
            }),
            Err(e) => {
                let payment_required = matches!(e, Error::PaymentRequired(_));
                let message = e.to_string();
                tracing::warn!(item_id = %item.id, error = %message, "Queue item failed");
                let now = Utc::now();
                self.db.fail_queue_item(&item.id, &message, &now)?;
                self.db
                    .update_project_status(&item.project_id, &ProjectStatus::Error.as_tag())?;
                Ok(ProcessOutcome::Failed {
                    analysis_type: item.analysis_type,
                    message,
                    payment_required,
                })
            }
        }
    }

    /// Steps 2-8 of a claimed job; any error flips the item to `error`
    async fn run_claimed(&self, item: &QueueItem) -> Result<String> {
        self.db.update_project_status(
            &item.project_id,
            &ProjectStatus::Generating(item.analysis_type).as_tag(),
        )?;

        let runtime = RuntimeSettings::resolve(&self.db, &self.provider_config);

        let project = self
            .db
            .get_project(&item.project_id)?
            .ok_or_else(|| Error::NotFound(format!("project {}", item.project_id)))?;
        if project.snapshot.is_empty() {
            return Err(Error::NotFound(format!(
                "repository snapshot for project {}",
                item.project_id
            )));
        }

        let profile = runtime.depth_profile(item.depth);
        let model = self.effective_model(&item.user_id, &profile.model);
        let context = prompts::build_context(&project, profile.max_context_chars);
        let user_prompt = prompts::render(
            runtime.template_for(item.analysis_type),
            &[
                ("project_name", project.name.as_str()),
                ("repo_url", project.repo_url.as_str()),
                ("depth", item.depth.as_str()),
                ("context", context.as_str()),
            ],
        );
        let system_prompt = prompts::system_prompt(item.analysis_type);

        let client = self.client_for(&runtime)?;
        let request = ChatRequest {
            system_prompt: system_prompt.clone(),
            user_prompt: user_prompt.clone(),
            model,
            temperature: Some(0.3),
            max_tokens: None,
            tool: None,
        };
        let outcome = provider::execute(client.as_ref(), &request).await?;

        let mut hasher = Sha256::new();
        hasher.update(system_prompt.as_bytes());
        hasher.update(user_prompt.as_bytes());
        let prompt_hash = hex::encode(hasher.finalize());

        let now = Utc::now();
        let analysis = Analysis {
            id: Uuid::new_v4().to_string(),
            project_id: item.project_id.clone(),
            analysis_type: item.analysis_type,
            content: outcome.content.clone(),
            model: Some(outcome.model.clone()),
            prompt_hash: Some(prompt_hash),
            created_at: now,
        };
        self.db.insert_analysis(&analysis)?;

        self.db.insert_usage(&NewUsageRecord {
            user_id: &item.user_id,
            project_id: Some(&item.project_id),
            analysis_type: item.analysis_type.as_str(),
            depth: Some(item.depth),
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

        self.db.complete_queue_item(&item.id, &now)?;
        self.db
            .update_project_status(&item.project_id, &ProjectStatus::Idle.as_tag())?;

        tracing::info!(
            item_id = %item.id,
            analysis_id = %analysis.id,
            model = %outcome.model,
            input_tokens = outcome.input_tokens,
            output_tokens = outcome.output_tokens,
            "Queue item completed"
        );

        Ok(analysis.id)
    }

    /// Tiers restricted to economic models get the default economic model
    /// when the configured depth model is not economic. Lookup failures
    /// leave the configured model untouched.
    fn effective_model(&self, user_id: &str, profile_model: &str) -> String {
        let economic_only = self
            .db
            .get_subscription(user_id)
            .ok()
            .flatten()
            .and_then(|sub| self.db.get_plan(&sub.plan_id).ok().flatten())
            .map(|plan| plan.limits.economic_models_only)
            .unwrap_or(false);

        if economic_only && !pricing::is_economic(profile_model) {
            tracing::debug!(
                model = profile_model,
                fallback = pricing::DEFAULT_MODEL,
                "Economic-only tier; substituting default economic model"
            );
            pricing::DEFAULT_MODEL.to_string()
        } else {
            profile_model.to_string()
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatOutcome;
    use crate::types::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockClient {
        requests: Mutex<Vec<ChatRequest>>,
        content: String,
    }

    impl MockClient {
        fn new(content: &str) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                content: content.to_string(),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for MockClient {
        fn tag(&self) -> &'static str {
            "openrouter"
        }

        async fn chat_once(&self, request: &ChatRequest) -> Result<ChatOutcome> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(ChatOutcome {
                content: self.content.clone(),
                tool_arguments: None,
                input_tokens: 500,
                output_tokens: 300,
                model: request.model.clone(),
                provider: "openrouter",
            })
        }
    }

    struct BrokeClient;

    #[async_trait]
    impl ProviderClient for BrokeClient {
        fn tag(&self) -> &'static str {
            "openrouter"
        }

        async fn chat_once(&self, _request: &ChatRequest) -> Result<ChatOutcome> {
            Err(Error::PaymentRequired("credits exhausted".to_string()))
        }
    }

    fn test_db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    }

    fn seed(db: &Database, with_snapshot: bool) {
        db.insert_user(&User {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            api_token: "tok-u1".to_string(),
            is_admin: false,
            created_at: Utc::now(),
        })
        .unwrap();
        db.insert_project(&Project {
            id: "p1".to_string(),
            user_id: "u1".to_string(),
            name: "demo".to_string(),
            repo_url: "https://github.com/acme/demo".to_string(),
            snapshot: if with_snapshot {
                RepoSnapshot {
                    readme: Some("# Demo\nA sample service".to_string()),
                    file_structure: Some("src/main.rs".to_string()),
                    ..Default::default()
                }
            } else {
                RepoSnapshot::default()
            },
            analysis_status: "idle".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap();
        db.enqueue_item(&QueueItem {
            id: "q1".to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            analysis_type: AnalysisType::Security,
            depth: DepthLevel::Critical,
            status: QueueStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn processing_completes_and_records_everything() {
        let db = test_db();
        seed(&db, true);
        let client = MockClient::new("## Security findings\nAll clear.");
        let processor = Processor::with_client(db.clone(), client.clone());

        let outcome = processor.process_item("q1").await.unwrap();
        let analysis_id = match outcome {
            ProcessOutcome::Completed { analysis_id, .. } => analysis_id,
            other => panic!("expected Completed, got {:?}", other),
        };

        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert!(item.started_at.is_some());
        assert!(item.completed_at.is_some());

        let analysis = db
            .latest_analysis("p1", AnalysisType::Security)
            .unwrap()
            .unwrap();
        assert_eq!(analysis.id, analysis_id);
        assert_eq!(analysis.content, "## Security findings\nAll clear.");
        assert!(analysis.prompt_hash.is_some());

        assert_eq!(db.count_usage("u1").unwrap(), 1);

        let project = db.get_project("p1").unwrap().unwrap();
        assert_eq!(project.analysis_status, "idle");

        // Prompt was assembled from the cached snapshot
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].user_prompt.contains("demo"));
        assert!(requests[0].user_prompt.contains("# Demo"));
        assert!(requests[0].system_prompt.contains("Security Review"));
    }

    #[tokio::test]
    async fn reprocessing_a_completed_item_is_idempotent() {
        let db = test_db();
        seed(&db, true);
        let client = MockClient::new("report");
        let processor = Processor::with_client(db.clone(), client.clone());

        processor.process_item("q1").await.unwrap();
        let second = processor.process_item("q1").await.unwrap();
        assert!(matches!(second, ProcessOutcome::AlreadyCompleted { .. }));

        // No duplicate analysis or ledger entry
        assert_eq!(db.count_analyses("p1", AnalysisType::Security).unwrap(), 1);
        assert_eq!(db.count_usage("u1").unwrap(), 1);
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_items_report_already_processing() {
        let db = test_db();
        seed(&db, true);
        // Another worker holds the claim
        assert!(db.claim_queue_item("q1", &Utc::now()).unwrap());

        let processor = Processor::with_client(db.clone(), MockClient::new("report"));
        let outcome = processor.process_item("q1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::AlreadyProcessing { .. }));
        assert_eq!(outcome.status(), QueueStatus::Processing);
    }

    #[tokio::test]
    async fn missing_snapshot_marks_the_item_errored() {
        let db = test_db();
        seed(&db, false);
        let processor = Processor::with_client(db.clone(), MockClient::new("report"));

        let outcome = processor.process_item("q1").await.unwrap();
        match outcome {
            ProcessOutcome::Failed {
                message,
                payment_required,
                ..
            } => {
                assert!(message.contains("snapshot"));
                assert!(!payment_required);
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Error);
        assert_eq!(item.retry_count, 1);
        assert!(item.error_message.unwrap().contains("snapshot"));

        let project = db.get_project("p1").unwrap().unwrap();
        assert_eq!(project.analysis_status, "error");

        assert!(db
            .latest_analysis("p1", AnalysisType::Security)
            .unwrap()
            .is_none());
        assert_eq!(db.count_usage("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn payment_required_is_flagged_and_not_retried() {
        let db = test_db();
        seed(&db, true);
        let processor = Processor::with_client(db.clone(), Arc::new(BrokeClient));

        let outcome = processor.process_item("q1").await.unwrap();
        match outcome {
            ProcessOutcome::Failed {
                payment_required, ..
            } => assert!(payment_required),
            other => panic!("expected Failed, got {:?}", other),
        }

        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Error);
    }

    #[tokio::test]
    async fn errored_items_stay_terminal() {
        let db = test_db();
        seed(&db, false);
        let processor = Processor::with_client(db.clone(), MockClient::new("report"));

        processor.process_item("q1").await.unwrap();
        let again = processor.process_item("q1").await.unwrap();
        assert!(matches!(again, ProcessOutcome::Failed { .. }));

        // No second attempt happened in place
        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
    }

    #[tokio::test]
    async fn economic_only_tiers_get_the_default_economic_model() {
        let db = test_db();
        seed(&db, true);
        // Free tier is seeded with economic_models_only = true
        db.upsert_subscription(&Subscription {
            user_id: "u1".to_string(),
            plan_id: "plan-free".to_string(),
            status: "active".to_string(),
            current_period_end: None,
            updated_at: Utc::now(),
        })
        .unwrap();
        // Balanced depth defaults to a non-economic model
        db.enqueue_item(&QueueItem {
            id: "q-balanced".to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            analysis_type: AnalysisType::Prd,
            depth: DepthLevel::Balanced,
            status: QueueStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
        .unwrap();

        let client = MockClient::new("report");
        let processor = Processor::with_client(db.clone(), client.clone());
        processor.process_item("q-balanced").await.unwrap();

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0].model, crate::pricing::DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn unknown_items_are_not_found() {
        let db = test_db();
        let processor = Processor::with_client(db, MockClient::new("report"));
        let err = processor.process_item("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
