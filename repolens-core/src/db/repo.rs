//! Database repository layer
//!
//! Provides query and insert operations for all entity types. The queue claim
//! is a conditional update, so single-flight processing is enforced here
//! rather than by callers reading and re-writing status.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Usage ledger entry ready for insert.
#[derive(Debug, Clone)]
pub struct NewUsageRecord<'a> {
    pub user_id: &'a str,
    pub project_id: Option<&'a str>,
    /// Analysis-type tag, or [`EXTRACTION_USAGE_TAG`]
    pub analysis_type: &'a str,
    pub depth: Option<DepthLevel>,
    pub model: &'a str,
    pub provider: &'a str,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost: f64,
    pub created_at: &'a DateTime<Utc>,
}

/// Per-model ledger aggregate for cost-efficiency reporting.
#[derive(Debug, Clone)]
pub struct ModelUsage {
    pub model: String,
    pub provider: String,
    pub calls: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

/// Per-depth ledger aggregate for estimate calibration.
#[derive(Debug, Clone)]
pub struct DepthUsage {
    pub depth: DepthLevel,
    pub calls: i64,
    pub avg_tokens: f64,
    pub avg_cost: f64,
}

/// Database handle (single pooled connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // User operations
    // ============================================

    /// Insert a user
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO users (id, email, api_token, is_admin, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                user.id,
                user.email,
                user.api_token,
                user.is_admin,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a user by ID
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM users WHERE id = ?", [id], Self::row_to_user)
            .optional()
            .map_err(Error::from)
    }

    /// Resolve a bearer token to a user
    pub fn get_user_by_token(&self, token: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM users WHERE api_token = ?",
            [token],
            Self::row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_user(row: &Row) -> rusqlite::Result<User> {
        let created_at_str: String = row.get("created_at")?;
        Ok(User {
            id: row.get("id")?,
            email: row.get("email")?,
            api_token: row.get("api_token")?,
            is_admin: row.get("is_admin")?,
            created_at: parse_ts(&created_at_str),
        })
    }

    // ============================================
    // Plan & subscription operations
    // ============================================

    /// Get a plan tier by ID
    pub fn get_plan(&self, id: &str) -> Result<Option<PlanTier>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM plans WHERE id = ?", [id], Self::row_to_plan)
            .optional()
            .map_err(Error::from)
    }

    /// Get a plan tier by slug
    pub fn get_plan_by_slug(&self, slug: &str) -> Result<Option<PlanTier>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM plans WHERE slug = ?",
            [slug],
            Self::row_to_plan,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Insert or update a subscription (idempotent billing sync)
    pub fn upsert_subscription(&self, sub: &Subscription) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO user_subscriptions (user_id, plan_id, status, current_period_end, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                status = excluded.status,
                current_period_end = excluded.current_period_end,
                updated_at = excluded.updated_at
            "#,
            params![
                sub.user_id,
                sub.plan_id,
                sub.status,
                sub.current_period_end.map(|t| t.to_rfc3339()),
                sub.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a user's subscription
    pub fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM user_subscriptions WHERE user_id = ?",
            [user_id],
            Self::row_to_subscription,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_plan(row: &Row) -> rusqlite::Result<PlanTier> {
        let config_str: Option<String> = row.get("config")?;
        Ok(PlanTier {
            id: row.get("id")?,
            slug: row.get("slug")?,
            name: row.get("name")?,
            monthly_limit: row.get("monthly_limit")?,
            daily_limit: row.get("daily_limit")?,
            max_tokens_monthly: row.get("max_tokens_monthly")?,
            limits: config_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
        })
    }

    fn row_to_subscription(row: &Row) -> rusqlite::Result<Subscription> {
        let period_end_str: Option<String> = row.get("current_period_end")?;
        let updated_at_str: String = row.get("updated_at")?;
        Ok(Subscription {
            user_id: row.get("user_id")?,
            plan_id: row.get("plan_id")?,
            status: row.get("status")?,
            current_period_end: period_end_str.as_deref().map(parse_ts),
            updated_at: parse_ts(&updated_at_str),
        })
    }

    // ============================================
    // Project operations
    // ============================================

    /// Insert a project
    pub fn insert_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO projects (id, user_id, name, repo_url, readme, file_structure,
                                  dependency_manifest, source_excerpts, repo_config,
                                  analysis_status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                project.id,
                project.user_id,
                project.name,
                project.repo_url,
                project.snapshot.readme,
                project.snapshot.file_structure,
                project.snapshot.dependency_manifest,
                project.snapshot.source_excerpts,
                project.snapshot.repo_config,
                project.analysis_status,
                project.created_at.to_rfc3339(),
                project.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a project by ID
    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM projects WHERE id = ?",
            [id],
            Self::row_to_project,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List a user's projects, most recently updated first
    pub fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM projects WHERE user_id = ? ORDER BY updated_at DESC")?;
        let projects = stmt
            .query_map([user_id], Self::row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Update the advisory analysis-status tag
    pub fn update_project_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE projects SET analysis_status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Replace the cached repository snapshot (ingestion collaborator)
    pub fn update_project_snapshot(&self, id: &str, snapshot: &RepoSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE projects SET readme = ?2, file_structure = ?3, dependency_manifest = ?4,
                                source_excerpts = ?5, repo_config = ?6, updated_at = ?7
            WHERE id = ?1
            "#,
            params![
                id,
                snapshot.readme,
                snapshot.file_structure,
                snapshot.dependency_manifest,
                snapshot.source_excerpts,
                snapshot.repo_config,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
        let created_at_str: String = row.get("created_at")?;
        let updated_at_str: String = row.get("updated_at")?;
        Ok(Project {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            repo_url: row.get("repo_url")?,
            snapshot: RepoSnapshot {
                readme: row.get("readme")?,
                file_structure: row.get("file_structure")?,
                dependency_manifest: row.get("dependency_manifest")?,
                source_excerpts: row.get("source_excerpts")?,
                repo_config: row.get("repo_config")?,
            },
            analysis_status: row.get("analysis_status")?,
            created_at: parse_ts(&created_at_str),
            updated_at: parse_ts(&updated_at_str),
        })
    }

    // ============================================
    // Queue operations
    // ============================================

    /// Enqueue a new analysis job
    pub fn enqueue_item(&self, item: &QueueItem) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO analysis_queue (id, project_id, user_id, analysis_type, depth,
                                        status, retry_count, error_message,
                                        created_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                item.id,
                item.project_id,
                item.user_id,
                item.analysis_type.as_str(),
                item.depth.as_str(),
                item.status.as_str(),
                item.retry_count,
                item.error_message,
                item.created_at.to_rfc3339(),
                item.started_at.map(|t| t.to_rfc3339()),
                item.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Get a queue item by ID
    pub fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM analysis_queue WHERE id = ?",
            [id],
            Self::row_to_queue_item,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Claim a pending item for processing.
    ///
    /// Conditional update: succeeds only if the item is still `pending`, so
    /// concurrent trigger invocations cannot both claim it. Returns whether
    /// this caller won the claim.
    pub fn claim_queue_item(&self, id: &str, started_at: &DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE analysis_queue
            SET status = 'processing', started_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![id, started_at.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Transition a processing item to `completed`
    pub fn complete_queue_item(&self, id: &str, completed_at: &DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE analysis_queue
            SET status = 'completed', completed_at = ?2, error_message = NULL
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id, completed_at.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Transition a processing item to `error`, recording the message and
    /// bumping the retry counter
    pub fn fail_queue_item(
        &self,
        id: &str,
        error_message: &str,
        completed_at: &DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE analysis_queue
            SET status = 'error', error_message = ?2,
                retry_count = retry_count + 1, completed_at = ?3
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id, error_message, completed_at.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Delete a still-pending item (the only supported cancellation)
    pub fn delete_pending_item(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM analysis_queue WHERE id = ? AND status = 'pending'",
            [id],
        )?;
        Ok(changed == 1)
    }

    /// List pending items, oldest first
    pub fn list_pending_items(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM analysis_queue WHERE status = 'pending' ORDER BY created_at LIMIT ?",
        )?;
        let items = stmt
            .query_map([limit as i64], Self::row_to_queue_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Whether an open (pending or processing) item already exists for this
    /// (project, type, depth); used at enqueue time to avoid duplicates
    pub fn has_open_item(
        &self,
        project_id: &str,
        analysis_type: AnalysisType,
        depth: DepthLevel,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM analysis_queue
            WHERE project_id = ?1 AND analysis_type = ?2 AND depth = ?3
              AND status IN ('pending', 'processing')
            "#,
            params![project_id, analysis_type.as_str(), depth.as_str()],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn row_to_queue_item(row: &Row) -> rusqlite::Result<QueueItem> {
        let type_str: String = row.get("analysis_type")?;
        let depth_str: String = row.get("depth")?;
        let status_str: String = row.get("status")?;
        let created_at_str: String = row.get("created_at")?;
        let started_at_str: Option<String> = row.get("started_at")?;
        let completed_at_str: Option<String> = row.get("completed_at")?;
        Ok(QueueItem {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            user_id: row.get("user_id")?,
            analysis_type: type_str.parse().unwrap_or(AnalysisType::Prd),
            depth: depth_str.parse().unwrap_or(DepthLevel::Critical),
            status: status_str.parse().unwrap_or(QueueStatus::Error),
            retry_count: row.get("retry_count")?,
            error_message: row.get("error_message")?,
            created_at: parse_ts(&created_at_str),
            started_at: started_at_str.as_deref().map(parse_ts),
            completed_at: completed_at_str.as_deref().map(parse_ts),
        })
    }

    // ============================================
    // Analysis operations
    // ============================================

    /// Insert an analysis report
    pub fn insert_analysis(&self, analysis: &Analysis) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO analyses (id, project_id, analysis_type, content, model, prompt_hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                analysis.id,
                analysis.project_id,
                analysis.analysis_type.as_str(),
                analysis.content,
                analysis.model,
                analysis.prompt_hash,
                analysis.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest analysis for a (project, type); older rows are superseded
    pub fn latest_analysis(
        &self,
        project_id: &str,
        analysis_type: AnalysisType,
    ) -> Result<Option<Analysis>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT * FROM analyses
            WHERE project_id = ?1 AND analysis_type = ?2
            ORDER BY created_at DESC, id DESC LIMIT 1
            "#,
            params![project_id, analysis_type.as_str()],
            Self::row_to_analysis,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Count analyses for a (project, type); audit/test helper
    pub fn count_analyses(&self, project_id: &str, analysis_type: AnalysisType) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analyses WHERE project_id = ?1 AND analysis_type = ?2",
            params![project_id, analysis_type.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    fn row_to_analysis(row: &Row) -> rusqlite::Result<Analysis> {
        let type_str: String = row.get("analysis_type")?;
        let created_at_str: String = row.get("created_at")?;
        Ok(Analysis {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            analysis_type: type_str.parse().unwrap_or(AnalysisType::Prd),
            content: row.get("content")?,
            model: row.get("model")?,
            prompt_hash: row.get("prompt_hash")?,
            created_at: parse_ts(&created_at_str),
        })
    }

    // ============================================
    // Usage ledger operations
    // ============================================

    /// Append a ledger entry; returns the row id
    pub fn insert_usage(&self, record: &NewUsageRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO analysis_usage (user_id, project_id, analysis_type, depth, model,
                                        provider, input_tokens, output_tokens,
                                        estimated_tokens, estimated_cost, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.user_id,
                record.project_id,
                record.analysis_type,
                record.depth.map(|d| d.as_str()),
                record.model,
                record.provider,
                record.input_tokens,
                record.output_tokens,
                record.input_tokens + record.output_tokens,
                record.estimated_cost,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Sum of estimated tokens for a user since a window start
    pub fn tokens_used_since(&self, user_id: &str, since: &DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(estimated_tokens), 0) FROM analysis_usage
            WHERE user_id = ?1 AND created_at >= ?2
            "#,
            params![user_id, since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// Count ledger entries with a given tag since a window start
    /// (rolling-window rate limiting)
    pub fn count_usage_tagged_since(
        &self,
        user_id: &str,
        tag: &str,
        since: &DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM analysis_usage
            WHERE user_id = ?1 AND analysis_type = ?2 AND created_at >= ?3
            "#,
            params![user_id, tag, since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Oldest tagged ledger entry inside the window (retry-after hints)
    pub fn oldest_usage_tagged_since(
        &self,
        user_id: &str,
        tag: &str,
        since: &DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let oldest: Option<String> = conn
            .query_row(
                r#"
                SELECT MIN(created_at) FROM analysis_usage
                WHERE user_id = ?1 AND analysis_type = ?2 AND created_at >= ?3
                "#,
                params![user_id, tag, since.to_rfc3339()],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(oldest.as_deref().map(parse_ts))
    }

    /// Count all ledger rows for a user; audit/test helper
    pub fn count_usage(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_usage WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Aggregate the ledger by model for cost-efficiency reporting
    pub fn usage_by_model(&self, user_id: Option<&str>) -> Result<Vec<ModelUsage>> {
        let conn = self.conn.lock().unwrap();
        let sql = match user_id {
            Some(_) => {
                r#"
                SELECT model, provider, COUNT(*), SUM(estimated_tokens), SUM(estimated_cost)
                FROM analysis_usage WHERE user_id = ?1
                GROUP BY model, provider ORDER BY SUM(estimated_cost) DESC
                "#
            }
            None => {
                r#"
                SELECT model, provider, COUNT(*), SUM(estimated_tokens), SUM(estimated_cost)
                FROM analysis_usage
                GROUP BY model, provider ORDER BY SUM(estimated_cost) DESC
                "#
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &Row| -> rusqlite::Result<ModelUsage> {
            Ok(ModelUsage {
                model: row.get(0)?,
                provider: row.get(1)?,
                calls: row.get(2)?,
                total_tokens: row.get(3)?,
                total_cost: row.get(4)?,
            })
        };
        let rows = match user_id {
            Some(uid) => stmt
                .query_map([uid], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// Aggregate the ledger by depth for estimate calibration
    pub fn usage_by_depth(&self) -> Result<Vec<DepthUsage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT depth, COUNT(*), AVG(estimated_tokens), AVG(estimated_cost)
            FROM analysis_usage WHERE depth IS NOT NULL
            GROUP BY depth
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                let depth_str: String = row.get(0)?;
                Ok((
                    depth_str,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(depth_str, calls, avg_tokens, avg_cost)| {
                depth_str.parse().ok().map(|depth| DepthUsage {
                    depth,
                    calls,
                    avg_tokens,
                    avg_cost,
                })
            })
            .collect())
    }

    // ============================================
    // Implementation plan operations
    // ============================================

    /// Insert a plan and all of its items in one transaction
    pub fn insert_implementation_plan(
        &self,
        plan: &ImplementationPlan,
        items: &[ImplementationItem],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO implementation_plans (id, project_id, user_id, title, source_analyses,
                                              tokens_used, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                plan.id,
                plan.project_id,
                plan.user_id,
                plan.title,
                serde_json::to_string(&plan.source_analyses).unwrap_or_else(|_| "[]".to_string()),
                plan.tokens_used,
                plan.created_at.to_rfc3339(),
            ],
        )?;
        for item in items {
            tx.execute(
                r#"
                INSERT INTO implementation_items (id, plan_id, category, title, description,
                                                  source_analysis, completed, completed_at, sort_order)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    item.id,
                    item.plan_id,
                    item.category.as_str(),
                    item.title,
                    item.description,
                    item.source_analysis,
                    item.completed,
                    item.completed_at.map(|t| t.to_rfc3339()),
                    item.sort_order,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get an implementation plan by ID
    pub fn get_implementation_plan(&self, id: &str) -> Result<Option<ImplementationPlan>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM implementation_plans WHERE id = ?",
            [id],
            Self::row_to_implementation_plan,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List a plan's items in sort order
    pub fn list_implementation_items(&self, plan_id: &str) -> Result<Vec<ImplementationItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM implementation_items WHERE plan_id = ? ORDER BY sort_order",
        )?;
        let items = stmt
            .query_map([plan_id], Self::row_to_implementation_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Get a single item by ID
    pub fn get_implementation_item(&self, item_id: &str) -> Result<Option<ImplementationItem>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM implementation_items WHERE id = ?",
            [item_id],
            Self::row_to_implementation_item,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Toggle an item's completion flag
    pub fn set_item_completed(&self, item_id: &str, completed: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let completed_at = completed.then(|| Utc::now().to_rfc3339());
        let changed = conn.execute(
            "UPDATE implementation_items SET completed = ?2, completed_at = ?3 WHERE id = ?1",
            params![item_id, completed, completed_at],
        )?;
        Ok(changed == 1)
    }

    /// Delete a plan and its items together
    pub fn delete_implementation_plan(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM implementation_items WHERE plan_id = ?", [id])?;
        let changed = tx.execute("DELETE FROM implementation_plans WHERE id = ?", [id])?;
        tx.commit()?;
        Ok(changed == 1)
    }

    fn row_to_implementation_plan(row: &Row) -> rusqlite::Result<ImplementationPlan> {
        let sources_str: String = row.get("source_analyses")?;
        let created_at_str: String = row.get("created_at")?;
        Ok(ImplementationPlan {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            user_id: row.get("user_id")?,
            title: row.get("title")?,
            source_analyses: serde_json::from_str(&sources_str).unwrap_or_default(),
            tokens_used: row.get("tokens_used")?,
            created_at: parse_ts(&created_at_str),
        })
    }

    fn row_to_implementation_item(row: &Row) -> rusqlite::Result<ImplementationItem> {
        let category_str: String = row.get("category")?;
        let completed_at_str: Option<String> = row.get("completed_at")?;
        Ok(ImplementationItem {
            id: row.get("id")?,
            plan_id: row.get("plan_id")?,
            category: category_str.parse().unwrap_or(ItemCategory::Improvement),
            title: row.get("title")?,
            description: row.get("description")?,
            source_analysis: row.get("source_analysis")?,
            completed: row.get("completed")?,
            completed_at: completed_at_str.as_deref().map(parse_ts),
            sort_order: row.get("sort_order")?,
        })
    }

    // ============================================
    // Settings operations
    // ============================================

    /// Set a runtime setting
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO app_settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get a runtime setting
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM app_settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Load every runtime setting in one read
    pub fn all_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM app_settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<String, String>, _>>()?;
        Ok(rows)
    }
}

/// Parse a stored RFC3339 timestamp, degrading to now on corruption
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn seed_user(db: &Database, id: &str) {
        db.insert_user(&User {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            api_token: format!("tok-{}", id),
            is_admin: false,
            created_at: Utc::now(),
        })
        .unwrap();
    }

    fn seed_project(db: &Database, id: &str, user_id: &str) {
        db.insert_project(&Project {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: "demo".to_string(),
            repo_url: "https://github.com/acme/demo".to_string(),
            snapshot: RepoSnapshot {
                readme: Some("# Demo".to_string()),
                ..Default::default()
            },
            analysis_status: "idle".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap();
    }

    fn pending_item(id: &str, project_id: &str, user_id: &str) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            analysis_type: AnalysisType::Prd,
            depth: DepthLevel::Critical,
            status: QueueStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn claim_is_single_flight() {
        let db = test_db();
        seed_user(&db, "u1");
        seed_project(&db, "p1", "u1");
        db.enqueue_item(&pending_item("q1", "p1", "u1")).unwrap();

        let now = Utc::now();
        assert!(db.claim_queue_item("q1", &now).unwrap());
        // Second claim loses the race
        assert!(!db.claim_queue_item("q1", &now).unwrap());

        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
        assert!(item.started_at.is_some());
    }

    #[test]
    fn completed_items_never_transition_again() {
        let db = test_db();
        seed_user(&db, "u1");
        seed_project(&db, "p1", "u1");
        db.enqueue_item(&pending_item("q1", "p1", "u1")).unwrap();

        let now = Utc::now();
        assert!(db.claim_queue_item("q1", &now).unwrap());
        assert!(db.complete_queue_item("q1", &now).unwrap());

        // Terminal: neither fail nor complete may fire again
        assert!(!db.fail_queue_item("q1", "late failure", &now).unwrap());
        assert!(!db.complete_queue_item("q1", &now).unwrap());
        assert!(!db.claim_queue_item("q1", &now).unwrap());

        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn failing_bumps_retry_count() {
        let db = test_db();
        seed_user(&db, "u1");
        seed_project(&db, "p1", "u1");
        db.enqueue_item(&pending_item("q1", "p1", "u1")).unwrap();

        let now = Utc::now();
        db.claim_queue_item("q1", &now).unwrap();
        db.fail_queue_item("q1", "provider exploded", &now).unwrap();

        let item = db.get_queue_item("q1").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Error);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error_message.as_deref(), Some("provider exploded"));
    }

    #[test]
    fn pending_items_can_be_deleted_processing_cannot() {
        let db = test_db();
        seed_user(&db, "u1");
        seed_project(&db, "p1", "u1");
        db.enqueue_item(&pending_item("q1", "p1", "u1")).unwrap();
        db.enqueue_item(&QueueItem {
            analysis_type: AnalysisType::Security,
            ..pending_item("q2", "p1", "u1")
        })
        .unwrap();

        db.claim_queue_item("q1", &Utc::now()).unwrap();
        assert!(!db.delete_pending_item("q1").unwrap());
        assert!(db.delete_pending_item("q2").unwrap());
    }

    #[test]
    fn latest_analysis_supersedes_older() {
        let db = test_db();
        seed_user(&db, "u1");
        seed_project(&db, "p1", "u1");

        let old = Utc::now() - Duration::hours(2);
        db.insert_analysis(&Analysis {
            id: "a1".to_string(),
            project_id: "p1".to_string(),
            analysis_type: AnalysisType::Prd,
            content: "old".to_string(),
            model: None,
            prompt_hash: None,
            created_at: old,
        })
        .unwrap();
        db.insert_analysis(&Analysis {
            id: "a2".to_string(),
            project_id: "p1".to_string(),
            analysis_type: AnalysisType::Prd,
            content: "new".to_string(),
            model: Some("gpt-4o-mini".to_string()),
            prompt_hash: None,
            created_at: Utc::now(),
        })
        .unwrap();

        let latest = db.latest_analysis("p1", AnalysisType::Prd).unwrap().unwrap();
        assert_eq!(latest.content, "new");
        assert_eq!(db.count_analyses("p1", AnalysisType::Prd).unwrap(), 2);
    }

    #[test]
    fn subscription_upsert_is_idempotent() {
        let db = test_db();
        seed_user(&db, "u1");

        let sub = Subscription {
            user_id: "u1".to_string(),
            plan_id: "plan-free".to_string(),
            status: "active".to_string(),
            current_period_end: None,
            updated_at: Utc::now(),
        };
        db.upsert_subscription(&sub).unwrap();
        db.upsert_subscription(&Subscription {
            plan_id: "plan-pro".to_string(),
            ..sub
        })
        .unwrap();

        let stored = db.get_subscription("u1").unwrap().unwrap();
        assert_eq!(stored.plan_id, "plan-pro");
    }

    #[test]
    fn ledger_sums_respect_window() {
        let db = test_db();
        seed_user(&db, "u1");

        let now = Utc::now();
        let last_month = now - Duration::days(40);
        for (tokens, at) in [(1_000_i64, &last_month), (2_000, &now), (3_000, &now)] {
            db.insert_usage(&NewUsageRecord {
                user_id: "u1",
                project_id: None,
                analysis_type: "prd",
                depth: Some(DepthLevel::Critical),
                model: "gpt-4o-mini",
                provider: "openai",
                input_tokens: tokens / 2,
                output_tokens: tokens - tokens / 2,
                estimated_cost: 0.001,
                created_at: at,
            })
            .unwrap();
        }

        let window_start = now - Duration::days(30);
        assert_eq!(db.tokens_used_since("u1", &window_start).unwrap(), 5_000);

        let by_model = db.usage_by_model(Some("u1")).unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].calls, 3);
        assert_eq!(by_model[0].total_tokens, 6_000);
    }

    #[test]
    fn implementation_plan_round_trip_and_delete() {
        let db = test_db();
        seed_user(&db, "u1");
        seed_project(&db, "p1", "u1");

        let plan = ImplementationPlan {
            id: "ip1".to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            title: "Launch checklist".to_string(),
            source_analyses: vec!["prd".to_string(), "seguranca".to_string()],
            tokens_used: 1_234,
            created_at: Utc::now(),
        };
        let items = vec![
            ImplementationItem {
                id: "it1".to_string(),
                plan_id: "ip1".to_string(),
                category: ItemCategory::Critical,
                title: "Rotate leaked key".to_string(),
                description: None,
                source_analysis: "seguranca".to_string(),
                completed: false,
                completed_at: None,
                sort_order: 0,
            },
            ImplementationItem {
                id: "it2".to_string(),
                plan_id: "ip1".to_string(),
                category: ItemCategory::Improvement,
                title: "Add caching".to_string(),
                description: Some("Redis in front of the API".to_string()),
                source_analysis: "performance".to_string(),
                completed: false,
                completed_at: None,
                sort_order: 1,
            },
        ];
        db.insert_implementation_plan(&plan, &items).unwrap();

        let stored = db.get_implementation_plan("ip1").unwrap().unwrap();
        assert_eq!(stored.source_analyses.len(), 2);
        assert_eq!(db.list_implementation_items("ip1").unwrap().len(), 2);

        assert!(db.set_item_completed("it1", true).unwrap());
        let items = db.list_implementation_items("ip1").unwrap();
        assert!(items[0].completed);
        assert!(items[0].completed_at.is_some());

        assert!(db.delete_implementation_plan("ip1").unwrap());
        assert!(db.get_implementation_plan("ip1").unwrap().is_none());
        assert!(db.list_implementation_items("ip1").unwrap().is_empty());
    }

    #[test]
    fn settings_round_trip() {
        let db = test_db();
        assert!(db.get_setting("ai_provider").unwrap().is_none());
        db.set_setting("ai_provider", "direct").unwrap();
        db.set_setting("ai_provider", "gateway").unwrap();
        assert_eq!(
            db.get_setting("ai_provider").unwrap().as_deref(),
            Some("gateway")
        );
        assert_eq!(db.all_settings().unwrap().len(), 1);
    }
}
