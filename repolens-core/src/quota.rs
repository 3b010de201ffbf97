//! Plan & quota resolution
//!
//! Read-only view over the usage ledger and subscription tables. The one
//! deliberate side effect is lazy reconciliation: a user without a
//! subscription row is pointed at the free tier on first lookup.
//!
//! Lookups fail open: any error yields the conservative free-tier default
//! instead of blocking the user (availability over precision).

use crate::db::Database;
use crate::error::Result;
use crate::types::{AnalysisType, DepthLevel, PlanLimits, Subscription};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::sync::Arc;

/// Hard-coded monthly token cap applied when no plan information resolves
pub const FREE_TIER_TOKEN_CAP: i64 = 50_000;

/// Tier-default caps, used when a plan row omits `max_tokens_monthly`
fn default_cap_for_slug(slug: &str) -> Option<i64> {
    match slug {
        "free" => Some(FREE_TIER_TOKEN_CAP),
        "pro" => Some(1_000_000),
        "enterprise" => None,
        _ => Some(FREE_TIER_TOKEN_CAP),
    }
}

/// A user's effective plan position for the current calendar month.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserPlanView {
    /// Tier slug ("free" when nothing resolves)
    pub plan_slug: String,
    /// Tier display name
    pub plan_name: String,
    /// Sum of ledger tokens since the first instant of the month
    pub tokens_used: i64,
    /// Effective monthly cap; `None` means unlimited
    pub token_cap: Option<i64>,
    /// `max(0, cap - used)`; `None` when unlimited
    pub tokens_remaining: Option<i64>,
    /// Usage percent, clamped to [0, 100]; 0 when unlimited
    pub tokens_used_percent: f64,
    /// Whether a new analysis may be admitted
    pub can_analyze: bool,
    /// Human-readable explanation of `can_analyze`
    pub message: String,
    /// Deepest depth whose estimated cost fits the remaining budget
    pub suggested_depth: DepthLevel,
    /// Tier feature limits
    pub limits: PlanLimits,
}

/// Resolves plan/quota state for admission decisions and the usage surface.
pub struct QuotaResolver {
    db: Arc<Database>,
}

impl QuotaResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Minimum tokens needed to admit `analysis_count` critical-depth runs
    pub fn min_tokens_needed(analysis_count: usize) -> i64 {
        DepthLevel::Critical.token_estimate() * analysis_count as i64
    }

    /// Pick the deepest depth whose total estimated cost fits the budget.
    ///
    /// `None` remaining means unlimited and suggests `complete`; nothing
    /// fitting degrades to the `critical` floor.
    pub fn suggest_depth(tokens_remaining: Option<i64>, analysis_count: i64) -> DepthLevel {
        let Some(remaining) = tokens_remaining else {
            return DepthLevel::Complete;
        };
        for depth in DepthLevel::DEEPEST_FIRST {
            if depth.token_estimate() * analysis_count <= remaining {
                return depth;
            }
        }
        DepthLevel::Critical
    }

    /// Resolve the user's plan view, failing open to free-tier defaults.
    pub fn resolve(&self, user_id: &str) -> UserPlanView {
        match self.resolve_inner(user_id) {
            Ok(view) => view,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Plan lookup failed; using free-tier defaults");
                Self::free_tier_fallback()
            }
        }
    }

    fn resolve_inner(&self, user_id: &str) -> Result<UserPlanView> {
        let user = self.db.get_user(user_id)?;
        let is_admin = user.map(|u| u.is_admin).unwrap_or(false);

        let plan = self.resolve_plan(user_id)?;
        let (plan_slug, plan_name, plan_cap, limits) = match plan {
            Some(p) => (
                p.slug.clone(),
                p.name.clone(),
                p.max_tokens_monthly.or_else(|| default_cap_for_slug(&p.slug)),
                p.limits,
            ),
            None => (
                "free".to_string(),
                "Free".to_string(),
                Some(FREE_TIER_TOKEN_CAP),
                PlanLimits::default(),
            ),
        };

        let token_cap = if is_admin { None } else { plan_cap };

        let now = Utc::now();
        let tokens_used = self.db.tokens_used_since(user_id, &month_start(now))?;

        let tokens_remaining = token_cap.map(|cap| (cap - tokens_used).max(0));
        let tokens_used_percent = match token_cap {
            Some(cap) => ((tokens_used as f64 / cap.max(1) as f64) * 100.0).clamp(0.0, 100.0),
            None => 0.0,
        };

        let (can_analyze, message) = if is_admin {
            (true, "Administrator account; no quota applies".to_string())
        } else {
            match (token_cap, tokens_remaining) {
                (None, _) => (true, "Unlimited plan".to_string()),
                (Some(cap), _) if tokens_used >= cap => (
                    false,
                    format!(
                        "Monthly token limit reached ({} of {} used); upgrade your plan or wait for the next cycle",
                        tokens_used, cap
                    ),
                ),
                (Some(_), Some(remaining)) if remaining < Self::min_tokens_needed(1) => (
                    false,
                    format!(
                        "Insufficient tokens: {} remaining, a critical-depth analysis needs about {}",
                        remaining,
                        Self::min_tokens_needed(1)
                    ),
                ),
                (Some(_), Some(remaining)) => {
                    (true, format!("{} tokens available this month", remaining))
                }
                // cap is Some => remaining is Some; unreachable in practice
                (Some(_), None) => (true, "Usage within plan limits".to_string()),
            }
        };

        Ok(UserPlanView {
            plan_slug,
            plan_name,
            tokens_used,
            token_cap,
            tokens_remaining,
            tokens_used_percent,
            can_analyze,
            message,
            suggested_depth: Self::suggest_depth(tokens_remaining, 1),
            limits,
        })
    }

    /// Fetch the user's plan, lazily pointing subscription-less users at the
    /// free tier.
    fn resolve_plan(&self, user_id: &str) -> Result<Option<crate::types::PlanTier>> {
        if let Some(sub) = self.db.get_subscription(user_id)? {
            return self.db.get_plan(&sub.plan_id);
        }

        let free = self.db.get_plan_by_slug("free")?;
        if let Some(free_plan) = &free {
            // Reconciliation is best-effort; admission still works without it
            let _ = self.db.upsert_subscription(&Subscription {
                user_id: user_id.to_string(),
                plan_id: free_plan.id.clone(),
                status: "active".to_string(),
                current_period_end: None,
                updated_at: Utc::now(),
            });
        }
        Ok(free)
    }

    /// Admit or reject a batch of analyses before enqueueing.
    ///
    /// Soft limit: the check and the subsequent queue inserts are not one
    /// transaction, so concurrent bursts near the boundary may transiently
    /// over-admit.
    pub fn admit(
        &self,
        user_id: &str,
        analysis_types: &[AnalysisType],
        depth: DepthLevel,
    ) -> std::result::Result<UserPlanView, String> {
        let view = self.resolve(user_id);

        if !view.can_analyze {
            return Err(view.message.clone());
        }

        if !view.limits.allowed_depths.contains(&depth) {
            return Err(format!(
                "{} depth is not available on the {} plan",
                depth.as_str(),
                view.plan_name
            ));
        }
        if let Some(t) = analysis_types
            .iter()
            .find(|t| !view.limits.allowed_types.contains(t))
        {
            return Err(format!(
                "{} analyses are not available on the {} plan",
                t.display_name(),
                view.plan_name
            ));
        }

        if let Some(remaining) = view.tokens_remaining {
            let needed = depth.token_estimate() * analysis_types.len() as i64;
            if needed > remaining {
                let suggestion = Self::suggest_depth(Some(remaining), analysis_types.len() as i64);
                return Err(format!(
                    "Insufficient tokens for {} {} analyses (~{} needed, {} remaining); try {} depth",
                    analysis_types.len(),
                    depth.as_str(),
                    needed,
                    remaining,
                    suggestion.as_str()
                ));
            }
        }

        Ok(view)
    }

    fn free_tier_fallback() -> UserPlanView {
        UserPlanView {
            plan_slug: "free".to_string(),
            plan_name: "Free".to_string(),
            tokens_used: 0,
            token_cap: Some(FREE_TIER_TOKEN_CAP),
            tokens_remaining: Some(FREE_TIER_TOKEN_CAP),
            tokens_used_percent: 0.0,
            can_analyze: true,
            message: "Plan lookup unavailable; free-tier defaults applied".to_string(),
            suggested_depth: Self::suggest_depth(Some(FREE_TIER_TOKEN_CAP), 1),
            limits: PlanLimits::default(),
        }
    }
}

/// First instant of the current calendar month
fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUsageRecord;
    use crate::types::User;

    fn test_db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    }

    fn seed_user(db: &Database, id: &str, is_admin: bool) {
        db.insert_user(&User {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            api_token: format!("tok-{}", id),
            is_admin,
            created_at: Utc::now(),
        })
        .unwrap();
    }

    fn record_usage(db: &Database, user_id: &str, tokens: i64) {
        let now = Utc::now();
        db.insert_usage(&NewUsageRecord {
            user_id,
            project_id: None,
            analysis_type: "prd",
            depth: Some(DepthLevel::Critical),
            model: "gpt-4o-mini",
            provider: "openai",
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            estimated_cost: 0.0,
            created_at: &now,
        })
        .unwrap();
    }

    #[test]
    fn free_user_near_cap_cannot_analyze() {
        let db = test_db();
        seed_user(&db, "u1", false);
        record_usage(&db, "u1", 49_000);

        let view = QuotaResolver::new(db).resolve("u1");
        assert_eq!(view.token_cap, Some(50_000));
        assert_eq!(view.tokens_remaining, Some(1_000));
        assert!(!view.can_analyze);
        assert!(view.message.contains("Insufficient tokens"));
    }

    #[test]
    fn used_percent_is_clamped() {
        let db = test_db();
        seed_user(&db, "u1", false);
        record_usage(&db, "u1", 80_000);

        let view = QuotaResolver::new(db).resolve("u1");
        assert_eq!(view.tokens_used_percent, 100.0);
        assert_eq!(view.tokens_remaining, Some(0));
        assert!(!view.can_analyze);
    }

    #[test]
    fn admin_is_always_admitted() {
        let db = test_db();
        seed_user(&db, "admin", true);
        record_usage(&db, "admin", 10_000_000);

        let view = QuotaResolver::new(db).resolve("admin");
        assert!(view.can_analyze);
        assert_eq!(view.token_cap, None);
        assert_eq!(view.tokens_used_percent, 0.0);
        assert_eq!(view.suggested_depth, DepthLevel::Complete);
    }

    #[test]
    fn lazy_reconciliation_creates_free_subscription() {
        let db = test_db();
        seed_user(&db, "u1", false);
        assert!(db.get_subscription("u1").unwrap().is_none());

        QuotaResolver::new(db.clone()).resolve("u1");
        let sub = db.get_subscription("u1").unwrap().unwrap();
        assert_eq!(sub.plan_id, "plan-free");
    }

    #[test]
    fn lookup_failure_fails_open() {
        // No migrations: every table lookup errors out
        let db = Arc::new(Database::open_in_memory().unwrap());
        let view = QuotaResolver::new(db).resolve("u1");
        assert!(view.can_analyze);
        assert_eq!(view.token_cap, Some(FREE_TIER_TOKEN_CAP));
    }

    #[test]
    fn depth_suggestion_picks_deepest_that_fits() {
        assert_eq!(
            QuotaResolver::suggest_depth(Some(10_000), 1),
            DepthLevel::Complete
        );
        assert_eq!(
            QuotaResolver::suggest_depth(Some(3_000), 1),
            DepthLevel::Critical
        );
        assert_eq!(
            QuotaResolver::suggest_depth(Some(5_000), 1),
            DepthLevel::Balanced
        );
        assert_eq!(
            QuotaResolver::suggest_depth(Some(1_000), 1),
            DepthLevel::Critical
        );
        assert_eq!(QuotaResolver::suggest_depth(None, 6), DepthLevel::Complete);
        // Count scales the estimates
        assert_eq!(
            QuotaResolver::suggest_depth(Some(10_000), 2),
            DepthLevel::Balanced
        );
    }

    #[test]
    fn tier_limits_gate_requested_depth() {
        let db = test_db();
        seed_user(&db, "u1", false);

        // Seeded free tier allows critical depth only
        let resolver = QuotaResolver::new(db);
        assert!(resolver
            .admit("u1", &[AnalysisType::Prd], DepthLevel::Critical)
            .is_ok());
        let err = resolver
            .admit("u1", &[AnalysisType::Prd], DepthLevel::Complete)
            .unwrap_err();
        assert!(err.contains("not available"));
    }

    #[test]
    fn admission_scales_with_requested_batch() {
        let db = test_db();
        seed_user(&db, "u1", false);
        db.upsert_subscription(&Subscription {
            user_id: "u1".to_string(),
            plan_id: "plan-pro".to_string(),
            status: "active".to_string(),
            current_period_end: None,
            updated_at: Utc::now(),
        })
        .unwrap();
        // Pro cap is 1M; leave 8k remaining
        record_usage(&db, "u1", 992_000);

        let resolver = QuotaResolver::new(db);
        // Two balanced analyses (8k) fit exactly
        assert!(resolver
            .admit(
                "u1",
                &[AnalysisType::Prd, AnalysisType::Security],
                DepthLevel::Balanced
            )
            .is_ok());
        // Two complete analyses (16k) do not
        let err = resolver
            .admit(
                "u1",
                &[AnalysisType::Prd, AnalysisType::Security],
                DepthLevel::Complete
            )
            .unwrap_err();
        assert!(err.contains("Insufficient tokens"));
        assert!(err.contains("balanced"));
    }
}
