//! Request handlers for the repolens API

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use repolens_core::db::Database;
use repolens_core::extract::PlanGenerator;
use repolens_core::queue::{ProcessOutcome, Processor};
use repolens_core::quota::QuotaResolver;
use repolens_core::types::{
    AnalysisType, DepthLevel, Project, QueueItem, QueueStatus, Subscription, User,
};
use repolens_core::Error;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::require_user;
use crate::models::*;

/// Shared state behind every handler
pub struct ApiState {
    /// Storage layer
    pub db: Arc<Database>,
    /// Queue processor (one invocation per trigger call)
    pub processor: Arc<Processor>,
    /// Structured-extraction pipeline
    pub generator: Arc<PlanGenerator>,
    /// Plan & quota resolver
    pub resolver: QuotaResolver,
}

/// Health check endpoint
pub async fn health_check() -> Json<HashMap<String, String>> {
    let mut response = HashMap::new();
    response.insert("status".to_string(), "healthy".to_string());
    response.insert("service".to_string(), "repolens-api".to_string());
    Json(response)
}

/// Queue trigger: run one item to a terminal state.
///
/// Invoked by the internal job trigger, once per queue item. Always answers
/// with a well-formed JSON body; job-level failures land in the item's own
/// error fields and come back as `success: false`, not as a thrown error.
pub async fn process_queue_item(
    State(state): State<Arc<ApiState>>,
    Path(item_id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.processor.process_item(&item_id).await?;
    let analysis_type = outcome.analysis_type().as_str().to_string();
    let status = outcome.status().as_str().to_string();

    let response = match outcome {
        ProcessOutcome::Completed { .. }
        | ProcessOutcome::AlreadyCompleted { .. }
        | ProcessOutcome::AlreadyProcessing { .. } => (
            StatusCode::OK,
            Json(ProcessResponse {
                success: true,
                status,
                analysis_type,
                error: None,
            }),
        ),
        ProcessOutcome::Failed {
            message,
            payment_required,
            ..
        } => {
            let code = if payment_required {
                StatusCode::PAYMENT_REQUIRED
            } else {
                StatusCode::OK
            };
            (
                code,
                Json(ProcessResponse {
                    success: false,
                    status,
                    analysis_type,
                    error: Some(message),
                }),
            )
        }
    };
    Ok(response.into_response())
}

/// Enqueue analyses for a project, gated by quota admission.
///
/// Admission and insert are separate statements (soft limit); duplicate
/// open (type, depth) items are skipped rather than re-enqueued.
pub async fn enqueue_analyses(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    let project = owned_project(&state, &project_id, &user)?;

    let analysis_types = parse_analysis_types(&request.analysis_types)?;
    let depth = match &request.depth {
        Some(d) => d
            .parse::<DepthLevel>()
            .map_err(|e| ApiError(Error::InvalidInput(e)))?,
        None => DepthLevel::Critical,
    };

    state
        .resolver
        .admit(&user.id, &analysis_types, depth)
        .map_err(|message| ApiError(Error::QuotaExceeded(message)))?;

    let mut enqueued = Vec::new();
    let mut skipped = Vec::new();
    for analysis_type in analysis_types {
        if state.db.has_open_item(&project.id, analysis_type, depth)? {
            skipped.push(analysis_type.as_str().to_string());
            continue;
        }
        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            user_id: user.id.clone(),
            analysis_type,
            depth,
            status: QueueStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        state.db.enqueue_item(&item)?;
        enqueued.push(EnqueuedJob {
            id: item.id,
            analysis_type: analysis_type.as_str().to_string(),
        });
    }

    tracing::info!(
        project_id = %project.id,
        user_id = %user.id,
        enqueued = enqueued.len(),
        skipped = skipped.len(),
        depth = depth.as_str(),
        "Analyses enqueued"
    );

    Ok(Json(EnqueueResponse {
        success: true,
        depth: depth.as_str().to_string(),
        enqueued,
        skipped,
    }))
}

/// Cancel a still-pending queue item. Processing items run to completion;
/// there is no abort signal.
pub async fn cancel_queue_item(
    State(state): State<Arc<ApiState>>,
    Path(item_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    let item = state
        .db
        .get_queue_item(&item_id)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("queue item {}", item_id))))?;
    if item.user_id != user.id && !user.is_admin {
        return Err(ApiError(Error::Forbidden(
            "queue item belongs to another user".to_string(),
        )));
    }

    if !state.db.delete_pending_item(&item_id)? {
        return Err(ApiError(Error::InvalidInput(
            "only pending items can be cancelled".to_string(),
        )));
    }
    Ok(Json(OkResponse { success: true }))
}

/// Fetch a project (owner or admin)
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Project>, ApiError> {
    let user = require_user(&state, &headers)?;
    let project = owned_project(&state, &project_id, &user)?;
    Ok(Json(project))
}

/// Create an implementation plan from completed analyses
pub async fn create_implementation_plan(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<CreatePlanRequest>,
) -> Result<Json<CreatePlanResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    if request.project_id.trim().is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "project_id is required".to_string(),
        )));
    }
    let analysis_types = parse_analysis_types(&request.analysis_types)?;

    let (plan, items) = state
        .generator
        .generate(
            &user,
            &request.project_id,
            &analysis_types,
            request.title.clone(),
            request.focus.as_deref(),
        )
        .await?;

    Ok(Json(CreatePlanResponse {
        success: true,
        plan: PlanSummary {
            id: plan.id,
            title: plan.title,
            tokens_used: plan.tokens_used,
            items_count: items.len(),
        },
    }))
}

/// Delete a plan and its items together
pub async fn delete_implementation_plan(
    State(state): State<Arc<ApiState>>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    let plan = state
        .db
        .get_implementation_plan(&plan_id)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("implementation plan {}", plan_id))))?;
    if plan.user_id != user.id && !user.is_admin {
        return Err(ApiError(Error::Forbidden(
            "plan belongs to another user".to_string(),
        )));
    }
    state.db.delete_implementation_plan(&plan_id)?;
    Ok(Json(OkResponse { success: true }))
}

/// Toggle completion on a checklist item
pub async fn toggle_implementation_item(
    State(state): State<Arc<ApiState>>,
    Path(item_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ToggleItemRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    let item = state
        .db
        .get_implementation_item(&item_id)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("implementation item {}", item_id))))?;
    let plan = state
        .db
        .get_implementation_plan(&item.plan_id)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("implementation plan {}", item.plan_id))))?;
    if plan.user_id != user.id && !user.is_admin {
        return Err(ApiError(Error::Forbidden(
            "plan belongs to another user".to_string(),
        )));
    }
    state.db.set_item_completed(&item_id, request.completed)?;
    Ok(Json(OkResponse { success: true }))
}

/// Idempotent subscription sync pushed by the billing collaborator.
///
/// Upsert keyed on user id: replaying a sync event is a no-op.
pub async fn sync_subscription(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<SubscriptionSyncRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let caller = require_user(&state, &headers)?;
    if !caller.is_admin {
        return Err(ApiError(Error::Forbidden(
            "subscription sync is admin-only".to_string(),
        )));
    }

    let plan = state
        .db
        .get_plan_by_slug(&request.plan_slug)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("plan {}", request.plan_slug))))?;
    state.db.upsert_subscription(&Subscription {
        user_id: request.user_id.clone(),
        plan_id: plan.id,
        status: request.status.unwrap_or_else(|| "active".to_string()),
        current_period_end: request.current_period_end,
        updated_at: Utc::now(),
    })?;

    tracing::info!(user_id = %request.user_id, plan = %request.plan_slug, "Subscription synced");
    Ok(Json(OkResponse { success: true }))
}

/// Current plan/quota view for the authenticated user
pub async fn get_usage(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<repolens_core::UserPlanView>, ApiError> {
    let user = require_user(&state, &headers)?;
    Ok(Json(state.resolver.resolve(&user.id)))
}

/// Ledger aggregation by model; admins see the global view
pub async fn get_usage_by_model(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ModelUsageRow>>, ApiError> {
    let user = require_user(&state, &headers)?;
    let scope = if user.is_admin { None } else { Some(user.id.as_str()) };
    let rows = state
        .db
        .usage_by_model(scope)?
        .into_iter()
        .map(|u| ModelUsageRow {
            model: u.model,
            provider: u.provider,
            calls: u.calls,
            total_tokens: u.total_tokens,
            total_cost: u.total_cost,
        })
        .collect();
    Ok(Json(rows))
}

/// Ledger aggregation by depth level, for cost-estimation calibration
pub async fn get_usage_by_depth(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DepthUsageRow>>, ApiError> {
    require_user(&state, &headers)?;
    let rows = state
        .db
        .usage_by_depth()?
        .into_iter()
        .map(|u| DepthUsageRow {
            depth: u.depth.as_str().to_string(),
            calls: u.calls,
            avg_tokens: u.avg_tokens,
            avg_cost: u.avg_cost,
        })
        .collect();
    Ok(Json(rows))
}

/// Fetch a project and enforce ownership
fn owned_project(
    state: &ApiState,
    project_id: &str,
    user: &User,
) -> Result<Project, ApiError> {
    let project = state
        .db
        .get_project(project_id)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("project {}", project_id))))?;
    if project.user_id != user.id && !user.is_admin {
        return Err(ApiError(Error::Forbidden(
            "project belongs to another user".to_string(),
        )));
    }
    Ok(project)
}

/// Parse and validate analysis-type tags
fn parse_analysis_types(tags: &[String]) -> Result<Vec<AnalysisType>, ApiError> {
    if tags.is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "analysis_types must not be empty".to_string(),
        )));
    }
    tags.iter()
        .map(|tag| {
            tag.parse::<AnalysisType>()
                .map_err(|e| ApiError(Error::InvalidInput(e)))
        })
        .collect()
}
