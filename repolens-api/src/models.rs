//! API request/response models and error mapping

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use repolens_core::Error;
use serde::{Deserialize, Serialize};

// ============================================
// Request bodies
// ============================================

/// Body for `POST /api/projects/:id/enqueue`
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Analysis-type tags to enqueue
    pub analysis_types: Vec<String>,
    /// Depth tag; defaults to `critical` when omitted
    pub depth: Option<String>,
}

/// Body for `POST /api/implementation-plans`
#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub project_id: String,
    pub analysis_types: Vec<String>,
    pub title: Option<String>,
    pub focus: Option<String>,
}

/// Body for `POST /api/implementation-items/:id/toggle`
#[derive(Debug, Deserialize)]
pub struct ToggleItemRequest {
    pub completed: bool,
}

/// Body for `POST /api/subscriptions/sync` (billing collaborator, admin-only)
#[derive(Debug, Deserialize)]
pub struct SubscriptionSyncRequest {
    pub user_id: String,
    pub plan_slug: String,
    /// Billing status; defaults to "active"
    pub status: Option<String>,
    pub current_period_end: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================
// Response bodies
// ============================================

/// Trigger endpoint response: always well-formed JSON, never a bare error
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub status: String,
    pub analysis_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueuedJob {
    pub id: String,
    pub analysis_type: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub depth: String,
    pub enqueued: Vec<EnqueuedJob>,
    /// Types skipped because an open item already exists
    pub skipped: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanSummary {
    pub id: String,
    pub title: String,
    pub tokens_used: i64,
    pub items_count: usize,
}

#[derive(Debug, Serialize)]
pub struct CreatePlanResponse {
    pub success: bool,
    pub plan: PlanSummary,
}

#[derive(Debug, Serialize)]
pub struct ModelUsageRow {
    pub model: String,
    pub provider: String,
    pub calls: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

#[derive(Debug, Serialize)]
pub struct DepthUsageRow {
    pub depth: String,
    pub calls: i64,
    pub avg_tokens: f64,
    pub avg_cost: f64,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub success: bool,
}

/// Structured error body shared by every non-2xx response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

// ============================================
// Error mapping
// ============================================

/// Wrapper mapping core errors onto the HTTP taxonomy.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Error::Forbidden(_) | Error::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed unexpectedly");
        }

        let body = Json(ErrorBody {
            success: false,
            error: self.0.to_string(),
        });

        let mut response = (status, body).into_response();
        if let Error::RateLimited {
            retry_after_secs,
            limit,
        } = &self.0
        {
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert(header::RETRY_AFTER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", v);
            }
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        }
        response
    }
}
