//! Bearer-token authentication for user-facing endpoints
//!
//! GitHub OAuth lives in an external collaborator; by the time requests
//! reach this API a user holds an opaque API token, resolved here against
//! the users table.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use repolens_core::{Error, User};

use crate::handlers::ApiState;
use crate::models::ApiError;

/// Resolve the request's bearer token to a user, or fail with 401.
pub fn require_user(state: &ApiState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError(Error::Unauthorized("missing bearer token".to_string())))?;

    state
        .db
        .get_user_by_token(token)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError(Error::Unauthorized("invalid token".to_string())))
}
