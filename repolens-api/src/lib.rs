//! repolens HTTP API
//!
//! Exposes the queue trigger, enqueue/admission, structured extraction, and
//! usage surfaces over axum. Binaries: `repolens-api` (server) and
//! `repolens-worker` (one-shot queue drainer).

pub mod auth;
pub mod handlers;
pub mod models;
pub mod server;

pub use handlers::ApiState;
pub use server::ApiServer;
