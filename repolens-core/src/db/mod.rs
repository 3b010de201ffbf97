//! Database layer for repolens
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - Conditional-update claim semantics for the analysis queue

pub mod repo;
pub mod schema;

pub use repo::{Database, DepthUsage, ModelUsage, NewUsageRecord};
