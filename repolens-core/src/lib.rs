//! # repolens-core
//!
//! Core library for repolens - AI-powered repository analysis.
//!
//! This library provides:
//! - Domain types for projects, the analysis queue, reports, and plans
//! - SQLite storage layer with conditional-update queue claiming
//! - Plan/quota resolution over the append-only usage ledger
//! - AI provider abstraction (gateway + direct vendor) with backoff retry
//! - The queue processor state machine and structured extraction
//!
//! ## Architecture
//!
//! One job flows: enqueue (admission-checked) -> claim -> prompt assembly
//! from the cached repository snapshot -> provider call with retry ->
//! analysis + ledger rows -> terminal queue state. Implementation plans are
//! a separate, on-demand pipeline reading completed analyses.
//!
//! ## Example
//!
//! ```rust,no_run
//! use repolens_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use extract::PlanGenerator;
pub use queue::{ProcessOutcome, Processor};
pub use quota::{QuotaResolver, UserPlanView};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pricing;
pub mod provider;
pub mod queue;
pub mod quota;
pub mod types;
