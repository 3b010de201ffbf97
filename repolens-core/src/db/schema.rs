//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Accounts & subscriptions
    -- ============================================

    CREATE TABLE IF NOT EXISTS users (
        id               TEXT PRIMARY KEY,
        email            TEXT NOT NULL,
        api_token        TEXT NOT NULL UNIQUE,
        is_admin         INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS plans (
        id                 TEXT PRIMARY KEY,
        slug               TEXT NOT NULL UNIQUE,
        name               TEXT NOT NULL,
        monthly_limit      INTEGER,
        daily_limit        INTEGER,
        max_tokens_monthly INTEGER,
        config             JSON
    );

    CREATE TABLE IF NOT EXISTS user_subscriptions (
        user_id            TEXT PRIMARY KEY REFERENCES users(id),
        plan_id            TEXT NOT NULL REFERENCES plans(id),
        status             TEXT NOT NULL,
        current_period_end DATETIME,
        updated_at         DATETIME NOT NULL
    );

    -- ============================================
    -- Projects & analyses
    -- ============================================

    CREATE TABLE IF NOT EXISTS projects (
        id                  TEXT PRIMARY KEY,
        user_id             TEXT NOT NULL REFERENCES users(id),
        name                TEXT NOT NULL,
        repo_url            TEXT NOT NULL,
        readme              TEXT,
        file_structure      TEXT,
        dependency_manifest TEXT,
        source_excerpts     TEXT,
        repo_config         TEXT,
        analysis_status     TEXT NOT NULL DEFAULT 'idle',
        created_at          DATETIME NOT NULL,
        updated_at          DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS analyses (
        id               TEXT PRIMARY KEY,
        project_id       TEXT NOT NULL REFERENCES projects(id),
        analysis_type    TEXT NOT NULL,
        content          TEXT NOT NULL,
        model            TEXT,
        prompt_hash      TEXT,
        created_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS analysis_queue (
        id               TEXT PRIMARY KEY,
        project_id       TEXT NOT NULL REFERENCES projects(id),
        user_id          TEXT NOT NULL REFERENCES users(id),
        analysis_type    TEXT NOT NULL,
        depth            TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        retry_count      INTEGER NOT NULL DEFAULT 0,
        error_message    TEXT,
        created_at       DATETIME NOT NULL,
        started_at       DATETIME,
        completed_at     DATETIME
    );

    -- ============================================
    -- Usage ledger (append-only)
    -- ============================================

    CREATE TABLE IF NOT EXISTS analysis_usage (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id          TEXT NOT NULL REFERENCES users(id),
        project_id       TEXT,
        analysis_type    TEXT NOT NULL,
        depth            TEXT,
        model            TEXT NOT NULL,
        provider         TEXT NOT NULL,
        input_tokens     INTEGER NOT NULL,
        output_tokens    INTEGER NOT NULL,
        estimated_tokens INTEGER NOT NULL,
        estimated_cost   REAL NOT NULL,
        created_at       DATETIME NOT NULL
    );

    -- ============================================
    -- Implementation plans (derived artifacts)
    -- ============================================

    CREATE TABLE IF NOT EXISTS implementation_plans (
        id               TEXT PRIMARY KEY,
        project_id       TEXT NOT NULL REFERENCES projects(id),
        user_id          TEXT NOT NULL REFERENCES users(id),
        title            TEXT NOT NULL,
        source_analyses  JSON NOT NULL,
        tokens_used      INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS implementation_items (
        id               TEXT PRIMARY KEY,
        plan_id          TEXT NOT NULL REFERENCES implementation_plans(id) ON DELETE CASCADE,
        category         TEXT NOT NULL,
        title            TEXT NOT NULL,
        description      TEXT,
        source_analysis  TEXT NOT NULL,
        completed        INTEGER NOT NULL DEFAULT 0,
        completed_at     DATETIME,
        sort_order       INTEGER NOT NULL DEFAULT 0
    );

    -- ============================================
    -- Runtime settings (typed resolver over key-value rows)
    -- ============================================

    CREATE TABLE IF NOT EXISTS app_settings (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL,
        updated_at       DATETIME NOT NULL
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id);
    CREATE INDEX IF NOT EXISTS idx_analyses_project_type ON analyses(project_id, analysis_type, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_queue_status ON analysis_queue(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_queue_project ON analysis_queue(project_id, analysis_type);
    CREATE INDEX IF NOT EXISTS idx_usage_user_created ON analysis_usage(user_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_usage_model ON analysis_usage(model);
    CREATE INDEX IF NOT EXISTS idx_impl_plans_project ON implementation_plans(project_id);
    CREATE INDEX IF NOT EXISTS idx_impl_items_plan ON implementation_items(plan_id, sort_order);

    -- ============================================
    -- Seed tiers (billing reconciles these later)
    -- ============================================

    INSERT OR IGNORE INTO plans (id, slug, name, monthly_limit, daily_limit, max_tokens_monthly, config)
    VALUES
        ('plan-free', 'free', 'Free', 10, 3, 50000,
         '{"allowed_depths":["critical"],"economic_models_only":true,"limitations":"Critical depth only, economic models"}'),
        ('plan-pro', 'pro', 'Pro', NULL, NULL, 1000000, '{"pdf_export":true}'),
        ('plan-enterprise', 'enterprise', 'Enterprise', NULL, NULL, NULL, '{"pdf_export":true}');
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "users",
            "plans",
            "user_subscriptions",
            "projects",
            "analyses",
            "analysis_queue",
            "analysis_usage",
            "implementation_plans",
            "implementation_items",
            "app_settings",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_default_tiers_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let free_cap: Option<i64> = conn
            .query_row(
                "SELECT max_tokens_monthly FROM plans WHERE slug = 'free'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(free_cap, Some(50_000));

        let enterprise_cap: Option<i64> = conn
            .query_row(
                "SELECT max_tokens_monthly FROM plans WHERE slug = 'enterprise'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(enterprise_cap, None);
    }
}
