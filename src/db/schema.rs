// Database schema — table creation and migrations.
//
// We use a simple version-based migration approach: a `schema_version` table
// tracks which migrations have run, and each migration is a function that
// executes SQL statements.
//
// List-valued fields live in child tables rather than encoded strings so they
// can be filtered without a parse step. Handles are unique per
// (platform, normalized_handle) within the prospect store and within the
// canonical store.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
///
/// This is idempotent — safe to call on every startup.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS scraping_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            min_followers INTEGER NOT NULL,
            max_followers INTEGER NOT NULL,
            result_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        -- countries, include/exclude keywords and platforms, one row per value
        CREATE TABLE IF NOT EXISTS scraping_config_values (
            config_id INTEGER NOT NULL REFERENCES scraping_configs(id),
            field TEXT NOT NULL,               -- country | include | exclude | platform
            position INTEGER NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (config_id, field, position)
        );

        CREATE TABLE IF NOT EXISTS scraping_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_id INTEGER NOT NULL REFERENCES scraping_configs(id),
            run_type TEXT NOT NULL,            -- discovery | refresh
            status TEXT NOT NULL,              -- pending | running | completed | failed
            total_found INTEGER NOT NULL DEFAULT 0,
            total_processed INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            CHECK (total_processed <= total_found)
        );

        CREATE TABLE IF NOT EXISTS run_source_filters (
            run_id INTEGER NOT NULL REFERENCES scraping_runs(id),
            position INTEGER NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (run_id, position)
        );

        CREATE TABLE IF NOT EXISTS run_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES scraping_runs(id),
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            occurred_at TEXT NOT NULL
        );

        -- Append-only attempt ledger
        CREATE TABLE IF NOT EXISTS scraping_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES scraping_runs(id),
            platform TEXT NOT NULL,
            target TEXT NOT NULL,              -- normalized handle
            status TEXT NOT NULL,              -- success | failed | skipped
            reason TEXT,
            error_message TEXT,
            payload TEXT,                      -- tagged JSON, decoded once on read
            prospect_id INTEGER,
            attempted_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS prospects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES scraping_runs(id),
            display_name TEXT,
            bio TEXT,
            avatar_url TEXT,
            country TEXT,
            email TEXT,
            total_followers INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            notes TEXT,
            canonical_profile_id INTEGER,
            created_at TEXT NOT NULL,
            reviewed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS prospect_handles (
            prospect_id INTEGER NOT NULL REFERENCES prospects(id),
            platform TEXT NOT NULL,
            handle TEXT NOT NULL,
            normalized_handle TEXT NOT NULL,
            url TEXT,
            normalized_url TEXT,
            followers INTEGER,
            raw TEXT,
            UNIQUE (platform, normalized_handle)
        );

        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            display_name TEXT,
            bio TEXT,
            avatar_url TEXT,
            country TEXT,
            email TEXT,
            total_followers INTEGER NOT NULL DEFAULT 0,
            is_validated INTEGER NOT NULL DEFAULT 0,
            has_email INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_scraped_at TEXT,
            found_by TEXT NOT NULL,
            source_country TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS profile_handles (
            profile_id INTEGER NOT NULL REFERENCES profiles(id),
            platform TEXT NOT NULL,
            handle TEXT NOT NULL,
            normalized_handle TEXT NOT NULL,
            url TEXT,
            normalized_url TEXT,
            followers INTEGER,
            raw TEXT,
            UNIQUE (platform, normalized_handle)
        );

        CREATE TABLE IF NOT EXISTS profile_source_tags (
            profile_id INTEGER NOT NULL REFERENCES profiles(id),
            tag TEXT NOT NULL,
            PRIMARY KEY (profile_id, tag)
        );

        CREATE TABLE IF NOT EXISTS dedup_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER,
            platform TEXT NOT NULL,
            target TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dedup_conflict_records (
            conflict_id INTEGER NOT NULL REFERENCES dedup_conflicts(id),
            record_kind TEXT NOT NULL,         -- prospect | canonical
            record_id INTEGER NOT NULL,
            PRIMARY KEY (conflict_id, record_kind, record_id)
        );

        -- Ledger lookups: per-run history and cool-down checks by target
        CREATE INDEX IF NOT EXISTS idx_attempts_run
            ON scraping_attempts(run_id, id);
        CREATE INDEX IF NOT EXISTS idx_attempts_target
            ON scraping_attempts(platform, target, attempted_at);

        -- Dedup lookups by URL and email
        CREATE INDEX IF NOT EXISTS idx_prospect_handles_url
            ON prospect_handles(normalized_url);
        CREATE INDEX IF NOT EXISTS idx_profile_handles_url
            ON profile_handles(normalized_url);
        CREATE INDEX IF NOT EXISTS idx_prospects_email
            ON prospects(email);
        CREATE INDEX IF NOT EXISTS idx_profiles_email
            ON profiles(email);

        CREATE INDEX IF NOT EXISTS idx_prospects_status
            ON prospects(status);
        CREATE INDEX IF NOT EXISTS idx_runs_status
            ON scraping_runs(status);
        ",
    )
    .context("Failed to create database tables")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [1],
    )?;

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}
