// Database queries — CRUD operations for all tables.
//
// Every SQLite interaction goes through this module. This keeps SQL
// contained in one place and gives the rest of the app clean Rust interfaces.
// Timestamps are bound as chrono values so every column uses one text format
// and compares correctly as a string.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::models::{
    AttemptReason, CanonicalProfile, DedupConflict, Fingerprint, FingerprintMatch,
    InfluencerProspect, NewAttempt, Platform, PlatformHandle, ProfileDraft, ProfileFields,
    ProspectDraft, ProspectInsert, ProspectStatus, Provenance, RecordKind, RecordRef, RefreshCriteria,
    RefreshTarget, RunError, RunStatus, RunType, ScrapedPayload, ScrapingAttempt,
    ScrapingConfig, ScrapingRun,
};
use crate::pipeline::dedup::{handle_keys, normalize_email};

const ACTIVE_RUN: &str = "status IN ('pending', 'running')";

// --- Row helpers ---

/// Read a text column and parse it into one of the string-backed enums.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = anyhow::Error>,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        t.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
        })
    })
    .transpose()
}

/// Read a JSON text column holding a scraped payload.
fn payload_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<ScrapedPayload>> {
    let json: Option<String> = row.get(idx)?;
    json.map(|j| {
        serde_json::from_str(&j)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    })
    .transpose()
}

fn payload_json(payload: Option<&ScrapedPayload>) -> Result<Option<String>> {
    payload
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode scraped payload")
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

// --- Configs ---

const CONFIG_FIELDS: [&str; 4] = ["country", "include", "exclude", "platform"];

/// Persist a scraping config with its list fields.
pub fn insert_config(conn: &Connection, config: &ScrapingConfig) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO scraping_configs (min_followers, max_followers, result_count, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            config.min_followers,
            config.max_followers,
            config.result_count,
            Utc::now()
        ],
    )?;
    let id = tx.last_insert_rowid();

    let platforms: Vec<String> = config.platforms.iter().map(|p| p.to_string()).collect();
    let lists: [&[String]; 4] = [
        &config.countries,
        &config.include_keywords,
        &config.exclude_keywords,
        &platforms,
    ];
    {
        let mut stmt = tx.prepare(
            "INSERT INTO scraping_config_values (config_id, field, position, value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (field, values) in CONFIG_FIELDS.iter().zip(lists) {
            for (position, value) in values.iter().enumerate() {
                stmt.execute(params![id, field, position as i64, value])?;
            }
        }
    }

    tx.commit()?;
    Ok(id)
}

pub fn get_config(conn: &Connection, id: i64) -> Result<Option<ScrapingConfig>> {
    let head = conn
        .query_row(
            "SELECT min_followers, max_followers, result_count FROM scraping_configs WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, u32>(2)?)),
        )
        .optional()?;
    let Some((min_followers, max_followers, result_count)) = head else {
        return Ok(None);
    };

    let mut config = ScrapingConfig {
        countries: vec![],
        min_followers,
        max_followers,
        include_keywords: vec![],
        exclude_keywords: vec![],
        platforms: vec![],
        result_count,
    };

    let mut stmt = conn.prepare(
        "SELECT field, value FROM scraping_config_values
         WHERE config_id = ?1 ORDER BY field, position",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (field, value) = row?;
        match field.as_str() {
            "country" => config.countries.push(value),
            "include" => config.include_keywords.push(value),
            "exclude" => config.exclude_keywords.push(value),
            "platform" => config.platforms.push(value.parse()?),
            other => anyhow::bail!("unknown config field in storage: {other}"),
        }
    }

    Ok(Some(config))
}

// --- Runs ---

const RUN_COLUMNS: &str =
    "id, config_id, run_type, status, total_found, total_processed, started_at, completed_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ScrapingRun> {
    Ok(ScrapingRun {
        id: row.get(0)?,
        config_id: row.get(1)?,
        run_type: parse_col(row, 2)?,
        status: parse_col(row, 3)?,
        total_found: row.get(4)?,
        total_processed: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        errors: vec![],
        source_filter: vec![],
    })
}

/// Attach the child-table lists (errors, source filter) to a run.
fn load_run_lists(conn: &Connection, run: &mut ScrapingRun) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT kind, message, occurred_at FROM run_errors WHERE run_id = ?1 ORDER BY id",
    )?;
    run.errors = stmt
        .query_map(params![run.id], |row| {
            Ok(RunError {
                kind: parse_col(row, 0)?,
                message: row.get(1)?,
                occurred_at: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn
        .prepare("SELECT value FROM run_source_filters WHERE run_id = ?1 ORDER BY position")?;
    run.source_filter = stmt
        .query_map(params![run.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(())
}

fn query_runs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ScrapingRun>> {
    let mut stmt = conn.prepare(sql)?;
    let mut runs = stmt
        .query_map(params, run_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for run in &mut runs {
        load_run_lists(conn, run)?;
    }
    Ok(runs)
}

/// Create a run in `running` status.
pub fn insert_run(
    conn: &Connection,
    config_id: i64,
    run_type: RunType,
    source_filter: &[String],
) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO scraping_runs (config_id, run_type, status, started_at)
         VALUES (?1, ?2, 'running', ?3)",
        params![config_id, run_type.as_str(), Utc::now()],
    )
    .with_context(|| format!("Failed to create run for config {config_id}"))?;
    let id = tx.last_insert_rowid();

    for (position, value) in source_filter.iter().enumerate() {
        tx.execute(
            "INSERT INTO run_source_filters (run_id, position, value) VALUES (?1, ?2, ?3)",
            params![id, position as i64, value],
        )?;
    }

    tx.commit()?;
    Ok(id)
}

pub fn get_run(conn: &Connection, id: i64) -> Result<Option<ScrapingRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM scraping_runs WHERE id = ?1");
    Ok(query_runs(conn, &sql, params![id])?.into_iter().next())
}

/// Most recent runs first.
pub fn list_runs(conn: &Connection, limit: u32) -> Result<Vec<ScrapingRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM scraping_runs ORDER BY id DESC LIMIT ?1");
    query_runs(conn, &sql, params![limit])
}

pub fn list_unfinished_runs(conn: &Connection) -> Result<Vec<ScrapingRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM scraping_runs WHERE {ACTIVE_RUN} ORDER BY id");
    query_runs(conn, &sql, [])
}

pub fn add_run_found(conn: &Connection, id: i64, count: i64) -> Result<bool> {
    let sql = format!(
        "UPDATE scraping_runs SET total_found = total_found + ?2 WHERE id = ?1 AND {ACTIVE_RUN}"
    );
    let changed = conn.execute(&sql, params![id, count])?;
    Ok(changed == 1)
}

/// Bump `total_processed` by one. The guard keeps the counter at or below
/// `total_found` and frozen once the run is terminal.
fn increment_run_processed(conn: &Connection, id: i64) -> Result<bool> {
    let sql = format!(
        "UPDATE scraping_runs SET total_processed = total_processed + 1
         WHERE id = ?1 AND {ACTIVE_RUN} AND total_processed < total_found"
    );
    let changed = conn.execute(&sql, params![id])?;
    Ok(changed == 1)
}

pub fn finish_run(conn: &Connection, id: i64, status: RunStatus, errors: &[RunError]) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let sql = format!(
        "UPDATE scraping_runs SET status = ?2, completed_at = ?3 WHERE id = ?1 AND {ACTIVE_RUN}"
    );
    let changed = tx.execute(&sql, params![id, status.as_str(), Utc::now()])?;
    if changed == 0 {
        return Ok(false);
    }
    for error in errors {
        tx.execute(
            "INSERT INTO run_errors (run_id, kind, message, occurred_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, error.kind.as_str(), error.message, error.occurred_at],
        )?;
    }
    tx.commit()?;
    Ok(true)
}

pub fn append_run_error(conn: &Connection, id: i64, error: &RunError) -> Result<()> {
    let sql = format!(
        "INSERT INTO run_errors (run_id, kind, message, occurred_at)
         SELECT ?1, ?2, ?3, ?4
         WHERE EXISTS (SELECT 1 FROM scraping_runs WHERE id = ?1 AND {ACTIVE_RUN})"
    );
    conn.execute(
        &sql,
        params![id, error.kind.as_str(), error.message, error.occurred_at],
    )?;
    Ok(())
}

// --- Attempts ---

/// Append an attempt to the ledger.
pub fn insert_attempt(conn: &Connection, attempt: &NewAttempt) -> Result<i64> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM scraping_runs WHERE id = ?1",
        params![attempt.run_id],
        |row| row.get(0),
    )?;
    if !exists {
        anyhow::bail!("Cannot record attempt: run {} does not exist", attempt.run_id);
    }

    let payload = payload_json(attempt.payload.as_ref())?;
    conn.execute(
        "INSERT INTO scraping_attempts
            (run_id, platform, target, status, reason, error_message, payload, prospect_id, attempted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            attempt.run_id,
            attempt.platform.as_str(),
            attempt.target,
            attempt.status.as_str(),
            attempt.reason.map(|r| r.as_str()),
            attempt.error_message,
            payload,
            attempt.prospect_id,
            Utc::now(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Attempts of a run, most recent first.
pub fn list_attempts(conn: &Connection, run_id: i64, limit: u32) -> Result<Vec<ScrapingAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, platform, target, status, reason, error_message, payload,
                prospect_id, attempted_at
         FROM scraping_attempts
         WHERE run_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let attempts = stmt
        .query_map(params![run_id, limit], |row| {
            Ok(ScrapingAttempt {
                id: row.get(0)?,
                run_id: row.get(1)?,
                platform: parse_col(row, 2)?,
                target: row.get(3)?,
                status: parse_col(row, 4)?,
                reason: parse_opt_col(row, 5)?,
                error_message: row.get(6)?,
                payload: payload_col(row, 7)?,
                prospect_id: row.get(8)?,
                attempted_at: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(attempts)
}

pub fn count_attempts(conn: &Connection, run_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM scraping_attempts WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn latest_attempt_at(conn: &Connection, run_id: i64) -> Result<Option<DateTime<Utc>>> {
    let latest = conn.query_row(
        "SELECT MAX(attempted_at) FROM scraping_attempts WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(latest)
}

/// Most recent Blocked/NotFound failure for a target since `since`.
pub fn recent_terminal_failure(
    conn: &Connection,
    platform: Platform,
    target: &str,
    since: DateTime<Utc>,
) -> Result<Option<AttemptReason>> {
    let reason = conn
        .query_row(
            "SELECT reason FROM scraping_attempts
             WHERE platform = ?1 AND target = ?2 AND status = 'failed'
               AND reason IN ('blocked', 'not_found')
               AND attempted_at >= ?3
             ORDER BY id DESC
             LIMIT 1",
            params![platform.as_str(), target, since],
            |row| parse_col(row, 0),
        )
        .optional()?;
    Ok(reason)
}

// --- Deduplication ---

/// Every prospect and canonical profile matching any fingerprint.
pub fn find_fingerprint_matches(
    conn: &Connection,
    fingerprints: &[Fingerprint],
) -> Result<Vec<FingerprintMatch>> {
    let mut prospect_ids = BTreeSet::new();
    let mut profile_ids = BTreeSet::new();

    for fp in fingerprints {
        let (prospect_sql, profile_sql, values): (&str, &str, Vec<&str>) = match fp {
            Fingerprint::Handle { platform, handle } => (
                "SELECT prospect_id FROM prospect_handles WHERE platform = ?1 AND normalized_handle = ?2",
                "SELECT profile_id FROM profile_handles WHERE platform = ?1 AND normalized_handle = ?2",
                vec![platform.as_str(), handle.as_str()],
            ),
            Fingerprint::Url { url } => (
                "SELECT prospect_id FROM prospect_handles WHERE normalized_url = ?1",
                "SELECT profile_id FROM profile_handles WHERE normalized_url = ?1",
                vec![url.as_str()],
            ),
            Fingerprint::Email { email } => (
                "SELECT id FROM prospects WHERE email = ?1",
                "SELECT id FROM profiles WHERE email = ?1",
                vec![email.as_str()],
            ),
        };

        let mut stmt = conn.prepare_cached(prospect_sql)?;
        for id in stmt.query_map(rusqlite::params_from_iter(&values), |row| row.get::<_, i64>(0))? {
            prospect_ids.insert(id?);
        }
        let mut stmt = conn.prepare_cached(profile_sql)?;
        for id in stmt.query_map(rusqlite::params_from_iter(&values), |row| row.get::<_, i64>(0))? {
            profile_ids.insert(id?);
        }
    }

    let mut matches = Vec::with_capacity(prospect_ids.len() + profile_ids.len());
    for id in prospect_ids {
        let (status, canonical_id): (ProspectStatus, Option<i64>) = conn.query_row(
            "SELECT status, canonical_profile_id FROM prospects WHERE id = ?1",
            params![id],
            |row| Ok((parse_col(row, 0)?, row.get(1)?)),
        )?;
        matches.push(FingerprintMatch {
            record: RecordRef::prospect(id),
            converted_to: canonical_id.filter(|_| status == ProspectStatus::Converted),
        });
    }
    matches.extend(profile_ids.into_iter().map(|id| FingerprintMatch {
        record: RecordRef::canonical(id),
        converted_to: None,
    }));

    Ok(matches)
}

pub fn insert_conflict(
    conn: &Connection,
    run_id: Option<i64>,
    platform: Platform,
    target: &str,
    records: &[RecordRef],
) -> Result<i64> {
    let wanted: BTreeSet<RecordRef> = records.iter().copied().collect();
    let tx = conn.unchecked_transaction()?;

    let existing: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM dedup_conflicts WHERE platform = ?1 AND target = ?2 ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![platform.as_str(), target], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };
    for id in existing {
        if conflict_records(&tx, id)? == wanted {
            return Ok(id);
        }
    }

    tx.execute(
        "INSERT INTO dedup_conflicts (run_id, platform, target, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![run_id, platform.as_str(), target, Utc::now()],
    )?;
    let id = tx.last_insert_rowid();
    for record in records {
        tx.execute(
            "INSERT OR IGNORE INTO dedup_conflict_records (conflict_id, record_kind, record_id)
             VALUES (?1, ?2, ?3)",
            params![id, record.kind.as_str(), record.id],
        )?;
    }
    tx.commit()?;
    Ok(id)
}

fn conflict_records(conn: &Connection, conflict_id: i64) -> Result<BTreeSet<RecordRef>> {
    let mut stmt = conn.prepare(
        "SELECT record_kind, record_id FROM dedup_conflict_records WHERE conflict_id = ?1",
    )?;
    let records = stmt
        .query_map(params![conflict_id], |row| {
            Ok(RecordRef {
                kind: parse_col::<RecordKind>(row, 0)?,
                id: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(records)
}

/// Most recent conflicts first.
pub fn list_conflicts(conn: &Connection, limit: u32) -> Result<Vec<DedupConflict>> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, platform, target, created_at FROM dedup_conflicts
         ORDER BY id DESC LIMIT ?1",
    )?;
    let mut conflicts = stmt
        .query_map(params![limit], |row| {
            Ok(DedupConflict {
                id: row.get(0)?,
                run_id: row.get(1)?,
                platform: parse_col(row, 2)?,
                target: row.get(3)?,
                records: vec![],
                created_at: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT record_kind, record_id FROM dedup_conflict_records
         WHERE conflict_id = ?1 ORDER BY record_kind, record_id",
    )?;
    for conflict in &mut conflicts {
        conflict.records = stmt
            .query_map(params![conflict.id], |row| {
                Ok(RecordRef {
                    kind: parse_col::<RecordKind>(row, 0)?,
                    id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
    }
    Ok(conflicts)
}

// --- Handles (shared by prospects and profiles) ---

/// Which handle table to read or write.
#[derive(Clone, Copy)]
enum HandleTable {
    Prospect,
    Profile,
}

impl HandleTable {
    fn insert_sql(&self, or_ignore: bool) -> String {
        let (table, owner) = self.names();
        let verb = if or_ignore { "INSERT OR IGNORE" } else { "INSERT" };
        format!(
            "{verb} INTO {table}
                ({owner}, platform, handle, normalized_handle, url, normalized_url, followers, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        )
    }

    fn names(&self) -> (&'static str, &'static str) {
        match self {
            HandleTable::Prospect => ("prospect_handles", "prospect_id"),
            HandleTable::Profile => ("profile_handles", "profile_id"),
        }
    }
}

fn insert_handles(
    conn: &Connection,
    table: HandleTable,
    owner_id: i64,
    handles: &[PlatformHandle],
    or_ignore: bool,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&table.insert_sql(or_ignore))?;
    for h in handles {
        let (key, url_key) = handle_keys(h);
        let raw = h
            .raw
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?;
        stmt.execute(params![
            owner_id,
            h.platform.as_str(),
            h.handle,
            key,
            h.url,
            url_key,
            h.followers,
            raw,
        ])?;
    }
    Ok(())
}

fn load_handles(conn: &Connection, table: HandleTable, owner_id: i64) -> Result<Vec<PlatformHandle>> {
    let (name, owner) = table.names();
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT platform, handle, url, followers, raw FROM {name} WHERE {owner} = ?1 ORDER BY rowid"
    ))?;
    let handles = stmt
        .query_map(params![owner_id], |row| {
            Ok(PlatformHandle {
                platform: parse_col(row, 0)?,
                handle: row.get(1)?,
                url: row.get(2)?,
                followers: row.get(3)?,
                raw: payload_col(row, 4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(handles)
}

// --- Prospects ---

const PROSPECT_COLUMNS: &str = "id, run_id, display_name, bio, avatar_url, country, email,
    total_followers, status, notes, canonical_profile_id, created_at, reviewed_at";

fn prospect_from_row(row: &Row<'_>) -> rusqlite::Result<InfluencerProspect> {
    Ok(InfluencerProspect {
        id: row.get(0)?,
        run_id: row.get(1)?,
        fields: ProfileFields {
            display_name: row.get(2)?,
            bio: row.get(3)?,
            avatar_url: row.get(4)?,
            country: row.get(5)?,
            email: row.get(6)?,
            handles: vec![],
            total_followers: row.get(7)?,
        },
        status: parse_col(row, 8)?,
        notes: row.get(9)?,
        canonical_profile_id: row.get(10)?,
        created_at: row.get(11)?,
        reviewed_at: row.get(12)?,
    })
}

fn query_prospects(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<InfluencerProspect>> {
    let mut stmt = conn.prepare(sql)?;
    let mut prospects = stmt
        .query_map(params, prospect_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for p in &mut prospects {
        p.fields.handles = load_handles(conn, HandleTable::Prospect, p.id)?;
    }
    Ok(prospects)
}

/// Create a prospect and its handles. Returns None if a handle is already
/// held by another prospect.
pub fn insert_prospect(conn: &Connection, draft: &ProspectDraft) -> Result<ProspectInsert> {
    let f = &draft.fields;
    let tx = conn.unchecked_transaction()?;
    if !increment_run_processed(&tx, draft.run_id)? {
        return Ok(ProspectInsert::RunClosed);
    }
    tx.execute(
        "INSERT INTO prospects
            (run_id, display_name, bio, avatar_url, country, email, total_followers, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
        params![
            draft.run_id,
            f.display_name,
            f.bio,
            f.avatar_url,
            f.country,
            f.email.as_deref().and_then(normalize_email),
            f.total_followers,
            Utc::now(),
        ],
    )?;
    let id = tx.last_insert_rowid();

    match insert_handles(&tx, HandleTable::Prospect, id, &f.handles, false) {
        Ok(()) => {}
        // Dropping the transaction rolls back the prospect row and the counter.
        Err(e) if is_unique_violation(&e) => return Ok(ProspectInsert::Duplicate),
        Err(e) => return Err(e.into()),
    }

    tx.commit()?;
    Ok(ProspectInsert::Created(id))
}

pub fn get_prospect(conn: &Connection, id: i64) -> Result<Option<InfluencerProspect>> {
    let sql = format!("SELECT {PROSPECT_COLUMNS} FROM prospects WHERE id = ?1");
    Ok(query_prospects(conn, &sql, params![id])?.into_iter().next())
}

/// Newest first, optionally filtered by status.
pub fn list_prospects(
    conn: &Connection,
    status: Option<ProspectStatus>,
    limit: u32,
) -> Result<Vec<InfluencerProspect>> {
    match status {
        Some(status) => {
            let sql = format!(
                "SELECT {PROSPECT_COLUMNS} FROM prospects WHERE status = ?1 ORDER BY id DESC LIMIT ?2"
            );
            query_prospects(conn, &sql, params![status.as_str(), limit])
        }
        None => {
            let sql = format!("SELECT {PROSPECT_COLUMNS} FROM prospects ORDER BY id DESC LIMIT ?1");
            query_prospects(conn, &sql, params![limit])
        }
    }
}

pub fn count_prospects_by_status(conn: &Connection) -> Result<Vec<(ProspectStatus, i64)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM prospects GROUP BY status ORDER BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((parse_col(row, 0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(counts)
}

/// `pending → status`. Returns false if the prospect was not pending.
pub fn review_prospect(
    conn: &Connection,
    id: i64,
    status: ProspectStatus,
    notes: Option<&str>,
    canonical_profile_id: Option<i64>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE prospects
         SET status = ?2, notes = ?3, canonical_profile_id = ?4, reviewed_at = ?5
         WHERE id = ?1 AND status = 'pending'",
        params![id, status.as_str(), notes, canonical_profile_id, Utc::now()],
    )?;
    Ok(changed == 1)
}

// --- Canonical profiles ---

fn insert_source_tags(conn: &Connection, profile_id: i64, tags: &[String]) -> Result<()> {
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO profile_source_tags (profile_id, tag) VALUES (?1, ?2)")?;
    for tag in tags.iter().filter(|t| !t.trim().is_empty()) {
        stmt.execute(params![profile_id, tag.trim()])?;
    }
    Ok(())
}

pub fn insert_profile(conn: &Connection, draft: &ProfileDraft) -> Result<i64> {
    let f = &draft.fields;
    let email = f.email.as_deref().and_then(normalize_email);
    let now = Utc::now();

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO profiles
            (display_name, bio, avatar_url, country, email, total_followers, has_email,
             last_scraped_at, found_by, source_country, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            f.display_name,
            f.bio,
            f.avatar_url,
            f.country,
            email,
            f.total_followers,
            email.is_some(),
            now,
            draft.provenance.found_by,
            draft.provenance.source_country,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();

    insert_handles(&tx, HandleTable::Profile, id, &f.handles, false)
        .context("Handle already belongs to another canonical profile")?;
    insert_source_tags(&tx, id, &draft.provenance.source_hashtags)?;

    tx.commit()?;
    Ok(id)
}

pub fn get_profile(conn: &Connection, id: i64) -> Result<Option<CanonicalProfile>> {
    let profile = conn
        .query_row(
            "SELECT id, display_name, bio, avatar_url, country, email, total_followers,
                    is_validated, has_email, is_active, last_scraped_at, found_by,
                    source_country, created_at
             FROM profiles WHERE id = ?1",
            params![id],
            |row| {
                Ok(CanonicalProfile {
                    id: row.get(0)?,
                    fields: ProfileFields {
                        display_name: row.get(1)?,
                        bio: row.get(2)?,
                        avatar_url: row.get(3)?,
                        country: row.get(4)?,
                        email: row.get(5)?,
                        handles: vec![],
                        total_followers: row.get(6)?,
                    },
                    is_validated: row.get(7)?,
                    has_email: row.get(8)?,
                    is_active: row.get(9)?,
                    last_scraped_at: row.get(10)?,
                    provenance: Provenance {
                        found_by: row.get(11)?,
                        source_hashtags: vec![],
                        source_country: row.get(12)?,
                    },
                    created_at: row.get(13)?,
                })
            },
        )
        .optional()?;

    let Some(mut profile) = profile else {
        return Ok(None);
    };
    profile.fields.handles = load_handles(conn, HandleTable::Profile, id)?;
    let mut stmt =
        conn.prepare("SELECT tag FROM profile_source_tags WHERE profile_id = ?1 ORDER BY rowid")?;
    profile.provenance.source_hashtags = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(Some(profile))
}

/// Fill empty fields from new evidence without overwriting anything set.
pub fn merge_profile_evidence(conn: &Connection, id: i64, draft: &ProfileDraft) -> Result<()> {
    let f = &draft.fields;
    let email = f.email.as_deref().and_then(normalize_email);

    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE profiles SET
            display_name = COALESCE(NULLIF(display_name, ''), ?2),
            bio = COALESCE(NULLIF(bio, ''), ?3),
            avatar_url = COALESCE(NULLIF(avatar_url, ''), ?4),
            country = COALESCE(NULLIF(country, ''), ?5),
            email = COALESCE(NULLIF(email, ''), ?6),
            has_email = COALESCE(NULLIF(email, ''), ?6) IS NOT NULL,
            total_followers = CASE WHEN total_followers = 0 THEN ?7 ELSE total_followers END,
            source_country = COALESCE(source_country, ?8),
            last_scraped_at = ?9
         WHERE id = ?1",
        params![
            id,
            f.display_name,
            f.bio,
            f.avatar_url,
            f.country,
            email,
            f.total_followers,
            draft.provenance.source_country,
            Utc::now(),
        ],
    )?;
    if changed == 0 {
        anyhow::bail!("Canonical profile {id} does not exist");
    }

    insert_handles(&tx, HandleTable::Profile, id, &f.handles, true)?;
    insert_source_tags(&tx, id, &draft.provenance.source_hashtags)?;

    tx.commit()?;
    Ok(())
}

pub fn count_profiles(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
    Ok(count)
}

/// Handles of active canonical profiles matching the refresh criteria,
/// least recently scraped first.
pub fn list_refresh_targets(conn: &Connection, criteria: &RefreshCriteria) -> Result<Vec<RefreshTarget>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, h.platform, h.normalized_handle, p.country, p.found_by
         FROM profiles p
         JOIN profile_handles h ON h.profile_id = p.id
         WHERE p.is_active = 1 AND p.total_followers BETWEEN ?1 AND ?2
         ORDER BY COALESCE(p.last_scraped_at, ''), p.id, h.rowid",
    )?;
    let rows = stmt.query_map(params![criteria.min_followers, criteria.max_followers], |row| {
        Ok((
            RefreshTarget {
                profile_id: row.get(0)?,
                platform: parse_col(row, 1)?,
                handle: row.get(2)?,
                country: row.get(3)?,
            },
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut targets = Vec::new();
    for row in rows {
        let (target, found_by) = row?;
        let country_ok = criteria.countries.is_empty()
            || target.country.as_deref().is_some_and(|c| {
                criteria.countries.iter().any(|wanted| wanted.eq_ignore_ascii_case(c))
            });
        let platform_ok =
            criteria.platforms.is_empty() || criteria.platforms.contains(&target.platform);
        let source_ok = criteria.found_by.is_empty() || criteria.found_by.contains(&found_by);

        if country_ok && platform_ok && source_ok {
            targets.push(target);
            if targets.len() >= criteria.limit as usize {
                break;
            }
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AttemptStatus, InstagramPayload, RunErrorKind};
    use crate::db::schema::create_tables;
    use chrono::Duration;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    fn config() -> ScrapingConfig {
        ScrapingConfig {
            countries: vec!["CZ".to_string(), "SK".to_string()],
            min_followers: 1_000,
            max_followers: 100_000,
            include_keywords: vec!["fashion".to_string()],
            exclude_keywords: vec!["giveaway".to_string()],
            platforms: vec![Platform::Instagram],
            result_count: 10,
        }
    }

    fn ig(handle: &str) -> PlatformHandle {
        PlatformHandle {
            platform: Platform::Instagram,
            handle: handle.to_string(),
            url: None,
            followers: Some(5_000),
            raw: None,
        }
    }

    fn fields(handle: &str) -> ProfileFields {
        ProfileFields {
            display_name: Some(handle.to_string()),
            country: Some("CZ".to_string()),
            handles: vec![ig(handle)],
            total_followers: 5_000,
            ..Default::default()
        }
    }

    fn new_run(conn: &Connection) -> i64 {
        let config_id = insert_config(conn, &config()).unwrap();
        insert_run(conn, config_id, RunType::Discovery, &[]).unwrap()
    }

    /// A run with uncounted candidates, so prospects can be created for it.
    fn run_with_room(conn: &Connection) -> i64 {
        let run_id = new_run(conn);
        add_run_found(conn, run_id, 10).unwrap();
        run_id
    }

    #[test]
    fn test_config_roundtrip_keeps_list_order() {
        let conn = test_conn();
        let id = insert_config(&conn, &config()).unwrap();
        assert_eq!(get_config(&conn, id).unwrap(), Some(config()));
        assert_eq!(get_config(&conn, id + 1).unwrap(), None);
    }

    #[test]
    fn test_run_transitions_are_conditional() {
        let conn = test_conn();
        let run_id = new_run(&conn);

        let run = get_run(&conn, run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);

        assert!(add_run_found(&conn, run_id, 2).unwrap());
        assert!(increment_run_processed(&conn, run_id).unwrap());
        assert!(increment_run_processed(&conn, run_id).unwrap());
        // Would exceed total_found
        assert!(!increment_run_processed(&conn, run_id).unwrap());

        let errors = vec![RunError::new(RunErrorKind::Adapter, "boom")];
        assert!(finish_run(&conn, run_id, RunStatus::Failed, &errors).unwrap());
        assert!(!finish_run(&conn, run_id, RunStatus::Completed, &[]).unwrap());

        // Counters are frozen once terminal
        assert!(!add_run_found(&conn, run_id, 5).unwrap());

        let run = get_run(&conn, run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.total_found, 2);
        assert_eq!(run.total_processed, 2);
        assert_eq!(run.errors.len(), 1);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_append_run_error_ignored_when_terminal() {
        let conn = test_conn();
        let run_id = new_run(&conn);
        append_run_error(&conn, run_id, &RunError::new(RunErrorKind::Discovery, "page 2")).unwrap();
        finish_run(&conn, run_id, RunStatus::Completed, &[]).unwrap();
        append_run_error(&conn, run_id, &RunError::new(RunErrorKind::Discovery, "late")).unwrap();

        let run = get_run(&conn, run_id).unwrap().unwrap();
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].message, "page 2");
    }

    #[test]
    fn test_attempt_requires_existing_run() {
        let conn = test_conn();
        let attempt = NewAttempt {
            run_id: 99,
            platform: Platform::Instagram,
            target: "anna".to_string(),
            status: AttemptStatus::Failed,
            reason: Some(AttemptReason::Blocked),
            error_message: None,
            payload: None,
            prospect_id: None,
        };
        assert!(insert_attempt(&conn, &attempt).is_err());
    }

    #[test]
    fn test_attempts_listed_newest_first_with_payload() {
        let conn = test_conn();
        let run_id = new_run(&conn);
        for target in ["anna", "petra"] {
            insert_attempt(
                &conn,
                &NewAttempt {
                    run_id,
                    platform: Platform::Instagram,
                    target: target.to_string(),
                    status: AttemptStatus::Success,
                    reason: None,
                    error_message: None,
                    payload: Some(ScrapedPayload::Instagram(InstagramPayload {
                        username: target.to_string(),
                        followers: 1_200,
                        ..Default::default()
                    })),
                    prospect_id: None,
                },
            )
            .unwrap();
        }

        let attempts = list_attempts(&conn, run_id, 10).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].target, "petra");
        assert!(matches!(
            attempts[0].payload,
            Some(ScrapedPayload::Instagram(ref p)) if p.followers == 1_200
        ));
        assert_eq!(count_attempts(&conn, run_id).unwrap(), 2);
        assert!(latest_attempt_at(&conn, run_id).unwrap().is_some());
    }

    #[test]
    fn test_recent_terminal_failure_window() {
        let conn = test_conn();
        let run_id = new_run(&conn);
        insert_attempt(
            &conn,
            &NewAttempt {
                run_id,
                platform: Platform::Instagram,
                target: "anna".to_string(),
                status: AttemptStatus::Failed,
                reason: Some(AttemptReason::NotFound),
                error_message: Some("404".to_string()),
                payload: None,
                prospect_id: None,
            },
        )
        .unwrap();

        let hour_ago = Utc::now() - Duration::hours(1);
        assert_eq!(
            recent_terminal_failure(&conn, Platform::Instagram, "anna", hour_ago).unwrap(),
            Some(AttemptReason::NotFound)
        );
        let future = Utc::now() + Duration::hours(1);
        assert_eq!(
            recent_terminal_failure(&conn, Platform::Instagram, "anna", future).unwrap(),
            None
        );
        assert_eq!(
            recent_terminal_failure(&conn, Platform::Instagram, "petra", hour_ago).unwrap(),
            None
        );
    }

    #[test]
    fn test_insert_prospect_collision_is_duplicate() {
        let conn = test_conn();
        let run_id = run_with_room(&conn);
        let first = insert_prospect(&conn, &ProspectDraft { run_id, fields: fields("Anna") }).unwrap();
        assert!(first.created().is_some());

        // Same handle, different spelling
        let second = insert_prospect(&conn, &ProspectDraft { run_id, fields: fields("@anna") }).unwrap();
        assert_eq!(second, ProspectInsert::Duplicate);
        assert_eq!(list_prospects(&conn, None, 10).unwrap().len(), 1);
        // The collision rolled the counter back too
        assert_eq!(get_run(&conn, run_id).unwrap().unwrap().total_processed, 1);
    }

    #[test]
    fn test_insert_prospect_needs_an_open_run() {
        let conn = test_conn();
        let run_id = new_run(&conn);
        add_run_found(&conn, run_id, 1).unwrap();

        let draft = |handle: &str| ProspectDraft { run_id, fields: fields(handle) };
        assert!(insert_prospect(&conn, &draft("anna")).unwrap().created().is_some());
        // Every found candidate is already counted
        assert_eq!(insert_prospect(&conn, &draft("petra")).unwrap(), ProspectInsert::RunClosed);

        add_run_found(&conn, run_id, 1).unwrap();
        assert!(finish_run(&conn, run_id, RunStatus::Failed, &[RunError::cancelled()]).unwrap());
        assert_eq!(insert_prospect(&conn, &draft("jana")).unwrap(), ProspectInsert::RunClosed);

        let run = get_run(&conn, run_id).unwrap().unwrap();
        assert_eq!(run.total_processed, 1);
        assert_eq!(list_prospects(&conn, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_fingerprint_matches_resolve_converted_prospect() {
        let conn = test_conn();
        let run_id = run_with_room(&conn);
        let prospect_id = insert_prospect(&conn, &ProspectDraft { run_id, fields: fields("anna") })
            .unwrap()
            .created()
            .unwrap();
        let profile_id = insert_profile(
            &conn,
            &ProfileDraft {
                fields: fields("anna.backup"),
                provenance: Provenance::default(),
            },
        )
        .unwrap();
        assert!(review_prospect(
            &conn,
            prospect_id,
            ProspectStatus::Converted,
            None,
            Some(profile_id)
        )
        .unwrap());

        let fp = crate::pipeline::dedup::fingerprints(&fields("ANNA"));
        let matches = find_fingerprint_matches(&conn, &fp).unwrap();
        assert_eq!(
            matches,
            vec![FingerprintMatch {
                record: RecordRef::prospect(prospect_id),
                converted_to: Some(profile_id),
            }]
        );
    }

    #[test]
    fn test_email_fingerprint_matches_profile() {
        let conn = test_conn();
        let mut f = fields("studio.anna");
        f.email = Some("Anna@Studio.cz".to_string());
        let profile_id = insert_profile(
            &conn,
            &ProfileDraft {
                fields: f,
                provenance: Provenance::default(),
            },
        )
        .unwrap();

        let fp = vec![Fingerprint::Email {
            email: "anna@studio.cz".to_string(),
        }];
        let matches = find_fingerprint_matches(&conn, &fp).unwrap();
        assert_eq!(matches[0].record, RecordRef::canonical(profile_id));
    }

    #[test]
    fn test_review_only_from_pending() {
        let conn = test_conn();
        let run_id = run_with_room(&conn);
        let id = insert_prospect(&conn, &ProspectDraft { run_id, fields: fields("anna") })
            .unwrap()
            .created()
            .unwrap();
        assert!(review_prospect(&conn, id, ProspectStatus::Rejected, Some("spam"), None).unwrap());
        assert!(!review_prospect(&conn, id, ProspectStatus::Rejected, Some("again"), None).unwrap());

        let prospect = get_prospect(&conn, id).unwrap().unwrap();
        assert_eq!(prospect.status, ProspectStatus::Rejected);
        assert_eq!(prospect.notes.as_deref(), Some("spam"));
        assert!(prospect.reviewed_at.is_some());
    }

    #[test]
    fn test_merge_fills_only_empty_fields() {
        let conn = test_conn();
        let mut base = fields("anna");
        base.bio = None;
        let id = insert_profile(
            &conn,
            &ProfileDraft {
                fields: base,
                provenance: Provenance {
                    found_by: "search_discovery".to_string(),
                    source_hashtags: vec!["fashion".to_string()],
                    source_country: Some("CZ".to_string()),
                },
            },
        )
        .unwrap();

        let mut evidence = fields("anna");
        evidence.display_name = Some("Other Name".to_string());
        evidence.bio = Some("Prague stylist".to_string());
        evidence.email = Some("anna@studio.cz".to_string());
        evidence.handles.push(PlatformHandle {
            platform: Platform::TikTok,
            handle: "anna_tt".to_string(),
            url: None,
            followers: None,
            raw: None,
        });
        merge_profile_evidence(
            &conn,
            id,
            &ProfileDraft {
                fields: evidence,
                provenance: Provenance {
                    found_by: "search_discovery".to_string(),
                    source_hashtags: vec!["fashion".to_string(), "beauty".to_string()],
                    source_country: Some("SK".to_string()),
                },
            },
        )
        .unwrap();

        let profile = get_profile(&conn, id).unwrap().unwrap();
        assert_eq!(profile.fields.display_name.as_deref(), Some("anna"));
        assert_eq!(profile.fields.bio.as_deref(), Some("Prague stylist"));
        assert!(profile.has_email);
        assert_eq!(profile.fields.handles.len(), 2);
        assert_eq!(profile.provenance.source_hashtags, vec!["fashion", "beauty"]);
        assert_eq!(profile.provenance.source_country.as_deref(), Some("CZ"));
    }

    #[test]
    fn test_refresh_targets_filter_by_criteria() {
        let conn = test_conn();
        for (handle, country, found_by) in [
            ("anna", "CZ", "search_discovery"),
            ("petra", "SK", "search_discovery"),
            ("jana", "CZ", "manual_import"),
        ] {
            let mut f = fields(handle);
            f.country = Some(country.to_string());
            insert_profile(
                &conn,
                &ProfileDraft {
                    fields: f,
                    provenance: Provenance {
                        found_by: found_by.to_string(),
                        ..Default::default()
                    },
                },
            )
            .unwrap();
        }

        let targets = list_refresh_targets(
            &conn,
            &RefreshCriteria {
                countries: vec!["cz".to_string()],
                min_followers: 0,
                max_followers: 10_000,
                platforms: vec![Platform::Instagram],
                found_by: vec!["search_discovery".to_string()],
                limit: 10,
            },
        )
        .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].handle, "anna");
    }

    #[test]
    fn test_conflicts_roundtrip() {
        let conn = test_conn();
        let run_id = new_run(&conn);
        insert_conflict(
            &conn,
            Some(run_id),
            Platform::Instagram,
            "anna",
            &[RecordRef::canonical(2), RecordRef::prospect(5)],
        )
        .unwrap();
        let conflicts = list_conflicts(&conn, 10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].records.len(), 2);
        assert_eq!(conflicts[0].run_id, Some(run_id));
    }

    #[test]
    fn test_repeated_conflict_is_recorded_once() {
        let conn = test_conn();
        let run_id = new_run(&conn);
        let records = [RecordRef::canonical(2), RecordRef::prospect(5)];

        let first = insert_conflict(&conn, Some(run_id), Platform::Instagram, "anna", &records).unwrap();
        // Same set in another order, from a later run
        let reversed = [records[1], records[0]];
        let again = insert_conflict(&conn, None, Platform::Instagram, "anna", &reversed).unwrap();
        assert_eq!(again, first);

        // A different record set is a new conflict
        let other = insert_conflict(
            &conn,
            Some(run_id),
            Platform::Instagram,
            "anna",
            &[RecordRef::canonical(2), RecordRef::canonical(3)],
        )
        .unwrap();
        assert_ne!(other, first);
        assert_eq!(list_conflicts(&conn, 10).unwrap().len(), 2);
    }
}
