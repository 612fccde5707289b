// PgDatabase — PostgreSQL backend implementing the Database trait.
//
// Uses sqlx PgPool for native async queries. All queries use runtime
// parameter binding (not compile-time macros) to avoid requiring
// DATABASE_URL at compile time.
//
// Key differences from SQLite:
// - TIMESTAMPTZ instead of TEXT for timestamps
// - JSONB for scraped payloads
// - TEXT[] / BIGINT[] arrays instead of list child tables
// - $1/$2 parameter syntax (handled by sqlx)
// - GENERATED ALWAYS AS IDENTITY for auto-increment

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::pool::Pool;
use sqlx_core::row::Row;
use sqlx_core::types::Json;
use sqlx_postgres::{PgRow, Postgres};

use super::models::{
    AttemptReason, CanonicalProfile, DedupConflict, Fingerprint, FingerprintMatch,
    InfluencerProspect, NewAttempt, Platform, PlatformHandle, ProfileDraft, ProfileFields,
    ProspectDraft, ProspectInsert, ProspectStatus, Provenance, RecordRef, RefreshCriteria, RefreshTarget,
    RunError, RunStatus, RunType, ScrapedPayload, ScrapingAttempt, ScrapingConfig, ScrapingRun,
};
use super::traits::Database;
use crate::pipeline::dedup::{handle_keys, normalize_email};

/// Type alias for the PostgreSQL connection pool.
pub type PgPool = Pool<Postgres>;

type PgTransaction<'c> = sqlx_core::transaction::Transaction<'c, Postgres>;

const ACTIVE_RUN: &str = "status IN ('pending', 'running')";

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connect to PostgreSQL and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to PostgreSQL at {database_url}"))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending migrations under a session-level advisory lock so two
    /// processes starting together don't apply the same migration twice.
    ///
    /// The lock and unlock must run on the same physical connection, so a
    /// dedicated connection holds the lock while migrations use the pool.
    /// The unlock always runs; a migration error takes priority over an
    /// unlock error.
    async fn run_migrations(&self) -> Result<()> {
        // ASCII "PROSPECT" as a big-endian i64.
        const MIGRATION_LOCK_KEY: i64 = 0x50524F5350454354;

        let mut lock_conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for migration advisory lock")?;

        sqlx_core::query::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
            .context("Failed to acquire migration advisory lock")?;

        let migration_result: Result<()> = async {
            sqlx_core::query::query(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
            )
            .execute(&self.pool)
            .await?;

            let migrations = [(
                1,
                include_str!("../../migrations/postgres/0001_initial.sql"),
            )];

            for (version, sql) in migrations {
                let applied: bool = sqlx_core::query::query(
                    "SELECT COUNT(*) > 0 FROM schema_version WHERE version = $1",
                )
                .bind(version)
                .fetch_one(&self.pool)
                .await?
                .try_get(0)?;

                if !applied {
                    let mut tx = self.pool.begin().await?;
                    sqlx_core::raw_sql::raw_sql(sql).execute(&mut *tx).await?;
                    tx.commit().await?;
                }
            }

            Ok(())
        }
        .await;

        let unlock_result = sqlx_core::query::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
            .context("Failed to release migration advisory lock");

        migration_result?;
        unlock_result?;

        Ok(())
    }

    async fn load_run_errors(&self, run_id: i64) -> Result<Vec<RunError>> {
        let rows = sqlx_core::query::query(
            "SELECT kind, message, occurred_at FROM run_errors WHERE run_id = $1 ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<RunError> {
                Ok(RunError {
                    kind: parse(r.try_get(0)?)?,
                    message: r.try_get(1)?,
                    occurred_at: r.try_get(2)?,
                })
            })
            .collect()
    }

    async fn query_runs(&self, rows: Vec<PgRow>) -> Result<Vec<ScrapingRun>> {
        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut run = run_from_row(row)?;
            run.errors = self.load_run_errors(run.id).await?;
            runs.push(run);
        }
        Ok(runs)
    }

    async fn load_handles(&self, table: &str, owner: &str, id: i64) -> Result<Vec<PlatformHandle>> {
        let rows = sqlx_core::query::query(&format!(
            "SELECT platform, handle, url, followers, raw FROM {table} WHERE {owner} = $1 ORDER BY id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<PlatformHandle> {
                Ok(PlatformHandle {
                    platform: parse(r.try_get(0)?)?,
                    handle: r.try_get(1)?,
                    url: r.try_get(2)?,
                    followers: r.try_get(3)?,
                    raw: r
                        .try_get::<Option<Json<ScrapedPayload>>, _>(4)?
                        .map(|j| j.0),
                })
            })
            .collect()
    }

    async fn query_prospects(&self, rows: Vec<PgRow>) -> Result<Vec<InfluencerProspect>> {
        let mut prospects = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut p = prospect_from_row(row)?;
            p.fields.handles = self
                .load_handles("prospect_handles", "prospect_id", p.id)
                .await?;
            prospects.push(p);
        }
        Ok(prospects)
    }
}

// --- Row helpers ---

fn parse<T: FromStr<Err = anyhow::Error>>(text: String) -> Result<T> {
    text.parse()
}

fn run_from_row(r: &PgRow) -> Result<ScrapingRun> {
    Ok(ScrapingRun {
        id: r.try_get(0)?,
        config_id: r.try_get(1)?,
        run_type: parse(r.try_get(2)?)?,
        status: parse(r.try_get(3)?)?,
        total_found: r.try_get(4)?,
        total_processed: r.try_get(5)?,
        started_at: r.try_get(6)?,
        completed_at: r.try_get(7)?,
        errors: vec![],
        source_filter: r.try_get(8)?,
    })
}

const RUN_COLUMNS: &str = "id, config_id, run_type, status, total_found, total_processed,
    started_at, completed_at, source_filter";

const PROSPECT_COLUMNS: &str = "id, run_id, display_name, bio, avatar_url, country, email,
    total_followers, status, notes, canonical_profile_id, created_at, reviewed_at";

fn prospect_from_row(r: &PgRow) -> Result<InfluencerProspect> {
    Ok(InfluencerProspect {
        id: r.try_get(0)?,
        run_id: r.try_get(1)?,
        fields: ProfileFields {
            display_name: r.try_get(2)?,
            bio: r.try_get(3)?,
            avatar_url: r.try_get(4)?,
            country: r.try_get(5)?,
            email: r.try_get(6)?,
            handles: vec![],
            total_followers: r.try_get(7)?,
        },
        status: parse(r.try_get(8)?)?,
        notes: r.try_get(9)?,
        canonical_profile_id: r.try_get(10)?,
        created_at: r.try_get(11)?,
        reviewed_at: r.try_get(12)?,
    })
}

fn is_unique_violation(err: &sqlx_core::error::Error) -> bool {
    matches!(err, sqlx_core::error::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Insert handles inside a transaction. With `skip_existing`, handles whose
/// key is already taken are silently skipped.
async fn insert_handles(
    tx: &mut PgTransaction<'_>,
    table: &str,
    owner: &str,
    owner_id: i64,
    handles: &[PlatformHandle],
    skip_existing: bool,
) -> std::result::Result<(), sqlx_core::error::Error> {
    let on_conflict = if skip_existing {
        "ON CONFLICT (platform, normalized_handle) DO NOTHING"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO {table}
            ({owner}, platform, handle, normalized_handle, url, normalized_url, followers, raw)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) {on_conflict}"
    );
    for h in handles {
        let (key, url_key) = handle_keys(h);
        sqlx_core::query::query(&sql)
            .bind(owner_id)
            .bind(h.platform.as_str())
            .bind(&h.handle)
            .bind(key)
            .bind(&h.url)
            .bind(url_key)
            .bind(h.followers)
            .bind(h.raw.as_ref().map(Json))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn dedup_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

#[async_trait]
impl Database for PgDatabase {
    async fn table_count(&self) -> Result<i64> {
        let row = sqlx_core::query::query(
            "SELECT COUNT(*)::bigint FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    // --- Configs ---

    async fn insert_config(&self, config: &ScrapingConfig) -> Result<i64> {
        let platforms: Vec<String> = config.platforms.iter().map(|p| p.to_string()).collect();
        let row = sqlx_core::query::query(
            "INSERT INTO scraping_configs
                (countries, min_followers, max_followers, include_keywords, exclude_keywords,
                 platforms, result_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(&config.countries)
        .bind(config.min_followers)
        .bind(config.max_followers)
        .bind(&config.include_keywords)
        .bind(&config.exclude_keywords)
        .bind(platforms)
        .bind(i32::try_from(config.result_count).context("result_count exceeds i32 range")?)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn get_config(&self, id: i64) -> Result<Option<ScrapingConfig>> {
        let row = sqlx_core::query::query(
            "SELECT countries, min_followers, max_followers, include_keywords, exclude_keywords,
                    platforms, result_count
             FROM scraping_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        let platforms = r
            .try_get::<Vec<String>, _>(5)?
            .into_iter()
            .map(parse)
            .collect::<Result<Vec<Platform>>>()?;
        Ok(Some(ScrapingConfig {
            countries: r.try_get(0)?,
            min_followers: r.try_get(1)?,
            max_followers: r.try_get(2)?,
            include_keywords: r.try_get(3)?,
            exclude_keywords: r.try_get(4)?,
            platforms,
            result_count: u32::try_from(r.try_get::<i32, _>(6)?)?,
        }))
    }

    // --- Runs ---

    async fn insert_run(
        &self,
        config_id: i64,
        run_type: RunType,
        source_filter: &[String],
    ) -> Result<i64> {
        let row = sqlx_core::query::query(
            "INSERT INTO scraping_runs (config_id, run_type, status, source_filter, started_at)
             VALUES ($1, $2, 'running', $3, $4)
             RETURNING id",
        )
        .bind(config_id)
        .bind(run_type.as_str())
        .bind(source_filter)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create run for config {config_id}"))?;
        Ok(row.try_get(0)?)
    }

    async fn get_run(&self, id: i64) -> Result<Option<ScrapingRun>> {
        let rows = sqlx_core::query::query(&format!(
            "SELECT {RUN_COLUMNS} FROM scraping_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.query_runs(rows).await?.into_iter().next())
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<ScrapingRun>> {
        let rows = sqlx_core::query::query(&format!(
            "SELECT {RUN_COLUMNS} FROM scraping_runs ORDER BY id DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        self.query_runs(rows).await
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<ScrapingRun>> {
        let rows = sqlx_core::query::query(&format!(
            "SELECT {RUN_COLUMNS} FROM scraping_runs WHERE {ACTIVE_RUN} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        self.query_runs(rows).await
    }

    async fn add_run_found(&self, id: i64, count: i64) -> Result<bool> {
        let result = sqlx_core::query::query(&format!(
            "UPDATE scraping_runs SET total_found = total_found + $2 WHERE id = $1 AND {ACTIVE_RUN}"
        ))
        .bind(id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(&self, id: i64, status: RunStatus, errors: &[RunError]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx_core::query::query(&format!(
            "UPDATE scraping_runs SET status = $2, completed_at = NOW() WHERE id = $1 AND {ACTIVE_RUN}"
        ))
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for error in errors {
            sqlx_core::query::query(
                "INSERT INTO run_errors (run_id, kind, message, occurred_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(error.kind.as_str())
            .bind(&error.message)
            .bind(error.occurred_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn append_run_error(&self, id: i64, error: &RunError) -> Result<()> {
        sqlx_core::query::query(&format!(
            "INSERT INTO run_errors (run_id, kind, message, occurred_at)
             SELECT $1, $2, $3, $4
             WHERE EXISTS (SELECT 1 FROM scraping_runs WHERE id = $1 AND {ACTIVE_RUN})"
        ))
        .bind(id)
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(error.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Attempts ---

    async fn insert_attempt(&self, attempt: &NewAttempt) -> Result<i64> {
        let row = sqlx_core::query::query(
            "INSERT INTO scraping_attempts
                (run_id, platform, target, status, reason, error_message, payload, prospect_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(attempt.run_id)
        .bind(attempt.platform.as_str())
        .bind(&attempt.target)
        .bind(attempt.status.as_str())
        .bind(attempt.reason.map(|r| r.as_str()))
        .bind(&attempt.error_message)
        .bind(attempt.payload.as_ref().map(Json))
        .bind(attempt.prospect_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Cannot record attempt for run {}", attempt.run_id))?;
        Ok(row.try_get(0)?)
    }

    async fn list_attempts(&self, run_id: i64, limit: u32) -> Result<Vec<ScrapingAttempt>> {
        let rows = sqlx_core::query::query(
            "SELECT id, run_id, platform, target, status, reason, error_message, payload,
                    prospect_id, attempted_at
             FROM scraping_attempts
             WHERE run_id = $1
             ORDER BY id DESC
             LIMIT $2",
        )
        .bind(run_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<ScrapingAttempt> {
                Ok(ScrapingAttempt {
                    id: r.try_get(0)?,
                    run_id: r.try_get(1)?,
                    platform: parse(r.try_get(2)?)?,
                    target: r.try_get(3)?,
                    status: parse(r.try_get(4)?)?,
                    reason: r
                        .try_get::<Option<String>, _>(5)?
                        .map(parse)
                        .transpose()?,
                    error_message: r.try_get(6)?,
                    payload: r
                        .try_get::<Option<Json<ScrapedPayload>>, _>(7)?
                        .map(|j| j.0),
                    prospect_id: r.try_get(8)?,
                    attempted_at: r.try_get(9)?,
                })
            })
            .collect()
    }

    async fn count_attempts(&self, run_id: i64) -> Result<i64> {
        let row = sqlx_core::query::query(
            "SELECT COUNT(*)::bigint FROM scraping_attempts WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn latest_attempt_at(&self, run_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx_core::query::query(
            "SELECT MAX(attempted_at) FROM scraping_attempts WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn recent_terminal_failure(
        &self,
        platform: Platform,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttemptReason>> {
        let row = sqlx_core::query::query(
            "SELECT reason FROM scraping_attempts
             WHERE platform = $1 AND target = $2 AND status = 'failed'
               AND reason IN ('blocked', 'not_found')
               AND attempted_at >= $3
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(platform.as_str())
        .bind(target)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse(r.try_get(0)?)).transpose()
    }

    // --- Deduplication ---

    async fn find_fingerprint_matches(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<FingerprintMatch>> {
        // Split fingerprints by kind so each store is searched with one query.
        let mut handle_platforms = Vec::new();
        let mut handles = Vec::new();
        let mut urls = Vec::new();
        let mut emails = Vec::new();
        for fp in fingerprints {
            match fp {
                Fingerprint::Handle { platform, handle } => {
                    handle_platforms.push(platform.to_string());
                    handles.push(handle.clone());
                }
                Fingerprint::Url { url } => urls.push(url.clone()),
                Fingerprint::Email { email } => emails.push(email.clone()),
            }
        }

        let prospect_rows = sqlx_core::query::query(
            "SELECT p.id, p.status, p.canonical_profile_id
             FROM prospects p
             WHERE p.id IN (
                SELECT h.prospect_id FROM prospect_handles h
                JOIN unnest($1::text[], $2::text[]) AS k(platform, handle)
                  ON h.platform = k.platform AND h.normalized_handle = k.handle
                UNION
                SELECT prospect_id FROM prospect_handles WHERE normalized_url = ANY($3)
             ) OR p.email = ANY($4)
             ORDER BY p.id",
        )
        .bind(&handle_platforms)
        .bind(&handles)
        .bind(&urls)
        .bind(&emails)
        .fetch_all(&self.pool)
        .await?;

        let profile_rows = sqlx_core::query::query(
            "SELECT p.id FROM profiles p
             WHERE p.id IN (
                SELECT h.profile_id FROM profile_handles h
                JOIN unnest($1::text[], $2::text[]) AS k(platform, handle)
                  ON h.platform = k.platform AND h.normalized_handle = k.handle
                UNION
                SELECT profile_id FROM profile_handles WHERE normalized_url = ANY($3)
             ) OR p.email = ANY($4)
             ORDER BY p.id",
        )
        .bind(&handle_platforms)
        .bind(&handles)
        .bind(&urls)
        .bind(&emails)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(prospect_rows.len() + profile_rows.len());
        for r in &prospect_rows {
            let status: ProspectStatus = parse(r.try_get(1)?)?;
            let canonical_id: Option<i64> = r.try_get(2)?;
            matches.push(FingerprintMatch {
                record: RecordRef::prospect(r.try_get(0)?),
                converted_to: canonical_id.filter(|_| status == ProspectStatus::Converted),
            });
        }
        for r in &profile_rows {
            matches.push(FingerprintMatch {
                record: RecordRef::canonical(r.try_get(0)?),
                converted_to: None,
            });
        }
        Ok(matches)
    }

    async fn insert_conflict(
        &self,
        run_id: Option<i64>,
        platform: Platform,
        target: &str,
        records: &[RecordRef],
    ) -> Result<i64> {
        let mut records = records.to_vec();
        records.sort();
        records.dedup();
        let kinds: Vec<String> = records.iter().map(|r| r.kind.to_string()).collect();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();

        let existing = sqlx_core::query::query(
            "SELECT id FROM dedup_conflicts
             WHERE platform = $1 AND target = $2 AND record_kinds = $3 AND record_ids = $4
             ORDER BY id LIMIT 1",
        )
        .bind(platform.as_str())
        .bind(target)
        .bind(&kinds)
        .bind(&ids)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok(row.try_get(0)?);
        }

        let row = sqlx_core::query::query(
            "INSERT INTO dedup_conflicts (run_id, platform, target, record_kinds, record_ids)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(run_id)
        .bind(platform.as_str())
        .bind(target)
        .bind(kinds)
        .bind(ids)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn list_conflicts(&self, limit: u32) -> Result<Vec<DedupConflict>> {
        let rows = sqlx_core::query::query(
            "SELECT id, run_id, platform, target, record_kinds, record_ids, created_at
             FROM dedup_conflicts ORDER BY id DESC LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<DedupConflict> {
                let kinds: Vec<String> = r.try_get(4)?;
                let ids: Vec<i64> = r.try_get(5)?;
                let records = kinds
                    .into_iter()
                    .zip(ids)
                    .map(|(kind, id)| -> Result<RecordRef> { Ok(RecordRef { kind: parse(kind)?, id }) })
                    .collect::<Result<Vec<_>>>()?;
                Ok(DedupConflict {
                    id: r.try_get(0)?,
                    run_id: r.try_get(1)?,
                    platform: parse(r.try_get(2)?)?,
                    target: r.try_get(3)?,
                    records,
                    created_at: r.try_get(6)?,
                })
            })
            .collect()
    }

    // --- Prospects ---

    async fn insert_prospect(&self, draft: &ProspectDraft) -> Result<ProspectInsert> {
        let f = &draft.fields;
        let mut tx = self.pool.begin().await?;
        let counted = sqlx_core::query::query(&format!(
            "UPDATE scraping_runs SET total_processed = total_processed + 1
             WHERE id = $1 AND {ACTIVE_RUN} AND total_processed < total_found"
        ))
        .bind(draft.run_id)
        .execute(&mut *tx)
        .await?;
        if counted.rows_affected() != 1 {
            return Ok(ProspectInsert::RunClosed);
        }

        let row = sqlx_core::query::query(
            "INSERT INTO prospects
                (run_id, display_name, bio, avatar_url, country, email, total_followers, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
             RETURNING id",
        )
        .bind(draft.run_id)
        .bind(&f.display_name)
        .bind(&f.bio)
        .bind(&f.avatar_url)
        .bind(&f.country)
        .bind(f.email.as_deref().and_then(normalize_email))
        .bind(f.total_followers)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get(0)?;

        match insert_handles(&mut tx, "prospect_handles", "prospect_id", id, &f.handles, false)
            .await
        {
            Ok(()) => {}
            // Dropping the transaction rolls back the prospect row and the counter.
            Err(e) if is_unique_violation(&e) => return Ok(ProspectInsert::Duplicate),
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(ProspectInsert::Created(id))
    }

    async fn get_prospect(&self, id: i64) -> Result<Option<InfluencerProspect>> {
        let rows = sqlx_core::query::query(&format!(
            "SELECT {PROSPECT_COLUMNS} FROM prospects WHERE id = $1"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.query_prospects(rows).await?.into_iter().next())
    }

    async fn list_prospects(
        &self,
        status: Option<ProspectStatus>,
        limit: u32,
    ) -> Result<Vec<InfluencerProspect>> {
        let rows = sqlx_core::query::query(&format!(
            "SELECT {PROSPECT_COLUMNS} FROM prospects
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY id DESC LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        self.query_prospects(rows).await
    }

    async fn count_prospects_by_status(&self) -> Result<Vec<(ProspectStatus, i64)>> {
        let rows = sqlx_core::query::query(
            "SELECT status, COUNT(*)::bigint FROM prospects GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<(ProspectStatus, i64)> { Ok((parse(r.try_get(0)?)?, r.try_get(1)?)) })
            .collect()
    }

    async fn review_prospect(
        &self,
        id: i64,
        status: ProspectStatus,
        notes: Option<&str>,
        canonical_profile_id: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx_core::query::query(
            "UPDATE prospects
             SET status = $2, notes = $3, canonical_profile_id = $4, reviewed_at = NOW()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(notes)
        .bind(canonical_profile_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // --- Canonical profiles ---

    async fn insert_profile(&self, draft: &ProfileDraft) -> Result<i64> {
        let f = &draft.fields;
        let email = f.email.as_deref().and_then(normalize_email);
        let mut tx = self.pool.begin().await?;
        let row = sqlx_core::query::query(
            "INSERT INTO profiles
                (display_name, bio, avatar_url, country, email, total_followers, has_email,
                 last_scraped_at, found_by, source_hashtags, source_country)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9, $10)
             RETURNING id",
        )
        .bind(&f.display_name)
        .bind(&f.bio)
        .bind(&f.avatar_url)
        .bind(&f.country)
        .bind(&email)
        .bind(f.total_followers)
        .bind(email.is_some())
        .bind(&draft.provenance.found_by)
        .bind(dedup_tags(&draft.provenance.source_hashtags))
        .bind(&draft.provenance.source_country)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get(0)?;

        insert_handles(&mut tx, "profile_handles", "profile_id", id, &f.handles, false)
            .await
            .context("Handle already belongs to another canonical profile")?;

        tx.commit().await?;
        Ok(id)
    }

    async fn get_profile(&self, id: i64) -> Result<Option<CanonicalProfile>> {
        let row = sqlx_core::query::query(
            "SELECT id, display_name, bio, avatar_url, country, email, total_followers,
                    is_validated, has_email, is_active, last_scraped_at, found_by,
                    source_hashtags, source_country, created_at
             FROM profiles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        let handles = self.load_handles("profile_handles", "profile_id", id).await?;
        Ok(Some(CanonicalProfile {
            id: r.try_get(0)?,
            fields: ProfileFields {
                display_name: r.try_get(1)?,
                bio: r.try_get(2)?,
                avatar_url: r.try_get(3)?,
                country: r.try_get(4)?,
                email: r.try_get(5)?,
                handles,
                total_followers: r.try_get(6)?,
            },
            is_validated: r.try_get(7)?,
            has_email: r.try_get(8)?,
            is_active: r.try_get(9)?,
            last_scraped_at: r.try_get(10)?,
            provenance: Provenance {
                found_by: r.try_get(11)?,
                source_hashtags: r.try_get(12)?,
                source_country: r.try_get(13)?,
            },
            created_at: r.try_get(14)?,
        }))
    }

    async fn merge_profile_evidence(&self, id: i64, draft: &ProfileDraft) -> Result<()> {
        let f = &draft.fields;
        let email = f.email.as_deref().and_then(normalize_email);
        let mut tx = self.pool.begin().await?;
        let result = sqlx_core::query::query(
            "UPDATE profiles SET
                display_name = COALESCE(NULLIF(display_name, ''), $2),
                bio = COALESCE(NULLIF(bio, ''), $3),
                avatar_url = COALESCE(NULLIF(avatar_url, ''), $4),
                country = COALESCE(NULLIF(country, ''), $5),
                email = COALESCE(NULLIF(email, ''), $6),
                has_email = COALESCE(NULLIF(email, ''), $6) IS NOT NULL,
                total_followers = CASE WHEN total_followers = 0 THEN $7 ELSE total_followers END,
                source_country = COALESCE(source_country, $8),
                source_hashtags = source_hashtags
                    || ARRAY(SELECT t FROM unnest($9::text[]) AS t WHERE NOT (t = ANY(source_hashtags))),
                last_scraped_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(&f.display_name)
        .bind(&f.bio)
        .bind(&f.avatar_url)
        .bind(&f.country)
        .bind(&email)
        .bind(f.total_followers)
        .bind(&draft.provenance.source_country)
        .bind(dedup_tags(&draft.provenance.source_hashtags))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Canonical profile {id} does not exist");
        }

        insert_handles(&mut tx, "profile_handles", "profile_id", id, &f.handles, true).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn count_profiles(&self) -> Result<i64> {
        let row = sqlx_core::query::query("SELECT COUNT(*)::bigint FROM profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn list_refresh_targets(&self, criteria: &RefreshCriteria) -> Result<Vec<RefreshTarget>> {
        let countries: Vec<String> = criteria.countries.iter().map(|c| c.to_uppercase()).collect();
        let platforms: Vec<String> = criteria.platforms.iter().map(|p| p.to_string()).collect();
        let rows = sqlx_core::query::query(
            "SELECT p.id, h.platform, h.normalized_handle, p.country
             FROM profiles p
             JOIN profile_handles h ON h.profile_id = p.id
             WHERE p.is_active
               AND p.total_followers BETWEEN $1 AND $2
               AND (cardinality($3::text[]) = 0 OR upper(p.country) = ANY($3))
               AND (cardinality($4::text[]) = 0 OR h.platform = ANY($4))
               AND (cardinality($5::text[]) = 0 OR p.found_by = ANY($5))
             ORDER BY p.last_scraped_at ASC NULLS FIRST, p.id, h.id
             LIMIT $6",
        )
        .bind(criteria.min_followers)
        .bind(criteria.max_followers)
        .bind(countries)
        .bind(platforms)
        .bind(&criteria.found_by)
        .bind(i64::from(criteria.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<RefreshTarget> {
                Ok(RefreshTarget {
                    profile_id: r.try_get(0)?,
                    platform: parse(r.try_get(1)?)?,
                    handle: r.try_get(2)?,
                    country: r.try_get(3)?,
                })
            })
            .collect()
    }
}
