// Database trait — backend-agnostic async interface for all DB operations.
//
// Implementors: SqliteDatabase (wraps rusqlite), PgDatabase (wraps sqlx).
// All methods are async so both sync (rusqlite via Mutex) and native async
// (sqlx) backends fit behind a single interface.
//
// State transitions are conditional at this layer: methods that move a run or
// prospect forward return `false` instead of writing when the row is no longer
// in a state that allows the move. Callers turn that into the right error.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    AttemptReason, CanonicalProfile, DedupConflict, Fingerprint, FingerprintMatch,
    InfluencerProspect, NewAttempt, Platform, ProfileDraft, ProspectDraft, ProspectInsert,
    ProspectStatus, RecordRef, RefreshCriteria, RefreshTarget, RunError, RunStatus, RunType, ScrapingAttempt,
    ScrapingConfig, ScrapingRun,
};

#[async_trait]
pub trait Database: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables in the database.
    async fn table_count(&self) -> Result<i64>;

    // --- Configs ---

    /// Persist a scraping config and return its ID. Configs are never updated.
    async fn insert_config(&self, config: &ScrapingConfig) -> Result<i64>;

    async fn get_config(&self, id: i64) -> Result<Option<ScrapingConfig>>;

    // --- Runs ---

    /// Create a run in `pending` status.
    async fn insert_run(&self, config_id: i64, run_type: RunType, source_filter: &[String])
        -> Result<i64>;

    async fn get_run(&self, id: i64) -> Result<Option<ScrapingRun>>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: u32) -> Result<Vec<ScrapingRun>>;

    /// Runs still `pending` or `running`.
    async fn list_unfinished_runs(&self) -> Result<Vec<ScrapingRun>>;

    /// Add newly discovered candidates to `total_found` while the run is active.
    async fn add_run_found(&self, id: i64, count: i64) -> Result<bool>;

    /// Move an active run to a terminal status, appending its error entries.
    /// Returns false (and writes nothing) if the run was already terminal.
    async fn finish_run(&self, id: i64, status: RunStatus, errors: &[RunError]) -> Result<bool>;

    /// Append a non-fatal error entry to a run that is still active.
    async fn append_run_error(&self, id: i64, error: &RunError) -> Result<()>;

    // --- Attempts ---

    /// Append an attempt. Fails if the run does not exist.
    async fn insert_attempt(&self, attempt: &NewAttempt) -> Result<i64>;

    /// Attempts for a run, most recent first.
    async fn list_attempts(&self, run_id: i64, limit: u32) -> Result<Vec<ScrapingAttempt>>;

    /// Number of attempts recorded for a run.
    async fn count_attempts(&self, run_id: i64) -> Result<i64>;

    /// Timestamp of the newest attempt of a run, if any.
    async fn latest_attempt_at(&self, run_id: i64) -> Result<Option<DateTime<Utc>>>;

    /// The most recent Blocked/NotFound failure for a target since `since`.
    async fn recent_terminal_failure(
        &self,
        platform: Platform,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttemptReason>>;

    // --- Deduplication ---

    /// Every prospect and canonical profile matching any of the fingerprints.
    async fn find_fingerprint_matches(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<FingerprintMatch>>;

    /// Flag a target for manual review. When the same (platform, target)
    /// already awaits review against the same record set, returns that
    /// conflict's id instead of adding another.
    async fn insert_conflict(
        &self,
        run_id: Option<i64>,
        platform: Platform,
        target: &str,
        records: &[RecordRef],
    ) -> Result<i64>;

    /// Most recent conflicts first.
    async fn list_conflicts(&self, limit: u32) -> Result<Vec<DedupConflict>>;

    // --- Prospects ---

    /// Create a prospect with its handles and count it in its run's
    /// `total_processed`, in one transaction. Nothing is written unless the
    /// outcome is `Created`.
    async fn insert_prospect(&self, draft: &ProspectDraft) -> Result<ProspectInsert>;

    async fn get_prospect(&self, id: i64) -> Result<Option<InfluencerProspect>>;

    /// Newest first, optionally filtered by status.
    async fn list_prospects(
        &self,
        status: Option<ProspectStatus>,
        limit: u32,
    ) -> Result<Vec<InfluencerProspect>>;

    async fn count_prospects_by_status(&self) -> Result<Vec<(ProspectStatus, i64)>>;

    /// `pending → status`, recording notes and the canonical profile it became.
    /// Returns false if the prospect was not pending.
    async fn review_prospect(
        &self,
        id: i64,
        status: ProspectStatus,
        notes: Option<&str>,
        canonical_profile_id: Option<i64>,
    ) -> Result<bool>;

    // --- Canonical profiles ---

    /// Create a canonical profile with its handles and provenance.
    async fn insert_profile(&self, draft: &ProfileDraft) -> Result<i64>;

    async fn get_profile(&self, id: i64) -> Result<Option<CanonicalProfile>>;

    /// Fill empty fields, add missing handles and source hashtags, and bump
    /// `last_scraped_at`. Never overwrites non-empty fields.
    async fn merge_profile_evidence(&self, id: i64, draft: &ProfileDraft) -> Result<()>;

    async fn count_profiles(&self) -> Result<i64>;

    /// Handles of canonical profiles that match a refresh run's criteria.
    async fn list_refresh_targets(&self, criteria: &RefreshCriteria) -> Result<Vec<RefreshTarget>>;
}
