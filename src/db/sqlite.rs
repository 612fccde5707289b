// SqliteDatabase — rusqlite backend implementing the Database trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Send.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// Each method is a single call into queries.rs, so the lock also serializes
// the multi-statement transactions those functions open.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::models::{
    AttemptReason, CanonicalProfile, DedupConflict, Fingerprint, FingerprintMatch,
    InfluencerProspect, NewAttempt, Platform, ProfileDraft, ProspectDraft, ProspectInsert,
    ProspectStatus, RecordRef, RefreshCriteria, RefreshTarget, RunError, RunStatus, RunType,
    ScrapingAttempt, ScrapingConfig, ScrapingRun,
};
use super::queries;
use super::traits::Database;

pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn table_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::schema::table_count(&conn)
    }

    async fn insert_config(&self, config: &ScrapingConfig) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::insert_config(&conn, config)
    }

    async fn get_config(&self, id: i64) -> Result<Option<ScrapingConfig>> {
        let conn = self.conn.lock().await;
        queries::get_config(&conn, id)
    }

    async fn insert_run(
        &self,
        config_id: i64,
        run_type: RunType,
        source_filter: &[String],
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::insert_run(&conn, config_id, run_type, source_filter)
    }

    async fn get_run(&self, id: i64) -> Result<Option<ScrapingRun>> {
        let conn = self.conn.lock().await;
        queries::get_run(&conn, id)
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<ScrapingRun>> {
        let conn = self.conn.lock().await;
        queries::list_runs(&conn, limit)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<ScrapingRun>> {
        let conn = self.conn.lock().await;
        queries::list_unfinished_runs(&conn)
    }

    async fn add_run_found(&self, id: i64, count: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::add_run_found(&conn, id, count)
    }

    async fn finish_run(&self, id: i64, status: RunStatus, errors: &[RunError]) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::finish_run(&conn, id, status, errors)
    }

    async fn append_run_error(&self, id: i64, error: &RunError) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::append_run_error(&conn, id, error)
    }

    async fn insert_attempt(&self, attempt: &NewAttempt) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::insert_attempt(&conn, attempt)
    }

    async fn list_attempts(&self, run_id: i64, limit: u32) -> Result<Vec<ScrapingAttempt>> {
        let conn = self.conn.lock().await;
        queries::list_attempts(&conn, run_id, limit)
    }

    async fn count_attempts(&self, run_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::count_attempts(&conn, run_id)
    }

    async fn latest_attempt_at(&self, run_id: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        queries::latest_attempt_at(&conn, run_id)
    }

    async fn recent_terminal_failure(
        &self,
        platform: Platform,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttemptReason>> {
        let conn = self.conn.lock().await;
        queries::recent_terminal_failure(&conn, platform, target, since)
    }

    async fn find_fingerprint_matches(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<FingerprintMatch>> {
        let conn = self.conn.lock().await;
        queries::find_fingerprint_matches(&conn, fingerprints)
    }

    async fn insert_conflict(
        &self,
        run_id: Option<i64>,
        platform: Platform,
        target: &str,
        records: &[RecordRef],
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::insert_conflict(&conn, run_id, platform, target, records)
    }

    async fn list_conflicts(&self, limit: u32) -> Result<Vec<DedupConflict>> {
        let conn = self.conn.lock().await;
        queries::list_conflicts(&conn, limit)
    }

    async fn insert_prospect(&self, draft: &ProspectDraft) -> Result<ProspectInsert> {
        let conn = self.conn.lock().await;
        queries::insert_prospect(&conn, draft)
    }

    async fn get_prospect(&self, id: i64) -> Result<Option<InfluencerProspect>> {
        let conn = self.conn.lock().await;
        queries::get_prospect(&conn, id)
    }

    async fn list_prospects(
        &self,
        status: Option<ProspectStatus>,
        limit: u32,
    ) -> Result<Vec<InfluencerProspect>> {
        let conn = self.conn.lock().await;
        queries::list_prospects(&conn, status, limit)
    }

    async fn count_prospects_by_status(&self) -> Result<Vec<(ProspectStatus, i64)>> {
        let conn = self.conn.lock().await;
        queries::count_prospects_by_status(&conn)
    }

    async fn review_prospect(
        &self,
        id: i64,
        status: ProspectStatus,
        notes: Option<&str>,
        canonical_profile_id: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        queries::review_prospect(&conn, id, status, notes, canonical_profile_id)
    }

    async fn insert_profile(&self, draft: &ProfileDraft) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::insert_profile(&conn, draft)
    }

    async fn get_profile(&self, id: i64) -> Result<Option<CanonicalProfile>> {
        let conn = self.conn.lock().await;
        queries::get_profile(&conn, id)
    }

    async fn merge_profile_evidence(&self, id: i64, draft: &ProfileDraft) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::merge_profile_evidence(&conn, id, draft)
    }

    async fn count_profiles(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::count_profiles(&conn)
    }

    async fn list_refresh_targets(&self, criteria: &RefreshCriteria) -> Result<Vec<RefreshTarget>> {
        let conn = self.conn.lock().await;
        queries::list_refresh_targets(&conn, criteria)
    }
}
