// Attempt ledger — the append-only record of every fetch a run makes.
//
// The run task never writes attempts itself. It pushes them onto a bounded
// channel drained by a writer task, so a slow store does not stretch the gap
// between paced source calls. The channel preserves send order, which keeps
// attempts in candidate-list order within a run.
//
// The ledger is also the memory of past failures: a target that came back
// Blocked or NotFound within the cool-down window is skipped without a call.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::db::models::{AttemptReason, AttemptStatus, NewAttempt, Platform, ScrapedPayload};
use crate::db::Database;
use crate::error::{PipelineError, SourceError};

/// In-run retries for a transient failure. Blocked and NotFound are never
/// retried within a run.
pub const MAX_RETRIES: u32 = 1;

/// True when a failed call should be tried again, given how many retries
/// already happened.
pub fn should_retry(err: &SourceError, retries: u32) -> bool {
    err.is_retryable() && retries < MAX_RETRIES
}

impl NewAttempt {
    fn new(run_id: i64, platform: Platform, target: &str, status: AttemptStatus) -> Self {
        Self {
            run_id,
            platform,
            target: target.to_string(),
            status,
            reason: None,
            error_message: None,
            payload: None,
            prospect_id: None,
        }
    }

    /// A fetched profile that became a new prospect.
    pub fn created(
        run_id: i64,
        platform: Platform,
        target: &str,
        payload: ScrapedPayload,
        prospect_id: i64,
    ) -> Self {
        Self {
            payload: Some(payload),
            prospect_id: Some(prospect_id),
            ..Self::new(run_id, platform, target, AttemptStatus::Success)
        }
    }

    /// A fetched profile that matched an existing record.
    pub fn duplicate(run_id: i64, platform: Platform, target: &str, payload: ScrapedPayload) -> Self {
        Self {
            reason: Some(AttemptReason::Duplicate),
            payload: Some(payload),
            ..Self::new(run_id, platform, target, AttemptStatus::Success)
        }
    }

    /// A call that ended in a source error.
    pub fn failed(run_id: i64, platform: Platform, target: &str, err: &SourceError) -> Self {
        Self {
            reason: Some(err.reason()),
            error_message: Some(err.to_string()),
            ..Self::new(run_id, platform, target, AttemptStatus::Failed)
        }
    }

    /// A target that was not (or no longer) worth processing.
    pub fn skipped(
        run_id: i64,
        platform: Platform,
        target: &str,
        reason: AttemptReason,
        detail: Option<String>,
    ) -> Self {
        Self {
            reason: Some(reason),
            error_message: detail,
            ..Self::new(run_id, platform, target, AttemptStatus::Skipped)
        }
    }

    pub fn with_payload(mut self, payload: ScrapedPayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Shared attempt ledger.
#[derive(Clone)]
pub struct AttemptLedger {
    db: Arc<dyn Database>,
    cooldown: chrono::Duration,
}

impl AttemptLedger {
    pub fn new(db: Arc<dyn Database>, cooldown: chrono::Duration) -> Self {
        Self { db, cooldown }
    }

    /// Append one attempt. Fails only when the run is gone or storage is down.
    pub async fn record_attempt(&self, attempt: &NewAttempt) -> Result<i64, PipelineError> {
        if self.db.get_run(attempt.run_id).await?.is_none() {
            return Err(PipelineError::RunNotFound(attempt.run_id));
        }
        let id = self
            .db
            .insert_attempt(attempt)
            .await
            .with_context(|| format!("Failed to record attempt for {}", attempt.target))?;
        debug!(
            run_id = attempt.run_id,
            target = %attempt.target,
            status = %attempt.status,
            reason = attempt.reason.map(|r| r.as_str()).unwrap_or("-"),
            "Attempt recorded"
        );
        Ok(id)
    }

    /// The Blocked/NotFound reason if `target` failed that way within the
    /// cool-down window.
    pub async fn cooling_down(
        &self,
        platform: Platform,
        target: &str,
    ) -> Result<Option<AttemptReason>, PipelineError> {
        if self.cooldown <= chrono::Duration::zero() {
            return Ok(None);
        }
        let since = Utc::now() - self.cooldown;
        Ok(self
            .db
            .recent_terminal_failure(platform, target, since)
            .await?)
    }

    /// Start a writer task that drains attempts from a bounded channel.
    pub fn spawn_writer(&self, buffer: usize) -> LedgerWriter {
        let (tx, mut rx) = mpsc::channel::<NewAttempt>(buffer.max(1));
        let ledger = self.clone();

        let task = tokio::spawn(async move {
            let mut written = 0usize;
            while let Some(attempt) = rx.recv().await {
                if let Err(e) = ledger.record_attempt(&attempt).await {
                    error!(run_id = attempt.run_id, error = %e, "Attempt ledger write failed");
                    return Err(e);
                }
                written += 1;
            }
            Ok(written)
        });

        LedgerWriter { tx, task }
    }
}

/// Sending half of a run's ledger writer.
pub struct LedgerWriter {
    tx: mpsc::Sender<NewAttempt>,
    task: JoinHandle<Result<usize, PipelineError>>,
}

impl LedgerWriter {
    /// Queue an attempt. An error means the writer stopped; call `close` to
    /// get the underlying cause.
    pub async fn send(&self, attempt: NewAttempt) -> Result<(), PipelineError> {
        self.tx.send(attempt).await.map_err(|_| {
            PipelineError::Storage(anyhow::anyhow!("attempt ledger writer stopped"))
        })
    }

    /// Flush every queued attempt and return how many were written.
    pub async fn close(self) -> Result<usize, PipelineError> {
        drop(self.tx);
        self.task
            .await
            .context("attempt ledger writer panicked")?
    }
}
