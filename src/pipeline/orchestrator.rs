// Run orchestrator — drives a scraping run from request to terminal state.
//
// start_run validates and persists the config and the run row, then spawns
// one tokio task per run and returns. The task resolves targets (discovery
// pages or canonical profiles due for refresh), fetches them through the
// pacing controller with ordered bounded concurrency, runs dedup on each
// profile, and hands exactly one attempt per admitted target to the ledger
// writer. Run status only ever moves forward; every transition is a
// conditional update, so a cancel racing the task's own completion resolves
// to whichever write lands first.
//
// Cancellation is cooperative. cancel_run flips the run's in-process flag and
// finalizes the row; the task notices between targets. It also re-reads the
// row before each target is settled, so a cancel issued from another process
// stops it just as quickly. Calls already in flight complete and are recorded
// as skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dedup::{self, DedupEngine, MatchOutcome};
use super::ledger::{should_retry, AttemptLedger, LedgerWriter};
use crate::config::Config;
use crate::db::models::{
    AttemptReason, NewAttempt, Platform, ProfileDraft, ProspectDraft, ProspectInsert, Provenance,
    RecordKind,
    RefreshCriteria, RunError, RunErrorKind, RunStatus, RunType, ScrapingAttempt, ScrapingConfig,
    ScrapingRun,
};
use crate::db::Database;
use crate::error::{PipelineError, SourceError};
use crate::pacing::RateController;
use crate::sources::{Candidate, DiscoveryQuery, ScrapedProfile, SourceKind, SourceSet};

/// Tunables for run execution.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Targets that failed Blocked/NotFound this recently are skipped.
    pub cooldown: chrono::Duration,
    /// Unfinished runs idle for this long are reconciled as interrupted.
    pub stale_run_after: chrono::Duration,
    /// Discovery admits at most `result_count × candidate_headroom` candidates.
    pub candidate_headroom: u32,
    pub max_pages_per_query: u32,
    /// Attempts included in a status snapshot.
    pub snapshot_attempts: u32,
    pub ledger_buffer: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cooldown: chrono::Duration::days(7),
            stale_run_after: chrono::Duration::minutes(30),
            candidate_headroom: 3,
            max_pages_per_query: 5,
            snapshot_attempts: 50,
            ledger_buffer: 64,
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: ScrapingConfig,
    pub run_type: RunType,
    /// For refresh runs: only profiles with one of these `found_by` tags.
    pub source_filter: Vec<String>,
}

impl RunRequest {
    pub fn discovery(config: ScrapingConfig) -> Self {
        Self {
            config,
            run_type: RunType::Discovery,
            source_filter: Vec::new(),
        }
    }

    pub fn refresh(config: ScrapingConfig, source_filter: Vec<String>) -> Self {
        Self {
            config,
            run_type: RunType::Refresh,
            source_filter,
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub run: ScrapingRun,
    pub cancelled: bool,
    pub attempt_count: i64,
    /// Most recent first, bounded.
    pub recent_attempts: Vec<ScrapingAttempt>,
}

/// In-process cancellation signal shared between cancel_run and a run task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returned by start_run. Dropping it detaches the run; it keeps going.
pub struct RunHandle {
    pub run_id: i64,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Wait for the run task to reach a terminal state.
    pub async fn finished(self) -> Result<(), PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Storage(anyhow::anyhow!("run {} task failed: {e}", self.run_id)))
    }
}

struct Inner {
    db: Arc<dyn Database>,
    sources: SourceSet,
    pacing: Arc<RateController>,
    dedup: DedupEngine,
    ledger: AttemptLedger,
    settings: PipelineSettings,
    active: Mutex<HashMap<i64, CancelFlag>>,
}

impl Inner {
    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<i64, CancelFlag>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entry point for starting, observing and cancelling runs. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        sources: SourceSet,
        pacing: Arc<RateController>,
        settings: PipelineSettings,
    ) -> Self {
        let inner = Inner {
            dedup: DedupEngine::new(db.clone()),
            ledger: AttemptLedger::new(db.clone(), settings.cooldown),
            db,
            sources,
            pacing,
            settings,
            active: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Wire up production adapters and pacing from configuration.
    pub fn from_config(db: Arc<dyn Database>, config: &Config) -> anyhow::Result<Self> {
        let sources = SourceSet::from_config(config)?;
        let pacing = Arc::new(RateController::new(config.source_policies.clone()));
        Ok(Self::new(db, sources, pacing, config.pipeline_settings()))
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.inner.db
    }

    /// The dedup engine runs share. Promotion must use the same one so its
    /// fingerprint locks serialize against in-flight runs.
    pub fn dedup(&self) -> DedupEngine {
        self.inner.dedup.clone()
    }

    /// Validate, persist and launch a run. Returns as soon as the task is
    /// spawned; nothing is written when validation fails.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunHandle, PipelineError> {
        let config = validate(&request, &self.inner.sources)?;

        let config_id = self.inner.db.insert_config(&config).await?;
        let run_id = self
            .inner
            .db
            .insert_run(config_id, request.run_type, &request.source_filter)
            .await?;

        let cancel = CancelFlag::default();
        self.inner.active().insert(run_id, cancel.clone());

        info!(
            run_id,
            run_type = %request.run_type,
            countries = ?config.countries,
            result_count = config.result_count,
            "Run started"
        );

        let ctx = RunContext {
            writer: self.inner.ledger.spawn_writer(self.inner.settings.ledger_buffer),
            inner: self.inner.clone(),
            run_id,
            run_type: request.run_type,
            config,
            cancel,
            quota_reached: Arc::new(AtomicBool::new(false)),
            seen: HashSet::new(),
            found: 0,
            processed: 0,
        };
        let task = tokio::spawn(drive(ctx, request.source_filter));

        Ok(RunHandle { run_id, task })
    }

    pub async fn run_status(&self, run_id: i64) -> Result<RunSnapshot, PipelineError> {
        let run = self
            .inner
            .db
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;
        let recent_attempts = self
            .inner
            .db
            .list_attempts(run_id, self.inner.settings.snapshot_attempts)
            .await?;
        let attempt_count = self.inner.db.count_attempts(run_id).await?;

        Ok(RunSnapshot {
            cancelled: run.is_cancelled(),
            run,
            attempt_count,
            recent_attempts,
        })
    }

    /// Cancel a running run. Anything but `running` is an InvalidState and
    /// leaves the run untouched.
    pub async fn cancel_run(&self, run_id: i64) -> Result<(), PipelineError> {
        let run = self
            .inner
            .db
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(PipelineError::InvalidState {
                run_id,
                status: run.status,
            });
        }

        let flag = self.inner.active().get(&run_id).cloned();
        if let Some(flag) = flag {
            flag.cancel();
        }

        let finished = self
            .inner
            .db
            .finish_run(run_id, RunStatus::Failed, &[RunError::cancelled()])
            .await?;
        if !finished {
            // The run reached a terminal state between the read and the write
            let status = self
                .inner
                .db
                .get_run(run_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(run.status);
            return Err(PipelineError::InvalidState { run_id, status });
        }

        info!(run_id, "Run cancelled");
        Ok(())
    }

    /// Finalize runs left pending/running by a crashed process. A run counts
    /// as stale when neither its start nor its newest attempt falls within
    /// `stale_run_after`. Runs owned by this process are never touched.
    /// Returns the IDs that were reconciled.
    pub async fn recover_stale_runs(&self) -> Result<Vec<i64>, PipelineError> {
        let cutoff = Utc::now() - self.inner.settings.stale_run_after;
        let mut recovered = Vec::new();

        for run in self.inner.db.list_unfinished_runs().await? {
            let owned_here = self.inner.active().contains_key(&run.id);
            if owned_here {
                continue;
            }
            let last_attempt = self.inner.db.latest_attempt_at(run.id).await?;
            let last_activity = last_attempt.map_or(run.started_at, |t| t.max(run.started_at));
            if last_activity >= cutoff {
                continue;
            }

            let error = RunError::new(
                RunErrorKind::Interrupted,
                format!(
                    "run was {} with no activity since {}; reconciled after restart",
                    run.status,
                    last_activity.format("%Y-%m-%d %H:%M:%S UTC")
                ),
            );
            if self
                .inner
                .db
                .finish_run(run.id, RunStatus::Failed, &[error])
                .await?
            {
                warn!(run_id = run.id, "Stale run marked failed");
                recovered.push(run.id);
            }
        }

        Ok(recovered)
    }
}

// --- Validation ---

/// Check a request and return its config normalized (trimmed keywords,
/// upper-cased deduplicated countries, deduplicated platforms).
fn validate(request: &RunRequest, sources: &SourceSet) -> Result<ScrapingConfig, PipelineError> {
    let invalid = |msg: String| Err(PipelineError::Validation(msg));
    let c = &request.config;

    let mut countries: Vec<String> = Vec::new();
    for raw in &c.countries {
        let code = raw.trim().to_ascii_uppercase();
        if code.len() != 2 || !code.chars().all(|ch| ch.is_ascii_alphabetic()) {
            return invalid(format!("country {raw:?} is not an ISO 3166-1 alpha-2 code"));
        }
        if !countries.contains(&code) {
            countries.push(code);
        }
    }
    if countries.is_empty() {
        return invalid("at least one country is required".to_string());
    }

    if c.min_followers < 0 || c.max_followers < 0 {
        return invalid("follower bounds must be non-negative".to_string());
    }
    if c.min_followers > c.max_followers {
        return invalid(format!(
            "min_followers ({}) is greater than max_followers ({})",
            c.min_followers, c.max_followers
        ));
    }
    if c.result_count == 0 {
        return invalid("result_count must be greater than zero".to_string());
    }

    let mut platforms: Vec<Platform> = Vec::new();
    for platform in &c.platforms {
        if sources.profile_source(*platform).is_none() {
            return invalid(format!("no profile source is configured for {platform}"));
        }
        if !platforms.contains(platform) {
            platforms.push(*platform);
        }
    }
    if platforms.is_empty() {
        return invalid("at least one platform is required".to_string());
    }

    let clean = |keywords: &[String]| -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for kw in keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
            if !out.iter().any(|seen| seen.eq_ignore_ascii_case(kw)) {
                out.push(kw.to_string());
            }
        }
        out
    };
    let include_keywords = clean(&c.include_keywords);
    let exclude_keywords = clean(&c.exclude_keywords);

    if request.run_type == RunType::Discovery {
        if include_keywords.is_empty() {
            return invalid("discovery runs need at least one include keyword".to_string());
        }
        if sources.discovery().is_none() {
            return invalid("no discovery source is configured (set SEARCH_API_KEY and SEARCH_ENGINE_ID)".to_string());
        }
    }

    Ok(ScrapingConfig {
        countries,
        min_followers: c.min_followers,
        max_followers: c.max_followers,
        include_keywords,
        exclude_keywords,
        platforms,
        result_count: c.result_count,
    })
}

// --- Run task ---

/// How a stage of the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    QuotaReached,
    Cancelled,
}

/// What happened to one target before the consumer saw it.
enum Fetch {
    Cancelled,
    QuotaReached,
    CoolingDown(AttemptReason),
    Fetched(ScrapedProfile),
    Failed(SourceError),
    Storage(PipelineError),
}

fn storage_error(e: impl std::fmt::Display) -> RunError {
    RunError::new(RunErrorKind::Storage, e.to_string())
}

struct RunContext {
    inner: Arc<Inner>,
    run_id: i64,
    run_type: RunType,
    config: ScrapingConfig,
    cancel: CancelFlag,
    quota_reached: Arc<AtomicBool>,
    writer: LedgerWriter,
    /// Targets already admitted to this run.
    seen: HashSet<(Platform, String)>,
    found: i64,
    processed: i64,
}

async fn drive(mut ctx: RunContext, source_filter: Vec<String>) {
    let run_id = ctx.run_id;
    let outcome = ctx.execute(&source_filter).await;

    let RunContext {
        inner,
        writer,
        found,
        processed,
        ..
    } = ctx;

    // Flush the ledger before the run turns terminal so a finished run's
    // attempt history is complete.
    let flushed = writer.close().await;

    let (status, errors) = match (outcome, flushed) {
        (Err(run_error), _) => (RunStatus::Failed, vec![run_error]),
        (Ok(_), Err(e)) => (RunStatus::Failed, vec![storage_error(e)]),
        (Ok(Flow::Cancelled), Ok(_)) => (RunStatus::Failed, vec![RunError::cancelled()]),
        (Ok(_), Ok(_)) => (RunStatus::Completed, Vec::new()),
    };

    match inner.db.finish_run(run_id, status, &errors).await {
        Ok(true) => {
            if status == RunStatus::Completed {
                info!(run_id, found, processed, "Run completed");
            } else {
                let reason = errors.first().map(|e| e.message.as_str()).unwrap_or_default();
                warn!(run_id, found, processed, reason, "Run failed");
            }
        }
        Ok(false) => debug!(run_id, "Run was already terminal"),
        Err(e) => error!(run_id, error = %e, "Failed to finalize run"),
    }

    inner.active().remove(&run_id);
}

impl RunContext {
    async fn execute(&mut self, source_filter: &[String]) -> Result<Flow, RunError> {
        match self.run_type {
            RunType::Discovery => self.run_discovery().await,
            RunType::Refresh => self.run_refresh(source_filter).await,
        }
    }

    fn candidate_budget(&self) -> i64 {
        i64::from(self.config.result_count) * i64::from(self.inner.settings.candidate_headroom.max(1))
    }

    /// Round-robin over every (keyword, country, platform) query, one page
    /// at a time, until the quota, the candidate budget or the queries run out.
    async fn run_discovery(&mut self) -> Result<Flow, RunError> {
        let Some(source) = self.inner.sources.discovery().cloned() else {
            return Err(RunError::new(RunErrorKind::Adapter, "no discovery source configured"));
        };

        let mut queue: VecDeque<(DiscoveryQuery, u32)> = VecDeque::new();
        for keyword in &self.config.include_keywords {
            for country in &self.config.countries {
                for platform in &self.config.platforms {
                    let query = DiscoveryQuery {
                        platform: *platform,
                        keyword: keyword.clone(),
                        country: country.clone(),
                    };
                    queue.push_back((query, 0));
                }
            }
        }

        let budget = self.candidate_budget();
        while let Some((query, page)) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            if self.found >= budget {
                debug!(run_id = self.run_id, budget, "Candidate budget spent");
                break;
            }

            let result = call_with_retry(&self.inner.pacing, source.kind(), || {
                source.discover(&query, page)
            })
            .await;

            match result {
                Ok(discovered) => {
                    let flow = self.process_batch(discovered.candidates).await?;
                    if flow != Flow::Continue {
                        return Ok(flow);
                    }
                    if let Some(next) = discovered.next_page {
                        if next < self.inner.settings.max_pages_per_query {
                            queue.push_back((query, next));
                        }
                    }
                }
                Err(SourceError::Fatal(msg)) => {
                    return Err(RunError::new(
                        RunErrorKind::Adapter,
                        format!("discovery query {:?} failed: {msg}", query.search_terms()),
                    ));
                }
                Err(e) => {
                    warn!(run_id = self.run_id, query = %query.search_terms(), page, error = %e, "Discovery page failed, dropping query");
                    let note = RunError::new(
                        RunErrorKind::Discovery,
                        format!("{} (page {page}): {e}", query.search_terms()),
                    );
                    self.inner
                        .db
                        .append_run_error(self.run_id, &note)
                        .await
                        .map_err(storage_error)?;
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Re-scrape canonical profiles matching the config, least recently
    /// scraped first.
    async fn run_refresh(&mut self, source_filter: &[String]) -> Result<Flow, RunError> {
        let criteria = RefreshCriteria {
            countries: self.config.countries.clone(),
            min_followers: self.config.min_followers,
            max_followers: self.config.max_followers,
            platforms: self.config.platforms.clone(),
            found_by: source_filter.to_vec(),
            limit: self.config.result_count,
        };
        let targets = self
            .inner
            .db
            .list_refresh_targets(&criteria)
            .await
            .map_err(storage_error)?;
        info!(run_id = self.run_id, targets = targets.len(), "Refresh targets selected");

        let candidates = targets
            .into_iter()
            .map(|t| Candidate {
                platform: t.platform,
                identifier: t.handle,
                country: t.country,
                hit: None,
            })
            .collect();
        self.process_batch(candidates).await
    }

    /// Admit a batch of candidates, fetch them in order with bounded
    /// concurrency, and record one attempt for each.
    async fn process_batch(&mut self, candidates: Vec<Candidate>) -> Result<Flow, RunError> {
        if !self.still_active().await? {
            return Ok(Flow::Cancelled);
        }

        let room = (self.candidate_budget() - self.found).max(0) as usize;
        let admitted: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| self.seen.insert((c.platform, c.identifier.clone())))
            .take(room)
            .collect();
        if admitted.is_empty() {
            return Ok(Flow::Continue);
        }

        let count = admitted.len() as i64;
        if !self
            .inner
            .db
            .add_run_found(self.run_id, count)
            .await
            .map_err(storage_error)?
        {
            self.cancel.cancel();
            return Ok(Flow::Cancelled);
        }
        self.found += count;
        debug!(run_id = self.run_id, admitted = count, found = self.found, "Candidates admitted");

        let concurrency = admitted
            .iter()
            .map(|c| profile_kind(&self.inner.sources, c.platform))
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|kind| self.inner.pacing.policy(kind).max_concurrency)
            .max()
            .unwrap_or(1)
            .max(1);

        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let quota = self.quota_reached.clone();
        let fetches = stream::iter(admitted)
            .map(move |candidate| {
                fetch_candidate(inner.clone(), cancel.clone(), quota.clone(), candidate)
            })
            .buffered(concurrency);
        let mut fetches = std::pin::pin!(fetches);

        // A fatal error stops the batch, but the targets still in the stream
        // were admitted and each gets its (skipped) attempt first.
        let mut failure: Option<RunError> = None;
        while let Some((candidate, fetch)) = fetches.next().await {
            if failure.is_none() && !self.cancel.is_cancelled() {
                if let Err(run_error) = self.still_active().await {
                    self.cancel.cancel();
                    failure = Some(run_error);
                }
            }
            match self.settle(&candidate, fetch).await {
                Ok(attempt) => self.writer.send(attempt).await.map_err(storage_error)?,
                Err(run_error) => {
                    if failure.is_none() {
                        self.cancel.cancel();
                        failure = Some(run_error);
                    }
                }
            }
        }
        if let Some(run_error) = failure {
            return Err(run_error);
        }

        Ok(if self.cancel.is_cancelled() {
            Flow::Cancelled
        } else if self.quota_reached.load(Ordering::SeqCst) {
            Flow::QuotaReached
        } else {
            Flow::Continue
        })
    }

    /// Re-read the run row. A run another process finalized (cancelled or
    /// reconciled) trips the cancel flag so the remaining targets are skipped.
    async fn still_active(&self) -> Result<bool, RunError> {
        let run = self
            .inner
            .db
            .get_run(self.run_id)
            .await
            .map_err(storage_error)?;
        let active = run.is_some_and(|r| !r.status.is_terminal());
        if !active {
            debug!(run_id = self.run_id, "Run finalized elsewhere, stopping");
            self.cancel.cancel();
        }
        Ok(active)
    }

    /// Turn one target's fetch outcome into its attempt, creating a prospect
    /// when the profile is new.
    async fn settle(&mut self, candidate: &Candidate, fetch: Fetch) -> Result<NewAttempt, RunError> {
        let (run_id, platform, target) = (self.run_id, candidate.platform, candidate.identifier.as_str());

        let profile = match fetch {
            Fetch::Fetched(profile) => profile,
            Fetch::Cancelled => {
                return Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::Cancelled, None));
            }
            Fetch::QuotaReached => {
                return Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::QuotaReached, None));
            }
            Fetch::CoolingDown(reason) => {
                return Ok(NewAttempt::skipped(
                    run_id,
                    platform,
                    target,
                    AttemptReason::CoolDown,
                    Some(format!("{reason} within the cool-down window")),
                ));
            }
            Fetch::Failed(err) => {
                if let SourceError::Fatal(msg) = &err {
                    // Record the attempt before the run fails on it
                    let attempt = NewAttempt::failed(run_id, platform, target, &err);
                    self.writer.send(attempt).await.map_err(storage_error)?;
                    return Err(RunError::new(
                        RunErrorKind::Adapter,
                        format!("{platform} fetch of {target} failed: {msg}"),
                    ));
                }
                debug!(run_id, target, error = %err, "Fetch failed");
                return Ok(NewAttempt::failed(run_id, platform, target, &err));
            }
            Fetch::Storage(e) => return Err(storage_error(e)),
        };

        let payload = profile.payload.clone();

        if self.cancel.is_cancelled() {
            return Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::Cancelled, None)
                .with_payload(payload));
        }
        if self.quota_reached.load(Ordering::SeqCst) {
            return Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::QuotaReached, None)
                .with_payload(payload));
        }

        if !self.config.accepts_followers(profile.followers) {
            let detail = format!(
                "{} followers outside [{}, {}]",
                profile.followers, self.config.min_followers, self.config.max_followers
            );
            return Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::Filtered, Some(detail))
                .with_payload(payload));
        }
        let text = format!(
            "{} {}",
            profile.display_name.as_deref().unwrap_or_default(),
            profile.bio.as_deref().unwrap_or_default()
        );
        if let Some(keyword) = self.config.excluded_keyword(&text) {
            let detail = format!("matches exclude keyword {keyword:?}");
            return Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::Filtered, Some(detail))
                .with_payload(payload));
        }

        let fields = profile.into_fields(candidate.country.clone());
        let fingerprints = dedup::fingerprints(&fields);
        let _guard = self.inner.dedup.lock(&fingerprints).await;

        let outcome = self
            .inner
            .dedup
            .find_match(&fingerprints)
            .await
            .map_err(storage_error)?;

        match outcome {
            MatchOutcome::Unique => {
                let draft = ProspectDraft { run_id, fields };
                let inserted = self
                    .inner
                    .db
                    .insert_prospect(&draft)
                    .await
                    .map_err(storage_error)?;
                match inserted {
                    ProspectInsert::Created(prospect_id) => {
                        self.processed += 1;
                        if self.processed >= i64::from(self.config.result_count) {
                            self.quota_reached.store(true, Ordering::SeqCst);
                        }
                        debug!(run_id, target, prospect_id, "Prospect created");
                        Ok(NewAttempt::created(run_id, platform, target, payload, prospect_id))
                    }
                    // Lost a race with another process; the unique key caught it
                    ProspectInsert::Duplicate => {
                        Ok(NewAttempt::duplicate(run_id, platform, target, payload))
                    }
                    ProspectInsert::RunClosed => {
                        warn!(run_id, target, "Run turned terminal before the prospect was created");
                        self.cancel.cancel();
                        Ok(NewAttempt::skipped(run_id, platform, target, AttemptReason::Cancelled, None)
                            .with_payload(payload))
                    }
                }
            }
            MatchOutcome::Duplicate(record) => {
                if self.run_type == RunType::Refresh && record.kind == RecordKind::Canonical {
                    let draft = ProfileDraft {
                        fields,
                        provenance: Provenance {
                            found_by: self.run_type.provenance().to_string(),
                            source_hashtags: Vec::new(),
                            source_country: candidate.country.clone(),
                        },
                    };
                    self.inner
                        .db
                        .merge_profile_evidence(record.id, &draft)
                        .await
                        .map_err(storage_error)?;
                    debug!(run_id, target, profile_id = record.id, "Canonical profile refreshed");
                } else {
                    debug!(run_id, target, existing = %record, "Duplicate profile");
                }
                Ok(NewAttempt::duplicate(run_id, platform, target, payload))
            }
            MatchOutcome::Conflict(records) => {
                self.inner
                    .db
                    .insert_conflict(Some(run_id), platform, target, &records)
                    .await
                    .map_err(storage_error)?;
                let detail = records
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                warn!(run_id, target, records = %detail, "Dedup conflict flagged for review");
                Ok(NewAttempt::skipped(
                    run_id,
                    platform,
                    target,
                    AttemptReason::DedupConflict,
                    Some(format!("matches {detail}")),
                )
                .with_payload(payload))
            }
        }
    }
}

fn profile_kind(sources: &SourceSet, platform: Platform) -> SourceKind {
    sources
        .profile_source(platform)
        .map(|s| s.kind())
        .unwrap_or(SourceKind::Instagram)
}

/// Everything that happens to a target before the consumer sees it: cancel
/// and quota checks, the cool-down lookup, then the paced fetch with its
/// bounded retry.
async fn fetch_candidate(
    inner: Arc<Inner>,
    cancel: CancelFlag,
    quota: Arc<AtomicBool>,
    candidate: Candidate,
) -> (Candidate, Fetch) {
    if cancel.is_cancelled() {
        return (candidate, Fetch::Cancelled);
    }
    if quota.load(Ordering::SeqCst) {
        return (candidate, Fetch::QuotaReached);
    }

    match inner
        .ledger
        .cooling_down(candidate.platform, &candidate.identifier)
        .await
    {
        Ok(Some(reason)) => return (candidate, Fetch::CoolingDown(reason)),
        Ok(None) => {}
        Err(e) => return (candidate, Fetch::Storage(e)),
    }

    let Some(source) = inner.sources.profile_source(candidate.platform).cloned() else {
        let err = SourceError::Fatal(format!("no profile source for {}", candidate.platform));
        return (candidate, Fetch::Failed(err));
    };

    let result = call_with_retry(&inner.pacing, source.kind(), || source.fetch_profile(&candidate)).await;
    let fetch = match result {
        Ok(profile) => Fetch::Fetched(profile),
        Err(e) => Fetch::Failed(e),
    };
    (candidate, fetch)
}

/// Run a paced call, retrying transient failures up to the ledger's bound.
async fn call_with_retry<T, F, Fut>(
    pacing: &RateController,
    kind: SourceKind,
    mut call: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut retries = 0;
    loop {
        match pacing.run(kind, call()).await {
            Err(e) if should_retry(&e, retries) => {
                retries += 1;
                debug!(source = %kind, error = %e, retries, "Retrying transient failure");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::sources::{DiscoveryPage, DiscoverySource, ProfileSource};

    struct NoDiscovery;

    #[async_trait]
    impl DiscoverySource for NoDiscovery {
        fn kind(&self) -> SourceKind {
            SourceKind::Search
        }
        async fn discover(&self, _: &DiscoveryQuery, _: u32) -> Result<DiscoveryPage, SourceError> {
            Ok(DiscoveryPage::default())
        }
    }

    struct NoProfiles;

    #[async_trait]
    impl ProfileSource for NoProfiles {
        fn kind(&self) -> SourceKind {
            SourceKind::Instagram
        }
        async fn fetch_profile(&self, c: &Candidate) -> Result<ScrapedProfile, SourceError> {
            Err(SourceError::NotFound(c.identifier.clone()))
        }
    }

    fn sources() -> SourceSet {
        SourceSet::new()
            .with_discovery(Arc::new(NoDiscovery))
            .with_profile_source(Platform::Instagram, Arc::new(NoProfiles))
    }

    fn config() -> ScrapingConfig {
        ScrapingConfig {
            countries: vec![" cz".to_string(), "CZ".to_string()],
            min_followers: 5_000,
            max_followers: 50_000,
            include_keywords: vec!["fashion".to_string(), " Fashion ".to_string(), "".to_string()],
            exclude_keywords: vec![],
            platforms: vec![Platform::Instagram],
            result_count: 10,
        }
    }

    fn rejected(config: ScrapingConfig) -> String {
        match validate(&RunRequest::discovery(config), &sources()) {
            Err(PipelineError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_normalizes_config() {
        let normalized = validate(&RunRequest::discovery(config()), &sources()).unwrap();
        assert_eq!(normalized.countries, vec!["CZ"]);
        assert_eq!(normalized.include_keywords, vec!["fashion"]);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut c = config();
        c.min_followers = 60_000;
        assert!(rejected(c).contains("greater than"));

        let mut c = config();
        c.min_followers = -1;
        assert!(rejected(c).contains("non-negative"));

        let mut c = config();
        c.countries.clear();
        assert!(rejected(c).contains("country"));

        let mut c = config();
        c.countries = vec!["Czechia".to_string()];
        assert!(rejected(c).contains("alpha-2"));

        let mut c = config();
        c.result_count = 0;
        assert!(rejected(c).contains("result_count"));

        let mut c = config();
        c.platforms = vec![Platform::TikTok];
        assert!(rejected(c).contains("tiktok"));

        let mut c = config();
        c.include_keywords = vec!["  ".to_string()];
        assert!(rejected(c).contains("include keyword"));
    }

    #[test]
    fn test_refresh_needs_no_keywords_or_discovery() {
        let mut c = config();
        c.include_keywords.clear();
        let only_profiles =
            SourceSet::new().with_profile_source(Platform::Instagram, Arc::new(NoProfiles));
        assert!(validate(&RunRequest::refresh(c.clone(), vec![]), &only_profiles).is_ok());
        assert!(matches!(
            validate(&RunRequest::discovery(c), &only_profiles),
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_call_with_retry_bounds_transient_retries() {
        use std::sync::atomic::AtomicUsize;

        let pacing = RateController::new([(
            SourceKind::Instagram,
            crate::pacing::SourcePolicy {
                min_interval: std::time::Duration::ZERO,
                ..crate::pacing::SourcePolicy::defaults_for(SourceKind::Instagram)
            },
        )]);
        let calls = AtomicUsize::new(0);
        let result: Result<(), SourceError> = call_with_retry(&pacing, SourceKind::Instagram, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::TransientNetwork("reset".into())) }
        })
        .await;
        assert!(matches!(result, Err(SourceError::TransientNetwork(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        calls.store(0, Ordering::SeqCst);
        let _: Result<(), SourceError> = call_with_retry(&pacing, SourceKind::Instagram, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::Blocked("429".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let run = ScrapingRun {
            id: 1,
            config_id: 1,
            run_type: RunType::Discovery,
            status: RunStatus::Running,
            total_found: 3,
            total_processed: 1,
            started_at: Utc::now(),
            completed_at: None,
            errors: vec![],
            source_filter: vec![],
        };
        let snapshot = RunSnapshot {
            run,
            cancelled: false,
            attempt_count: 0,
            recent_attempts: vec![],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["total_found"], 3);
    }
}
