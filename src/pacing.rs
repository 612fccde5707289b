// Per-source pacing with adaptive backoff.
//
// Every outbound adapter call goes through `RateController::run`, which:
// 1. takes a concurrency permit for the source (max concurrent calls),
// 2. reserves the next request slot (minimum interval plus current backoff),
// 3. runs the call under a hard timeout, converting expiry to a transient
//    network error,
// 4. feeds the outcome back: `Blocked` doubles the backoff from the base up
//    to the ceiling, a streak of successes halves it again.
//
// The controller decides *when* calls happen, never *how many*. Retry counts
// belong to the attempt ledger.
//
// State is shared by all runs in the process behind a std Mutex. The lock is
// only held to compute a wait and is dropped before sleeping.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::sources::SourceKind;

/// Pacing parameters for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicy {
    /// Minimum gap between the starts of two consecutive calls.
    pub min_interval: Duration,
    pub max_concurrency: usize,
    /// Hard per-call timeout.
    pub timeout: Duration,
    /// First backoff step after a `Blocked` signal.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive successes after which the backoff is halved.
    pub halve_after: u32,
}

impl SourcePolicy {
    /// Conservative defaults per source.
    pub fn defaults_for(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Search => Self {
                min_interval: Duration::from_millis(1_000),
                max_concurrency: 1,
                timeout: Duration::from_secs(15),
                base_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(60),
                halve_after: 5,
            },
            SourceKind::Instagram => Self {
                min_interval: Duration::from_millis(2_500),
                max_concurrency: 1,
                timeout: Duration::from_secs(20),
                base_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(300),
                halve_after: 5,
            },
        }
    }
}

#[derive(Debug, Default)]
struct LaneState {
    /// Start time of the most recently scheduled call.
    last_start: Option<Instant>,
    backoff: Duration,
    consecutive_ok: u32,
}

struct Lane {
    policy: SourcePolicy,
    permits: Semaphore,
    state: Mutex<LaneState>,
}

impl Lane {
    fn new(policy: SourcePolicy) -> Self {
        Self {
            permits: Semaphore::new(policy.max_concurrency.max(1)),
            policy,
            state: Mutex::new(LaneState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next start slot and return how long to wait for it.
    fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state();
        let gap = self.policy.min_interval + state.backoff;
        let start = match state.last_start {
            Some(last) => (last + gap).max(now),
            None => now,
        };
        state.last_start = Some(start);
        start - now
    }

    fn record<T>(&self, kind: SourceKind, outcome: &Result<T, SourceError>) {
        let mut state = self.state();
        match outcome {
            Ok(_) => {
                state.consecutive_ok += 1;
                if state.consecutive_ok >= self.policy.halve_after && !state.backoff.is_zero() {
                    let halved = state.backoff / 2;
                    state.backoff = if halved < self.policy.base_backoff {
                        Duration::ZERO
                    } else {
                        halved
                    };
                    state.consecutive_ok = 0;
                    debug!(source = %kind, backoff_ms = state.backoff.as_millis() as u64, "Backoff relaxed");
                }
            }
            Err(SourceError::Blocked(_)) => {
                state.consecutive_ok = 0;
                state.backoff = if state.backoff.is_zero() {
                    self.policy.base_backoff
                } else {
                    state.backoff.saturating_mul(2)
                }
                .min(self.policy.max_backoff);
                warn!(
                    source = %kind,
                    backoff_secs = state.backoff.as_secs_f64(),
                    "Source signaled blocking, backing off"
                );
            }
            // NotFound, transient and fatal errors say nothing about pacing
            Err(_) => {}
        }
    }
}

/// Shared pacing controller for all sources.
pub struct RateController {
    search: Lane,
    instagram: Lane,
}

impl RateController {
    /// Build a controller. Sources missing from `policies` use their defaults.
    pub fn new(policies: impl IntoIterator<Item = (SourceKind, SourcePolicy)>) -> Self {
        let mut search = SourcePolicy::defaults_for(SourceKind::Search);
        let mut instagram = SourcePolicy::defaults_for(SourceKind::Instagram);
        for (kind, policy) in policies {
            match kind {
                SourceKind::Search => search = policy,
                SourceKind::Instagram => instagram = policy,
            }
        }
        Self {
            search: Lane::new(search),
            instagram: Lane::new(instagram),
        }
    }

    fn lane(&self, kind: SourceKind) -> &Lane {
        match kind {
            SourceKind::Search => &self.search,
            SourceKind::Instagram => &self.instagram,
        }
    }

    pub fn policy(&self, kind: SourceKind) -> &SourcePolicy {
        &self.lane(kind).policy
    }

    /// Current extra delay applied between calls to a source.
    pub fn current_backoff(&self, kind: SourceKind) -> Duration {
        self.lane(kind).state().backoff
    }

    /// Run one adapter call under the source's pacing policy.
    pub async fn run<T, F>(&self, kind: SourceKind, call: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        let lane = self.lane(kind);
        let _permit = lane
            .permits
            .acquire()
            .await
            .map_err(|_| SourceError::Fatal(format!("{kind} pacing closed")))?;

        let wait = lane.reserve();
        if !wait.is_zero() {
            debug!(source = %kind, wait_ms = wait.as_millis() as u64, "Pacing wait");
            tokio::time::sleep(wait).await;
        }

        let outcome = match tokio::time::timeout(lane.policy.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::TransientNetwork(format!(
                "{kind} call timed out after {:.1}s",
                lane.policy.timeout.as_secs_f64()
            ))),
        };

        lane.record(kind, &outcome);
        outcome
    }
}

impl Default for RateController {
    fn default() -> Self {
        Self::new([])
    }
}
