// Error taxonomy for the pipeline.
//
// Callers of the orchestrator and promotion pipeline match on PipelineError;
// adapters report SourceError, which never escapes a run: it is captured on
// the attempt it belongs to. Storage plumbing stays on anyhow and is wrapped
// into PipelineError::Storage at the public boundary.

use thiserror::Error;

use crate::db::models::{AttemptReason, RecordRef, RunStatus};

/// Errors surfaced to callers of the public pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad config, rejected before any run row exists.
    #[error("invalid scraping config: {0}")]
    Validation(String),

    /// Run-level state machine violation, e.g. cancelling a completed run.
    #[error("run {run_id} is {status}, expected running")]
    InvalidState { run_id: i64, status: RunStatus },

    /// Prospect action on a prospect that is no longer pending.
    #[error("prospect {prospect_id} was already processed ({status})")]
    AlreadyProcessed { prospect_id: i64, status: String },

    #[error("run {0} not found")]
    RunNotFound(i64),

    #[error("prospect {0} not found")]
    ProspectNotFound(i64),

    /// Ambiguous identity: the profile matches several distinct records.
    #[error("prospect {prospect_id} matches several canonical profiles: {}", format_records(.records))]
    Conflict {
        prospect_id: i64,
        records: Vec<RecordRef>,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

fn format_records(records: &[RecordRef]) -> String {
    records
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors reported by a source adapter for a single call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// The target does not exist on the source. Not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// The source signaled anti-scraping defenses or rate limiting. Not
    /// retried within the run; raises the source's backoff.
    #[error("blocked by source: {0}")]
    Blocked(String),

    /// Network trouble or a timeout. Retried within the bound.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The source answered with something unusable (bad credentials config,
    /// unexpected schema). Fails the run.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::TransientNetwork(_))
    }

    /// The attempt reason this error is recorded under.
    pub fn reason(&self) -> AttemptReason {
        match self {
            SourceError::NotFound(_) => AttemptReason::NotFound,
            SourceError::Blocked(_) => AttemptReason::Blocked,
            SourceError::TransientNetwork(_) => AttemptReason::TransientNetwork,
            SourceError::Fatal(_) => AttemptReason::Fatal,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Fatal(err.to_string())
        } else {
            SourceError::TransientNetwork(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(SourceError::TransientNetwork("reset".into()).is_retryable());
        assert!(!SourceError::Blocked("429".into()).is_retryable());
        assert!(!SourceError::NotFound("gone".into()).is_retryable());
        assert!(!SourceError::Fatal("schema".into()).is_retryable());
    }

    #[test]
    fn test_conflict_message_lists_records() {
        let err = PipelineError::Conflict {
            prospect_id: 7,
            records: vec![RecordRef::canonical(1), RecordRef::canonical(2)],
        };
        assert_eq!(
            err.to_string(),
            "prospect 7 matches several canonical profiles: canonical #1, canonical #2"
        );
    }
}
