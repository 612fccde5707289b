// The discovery-and-promotion pipeline.
//
// orchestrator drives runs, ledger records every attempt, dedup decides
// whether a profile is new, promotion moves vetted prospects into the
// canonical store.

pub mod dedup;
pub mod ledger;
pub mod orchestrator;
pub mod promotion;

pub use orchestrator::{
    CancelFlag, Orchestrator, PipelineSettings, RunHandle, RunRequest, RunSnapshot,
};
pub use promotion::Promoter;
