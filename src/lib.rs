// Prospector: discovery and promotion pipeline for influencer prospects.
//
// This is the library root. Each module corresponds to a major subsystem
// of the pipeline; main.rs is a thin CLI over it.

pub mod config;
pub mod db;
pub mod error;
pub mod output;
pub mod pacing;
pub mod pipeline;
pub mod sources;
pub mod status;

#[cfg(feature = "web")]
pub mod web;
