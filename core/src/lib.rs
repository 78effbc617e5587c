#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    //
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
)]

//! IncTune Core
//!
//! This crate provides the seams the tuning engine is built on:
//! - `Candidate` trait and its optional capabilities
//! - `Agent` trait - the candidate source and selection policy
//! - `ElapsedTimer`, `MemoryTracker` - pausable, mergeable resource monitors

pub mod agent;
pub mod candidate;
pub mod monitor;
pub mod test_utils;

pub use agent::{Agent, AgentError, Mode};
pub use candidate::{
    Candidate, CandidateError, CandidateSettings, SelfCheckpointing, SelfMemoryTracked,
    SelfTimed, TimeContractable,
};
pub use inctune_data::Dataset;
pub use monitor::{
    ElapsedTimer, MemoryTracker, MemoryWatch, MonitorError, ResourceMonitors, ResourceUsage,
    current_rss_bytes,
};
