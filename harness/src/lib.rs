#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

//! inctune harness
//!
//! Runs the incremental tuning engine over a candidate pool, checkpointing into
//! a directory shared by any number of worker processes.

pub mod agent;
pub mod config;
pub mod engine;
pub mod ensemble;
pub mod runner;
pub mod search;
pub mod store;

pub use agent::{SingleShotAgent, build_agent};
pub use config::{ConfigError, TuneConfig};
pub use engine::{BuildReport, BuildStatus, EngineError, Member, StepEvent, StepOutcome, TuningEngine};
pub use ensemble::{ByScore, EnsembleError, Ensembler, Single, build_ensembler};
pub use runner::Runner;
pub use search::SearchAgent;
pub use store::{CheckpointStore, LockHandle, StoreError};
