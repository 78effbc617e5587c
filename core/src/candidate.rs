//! The trainable-model interface the engine drives.
//!
//! A candidate is a named, trainable unit. The name is its identity: it is kept
//! across every training step and doubles as the checkpoint directory name.
//!
//! Beyond the required methods a candidate may expose optional capabilities
//! through the `self_*`/`time_contractable` accessors. The engine asks for each
//! capability and falls back to its own accounting when it is absent.

use std::{path::Path, time::Duration};

use inctune_data::Dataset;

/// Per-run settings propagated to every candidate before it trains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSettings {
    pub seed: u64,
    pub debug: bool,
    pub log: bool,
}

pub trait Candidate: Send {
    fn name(&self) -> &str;

    /// Run one training step.
    fn train(&mut self, data: &Dataset) -> Result<(), CandidateError>;

    /// Class-probability distribution for one instance.
    fn distribution(&self, instance: &[f64]) -> Result<Vec<f64>, CandidateError>;

    /// Quality estimate, larger is better.
    fn score(&self) -> f64;

    /// Whether further training steps would change the model.
    fn is_fully_trained(&self) -> bool {
        true
    }

    /// Estimated cost of the next training step, `None` when unknown.
    fn predict_next_step_cost(&self) -> Option<Duration> {
        None
    }

    fn configure(&mut self, _settings: &CandidateSettings) {}

    /// Serialisable training state.
    fn snapshot(&self) -> Result<serde_json::Value, CandidateError>;

    /// Replace training state with a previous `snapshot`.
    fn restore(&mut self, state: serde_json::Value) -> Result<(), CandidateError>;

    fn clone_box(&self) -> Box<dyn Candidate>;

    fn self_timed(&self) -> Option<&dyn SelfTimed> {
        None
    }

    fn self_memory_tracked(&self) -> Option<&dyn SelfMemoryTracked> {
        None
    }

    fn self_checkpointing(&mut self) -> Option<&mut dyn SelfCheckpointing> {
        None
    }

    fn time_contractable(&mut self) -> Option<&mut dyn TimeContractable> {
        None
    }
}

impl Clone for Box<dyn Candidate> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl std::fmt::Debug for dyn Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("name", &self.name())
            .field("score", &self.score())
            .field("fully_trained", &self.is_fully_trained())
            .finish()
    }
}

/// Candidate that measures its own training time.
pub trait SelfTimed {
    /// Cumulative training time over every step so far, restored steps included.
    fn train_time(&self) -> Duration;
}

/// Candidate that measures its own peak memory.
pub trait SelfMemoryTracked {
    fn peak_memory_bytes(&self) -> u64;
}

/// Candidate that writes and reads its own checkpoints.
pub trait SelfCheckpointing {
    /// Directory intermediate checkpoints go to; `None` disables them.
    fn set_checkpoint_dir(&mut self, dir: Option<&Path>);

    fn set_min_checkpoint_interval(&mut self, interval: Duration);

    fn save_checkpoint(&self, dir: &Path) -> Result<(), CandidateError>;

    /// Returns false when `dir` holds nothing to resume from.
    fn load_checkpoint(&mut self, dir: &Path) -> Result<bool, CandidateError>;
}

/// Candidate that can bound its own training time.
pub trait TimeContractable {
    fn set_train_time_limit(&mut self, limit: Option<Duration>);
}

#[derive(Debug, thiserror::Error)]
pub enum CandidateError {
    #[error("candidate {0} has not been trained")]
    NotTrained(String),
    #[error("instance has {actual} features, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid state for candidate {name}: {source}")]
    State {
        name: String,
        source: serde_json::Error,
    },
    #[error("checkpoint io for candidate {name} at {path}: {source}")]
    Io {
        name: String,
        path: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

impl CandidateError {
    pub fn state(name: &str, source: serde_json::Error) -> Self {
        Self::State {
            name: name.to_string(),
            source,
        }
    }

    pub fn io(name: &str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            name: name.to_string(),
            path: path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedCandidate;

    #[test]
    fn test_boxed_clone_keeps_identity() {
        let candidate: Box<dyn Candidate> = Box::new(ScriptedCandidate::new("a", 0.5));
        let copy = candidate.clone();
        assert_eq!(copy.name(), "a");
        assert!((copy.score() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_capabilities_default_absent() {
        let mut candidate = ScriptedCandidate::new("plain", 0.1);
        assert!(candidate.self_timed().is_none());
        assert!(candidate.self_memory_tracked().is_none());
        assert!(candidate.self_checkpointing().is_none());
        assert!(candidate.time_contractable().is_none());
    }

    #[test]
    fn test_debug_shows_name() {
        let candidate: Box<dyn Candidate> = Box::new(ScriptedCandidate::new("dbg", 0.0));
        assert!(format!("{candidate:?}").contains("dbg"));
    }
}
