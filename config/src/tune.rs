//! Engine, candidate and data configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AgentKind, DistanceKind, EnsemblerKind, ModelKind};

/// Settings consumed by the tuning engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct TuneParams {
    /// Wall-clock budget for a build. Absent means unlimited.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub time_limit_secs: Option<f64>,
    /// Candidates that cannot checkpoint themselves are saved at most this often.
    #[serde(default = "default_min_checkpoint_interval")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "3600"))]
    pub min_checkpoint_interval_secs: f64,
    /// Root of the shared checkpoint directory. Enables locking and done markers.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub checkpoint_dir: Option<String>,
    /// Root to resume candidates from. Defaults to `checkpoint_dir`.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub load_dir: Option<String>,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0"))]
    pub seed: u64,
    /// Seed for prediction-time tie breaking.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0"))]
    pub test_seed: u64,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub debug_candidates: bool,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub log_candidates: bool,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "by-score"))]
    pub ensembler: EnsemblerKind,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "search"))]
    pub agent: AgentKind,
    /// Keep only the best `top_k` candidates in the final ensemble.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub top_k: Option<usize>,
    /// Visit candidates in a seeded random order.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub shuffle: bool,
}

fn default_min_checkpoint_interval() -> f64 {
    3600.0
}

impl Default for TuneParams {
    fn default() -> Self {
        Self {
            time_limit_secs: None,
            min_checkpoint_interval_secs: default_min_checkpoint_interval(),
            checkpoint_dir: None,
            load_dir: None,
            seed: 0,
            test_seed: 0,
            debug_candidates: false,
            log_candidates: false,
            ensembler: EnsemblerKind::default(),
            agent: AgentKind::default(),
            top_k: None,
            shuffle: false,
        }
    }
}

/// Seconds as a `Duration`. Negative and NaN are zero; values past the
/// `Duration` range saturate.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

impl TuneParams {
    /// Train-time budget, `None` when unlimited.
    #[must_use]
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(secs)
    }

    #[must_use]
    pub fn min_checkpoint_interval(&self) -> Duration {
        secs(self.min_checkpoint_interval_secs)
    }

    #[must_use]
    pub fn is_checkpointing(&self) -> bool {
        self.checkpoint_dir.is_some()
    }

    /// Directory candidates are resumed from.
    #[must_use]
    pub fn load_dir(&self) -> Option<&str> {
        self.load_dir.as_deref().or(self.checkpoint_dir.as_deref())
    }
}

/// Definition of one candidate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CandidateParams {
    /// Stable identity; doubles as the checkpoint directory name.
    pub name: String,
    #[serde(default)]
    pub model: ModelKind,
    /// Neighbours voting in a knn prediction.
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub distance: DistanceKind,
    /// DTW warping window; negative means unconstrained.
    #[serde(default = "default_window")]
    pub window: i64,
    /// Neighbours admitted per training step (0 admits all at once).
    #[serde(default)]
    pub step: usize,
    /// Cap on the neighbour pool.
    #[serde(default)]
    pub neighbour_limit: Option<usize>,
}

fn default_k() -> usize {
    1
}

fn default_window() -> i64 {
    -1
}

impl CandidateParams {
    #[must_use]
    pub fn new(name: impl Into<String>, model: ModelKind) -> Self {
        Self {
            name: name.into(),
            model,
            k: default_k(),
            distance: DistanceKind::default(),
            window: default_window(),
            step: 0,
            neighbour_limit: None,
        }
    }
}

/// Seeded synthetic dataset settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataParams {
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Half-width of the uniform noise around each class centre.
    #[serde(default = "default_spread")]
    pub spread: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_instances() -> usize {
    120
}
fn default_classes() -> usize {
    3
}
fn default_dims() -> usize {
    8
}
fn default_spread() -> f64 {
    1.5
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            classes: default_classes(),
            dims: default_dims(),
            spread: default_spread(),
            seed: 0,
        }
    }
}
