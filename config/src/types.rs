//! Kind enums selecting models, distances, ensemblers and agents.

use serde::{Deserialize, Serialize};

/// Trainable model family behind a candidate.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Progressive leave-one-out k-nearest-neighbour.
    #[default]
    Knn,
    /// Nearest class centroid.
    Centroid,
}

/// Distance measure used by neighbour-based models.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum DistanceKind {
    #[default]
    Euclidean,
    Dtw,
}

/// Strategy turning the final candidates into ensemble weights.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum EnsemblerKind {
    /// Weight proportional to each candidate's score.
    #[default]
    ByScore,
    /// Exactly one candidate, weight 1.
    Single,
}

/// Candidate source / selection policy.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Explore every configured candidate, exploit partial ones, keep the best.
    #[default]
    Search,
    /// Offer the first configured candidate only.
    SingleShot,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Knn => write!(f, "knn"),
            Self::Centroid => write!(f, "centroid"),
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "knn" | "knn-loocv" | "nn" => Ok(Self::Knn),
            "centroid" | "nearest-centroid" => Ok(Self::Centroid),
            _ => Err(format!("unknown model '{s}'. Use: knn, centroid")),
        }
    }
}

impl std::fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Euclidean => write!(f, "euclidean"),
            Self::Dtw => write!(f, "dtw"),
        }
    }
}

impl std::str::FromStr for DistanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "euclidean" | "ed" => Ok(Self::Euclidean),
            "dtw" => Ok(Self::Dtw),
            _ => Err(format!("unknown distance '{s}'. Use: euclidean, dtw")),
        }
    }
}

impl std::fmt::Display for EnsemblerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByScore => write!(f, "by-score"),
            Self::Single => write!(f, "single"),
        }
    }
}

impl std::str::FromStr for EnsemblerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "by-score" | "score" => Ok(Self::ByScore),
            "single" => Ok(Self::Single),
            _ => Err(format!("unknown ensembler '{s}'. Use: by-score, single")),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Search => write!(f, "search"),
            Self::SingleShot => write!(f, "single-shot"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "single-shot" | "single" => Ok(Self::SingleShot),
            _ => Err(format!("unknown agent '{s}'. Use: search, single-shot")),
        }
    }
}
