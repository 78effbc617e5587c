#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::cast_precision_loss,
)]

//! IncTune Models
//!
//! Concrete candidates for the tuning engine:
//! - `KnnCandidate` - progressive leave-one-out kNN, self-timed and time-contractable
//! - `CentroidCandidate` - single-step nearest class centroid

pub mod centroid;
pub mod distance;
pub mod knn;

pub use centroid::CentroidCandidate;
pub use distance::Distance;
pub use inctune_config::{CandidateParams, ModelKind};
use inctune_core::Candidate;
pub use knn::KnnCandidate;

/// Instantiate the candidate a config entry describes.
#[must_use]
pub fn build_candidate(params: &CandidateParams) -> Box<dyn Candidate> {
    match params.model {
        ModelKind::Knn => Box::new(KnnCandidate::from_params(params)),
        ModelKind::Centroid => Box::new(CentroidCandidate::from_params(params)),
    }
}
