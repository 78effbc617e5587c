//! Distance measures between feature rows.

use inctune_config::{CandidateParams, DistanceKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Distance {
    /// Squared Euclidean distance.
    Euclidean,
    /// Dynamic time warping. `window` bounds `|i - j|`; `None` is unconstrained.
    Dtw { window: Option<usize> },
}

impl Distance {
    #[must_use]
    pub fn from_params(params: &CandidateParams) -> Self {
        match params.distance {
            DistanceKind::Euclidean => Self::Euclidean,
            DistanceKind::Dtw => Self::Dtw {
                window: usize::try_from(params.window).ok(),
            },
        }
    }

    #[must_use]
    pub fn measure(&self, a: &[f64], b: &[f64]) -> f64 {
        match *self {
            Self::Euclidean => squared_euclidean(a, b),
            Self::Dtw { window } => dtw(a, b, window),
        }
    }
}

fn squared_euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// DTW over squared pointwise cost, two rolling rows.
fn dtw(a: &[f64], b: &[f64], window: Option<usize>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return if a.len() == b.len() { 0.0 } else { f64::INFINITY };
    }
    // the window must at least reach the end cell
    let window = window
        .unwrap_or(a.len().max(b.len()))
        .max(a.len().abs_diff(b.len()));

    let mut prev = vec![f64::INFINITY; b.len()];
    let mut curr = vec![f64::INFINITY; b.len()];
    for (i, x) in a.iter().enumerate() {
        curr.fill(f64::INFINITY);
        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(b.len());
        for j in start..end {
            let cost = (x - b[j]) * (x - b[j]);
            let best = if i == 0 && j == 0 {
                0.0
            } else {
                let left = if j > 0 { curr[j - 1] } else { f64::INFINITY };
                let up = if i > 0 { prev[j] } else { f64::INFINITY };
                let diag = if i > 0 && j > 0 {
                    prev[j - 1]
                } else {
                    f64::INFINITY
                };
                left.min(up).min(diag)
            };
            curr[j] = best + cost;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len() - 1]
}
