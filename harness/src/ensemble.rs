//! Ensemble weighting strategies.

use inctune_config::EnsemblerKind;
use inctune_core::Candidate;
use rand::{RngExt, rngs::StdRng};

/// Turns the final candidates into combination weights.
///
/// The returned vector has one non-negative weight per candidate, in the same
/// order, summing to one.
pub trait Ensembler: Send {
    fn weight_votes(&self, candidates: &[Box<dyn Candidate>]) -> Result<Vec<f64>, EnsembleError>;
}

type Scorer = Box<dyn Fn(&dyn Candidate) -> f64 + Send + Sync>;

/// Weight proportional to score.
///
/// Negative and non-finite scores count as zero. When every score is zero the
/// weights are uniform.
#[derive(Default)]
pub struct ByScore {
    scorer: Option<Scorer>,
}

impl ByScore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Score candidates with `scorer` instead of `Candidate::score`.
    #[must_use]
    pub fn with_scorer(scorer: impl Fn(&dyn Candidate) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            scorer: Some(Box::new(scorer)),
        }
    }
}

impl Ensembler for ByScore {
    fn weight_votes(&self, candidates: &[Box<dyn Candidate>]) -> Result<Vec<f64>, EnsembleError> {
        if candidates.is_empty() {
            return Err(EnsembleError::InvalidArgument(
                "by-score needs at least one candidate".to_string(),
            ));
        }
        let scores: Vec<f64> = candidates
            .iter()
            .map(|c| match &self.scorer {
                Some(scorer) => scorer(c.as_ref()),
                None => c.score(),
            })
            .collect();
        Ok(normalise(&scores))
    }
}

/// Exactly one candidate with weight 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct Single;

impl Ensembler for Single {
    fn weight_votes(&self, candidates: &[Box<dyn Candidate>]) -> Result<Vec<f64>, EnsembleError> {
        if candidates.len() == 1 {
            Ok(vec![1.0])
        } else {
            Err(EnsembleError::InvalidArgument(format!(
                "single ensembler given {} candidates, expected 1",
                candidates.len()
            )))
        }
    }
}

#[must_use]
pub fn build_ensembler(kind: EnsemblerKind) -> Box<dyn Ensembler> {
    match kind {
        EnsemblerKind::ByScore => Box::new(ByScore::new()),
        EnsemblerKind::Single => Box::new(Single),
    }
}

/// Clamp to non-negative finite values and scale to sum to one.
#[must_use]
pub fn normalise(values: &[f64]) -> Vec<f64> {
    let clamped: Vec<f64> = values
        .iter()
        .map(|&v| if v.is_finite() && v > 0.0 { v } else { 0.0 })
        .collect();
    let total: f64 = clamped.iter().sum();
    if total > 0.0 && total.is_finite() {
        clamped.into_iter().map(|v| v / total).collect()
    } else {
        vec![1.0 / values.len() as f64; values.len()]
    }
}

/// Index of the largest value, ties broken uniformly with `rng`.
pub fn arg_max(values: &[f64], rng: &mut StdRng) -> Option<usize> {
    let best = values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    let ties: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v == best)
        .map(|(i, _)| i)
        .collect();
    match ties.len() {
        0 => None,
        1 => Some(ties[0]),
        n => Some(ties[rng.random_range(0..n)]),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnsembleError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use inctune_core::test_utils::ScriptedCandidate;
    use rand::SeedableRng;

    use super::*;

    fn candidates(scores: &[f64]) -> Vec<Box<dyn Candidate>> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| Box::new(ScriptedCandidate::new(format!("c{i}"), s)) as Box<dyn Candidate>)
            .collect()
    }

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-9, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_by_score_proportional() {
        let weights = ByScore::new()
            .weight_votes(&candidates(&[0.9, 0.6, 0.3]))
            .unwrap();
        assert_close(&weights, &[0.5, 1.0 / 3.0, 1.0 / 6.0]);
    }

    #[test]
    fn test_by_score_always_a_distribution() {
        let cases: &[&[f64]] = &[
            &[0.0, 0.0],
            &[-1.0, 2.0, 0.0],
            &[f64::NAN, 1.0],
            &[f64::INFINITY, 1.0],
            &[-3.0],
            &[1e-300, 1e-300, 1e-300],
        ];
        for scores in cases {
            let weights = ByScore::new().weight_votes(&candidates(scores)).unwrap();
            assert_eq!(weights.len(), scores.len());
            assert!(weights.iter().all(|w| *w >= 0.0));
            assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9, "{scores:?}");
        }
    }

    #[test]
    fn test_by_score_custom_scorer() {
        let ensembler = ByScore::with_scorer(|c| if c.name() == "c0" { 3.0 } else { 1.0 });
        let weights = ensembler.weight_votes(&candidates(&[0.1, 0.9])).unwrap();
        assert_close(&weights, &[0.75, 0.25]);
    }

    #[test]
    fn test_by_score_empty_fails() {
        assert!(ByScore::new().weight_votes(&[]).is_err());
    }

    #[test]
    fn test_single_needs_exactly_one() {
        assert!(matches!(
            Single.weight_votes(&[]),
            Err(EnsembleError::InvalidArgument(_))
        ));
        assert!(Single.weight_votes(&candidates(&[0.2, 0.4])).is_err());
        assert_eq!(Single.weight_votes(&candidates(&[0.2])).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_arg_max_breaks_ties_reproducibly() {
        let values = [0.4, 0.4, 0.2];
        let picks = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32)
                .map(|_| arg_max(&values, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        let a = picks(5);
        assert_eq!(a, picks(5));
        assert!(a.iter().all(|&i| i < 2));
        assert!(a.contains(&0) && a.contains(&1));

        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(arg_max(&[0.1, 0.7, 0.2], &mut rng), Some(1));
        assert_eq!(arg_max(&[], &mut rng), None);
    }
}
