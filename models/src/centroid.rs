//! Nearest class centroid, trained in a single step.

use inctune_config::CandidateParams;
use inctune_core::{Candidate, CandidateError, CandidateSettings, Dataset};
use serde::{Deserialize, Serialize};

use crate::distance::Distance;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CentroidState {
    /// Mean row per class; `None` for classes absent from the training data.
    centroids: Vec<Option<Vec<f64>>>,
    score: f64,
}

#[derive(Debug, Clone)]
pub struct CentroidCandidate {
    name: String,
    distance: Distance,
    settings: CandidateSettings,
    state: CentroidState,
}

impl CentroidCandidate {
    #[must_use]
    pub fn new(name: impl Into<String>, distance: Distance) -> Self {
        Self {
            name: name.into(),
            distance,
            settings: CandidateSettings::default(),
            state: CentroidState::default(),
        }
    }

    #[must_use]
    pub fn from_params(params: &CandidateParams) -> Self {
        Self::new(params.name.clone(), Distance::from_params(params))
    }

    fn distances(&self, instance: &[f64]) -> Vec<Option<f64>> {
        self.state
            .centroids
            .iter()
            .map(|c| c.as_ref().map(|c| self.distance.measure(instance, c)))
            .collect()
    }

    fn nearest(&self, instance: &[f64]) -> Option<usize> {
        self.distances(instance)
            .into_iter()
            .enumerate()
            .filter_map(|(class, d)| d.map(|d| (class, d)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(class, _)| class)
    }
}

impl Candidate for CentroidCandidate {
    fn name(&self) -> &str {
        &self.name
    }

    fn train(&mut self, data: &Dataset) -> Result<(), CandidateError> {
        if data.is_empty() {
            return Err(CandidateError::Invalid(format!(
                "{}: cannot train on an empty dataset",
                self.name
            )));
        }
        let width = data.num_features();
        let mut sums = vec![vec![0.0; width]; data.num_classes()];
        let counts = data.class_counts();
        for (row, label) in data.iter() {
            for (sum, x) in sums[label].iter_mut().zip(row) {
                *sum += x;
            }
        }
        self.state.centroids = sums
            .into_iter()
            .zip(&counts)
            .map(|(sum, &count)| {
                (count > 0).then(|| sum.into_iter().map(|s| s / count as f64).collect())
            })
            .collect();

        let correct = data
            .iter()
            .filter(|(row, label)| self.nearest(row) == Some(*label))
            .count();
        self.state.score = correct as f64 / data.len() as f64;
        if self.settings.debug {
            tracing::debug!("{}: training accuracy {:.4}", self.name, self.state.score);
        }
        Ok(())
    }

    /// Inverse-distance weights over the class centroids.
    fn distribution(&self, instance: &[f64]) -> Result<Vec<f64>, CandidateError> {
        let Some(width) = self.state.centroids.iter().flatten().map(Vec::len).next() else {
            return Err(CandidateError::NotTrained(self.name.clone()));
        };
        if width != instance.len() {
            return Err(CandidateError::DimensionMismatch {
                expected: width,
                actual: instance.len(),
            });
        }
        let distances = self.distances(instance);
        if let Some(exact) = distances.iter().position(|d| *d == Some(0.0)) {
            let mut dist = vec![0.0; distances.len()];
            dist[exact] = 1.0;
            return Ok(dist);
        }
        let mut dist: Vec<f64> = distances
            .into_iter()
            .map(|d| d.map_or(0.0, |d| 1.0 / d))
            .collect();
        let total: f64 = dist.iter().sum();
        if total > 0.0 {
            dist.iter_mut().for_each(|p| *p /= total);
        }
        Ok(dist)
    }

    fn score(&self) -> f64 {
        self.state.score
    }

    fn is_fully_trained(&self) -> bool {
        !self.state.centroids.is_empty()
    }

    fn configure(&mut self, settings: &CandidateSettings) {
        self.settings = *settings;
    }

    fn snapshot(&self) -> Result<serde_json::Value, CandidateError> {
        serde_json::to_value(&self.state).map_err(|e| CandidateError::state(&self.name, e))
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<(), CandidateError> {
        self.state =
            serde_json::from_value(state).map_err(|e| CandidateError::state(&self.name, e))?;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Candidate> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use inctune_core::test_utils::tiny_dataset;

    use super::*;

    #[test]
    fn test_single_step() {
        let data = tiny_dataset();
        let mut centroid = CentroidCandidate::new("c", Distance::Euclidean);
        assert!(!centroid.is_fully_trained());
        centroid.train(&data).unwrap();
        assert!(centroid.is_fully_trained());
        assert!((centroid.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_distribution_prefers_near_class() {
        let data = tiny_dataset();
        let mut centroid = CentroidCandidate::new("c", Distance::Euclidean);
        centroid.train(&data).unwrap();
        let dist = centroid.distribution(&[4.5, 4.5]).unwrap();
        assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(dist[1] > dist[0]);
    }

    #[test]
    fn test_restore_round_trip() {
        let data = tiny_dataset();
        let mut a = CentroidCandidate::new("c", Distance::Euclidean);
        a.train(&data).unwrap();
        let mut b = CentroidCandidate::new("c", Distance::Euclidean);
        b.restore(a.snapshot().unwrap()).unwrap();
        assert!(b.is_fully_trained());
        assert_eq!(
            a.distribution(&[1.0, 1.0]).unwrap(),
            b.distribution(&[1.0, 1.0]).unwrap()
        );
    }
}
