//! Progressive leave-one-out k-nearest-neighbour.
//!
//! Training instances are admitted to the neighbour pool a few at a time, in a
//! seeded order. Every admission updates each training instance's k nearest
//! admitted neighbours (itself excluded), so the leave-one-out accuracy is
//! available after every step and improves as the pool grows.

use std::{
    mem::size_of,
    time::{Duration, Instant},
};

use inctune_config::CandidateParams;
use inctune_core::{
    Candidate, CandidateError, CandidateSettings, Dataset, SelfMemoryTracked, SelfTimed,
    TimeContractable,
};
use inctune_data::seeded_permutation;
use serde::{Deserialize, Serialize};

use crate::distance::Distance;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Neighbour {
    distance: f64,
    label: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnnState {
    /// Admission order over training indices.
    order: Vec<usize>,
    admitted: usize,
    /// k nearest admitted neighbours of each training instance, nearest first.
    nearest: Vec<Vec<Neighbour>>,
    /// Admitted rows kept for prediction.
    pool: Vec<(Vec<f64>, usize)>,
    num_classes: usize,
    score: f64,
    train_nanos: u64,
    longest_admit_nanos: u64,
    /// Largest heap footprint of this state seen after a step.
    #[serde(default)]
    peak_bytes: u64,
}

impl KnnState {
    /// Heap bytes held by the neighbour lists and the pool.
    fn heap_bytes(&self) -> u64 {
        let order = self.order.capacity() * size_of::<usize>();
        let nearest: usize = self
            .nearest
            .iter()
            .map(|n| size_of::<Vec<Neighbour>>() + n.capacity() * size_of::<Neighbour>())
            .sum();
        let pool: usize = self
            .pool
            .iter()
            .map(|(row, _)| size_of::<(Vec<f64>, usize)>() + row.capacity() * size_of::<f64>())
            .sum();
        u64::try_from(order + nearest + pool).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct KnnCandidate {
    name: String,
    k: usize,
    step: usize,
    neighbour_limit: Option<usize>,
    distance: Distance,
    settings: CandidateSettings,
    time_limit: Option<Duration>,
    state: KnnState,
}

impl KnnCandidate {
    #[must_use]
    pub fn new(name: impl Into<String>, distance: Distance) -> Self {
        Self {
            name: name.into(),
            k: 1,
            step: 0,
            neighbour_limit: None,
            distance,
            settings: CandidateSettings::default(),
            time_limit: None,
            state: KnnState::default(),
        }
    }

    #[must_use]
    pub fn from_params(params: &CandidateParams) -> Self {
        Self::new(params.name.clone(), Distance::from_params(params))
            .with_k(params.k)
            .with_step(params.step)
            .with_neighbour_limit(params.neighbour_limit)
    }

    #[must_use]
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Neighbours admitted per `train` call; 0 admits all remaining.
    #[must_use]
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    #[must_use]
    pub fn with_neighbour_limit(mut self, limit: Option<usize>) -> Self {
        self.neighbour_limit = limit;
        self
    }

    #[must_use]
    pub fn neighbour_count(&self) -> usize {
        self.state.admitted
    }

    fn is_initialised(&self) -> bool {
        !self.state.order.is_empty()
    }

    fn target(&self) -> usize {
        let n = self.state.order.len();
        self.neighbour_limit.map_or(n, |limit| limit.min(n))
    }

    fn quota(&self) -> usize {
        let remaining = self.target().saturating_sub(self.state.admitted);
        if self.step == 0 {
            remaining
        } else {
            self.step.min(remaining)
        }
    }

    fn initialise(&mut self, data: &Dataset) {
        self.state = KnnState {
            order: seeded_permutation(data.len(), self.settings.seed),
            nearest: vec![Vec::with_capacity(self.k); data.len()],
            num_classes: data.num_classes(),
            ..KnnState::default()
        };
    }

    fn admit(&mut self, data: &Dataset) {
        let index = self.state.order[self.state.admitted];
        let row = data.features(index);
        let label = data.label(index);
        for (other, nearest) in self.state.nearest.iter_mut().enumerate() {
            if other == index {
                continue;
            }
            let distance = self.distance.measure(data.features(other), row);
            insert_nearest(nearest, Neighbour { distance, label }, self.k);
        }
        self.state.pool.push((row.to_vec(), label));
        self.state.admitted += 1;
        if self.settings.log {
            tracing::debug!(
                "{}: admitted neighbour {} ({}/{})",
                self.name,
                index,
                self.state.admitted,
                self.target()
            );
        }
    }

    fn loocv_accuracy(&self, data: &Dataset) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let correct = self
            .state
            .nearest
            .iter()
            .zip(data.labels())
            .filter(|(nearest, label)| {
                vote(nearest.iter().copied(), self.state.num_classes)
                    .is_some_and(|predicted| predicted == **label)
            })
            .count();
        correct as f64 / data.len() as f64
    }
}

/// Keep `nearest` sorted and at most `k` long.
fn insert_nearest(nearest: &mut Vec<Neighbour>, candidate: Neighbour, k: usize) {
    if nearest.len() == k
        && nearest
            .last()
            .is_some_and(|worst| worst.distance <= candidate.distance)
    {
        return;
    }
    let at = nearest.partition_point(|n| n.distance <= candidate.distance);
    nearest.insert(at, candidate);
    nearest.truncate(k);
}

fn vote_counts(neighbours: impl Iterator<Item = Neighbour>, num_classes: usize) -> Vec<f64> {
    let mut counts = vec![0.0; num_classes];
    for n in neighbours {
        if let Some(count) = counts.get_mut(n.label) {
            *count += 1.0;
        }
    }
    counts
}

/// Majority label; the lowest label wins a tie. `None` without neighbours.
fn vote(neighbours: impl Iterator<Item = Neighbour>, num_classes: usize) -> Option<usize> {
    let counts = vote_counts(neighbours, num_classes);
    let best = counts.iter().copied().fold(0.0, f64::max);
    if best == 0.0 {
        return None;
    }
    counts.iter().position(|&c| c == best)
}

impl Candidate for KnnCandidate {
    fn name(&self) -> &str {
        &self.name
    }

    fn train(&mut self, data: &Dataset) -> Result<(), CandidateError> {
        let start = Instant::now();
        if data.is_empty() {
            return Err(CandidateError::Invalid(format!(
                "{}: cannot train on an empty dataset",
                self.name
            )));
        }
        if !self.is_initialised() {
            self.initialise(data);
        } else if self.state.order.len() != data.len() {
            return Err(CandidateError::Invalid(format!(
                "{}: resumed with {} instances, trained on {}",
                self.name,
                data.len(),
                self.state.order.len()
            )));
        }

        let quota = self.quota();
        let mut admitted = 0;
        while admitted < quota {
            // always make progress, then respect the contract
            if admitted > 0
                && let Some(limit) = self.time_limit
                && start.elapsed() >= limit
            {
                break;
            }
            let tick = Instant::now();
            self.admit(data);
            let nanos = u64::try_from(tick.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.state.longest_admit_nanos = self.state.longest_admit_nanos.max(nanos);
            admitted += 1;
        }

        self.state.score = self.loocv_accuracy(data);
        self.state.peak_bytes = self.state.peak_bytes.max(self.state.heap_bytes());
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.state.train_nanos = self.state.train_nanos.saturating_add(nanos);
        if self.settings.debug {
            tracing::debug!(
                "{}: {} neighbours, loocv accuracy {:.4}",
                self.name,
                self.state.admitted,
                self.state.score
            );
        }
        Ok(())
    }

    fn distribution(&self, instance: &[f64]) -> Result<Vec<f64>, CandidateError> {
        let Some((first, _)) = self.state.pool.first() else {
            return Err(CandidateError::NotTrained(self.name.clone()));
        };
        if first.len() != instance.len() {
            return Err(CandidateError::DimensionMismatch {
                expected: first.len(),
                actual: instance.len(),
            });
        }
        let mut nearest = Vec::with_capacity(self.k);
        for (row, label) in &self.state.pool {
            let distance = self.distance.measure(instance, row);
            insert_nearest(
                &mut nearest,
                Neighbour {
                    distance,
                    label: *label,
                },
                self.k,
            );
        }
        let mut dist = vote_counts(nearest.into_iter(), self.state.num_classes);
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
        self.is_initialised() && self.state.admitted >= self.target()
    }

    fn predict_next_step_cost(&self) -> Option<Duration> {
        if !self.is_initialised() || self.state.longest_admit_nanos == 0 {
            return None;
        }
        let per_admit = Duration::from_nanos(self.state.longest_admit_nanos);
        Some(per_admit * u32::try_from(self.quota()).unwrap_or(u32::MAX))
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

    fn self_timed(&self) -> Option<&dyn SelfTimed> {
        Some(self)
    }

    fn time_contractable(&mut self) -> Option<&mut dyn TimeContractable> {
        Some(self)
    }

    fn self_memory_tracked(&self) -> Option<&dyn SelfMemoryTracked> {
        Some(self)
    }
}

impl SelfTimed for KnnCandidate {
    fn train_time(&self) -> Duration {
        Duration::from_nanos(self.state.train_nanos)
    }
}

impl SelfMemoryTracked for KnnCandidate {
    fn peak_memory_bytes(&self) -> u64 {
        self.state.peak_bytes
    }
}

impl TimeContractable for KnnCandidate {
    fn set_train_time_limit(&mut self, limit: Option<Duration>) {
        self.time_limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use inctune_config::{DataParams, DistanceKind, ModelKind};
    use inctune_core::test_utils::tiny_dataset;
    use inctune_data::blobs;

    use super::*;

    #[test]
    fn test_progressive_steps() {
        let data = tiny_dataset();
        let mut knn = KnnCandidate::new("knn", Distance::Euclidean).with_step(2);
        assert!(!knn.is_fully_trained());
        assert!(knn.predict_next_step_cost().is_none());

        knn.train(&data).unwrap();
        assert_eq!(knn.neighbour_count(), 2);
        assert!(!knn.is_fully_trained());
        assert!(knn.predict_next_step_cost().is_some());

        knn.train(&data).unwrap();
        knn.train(&data).unwrap();
        assert_eq!(knn.neighbour_count(), 6);
        assert!(knn.is_fully_trained());
        assert!((knn.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_neighbour_limit() {
        let data = tiny_dataset();
        let mut knn = KnnCandidate::new("knn", Distance::Euclidean)
            .with_step(1)
            .with_neighbour_limit(Some(3));
        for _ in 0..3 {
            knn.train(&data).unwrap();
        }
        assert!(knn.is_fully_trained());
        knn.train(&data).unwrap();
        assert_eq!(knn.neighbour_count(), 3);
    }

    #[test]
    fn test_distribution_after_training() {
        let data = tiny_dataset();
        let mut knn = KnnCandidate::new("knn", Distance::Euclidean).with_k(3);
        knn.train(&data).unwrap();
        let dist = knn.distribution(&[0.1, 0.1]).unwrap();
        assert_eq!(dist.len(), 2);
        assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(dist[0] > dist[1]);
        assert!(matches!(
            knn.distribution(&[0.1]),
            Err(CandidateError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_untrained_distribution_fails() {
        let knn = KnnCandidate::new("knn", Distance::Euclidean);
        assert!(matches!(
            knn.distribution(&[0.0, 0.0]),
            Err(CandidateError::NotTrained(_))
        ));
    }

    #[test]
    fn test_snapshot_resumes_progress() {
        let data = tiny_dataset();
        let mut a = KnnCandidate::new("knn", Distance::Euclidean).with_step(2);
        a.train(&data).unwrap();

        let mut b = KnnCandidate::new("knn", Distance::Euclidean).with_step(2);
        b.restore(a.snapshot().unwrap()).unwrap();
        assert_eq!(b.neighbour_count(), 2);
        assert_eq!(b.train_time(), a.train_time());
        b.train(&data).unwrap();
        assert_eq!(b.neighbour_count(), 4);
    }

    #[test]
    fn test_peak_memory_grows_with_pool() {
        let data = tiny_dataset();
        let mut knn = KnnCandidate::new("knn", Distance::Euclidean).with_step(2);
        assert_eq!(knn.peak_memory_bytes(), 0);

        knn.train(&data).unwrap();
        let after_one = knn.peak_memory_bytes();
        // two pooled rows of two features at least
        assert!(after_one >= 2 * 2 * size_of::<f64>() as u64);

        knn.train(&data).unwrap();
        assert!(knn.peak_memory_bytes() > after_one);
        assert_eq!(
            knn.self_memory_tracked().map(|m| m.peak_memory_bytes()),
            Some(knn.peak_memory_bytes())
        );

        let mut resumed = KnnCandidate::new("knn", Distance::Euclidean).with_step(2);
        resumed.restore(knn.snapshot().unwrap()).unwrap();
        assert_eq!(resumed.peak_memory_bytes(), knn.peak_memory_bytes());
    }

    #[test]
    fn test_resume_with_other_data_fails() {
        let data = tiny_dataset();
        let mut knn = KnnCandidate::new("knn", Distance::Euclidean).with_step(1);
        knn.train(&data).unwrap();
        let other = blobs(&DataParams::default()).unwrap();
        assert!(matches!(knn.train(&other), Err(CandidateError::Invalid(_))));
    }

    #[test]
    fn test_time_contract_still_progresses() {
        let data = tiny_dataset();
        let mut knn = KnnCandidate::new("knn", Distance::Euclidean);
        knn.set_train_time_limit(Some(Duration::ZERO));
        knn.train(&data).unwrap();
        assert_eq!(knn.neighbour_count(), 1);
    }

    #[test]
    fn test_seed_changes_order() {
        let data = blobs(&DataParams::default()).unwrap();
        let mut a = KnnCandidate::new("a", Distance::Euclidean).with_step(1);
        let mut b = KnnCandidate::new("b", Distance::Euclidean).with_step(1);
        b.configure(&CandidateSettings {
            seed: 99,
            ..CandidateSettings::default()
        });
        a.train(&data).unwrap();
        b.train(&data).unwrap();
        assert_ne!(a.state.order, b.state.order);
    }

    #[test]
    fn test_from_params_dtw() {
        let mut params = CandidateParams::new("dtw", ModelKind::Knn);
        params.distance = DistanceKind::Dtw;
        params.window = 1;
        params.k = 3;
        params.step = 4;
        let knn = KnnCandidate::from_params(&params);
        assert_eq!(knn.distance, Distance::Dtw { window: Some(1) });
        assert_eq!(knn.k, 3);
        assert_eq!(knn.step, 4);
    }
}
