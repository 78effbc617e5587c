//! Seeded synthetic class blobs.
//!
//! Each class gets a random centre in `[-5, 5)^dims`; instances are the centre
//! plus uniform noise in `[-spread, spread)` per dimension. Labels are assigned
//! round-robin so every class is represented when `instances >= classes`.

use inctune_config::DataParams;
use rand::{RngExt, SeedableRng, rngs::StdRng};

use crate::{Dataset, DatasetError};

/// Generate a dataset from `params`. The same params always give the same data.
pub fn blobs(params: &DataParams) -> Result<Dataset, DatasetError> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let classes = params.classes.max(1);

    let centres: Vec<Vec<f64>> = (0..classes)
        .map(|_| {
            (0..params.dims)
                .map(|_| rng.random_range(-5.0..5.0))
                .collect()
        })
        .collect();

    let spread = params.spread.abs();
    let mut features = Vec::with_capacity(params.instances);
    let mut labels = Vec::with_capacity(params.instances);
    for i in 0..params.instances {
        let label = i % classes;
        let row = centres[label]
            .iter()
            .map(|c| {
                if spread > 0.0 {
                    c + rng.random_range(-spread..spread)
                } else {
                    *c
                }
            })
            .collect();
        features.push(row);
        labels.push(label);
    }

    Dataset::new(features, labels, classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blobs_deterministic() {
        let params = DataParams {
            instances: 30,
            classes: 3,
            dims: 4,
            spread: 0.5,
            seed: 7,
        };
        let a = blobs(&params).unwrap();
        let b = blobs(&params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 30);
        assert_eq!(a.num_features(), 4);
        assert_eq!(a.class_counts(), vec![10, 10, 10]);
    }

    #[test]
    fn test_blobs_seed_changes_data() {
        let mut params = DataParams::default();
        let a = blobs(&params).unwrap();
        params.seed = 1;
        let b = blobs(&params).unwrap();
        assert_ne!(a, b);
    }
}
