use serde::{Deserialize, Serialize};

/// Labelled instances with dense `f64` features.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    features: Vec<Vec<f64>>,
    labels: Vec<usize>,
    num_classes: usize,
}

impl Dataset {
    /// Build a dataset, checking that every row has a label in range and the
    /// same width as the first row.
    pub fn new(
        features: Vec<Vec<f64>>,
        labels: Vec<usize>,
        num_classes: usize,
    ) -> Result<Self, DatasetError> {
        if features.len() != labels.len() {
            return Err(DatasetError::LengthMismatch {
                rows: features.len(),
                labels: labels.len(),
            });
        }
        if let Some(first) = features.first() {
            let width = first.len();
            if let Some(index) = features.iter().position(|row| row.len() != width) {
                return Err(DatasetError::Ragged {
                    index,
                    expected: width,
                    actual: features[index].len(),
                });
            }
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(DatasetError::LabelOutOfRange { label, num_classes });
        }
        Ok(Self {
            features,
            labels,
            num_classes,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Width of each feature row (0 for an empty dataset).
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn features(&self, index: usize) -> &[f64] {
        &self.features[index]
    }

    #[must_use]
    pub fn label(&self, index: usize) -> usize {
        self.labels[index]
    }

    #[must_use]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Iterate `(features, label)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&[f64], usize)> {
        self.features
            .iter()
            .map(Vec::as_slice)
            .zip(self.labels.iter().copied())
    }

    /// Count of instances per class.
    #[must_use]
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error("{rows} feature rows but {labels} labels")]
    LengthMismatch { rows: usize, labels: usize },
    #[error("row {index} has {actual} features, expected {expected}")]
    Ragged {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },
}
