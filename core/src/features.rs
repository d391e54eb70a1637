/// Feature tensor provider.
///
/// Φ is a dense `[event, class, feature]` array materialized once from a
/// sparse `(event, class) -> (feature ids, feature values)` map. Lookups are
/// plain slices into the flat buffer; the tensor is immutable after
/// construction.

use std::collections::HashMap;

use crate::error::{LearnerError, Result};

/// Sparse feature vector for one (event, class) pair.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseFeatures {
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseFeatures {
    pub fn new(indices: Vec<usize>, values: Vec<f64>) -> Self {
        SparseFeatures { indices, values }
    }
}

/// Dense feature tensor Φ. Layout: `data[(event * C + class) * D + feature]`.
#[derive(Clone, Debug)]
pub struct FeatureTensor {
    num_events: usize,
    num_classes: usize,
    feature_dim: usize,
    data: Vec<f64>,
}

impl FeatureTensor {
    /// Materialize Φ from a sparse map.
    ///
    /// Fails with `Config` if an event/class id is out of range, a feature
    /// index is `>= feature_dim`, index and value lists differ in length, or a
    /// value is not finite. Repeated indices within one entry accumulate.
    pub fn from_sparse(
        num_events: usize,
        num_classes: usize,
        feature_dim: usize,
        entries: &HashMap<(usize, usize), SparseFeatures>,
    ) -> Result<Self> {
        if num_classes == 0 || feature_dim == 0 {
            return Err(LearnerError::Config(format!(
                "feature tensor needs at least one class and one feature (classes={num_classes}, features={feature_dim})"
            )));
        }
        let mut data = vec![0.0f64; num_events * num_classes * feature_dim];

        for (&(event, class), feats) in entries {
            if event >= num_events {
                return Err(LearnerError::Config(format!(
                    "event id {event} out of range (num_events={num_events})"
                )));
            }
            if class >= num_classes {
                return Err(LearnerError::Config(format!(
                    "class id {class} out of range (num_classes={num_classes})"
                )));
            }
            if feats.indices.len() != feats.values.len() {
                return Err(LearnerError::Config(format!(
                    "event {event} class {class}: {} feature ids but {} values",
                    feats.indices.len(),
                    feats.values.len()
                )));
            }
            let base = (event * num_classes + class) * feature_dim;
            for (&idx, &val) in feats.indices.iter().zip(&feats.values) {
                if idx >= feature_dim {
                    return Err(LearnerError::Config(format!(
                        "event {event} class {class}: feature index {idx} exceeds dimension {feature_dim}"
                    )));
                }
                if !val.is_finite() {
                    return Err(LearnerError::Config(format!(
                        "event {event} class {class}: non-finite value for feature {idx}"
                    )));
                }
                data[base + idx] += val;
            }
        }

        Ok(FeatureTensor { num_events, num_classes, feature_dim, data })
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Φ_x: the `[classes, features]` slice for one event.
    pub fn slice(&self, event: usize) -> &[f64] {
        debug_assert!(event < self.num_events);
        let n = self.num_classes * self.feature_dim;
        &self.data[event * n..(event + 1) * n]
    }

    /// Φ_x,c: the feature vector of one (event, class) pair.
    pub fn vector(&self, event: usize, class: usize) -> &[f64] {
        debug_assert!(event < self.num_events);
        debug_assert!(class < self.num_classes);
        let base = (event * self.num_classes + class) * self.feature_dim;
        &self.data[base..base + self.feature_dim]
    }

    /// Number of non-zero entries (diagnostics only).
    pub fn nnz(&self) -> usize {
        self.data.iter().filter(|v| **v != 0.0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> HashMap<(usize, usize), SparseFeatures> {
        let mut m = HashMap::new();
        m.insert((0, 0), SparseFeatures::new(vec![0, 2], vec![1.0, 0.5]));
        m.insert((0, 1), SparseFeatures::new(vec![1], vec![2.0]));
        m.insert((1, 1), SparseFeatures::new(vec![3, 3], vec![1.0, 1.0]));
        m
    }

    #[test]
    fn test_dense_layout() {
        let phi = FeatureTensor::from_sparse(2, 2, 4, &small_map()).unwrap();
        assert_eq!(phi.vector(0, 0), &[1.0, 0.0, 0.5, 0.0]);
        assert_eq!(phi.vector(0, 1), &[0.0, 2.0, 0.0, 0.0]);
        assert_eq!(phi.vector(1, 0), &[0.0; 4]);
        // repeated index accumulates
        assert_eq!(phi.vector(1, 1), &[0.0, 0.0, 0.0, 2.0]);
        assert_eq!(phi.slice(0).len(), 8);
        assert_eq!(&phi.slice(0)[4..], phi.vector(0, 1));
        assert_eq!(phi.nnz(), 4);
    }

    #[test]
    fn test_feature_index_out_of_range() {
        let mut m = small_map();
        m.insert((1, 0), SparseFeatures::new(vec![4], vec![1.0]));
        let err = FeatureTensor::from_sparse(2, 2, 4, &m).unwrap_err();
        assert!(matches!(err, LearnerError::Config(_)));
        assert!(err.to_string().contains("exceeds dimension 4"));
    }

    #[test]
    fn test_event_and_class_out_of_range() {
        let mut m = HashMap::new();
        m.insert((2, 0), SparseFeatures::new(vec![0], vec![1.0]));
        assert!(matches!(FeatureTensor::from_sparse(2, 2, 4, &m), Err(LearnerError::Config(_))));

        let mut m = HashMap::new();
        m.insert((0, 5), SparseFeatures::new(vec![0], vec![1.0]));
        assert!(matches!(FeatureTensor::from_sparse(2, 2, 4, &m), Err(LearnerError::Config(_))));
    }

    #[test]
    fn test_length_mismatch_and_non_finite() {
        let mut m = HashMap::new();
        m.insert((0, 0), SparseFeatures::new(vec![0, 1], vec![1.0]));
        assert!(matches!(FeatureTensor::from_sparse(1, 1, 4, &m), Err(LearnerError::Config(_))));

        let mut m = HashMap::new();
        m.insert((0, 0), SparseFeatures::new(vec![0], vec![f64::NAN]));
        assert!(matches!(FeatureTensor::from_sparse(1, 1, 4, &m), Err(LearnerError::Config(_))));
    }

    #[test]
    fn test_zero_dims_rejected() {
        let m = HashMap::new();
        assert!(FeatureTensor::from_sparse(1, 0, 4, &m).is_err());
        assert!(FeatureTensor::from_sparse(1, 2, 0, &m).is_err());
    }
}
