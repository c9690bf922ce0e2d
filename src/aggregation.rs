//! Weighted averaging of parameter sets and scalars.
//!
//! These routines are pure: they hold no state and perform no I/O. The
//! coordinator calls them with the sample counts of the successful
//! participants as weights.

use ndarray::ArrayD;
use thiserror::Error;

use crate::model::ParameterSet;

/// An error that makes an aggregation call unable to produce a result.
#[derive(Error, Debug, PartialEq)]
pub enum AggregationError {
    #[error("nothing to aggregate")]
    Empty,

    #[error("{sets} parameter sets but {weights} weights")]
    WeightCountMismatch { sets: usize, weights: usize },

    #[error("parameter set {set} has {actual} tensors, expected {expected}")]
    TensorCountMismatch {
        set: usize,
        expected: usize,
        actual: usize,
    },

    #[error("tensor {index} of parameter set {set} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        set: usize,
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("the total weight is zero")]
    ZeroWeight,
}

/// Computes the weighted elementwise mean of the given parameter sets.
///
/// Tensor `i` of the result is the mean of tensor `i` across all sets,
/// each set contributing proportionally to its weight. All sets must
/// share the tensor count and shapes of the first one; mismatches are an
/// error, never coerced.
pub fn weighted_average(
    sets: &[ParameterSet],
    weights: &[u64],
) -> Result<ParameterSet, AggregationError> {
    let reference = sets.first().ok_or(AggregationError::Empty)?;
    if sets.len() != weights.len() {
        return Err(AggregationError::WeightCountMismatch {
            sets: sets.len(),
            weights: weights.len(),
        });
    }
    for (position, set) in sets.iter().enumerate().skip(1) {
        check_shapes(reference, set, position)?;
    }

    let total: u64 = weights.iter().sum();
    if total == 0 {
        return Err(AggregationError::ZeroWeight);
    }
    let total = total as f32;

    let mut accumulated: Vec<ArrayD<f32>> = reference
        .iter()
        .map(|tensor| ArrayD::zeros(tensor.raw_dim()))
        .collect();
    for (set, &weight) in sets.iter().zip(weights) {
        for (sum, tensor) in accumulated.iter_mut().zip(set.iter()) {
            sum.scaled_add(weight as f32, tensor);
        }
    }
    for sum in accumulated.iter_mut() {
        *sum /= total;
    }

    Ok(accumulated.into_iter().collect())
}

/// Computes `sum(weight * value) / sum(weight)` over the given pairs.
pub fn weighted_scalar_average(pairs: &[(u64, f64)]) -> Result<f64, AggregationError> {
    if pairs.is_empty() {
        return Err(AggregationError::Empty);
    }
    let total: u64 = pairs.iter().map(|(weight, _)| *weight).sum();
    if total == 0 {
        return Err(AggregationError::ZeroWeight);
    }
    let sum: f64 = pairs
        .iter()
        .map(|(weight, value)| *weight as f64 * value)
        .sum();
    Ok(sum / total as f64)
}

fn check_shapes(
    reference: &ParameterSet,
    set: &ParameterSet,
    position: usize,
) -> Result<(), AggregationError> {
    if set.len() != reference.len() {
        return Err(AggregationError::TensorCountMismatch {
            set: position,
            expected: reference.len(),
            actual: set.len(),
        });
    }
    for (index, (expected, actual)) in reference.iter().zip(set.iter()).enumerate() {
        if expected.shape() != actual.shape() {
            return Err(AggregationError::ShapeMismatch {
                set: position,
                index,
                expected: expected.shape().to_vec(),
                actual: actual.shape().to_vec(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn set(values: &[f32]) -> ParameterSet {
        vec![ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()].into()
    }

    #[test]
    fn test_identical_sets_are_a_fixed_point() {
        let sets = vec![set(&[1.0, -2.0, 0.5]); 3];
        let averaged = weighted_average(&sets, &[1, 7, 42]).unwrap();
        assert_eq!(averaged, sets[0]);
    }

    #[test]
    fn test_weight_rescaling_is_irrelevant() {
        let sets = vec![set(&[1.0, 0.0]), set(&[3.0, 8.0])];
        let averaged = weighted_average(&sets, &[1, 3]).unwrap();
        let rescaled = weighted_average(&sets, &[10, 30]).unwrap();
        assert_eq!(averaged, rescaled);
    }

    #[test]
    fn test_weighted_average() {
        let sets = vec![set(&[1.0]), set(&[3.0])];
        let averaged = weighted_average(&sets, &[1, 3]).unwrap();
        assert_eq!(averaged, set(&[2.5]));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(weighted_average(&[], &[]), Err(AggregationError::Empty));
        assert_eq!(weighted_scalar_average(&[]), Err(AggregationError::Empty));
    }

    #[test]
    fn test_weight_count_mismatch() {
        let sets = vec![set(&[1.0]), set(&[2.0])];
        assert_eq!(
            weighted_average(&sets, &[1]),
            Err(AggregationError::WeightCountMismatch { sets: 2, weights: 1 })
        );
    }

    #[test]
    fn test_shape_mismatch() {
        let sets = vec![set(&[1.0, 2.0]), set(&[1.0])];
        assert_eq!(
            weighted_average(&sets, &[1, 1]),
            Err(AggregationError::ShapeMismatch {
                set: 1,
                index: 0,
                expected: vec![2],
                actual: vec![1],
            })
        );
    }

    #[test]
    fn test_tensor_count_mismatch() {
        let two_tensors = ParameterSet::from(vec![
            ArrayD::zeros(IxDyn(&[1])),
            ArrayD::zeros(IxDyn(&[1])),
        ]);
        let sets = vec![set(&[1.0]), two_tensors];
        assert_eq!(
            weighted_average(&sets, &[1, 1]),
            Err(AggregationError::TensorCountMismatch {
                set: 1,
                expected: 1,
                actual: 2,
            })
        );
    }

    #[test]
    fn test_zero_weight() {
        let sets = vec![set(&[1.0]), set(&[2.0])];
        assert_eq!(
            weighted_average(&sets, &[0, 0]),
            Err(AggregationError::ZeroWeight)
        );
        assert_eq!(
            weighted_scalar_average(&[(0, 1.0)]),
            Err(AggregationError::ZeroWeight)
        );
    }

    #[test]
    fn test_weighted_scalar_average() {
        let loss = weighted_scalar_average(&[(10, 2.0), (30, 4.0)]).unwrap();
        assert!((loss - 3.5).abs() < f64::EPSILON);
    }
}
