//! Tensor containers for model weights.

use std::{
    iter::FromIterator,
    slice::{Iter, IterMut},
};

use derive_more::{From, Index, IndexMut, Into};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// The ordered weight tensors of a model.
///
/// The order and the shapes of the tensors are fixed by the model for the
/// lifetime of a run: every participant receives and returns a parameter
/// set with identical ordered shapes. The coordinator owns the global set
/// between rounds and hands out clones for dispatch.
#[derive(Debug, Clone, PartialEq, From, Index, IndexMut, Into, Serialize, Deserialize)]
pub struct ParameterSet(Vec<ArrayD<f32>>);

#[allow(clippy::len_without_is_empty)]
impl ParameterSet {
    /// Gets the number of tensors in this parameter set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Creates an iterator that yields references to the tensors of this set.
    pub fn iter(&self) -> Iter<ArrayD<f32>> {
        self.0.iter()
    }

    /// Creates an iterator that yields mutable references to the tensors of this set.
    pub fn iter_mut(&mut self) -> IterMut<ArrayD<f32>> {
        self.0.iter_mut()
    }

    /// Whether `other` has the same number of tensors with the same shapes.
    pub fn same_shapes(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(left, right)| left.shape() == right.shape())
    }
}

impl FromIterator<ArrayD<f32>> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = ArrayD<f32>>>(iter: I) -> Self {
        ParameterSet(iter.into_iter().collect())
    }
}

impl IntoIterator for ParameterSet {
    type Item = ArrayD<f32>;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn tensor(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::zeros(IxDyn(shape))
    }

    #[test]
    fn test_same_shapes() {
        let left = ParameterSet::from(vec![tensor(&[2, 3]), tensor(&[4])]);
        let right = ParameterSet::from(vec![tensor(&[2, 3]), tensor(&[4])]);
        assert!(left.same_shapes(&right));
    }

    #[test]
    fn test_diverging_shapes() {
        let left = ParameterSet::from(vec![tensor(&[2, 3]), tensor(&[4])]);
        let right = ParameterSet::from(vec![tensor(&[2, 3]), tensor(&[5])]);
        assert!(!left.same_shapes(&right));

        let shorter = ParameterSet::from(vec![tensor(&[2, 3])]);
        assert!(!left.same_shapes(&shorter));
    }
}
