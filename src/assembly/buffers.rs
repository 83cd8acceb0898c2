//! Reusable buffers for intermediate assembly data.

use crate::quadrature::{simplex_quadrature, SimplexRule};
use crate::Real;
use nalgebra::{DMatrix, DimName, Dynamic, MatrixSlice, MatrixSliceMut, Scalar};
use rustc_hash::FxHashMap;

/// Buffer for basis function values and reference gradients on one element.
#[derive(Debug)]
pub struct BasisFunctionBuffer<T: Scalar> {
    values: Vec<T>,
    gradients: DMatrix<T>,
}

impl<T: Real> Default for BasisFunctionBuffer<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            gradients: DMatrix::zeros(0, 0),
        }
    }
}

impl<T: Real> BasisFunctionBuffer<T> {
    pub fn resize(&mut self, basis_count: usize, reference_dim: usize) {
        self.values.resize(basis_count, T::zero());
        self.gradients
            .resize_mut(reference_dim, basis_count, T::zero());
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn gradients<D: DimName>(&self) -> MatrixSlice<T, D, Dynamic> {
        MatrixSlice::from(&self.gradients)
    }

    pub fn gradients_mut<D: DimName>(&mut self) -> MatrixSliceMut<T, D, Dynamic> {
        MatrixSliceMut::from(&mut self.gradients)
    }
}

/// Memoizes simplex quadrature rules by `(simplex_dim, order)`.
///
/// Stands in for a global rule registry; held in thread-local workspaces so
/// each assembly thread has its own cache.
#[derive(Debug)]
pub struct RuleCache<T: Real> {
    rules: FxHashMap<(usize, usize), SimplexRule<T>>,
}

impl<T: Real> Default for RuleCache<T> {
    fn default() -> Self {
        Self {
            rules: FxHashMap::default(),
        }
    }
}

impl<T: Real> RuleCache<T> {
    pub fn rule(&mut self, simplex_dim: usize, order: usize) -> &SimplexRule<T> {
        self.rules
            .entry((simplex_dim, order))
            .or_insert_with(|| simplex_quadrature(simplex_dim, order))
    }
}
