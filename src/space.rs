//! Discontinuous Galerkin function spaces.

use crate::allocators::DimAllocator;
use crate::element::{LagrangeSimplexElement, ReferenceFiniteElement};
use crate::mesh::SimplexMesh;
use crate::{Real, SmallDim};
use nalgebra::DefaultAllocator;
use std::sync::Arc;

/// A scalar discontinuous Galerkin function space over a simplex mesh.
///
/// Basis functions are discontinuous across element boundaries, so every
/// element owns a dense, contiguous block of degrees of freedom:
/// `global_dof(element, i) = element * dofs_per_element + i`. Jumps across
/// faces are penalized by the DG operator, not constrained by the space.
#[derive(Debug, Clone)]
pub struct DgSpace<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    mesh: Arc<SimplexMesh<T, D>>,
    element: LagrangeSimplexElement<D>,
}

impl<T, D> DgSpace<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    pub fn new(mesh: Arc<SimplexMesh<T, D>>, element: LagrangeSimplexElement<D>) -> Self {
        Self { mesh, element }
    }

    pub fn mesh(&self) -> &SimplexMesh<T, D> {
        &self.mesh
    }

    pub fn element(&self) -> &LagrangeSimplexElement<D> {
        &self.element
    }

    pub fn num_elements(&self) -> usize {
        self.mesh.num_elements()
    }

    pub fn dofs_per_element(&self) -> usize {
        ReferenceFiniteElement::<T, D>::num_basis(&self.element)
    }

    pub fn num_dofs(&self) -> usize {
        self.num_elements() * self.dofs_per_element()
    }

    /// The polynomial order of the basis attached to the given element.
    ///
    /// The space currently attaches the same element everywhere, but the
    /// skeleton kernels query both sides and work with the maximum, so a
    /// mixed-order space only requires a richer space type.
    pub fn element_order(&self, _element: usize) -> usize {
        ReferenceFiniteElement::<T, D>::order(&self.element)
    }

    pub fn global_dof(&self, element: usize, local: usize) -> usize {
        debug_assert!(local < self.dofs_per_element());
        element * self.dofs_per_element() + local
    }
}
