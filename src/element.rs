//! Reference finite elements for discontinuous Galerkin spaces.

use crate::allocators::DimAllocator;
use crate::{Real, SmallDim};
use eyre::eyre;
use nalgebra::{DefaultAllocator, Dynamic, MatrixSliceMut, OPoint, OVector};

/// A finite element defined on the reference simplex.
///
/// Basis functions and their gradients are evaluated at reference
/// coordinates; gradients are with respect to the reference coordinates and
/// must be mapped with the transposed inverse Jacobian of the element
/// geometry to obtain physical gradients.
pub trait ReferenceFiniteElement<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// The number of basis functions of this element.
    fn num_basis(&self) -> usize;

    /// The polynomial order of this element's basis.
    fn order(&self) -> usize;

    /// Evaluates all basis functions at the given reference coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `out.len() != self.num_basis()`.
    fn populate_basis(&self, out: &mut [T], xi: &OPoint<T, D>);

    /// Evaluates all basis function gradients (with respect to reference
    /// coordinates) at the given reference coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `out.ncols() != self.num_basis()`.
    fn populate_basis_gradients(&self, out: MatrixSliceMut<T, D, Dynamic>, xi: &OPoint<T, D>);
}

/// A Lagrange element of degree one or two on the reference `D`-simplex.
///
/// Degree-one elements carry one node per vertex; degree-two elements add
/// one node per edge midpoint. Both are expressed in barycentric
/// coordinates, which keeps the formulas dimension-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagrangeSimplexElement<D> {
    degree: usize,
    marker: std::marker::PhantomData<D>,
}

impl<D: SmallDim> LagrangeSimplexElement<D> {
    /// Creates a Lagrange simplex element of the given polynomial degree.
    ///
    /// Only degrees one and two are supported; anything else is a
    /// configuration error.
    pub fn new(degree: usize) -> eyre::Result<Self> {
        if degree == 0 || degree > 2 {
            return Err(eyre!(
                "unsupported Lagrange simplex degree {degree} (supported: 1, 2)"
            ));
        }
        Ok(Self {
            degree,
            marker: std::marker::PhantomData,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Edges of the reference simplex as vertex index pairs, in the order
    /// used for the degree-two midpoint nodes.
    fn edges() -> impl Iterator<Item = (usize, usize)> {
        let num_vertices = D::dim() + 1;
        (0..num_vertices).flat_map(move |i| ((i + 1)..num_vertices).map(move |j| (i, j)))
    }
}

/// Barycentric coordinates of `xi` with respect to the reference simplex.
fn barycentric<T, D>(xi: &OPoint<T, D>) -> Vec<T>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    let mut lambda = Vec::with_capacity(D::dim() + 1);
    let mut lambda_0 = T::one();
    for k in 0..D::dim() {
        lambda_0 -= xi[k];
    }
    lambda.push(lambda_0);
    for k in 0..D::dim() {
        lambda.push(xi[k]);
    }
    lambda
}

/// Reference gradient of the `k`-th barycentric coordinate.
pub(crate) fn barycentric_gradient<T, D>(k: usize) -> OVector<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    if k == 0 {
        OVector::<T, D>::repeat(-T::one())
    } else {
        let mut g = OVector::<T, D>::zeros();
        g[k - 1] = T::one();
        g
    }
}

impl<T, D> ReferenceFiniteElement<T, D> for LagrangeSimplexElement<D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn num_basis(&self) -> usize {
        let num_vertices = D::dim() + 1;
        match self.degree {
            1 => num_vertices,
            2 => num_vertices + num_vertices * (num_vertices - 1) / 2,
            _ => unreachable!("constructor rejects unsupported degrees"),
        }
    }

    fn order(&self) -> usize {
        self.degree
    }

    fn populate_basis(&self, out: &mut [T], xi: &OPoint<T, D>) {
        assert_eq!(out.len(), self.num_basis(), "basis buffer length mismatch");
        let lambda = barycentric(xi);
        let num_vertices = D::dim() + 1;
        match self.degree {
            1 => out.copy_from_slice(&lambda),
            2 => {
                let two = T::one() + T::one();
                let four = two + two;
                for k in 0..num_vertices {
                    out[k] = lambda[k] * (two * lambda[k] - T::one());
                }
                for (e, (i, j)) in Self::edges().enumerate() {
                    out[num_vertices + e] = four * lambda[i] * lambda[j];
                }
            }
            _ => unreachable!("constructor rejects unsupported degrees"),
        }
    }

    fn populate_basis_gradients(&self, mut out: MatrixSliceMut<T, D, Dynamic>, xi: &OPoint<T, D>) {
        assert_eq!(
            out.ncols(),
            self.num_basis(),
            "basis gradient buffer column mismatch"
        );
        let lambda = barycentric(xi);
        let num_vertices = D::dim() + 1;
        match self.degree {
            1 => {
                for k in 0..num_vertices {
                    out.column_mut(k).copy_from(&barycentric_gradient::<T, D>(k));
                }
            }
            2 => {
                let two = T::one() + T::one();
                let four = two + two;
                for k in 0..num_vertices {
                    let g = barycentric_gradient::<T, D>(k) * (four * lambda[k] - T::one());
                    out.column_mut(k).copy_from(&g);
                }
                for (e, (i, j)) in Self::edges().enumerate() {
                    let g = barycentric_gradient::<T, D>(i) * (four * lambda[j])
                        + barycentric_gradient::<T, D>(j) * (four * lambda[i]);
                    out.column_mut(num_vertices + e).copy_from(&g);
                }
            }
            _ => unreachable!("constructor rejects unsupported degrees"),
        }
    }
}
