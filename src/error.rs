//! Error-norm estimation for manufactured-solution studies.

use crate::allocators::DimAllocator;
use crate::element::ReferenceFiniteElement;
use crate::quadrature::simplex_quadrature;
use crate::space::DgSpace;
use crate::{Real, SmallDim};
use itertools::izip;
use nalgebra::{DefaultAllocator, DVector, OPoint, OVector};

/// Estimates the $L^2$ error $\|u_h - u\|_{L^2}$ of a DG solution against an
/// analytic solution, integrating with a rule of the given order.
pub fn estimate_dg_l2_error<T, D, F>(
    space: &DgSpace<T, D>,
    u_h: &DVector<T>,
    u_exact: F,
    quadrature_order: usize,
) -> eyre::Result<T>
where
    T: Real,
    D: SmallDim,
    F: Fn(&OPoint<T, D>) -> T,
    DefaultAllocator: DimAllocator<T, D>,
{
    assert_eq!(u_h.len(), space.num_dofs(), "solution vector length mismatch");
    let n = space.dofs_per_element();
    let mesh = space.mesh();
    let rule = simplex_quadrature::<T>(D::dim(), quadrature_order);
    let mut basis_values = vec![T::zero(); n];

    let mut result = T::zero();
    for element in 0..space.num_elements() {
        let geometry = mesh.element_geometry(element)?;
        let u_element = u_h.rows(element * n, n);
        for (&w, bary) in izip!(rule.weights(), rule.points()) {
            let mut coords = OVector::<T, D>::zeros();
            for k in 0..D::dim() {
                coords[k] = bary[k + 1];
            }
            let xi = OPoint::from(coords);
            space.element().populate_basis(&mut basis_values, &xi);
            let mut u_h_value = T::zero();
            for i in 0..n {
                u_h_value += u_element[i] * basis_values[i];
            }
            let x = mesh.map_element_reference_coords(element, &xi);
            let difference = u_h_value - u_exact(&x);
            result += w * geometry.volume * difference * difference;
        }
    }
    Ok(result.sqrt())
}
