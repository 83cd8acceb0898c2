//! A discontinuous Galerkin local operator for the convection-diffusion
//! equation.
//!
//! The operator discretizes
//!
//! $$ \nabla \cdot (-A(x) \nabla u + b(x) u) + c(x) u = f $$
//!
//! with Dirichlet (`u = g`), Neumann (`(b u - A \nabla u) . n = j`) and
//! outflow (`-(A \nabla u) . n = o`) boundary conditions, using the S(W)IPG
//! or N(W)IPG scheme. The weighted variant follows Ern, Stephansen & Zunino
//! (IMA J. Num. Analysis 29(2), 2009), extended to inhomogeneous boundary
//! conditions; upwinding of the convective flux is explicit rather than
//! folded into the penalty.
//!
//! Modeling assumptions honored throughout:
//! - the diffusion tensor `A` is constant per element and is evaluated once
//!   at the element (or face) center;
//! - the velocity field `b` is continuous across faces, so it is evaluated
//!   on the inside element only and a single upwind decision is made per
//!   quadrature point;
//! - the boundary condition type is constant per face;
//! - outflow boundary conditions belong on the outflow boundary. Setting
//!   `use_outflow_boundary_condition_and_its_flux_on_inflow` accepts them on
//!   inflow faces as well, using the same fluxes; the system gains mass this
//!   way, which is sometimes preferable to the non-mass-gaining homogeneous
//!   Neumann alternative.

use crate::allocators::DimAllocator;
use crate::assembly::buffers::{BasisFunctionBuffer, RuleCache};
use crate::assembly::edge_norm::EdgeNormProvider;
use crate::assembly::local::{FluxWeighting, PenaltyWeighting, SkeletonStats, SwipgWeighting};
use crate::element::ReferenceFiniteElement;
use crate::mesh::{embed_face_point, reference_simplex_center, Face, SimplexMesh};
use crate::problem::{BoundaryConditionType, ConvectionDiffusionProblem, Side};
use crate::space::DgSpace;
use crate::{Real, SmallDim};
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use itertools::izip;
use nalgebra::{
    DMatrixSliceMut, DVectorSlice, DVectorSliceMut, DefaultAllocator, Dynamic, MatrixSliceMut,
    OMatrix, OPoint, OVector,
};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;

/// The DG scheme variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DgScheme {
    /// Symmetric interior penalty (theta = -1).
    Sipg,
    /// Non-symmetric interior penalty (theta = +1).
    Nipg,
    /// Oden-Babuska-Baumann: non-symmetric with the penalty forced to zero.
    Obb,
}

impl DgScheme {
    /// The symmetrization parameter of the consistency term.
    pub fn theta<T: Real>(&self) -> T {
        match self {
            DgScheme::Sipg => -T::one(),
            DgScheme::Nipg | DgScheme::Obb => T::one(),
        }
    }
}

impl FromStr for DgScheme {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sipg" => Ok(DgScheme::Sipg),
            "nipg" => Ok(DgScheme::Nipg),
            "obb" => Ok(DgScheme::Obb),
            _ => Err(eyre::eyre!(
                "unknown DG scheme \"{s}\" (expected sipg/nipg/obb)"
            )),
        }
    }
}

/// Configuration of the DG operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de> + Real"))]
pub struct DgOperatorConfig<T> {
    pub scheme: DgScheme,
    pub weights: FluxWeighting,
    /// The interior penalty parameter `alpha`. Ignored (forced to zero) by
    /// the OBB scheme.
    pub penalty: T,
    pub use_outflow_boundary_condition_and_its_flux_on_inflow: bool,
    /// Additive increment of the quadrature order.
    pub intorder_add: usize,
    /// Multiplier of the basis order in the quadrature order.
    pub quadrature_factor: usize,
}

impl<T: Real> Default for DgOperatorConfig<T> {
    fn default() -> Self {
        Self {
            scheme: DgScheme::Nipg,
            weights: FluxWeighting::Off,
            penalty: T::zero(),
            use_outflow_boundary_condition_and_its_flux_on_inflow: false,
            intorder_add: 0,
            quadrature_factor: 2,
        }
    }
}

/// An outflow boundary condition was requested on a face where the velocity
/// field points inward.
#[derive(Debug, Error)]
#[error("outflow boundary condition on inflow (face {face}, normal flux {normal_flux:e})")]
pub struct OutflowOnInflowError {
    pub face: usize,
    pub normal_flux: f64,
}

/// A NaN appeared in an assembled Jacobian block.
///
/// Signals corrupted geometry or coefficients; the accompanying log output
/// carries the face geometry needed to diagnose it.
#[derive(Debug, Error)]
#[error("NaN in assembled {block} block of face {face} (test index {test_index}, trial index {trial_index})")]
pub struct NanEntryError {
    pub face: usize,
    pub block: &'static str,
    pub test_index: usize,
    pub trial_index: usize,
}

#[derive(Debug)]
struct DgKernelWorkspace<T: Real> {
    basis_inside: BasisFunctionBuffer<T>,
    basis_outside: BasisFunctionBuffer<T>,
    rules: RuleCache<T>,
}

impl<T: Real> Default for DgKernelWorkspace<T> {
    fn default() -> Self {
        Self {
            basis_inside: Default::default(),
            basis_outside: Default::default(),
            rules: Default::default(),
        }
    }
}

define_thread_local_workspace!(WORKSPACE);

/// The DG convection-diffusion local operator.
///
/// Produces per-element volume contributions, per-face skeleton and boundary
/// contributions and their exact Jacobians. All kernels *accumulate* into
/// the provided output slices; interior faces must be visited exactly once
/// in the mesh's stored inside/outside orientation.
#[derive(Debug)]
pub struct ConvectionDiffusionDgOperator<T, D, P, E, W = SwipgWeighting<T>>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    problem: P,
    edge_norm_provider: E,
    weighting: W,
    scheme: DgScheme,
    theta: T,
    use_outflow_on_inflow: bool,
    intorder_add: usize,
    quadrature_factor: usize,
    marker: PhantomData<D>,
}

impl<T, D, P, E> ConvectionDiffusionDgOperator<T, D, P, E, SwipgWeighting<T>>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Creates an operator with the standard S(W)IPG/N(W)IPG weighting.
    pub fn new(problem: P, edge_norm_provider: E, config: &DgOperatorConfig<T>) -> Self {
        let alpha = match config.scheme {
            DgScheme::Obb => T::zero(),
            _ => config.penalty,
        };
        Self::with_weighting(
            problem,
            edge_norm_provider,
            SwipgWeighting::new(alpha, config.weights),
            config,
        )
    }
}

impl<T, D, P, E, W> ConvectionDiffusionDgOperator<T, D, P, E, W>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Creates an operator with a custom penalty/weighting strategy.
    pub fn with_weighting(
        problem: P,
        edge_norm_provider: E,
        weighting: W,
        config: &DgOperatorConfig<T>,
    ) -> Self {
        Self {
            problem,
            edge_norm_provider,
            weighting,
            scheme: config.scheme,
            theta: config.scheme.theta(),
            use_outflow_on_inflow: config.use_outflow_boundary_condition_and_its_flux_on_inflow,
            intorder_add: config.intorder_add,
            quadrature_factor: config.quadrature_factor,
            marker: PhantomData,
        }
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn scheme(&self) -> DgScheme {
        self.scheme
    }

    pub fn theta(&self) -> T {
        self.theta
    }
}

impl<T, D, P, E, W> ConvectionDiffusionDgOperator<T, D, P, E, W>
where
    T: Real + num_traits::float::FloatCore,
    D: SmallDim,
    P: ConvectionDiffusionProblem<T, D>,
    E: EdgeNormProvider<T, D>,
    W: PenaltyWeighting<T>,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Forwards a new point in time to the problem coefficients.
    pub fn set_time(&mut self, t: T) {
        self.problem.set_time(t);
    }

    /// Accumulates the volume residual contribution
    /// `int (A grad u - b u) . grad phi_i + c u phi_i dx` of one element.
    pub fn volume_residual(
        &self,
        space: &DgSpace<T, D>,
        element: usize,
        u_element: DVectorSlice<T>,
        mut r: DVectorSliceMut<T>,
    ) -> eyre::Result<()> {
        let n = space.dofs_per_element();
        assert_eq!(u_element.len(), n, "solution slice length mismatch");
        assert_eq!(r.len(), n, "residual slice length mismatch");
        let mesh = space.mesh();
        let intorder = self.intorder_add + self.quadrature_factor * space.element_order(element);
        let geometry = mesh.element_geometry(element)?;

        // Diffusion tensor at the element center, constant per element.
        let center = mesh.map_element_reference_coords(element, &reference_simplex_center::<T, D>());
        let a = self.problem.diffusion(element, &center);

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                rules,
                ..
            } = ws;
            basis_inside.resize(n, D::dim());
            let rule = rules.rule(D::dim(), intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi = reference_point_from_barycentric::<T, D>(bary);
                space.element().populate_basis(basis_inside.values_mut(), &xi);
                space
                    .element()
                    .populate_basis_gradients(basis_inside.gradients_mut(), &xi);
                map_gradients_to_physical(&geometry.jacobian_inv_t, basis_inside.gradients_mut());
                let phi = basis_inside.values();
                let gradients = basis_inside.gradients::<D>();

                let mut u = T::zero();
                let mut grad_u = OVector::<T, D>::zeros();
                for i in 0..n {
                    u += u_element[i] * phi[i];
                    grad_u.axpy(u_element[i], &gradients.column(i), T::one());
                }
                let a_grad_u = &a * &grad_u;

                let x = mesh.map_element_reference_coords(element, &xi);
                let b = self.problem.velocity(element, &x);
                let c = self.problem.reaction(element, &x);

                let factor = w * geometry.volume;
                for i in 0..n {
                    let g_i = gradients.column(i);
                    r[i] += (a_grad_u.dot(&g_i) - u * b.dot(&g_i) + c * u * phi[i]) * factor;
                }
            }
            Ok(())
        })
    }

    /// Accumulates the exact Jacobian of [`Self::volume_residual`].
    pub fn volume_jacobian(
        &self,
        space: &DgSpace<T, D>,
        element: usize,
        mut mat: DMatrixSliceMut<T>,
    ) -> eyre::Result<()> {
        let n = space.dofs_per_element();
        assert_eq!(mat.nrows(), n, "Jacobian block dimension mismatch");
        assert_eq!(mat.ncols(), n, "Jacobian block dimension mismatch");
        let mesh = space.mesh();
        let intorder = self.intorder_add + self.quadrature_factor * space.element_order(element);
        let geometry = mesh.element_geometry(element)?;

        let center = mesh.map_element_reference_coords(element, &reference_simplex_center::<T, D>());
        let a = self.problem.diffusion(element, &center);

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                rules,
                ..
            } = ws;
            basis_inside.resize(n, D::dim());
            let rule = rules.rule(D::dim(), intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi = reference_point_from_barycentric::<T, D>(bary);
                space.element().populate_basis(basis_inside.values_mut(), &xi);
                space
                    .element()
                    .populate_basis_gradients(basis_inside.gradients_mut(), &xi);
                map_gradients_to_physical(&geometry.jacobian_inv_t, basis_inside.gradients_mut());
                let phi = basis_inside.values();
                let gradients = basis_inside.gradients::<D>();

                let x = mesh.map_element_reference_coords(element, &xi);
                let b = self.problem.velocity(element, &x);
                let c = self.problem.reaction(element, &x);

                let factor = w * geometry.volume;
                for j in 0..n {
                    let a_grad_phi_j = &a * &gradients.column(j);
                    for i in 0..n {
                        let g_i = gradients.column(i);
                        mat[(i, j)] += (a_grad_phi_j.dot(&g_i) - phi[j] * b.dot(&g_i)
                            + c * phi[j] * phi[i])
                            * factor;
                    }
                }
            }
            Ok(())
        })
    }

    /// Accumulates the skeleton residual contributions of one interior face
    /// onto both adjacent elements.
    ///
    /// Each interior face must be visited exactly once, with the mesh's
    /// stored inside/outside orientation.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn skeleton_residual(
        &self,
        space: &DgSpace<T, D>,
        face_index: usize,
        u_inside: DVectorSlice<T>,
        u_outside: DVectorSlice<T>,
        mut r_inside: DVectorSliceMut<T>,
        mut r_outside: DVectorSliceMut<T>,
        stats: &mut SkeletonStats<T>,
    ) -> eyre::Result<()> {
        let mesh = space.mesh();
        let face = mesh.face(face_index);
        let inside_element = face.inside();
        let (outside_element, _) = face
            .outside()
            .expect("skeleton kernel requires an interior face");
        let n = space.dofs_per_element();
        assert_eq!(u_inside.len(), n, "solution slice length mismatch");
        assert_eq!(u_outside.len(), n, "solution slice length mismatch");
        assert_eq!(r_inside.len(), n, "residual slice length mismatch");
        assert_eq!(r_outside.len(), n, "residual slice length mismatch");

        let degree = space
            .element_order(inside_element)
            .max(space.element_order(outside_element));
        let intorder = self.intorder_add + self.quadrature_factor * degree;

        let geometry_inside = mesh.element_geometry(inside_element)?;
        let geometry_outside = mesh.element_geometry(outside_element)?;
        let face_geometry = mesh.face_geometry(face_index)?;
        let normal = &face_geometry.normal;

        let center = face_center(mesh, face);
        let a_inside = self
            .problem
            .diffusion_on_face(face_index, Side::Inside, inside_element, &center);
        let a_outside =
            self.problem
                .diffusion_on_face(face_index, Side::Outside, outside_element, &center);
        let an_inside = &a_inside * normal;
        let an_outside = &a_outside * normal;

        let h_face = self
            .edge_norm_provider
            .edge_norm(mesh, face_index, false)?;
        stats.record(h_face);
        assert!(h_face > 1e-20, "degenerate face diameter");

        let weights = self.weighting.skeleton_weights(
            an_inside.dot(normal),
            an_outside.dot(normal),
            degree,
            D::dim(),
            h_face,
        );

        let coords_inside = mesh.face_vertex_coords_in_element(face_index, inside_element);
        let coords_outside = mesh.face_vertex_coords_in_element(face_index, outside_element);

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                basis_outside,
                rules,
            } = ws;
            basis_inside.resize(n, D::dim());
            basis_outside.resize(n, D::dim());
            let rule = rules.rule(D::dim() - 1, intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi_inside = embed_face_point(&coords_inside, bary);
                let xi_outside = embed_face_point(&coords_outside, bary);
                space
                    .element()
                    .populate_basis(basis_inside.values_mut(), &xi_inside);
                space
                    .element()
                    .populate_basis_gradients(basis_inside.gradients_mut(), &xi_inside);
                map_gradients_to_physical(
                    &geometry_inside.jacobian_inv_t,
                    basis_inside.gradients_mut(),
                );
                space
                    .element()
                    .populate_basis(basis_outside.values_mut(), &xi_outside);
                space
                    .element()
                    .populate_basis_gradients(basis_outside.gradients_mut(), &xi_outside);
                map_gradients_to_physical(
                    &geometry_outside.jacobian_inv_t,
                    basis_outside.gradients_mut(),
                );
                let phi_s = basis_inside.values();
                let gradients_s = basis_inside.gradients::<D>();
                let phi_n = basis_outside.values();
                let gradients_n = basis_outside.gradients::<D>();

                let mut u_s = T::zero();
                let mut u_n = T::zero();
                let mut grad_u_s = OVector::<T, D>::zeros();
                let mut grad_u_n = OVector::<T, D>::zeros();
                for i in 0..n {
                    u_s += u_inside[i] * phi_s[i];
                    u_n += u_outside[i] * phi_n[i];
                    grad_u_s.axpy(u_inside[i], &gradients_s.column(i), T::one());
                    grad_u_n.axpy(u_outside[i], &gradients_n.column(i), T::one());
                }

                // Velocity is assumed continuous across the face, so the
                // inside evaluation serves both sides.
                let x = mesh.map_element_reference_coords(inside_element, &xi_inside);
                let b = self.problem.velocity(inside_element, &x);
                let normal_flux = b.dot(normal);
                let (upwind_s, upwind_n) = if normal_flux >= T::zero() {
                    (1.0, 0.0)
                } else {
                    (0.0, 1.0)
                };

                let factor = w * face_geometry.measure;

                // convection term
                let term1 = (upwind_s * u_s + upwind_n * u_n) * normal_flux * factor;
                for i in 0..n {
                    r_inside[i] += term1 * phi_s[i];
                }
                for i in 0..n {
                    r_outside[i] -= term1 * phi_n[i];
                }

                // diffusion term
                let term2 = -(weights.omega_inside * an_inside.dot(&grad_u_s)
                    + weights.omega_outside * an_outside.dot(&grad_u_n))
                    * factor;
                for i in 0..n {
                    r_inside[i] += term2 * phi_s[i];
                }
                for i in 0..n {
                    r_outside[i] -= term2 * phi_n[i];
                }

                // (non-)symmetric consistency term
                let term3 = (u_s - u_n) * factor;
                for i in 0..n {
                    r_inside[i] += term3
                        * self.theta
                        * weights.omega_inside
                        * an_inside.dot(&gradients_s.column(i));
                }
                for i in 0..n {
                    r_outside[i] += term3
                        * self.theta
                        * weights.omega_outside
                        * an_outside.dot(&gradients_n.column(i));
                }

                // interior penalty term
                let term4 = weights.penalty_factor * (u_s - u_n) * factor;
                for i in 0..n {
                    r_inside[i] += term4 * phi_s[i];
                }
                for i in 0..n {
                    r_outside[i] -= term4 * phi_n[i];
                }
            }
            Ok(())
        })
    }

    /// Accumulates the exact Jacobian blocks of [`Self::skeleton_residual`]:
    /// inside-inside, inside-outside, outside-inside and outside-outside.
    ///
    /// Every accumulated entry is checked for NaN; a hit dumps the face
    /// geometry to the log and fails with [`NanEntryError`].
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn skeleton_jacobian(
        &self,
        space: &DgSpace<T, D>,
        face_index: usize,
        mut mat_ss: DMatrixSliceMut<T>,
        mut mat_sn: DMatrixSliceMut<T>,
        mut mat_ns: DMatrixSliceMut<T>,
        mut mat_nn: DMatrixSliceMut<T>,
        stats: &mut SkeletonStats<T>,
    ) -> eyre::Result<()> {
        let mesh = space.mesh();
        let face = mesh.face(face_index);
        let inside_element = face.inside();
        let (outside_element, _) = face
            .outside()
            .expect("skeleton kernel requires an interior face");
        let n = space.dofs_per_element();
        for mat in [&mat_ss, &mat_sn, &mat_ns, &mat_nn] {
            assert_eq!(mat.nrows(), n, "Jacobian block dimension mismatch");
            assert_eq!(mat.ncols(), n, "Jacobian block dimension mismatch");
        }

        let degree = space
            .element_order(inside_element)
            .max(space.element_order(outside_element));
        let intorder = self.intorder_add + self.quadrature_factor * degree;

        let geometry_inside = mesh.element_geometry(inside_element)?;
        let geometry_outside = mesh.element_geometry(outside_element)?;
        let face_geometry = mesh.face_geometry(face_index)?;
        let normal = &face_geometry.normal;

        let center = face_center(mesh, face);
        let a_inside = self
            .problem
            .diffusion_on_face(face_index, Side::Inside, inside_element, &center);
        let a_outside =
            self.problem
                .diffusion_on_face(face_index, Side::Outside, outside_element, &center);
        let an_inside = &a_inside * normal;
        let an_outside = &a_outside * normal;

        let h_face = self
            .edge_norm_provider
            .edge_norm(mesh, face_index, false)?;
        stats.record(h_face);
        assert!(h_face > 1e-20, "degenerate face diameter");

        let weights = self.weighting.skeleton_weights(
            an_inside.dot(normal),
            an_outside.dot(normal),
            degree,
            D::dim(),
            h_face,
        );

        let coords_inside = mesh.face_vertex_coords_in_element(face_index, inside_element);
        let coords_outside = mesh.face_vertex_coords_in_element(face_index, outside_element);

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                basis_outside,
                rules,
            } = ws;
            basis_inside.resize(n, D::dim());
            basis_outside.resize(n, D::dim());
            let rule = rules.rule(D::dim() - 1, intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi_inside = embed_face_point(&coords_inside, bary);
                let xi_outside = embed_face_point(&coords_outside, bary);
                space
                    .element()
                    .populate_basis(basis_inside.values_mut(), &xi_inside);
                space
                    .element()
                    .populate_basis_gradients(basis_inside.gradients_mut(), &xi_inside);
                map_gradients_to_physical(
                    &geometry_inside.jacobian_inv_t,
                    basis_inside.gradients_mut(),
                );
                space
                    .element()
                    .populate_basis(basis_outside.values_mut(), &xi_outside);
                space
                    .element()
                    .populate_basis_gradients(basis_outside.gradients_mut(), &xi_outside);
                map_gradients_to_physical(
                    &geometry_outside.jacobian_inv_t,
                    basis_outside.gradients_mut(),
                );
                let phi_s = basis_inside.values();
                let gradients_s = basis_inside.gradients::<D>();
                let phi_n = basis_outside.values();
                let gradients_n = basis_outside.gradients::<D>();

                let x = mesh.map_element_reference_coords(inside_element, &xi_inside);
                let b = self.problem.velocity(inside_element, &x);
                let normal_flux = b.dot(normal);
                let (upwind_s, upwind_n) = if normal_flux >= T::zero() {
                    (1.0, 0.0)
                } else {
                    (0.0, 1.0)
                };

                let factor = w * face_geometry.measure;
                let ip_factor = weights.penalty_factor * factor;
                let theta = self.theta;

                // All four terms per block, in the order convection,
                // diffusion, consistency, penalty.
                for j in 0..n {
                    let temp1 = -an_inside.dot(&gradients_s.column(j)) * weights.omega_inside * factor;
                    for i in 0..n {
                        mat_ss[(i, j)] += upwind_s * phi_s[j] * normal_flux * factor * phi_s[i]
                            + temp1 * phi_s[i]
                            + phi_s[j]
                                * factor
                                * theta
                                * weights.omega_inside
                                * an_inside.dot(&gradients_s.column(i))
                            + phi_s[j] * ip_factor * phi_s[i];
                        if mat_ss[(i, j)].is_nan() {
                            return Err(self
                                .nan_diagnostic(mesh, face_index, &face_geometry, &weights, "ss", i, j)
                                .into());
                        }
                    }
                }
                for j in 0..n {
                    let temp1 =
                        -an_outside.dot(&gradients_n.column(j)) * weights.omega_outside * factor;
                    for i in 0..n {
                        mat_sn[(i, j)] += upwind_n * phi_n[j] * normal_flux * factor * phi_s[i]
                            + temp1 * phi_s[i]
                            - phi_n[j]
                                * factor
                                * theta
                                * weights.omega_inside
                                * an_inside.dot(&gradients_s.column(i))
                            - phi_n[j] * ip_factor * phi_s[i];
                        if mat_sn[(i, j)].is_nan() {
                            return Err(self
                                .nan_diagnostic(mesh, face_index, &face_geometry, &weights, "sn", i, j)
                                .into());
                        }
                    }
                }
                for j in 0..n {
                    let temp1 = -an_inside.dot(&gradients_s.column(j)) * weights.omega_inside * factor;
                    for i in 0..n {
                        mat_ns[(i, j)] += -upwind_s * phi_s[j] * normal_flux * factor * phi_n[i]
                            - temp1 * phi_n[i]
                            + phi_s[j]
                                * factor
                                * theta
                                * weights.omega_outside
                                * an_outside.dot(&gradients_n.column(i))
                            - phi_s[j] * ip_factor * phi_n[i];
                        if mat_ns[(i, j)].is_nan() {
                            return Err(self
                                .nan_diagnostic(mesh, face_index, &face_geometry, &weights, "ns", i, j)
                                .into());
                        }
                    }
                }
                for j in 0..n {
                    let temp1 =
                        -an_outside.dot(&gradients_n.column(j)) * weights.omega_outside * factor;
                    for i in 0..n {
                        mat_nn[(i, j)] += -upwind_n * phi_n[j] * normal_flux * factor * phi_n[i]
                            - temp1 * phi_n[i]
                            - phi_n[j]
                                * factor
                                * theta
                                * weights.omega_outside
                                * an_outside.dot(&gradients_n.column(i))
                            + phi_n[j] * ip_factor * phi_n[i];
                        if mat_nn[(i, j)].is_nan() {
                            return Err(self
                                .nan_diagnostic(mesh, face_index, &face_geometry, &weights, "nn", i, j)
                                .into());
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Accumulates the boundary residual contribution of one boundary face,
    /// dispatching on the boundary condition type.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn boundary_residual(
        &self,
        space: &DgSpace<T, D>,
        face_index: usize,
        u_inside: DVectorSlice<T>,
        mut r_inside: DVectorSliceMut<T>,
        stats: &mut SkeletonStats<T>,
    ) -> eyre::Result<()> {
        let mesh = space.mesh();
        let face = mesh.face(face_index);
        assert!(
            face.is_boundary(),
            "boundary kernel requires a boundary face"
        );
        let inside_element = face.inside();
        let n = space.dofs_per_element();
        assert_eq!(u_inside.len(), n, "solution slice length mismatch");
        assert_eq!(r_inside.len(), n, "residual slice length mismatch");

        let degree = space.element_order(inside_element);
        let intorder = self.intorder_add + self.quadrature_factor * degree;

        let geometry_inside = mesh.element_geometry(inside_element)?;
        let face_geometry = mesh.face_geometry(face_index)?;
        let normal = &face_geometry.normal;

        let center = face_center(mesh, face);
        let a_inside = self
            .problem
            .diffusion_on_face(face_index, Side::Inside, inside_element, &center);
        let an_inside = &a_inside * normal;

        // The boundary condition type is constant per face; query it once at
        // the face center.
        let bctype = self.problem.boundary_condition_type(face_index, &center);

        let h_face = self.edge_norm_provider.edge_norm(mesh, face_index, true)?;
        stats.record(h_face);
        assert!(h_face > 1e-20, "degenerate face diameter");

        let penalty_factor =
            self.weighting
                .boundary_penalty(an_inside.dot(normal), degree, D::dim(), h_face);

        let coords_inside = mesh.face_vertex_coords_in_element(face_index, inside_element);

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                rules,
                ..
            } = ws;
            basis_inside.resize(n, D::dim());
            let rule = rules.rule(D::dim() - 1, intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi_inside = embed_face_point(&coords_inside, bary);
                space
                    .element()
                    .populate_basis(basis_inside.values_mut(), &xi_inside);
                let x = mesh.map_element_reference_coords(inside_element, &xi_inside);
                let factor = w * face_geometry.measure;

                if bctype == BoundaryConditionType::Neumann {
                    let j = self.problem.neumann(face_index, &x);
                    let phi_s = basis_inside.values();
                    for i in 0..n {
                        r_inside[i] += j * phi_s[i] * factor;
                    }
                    continue;
                }

                let b = self.problem.velocity(inside_element, &x);
                let normal_flux = b.dot(normal);

                if bctype == BoundaryConditionType::Outflow {
                    if normal_flux < -1e-30 && !self.use_outflow_on_inflow {
                        return Err(OutflowOnInflowError {
                            face: face_index,
                            normal_flux: normal_flux.to_subset().unwrap_or(f64::NAN),
                        }
                        .into());
                    }
                    let phi_s = basis_inside.values();
                    let mut u_s = T::zero();
                    for i in 0..n {
                        u_s += u_inside[i] * phi_s[i];
                    }
                    let term1 = u_s * normal_flux * factor;
                    let o = self.problem.outflow(face_index, &x);
                    for i in 0..n {
                        r_inside[i] += (term1 + o * factor) * phi_s[i];
                    }
                    continue;
                }

                // Dirichlet: the full convection + diffusion + consistency +
                // penalty form with the prescribed value g in place of the
                // outside solution.
                space
                    .element()
                    .populate_basis_gradients(basis_inside.gradients_mut(), &xi_inside);
                map_gradients_to_physical(
                    &geometry_inside.jacobian_inv_t,
                    basis_inside.gradients_mut(),
                );
                let phi_s = basis_inside.values();
                let gradients_s = basis_inside.gradients::<D>();

                let mut u_s = T::zero();
                let mut grad_u_s = OVector::<T, D>::zeros();
                for i in 0..n {
                    u_s += u_inside[i] * phi_s[i];
                    grad_u_s.axpy(u_inside[i], &gradients_s.column(i), T::one());
                }

                let g = self.problem.dirichlet(face_index, &x);
                let (upwind_s, upwind_n) = if normal_flux >= T::zero() {
                    (1.0, 0.0)
                } else {
                    (0.0, 1.0)
                };

                let term1 = (upwind_s * u_s + upwind_n * g) * normal_flux * factor;
                let term2 = an_inside.dot(&grad_u_s) * factor;
                let term3 = (u_s - g) * factor;
                let term4 = penalty_factor * (u_s - g) * factor;
                for i in 0..n {
                    r_inside[i] += term1 * phi_s[i] - term2 * phi_s[i]
                        + term3 * self.theta * an_inside.dot(&gradients_s.column(i))
                        + term4 * phi_s[i];
                }
            }
            Ok(())
        })
    }

    /// Accumulates the exact Jacobian of [`Self::boundary_residual`].
    ///
    /// Neumann faces contribute nothing and return immediately.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn boundary_jacobian(
        &self,
        space: &DgSpace<T, D>,
        face_index: usize,
        mut mat_ss: DMatrixSliceMut<T>,
        stats: &mut SkeletonStats<T>,
    ) -> eyre::Result<()> {
        let mesh = space.mesh();
        let face = mesh.face(face_index);
        assert!(
            face.is_boundary(),
            "boundary kernel requires a boundary face"
        );
        let inside_element = face.inside();
        let n = space.dofs_per_element();
        assert_eq!(mat_ss.nrows(), n, "Jacobian block dimension mismatch");
        assert_eq!(mat_ss.ncols(), n, "Jacobian block dimension mismatch");

        let degree = space.element_order(inside_element);
        let intorder = self.intorder_add + self.quadrature_factor * degree;

        let geometry_inside = mesh.element_geometry(inside_element)?;
        let face_geometry = mesh.face_geometry(face_index)?;
        let normal = &face_geometry.normal;

        let center = face_center(mesh, face);
        let a_inside = self
            .problem
            .diffusion_on_face(face_index, Side::Inside, inside_element, &center);
        let an_inside = &a_inside * normal;

        let bctype = self.problem.boundary_condition_type(face_index, &center);
        if bctype == BoundaryConditionType::Neumann {
            return Ok(());
        }

        let h_face = self.edge_norm_provider.edge_norm(mesh, face_index, true)?;
        stats.record(h_face);
        assert!(h_face > 1e-20, "degenerate face diameter");

        let penalty_factor =
            self.weighting
                .boundary_penalty(an_inside.dot(normal), degree, D::dim(), h_face);

        let coords_inside = mesh.face_vertex_coords_in_element(face_index, inside_element);

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                rules,
                ..
            } = ws;
            basis_inside.resize(n, D::dim());
            let rule = rules.rule(D::dim() - 1, intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi_inside = embed_face_point(&coords_inside, bary);
                space
                    .element()
                    .populate_basis(basis_inside.values_mut(), &xi_inside);
                let x = mesh.map_element_reference_coords(inside_element, &xi_inside);
                let factor = w * face_geometry.measure;

                let b = self.problem.velocity(inside_element, &x);
                let normal_flux = b.dot(normal);

                if bctype == BoundaryConditionType::Outflow {
                    if normal_flux < -1e-30 && !self.use_outflow_on_inflow {
                        return Err(OutflowOnInflowError {
                            face: face_index,
                            normal_flux: normal_flux.to_subset().unwrap_or(f64::NAN),
                        }
                        .into());
                    }
                    let phi_s = basis_inside.values();
                    for j in 0..n {
                        for i in 0..n {
                            mat_ss[(i, j)] += phi_s[j] * normal_flux * factor * phi_s[i];
                        }
                    }
                    continue;
                }

                // Dirichlet
                space
                    .element()
                    .populate_basis_gradients(basis_inside.gradients_mut(), &xi_inside);
                map_gradients_to_physical(
                    &geometry_inside.jacobian_inv_t,
                    basis_inside.gradients_mut(),
                );
                let phi_s = basis_inside.values();
                let gradients_s = basis_inside.gradients::<D>();

                let upwind_s = if normal_flux >= T::zero() { 1.0 } else { 0.0 };

                for j in 0..n {
                    let a_grad_phi_j = an_inside.dot(&gradients_s.column(j));
                    for i in 0..n {
                        mat_ss[(i, j)] += upwind_s * phi_s[j] * normal_flux * factor * phi_s[i]
                            - a_grad_phi_j * factor * phi_s[i]
                            + phi_s[j]
                                * factor
                                * self.theta
                                * an_inside.dot(&gradients_s.column(i))
                            + penalty_factor * phi_s[j] * phi_s[i] * factor;
                    }
                }
            }
            Ok(())
        })
    }

    /// Accumulates the source contribution `-int f phi_i dx` of one element.
    pub fn source_residual(
        &self,
        space: &DgSpace<T, D>,
        element: usize,
        mut r: DVectorSliceMut<T>,
    ) -> eyre::Result<()> {
        let n = space.dofs_per_element();
        assert_eq!(r.len(), n, "residual slice length mismatch");
        let mesh = space.mesh();
        let intorder = self.intorder_add + 2 * space.element_order(element);
        let geometry = mesh.element_geometry(element)?;

        with_thread_local_workspace(&WORKSPACE, |ws: &mut DgKernelWorkspace<T>| {
            let DgKernelWorkspace {
                basis_inside,
                rules,
                ..
            } = ws;
            basis_inside.resize(n, D::dim());
            let rule = rules.rule(D::dim(), intorder);

            for (&w, bary) in izip!(rule.weights(), rule.points()) {
                let xi = reference_point_from_barycentric::<T, D>(bary);
                space.element().populate_basis(basis_inside.values_mut(), &xi);
                let phi = basis_inside.values();
                let x = mesh.map_element_reference_coords(element, &xi);
                let f = self.problem.source(element, &x);
                let factor = w * geometry.volume;
                for i in 0..n {
                    r[i] += -f * phi[i] * factor;
                }
            }
            Ok(())
        })
    }

    /// Logs the face geometry a NaN was encountered on and builds the
    /// corresponding error.
    fn nan_diagnostic(
        &self,
        mesh: &SimplexMesh<T, D>,
        face_index: usize,
        face_geometry: &crate::mesh::FaceGeometry<T, D>,
        weights: &crate::assembly::local::FaceWeights<T>,
        block: &'static str,
        test_index: usize,
        trial_index: usize,
    ) -> NanEntryError {
        let face = mesh.face(face_index);
        let corners: Vec<_> = face
            .vertices()
            .iter()
            .map(|&v| mesh.vertices()[v].clone())
            .collect();
        let mut min_corner_distance: Option<T> = None;
        let mut max_corner_distance: Option<T> = None;
        for i in 0..corners.len() {
            for j in (i + 1)..corners.len() {
                let distance = (&corners[i] - &corners[j]).norm();
                min_corner_distance =
                    Some(min_corner_distance.map_or(distance, |m| nalgebra::RealField::min(m, distance)));
                max_corner_distance =
                    Some(max_corner_distance.map_or(distance, |m| nalgebra::RealField::max(m, distance)));
            }
        }
        log::error!(
            "NaN found in {block} block of face {face_index}: corners {corners:?}, \
             normal {:?}, measure {:?}, penalty factor {:?}, \
             corner distances [{min_corner_distance:?}, {max_corner_distance:?}]",
            face_geometry.normal,
            face_geometry.measure,
            weights.penalty_factor,
        );
        NanEntryError {
            face: face_index,
            block,
            test_index,
            trial_index,
        }
    }
}

/// Maps an element's reference basis gradients to physical gradients in
/// place.
fn map_gradients_to_physical<T, D>(
    jacobian_inv_t: &OMatrix<T, D, D>,
    mut gradients: MatrixSliceMut<T, D, Dynamic>,
) where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    for mut column in gradients.column_iter_mut() {
        let mapped = jacobian_inv_t * &column;
        column.copy_from(&mapped);
    }
}

/// Drops the leading barycentric coordinate, producing reference simplex
/// coordinates.
fn reference_point_from_barycentric<T, D>(barycentric: &[T]) -> OPoint<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    debug_assert_eq!(barycentric.len(), D::dim() + 1);
    let mut coords = OVector::<T, D>::zeros();
    for k in 0..D::dim() {
        coords[k] = barycentric[k + 1];
    }
    OPoint::from(coords)
}

/// Physical center of a face.
fn face_center<T, D>(mesh: &SimplexMesh<T, D>, face: &Face) -> OPoint<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    let mut center = OVector::<T, D>::zeros();
    for &v in face.vertices() {
        center += &mesh.vertices()[v].coords;
    }
    OPoint::from(center / T::from_usize(face.vertices().len()).expect("count must fit in T"))
}
