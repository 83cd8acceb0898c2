use crate::unit_tests::{
    assemble_and_solve, interpolate_p1, sipg_poisson_operator, unit_square_p1_space,
};
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use neurofem::assembly::edge_norm::FaceDiameterEdgeNorm;
use neurofem::assembly::global::CsrDgAssembler;
use neurofem::assembly::local::{
    ConvectionDiffusionDgOperator, DgOperatorConfig, DgScheme, FluxWeighting, OutflowOnInflowError,
    SkeletonStats,
};
use neurofem::element::LagrangeSimplexElement;
use neurofem::error::estimate_dg_l2_error;
use neurofem::mesh::SimplexMesh;
use neurofem::nalgebra::{DMatrix, DMatrixSliceMut, DVector, DVectorSliceMut, Matrix2, Point2, Vector2, U2};
use neurofem::nalgebra_sparse::convert::serial::convert_csr_dense;
use neurofem::problem::{
    BoundaryConditionType, ConvectionDiffusionModelProblem, ConvectionDiffusionProblem,
};
use neurofem::solver::{ConjugateGradient, LinearSolver};
use neurofem::space::DgSpace;
use std::sync::Arc;

fn single_triangle_space() -> DgSpace<f64, U2> {
    let vertices = vec![
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
    ];
    let mesh = SimplexMesh::from_vertices_and_connectivity(vertices, vec![0, 1, 2]).unwrap();
    DgSpace::new(Arc::new(mesh), LagrangeSimplexElement::new(1).unwrap())
}

#[test]
fn volume_jacobian_reproduces_p1_stiffness_matrix() {
    // On the reference right triangle with A = I, b = 0, c = 0, the element
    // stiffness matrix is known in closed form.
    let space = single_triangle_space();
    let operator = sipg_poisson_operator(0.0, 0, 0.0, |_x: &Point2<f64>| 0.0);

    let mut matrix = DMatrix::zeros(3, 3);
    operator
        .volume_jacobian(&space, 0, DMatrixSliceMut::from(&mut matrix))
        .unwrap();

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
         1.0, -0.5, -0.5,
        -0.5,  0.5,  0.0,
        -0.5,  0.0,  0.5,
    ]);
    assert_matrix_eq!(matrix, expected, comp = abs, tol = 1e-13);
}

#[test]
fn volume_jacobian_reproduces_p1_mass_matrix() {
    // With A = 0, b = 0, c = 1 the volume Jacobian is the element mass
    // matrix: area/12 on the off-diagonal, area/6 on the diagonal.
    let space = single_triangle_space();
    let mut problem = ConvectionDiffusionModelProblem::poisson(
        Matrix2::zeros(),
        0.0,
        |_x: &Point2<f64>| 0.0,
    );
    problem.reaction = 1.0;
    let config = DgOperatorConfig {
        scheme: DgScheme::Sipg,
        ..Default::default()
    };
    let operator = ConvectionDiffusionDgOperator::new(problem, FaceDiameterEdgeNorm, &config);

    let mut matrix = DMatrix::zeros(3, 3);
    operator
        .volume_jacobian(&space, 0, DMatrixSliceMut::from(&mut matrix))
        .unwrap();

    let area = 0.5;
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
        area / 6.0,  area / 12.0, area / 12.0,
        area / 12.0, area / 6.0,  area / 12.0,
        area / 12.0, area / 12.0, area / 6.0,
    ]);
    assert_matrix_eq!(matrix, expected, comp = abs, tol = 1e-13);
}

#[test]
fn source_residual_accumulates_negated_load() {
    // f = 1 yields the P1 load vector area/3 per node, accumulated with the
    // residual sign convention (negative).
    let space = single_triangle_space();
    let operator = sipg_poisson_operator(0.0, 0, 1.0, |_x: &Point2<f64>| 0.0);

    let mut r = DVector::zeros(3);
    operator
        .source_residual(&space, 0, DVectorSliceMut::from(&mut r))
        .unwrap();
    for i in 0..3 {
        assert_scalar_eq!(r[i], -0.5 / 3.0, comp = abs, tol = 1e-14);
    }
}

/// Piecewise-constant two-compartment coefficients with convection and
/// reaction, exercising the harmonic-weighting code path.
struct MockTwoCompartmentProblem;

impl ConvectionDiffusionProblem<f64, U2> for MockTwoCompartmentProblem {
    fn diffusion(&self, element: usize, _x: &Point2<f64>) -> Matrix2<f64> {
        if element == 0 {
            Matrix2::identity()
        } else {
            Matrix2::identity() * 5.0
        }
    }

    fn velocity(&self, _element: usize, _x: &Point2<f64>) -> Vector2<f64> {
        Vector2::new(0.75, -0.5)
    }

    fn reaction(&self, _element: usize, _x: &Point2<f64>) -> f64 {
        0.3
    }

    fn source(&self, _element: usize, _x: &Point2<f64>) -> f64 {
        1.0
    }

    fn boundary_condition_type(&self, _face: usize, _x: &Point2<f64>) -> BoundaryConditionType {
        BoundaryConditionType::Dirichlet
    }

    fn dirichlet(&self, _face: usize, x: &Point2<f64>) -> f64 {
        2.0 * x.x
    }

    fn neumann(&self, _face: usize, _x: &Point2<f64>) -> f64 {
        0.0
    }

    fn outflow(&self, _face: usize, _x: &Point2<f64>) -> f64 {
        0.0
    }
}

fn two_compartment_operator(
    scheme: DgScheme,
) -> ConvectionDiffusionDgOperator<
    f64,
    U2,
    MockTwoCompartmentProblem,
    FaceDiameterEdgeNorm,
    neurofem::assembly::local::SwipgWeighting<f64>,
> {
    let config = DgOperatorConfig {
        scheme,
        weights: FluxWeighting::On,
        penalty: 6.0,
        ..Default::default()
    };
    ConvectionDiffusionDgOperator::new(MockTwoCompartmentProblem, FaceDiameterEdgeNorm, &config)
}

#[test]
fn volume_residual_is_consistent_with_volume_jacobian() {
    let space = unit_square_p1_space(1);
    let operator = two_compartment_operator(DgScheme::Nipg);
    let u = DVector::from_vec(vec![0.3, -1.2, 2.0]);

    let mut matrix = DMatrix::zeros(3, 3);
    operator
        .volume_jacobian(&space, 0, DMatrixSliceMut::from(&mut matrix))
        .unwrap();
    let mut residual = DVector::zeros(3);
    operator
        .volume_residual(
            &space,
            0,
            (&u).into(),
            DVectorSliceMut::from(&mut residual),
        )
        .unwrap();

    let expected = &matrix * &u;
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-12);
}

#[test]
fn skeleton_residual_is_consistent_with_skeleton_jacobian() {
    let space = unit_square_p1_space(1);
    let operator = two_compartment_operator(DgScheme::Nipg);
    let mesh = space.mesh();
    let face_index = mesh
        .faces()
        .iter()
        .position(|f| !f.is_boundary())
        .expect("the two-element mesh has an interior face");

    let u_inside = DVector::from_vec(vec![0.4, -0.7, 1.3]);
    let u_outside = DVector::from_vec(vec![-0.2, 0.9, 0.5]);

    let mut mat_ss = DMatrix::zeros(3, 3);
    let mut mat_sn = DMatrix::zeros(3, 3);
    let mut mat_ns = DMatrix::zeros(3, 3);
    let mut mat_nn = DMatrix::zeros(3, 3);
    let mut stats = SkeletonStats::new();
    operator
        .skeleton_jacobian(
            &space,
            face_index,
            DMatrixSliceMut::from(&mut mat_ss),
            DMatrixSliceMut::from(&mut mat_sn),
            DMatrixSliceMut::from(&mut mat_ns),
            DMatrixSliceMut::from(&mut mat_nn),
            &mut stats,
        )
        .unwrap();

    let mut r_inside = DVector::zeros(3);
    let mut r_outside = DVector::zeros(3);
    operator
        .skeleton_residual(
            &space,
            face_index,
            (&u_inside).into(),
            (&u_outside).into(),
            DVectorSliceMut::from(&mut r_inside),
            DVectorSliceMut::from(&mut r_outside),
            &mut stats,
        )
        .unwrap();

    let expected_inside = &mat_ss * &u_inside + &mat_sn * &u_outside;
    let expected_outside = &mat_ns * &u_inside + &mat_nn * &u_outside;
    assert_matrix_eq!(r_inside, expected_inside, comp = abs, tol = 1e-12);
    assert_matrix_eq!(r_outside, expected_outside, comp = abs, tol = 1e-12);
}

#[test]
fn boundary_residual_is_affine_with_boundary_jacobian() {
    // The Dirichlet boundary residual is affine in u (the data g enters as a
    // constant part): r(u) - r(0) = J u.
    let space = unit_square_p1_space(1);
    let operator = two_compartment_operator(DgScheme::Sipg);
    let mesh = space.mesh();
    let face_index = mesh
        .faces()
        .iter()
        .position(|f| f.is_boundary())
        .expect("the two-element mesh has boundary faces");

    let u = DVector::from_vec(vec![0.8, -0.1, 0.6]);
    let mut stats = SkeletonStats::new();

    let mut matrix = DMatrix::zeros(3, 3);
    operator
        .boundary_jacobian(&space, face_index, DMatrixSliceMut::from(&mut matrix), &mut stats)
        .unwrap();

    let mut r_u = DVector::zeros(3);
    operator
        .boundary_residual(
            &space,
            face_index,
            (&u).into(),
            DVectorSliceMut::from(&mut r_u),
            &mut stats,
        )
        .unwrap();
    let zero = DVector::zeros(3);
    let mut r_0 = DVector::zeros(3);
    operator
        .boundary_residual(
            &space,
            face_index,
            (&zero).into(),
            DVectorSliceMut::from(&mut r_0),
            &mut stats,
        )
        .unwrap();

    let expected = &matrix * &u + &r_0;
    assert_matrix_eq!(r_u, expected, comp = abs, tol = 1e-12);
}

#[test]
fn skeleton_convection_and_diffusion_fluxes_are_conserved() {
    // For a field without a jump across the face, the consistency and
    // penalty terms vanish, and the summed convection + diffusion residual
    // contributions of the two sides must cancel exactly (the basis is a
    // partition of unity).
    let space = unit_square_p1_space(1);
    let mut problem =
        ConvectionDiffusionModelProblem::poisson(Matrix2::identity(), 0.0, |_x: &Point2<f64>| 0.0);
    problem.velocity = Vector2::new(0.5, 0.25);
    let config = DgOperatorConfig {
        scheme: DgScheme::Sipg,
        penalty: 4.0,
        ..Default::default()
    };
    let operator = ConvectionDiffusionDgOperator::new(problem, FaceDiameterEdgeNorm, &config);

    let u = interpolate_p1(&space, |x| 1.0 + 2.0 * x.x + x.y);
    let mesh = space.mesh();
    let face_index = mesh
        .faces()
        .iter()
        .position(|f| !f.is_boundary())
        .unwrap();
    let face = mesh.face(face_index);
    let inside = face.inside();
    let (outside, _) = face.outside().unwrap();

    let n = space.dofs_per_element();
    let mut r_inside = DVector::zeros(n);
    let mut r_outside = DVector::zeros(n);
    let mut stats = SkeletonStats::new();
    operator
        .skeleton_residual(
            &space,
            face_index,
            u.rows(inside * n, n),
            u.rows(outside * n, n),
            DVectorSliceMut::from(&mut r_inside),
            DVectorSliceMut::from(&mut r_outside),
            &mut stats,
        )
        .unwrap();

    let flux_inside: f64 = r_inside.sum();
    let flux_outside: f64 = r_outside.sum();
    assert!(flux_inside.abs() > 1e-8, "the face flux must not degenerate");
    assert_scalar_eq!(flux_inside, -flux_outside, comp = abs, tol = 1e-13);
}

#[test]
fn sipg_jacobian_is_symmetric_without_convection() {
    let space = unit_square_p1_space(2);
    let operator = sipg_poisson_operator(4.0, 0, 1.0, |_x: &Point2<f64>| 0.0);
    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(&space, &operator).unwrap();

    let dense = convert_csr_dense(&jacobian);
    let dense_t = dense.transpose();
    assert_matrix_eq!(dense, dense_t, comp = abs, tol = 1e-11);
}

#[test]
fn nipg_jacobian_is_not_symmetric() {
    // The sign flip of the consistency term makes NIPG structurally
    // non-symmetric; this is a property, not a bug.
    let space = unit_square_p1_space(2);
    let problem =
        ConvectionDiffusionModelProblem::poisson(Matrix2::identity(), 1.0, |_x: &Point2<f64>| 0.0);
    let config = DgOperatorConfig {
        scheme: DgScheme::Nipg,
        penalty: 4.0,
        ..Default::default()
    };
    let operator = ConvectionDiffusionDgOperator::new(problem, FaceDiameterEdgeNorm, &config);
    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(&space, &operator).unwrap();

    let dense = convert_csr_dense(&jacobian);
    let asymmetry = (&dense - dense.transpose()).abs().max();
    assert!(
        asymmetry > 1e-6,
        "expected a structurally non-symmetric NIPG matrix, asymmetry = {asymmetry}"
    );
}

#[test]
fn linear_solution_is_reproduced_exactly() {
    // A globally linear solution lies in the P1 DG space, so the consistent
    // SIPG discretization reproduces it to machine precision: the residual
    // vanishes at the interpolant, and the solve returns the interpolant.
    let u_exact = |x: &Point2<f64>| 4.0 * x.x - 2.0 * x.y + 7.0;
    let space = unit_square_p1_space(2);
    let operator = sipg_poisson_operator(4.0, 0, 0.0, u_exact);

    let u_interpolated = interpolate_p1(&space, u_exact);
    let assembler = CsrDgAssembler::default();
    let (residual, _) = assembler
        .assemble_residual(&space, &operator, &u_interpolated)
        .unwrap();
    assert!(
        residual.amax() < 1e-10,
        "residual at the exact interpolant: {}",
        residual.amax()
    );

    let u = assemble_and_solve(&space, &operator);
    let error = estimate_dg_l2_error(&space, &u, u_exact, 4).unwrap();
    assert!(error < 1e-9, "L2 error {error} for an in-space solution");
}

#[test]
fn quadratic_solution_is_reproduced_exactly_with_p2_elements() {
    let u_exact = |x: &Point2<f64>| x.x * x.x + x.y * x.y;
    let mesh = Arc::new(
        neurofem::mesh::procedural::create_unit_square_uniform_tri_mesh_2d::<f64>(2),
    );
    let space = DgSpace::new(mesh, LagrangeSimplexElement::new(2).unwrap());
    // -laplace(u) = f with u = x^2 + y^2 gives f = -4.
    let operator = sipg_poisson_operator(10.0, 0, -4.0, u_exact);

    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(&space, &operator).unwrap();
    let rhs = assembler.assemble_rhs_vector(&space, &operator).unwrap();
    let cg = ConjugateGradient::new().with_max_iterations(10_000);
    let mut u = DVector::zeros(space.num_dofs());
    let stats = cg.solve(&jacobian, &mut u, &rhs, 1e-13).unwrap();
    assert!(stats.converged);

    let error = estimate_dg_l2_error(&space, &u, u_exact, 6).unwrap();
    assert!(error < 1e-8, "L2 error {error} for an in-space P2 solution");
}

#[test]
fn l2_error_converges_at_second_order() {
    let u_exact = |x: &Point2<f64>| x.x * x.x + x.y * x.y;
    let mut errors = Vec::new();
    for cells in [4, 8] {
        let space = unit_square_p1_space(cells);
        let operator = sipg_poisson_operator(10.0, 0, -4.0, u_exact);
        let u = assemble_and_solve(&space, &operator);
        errors.push(estimate_dg_l2_error(&space, &u, u_exact, 4).unwrap());
    }
    let ratio = errors[0] / errors[1];
    assert!(
        ratio > 2.5,
        "expected roughly second-order L2 convergence, got ratio {ratio} from {errors:?}"
    );
}

/// Outflow boundary everywhere, with a rightward velocity field: the left
/// edge of the triangle is an inflow boundary.
struct MockOutflowProblem;

impl ConvectionDiffusionProblem<f64, U2> for MockOutflowProblem {
    fn diffusion(&self, _element: usize, _x: &Point2<f64>) -> Matrix2<f64> {
        Matrix2::identity()
    }

    fn velocity(&self, _element: usize, _x: &Point2<f64>) -> Vector2<f64> {
        Vector2::new(1.0, 0.0)
    }

    fn reaction(&self, _element: usize, _x: &Point2<f64>) -> f64 {
        0.0
    }

    fn source(&self, _element: usize, _x: &Point2<f64>) -> f64 {
        0.0
    }

    fn boundary_condition_type(&self, _face: usize, _x: &Point2<f64>) -> BoundaryConditionType {
        BoundaryConditionType::Outflow
    }

    fn dirichlet(&self, _face: usize, _x: &Point2<f64>) -> f64 {
        0.0
    }

    fn neumann(&self, _face: usize, _x: &Point2<f64>) -> f64 {
        0.0
    }

    fn outflow(&self, _face: usize, _x: &Point2<f64>) -> f64 {
        2.0
    }
}

#[test]
fn outflow_condition_on_inflow_face_is_rejected() {
    let space = single_triangle_space();
    let mesh = space.mesh();
    // The x = 0 edge has outer normal (-1, 0), so b . n = -1: strict inflow.
    let inflow_face = mesh
        .faces()
        .iter()
        .position(|f| f.vertices() == [0, 2])
        .unwrap();

    let config = DgOperatorConfig {
        scheme: DgScheme::Sipg,
        penalty: 4.0,
        ..Default::default()
    };
    let operator =
        ConvectionDiffusionDgOperator::new(MockOutflowProblem, FaceDiameterEdgeNorm, &config);

    let u = DVector::zeros(3);
    let mut r = DVector::zeros(3);
    let mut stats = SkeletonStats::new();
    let error = operator
        .boundary_residual(
            &space,
            inflow_face,
            (&u).into(),
            DVectorSliceMut::from(&mut r),
            &mut stats,
        )
        .unwrap_err();
    assert!(
        error.downcast_ref::<OutflowOnInflowError>().is_some(),
        "expected OutflowOnInflowError, got: {error}"
    );
}

#[test]
fn outflow_on_inflow_override_accumulates_the_outflow_flux() {
    let space = single_triangle_space();
    let mesh = space.mesh();
    let inflow_face = mesh
        .faces()
        .iter()
        .position(|f| f.vertices() == [0, 2])
        .unwrap();

    let config = DgOperatorConfig {
        scheme: DgScheme::Sipg,
        penalty: 4.0,
        use_outflow_boundary_condition_and_its_flux_on_inflow: true,
        ..Default::default()
    };
    let operator =
        ConvectionDiffusionDgOperator::new(MockOutflowProblem, FaceDiameterEdgeNorm, &config);

    let u = DVector::zeros(3);
    let mut r = DVector::zeros(3);
    let mut stats = SkeletonStats::new();
    operator
        .boundary_residual(
            &space,
            inflow_face,
            (&u).into(),
            DVectorSliceMut::from(&mut r),
            &mut stats,
        )
        .unwrap();

    // With u = 0 only the prescribed flux o = 2 contributes:
    // r_i = o * int_F phi_i ds, which is o/2 for the two face vertices and
    // zero for the opposite one.
    assert_scalar_eq!(r[0], 1.0, comp = abs, tol = 1e-13);
    assert_scalar_eq!(r[1], 0.0, comp = abs, tol = 1e-13);
    assert_scalar_eq!(r[2], 1.0, comp = abs, tol = 1e-13);
}

#[test]
fn skeleton_stats_track_face_diameter_range() {
    let space = unit_square_p1_space(1);
    let operator = sipg_poisson_operator(4.0, 0, 1.0, |_x: &Point2<f64>| 0.0);
    let assembler = CsrDgAssembler::default();
    let (_, stats) = assembler.assemble_jacobian(&space, &operator).unwrap();

    // Boundary edges have length 1, the interior diagonal has length sqrt 2.
    assert_scalar_eq!(stats.min_h().unwrap(), 1.0, comp = abs, tol = 1e-13);
    assert_scalar_eq!(stats.max_h().unwrap(), 2.0f64.sqrt(), comp = abs, tol = 1e-13);
}

#[test]
fn two_element_dirichlet_scenario_is_spd_and_nonnegative() {
    // The scenario from the testable properties: 2-element unit square,
    // A = I, b = 0, c = 0, f = 1, homogeneous Dirichlet, SIPG, alpha = 10,
    // intorder_add = 2.
    let space = unit_square_p1_space(1);
    let operator = sipg_poisson_operator(10.0, 2, 1.0, |_x: &Point2<f64>| 0.0);
    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(&space, &operator).unwrap();
    let rhs = assembler.assemble_rhs_vector(&space, &operator).unwrap();

    let dense = convert_csr_dense(&jacobian);
    // Positive definiteness: a Cholesky factorization exists.
    assert!(
        dense.clone().cholesky().is_some(),
        "the SIPG scenario matrix must be SPD"
    );
    let dense_transposed = dense.transpose();
    assert_matrix_eq!(dense, dense_transposed, comp = abs, tol = 1e-11);

    let cg = ConjugateGradient::new();
    let mut u = DVector::zeros(space.num_dofs());
    let stats = cg.solve(&jacobian, &mut u, &rhs, 1e-12).unwrap();
    assert!(stats.converged);

    // Non-negative source, zero boundary values: the solution of the
    // discrete maximum-principle-friendly SIPG system stays non-negative.
    assert!(u.iter().all(|&v| v > -1e-12), "solution dipped negative: {u}");

    // The domain and data are symmetric under reflection across the
    // diagonal, which maps element 0 onto element 1 with vertices permuted
    // as (0, 1, 2) -> (0, 2, 1).
    assert_scalar_eq!(u[0], u[3], comp = abs, tol = 1e-10);
    assert_scalar_eq!(u[1], u[5], comp = abs, tol = 1e-10);
    assert_scalar_eq!(u[2], u[4], comp = abs, tol = 1e-10);
}
