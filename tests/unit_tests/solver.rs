use crate::unit_tests::{sipg_poisson_operator, unit_square_p1_space};
use matrixcompare::assert_matrix_eq;
use neurofem::assembly::edge_norm::FaceDiameterEdgeNorm;
use neurofem::assembly::global::{CsrDgAssembler, DgLinearSystem};
use neurofem::assembly::local::{ConvectionDiffusionDgOperator, DgOperatorConfig, DgScheme};
use neurofem::element::LagrangeSimplexElement;
use neurofem::mesh::procedural::create_unit_square_uniform_tri_mesh_2d;
use neurofem::nalgebra::{DVector, Matrix2, Point2};
use neurofem::problem::{VolumeConductor, VolumeConductorProblem};
use neurofem::solver::{
    fix_first_dof, ConjugateGradient, StationarySolverConfig, ThreadSafeStationarySolver,
};
use neurofem::space::DgSpace;
use std::sync::Arc;

#[test]
fn concurrent_applies_build_the_jacobian_exactly_once() {
    let space = unit_square_p1_space(2);
    let operator = sipg_poisson_operator(4.0, 0, 1.0, |_x: &Point2<f64>| 0.0);
    let system = DgLinearSystem {
        space: &space,
        operator: &operator,
    };
    let solver = ThreadSafeStationarySolver::new(StationarySolverConfig {
        reduction: 1e-10,
        ..Default::default()
    });
    let cg = ConjugateGradient::new().with_max_iterations(5000);

    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(&space, &operator).unwrap();
    let base_rhs = assembler.assemble_rhs_vector(&space, &operator).unwrap();

    let num_threads = 4;
    let solutions: Vec<(DVector<f64>, DVector<f64>)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for k in 0..num_threads {
            let solver = &solver;
            let system = &system;
            let cg = &cg;
            let base_rhs = &base_rhs;
            handles.push(scope.spawn(move || {
                let rhs = base_rhs * (k as f64 + 1.0);
                let mut x = DVector::zeros(rhs.len());
                let stats = solver.apply(system, cg, &mut x, &rhs).unwrap();
                assert!(stats.linear_solver.converged);
                (x, rhs)
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(solver.build_count(), 1, "the Jacobian must be built once");
    for (x, rhs) in &solutions {
        let residual = rhs - &jacobian * x;
        assert!(
            residual.norm() <= 1e-8 * rhs.norm().max(1.0),
            "solution does not satisfy its system: residual {}",
            residual.norm()
        );
    }
}

#[test]
fn discard_matrix_forces_a_rebuild() {
    let space = unit_square_p1_space(1);
    let operator = sipg_poisson_operator(10.0, 0, 1.0, |_x: &Point2<f64>| 0.0);
    let system = DgLinearSystem {
        space: &space,
        operator: &operator,
    };
    let solver = ThreadSafeStationarySolver::new(StationarySolverConfig::default());
    let cg = ConjugateGradient::new();

    let assembler = CsrDgAssembler::default();
    let rhs = assembler.assemble_rhs_vector(&space, &operator).unwrap();

    let mut x = DVector::zeros(space.num_dofs());
    let stats = solver.apply(&system, &cg, &mut x, &rhs).unwrap();
    assert!(stats.assembled);
    let stats = solver.apply(&system, &cg, &mut x, &rhs).unwrap();
    assert!(!stats.assembled, "the cached Jacobian must be reused");
    assert_eq!(solver.build_count(), 1);

    solver.discard_matrix();
    let stats = solver.apply(&system, &cg, &mut x, &rhs).unwrap();
    assert!(stats.assembled, "discarding must force a rebuild");
    assert_eq!(solver.build_count(), 2);
}

#[test]
fn repeated_apply_refines_instead_of_restarting() {
    // apply() refines the passed-in iterate: a second call with the same
    // right-hand side keeps the solution (the defect is already small).
    let space = unit_square_p1_space(1);
    let operator = sipg_poisson_operator(10.0, 0, 1.0, |_x: &Point2<f64>| 0.0);
    let system = DgLinearSystem {
        space: &space,
        operator: &operator,
    };
    let solver = ThreadSafeStationarySolver::new(StationarySolverConfig {
        reduction: 1e-12,
        ..Default::default()
    });
    let cg = ConjugateGradient::new();
    let assembler = CsrDgAssembler::default();
    let rhs = assembler.assemble_rhs_vector(&space, &operator).unwrap();

    let mut x = DVector::zeros(space.num_dofs());
    solver.apply(&system, &cg, &mut x, &rhs).unwrap();
    let first = x.clone();
    solver.apply(&system, &cg, &mut x, &rhs).unwrap();
    assert_matrix_eq!(x, first, comp = abs, tol = 1e-9);
}

#[test]
fn fixed_dof_resolves_the_pure_neumann_rank_deficiency() {
    // The EEG forward configuration: homogeneous Neumann boundary, so the
    // operator annihilates constants until the first DOF is pinned.
    let mesh = Arc::new(create_unit_square_uniform_tri_mesh_2d::<f64>(2));
    let space = DgSpace::new(Arc::clone(&mesh), LagrangeSimplexElement::new(1).unwrap());
    let tensors = vec![Matrix2::identity(); mesh.num_elements()];
    let conductor = Arc::new(VolumeConductor::new(mesh, tensors).unwrap());
    let problem = VolumeConductorProblem::new(conductor);
    let config = DgOperatorConfig {
        scheme: DgScheme::Sipg,
        penalty: 4.0,
        ..Default::default()
    };
    let operator = ConvectionDiffusionDgOperator::new(problem, FaceDiameterEdgeNorm, &config);
    let system = DgLinearSystem {
        space: &space,
        operator: &operator,
    };

    // Manufacture a compatible right-hand side from the pinned matrix.
    let assembler = CsrDgAssembler::default();
    let (mut pinned, _) = assembler.assemble_jacobian(&space, &operator).unwrap();
    fix_first_dof(&mut pinned, 1.0);
    let mut x_target = DVector::zeros(space.num_dofs());
    for i in 1..x_target.len() {
        x_target[i] = (i as f64 * 0.37).sin();
    }
    let rhs = &pinned * &x_target;

    let solver = ThreadSafeStationarySolver::new(StationarySolverConfig {
        reduction: 1e-12,
        fix_dof: true,
        fixed_dof_entry: 1.0,
        debug: true,
        ..Default::default()
    });
    let cg = ConjugateGradient::new().with_max_iterations(10_000);
    let mut x = DVector::zeros(space.num_dofs());
    let stats = solver.apply(&system, &cg, &mut x, &rhs).unwrap();
    assert!(stats.linear_solver.converged);
    assert_matrix_eq!(x, x_target, comp = abs, tol = 1e-7);
}

#[test]
fn solve_columns_shares_one_jacobian_across_right_hand_sides() {
    let space = unit_square_p1_space(2);
    let operator = sipg_poisson_operator(4.0, 0, 1.0, |_x: &Point2<f64>| 0.0);
    let system = DgLinearSystem {
        space: &space,
        operator: &operator,
    };
    let solver = ThreadSafeStationarySolver::new(StationarySolverConfig::default());
    let cg = ConjugateGradient::new().with_max_iterations(5000);

    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(&space, &operator).unwrap();
    let base_rhs = assembler.assemble_rhs_vector(&space, &operator).unwrap();

    let right_hand_sides: Vec<DVector<f64>> =
        (0..8).map(|k| &base_rhs * (k as f64 + 0.5)).collect();
    let mut solutions = vec![DVector::zeros(space.num_dofs()); right_hand_sides.len()];
    let stats = solver
        .solve_columns(&system, &cg, &mut solutions, &right_hand_sides)
        .unwrap();

    assert_eq!(solver.build_count(), 1);
    assert_eq!(stats.len(), right_hand_sides.len());
    for (x, rhs) in solutions.iter().zip(&right_hand_sides) {
        let residual = rhs - &jacobian * x;
        assert!(residual.norm() <= 1e-8 * rhs.norm().max(1.0));
    }
}
