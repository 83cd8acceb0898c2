mod assembly;
mod solver;

use neurofem::assembly::edge_norm::FaceDiameterEdgeNorm;
use neurofem::assembly::global::CsrDgAssembler;
use neurofem::assembly::local::{
    ConvectionDiffusionDgOperator, DgOperatorConfig, DgScheme, SwipgWeighting,
};
use neurofem::element::LagrangeSimplexElement;
use neurofem::mesh::procedural::create_unit_square_uniform_tri_mesh_2d;
use neurofem::nalgebra::{DVector, Matrix2, Point2, U2};
use neurofem::problem::ConvectionDiffusionModelProblem;
use neurofem::solver::{ConjugateGradient, LinearSolver};
use neurofem::space::DgSpace;
use std::sync::Arc;

pub type PoissonOperator<G> = ConvectionDiffusionDgOperator<
    f64,
    U2,
    ConvectionDiffusionModelProblem<f64, U2, G>,
    FaceDiameterEdgeNorm,
    SwipgWeighting<f64>,
>;

/// A P1 DG space on the unit square with `cells_per_axis` cells per axis.
pub fn unit_square_p1_space(cells_per_axis: usize) -> DgSpace<f64, U2> {
    let mesh = Arc::new(create_unit_square_uniform_tri_mesh_2d(cells_per_axis));
    DgSpace::new(mesh, LagrangeSimplexElement::new(1).unwrap())
}

/// A SIPG operator for `-laplace(u) = source` with Dirichlet data `g`.
pub fn sipg_poisson_operator<G>(
    alpha: f64,
    intorder_add: usize,
    source: f64,
    dirichlet: G,
) -> PoissonOperator<G>
where
    G: Fn(&Point2<f64>) -> f64,
{
    let problem =
        ConvectionDiffusionModelProblem::poisson(Matrix2::identity(), source, dirichlet);
    let config = DgOperatorConfig {
        scheme: DgScheme::Sipg,
        penalty: alpha,
        intorder_add,
        ..Default::default()
    };
    ConvectionDiffusionDgOperator::new(problem, FaceDiameterEdgeNorm, &config)
}

/// Assembles and solves the linear system of the given operator with CG.
pub fn assemble_and_solve<G>(space: &DgSpace<f64, U2>, operator: &PoissonOperator<G>) -> DVector<f64>
where
    G: Fn(&Point2<f64>) -> f64,
{
    let assembler = CsrDgAssembler::default();
    let (jacobian, _) = assembler.assemble_jacobian(space, operator).unwrap();
    let rhs = assembler.assemble_rhs_vector(space, operator).unwrap();
    let cg = ConjugateGradient::new().with_max_iterations(5000);
    let mut u = DVector::zeros(space.num_dofs());
    let stats = cg.solve(&jacobian, &mut u, &rhs, 1e-12).unwrap();
    assert!(stats.converged, "CG failed to converge: {stats:?}");
    u
}

/// Interpolates a function at the P1 nodes (the element vertices) of a DG
/// space.
pub fn interpolate_p1(space: &DgSpace<f64, U2>, u: impl Fn(&Point2<f64>) -> f64) -> DVector<f64> {
    let mesh = space.mesh();
    let n = space.dofs_per_element();
    let mut values = DVector::zeros(space.num_dofs());
    for element in 0..space.num_elements() {
        for local in 0..n {
            values[space.global_dof(element, local)] = u(mesh.element_vertex(element, local));
        }
    }
    values
}
