//! The PDE coefficient interface consumed by the DG assembly kernels.

use crate::allocators::DimAllocator;
use crate::mesh::SimplexMesh;
use crate::{Real, SmallDim};
use eyre::eyre;
use nalgebra::{DefaultAllocator, OMatrix, OPoint, OVector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which side of a face a quantity is evaluated on.
///
/// Threaded explicitly through the face-wise coefficient evaluation so that
/// the same assembly code path serves both body-fitted meshes (where the
/// side determines the adjacent element) and unfitted discretizations
/// (where a coefficient may depend only on the domain side of the cut).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Inside,
    Outside,
}

/// The boundary condition type attached to a boundary face.
///
/// The type is assumed constant over each face; the kernels query it once
/// per face at the face center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryConditionType {
    Dirichlet,
    Neumann,
    Outflow,
}

/// Coefficients and data of the convection-diffusion equation
///
/// $$ \nabla \cdot (-A(x) \nabla u + b(x) u) + c(x) u = f $$
///
/// with Dirichlet data `g`, Neumann flux `j` and outflow flux `o`.
///
/// All evaluation points are physical coordinates; element and face indices
/// identify the mesh entity the point lies on, so implementations may key
/// their data either spatially or per entity. The diffusion tensor is
/// assumed constant per element and is only ever evaluated at entity
/// centers.
pub trait ConvectionDiffusionProblem<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// The diffusion tensor on the given element.
    fn diffusion(&self, element: usize, x: &OPoint<T, D>) -> OMatrix<T, D, D>;

    /// The diffusion tensor seen from one side of a face.
    ///
    /// `element` is the adjacent element on the requested side. The default
    /// delegates to the element tensor; unfitted discretizations override
    /// this to select by domain side instead.
    fn diffusion_on_face(
        &self,
        face: usize,
        side: Side,
        element: usize,
        x: &OPoint<T, D>,
    ) -> OMatrix<T, D, D> {
        let _ = (face, side);
        self.diffusion(element, x)
    }

    /// The velocity field `b`.
    fn velocity(&self, element: usize, x: &OPoint<T, D>) -> OVector<T, D>;

    /// The reaction coefficient `c`.
    fn reaction(&self, element: usize, x: &OPoint<T, D>) -> T;

    /// The source term `f`.
    fn source(&self, element: usize, x: &OPoint<T, D>) -> T;

    /// The boundary condition type of a boundary face.
    fn boundary_condition_type(&self, face: usize, x: &OPoint<T, D>) -> BoundaryConditionType;

    /// Dirichlet boundary value `g`.
    fn dirichlet(&self, face: usize, x: &OPoint<T, D>) -> T;

    /// Neumann boundary flux `j`.
    fn neumann(&self, face: usize, x: &OPoint<T, D>) -> T;

    /// Outflow boundary flux `o`.
    fn outflow(&self, face: usize, x: &OPoint<T, D>) -> T;

    /// Advances the problem to a new point in time.
    ///
    /// Stationary problems ignore this.
    fn set_time(&mut self, _t: T) {}
}

/// A conductivity model: one symmetric positive definite tensor per mesh
/// element, as produced by segmented head models.
#[derive(Debug, Clone)]
pub struct VolumeConductor<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    mesh: Arc<SimplexMesh<T, D>>,
    tensors: Vec<OMatrix<T, D, D>>,
}

impl<T, D> VolumeConductor<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    pub fn new(mesh: Arc<SimplexMesh<T, D>>, tensors: Vec<OMatrix<T, D, D>>) -> eyre::Result<Self> {
        if tensors.len() != mesh.num_elements() {
            return Err(eyre!(
                "expected one conductivity tensor per element ({}), got {}",
                mesh.num_elements(),
                tensors.len()
            ));
        }
        Ok(Self { mesh, tensors })
    }

    pub fn mesh(&self) -> &Arc<SimplexMesh<T, D>> {
        &self.mesh
    }

    pub fn tensor(&self, element: usize) -> &OMatrix<T, D, D> {
        &self.tensors[element]
    }
}

/// The EEG forward configuration: diffusion by the conductivity tensors of a
/// volume conductor, no convection, no reaction, homogeneous Neumann
/// boundary (no current leaves the head).
///
/// The resulting operator is singular (constants are in its null space);
/// the stationary solver's DOF fixing handles the rank deficiency.
#[derive(Debug, Clone)]
pub struct VolumeConductorProblem<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    conductor: Arc<VolumeConductor<T, D>>,
}

impl<T, D> VolumeConductorProblem<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    pub fn new(conductor: Arc<VolumeConductor<T, D>>) -> Self {
        Self { conductor }
    }
}

impl<T, D> ConvectionDiffusionProblem<T, D> for VolumeConductorProblem<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn diffusion(&self, element: usize, _x: &OPoint<T, D>) -> OMatrix<T, D, D> {
        self.conductor.tensor(element).clone()
    }

    fn velocity(&self, _element: usize, _x: &OPoint<T, D>) -> OVector<T, D> {
        OVector::<T, D>::zeros()
    }

    fn reaction(&self, _element: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }

    fn source(&self, _element: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }

    fn boundary_condition_type(&self, _face: usize, _x: &OPoint<T, D>) -> BoundaryConditionType {
        BoundaryConditionType::Neumann
    }

    fn dirichlet(&self, _face: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }

    fn neumann(&self, _face: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }

    fn outflow(&self, _face: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }
}

/// A convection-diffusion model problem with constant coefficients and a
/// closure for the Dirichlet data, convenient for manufactured solutions.
#[derive(Debug, Clone)]
pub struct ConvectionDiffusionModelProblem<T, D, G>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    pub diffusion: OMatrix<T, D, D>,
    pub velocity: OVector<T, D>,
    pub reaction: T,
    pub source: T,
    pub boundary_condition: BoundaryConditionType,
    pub dirichlet: G,
    time: T,
}

impl<T, D, G> ConvectionDiffusionModelProblem<T, D, G>
where
    T: Real,
    D: SmallDim,
    G: Fn(&OPoint<T, D>) -> T,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// A pure diffusion problem `-div(A grad u) = f` with Dirichlet data.
    pub fn poisson(diffusion: OMatrix<T, D, D>, source: T, dirichlet: G) -> Self {
        Self {
            diffusion,
            velocity: OVector::<T, D>::zeros(),
            reaction: T::zero(),
            source,
            boundary_condition: BoundaryConditionType::Dirichlet,
            dirichlet,
            time: T::zero(),
        }
    }

    pub fn time(&self) -> T {
        self.time
    }
}

impl<T, D, G> ConvectionDiffusionProblem<T, D> for ConvectionDiffusionModelProblem<T, D, G>
where
    T: Real,
    D: SmallDim,
    G: Fn(&OPoint<T, D>) -> T,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn diffusion(&self, _element: usize, _x: &OPoint<T, D>) -> OMatrix<T, D, D> {
        self.diffusion.clone()
    }

    fn velocity(&self, _element: usize, _x: &OPoint<T, D>) -> OVector<T, D> {
        self.velocity.clone()
    }

    fn reaction(&self, _element: usize, _x: &OPoint<T, D>) -> T {
        self.reaction
    }

    fn source(&self, _element: usize, _x: &OPoint<T, D>) -> T {
        self.source
    }

    fn boundary_condition_type(&self, _face: usize, _x: &OPoint<T, D>) -> BoundaryConditionType {
        self.boundary_condition
    }

    fn dirichlet(&self, _face: usize, x: &OPoint<T, D>) -> T {
        (self.dirichlet)(x)
    }

    fn neumann(&self, _face: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }

    fn outflow(&self, _face: usize, _x: &OPoint<T, D>) -> T {
        T::zero()
    }

    fn set_time(&mut self, t: T) {
        self.time = t;
    }
}
