//! Characteristic face diameters for interior-penalty scaling.

use crate::allocators::DimAllocator;
use crate::mesh::SimplexMesh;
use crate::{Real, SmallDim};
use nalgebra::DefaultAllocator;

/// Supplies the characteristic length `h_F` of a face, used to scale the
/// interior penalty.
///
/// The choice of edge norm changes the penalty required for stability on
/// anisotropic meshes, which is why it is injected rather than fixed.
pub trait EdgeNormProvider<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn edge_norm(
        &self,
        mesh: &SimplexMesh<T, D>,
        face: usize,
        is_boundary: bool,
    ) -> eyre::Result<T>;
}

/// `h_F` = diameter of the face (largest pairwise corner distance).
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceDiameterEdgeNorm;

impl<T, D> EdgeNormProvider<T, D> for FaceDiameterEdgeNorm
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn edge_norm(
        &self,
        mesh: &SimplexMesh<T, D>,
        face: usize,
        _is_boundary: bool,
    ) -> eyre::Result<T> {
        Ok(mesh.face_geometry(face)?.diameter)
    }
}

/// `h_F` = min(adjacent element volumes) / face measure.
///
/// Behaves better than the plain face diameter on stretched elements, where
/// a large face can bound a thin element.
#[derive(Debug, Clone, Copy, Default)]
pub struct HoustonEdgeNorm;

impl<T, D> EdgeNormProvider<T, D> for HoustonEdgeNorm
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn edge_norm(
        &self,
        mesh: &SimplexMesh<T, D>,
        face: usize,
        is_boundary: bool,
    ) -> eyre::Result<T> {
        let geometry = mesh.face_geometry(face)?;
        let face_ref = mesh.face(face);
        let mut volume = mesh.element_geometry(face_ref.inside())?.volume;
        if !is_boundary {
            if let Some((outside, _)) = face_ref.outside() {
                volume = volume.min(mesh.element_geometry(outside)?.volume);
            }
        }
        Ok(volume / geometry.measure)
    }
}
