//! Element patches: connected neighborhoods of mesh elements around a
//! point, used to restrict expensive localized source-model assembly.

use crate::allocators::DimAllocator;
use crate::mesh::SimplexMesh;
use crate::problem::{Side, VolumeConductor};
use crate::{Real, SmallDim};
use nalgebra::{DefaultAllocator, OPoint};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the initial patch around the seed position is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchInitialization {
    /// The patch starts as the single element containing the position.
    SingleElement,
    /// The patch starts as all elements sharing the corner of the
    /// containing element that lies closest to the position.
    ClosestVertex,
}

impl FromStr for PatchInitialization {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_element" => Ok(PatchInitialization::SingleElement),
            "closest_vertex" => Ok(PatchInitialization::ClosestVertex),
            _ => Err(eyre::eyre!("unknown element patch initialization \"{s}\"")),
        }
    }
}

/// How the patch is grown in one extension step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchExtension {
    /// Add all elements sharing a vertex with the current patch.
    Vertex,
    /// Add all elements sharing a face with the current patch.
    Intersection,
}

impl FromStr for PatchExtension {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vertex" => Ok(PatchExtension::Vertex),
            "intersection" => Ok(PatchExtension::Intersection),
            _ => Err(eyre::eyre!("unknown element patch extension \"{s}\"")),
        }
    }
}

/// Configuration of patch construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementPatchConfig {
    pub initialization: PatchInitialization,
    /// Extension steps applied in order after initialization.
    pub extensions: Vec<PatchExtension>,
    /// Admit only elements whose conductivity tensor matches the tensor at
    /// the seed position.
    pub restrict: bool,
    /// If set, repeat the extension list until the patch holds at least this
    /// many elements or stops growing.
    pub repeat_until: Option<usize>,
}

impl Default for ElementPatchConfig {
    fn default() -> Self {
        Self {
            initialization: PatchInitialization::SingleElement,
            extensions: Vec::new(),
            restrict: false,
            repeat_until: None,
        }
    }
}

/// A connected, duplicate-free set of elements grown around a seed
/// position.
///
/// The element list and the index set are always in agreement, and the
/// patch only ever grows. The admission filter is applied to every
/// candidate at initialization and extension time; it never removes
/// elements admitted earlier.
pub struct ElementPatch<'a, T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    mesh: &'a SimplexMesh<T, D>,
    filter: Box<dyn Fn(usize) -> bool + 'a>,
    elements: Vec<usize>,
    indices: FxHashSet<usize>,
}

impl<'a, T, D> ElementPatch<'a, T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Creates a patch seeded at `position`.
    pub fn new(
        mesh: &'a SimplexMesh<T, D>,
        position: &OPoint<T, D>,
        initialization: PatchInitialization,
        filter: Box<dyn Fn(usize) -> bool + 'a>,
    ) -> eyre::Result<Self> {
        let mut patch = Self {
            mesh,
            filter,
            elements: Vec::new(),
            indices: FxHashSet::default(),
        };
        match initialization {
            PatchInitialization::SingleElement => {
                let element = mesh.find_element_containing(position)?;
                patch.admit(element);
            }
            PatchInitialization::ClosestVertex => {
                let element = mesh.find_element_containing(position)?;
                let corners = mesh.element_vertex_indices(element);
                let mut closest = corners[0];
                let mut closest_distance = (position - &mesh.vertices()[corners[0]]).norm();
                for &corner in &corners[1..] {
                    let distance = (position - &mesh.vertices()[corner]).norm();
                    if distance < closest_distance {
                        closest_distance = distance;
                        closest = corner;
                    }
                }
                for &candidate in mesh.vertex_elements(closest) {
                    patch.admit(candidate);
                }
            }
        }
        Ok(patch)
    }

    fn admit(&mut self, element: usize) {
        if !self.indices.contains(&element) && (self.filter)(element) {
            self.elements.push(element);
            self.indices.insert(element);
        }
    }

    /// Grows the patch by one extension step. Candidates already in the
    /// patch or rejected by the filter are skipped; extension is
    /// idempotent once no new elements are reachable.
    pub fn extend(&mut self, extension: PatchExtension) {
        let mut candidates = Vec::new();
        match extension {
            PatchExtension::Vertex => {
                for &element in &self.elements {
                    for &vertex in self.mesh.element_vertex_indices(element) {
                        candidates.extend_from_slice(self.mesh.vertex_elements(vertex));
                    }
                }
            }
            PatchExtension::Intersection => {
                for &element in &self.elements {
                    for &face_index in self.mesh.element_faces(element) {
                        let face = self.mesh.face(face_index);
                        let neighbor = if face.inside() == element {
                            face.outside().map(|(outside, _)| outside)
                        } else {
                            Some(face.inside())
                        };
                        if let Some(neighbor) = neighbor {
                            candidates.push(neighbor);
                        }
                    }
                }
            }
        }
        for candidate in candidates {
            self.admit(candidate);
        }
    }

    /// The patch elements, in admission order.
    pub fn elements(&self) -> &[usize] {
        &self.elements
    }

    pub fn contains(&self, element: usize) -> bool {
        self.indices.contains(&element)
    }

    /// The interior faces separating the patch from the rest of the mesh:
    /// faces of patch elements whose neighbor exists but is not in the
    /// patch. The reported [`Side`] is the side of the face the patch
    /// element is on.
    ///
    /// Domain-boundary faces are not reported; they have no neighbor to
    /// separate from.
    pub fn extract_boundary_faces(&self) -> Vec<(usize, Side)> {
        let mut boundary = Vec::new();
        for &element in &self.elements {
            for &face_index in self.mesh.element_faces(element) {
                let face = self.mesh.face(face_index);
                let Some((outside, _)) = face.outside() else {
                    continue;
                };
                let (neighbor, side) = if face.inside() == element {
                    (outside, Side::Inside)
                } else {
                    (face.inside(), Side::Outside)
                };
                if !self.contains(neighbor) {
                    boundary.push((face_index, side));
                }
            }
        }
        boundary
    }
}

/// Builds the admission filter: unrestricted, or requiring the candidate's
/// conductivity tensor to match the tensor at the seed position up to a
/// small Frobenius tolerance.
pub fn make_element_filter<'a, T, D>(
    conductor: &'a VolumeConductor<T, D>,
    position: &OPoint<T, D>,
    restrict: bool,
) -> eyre::Result<Box<dyn Fn(usize) -> bool + 'a>>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    if restrict {
        let seed = conductor.mesh().find_element_containing(position)?;
        let reference = conductor.tensor(seed).clone();
        let tolerance = T::from_f64(1e-8).expect("Literal must fit in T");
        Ok(Box::new(move |element| {
            (conductor.tensor(element) - &reference).norm_squared() < tolerance
        }))
    } else {
        Ok(Box::new(|_| true))
    }
}

/// Builds an element patch around `position` according to the given
/// configuration: initialization, the configured extension steps, and the
/// optional repeat-until-count loop (which stops as soon as an entire pass
/// adds no element).
pub fn make_element_patch<'a, T, D>(
    conductor: &'a VolumeConductor<T, D>,
    position: &OPoint<T, D>,
    config: &ElementPatchConfig,
) -> eyre::Result<ElementPatch<'a, T, D>>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    let filter = make_element_filter(conductor, position, config.restrict)?;
    let mut patch = ElementPatch::new(conductor.mesh(), position, config.initialization, filter)?;
    let mut previous_size = patch.elements().len();
    for &extension in &config.extensions {
        patch.extend(extension);
    }
    if let Some(minimum) = config.repeat_until {
        while patch.elements().len() < minimum && previous_size != patch.elements().len() {
            previous_size = patch.elements().len();
            for &extension in &config.extensions {
                patch.extend(extension);
            }
        }
    }
    Ok(patch)
}
