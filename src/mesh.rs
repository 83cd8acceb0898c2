//! Simplex meshes with one-time intersection (face) enumeration.
//!
//! The mesh is the geometric substrate for the DG assembly kernels: it owns
//! the vertices and element connectivity, enumerates every interior face
//! exactly once with a fixed inside/outside orientation, and provides the
//! affine-simplex geometry quantities (Jacobians, volumes, outer normals,
//! face measures and diameters) the kernels consume.

use crate::allocators::DimAllocator;
use crate::element::barycentric_gradient;
use crate::{Real, SmallDim};
use eyre::eyre;
use nalgebra::{DMatrix, DefaultAllocator, OMatrix, OPoint, OVector};
use rustc_hash::FxHashMap;

pub mod procedural;

/// A mesh face: either the intersection of two elements or part of the
/// domain boundary.
///
/// Interior faces carry both adjacent elements in a fixed order: the
/// element first encountered during enumeration (the one with the lower
/// index) is the *inside* element, and the face normal points from inside
/// to outside. Each interior face appears exactly once in the face list,
/// which is what makes single-visit skeleton assembly sound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Face {
    vertices: Vec<usize>,
    inside: usize,
    inside_facet: usize,
    outside: Option<(usize, usize)>,
}

impl Face {
    /// Global vertex indices of the face, in canonical (sorted) order.
    ///
    /// Both adjacent elements parametrize the face through this same list,
    /// so quadrature points embedded on either side coincide physically.
    pub fn vertices(&self) -> &[usize] {
        &self.vertices
    }

    /// The inside element.
    pub fn inside(&self) -> usize {
        self.inside
    }

    /// The local facet index of the face within the inside element, i.e.
    /// the local index of the opposite vertex.
    pub fn inside_facet(&self) -> usize {
        self.inside_facet
    }

    /// The outside element and its local facet index, if the face is
    /// interior.
    pub fn outside(&self) -> Option<(usize, usize)> {
        self.outside
    }

    pub fn is_boundary(&self) -> bool {
        self.outside.is_none()
    }
}

/// Geometry of an affine simplex element.
#[derive(Debug, Clone)]
pub struct ElementGeometry<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Jacobian of the reference-to-physical map.
    pub jacobian: OMatrix<T, D, D>,
    /// Transposed inverse Jacobian, mapping reference gradients to physical
    /// gradients.
    pub jacobian_inv_t: OMatrix<T, D, D>,
    /// Physical element volume.
    pub volume: T,
}

/// Geometry of a mesh face.
#[derive(Debug, Clone)]
pub struct FaceGeometry<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Unit outer normal with respect to the inside element.
    pub normal: OVector<T, D>,
    /// Physical face measure (length in 2D, area in 3D).
    pub measure: T,
    /// Face diameter (largest pairwise corner distance).
    pub diameter: T,
}

/// A conforming mesh of `D`-simplices.
#[derive(Debug, Clone)]
pub struct SimplexMesh<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    vertices: Vec<OPoint<T, D>>,
    connectivity: Vec<usize>,
    faces: Vec<Face>,
    vertex_to_elements: Vec<Vec<usize>>,
    element_to_faces: Vec<Vec<usize>>,
}

impl<T, D> SimplexMesh<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    /// Constructs a mesh from vertices and flat `(D + 1)`-strided element
    /// connectivity, enumerating faces and adjacency tables.
    ///
    /// Fails on malformed connectivity (wrong stride, out-of-bounds vertex
    /// indices, or a facet shared by more than two elements).
    pub fn from_vertices_and_connectivity(
        vertices: Vec<OPoint<T, D>>,
        connectivity: Vec<usize>,
    ) -> eyre::Result<Self> {
        let verts_per_element = D::dim() + 1;
        if connectivity.len() % verts_per_element != 0 {
            return Err(eyre!(
                "connectivity length {} is not a multiple of {} vertices per element",
                connectivity.len(),
                verts_per_element
            ));
        }
        if let Some(&v) = connectivity.iter().find(|&&v| v >= vertices.len()) {
            return Err(eyre!(
                "connectivity references vertex {v}, but the mesh has only {} vertices",
                vertices.len()
            ));
        }
        let num_elements = connectivity.len() / verts_per_element;

        let mut faces: Vec<Face> = Vec::new();
        let mut facet_map: FxHashMap<Vec<usize>, usize> = FxHashMap::default();
        let mut element_to_faces = vec![Vec::with_capacity(verts_per_element); num_elements];
        for element in 0..num_elements {
            let conn = &connectivity[element * verts_per_element..(element + 1) * verts_per_element];
            for facet in 0..verts_per_element {
                let mut key: Vec<usize> = conn
                    .iter()
                    .enumerate()
                    .filter(|&(local, _)| local != facet)
                    .map(|(_, &v)| v)
                    .collect();
                key.sort_unstable();
                match facet_map.get(&key) {
                    Some(&face_index) => {
                        let face = &mut faces[face_index];
                        if face.outside.is_some() {
                            return Err(eyre!(
                                "facet {key:?} is shared by more than two elements"
                            ));
                        }
                        face.outside = Some((element, facet));
                        element_to_faces[element].push(face_index);
                    }
                    None => {
                        let face_index = faces.len();
                        facet_map.insert(key.clone(), face_index);
                        faces.push(Face {
                            vertices: key,
                            inside: element,
                            inside_facet: facet,
                            outside: None,
                        });
                        element_to_faces[element].push(face_index);
                    }
                }
            }
        }

        let mut vertex_to_elements = vec![Vec::new(); vertices.len()];
        for element in 0..num_elements {
            for &v in &connectivity[element * verts_per_element..(element + 1) * verts_per_element]
            {
                vertex_to_elements[v].push(element);
            }
        }

        Ok(Self {
            vertices,
            connectivity,
            faces,
            vertex_to_elements,
            element_to_faces,
        })
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.len() / (D::dim() + 1)
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[OPoint<T, D>] {
        &self.vertices
    }

    /// Global vertex indices of the given element.
    pub fn element_vertex_indices(&self, element: usize) -> &[usize] {
        let n = D::dim() + 1;
        &self.connectivity[element * n..(element + 1) * n]
    }

    /// The `local`-th corner of the given element.
    pub fn element_vertex(&self, element: usize, local: usize) -> &OPoint<T, D> {
        &self.vertices[self.element_vertex_indices(element)[local]]
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn face(&self, face: usize) -> &Face {
        &self.faces[face]
    }

    /// Indices of the faces bounding the given element.
    pub fn element_faces(&self, element: usize) -> &[usize] {
        &self.element_to_faces[element]
    }

    /// Elements incident to the given vertex.
    pub fn vertex_elements(&self, vertex: usize) -> &[usize] {
        &self.vertex_to_elements[vertex]
    }

    /// Geometry of the affine reference-to-physical map of an element.
    pub fn element_geometry(&self, element: usize) -> eyre::Result<ElementGeometry<T, D>> {
        let v0 = self.element_vertex(element, 0).clone();
        let mut jacobian = OMatrix::<T, D, D>::zeros();
        for k in 0..D::dim() {
            let edge = self.element_vertex(element, k + 1) - &v0;
            jacobian.set_column(k, &edge);
        }
        let volume = jacobian.determinant().abs()
            / T::from_usize(factorial(D::dim())).expect("factorial must fit in T");
        let jacobian_inv_t = jacobian
            .clone()
            .try_inverse()
            .ok_or_else(|| eyre!("singular element Jacobian encountered (element {element})"))?
            .transpose();
        Ok(ElementGeometry {
            jacobian,
            jacobian_inv_t,
            volume,
        })
    }

    /// Maps reference coordinates of an element to physical coordinates.
    pub fn map_element_reference_coords(&self, element: usize, xi: &OPoint<T, D>) -> OPoint<T, D> {
        let v0 = self.element_vertex(element, 0);
        let mut x = v0.coords.clone();
        for k in 0..D::dim() {
            let edge = self.element_vertex(element, k + 1) - v0;
            x += edge * xi[k];
        }
        OPoint::from(x)
    }

    /// Geometry of a face: outer normal (w.r.t. the inside element),
    /// physical measure and diameter.
    pub fn face_geometry(&self, face: usize) -> eyre::Result<FaceGeometry<T, D>> {
        let face = &self.faces[face];
        let corners: Vec<&OPoint<T, D>> = face.vertices.iter().map(|&v| &self.vertices[v]).collect();

        // Measure from the Gram determinant of the spanning edges.
        let d = D::dim();
        let mut edges = DMatrix::<T>::zeros(d, d - 1);
        for j in 1..d {
            let edge = corners[j] - corners[0];
            for r in 0..d {
                edges[(r, j - 1)] = edge[r];
            }
        }
        let gram = edges.transpose() * &edges;
        let measure = gram.determinant().abs().sqrt()
            / T::from_usize(factorial(d - 1)).expect("factorial must fit in T");

        let mut diameter = T::zero();
        for i in 0..corners.len() {
            for j in (i + 1)..corners.len() {
                diameter = diameter.max((corners[i] - corners[j]).norm());
            }
        }

        // The outer normal is the negated physical gradient of the
        // barycentric coordinate of the opposite vertex.
        let inside_geometry = self.element_geometry(face.inside)?;
        let gradient =
            &inside_geometry.jacobian_inv_t * barycentric_gradient::<T, D>(face.inside_facet);
        let gradient_norm = gradient.norm();
        let normal = -gradient / gradient_norm;

        Ok(FaceGeometry {
            normal,
            measure,
            diameter,
        })
    }

    /// Reference coordinates of the face vertices within one adjacent
    /// element, in the face's canonical vertex order.
    ///
    /// Combined with a barycentric quadrature point, this parametrizes the
    /// face in the element's reference simplex; using the same canonical
    /// order on both sides of an interior face makes the embedded points
    /// coincide physically.
    pub fn face_vertex_coords_in_element(
        &self,
        face: usize,
        element: usize,
    ) -> Vec<OPoint<T, D>> {
        let element_vertices = self.element_vertex_indices(element);
        self.faces[face]
            .vertices
            .iter()
            .map(|v| {
                let local = element_vertices
                    .iter()
                    .position(|ev| ev == v)
                    .expect("face vertex must belong to the adjacent element");
                reference_simplex_vertex::<T, D>(local)
            })
            .collect()
    }

    /// Finds an element containing the given point by barycentric test.
    ///
    /// Linear scan; intended for one-off queries such as seeding an element
    /// patch at a dipole position.
    pub fn find_element_containing(&self, position: &OPoint<T, D>) -> eyre::Result<usize> {
        let tolerance = T::from_f64(1e-10).expect("Literal must fit in T");
        for element in 0..self.num_elements() {
            let geometry = self.element_geometry(element)?;
            let v0 = self.element_vertex(element, 0);
            let xi = geometry.jacobian_inv_t.transpose() * (position - v0);
            let mut lambda_0 = T::one();
            let mut inside = true;
            for k in 0..D::dim() {
                lambda_0 -= xi[k];
                inside &= xi[k] >= -tolerance;
            }
            if inside && lambda_0 >= -tolerance {
                return Ok(element);
            }
        }
        Err(eyre!("no element contains the given position"))
    }
}

/// The `local`-th vertex of the reference simplex: the origin for index 0,
/// otherwise the unit vector along axis `local - 1`.
pub fn reference_simplex_vertex<T, D>(local: usize) -> OPoint<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    let mut coords = OVector::<T, D>::zeros();
    if local > 0 {
        coords[local - 1] = T::one();
    }
    OPoint::from(coords)
}

/// The centroid of the reference simplex, used to evaluate coefficients that
/// are constant per element.
pub fn reference_simplex_center<T, D>() -> OPoint<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    let weight = T::one() / T::from_usize(D::dim() + 1).expect("dimension must fit in T");
    OPoint::from(OVector::<T, D>::repeat(weight))
}

/// Affine combination of face vertex coordinates with barycentric weights,
/// embedding a face quadrature point into an element's reference simplex.
pub fn embed_face_point<T, D>(face_vertex_coords: &[OPoint<T, D>], barycentric: &[T]) -> OPoint<T, D>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    assert_eq!(face_vertex_coords.len(), barycentric.len());
    let mut x = OVector::<T, D>::zeros();
    for (coords, &weight) in face_vertex_coords.iter().zip(barycentric) {
        x += &coords.coords * weight;
    }
    OPoint::from(x)
}

fn factorial(n: usize) -> usize {
    (1..=n).product()
}
