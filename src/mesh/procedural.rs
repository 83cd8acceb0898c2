//! Procedurally generated meshes for tests and small studies.

use crate::allocators::DimAllocator;
use crate::mesh::SimplexMesh;
use crate::Real;
use nalgebra::{DefaultAllocator, OPoint, Point2, Point3, U2, U3};

/// Creates a triangulation of the unit square `[0, 1]^2` with `cells_per_axis`
/// cells in each direction, each grid cell split along its diagonal into two
/// triangles (`2 * cells_per_axis^2` elements in total).
///
/// # Panics
///
/// Panics if `cells_per_axis == 0`.
pub fn create_unit_square_uniform_tri_mesh_2d<T>(cells_per_axis: usize) -> SimplexMesh<T, U2>
where
    T: Real,
    DefaultAllocator: DimAllocator<T, U2>,
{
    assert!(cells_per_axis > 0, "must have at least one cell per axis");
    let n = cells_per_axis;
    let coordinate =
        |i: usize| T::from_f64(i as f64 / n as f64).expect("Grid coordinate must fit in T");

    let mut vertices: Vec<OPoint<T, U2>> = Vec::with_capacity((n + 1) * (n + 1));
    for j in 0..=n {
        for i in 0..=n {
            vertices.push(Point2::new(coordinate(i), coordinate(j)));
        }
    }

    let vertex_index = |i: usize, j: usize| j * (n + 1) + i;
    let mut connectivity = Vec::with_capacity(6 * n * n);
    for j in 0..n {
        for i in 0..n {
            let a = vertex_index(i, j);
            let b = vertex_index(i + 1, j);
            let c = vertex_index(i + 1, j + 1);
            let d = vertex_index(i, j + 1);
            connectivity.extend_from_slice(&[a, b, c]);
            connectivity.extend_from_slice(&[a, c, d]);
        }
    }

    SimplexMesh::from_vertices_and_connectivity(vertices, connectivity)
        .expect("procedurally generated connectivity is valid")
}

/// Creates a tetrahedralization of the unit cube `[0, 1]^3` with
/// `cells_per_axis` cells in each direction, each grid cell split into six
/// tetrahedra by the Kuhn subdivision (`6 * cells_per_axis^3` elements).
///
/// The Kuhn subdivision is conforming across cells, so the resulting mesh
/// has matching faces everywhere.
///
/// # Panics
///
/// Panics if `cells_per_axis == 0`.
pub fn create_unit_cube_uniform_tet_mesh_3d<T>(cells_per_axis: usize) -> SimplexMesh<T, U3>
where
    T: Real,
    DefaultAllocator: DimAllocator<T, U3>,
{
    assert!(cells_per_axis > 0, "must have at least one cell per axis");
    let n = cells_per_axis;
    let coordinate =
        |i: usize| T::from_f64(i as f64 / n as f64).expect("Grid coordinate must fit in T");

    let mut vertices: Vec<OPoint<T, U3>> = Vec::with_capacity((n + 1).pow(3));
    for k in 0..=n {
        for j in 0..=n {
            for i in 0..=n {
                vertices.push(Point3::new(coordinate(i), coordinate(j), coordinate(k)));
            }
        }
    }

    let vertex_index = |i: usize, j: usize, k: usize| (k * (n + 1) + j) * (n + 1) + i;
    // One tetrahedron per axis permutation: walk from the cell's lower corner
    // to its upper corner one axis step at a time.
    const PERMUTATIONS: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let mut connectivity = Vec::with_capacity(24 * n * n * n);
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                for permutation in &PERMUTATIONS {
                    let mut corner = [i, j, k];
                    connectivity.push(vertex_index(corner[0], corner[1], corner[2]));
                    for &axis in permutation {
                        corner[axis] += 1;
                        connectivity.push(vertex_index(corner[0], corner[1], corner[2]));
                    }
                }
            }
        }
    }

    SimplexMesh::from_vertices_and_connectivity(vertices, connectivity)
        .expect("procedurally generated connectivity is valid")
}
