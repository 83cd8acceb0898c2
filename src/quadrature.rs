//! Quadrature rules for reference simplices.
//!
//! Rules are stored in barycentric coordinates with weights normalized to
//! sum to one. This makes the same rule usable both for element (volume)
//! integrals, by mapping barycentric coordinates onto the reference simplex,
//! and for face (skeleton/boundary) integrals, by mapping them onto the face
//! vertex parametrizations of the two adjacent elements. Integrals are then
//! approximated as `measure * sum_q w_q f(x_q)`.

use crate::Real;

pub mod univariate;

use univariate::gauss_legendre;

/// A quadrature rule over a `d`-dimensional reference simplex.
///
/// Weights sum to one; points are barycentric coordinate tuples of length
/// `d + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimplexRule<T> {
    weights: Vec<T>,
    points: Vec<Vec<T>>,
    simplex_dim: usize,
}

impl<T: Real> SimplexRule<T> {
    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// Barycentric coordinates of the quadrature points, each of length
    /// `simplex_dim() + 1`.
    pub fn points(&self) -> &[Vec<T>] {
        &self.points
    }

    pub fn simplex_dim(&self) -> usize {
        self.simplex_dim
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Constructs a quadrature rule on the `simplex_dim`-dimensional reference
/// simplex that integrates polynomials of total degree `order` exactly.
///
/// The rule is a collapsed (Duffy) tensor product of Gauss-Legendre rules,
/// so all weights are positive and any `order` is admissible. Supported
/// simplex dimensions are 0 through 3.
///
/// # Panics
///
/// Panics if `simplex_dim > 3`.
pub fn simplex_quadrature<T: Real>(simplex_dim: usize, order: usize) -> SimplexRule<T> {
    assert!(simplex_dim <= 3, "unsupported simplex dimension {simplex_dim}");

    if simplex_dim == 0 {
        return SimplexRule {
            weights: vec![T::one()],
            points: vec![vec![T::one()]],
            simplex_dim,
        };
    }

    // Per direction we need exactness up to degree `order + simplex_dim - 1`
    // to absorb the collapse Jacobian, i.e. n points with 2n - 1 at least
    // that large.
    let points_per_dir = (order + simplex_dim + 1) / 2;
    let (w1, x1) = gauss_legendre::<f64>(points_per_dir.max(1));

    let mut weights = Vec::new();
    let mut points = Vec::new();
    let mut raw_sum = 0.0;
    let mut tuple = vec![0usize; simplex_dim];
    loop {
        // Collapse the tensor point onto the simplex:
        //   xi_k = t_k * prod_{j<k} (1 - t_j),
        // with Jacobian prod_j (1 - t_j)^(simplex_dim - 1 - j).
        let mut w = 1.0;
        let mut shrink = 1.0;
        let mut xi = Vec::with_capacity(simplex_dim);
        for (k, &i) in tuple.iter().enumerate() {
            let t = x1[i];
            xi.push(t * shrink);
            w *= w1[i] * (1.0 - t).powi((simplex_dim - 1 - k) as i32);
            shrink *= 1.0 - t;
        }
        let lambda_0 = 1.0 - xi.iter().sum::<f64>();
        let mut bary = Vec::with_capacity(simplex_dim + 1);
        bary.push(lambda_0);
        bary.extend_from_slice(&xi);

        raw_sum += w;
        weights.push(w);
        points.push(bary);

        // Advance the mixed-radix tuple.
        let mut k = 0;
        loop {
            tuple[k] += 1;
            if tuple[k] < points_per_dir.max(1) {
                break;
            }
            tuple[k] = 0;
            k += 1;
            if k == simplex_dim {
                break;
            }
        }
        if k == simplex_dim {
            break;
        }
    }

    // Normalize so that weights sum to one.
    let weights = weights
        .into_iter()
        .map(|w| T::from_f64(w / raw_sum).expect("Weight must fit in T"))
        .collect();
    let points = points
        .into_iter()
        .map(|bary| {
            bary.into_iter()
                .map(|b| T::from_f64(b).expect("Point must fit in T"))
                .collect()
        })
        .collect();

    SimplexRule {
        weights,
        points,
        simplex_dim,
    }
}
