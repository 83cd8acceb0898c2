//! Interior-penalty weighting strategies.

use crate::Real;
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Whether face fluxes are averaged with heterogeneity-aware harmonic
/// weights or plain arithmetic (0.5/0.5) weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluxWeighting {
    /// Harmonic-average weighting after Ern, Stephansen & Zunino.
    On,
    /// Arithmetic averaging; the penalty scales with `alpha / h` alone.
    Off,
}

impl FromStr for FluxWeighting {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(FluxWeighting::On),
            "off" => Ok(FluxWeighting::Off),
            _ => Err(eyre::eyre!("unknown weighting \"{s}\" (expected on/off)")),
        }
    }
}

/// Flux weights and penalty for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceWeights<T> {
    pub omega_inside: T,
    pub omega_outside: T,
    pub penalty_factor: T,
}

/// Computes flux weights and the interior-penalty factor of a face.
///
/// Implementations must be deterministic and side-effect-free; the DG
/// operator calls them once per face, outside the quadrature loop.
pub trait PenaltyWeighting<T: Real> {
    /// Weights and penalty on an interior face.
    ///
    /// `delta_inside`/`delta_outside` are the one-sided normal diffusivities
    /// `(A n) . n`; `degree` is the larger polynomial degree of the two
    /// adjacent elements.
    fn skeleton_weights(
        &self,
        delta_inside: T,
        delta_outside: T,
        degree: usize,
        dim: usize,
        h_face: T,
    ) -> FaceWeights<T>;

    /// Penalty factor on a boundary face.
    fn boundary_penalty(&self, delta_inside: T, degree: usize, dim: usize, h_face: T) -> T;
}

/// The weighting of the S(W)IPG/N(W)IPG family: harmonic-average weights
/// with a penalty scaling as the averaged normal diffusivity, or plain
/// arithmetic weights with unit average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwipgWeighting<T> {
    pub alpha: T,
    pub weighting: FluxWeighting,
}

impl<T: Real> SwipgWeighting<T> {
    pub fn new(alpha: T, weighting: FluxWeighting) -> Self {
        Self { alpha, weighting }
    }

    /// The degree-dependent part of the penalty scaling.
    fn degree_factor(degree: usize, dim: usize) -> T {
        T::from_usize(degree * (degree + dim - 1)).expect("degree factor must fit in T")
    }
}

impl<T: Real> PenaltyWeighting<T> for SwipgWeighting<T> {
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    fn skeleton_weights(
        &self,
        delta_inside: T,
        delta_outside: T,
        degree: usize,
        dim: usize,
        h_face: T,
    ) -> FaceWeights<T> {
        let (omega_inside, omega_outside, harmonic_average) = match self.weighting {
            FluxWeighting::On => {
                // The 1e-20 floor keeps the weights finite for (near-)zero
                // normal diffusivity; it is a stability guard, not a
                // physical parameter.
                let total = delta_inside + delta_outside + 1e-20;
                (
                    delta_outside / total,
                    delta_inside / total,
                    2.0 * delta_inside * delta_outside / total,
                )
            }
            FluxWeighting::Off => (0.5, 0.5, 1.0),
        };
        let penalty_factor =
            (self.alpha / h_face) * harmonic_average * Self::degree_factor(degree, dim);
        FaceWeights {
            omega_inside,
            omega_outside,
            penalty_factor,
        }
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    fn boundary_penalty(&self, delta_inside: T, degree: usize, dim: usize, h_face: T) -> T {
        let harmonic_average = match self.weighting {
            FluxWeighting::On => delta_inside,
            FluxWeighting::Off => 1.0,
        };
        (self.alpha / h_face) * harmonic_average * Self::degree_factor(degree, dim)
    }
}
