//! Forward-problem kernels for bioelectric and biomagnetic simulation
//! (EEG/MEG/tDCS) on finite-element head models.
//!
//! The centerpiece is a discontinuous Galerkin discretization of the
//! convection-diffusion equation
//!
//! $$ \nabla \cdot (-A(x) \nabla u + b(x) u) + c(x) u = f $$
//!
//! with the S(W)IPG, N(W)IPG and OBB schemes, assembled over simplex meshes
//! into sparse systems that are solved once and reused across many
//! right-hand sides (one per dipole or electrode).

use nalgebra::{DimMin, DimName, RealField};

pub mod allocators;
pub mod assembly;
pub mod element;
pub mod error;
pub mod mesh;
pub mod patch;
pub mod problem;
pub mod quadrature;
pub mod solver;
pub mod space;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// The scalar type used throughout the crate.
///
/// Unlike `nalgebra`'s `RealField`, scalars are additionally required to be
/// `Copy`, which considerably simplifies the numerical kernels.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// A small, fixed-size spatial dimension.
///
/// Used as a trait alias for the bounds frequently needed by generic
/// `neurofem` routines (square-matrix inversion in particular).
pub trait SmallDim: DimName + DimMin<Self, Output = Self> {}

impl<D> SmallDim for D where D: DimName + DimMin<Self, Output = Self> {}
