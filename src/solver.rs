//! Stationary linear-problem solving with a lazily built, shared Jacobian.
//!
//! Transfer-matrix computations solve the same linear system for many right
//! hand sides, one per dipole or electrode, from concurrent worker threads.
//! [`ThreadSafeStationarySolver`] assembles the Jacobian exactly once under a
//! mutex and shares it read-only afterwards; the solve path itself takes no
//! lock.

use crate::Real;
use eyre::eyre;
use nalgebra::DVector;
use nalgebra_sparse::{CsrMatrix, SparseEntry, SparseEntryMut};
use numeric_literals::replace_float_literals;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// The sparsity pattern of the assembled matrix is not symmetric.
///
/// A DG discretization always couples both sides of a face, so an
/// asymmetric pattern signals a modeling or assembly bug.
#[derive(Debug, Error)]
#[error("sparsity pattern is not symmetric: entry ({row}, {col}) has no transposed counterpart")]
pub struct UnsymmetricMatrixError {
    pub row: usize,
    pub col: usize,
}

/// A matrix entry failed a validity predicate (e.g. the NaN check).
#[derive(Debug, Error)]
#[error("illegal entry found at ({row}, {col}): {value}")]
pub struct IllegalEntryError {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Largest absolute deviation from symmetry of an assembled matrix.
#[derive(Debug, Clone, Copy)]
pub struct SymmetryStatistics<T> {
    pub max_absolute_difference: T,
    pub row: usize,
    pub col: usize,
}

impl<T: Real> SymmetryStatistics<T> {
    /// Computes the symmetry statistics of a matrix.
    ///
    /// Fails with [`UnsymmetricMatrixError`] if the sparsity pattern itself
    /// is asymmetric.
    pub fn compute(matrix: &CsrMatrix<T>) -> Result<Self, UnsymmetricMatrixError> {
        let mut statistics = SymmetryStatistics {
            max_absolute_difference: T::zero(),
            row: 0,
            col: 0,
        };
        for (row, col, &value) in matrix.triplet_iter() {
            let transposed = match matrix.get_entry(col, row) {
                Some(SparseEntry::NonZero(&other)) => other,
                _ => return Err(UnsymmetricMatrixError { row, col }),
            };
            let difference = (value - transposed).abs();
            if difference > statistics.max_absolute_difference {
                statistics.max_absolute_difference = difference;
                statistics.row = row;
                statistics.col = col;
            }
        }
        Ok(statistics)
    }
}

/// Checks every stored entry of the matrix against a predicate.
pub fn assert_each_entry<T: Real>(
    matrix: &CsrMatrix<T>,
    predicate: impl Fn(T) -> bool,
) -> Result<(), IllegalEntryError> {
    for (row, col, &value) in matrix.triplet_iter() {
        if !predicate(value) {
            return Err(IllegalEntryError {
                row,
                col,
                value: value.to_subset().unwrap_or(f64::NAN),
            });
        }
    }
    Ok(())
}

/// Zeroes the first row and column of the matrix and sets the diagonal
/// entry to `value`, pinning the first degree of freedom.
///
/// Used to remove the rank deficiency of pure-Neumann problems, whose
/// operators annihilate constants.
pub fn fix_first_dof<T: Real>(matrix: &mut CsrMatrix<T>, value: T) {
    let mut row = matrix.row_mut(0);
    let (cols, values) = row.cols_and_values_mut();
    for (&col, entry) in cols.iter().zip(values) {
        *entry = if col == 0 { value } else { T::zero() };
    }
    for row in 1..matrix.nrows() {
        if let Some(SparseEntryMut::NonZero(entry)) = matrix.get_entry_mut(row, 0) {
            *entry = T::zero();
        }
    }
}

/// Convergence report of one linear solve.
#[derive(Debug, Clone, Copy)]
pub struct LinearSolverStats<T> {
    pub iterations: usize,
    pub converged: bool,
    /// Achieved `|r| / |r_0|`.
    pub residual_reduction: T,
}

/// A backend that solves `A z = r` to a relative residual reduction.
///
/// The iteration cap of the backend is the only bounded-retry mechanism in
/// a solve; there are no timeouts.
pub trait LinearSolver<T: Real> {
    fn solve(
        &self,
        matrix: &CsrMatrix<T>,
        solution: &mut DVector<T>,
        rhs: &DVector<T>,
        reduction: T,
    ) -> eyre::Result<LinearSolverStats<T>>;
}

/// Conjugate gradients with an optional Jacobi preconditioner, for the
/// symmetric positive definite systems produced by the SIPG scheme.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    max_iterations: usize,
    use_jacobi_preconditioner: bool,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            use_jacobi_preconditioner: true,
        }
    }
}

impl ConjugateGradient {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_jacobi_preconditioner(mut self, enabled: bool) -> Self {
        self.use_jacobi_preconditioner = enabled;
        self
    }
}

impl<T: Real> LinearSolver<T> for ConjugateGradient {
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    fn solve(
        &self,
        matrix: &CsrMatrix<T>,
        solution: &mut DVector<T>,
        rhs: &DVector<T>,
        reduction: T,
    ) -> eyre::Result<LinearSolverStats<T>> {
        let n = rhs.len();
        if matrix.nrows() != n || matrix.ncols() != n {
            return Err(eyre!(
                "matrix dimensions {}x{} do not match right-hand side length {n}",
                matrix.nrows(),
                matrix.ncols()
            ));
        }
        solution.resize_vertically_mut(n, T::zero());
        solution.fill(T::zero());

        let rhs_norm = rhs.norm();
        if rhs_norm <= 1e-25 {
            return Ok(LinearSolverStats {
                iterations: 0,
                converged: true,
                residual_reduction: T::zero(),
            });
        }

        // Inverse diagonal as the (optional) Jacobi preconditioner.
        let inverse_diagonal: Option<DVector<T>> = if self.use_jacobi_preconditioner {
            let mut diag = DVector::zeros(n);
            for i in 0..n {
                let entry = match matrix.get_entry(i, i) {
                    Some(SparseEntry::NonZero(&value)) => value,
                    _ => T::zero(),
                };
                if entry.abs() <= 1e-30 {
                    return Err(eyre!(
                        "Jacobi preconditioner requires nonzero diagonal (row {i})"
                    ));
                }
                diag[i] = T::one() / entry;
            }
            Some(diag)
        } else {
            None
        };
        let precondition = |r: &DVector<T>| match &inverse_diagonal {
            Some(diag) => r.component_mul(diag),
            None => r.clone(),
        };

        let mut residual = rhs.clone();
        let mut z = precondition(&residual);
        let mut direction = z.clone();
        let mut rho = residual.dot(&z);

        let mut iterations = 0;
        let mut converged = false;
        let mut residual_norm = rhs_norm;
        while iterations < self.max_iterations {
            let a_direction = matrix * &direction;
            let curvature = direction.dot(&a_direction);
            if curvature.abs() <= 1e-30 {
                break;
            }
            let step = rho / curvature;
            solution.axpy(step, &direction, T::one());
            residual.axpy(-step, &a_direction, T::one());

            residual_norm = residual.norm();
            iterations += 1;
            if residual_norm <= reduction * rhs_norm {
                converged = true;
                break;
            }

            z = precondition(&residual);
            let rho_next = residual.dot(&z);
            let beta = rho_next / rho;
            rho = rho_next;
            direction = &z + &direction * beta;
        }

        Ok(LinearSolverStats {
            iterations,
            converged,
            residual_reduction: residual_norm / rhs_norm,
        })
    }
}

/// Something that can produce the assembled Jacobian of a linear system.
pub trait SystemAssembler<T: Real> {
    fn assemble_jacobian(&self) -> eyre::Result<CsrMatrix<T>>;
}

/// Configuration of the stationary solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de> + Real"))]
pub struct StationarySolverConfig<T> {
    /// Relative defect reduction passed to the linear solver.
    pub reduction: T,
    /// Pin the first degree of freedom (for pure-Neumann problems).
    pub fix_dof: bool,
    /// Diagonal value written when pinning the first degree of freedom.
    pub fixed_dof_entry: T,
    pub verbosity: u32,
    /// Run symmetry and NaN diagnostics after assembly.
    pub debug: bool,
}

impl<T: Real> Default for StationarySolverConfig<T> {
    fn default() -> Self {
        Self {
            reduction: T::from_f64(1e-10).expect("Literal must fit in T"),
            fix_dof: false,
            fixed_dof_entry: T::one(),
            verbosity: 1,
            debug: false,
        }
    }
}

/// Per-call report of [`ThreadSafeStationarySolver::apply`].
#[derive(Debug, Clone, Copy)]
pub struct SolveStats<T> {
    /// Whether this call built the Jacobian.
    pub assembled: bool,
    pub linear_solver: LinearSolverStats<T>,
}

/// Solves stationary linear problems, building the Jacobian once and
/// sharing it across concurrent [`apply`](Self::apply) calls.
///
/// The first caller assembles under a mutex (double-checked: presence is
/// only tested with the lock held); afterwards the matrix is immutable and
/// shared through an [`Arc`], so concurrent solves with their own vectors
/// proceed without synchronization. Rebuilding must be requested explicitly
/// through [`discard_matrix`](Self::discard_matrix) when the operator
/// coefficients change; nothing is invalidated implicitly.
#[derive(Debug)]
pub struct ThreadSafeStationarySolver<T: Real> {
    config: StationarySolverConfig<T>,
    jacobian: Mutex<Option<Arc<CsrMatrix<T>>>>,
    build_count: AtomicUsize,
}

impl<T: Real + num_traits::float::FloatCore> ThreadSafeStationarySolver<T> {
    pub fn new(config: StationarySolverConfig<T>) -> Self {
        Self {
            config,
            jacobian: Mutex::new(None),
            build_count: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &StationarySolverConfig<T> {
        &self.config
    }

    /// How many times the Jacobian has been (re)built.
    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }

    /// Drops the cached Jacobian; the next [`apply`](Self::apply) call
    /// rebuilds it.
    pub fn discard_matrix(&self) {
        *self.jacobian.lock() = None;
    }

    /// Refines `x` towards the solution of `J x = rhs`: computes the defect
    /// `d = J x - rhs`, solves `J z = d` with the supplied backend to the
    /// configured reduction and updates `x -= z`.
    ///
    /// Builds and caches the Jacobian if none exists. Any number of threads
    /// may call this concurrently, each with its own `x` and `rhs`.
    pub fn apply<A, S>(
        &self,
        assembler: &A,
        linear_solver: &S,
        x: &mut DVector<T>,
        rhs: &DVector<T>,
    ) -> eyre::Result<SolveStats<T>>
    where
        A: SystemAssembler<T>,
        S: LinearSolver<T>,
    {
        let (jacobian, assembled) = {
            let mut guard = self.jacobian.lock();
            match &*guard {
                Some(matrix) => (Arc::clone(matrix), false),
                None => {
                    if self.config.verbosity >= 1 {
                        log::info!(
                            "thread {:?} creates the Jacobian",
                            std::thread::current().id()
                        );
                    }
                    let mut matrix = assembler.assemble_jacobian()?;
                    if self.config.fix_dof {
                        fix_first_dof(&mut matrix, self.config.fixed_dof_entry);
                    }
                    if self.config.debug {
                        let statistics = SymmetryStatistics::compute(&matrix)?;
                        log::info!(
                            "symmetry statistics: maximal absolute difference {:?} at ({}, {})",
                            statistics.max_absolute_difference,
                            statistics.row,
                            statistics.col
                        );
                        if let Err(error) = assert_each_entry(&matrix, |v| !v.is_nan()) {
                            log::error!("illegal entry found: {error}");
                        }
                    }
                    self.build_count.fetch_add(1, Ordering::SeqCst);
                    let matrix = Arc::new(matrix);
                    *guard = Some(Arc::clone(&matrix));
                    (matrix, true)
                }
            }
        };

        // The matrix is immutable from here on; no lock is needed.
        let mut defect = &*jacobian * &*x;
        defect -= rhs;
        let mut correction = DVector::zeros(x.len());
        let stats = linear_solver.solve(&jacobian, &mut correction, &defect, self.config.reduction)?;
        if self.config.verbosity >= 2 {
            log::debug!(
                "linear solver iterations: {}, converged: {}",
                stats.iterations,
                stats.converged
            );
        }
        *x -= correction;

        Ok(SolveStats {
            assembled,
            linear_solver: stats,
        })
    }

    /// Solves many independent right-hand sides in parallel, sharing the one
    /// Jacobian (the per-dipole transfer-matrix pattern).
    pub fn solve_columns<A, S>(
        &self,
        assembler: &A,
        linear_solver: &S,
        solutions: &mut [DVector<T>],
        right_hand_sides: &[DVector<T>],
    ) -> eyre::Result<Vec<SolveStats<T>>>
    where
        T: Send + Sync,
        A: SystemAssembler<T> + Sync,
        S: LinearSolver<T> + Sync,
    {
        assert_eq!(
            solutions.len(),
            right_hand_sides.len(),
            "one solution vector per right-hand side"
        );
        solutions
            .par_iter_mut()
            .zip(right_hand_sides.par_iter())
            .map(|(x, rhs)| self.apply(assembler, linear_solver, x, rhs))
            .collect()
    }
}
