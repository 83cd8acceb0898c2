//! Assembly of global sparse matrices and residual vectors from the local
//! DG kernels.

use crate::allocators::DimAllocator;
use crate::assembly::edge_norm::EdgeNormProvider;
use crate::assembly::local::{
    ConvectionDiffusionDgOperator, PenaltyWeighting, SkeletonStats,
};
use crate::problem::ConvectionDiffusionProblem;
use crate::solver::SystemAssembler;
use crate::space::DgSpace;
use crate::{Real, SmallDim};
use eyre::eyre;
use nalgebra::{DMatrix, DMatrixSliceMut, DVector, DefaultAllocator};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::{CsrMatrix, SparseEntryMut};
use std::cell::RefCell;
use std::collections::BTreeSet;

/// An assembler for CSR matrices and residual vectors of DG systems.
///
/// Interior faces are visited exactly once, in the orientation stored by the
/// mesh, so skeleton contributions are never double counted. The assembler
/// keeps its scratch buffers between calls; it is cheap to reuse and must
/// not be shared across threads (each assembly thread owns its own).
#[derive(Debug)]
pub struct CsrDgAssembler<T: Real> {
    workspace: RefCell<CsrDgAssemblerWorkspace<T>>,
}

impl<T: Real> Default for CsrDgAssembler<T> {
    fn default() -> Self {
        Self {
            workspace: RefCell::new(CsrDgAssemblerWorkspace::default()),
        }
    }
}

#[derive(Debug)]
struct CsrDgAssemblerWorkspace<T: Real> {
    mat_ss: DMatrix<T>,
    mat_sn: DMatrix<T>,
    mat_ns: DMatrix<T>,
    mat_nn: DMatrix<T>,
    r_inside: DVector<T>,
    r_outside: DVector<T>,
}

impl<T: Real> Default for CsrDgAssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            mat_ss: DMatrix::zeros(0, 0),
            mat_sn: DMatrix::zeros(0, 0),
            mat_ns: DMatrix::zeros(0, 0),
            mat_nn: DMatrix::zeros(0, 0),
            r_inside: DVector::zeros(0),
            r_outside: DVector::zeros(0),
        }
    }
}

impl<T: Real> CsrDgAssembler<T> {
    /// Builds the sparsity pattern of the DG Jacobian: one dense diagonal
    /// block per element plus the four coupling blocks of every interior
    /// face.
    pub fn assemble_pattern<D>(&self, space: &DgSpace<T, D>) -> SparsityPattern
    where
        D: SmallDim,
        DefaultAllocator: DimAllocator<T, D>,
    {
        let n = space.dofs_per_element();
        let num_elements = space.num_elements();

        let mut block_columns: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); num_elements];
        for element in 0..num_elements {
            block_columns[element].insert(element);
        }
        for face in space.mesh().faces() {
            if let Some((outside, _)) = face.outside() {
                let inside = face.inside();
                block_columns[inside].insert(outside);
                block_columns[outside].insert(inside);
            }
        }

        let num_rows = space.num_dofs();
        let mut offsets = Vec::with_capacity(num_rows + 1);
        let mut indices = Vec::new();
        offsets.push(0);
        for row_block in 0..num_elements {
            for _ in 0..n {
                for &column_block in &block_columns[row_block] {
                    for j in 0..n {
                        indices.push(column_block * n + j);
                    }
                }
                offsets.push(indices.len());
            }
        }

        SparsityPattern::try_from_offsets_and_indices(num_rows, num_rows, offsets, indices)
            .expect("block pattern construction produces valid CSR data")
    }

    /// Assembles the DG Jacobian over all elements and faces.
    pub fn assemble_jacobian<D, P, E, W>(
        &self,
        space: &DgSpace<T, D>,
        operator: &ConvectionDiffusionDgOperator<T, D, P, E, W>,
    ) -> eyre::Result<(CsrMatrix<T>, SkeletonStats<T>)>
    where
        D: SmallDim,
        P: ConvectionDiffusionProblem<T, D>,
        E: EdgeNormProvider<T, D>,
        W: PenaltyWeighting<T>,
        T: num_traits::float::FloatCore,
        DefaultAllocator: DimAllocator<T, D>,
    {
        let pattern = self.assemble_pattern(space);
        let nnz = pattern.nnz();
        let mut matrix = CsrMatrix::try_from_pattern_and_values(pattern, vec![T::zero(); nnz])
            .map_err(|error| eyre!("failed to initialize CSR matrix: {error}"))?;
        let mut stats = SkeletonStats::new();
        let n = space.dofs_per_element();
        let ws = &mut *self.workspace.borrow_mut();

        for element in 0..space.num_elements() {
            ws.mat_ss.resize_mut(n, n, T::zero());
            ws.mat_ss.fill(T::zero());
            operator.volume_jacobian(space, element, DMatrixSliceMut::from(&mut ws.mat_ss))?;
            add_block_to_csr(&mut matrix, n, element, element, &ws.mat_ss);
        }

        for (face_index, face) in space.mesh().faces().iter().enumerate() {
            let inside = face.inside();
            match face.outside() {
                Some((outside, _)) => {
                    for mat in [&mut ws.mat_ss, &mut ws.mat_sn, &mut ws.mat_ns, &mut ws.mat_nn] {
                        mat.resize_mut(n, n, T::zero());
                        mat.fill(T::zero());
                    }
                    operator.skeleton_jacobian(
                        space,
                        face_index,
                        DMatrixSliceMut::from(&mut ws.mat_ss),
                        DMatrixSliceMut::from(&mut ws.mat_sn),
                        DMatrixSliceMut::from(&mut ws.mat_ns),
                        DMatrixSliceMut::from(&mut ws.mat_nn),
                        &mut stats,
                    )?;
                    add_block_to_csr(&mut matrix, n, inside, inside, &ws.mat_ss);
                    add_block_to_csr(&mut matrix, n, inside, outside, &ws.mat_sn);
                    add_block_to_csr(&mut matrix, n, outside, inside, &ws.mat_ns);
                    add_block_to_csr(&mut matrix, n, outside, outside, &ws.mat_nn);
                }
                None => {
                    ws.mat_ss.resize_mut(n, n, T::zero());
                    ws.mat_ss.fill(T::zero());
                    operator.boundary_jacobian(
                        space,
                        face_index,
                        DMatrixSliceMut::from(&mut ws.mat_ss),
                        &mut stats,
                    )?;
                    add_block_to_csr(&mut matrix, n, inside, inside, &ws.mat_ss);
                }
            }
        }

        Ok((matrix, stats))
    }

    /// Assembles the full DG residual (volume, skeleton, boundary and source
    /// contributions) at the given solution vector.
    pub fn assemble_residual<D, P, E, W>(
        &self,
        space: &DgSpace<T, D>,
        operator: &ConvectionDiffusionDgOperator<T, D, P, E, W>,
        u: &DVector<T>,
    ) -> eyre::Result<(DVector<T>, SkeletonStats<T>)>
    where
        D: SmallDim,
        P: ConvectionDiffusionProblem<T, D>,
        E: EdgeNormProvider<T, D>,
        W: PenaltyWeighting<T>,
        T: num_traits::float::FloatCore,
        DefaultAllocator: DimAllocator<T, D>,
    {
        assert_eq!(u.len(), space.num_dofs(), "solution vector length mismatch");
        let n = space.dofs_per_element();
        let mut residual = DVector::zeros(space.num_dofs());
        let mut stats = SkeletonStats::new();
        let ws = &mut *self.workspace.borrow_mut();

        for element in 0..space.num_elements() {
            operator.volume_residual(
                space,
                element,
                u.rows(element * n, n),
                residual.rows_mut(element * n, n),
            )?;
            operator.source_residual(space, element, residual.rows_mut(element * n, n))?;
        }

        for (face_index, face) in space.mesh().faces().iter().enumerate() {
            let inside = face.inside();
            match face.outside() {
                Some((outside, _)) => {
                    ws.r_inside.resize_vertically_mut(n, T::zero());
                    ws.r_inside.fill(T::zero());
                    ws.r_outside.resize_vertically_mut(n, T::zero());
                    ws.r_outside.fill(T::zero());
                    operator.skeleton_residual(
                        space,
                        face_index,
                        u.rows(inside * n, n),
                        u.rows(outside * n, n),
                        nalgebra::DVectorSliceMut::from(&mut ws.r_inside),
                        nalgebra::DVectorSliceMut::from(&mut ws.r_outside),
                        &mut stats,
                    )?;
                    let mut inside_rows = residual.rows_mut(inside * n, n);
                    inside_rows += &ws.r_inside;
                    let mut outside_rows = residual.rows_mut(outside * n, n);
                    outside_rows += &ws.r_outside;
                }
                None => {
                    operator.boundary_residual(
                        space,
                        face_index,
                        u.rows(inside * n, n),
                        residual.rows_mut(inside * n, n),
                        &mut stats,
                    )?;
                }
            }
        }

        Ok((residual, stats))
    }

    /// Assembles the right-hand side of the linear problem, i.e. the negated
    /// residual at `u = 0` (source term plus inhomogeneous boundary data).
    pub fn assemble_rhs_vector<D, P, E, W>(
        &self,
        space: &DgSpace<T, D>,
        operator: &ConvectionDiffusionDgOperator<T, D, P, E, W>,
    ) -> eyre::Result<DVector<T>>
    where
        D: SmallDim,
        P: ConvectionDiffusionProblem<T, D>,
        E: EdgeNormProvider<T, D>,
        W: PenaltyWeighting<T>,
        T: num_traits::float::FloatCore,
        DefaultAllocator: DimAllocator<T, D>,
    {
        let zero = DVector::zeros(space.num_dofs());
        let (mut residual, _) = self.assemble_residual(space, operator, &zero)?;
        residual.neg_mut();
        Ok(residual)
    }
}

/// A DG space/operator pair viewed as an assembler of its linear system,
/// suitable for lazily building the Jacobian inside the stationary solver.
#[derive(Debug, Clone, Copy)]
pub struct DgLinearSystem<'a, T, D, P, E, W>
where
    T: Real,
    D: SmallDim,
    DefaultAllocator: DimAllocator<T, D>,
{
    pub space: &'a DgSpace<T, D>,
    pub operator: &'a ConvectionDiffusionDgOperator<T, D, P, E, W>,
}

impl<'a, T, D, P, E, W> SystemAssembler<T> for DgLinearSystem<'a, T, D, P, E, W>
where
    T: Real,
    D: SmallDim,
    P: ConvectionDiffusionProblem<T, D>,
    E: EdgeNormProvider<T, D>,
    W: PenaltyWeighting<T>,
    T: num_traits::float::FloatCore,
    DefaultAllocator: DimAllocator<T, D>,
{
    fn assemble_jacobian(&self) -> eyre::Result<CsrMatrix<T>> {
        let assembler = CsrDgAssembler::default();
        let (matrix, stats) = assembler.assemble_jacobian(self.space, self.operator)?;
        log::debug!(
            "assembled DG Jacobian: {} dofs, face diameters in [{:?}, {:?}]",
            self.space.num_dofs(),
            stats.min_h(),
            stats.max_h()
        );
        Ok(matrix)
    }
}

fn add_block_to_csr<T: Real>(
    matrix: &mut CsrMatrix<T>,
    block_size: usize,
    row_block: usize,
    col_block: usize,
    block: &DMatrix<T>,
) {
    for i in 0..block_size {
        let row = row_block * block_size + i;
        for j in 0..block_size {
            let col = col_block * block_size + j;
            match matrix.index_entry_mut(row, col) {
                SparseEntryMut::NonZero(value) => *value += block[(i, j)],
                SparseEntryMut::Zero => {
                    unreachable!("the assembled pattern covers all DG coupling blocks")
                }
            }
        }
    }
}
