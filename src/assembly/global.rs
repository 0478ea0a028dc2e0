//! Global assembly: from weak form and spaces to matrix and vector entries.
//!
//! An [`Assembler`] is a session object binding spaces to a weak form. It owns
//! the traversal stages and the shape value cache and keeps both in sync with
//! the structural sequence numbers of the meshes, spaces and the weak form, so
//! repeated assembly (e.g. Newton iterations) only pays for traversal and
//! caching once.

use crate::assembly::cache::{AssemblingCache, CacheStats};
use crate::assembly::eval::{LocalMatrix, LocalVector, StateAssembler};
use crate::assembly::pattern::{block_weight, build_pattern};
use crate::assembly::traversal::Stage;
use crate::solution::Solution;
use crate::space::Space;
use crate::weak_form::{Form, Symmetry, WeakForm};
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use eyre::{bail, ensure, eyre, Result};
use log::debug;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::csr::CsrMatrix;
use nalgebra_sparse::SparseEntryMut;
use std::sync::Arc;

/// Destination for scattered global matrix entries.
pub trait MatrixSink {
    fn add(&mut self, row: usize, col: usize, value: f64) -> Result<()>;
}

impl MatrixSink for CsrMatrix<f64> {
    fn add(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        match self.get_entry_mut(row, col) {
            Some(SparseEntryMut::NonZero(entry)) => {
                *entry += value;
                Ok(())
            }
            _ => bail!("Matrix entry ({row}, {col}) is outside the sparsity pattern"),
        }
    }
}

impl MatrixSink for DMatrix<f64> {
    fn add(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        ensure!(
            row < self.nrows() && col < self.ncols(),
            "Matrix entry ({row}, {col}) is out of bounds"
        );
        self[(row, col)] += value;
        Ok(())
    }
}

/// Destination for scattered global vector entries.
pub trait VectorSink {
    fn add(&mut self, row: usize, value: f64) -> Result<()>;
}

impl VectorSink for DVector<f64> {
    fn add(&mut self, row: usize, value: f64) -> Result<()> {
        ensure!(row < self.len(), "Vector entry {row} is out of bounds");
        self[row] += value;
        Ok(())
    }
}

define_thread_local_workspace!(WORKSPACE);

#[derive(Default)]
struct AssemblyBuffers {
    matrices: Vec<LocalMatrix>,
    vectors: Vec<LocalVector>,
}

/// The assembly session for one weak form over a fixed set of spaces.
pub struct Assembler {
    spaces: Vec<Arc<Space>>,
    weak_form: WeakForm,
    force_diagonal_blocks: bool,
    block_weights: Option<DMatrix<f64>>,
    cache: AssemblingCache,
    stages: Vec<Stage>,
    space_seqs: Vec<u64>,
    mesh_seqs: Vec<u64>,
    wf_seq: u64,
    up_to_date: bool,
}

impl Assembler {
    pub fn new(spaces: Vec<Arc<Space>>, weak_form: WeakForm) -> Result<Self> {
        ensure!(
            spaces.len() == weak_form.num_spaces(),
            "Weak form is defined over {} spaces, {} given",
            weak_form.num_spaces(),
            spaces.len()
        );
        for (i, space) in spaces.iter().enumerate() {
            ensure!(
                space.num_dofs().is_some(),
                "Space {i} has no assigned DOFs"
            );
        }
        Ok(Self {
            spaces,
            weak_form,
            force_diagonal_blocks: false,
            block_weights: None,
            cache: AssemblingCache::new(),
            stages: Vec::new(),
            space_seqs: Vec::new(),
            mesh_seqs: Vec::new(),
            wf_seq: 0,
            up_to_date: false,
        })
    }

    pub fn spaces(&self) -> &[Arc<Space>] {
        &self.spaces
    }

    pub fn weak_form(&self) -> &WeakForm {
        &self.weak_form
    }

    /// The total number of DOFs across all spaces.
    pub fn num_dofs(&self) -> usize {
        self.spaces
            .iter()
            .map(|s| s.num_dofs().unwrap_or(0))
            .sum()
    }

    /// The offset of a space's DOFs within the global numbering.
    pub fn dof_offset(&self, space: usize) -> usize {
        self.spaces[..space]
            .iter()
            .map(|s| s.num_dofs().unwrap_or(0))
            .sum()
    }

    fn offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.spaces.len());
        let mut total = 0;
        for space in &self.spaces {
            offsets.push(total);
            total += space.num_dofs().unwrap_or(0);
        }
        offsets
    }

    /// When set, every diagonal matrix entry is part of the sparse structure
    /// even if no form writes to it. Useful for solvers that require a full
    /// diagonal.
    pub fn set_force_diagonal_blocks(&mut self, force: bool) {
        self.force_diagonal_blocks = force;
    }

    /// Per-block scaling factors, indexed `(test, trial)`. A zero weight
    /// removes the block from both the sparse structure and the assembled
    /// values.
    pub fn set_block_weights(&mut self, weights: DMatrix<f64>) -> Result<()> {
        let n = self.spaces.len();
        ensure!(
            weights.nrows() == n && weights.ncols() == n,
            "Block weights must be a {n} x {n} matrix"
        );
        ensure!(
            weights.iter().all(|w| w.is_finite()),
            "Block weights must be finite"
        );
        self.block_weights = Some(weights);
        Ok(())
    }

    /// Whether the cached stages and shape tables match the current structure
    /// of the meshes, spaces and the weak form.
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
            && self.wf_seq == self.weak_form.seq()
            && self
                .spaces
                .iter()
                .zip(&self.space_seqs)
                .all(|(s, &seq)| s.seq() == seq)
            && self
                .spaces
                .iter()
                .zip(&self.mesh_seqs)
                .all(|(s, &seq)| s.mesh().seq() == seq)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Rebuilds the traversal stages and drops stale cache entries if any
    /// structure changed since the last call.
    fn refresh(&mut self) -> Result<()> {
        if self.is_up_to_date() {
            return Ok(());
        }
        self.stages = self
            .weak_form
            .stages()
            .iter()
            .map(|stage_spaces| Stage::build(&self.spaces, stage_spaces))
            .collect::<Result<_>>()?;
        self.cache.clear_shape_tables();
        self.space_seqs = self.spaces.iter().map(|s| s.seq()).collect();
        self.mesh_seqs = self.spaces.iter().map(|s| s.mesh().seq()).collect();
        self.wf_seq = self.weak_form.seq();
        self.up_to_date = true;
        debug!(
            "Rebuilt {} assembly stages over {} states",
            self.stages.len(),
            self.stages.iter().map(|s| s.states.len()).sum::<usize>()
        );
        Ok(())
    }

    /// Builds a zero CSR matrix with the sparsity pattern of the weak form.
    pub fn create_sparse_structure(&mut self) -> Result<CsrMatrix<f64>> {
        self.refresh()?;
        let offsets = self.offsets();
        let pattern = build_pattern(
            &self.spaces,
            &self.weak_form,
            &self.stages,
            &offsets,
            self.num_dofs(),
            self.force_diagonal_blocks,
            self.block_weights.as_ref(),
        )?;
        let nnz = pattern.nnz();
        CsrMatrix::try_from_pattern_and_values(pattern, vec![0.0; nnz])
            .map_err(|err| eyre!("Invalid CSR structure: {err}"))
    }

    /// Assembles the weak form into the given sinks, adding to their current
    /// values.
    ///
    /// `iterate` is the previous iterate of a nonlinear problem, split across
    /// the spaces by the global DOF offsets; the forms receive it through
    /// their external function arguments. A form sees the iterate of the
    /// spaces coupled into its stage; entries of other spaces, and all
    /// entries when no iterate is given, evaluate to zero. With
    /// `add_dir_lift` the iterate is completed by the essential boundary
    /// values, and constrained trial contributions are moved to the
    /// right-hand side.
    pub fn assemble<M: MatrixSink, V: VectorSink>(
        &mut self,
        mut matrix: Option<&mut M>,
        mut vector: Option<&mut V>,
        iterate: Option<&DVector<f64>>,
        add_dir_lift: bool,
    ) -> Result<()> {
        self.refresh()?;
        let offsets = self.offsets();

        let ext: Vec<Solution> = match iterate {
            Some(coefficients) => {
                ensure!(
                    coefficients.len() == self.num_dofs(),
                    "Iterate has {} entries, the system has {} DOFs",
                    coefficients.len(),
                    self.num_dofs()
                );
                self.spaces
                    .iter()
                    .enumerate()
                    .map(|(i, space)| {
                        let n = space.num_dofs().unwrap_or(0);
                        let local = coefficients.rows(offsets[i], n).into_owned();
                        Solution::from_coefficients(Arc::clone(space), &local, add_dir_lift)
                    })
                    .collect::<Result<_>>()?
            }
            None => Vec::new(),
        };

        let assemble_vector = vector.is_some();
        // Constrained trial columns reach the right-hand side through the
        // matrix locals, so those must be evaluated for the lift even when no
        // matrix sink is given.
        let assemble_matrix = matrix.is_some()
            || (assemble_vector && self.spaces.iter().any(|s| s.has_essential_bc()));

        with_thread_local_workspace(&WORKSPACE, |buffers: &mut AssemblyBuffers| {
            for stage in &self.stages {
                let forms: Vec<&Form> = self.weak_form.stage_forms(&stage.spaces).collect();
                let mut evaluator =
                    StateAssembler::new(&self.spaces, stage, &ext, &mut self.cache);
                for state in &stage.states {
                    buffers.matrices.clear();
                    buffers.vectors.clear();
                    evaluator.assemble_state(
                        state,
                        &forms,
                        assemble_matrix,
                        assemble_vector,
                        &mut buffers.matrices,
                        &mut buffers.vectors,
                    )?;
                    for local in &buffers.matrices {
                        scatter_matrix(
                            local,
                            &mut matrix,
                            &mut vector,
                            &offsets,
                            self.block_weights.as_ref(),
                        )?;
                    }
                    for local in &buffers.vectors {
                        scatter_vector(local, &mut vector, &offsets)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Assembles the matrix only.
    pub fn assemble_matrix<M: MatrixSink>(&mut self, matrix: &mut M) -> Result<()> {
        self.assemble::<M, DVector<f64>>(Some(matrix), None, None, false)
    }

    /// Assembles the right-hand side only.
    pub fn assemble_vector<V: VectorSink>(&mut self, vector: &mut V) -> Result<()> {
        self.assemble::<CsrMatrix<f64>, V>(None, Some(vector), None, false)
    }
}

fn scatter_matrix<M: MatrixSink, V: VectorSink>(
    local: &LocalMatrix,
    matrix: &mut Option<&mut M>,
    vector: &mut Option<&mut V>,
    offsets: &[usize],
    weights: Option<&DMatrix<f64>>,
) -> Result<()> {
    let weight = block_weight(weights, local.test_space, local.trial_space);
    if weight != 0.0 {
        let row_offset = offsets[local.test_space];
        let col_offset = offsets[local.trial_space];
        for (r, row) in local.rows.iter().enumerate() {
            let Some(row_dof) = row.dof else { continue };
            for (c, col) in local.cols.iter().enumerate() {
                let value = weight * local.values[(r, c)];
                match col.dof {
                    Some(col_dof) => {
                        if let Some(matrix) = matrix.as_mut() {
                            matrix.add(row_offset + row_dof, col_offset + col_dof, value)?;
                        }
                    }
                    // Essential boundary shape: its known coefficient moves
                    // the column contribution to the right-hand side.
                    None => {
                        if let Some(vector) = vector.as_mut() {
                            vector.add(row_offset + row_dof, -value * col.coef)?;
                        }
                    }
                }
            }
        }
    }

    // Off-diagonal blocks of (anti)symmetric forms mirror into the transposed
    // block; same-space blocks were mirrored during evaluation.
    if local.symmetry != Symmetry::NonSym && local.test_space != local.trial_space {
        let mirror_weight = block_weight(weights, local.trial_space, local.test_space);
        if mirror_weight == 0.0 {
            return Ok(());
        }
        let sign = if local.symmetry == Symmetry::AntiSym {
            -1.0
        } else {
            1.0
        };
        let row_offset = offsets[local.trial_space];
        let col_offset = offsets[local.test_space];
        for (c, col) in local.cols.iter().enumerate() {
            let Some(row_dof) = col.dof else { continue };
            for (r, row) in local.rows.iter().enumerate() {
                let value = sign * mirror_weight * local.values[(r, c)];
                match row.dof {
                    Some(col_dof) => {
                        if let Some(matrix) = matrix.as_mut() {
                            matrix.add(row_offset + row_dof, col_offset + col_dof, value)?;
                        }
                    }
                    None => {
                        if let Some(vector) = vector.as_mut() {
                            vector.add(row_offset + row_dof, -value * row.coef)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn scatter_vector<V: VectorSink>(
    local: &LocalVector,
    vector: &mut Option<&mut V>,
    offsets: &[usize],
) -> Result<()> {
    let Some(vector) = vector.as_mut() else {
        return Ok(());
    };
    let offset = offsets[local.test_space];
    for (r, row) in local.rows.iter().enumerate() {
        if let Some(dof) = row.dof {
            vector.add(offset + dof, local.values[r])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::create_unit_square_uniform_quad_mesh_2d;
    use crate::space::Continuity;
    use crate::weak_form::Form;

    fn laplace_assembler(cells: usize, degree: u32) -> Assembler {
        let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(cells));
        let mut space = Space::new(mesh, degree, Continuity::Continuous);
        space.assign_dofs().unwrap();
        let mut wf = WeakForm::new(1);
        wf.add_form(Form::volume_matrix(0, 0, |u, v, _, _| u.grad.dot(&v.grad)))
            .unwrap();
        Assembler::new(vec![Arc::new(space)], wf).unwrap()
    }

    #[test]
    fn csr_sink_rejects_entries_outside_the_pattern() {
        let mut assembler = laplace_assembler(1, 1);
        let mut matrix = assembler.create_sparse_structure().unwrap();
        assert!(matrix.add(0, 1, 1.0).is_ok());
        // A 1-element mesh has a dense 4x4 pattern; shrink to test the error.
        let mut empty = CsrMatrix::zeros(4, 4);
        assert!(MatrixSink::add(&mut empty, 0, 0, 1.0).is_err());
    }

    #[test]
    fn assembled_laplacian_is_symmetric_with_zero_row_sums() {
        let mut assembler = laplace_assembler(2, 1);
        let mut matrix = assembler.create_sparse_structure().unwrap();
        assembler.assemble_matrix(&mut matrix).unwrap();
        let dense = DMatrix::from(&matrix);
        assert_eq!(dense.nrows(), 9);
        assert!((&dense - dense.transpose()).amax() < 1e-13);
        for r in 0..dense.nrows() {
            assert!(dense.row(r).sum().abs() < 1e-12, "row {r}");
        }
    }

    #[test]
    fn repeated_assembly_reuses_the_structure() {
        let mut assembler = laplace_assembler(2, 1);
        let mut matrix = assembler.create_sparse_structure().unwrap();
        assembler.assemble_matrix(&mut matrix).unwrap();
        assert!(assembler.is_up_to_date());
        let stats_after_first = assembler.cache_stats();
        let mut second = assembler.create_sparse_structure().unwrap();
        assembler.assemble_matrix(&mut second).unwrap();
        // The second pass recomputes nothing.
        assert_eq!(assembler.cache_stats().computed, stats_after_first.computed);
        assert!(assembler.cache_stats().hits > stats_after_first.hits);
    }

    #[test]
    fn dirichlet_lift_moves_known_columns_to_the_rhs() {
        let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(2));
        let mut space = Space::new(mesh, 1, Continuity::Continuous);
        space.set_essential_bc(|_, _| Some(2.0));
        space.assign_dofs().unwrap();
        let mut wf = WeakForm::new(1);
        wf.add_form(Form::volume_matrix(0, 0, |u, v, _, _| u.grad.dot(&v.grad)))
            .unwrap();
        let mut assembler = Assembler::new(vec![Arc::new(space)], wf).unwrap();
        assert_eq!(assembler.num_dofs(), 1);

        let mut matrix = assembler.create_sparse_structure().unwrap();
        let mut rhs = DVector::zeros(1);
        assembler
            .assemble(Some(&mut matrix), Some(&mut rhs), None, false)
            .unwrap();
        // With u = 2 on the whole boundary, u = 2 everywhere solves the
        // discrete Laplace problem: A u0 = rhs must give u0 = 2.
        let diag = matrix.get_entry(0, 0).unwrap().into_value();
        assert!(diag > 0.0);
        assert!((rhs[0] / diag - 2.0).abs() < 1e-12);
    }

    #[test]
    fn block_weights_scale_blocks() {
        let mut assembler = laplace_assembler(1, 1);
        assembler
            .set_block_weights(DMatrix::from_element(1, 1, 2.0))
            .unwrap();
        let mut weighted = assembler.create_sparse_structure().unwrap();
        assembler.assemble_matrix(&mut weighted).unwrap();

        let mut plain_assembler = laplace_assembler(1, 1);
        let mut plain = plain_assembler.create_sparse_structure().unwrap();
        plain_assembler.assemble_matrix(&mut plain).unwrap();

        let weighted = DMatrix::from(&weighted);
        let plain = DMatrix::from(&plain);
        assert!((weighted - plain * 2.0).amax() < 1e-13);
    }
}
