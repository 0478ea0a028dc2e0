//! Construction of the global sparsity pattern.
//!
//! The pattern is the union, over all traversal states, of the cross products
//! of the test and trial assembly lists of every matrix form block. DG forms
//! additionally couple the central element with its neighbors across inner
//! edges. Markers are ignored here: the pattern may be a superset of the
//! entries actually written, which keeps it valid across marker-dependent
//! reassembly.

use crate::assembly::neighbor::NeighborSearch;
use crate::assembly::traversal::Stage;
use crate::space::Space;
use crate::weak_form::{Symmetry, WeakForm};
use eyre::{eyre, Result};
use nalgebra::DMatrix;
use nalgebra_sparse::pattern::SparsityPattern;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The weight of a block, 1 unless overridden. Weight zero removes the block
/// from the pattern entirely.
pub(crate) fn block_weight(weights: Option<&DMatrix<f64>>, test: usize, trial: usize) -> f64 {
    weights.map_or(1.0, |w| w[(test, trial)])
}

/// Builds the CSR sparsity pattern of the global system.
pub(crate) fn build_pattern(
    spaces: &[Arc<Space>],
    weak_form: &WeakForm,
    stages: &[Stage],
    offsets: &[usize],
    num_dofs: usize,
    force_diagonal_blocks: bool,
    weights: Option<&DMatrix<f64>>,
) -> Result<SparsityPattern> {
    let mut rows: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); num_dofs];

    if force_diagonal_blocks {
        for (row, set) in rows.iter_mut().enumerate() {
            set.insert(row);
        }
    }

    let mut couple = |rows: &mut Vec<BTreeSet<usize>>,
                      row_dofs: &BTreeSet<usize>,
                      col_dofs: &BTreeSet<usize>| {
        for &row in row_dofs {
            rows[row].extend(col_dofs.iter().copied());
        }
    };

    for stage in stages {
        for form in weak_form.stage_forms(&stage.spaces) {
            if form.matrix_blocks().is_empty() {
                continue;
            }
            let is_dg = form.kind().is_dg();
            for &(test, trial) in form.matrix_blocks() {
                if block_weight(weights, test, trial) == 0.0 {
                    continue;
                }
                for state in &stage.states {
                    if is_dg {
                        // The local matrix of an inner edge spans the central
                        // element and its neighbors across that edge, on both
                        // the test and the trial side.
                        for edge in 0..4u8 {
                            if !state.is_inner_edge(edge) {
                                continue;
                            }
                            let row_dofs =
                                edge_dofs(spaces, stage, state, test, edge, offsets)?;
                            let col_dofs = if trial == test {
                                row_dofs.clone()
                            } else {
                                edge_dofs(spaces, stage, state, trial, edge, offsets)?
                            };
                            couple(&mut rows, &row_dofs, &col_dofs);
                        }
                    } else {
                        let row_dofs = state_dofs(spaces, stage, state, test, offsets)?;
                        let col_dofs = if trial == test {
                            row_dofs.clone()
                        } else {
                            state_dofs(spaces, stage, state, trial, offsets)?
                        };
                        couple(&mut rows, &row_dofs, &col_dofs);
                        if form.symmetry() != Symmetry::NonSym && test != trial {
                            couple(&mut rows, &col_dofs, &row_dofs);
                        }
                    }
                }
            }
        }
    }

    let mut offsets_out = Vec::with_capacity(num_dofs + 1);
    let mut nnz = 0;
    offsets_out.push(0);
    for set in &rows {
        nnz += set.len();
        offsets_out.push(nnz);
    }
    let indices: Vec<usize> = rows
        .par_iter()
        .flat_map_iter(|set| set.iter().copied())
        .collect();

    SparsityPattern::try_from_offsets_and_indices(num_dofs, num_dofs, offsets_out, indices)
        .map_err(|err| eyre!("Invalid sparsity pattern: {err:?}"))
}

fn space_position(
    stage: &Stage,
    state: &crate::assembly::traversal::State,
    space: usize,
) -> Result<(usize, crate::mesh::ElementIndex)> {
    let local = stage
        .local_space(space)
        .ok_or_else(|| eyre!("Form space {space} is not part of the stage"))?;
    let mesh_index = stage.mesh_of_space[local];
    Ok((mesh_index, state.elements[mesh_index]))
}

fn collect_element_dofs(
    spaces: &[Arc<Space>],
    space: usize,
    element: crate::mesh::ElementIndex,
    offset: usize,
    dofs: &mut BTreeSet<usize>,
) {
    for entry in &spaces[space].element_assembly_list(element).entries {
        if let Some(dof) = entry.dof {
            dofs.insert(offset + dof);
        }
    }
}

/// The global DOFs of a space on the element containing a state.
fn state_dofs(
    spaces: &[Arc<Space>],
    stage: &Stage,
    state: &crate::assembly::traversal::State,
    space: usize,
    offsets: &[usize],
) -> Result<BTreeSet<usize>> {
    let (_, element) = space_position(stage, state, space)?;
    let mut dofs = BTreeSet::new();
    collect_element_dofs(spaces, space, element, offsets[space], &mut dofs);
    Ok(dofs)
}

/// The global DOFs of a space on the central element of a state plus all its
/// neighbors across one inner edge.
fn edge_dofs(
    spaces: &[Arc<Space>],
    stage: &Stage,
    state: &crate::assembly::traversal::State,
    space: usize,
    edge: u8,
    offsets: &[usize],
) -> Result<BTreeSet<usize>> {
    let (mesh_index, element) = space_position(stage, state, space)?;
    let mut dofs = BTreeSet::new();
    collect_element_dofs(spaces, space, element, offsets[space], &mut dofs);
    let mesh = &stage.meshes[mesh_index];
    let search = NeighborSearch::new(mesh, element, edge, &state.paths[mesh_index])?;
    for entry in search.entries() {
        collect_element_dofs(spaces, space, entry.neighbor, offsets[space], &mut dofs);
    }
    Ok(dofs)
}
