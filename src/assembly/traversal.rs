//! Joint traversal of meshes sharing a base partition.
//!
//! All meshes of one assembly stage are descended simultaneously: wherever any
//! mesh is refined, the traversal splits into the four sons; meshes that are
//! already at an active element accumulate the son as a pending sub-element
//! path instead. The leaves of this joint descent are the [`State`]s, the
//! cells of the finest common partition on which every form of the stage is
//! integrated.

use crate::mesh::{ElementIndex, Mesh, SubPath};
use crate::space::Space;
use eyre::{ensure, Result};
use nalgebra::Point2;
use std::sync::Arc;

/// One cell of the finest common partition of a stage's meshes.
#[derive(Debug, Clone)]
pub struct State {
    /// Per stage mesh: the active element containing the cell.
    pub elements: Vec<ElementIndex>,
    /// Per stage mesh: the pending path from the active element to the cell.
    pub paths: Vec<SubPath>,
    /// A stage mesh whose active element equals the cell (its path is empty).
    pub rep: usize,
    pub marker: i32,
    /// Per edge of the cell: whether it lies on the domain boundary.
    pub bnd: [bool; 4],
    pub edge_markers: [i32; 4],
}

impl State {
    pub fn is_inner_edge(&self, edge: u8) -> bool {
        !self.bnd[edge as usize]
    }
}

/// One assembly stage: a group of coupled spaces, the meshes they live on,
/// and the states of the joint traversal.
#[derive(Debug)]
pub struct Stage {
    /// Global indices of the spaces in this stage.
    pub spaces: Vec<usize>,
    /// The distinct meshes traversed jointly.
    pub meshes: Vec<Arc<Mesh>>,
    /// Per stage space: index into `meshes`.
    pub mesh_of_space: Vec<usize>,
    pub states: Vec<State>,
}

impl Stage {
    /// Builds the stage for the given spaces, traversing their meshes
    /// together.
    pub fn build(all_spaces: &[Arc<Space>], stage_spaces: &[usize]) -> Result<Self> {
        let mut meshes: Vec<Arc<Mesh>> = Vec::new();
        let mut index_of = |mesh: &Arc<Mesh>, meshes: &mut Vec<Arc<Mesh>>| {
            if let Some(i) = meshes.iter().position(|m| m.id() == mesh.id()) {
                i
            } else {
                meshes.push(Arc::clone(mesh));
                meshes.len() - 1
            }
        };

        let mesh_of_space: Vec<usize> = stage_spaces
            .iter()
            .map(|&s| index_of(all_spaces[s].mesh(), &mut meshes))
            .collect();
        ensure!(!meshes.is_empty(), "Stage has no meshes to traverse");

        for mesh in &meshes[1..] {
            ensure!(
                meshes[0].shares_base_with(mesh),
                "Meshes of one stage must share the same base partition"
            );
        }

        let mut states = Vec::new();
        for base in 0..meshes[0].num_base_elements() {
            let mut elements = vec![base; meshes.len()];
            let mut paths = vec![SubPath::new(); meshes.len()];
            traverse(&meshes, &mut elements, &mut paths, &mut states)?;
        }

        Ok(Self {
            spaces: stage_spaces.to_vec(),
            meshes,
            mesh_of_space,
            states,
        })
    }

    /// The physical corners of a state's cell.
    pub fn state_corners(&self, state: &State) -> [Point2<f64>; 4] {
        self.meshes[state.rep].element_corners(state.elements[state.rep])
    }

    /// The stage-local index of a global space index.
    pub fn local_space(&self, space: usize) -> Option<usize> {
        self.spaces.iter().position(|&s| s == space)
    }
}

fn traverse(
    meshes: &[Arc<Mesh>],
    elements: &mut Vec<ElementIndex>,
    paths: &mut Vec<SubPath>,
    states: &mut Vec<State>,
) -> Result<()> {
    let any_refined = meshes
        .iter()
        .zip(elements.iter())
        .any(|(mesh, &e)| !mesh.element(e).is_leaf());

    if !any_refined {
        let rep = paths
            .iter()
            .position(|p| p.is_empty())
            .expect("At least one mesh is at the unified refinement level");
        let rep_element = meshes[rep].element(elements[rep]);
        states.push(State {
            elements: elements.clone(),
            paths: paths.clone(),
            rep,
            marker: rep_element.marker(),
            bnd: std::array::from_fn(|e| rep_element.edge_is_boundary(e as u8)),
            edge_markers: std::array::from_fn(|e| rep_element.edge_marker(e as u8)),
        });
        return Ok(());
    }

    for son in 0..4u8 {
        let saved_elements = elements.clone();
        for (m, mesh) in meshes.iter().enumerate() {
            match mesh.element(elements[m]).children() {
                Some(children) => elements[m] = children[son as usize],
                None => paths[m].push(son),
            }
        }
        traverse(meshes, elements, paths, states)?;
        for (m, saved) in saved_elements.iter().enumerate() {
            if elements[m] != *saved {
                elements[m] = *saved;
            } else {
                paths[m].pop();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::create_unit_square_uniform_quad_mesh_2d;
    use crate::space::{Continuity, Space};

    fn space_on(mesh: Mesh) -> Arc<Space> {
        let mut space = Space::new(Arc::new(mesh), 1, Continuity::Discontinuous);
        space.assign_dofs().unwrap();
        Arc::new(space)
    }

    #[test]
    fn single_mesh_states_are_its_leaves() {
        let mut mesh = create_unit_square_uniform_quad_mesh_2d(2);
        mesh.refine_element(3);
        let space = space_on(mesh);
        let stage = Stage::build(&[Arc::clone(&space)], &[0]).unwrap();
        assert_eq!(stage.states.len(), 7);
        assert!(stage.states.iter().all(|s| s.paths[0].is_empty()));
        let leaves: Vec<_> = space.mesh().active_elements().collect();
        let mut visited: Vec<_> = stage.states.iter().map(|s| s.elements[0]).collect();
        visited.sort_unstable();
        assert_eq!(visited, leaves);
    }

    #[test]
    fn unequal_refinement_yields_pending_paths() {
        let mut fine = create_unit_square_uniform_quad_mesh_2d(2);
        fine.refine_element(0);
        let coarse = create_unit_square_uniform_quad_mesh_2d(2);
        let stage = Stage::build(&[space_on(fine), space_on(coarse)], &[0, 1]).unwrap();
        // 4 sub-states on base element 0 plus the 3 untouched base elements.
        assert_eq!(stage.states.len(), 7);

        let split: Vec<_> = stage
            .states
            .iter()
            .filter(|s| !s.paths[1].is_empty())
            .collect();
        assert_eq!(split.len(), 4);
        for (son, state) in split.iter().enumerate() {
            // The fine mesh is at a leaf; the coarse one lags behind by one
            // pending son transformation.
            assert_eq!(state.rep, 0);
            assert!(state.paths[0].is_empty());
            assert_eq!(state.elements[1], 0);
            assert_eq!(state.paths[1], SubPath::from_slice(&[son as u8]));
        }
    }

    #[test]
    fn boundary_flags_follow_the_representative() {
        let mut fine = create_unit_square_uniform_quad_mesh_2d(1);
        fine.refine_element(0);
        let coarse = create_unit_square_uniform_quad_mesh_2d(1);
        let stage = Stage::build(&[space_on(fine), space_on(coarse)], &[0, 1]).unwrap();
        assert_eq!(stage.states.len(), 4);
        // Son 0 touches the boundary on edges 0 and 3 only.
        let state = &stage.states[0];
        assert_eq!(state.paths[1], SubPath::from_slice(&[0]));
        assert_eq!(state.bnd, [true, false, false, true]);
        assert!(state.is_inner_edge(1) && state.is_inner_edge(2));
    }

    #[test]
    fn shared_mesh_is_traversed_once() {
        let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(2));
        let mut s0 = Space::new(Arc::clone(&mesh), 1, Continuity::Discontinuous);
        s0.assign_dofs().unwrap();
        let mut s1 = Space::new(Arc::clone(&mesh), 2, Continuity::Discontinuous);
        s1.assign_dofs().unwrap();
        let stage = Stage::build(&[Arc::new(s0), Arc::new(s1)], &[0, 1]).unwrap();
        assert_eq!(stage.meshes.len(), 1);
        assert_eq!(stage.mesh_of_space, vec![0, 0]);
    }

    #[test]
    fn different_base_partitions_are_rejected() {
        let a = create_unit_square_uniform_quad_mesh_2d(1);
        let b = create_unit_square_uniform_quad_mesh_2d(2);
        assert!(Stage::build(&[space_on(a), space_on(b)], &[0, 1]).is_err());
    }
}
