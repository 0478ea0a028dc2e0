//! Finite element spaces and their degree-of-freedom registries.
//!
//! A [`Space`] binds a [`Mesh`] to a tensor-product Lagrange shapeset of a
//! fixed polynomial degree. After [`Space::assign_dofs`] the space owns a map
//! from (element, local shape index) to global DOF indices that are unique and
//! contiguous in `[0, ndof)`. Shape functions constrained by an essential
//! boundary condition carry no DOF index; instead they carry the prescribed
//! coefficient, which enters the right-hand side through the Dirichlet lift.

use crate::mesh::{ElementIndex, Mesh};
use eyre::{bail, Result};
use nalgebra::Point2;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Inter-element continuity of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// H1-conforming: shape functions are glued across shared vertices and
    /// edges. Requires a conforming mesh (no hanging nodes).
    Continuous,
    /// L2: every active element owns all of its shape functions. Works on any
    /// refinement.
    Discontinuous,
}

/// Tensor-product Lagrange basis on the reference square.
///
/// Shapes are indexed as `iy * (degree + 1) + ix` over an equispaced node grid;
/// degree zero is the constant basis.
#[derive(Debug, Clone)]
pub struct Shapeset {
    degree: u32,
    nodes: Vec<f64>,
}

impl Shapeset {
    pub fn new(degree: u32) -> Self {
        let nodes = if degree == 0 {
            vec![0.0]
        } else {
            (0..=degree)
                .map(|i| -1.0 + 2.0 * i as f64 / degree as f64)
                .collect()
        };
        Self { degree, nodes }
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    pub fn num_shapes(&self) -> usize {
        let n = self.degree as usize + 1;
        n * n
    }

    /// An identifier encoding the shape family and degree, used in cache keys.
    pub fn id(&self) -> u32 {
        // Family 1: tensor-product Lagrange.
        (1 << 8) | self.degree
    }

    fn lagrange(&self, i: usize, x: f64) -> f64 {
        let mut value = 1.0;
        for j in 0..self.nodes.len() {
            if j != i {
                value *= (x - self.nodes[j]) / (self.nodes[i] - self.nodes[j]);
            }
        }
        value
    }

    fn lagrange_derivative(&self, i: usize, x: f64) -> f64 {
        let mut sum = 0.0;
        for k in 0..self.nodes.len() {
            if k == i {
                continue;
            }
            let mut term = 1.0 / (self.nodes[i] - self.nodes[k]);
            for j in 0..self.nodes.len() {
                if j != i && j != k {
                    term *= (x - self.nodes[j]) / (self.nodes[i] - self.nodes[j]);
                }
            }
            sum += term;
        }
        sum
    }

    fn split(&self, shape: usize) -> (usize, usize) {
        let n = self.degree as usize + 1;
        (shape % n, shape / n)
    }

    /// Value and reference-domain gradient of shape `shape` at `xi`.
    pub fn eval(&self, shape: usize, xi: &Point2<f64>) -> (f64, f64, f64) {
        let (ix, iy) = self.split(shape);
        let lx = self.lagrange(ix, xi.x);
        let ly = self.lagrange(iy, xi.y);
        let dlx = self.lagrange_derivative(ix, xi.x);
        let dly = self.lagrange_derivative(iy, xi.y);
        (lx * ly, dlx * ly, lx * dly)
    }

    pub fn value(&self, shape: usize, xi: &Point2<f64>) -> f64 {
        let (ix, iy) = self.split(shape);
        self.lagrange(ix, xi.x) * self.lagrange(iy, xi.y)
    }
}

/// Where a reference node sits on the element boundary, for DOF sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeKey {
    Vertex(usize),
    /// Canonically oriented edge (vmin, vmax) and node position along it.
    Edge(usize, usize, u32),
    Interior(ElementIndex, u32, u32),
}

/// One entry of an element's assembly list: a local shape function together
/// with its global DOF (or, for essential-BC shapes, the prescribed
/// coefficient).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DofEntry {
    pub shape: usize,
    pub dof: Option<usize>,
    pub coef: f64,
}

/// The local-to-global assembly list of one element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsmList {
    pub entries: Vec<DofEntry>,
}

impl AsmList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type EssentialBc = Box<dyn Fn(i32, &Point2<f64>) -> Option<f64> + Send + Sync>;

/// A finite element space over a mesh.
pub struct Space {
    mesh: Arc<Mesh>,
    shapeset: Shapeset,
    continuity: Continuity,
    essential_bc: Option<EssentialBc>,
    seq: u64,
    ndof: Option<usize>,
    asm_lists: Vec<AsmList>,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("degree", &self.shapeset.degree())
            .field("continuity", &self.continuity)
            .field("ndof", &self.ndof)
            .finish_non_exhaustive()
    }
}

impl Space {
    pub fn new(mesh: Arc<Mesh>, degree: u32, continuity: Continuity) -> Self {
        assert!(
            degree > 0 || continuity == Continuity::Discontinuous,
            "Degree zero requires a discontinuous space"
        );
        Self {
            mesh,
            shapeset: Shapeset::new(degree),
            continuity,
            essential_bc: None,
            seq: 0,
            ndof: None,
            asm_lists: Vec::new(),
        }
    }

    /// Registers an essential (Dirichlet) boundary condition. For every shape
    /// node on a boundary edge, the callback receives the edge marker and the
    /// node's physical position; returning `Some(value)` constrains the shape.
    ///
    /// Must be called before [`Space::assign_dofs`].
    pub fn set_essential_bc<F>(&mut self, bc: F)
    where
        F: Fn(i32, &Point2<f64>) -> Option<f64> + Send + Sync + 'static,
    {
        self.essential_bc = Some(Box::new(bc));
        self.ndof = None;
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn has_essential_bc(&self) -> bool {
        self.essential_bc.is_some()
    }

    pub fn shapeset(&self) -> &Shapeset {
        &self.shapeset
    }

    pub fn continuity(&self) -> Continuity {
        self.continuity
    }

    /// The structural sequence number, bumped by every [`Space::assign_dofs`].
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The number of degrees of freedom, if assigned.
    pub fn num_dofs(&self) -> Option<usize> {
        self.ndof
    }

    /// The assembly list of an active element.
    ///
    /// # Panics
    ///
    /// Panics if DOFs have not been assigned or the element is not active.
    pub fn element_assembly_list(&self, element: ElementIndex) -> &AsmList {
        assert!(self.ndof.is_some(), "assign_dofs must be called first");
        let list = &self.asm_lists[element];
        assert!(!list.is_empty(), "Element {element} is not active");
        list
    }

    fn element_depth(&self, mut element: ElementIndex) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.mesh.element(element).parent() {
            element = parent;
            depth += 1;
        }
        depth
    }

    /// Assigns global DOF indices to all active elements' shape functions and
    /// returns the DOF count.
    ///
    /// Fails for continuous spaces on non-conforming meshes.
    pub fn assign_dofs(&mut self) -> Result<usize> {
        let mesh = Arc::clone(&self.mesh);
        let active: Vec<_> = mesh.active_elements().collect();

        if self.continuity == Continuity::Continuous {
            // Conformity check: uniform leaf depth guarantees no hanging nodes
            // when the base partition is conforming.
            let mut depths = active.iter().map(|&e| self.element_depth(e));
            if let Some(first) = depths.next() {
                if depths.any(|d| d != first) {
                    bail!(
                        "Continuous space requires a conforming mesh \
                         (active elements at different refinement depths)"
                    );
                }
            }
        }

        let p = self.shapeset.degree();
        let mut next_dof = 0;
        let mut shared: FxHashMap<NodeKey, Option<usize>> = FxHashMap::default();
        let mut asm_lists = vec![AsmList::default(); mesh.num_elements()];

        for &element in &active {
            let corners = mesh.element_corners(element);
            let refmap = crate::refmap::RefMap::from_corners(corners);
            let mut entries = Vec::with_capacity(self.shapeset.num_shapes());

            for shape in 0..self.shapeset.num_shapes() {
                let (ix, iy) = (shape as u32 % (p + 1), shape as u32 / (p + 1));

                let constrained = self.constrain_node(element, ix, iy, &refmap);

                if self.continuity == Continuity::Discontinuous {
                    entries.push(DofEntry {
                        shape,
                        dof: Some(next_dof),
                        coef: 1.0,
                    });
                    next_dof += 1;
                    continue;
                }

                if let Some(value) = constrained {
                    // Record the constraint under the shared key so every
                    // element sharing the node agrees.
                    let key = self.node_key(element, ix, iy);
                    shared.insert(key, None);
                    entries.push(DofEntry {
                        shape,
                        dof: None,
                        coef: value,
                    });
                    continue;
                }

                let key = self.node_key(element, ix, iy);
                let dof = match shared.get(&key) {
                    Some(&Some(dof)) => dof,
                    Some(&None) => {
                        // A neighboring element constrained this node already.
                        entries.push(DofEntry {
                            shape,
                            dof: None,
                            coef: self
                                .constrain_shared_node(&key, element, ix, iy, &refmap),
                        });
                        continue;
                    }
                    None => {
                        let dof = next_dof;
                        next_dof += 1;
                        shared.insert(key, Some(dof));
                        dof
                    }
                };
                entries.push(DofEntry {
                    shape,
                    dof: Some(dof),
                    coef: 1.0,
                });
            }
            asm_lists[element] = AsmList { entries };
        }

        self.asm_lists = asm_lists;
        self.ndof = Some(next_dof);
        self.seq += 1;
        Ok(next_dof)
    }

    /// The essential-BC value for a node constrained via a neighboring
    /// element, re-evaluated at the node position for the lift coefficient.
    fn constrain_shared_node(
        &self,
        _key: &NodeKey,
        element: ElementIndex,
        ix: u32,
        iy: u32,
        refmap: &crate::refmap::RefMap,
    ) -> f64 {
        self.constrain_node(element, ix, iy, refmap).unwrap_or(0.0)
    }

    /// Checks all boundary edges touching the node for an essential BC.
    fn constrain_node(
        &self,
        element: ElementIndex,
        ix: u32,
        iy: u32,
        refmap: &crate::refmap::RefMap,
    ) -> Option<f64> {
        let bc = self.essential_bc.as_ref()?;
        let p = self.shapeset.degree();
        let elem = self.mesh.element(element);

        // Edges the node lies on: edge 0 at iy == 0, edge 1 at ix == p,
        // edge 2 at iy == p, edge 3 at ix == 0.
        let on_edges = [iy == 0, ix == p, iy == p, ix == 0];
        let position = refmap.map(&Point2::new(
            self.shapeset.nodes[ix as usize],
            self.shapeset.nodes[iy as usize],
        ));

        for edge in 0..4u8 {
            if on_edges[edge as usize] && elem.edge_is_boundary(edge) {
                if let Some(value) = bc(elem.edge_marker(edge), &position) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn node_key(&self, element: ElementIndex, ix: u32, iy: u32) -> NodeKey {
        let p = self.shapeset.degree();
        let vertices = self.mesh.element(element).vertices();

        let corner = match (ix == 0, ix == p, iy == 0, iy == p) {
            (true, _, true, _) => Some(0),
            (_, true, true, _) => Some(1),
            (_, true, _, true) => Some(2),
            (true, _, _, true) => Some(3),
            _ => None,
        };
        if let Some(corner) = corner {
            return NodeKey::Vertex(vertices[corner]);
        }

        // Edge-interior nodes: orient the key by the edge's vertex pair so that
        // both adjacent elements generate the same key.
        let edge_node = if iy == 0 {
            Some((0usize, ix))
        } else if ix == p {
            Some((1, iy))
        } else if iy == p {
            Some((2, p - ix))
        } else if ix == 0 {
            Some((3, p - iy))
        } else {
            None
        };
        if let Some((edge, param)) = edge_node {
            let a = vertices[edge];
            let b = vertices[(edge + 1) % 4];
            return if a < b {
                NodeKey::Edge(a, b, param)
            } else {
                NodeKey::Edge(b, a, p - param)
            };
        }

        NodeKey::Interior(element, ix, iy)
    }
}
