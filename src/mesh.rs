//! Hierarchically refined quadrilateral meshes.
//!
//! A [`Mesh`] consists of a coarse *base partition* of quadrilateral cells and a
//! forest of refinement trees: refining an element replaces it (logically) by
//! four *sons*, one per corner of the reference square $[-1, 1]^2$. Elements are
//! never removed, so element indices are stable; the *active* elements are the
//! leaves of the forest. Meshes that participate in one assembly stage must be
//! refinements of the same base partition.
//!
//! The son of an element is identified by the corner of the reference square it
//! contains, so a path of son indices doubles as a sub-element transformation:
//! son $k$ maps the reference square onto the quarter containing reference
//! corner $k$.

use nalgebra::Point2;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reference-square corners in counter-clockwise order.
pub const REFERENCE_CORNERS: [[f64; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(0);

/// Index of an element within its mesh.
pub type ElementIndex = usize;

/// A path of son indices, read from the outermost refinement level inwards.
///
/// Doubles as the sub-element transformation of the innermost region relative
/// to the element the path starts at.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubPath(SmallVec<[u8; 8]>);

impl SubPath {
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    pub fn from_slice(sons: &[u8]) -> Self {
        debug_assert!(sons.iter().all(|&s| s < 4));
        Self(SmallVec::from_slice(sons))
    }

    pub fn push(&mut self, son: u8) {
        debug_assert!(son < 4);
        self.0.push(son);
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.0.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn extended(&self, son: u8) -> Self {
        let mut path = self.clone();
        path.push(son);
        path
    }

    /// Maps a point of the innermost region's reference square to the reference
    /// square of the element the path starts at.
    pub fn apply(&self, point: &Point2<f64>) -> Point2<f64> {
        // Innermost transformation first.
        let mut p = *point;
        for &son in self.0.iter().rev() {
            p = apply_son_transformation(son, &p);
        }
        p
    }

    /// An injective encoding of the path, usable as a cache key component.
    ///
    /// The empty path encodes to zero.
    pub fn index(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &son| acc * 5 + son as u64 + 1)
    }
}

/// Maps the reference square onto its quarter containing corner `son`.
pub fn apply_son_transformation(son: u8, point: &Point2<f64>) -> Point2<f64> {
    let corner = REFERENCE_CORNERS[son as usize];
    Point2::new(
        (point.x + corner[0]) * 0.5,
        (point.y + corner[1]) * 0.5,
    )
}

/// Per-element data. Edges are numbered so that edge $k$ connects corner $k$
/// to corner $(k + 1) \bmod 4$.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    vertices: [usize; 4],
    parent: Option<ElementIndex>,
    children: Option<[ElementIndex; 4]>,
    /// Which son of the parent this element is. Zero for base elements.
    son: u8,
    marker: i32,
    edge_boundary: [bool; 4],
    edge_markers: [i32; 4],
}

impl Element {
    pub fn vertices(&self) -> &[usize; 4] {
        &self.vertices
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn children(&self) -> Option<&[ElementIndex; 4]> {
        self.children.as_ref()
    }

    pub fn parent(&self) -> Option<ElementIndex> {
        self.parent
    }

    pub fn son(&self) -> u8 {
        self.son
    }

    pub fn marker(&self) -> i32 {
        self.marker
    }

    pub fn edge_is_boundary(&self, edge: u8) -> bool {
        self.edge_boundary[edge as usize]
    }

    pub fn edge_marker(&self, edge: u8) -> i32 {
        self.edge_markers[edge as usize]
    }
}

/// A hierarchically refined quadrilateral mesh.
#[derive(Debug)]
pub struct Mesh {
    id: u64,
    seq: u64,
    vertices: Vec<Point2<f64>>,
    elements: Vec<Element>,
    num_base_elements: usize,
    /// Per base element and edge: the adjacent base element and its local edge.
    base_neighbors: Vec<[Option<(ElementIndex, u8)>; 4]>,
    /// Midpoint vertices created during refinement, deduplicated per edge.
    edge_midpoints: FxHashMap<(usize, usize), usize>,
}

impl Mesh {
    /// Creates a mesh from vertex positions and counter-clockwise quadrilateral
    /// cells. Boundary edges receive the given marker; interior edges none.
    ///
    /// # Panics
    ///
    /// Panics if a cell references a vertex out of bounds or if an edge is
    /// shared by more than two cells.
    pub fn from_vertices_and_cells(
        vertices: Vec<Point2<f64>>,
        cells: &[[usize; 4]],
        boundary_marker: i32,
    ) -> Self {
        for cell in cells {
            for &v in cell {
                assert!(v < vertices.len(), "Cell vertex index out of bounds");
            }
        }

        // Match edges by their (unordered) vertex pair to find base neighbors.
        let mut edge_owner: FxHashMap<(usize, usize), (ElementIndex, u8)> = FxHashMap::default();
        let mut base_neighbors = vec![[None; 4]; cells.len()];
        for (cell_idx, cell) in cells.iter().enumerate() {
            for edge in 0..4u8 {
                let a = cell[edge as usize];
                let b = cell[(edge as usize + 1) % 4];
                let key = (a.min(b), a.max(b));
                if let Some(&(other, other_edge)) = edge_owner.get(&key) {
                    assert!(
                        base_neighbors[other][other_edge as usize].is_none(),
                        "Edge shared by more than two cells"
                    );
                    base_neighbors[cell_idx][edge as usize] = Some((other, other_edge));
                    base_neighbors[other][other_edge as usize] = Some((cell_idx, edge));
                } else {
                    edge_owner.insert(key, (cell_idx, edge));
                }
            }
        }

        let elements = cells
            .iter()
            .enumerate()
            .map(|(cell_idx, cell)| {
                let mut edge_boundary = [false; 4];
                let mut edge_markers = [0; 4];
                for edge in 0..4 {
                    if base_neighbors[cell_idx][edge].is_none() {
                        edge_boundary[edge] = true;
                        edge_markers[edge] = boundary_marker;
                    }
                }
                Element {
                    vertices: *cell,
                    parent: None,
                    children: None,
                    son: 0,
                    marker: 1,
                    edge_boundary,
                    edge_markers,
                }
            })
            .collect();

        Self {
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
            seq: 0,
            vertices,
            num_base_elements: cells.len(),
            base_neighbors,
            elements,
            edge_midpoints: FxHashMap::default(),
        }
    }

    /// A unique identifier for this mesh instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The structural sequence number, bumped on every refinement.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn num_base_elements(&self) -> usize {
        self.num_base_elements
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn element(&self, index: ElementIndex) -> &Element {
        &self.elements[index]
    }

    pub fn vertex(&self, index: usize) -> &Point2<f64> {
        &self.vertices[index]
    }

    pub fn base_neighbor(&self, base: ElementIndex, edge: u8) -> Option<(ElementIndex, u8)> {
        assert!(base < self.num_base_elements);
        self.base_neighbors[base][edge as usize]
    }

    /// Physical corner positions of the given element.
    pub fn element_corners(&self, index: ElementIndex) -> [Point2<f64>; 4] {
        let element = &self.elements[index];
        element.vertices.map(|v| self.vertices[v])
    }

    /// Indices of the active (leaf) elements, in index order.
    pub fn active_elements(&self) -> impl Iterator<Item = ElementIndex> + '_ {
        (0..self.elements.len()).filter(|&i| self.elements[i].is_leaf())
    }

    /// Sets the material marker of an element and all its descendants.
    pub fn set_marker(&mut self, index: ElementIndex, marker: i32) {
        let mut stack = vec![index];
        while let Some(idx) = stack.pop() {
            self.elements[idx].marker = marker;
            if let Some(children) = self.elements[idx].children {
                stack.extend(children);
            }
        }
    }

    /// Sets the boundary marker of a base element edge (and its descendants').
    pub fn set_edge_marker(&mut self, index: ElementIndex, edge: u8, marker: i32) {
        assert!(
            self.elements[index].edge_boundary[edge as usize],
            "Only boundary edges carry markers"
        );
        let mut stack = vec![(index, edge)];
        while let Some((idx, e)) = stack.pop() {
            self.elements[idx].edge_markers[e as usize] = marker;
            if let Some(children) = self.elements[idx].children {
                // Sons e and e + 1 carry the two halves of edge e.
                stack.push((children[e as usize], e));
                stack.push((children[(e as usize + 1) % 4], e));
            }
        }
    }

    fn midpoint_vertex(&mut self, a: usize, b: usize) -> usize {
        let key = (a.min(b), a.max(b));
        if let Some(&v) = self.edge_midpoints.get(&key) {
            return v;
        }
        let position = Point2::from((self.vertices[a].coords + self.vertices[b].coords) * 0.5);
        let v = self.vertices.len();
        self.vertices.push(position);
        self.edge_midpoints.insert(key, v);
        v
    }

    /// Splits an active element into four sons.
    ///
    /// # Panics
    ///
    /// Panics if the element has already been refined.
    pub fn refine_element(&mut self, index: ElementIndex) {
        assert!(
            self.elements[index].is_leaf(),
            "Cannot refine an element twice"
        );

        let vertices = self.elements[index].vertices;
        let marker = self.elements[index].marker;
        let edge_boundary = self.elements[index].edge_boundary;
        let edge_markers = self.elements[index].edge_markers;

        let midpoints: [usize; 4] = std::array::from_fn(|e| {
            self.midpoint_vertex(vertices[e], vertices[(e + 1) % 4])
        });
        let center = {
            let sum = vertices
                .iter()
                .fold(nalgebra::Vector2::zeros(), |acc, &v| acc + self.vertices[v].coords);
            let v = self.vertices.len();
            self.vertices.push(Point2::from(sum * 0.25));
            v
        };

        let first_child = self.elements.len();
        let mut children = [0; 4];
        for son in 0..4usize {
            // Son `son` has corner `son` of the parent, the midpoints of edges
            // `son` and `son + 3`, and the center.
            let mut son_vertices = [0; 4];
            son_vertices[son] = vertices[son];
            son_vertices[(son + 1) % 4] = midpoints[son];
            son_vertices[(son + 2) % 4] = center;
            son_vertices[(son + 3) % 4] = midpoints[(son + 3) % 4];

            let mut son_edge_boundary = [false; 4];
            let mut son_edge_markers = [0; 4];
            // Edge `son` lies on parent edge `son`, edge `son + 3` on parent
            // edge `son + 3`; the remaining two edges are interior.
            son_edge_boundary[son] = edge_boundary[son];
            son_edge_markers[son] = edge_markers[son];
            son_edge_boundary[(son + 3) % 4] = edge_boundary[(son + 3) % 4];
            son_edge_markers[(son + 3) % 4] = edge_markers[(son + 3) % 4];

            children[son] = first_child + son;
            self.elements.push(Element {
                vertices: son_vertices,
                parent: Some(index),
                children: None,
                son: son as u8,
                marker,
                edge_boundary: son_edge_boundary,
                edge_markers: son_edge_markers,
            });
        }

        self.elements[index].children = Some(children);
        self.seq += 1;
    }

    /// Refines every active element once.
    pub fn refine_all(&mut self) {
        let leaves: Vec<_> = self.active_elements().collect();
        for leaf in leaves {
            self.refine_element(leaf);
        }
    }

    /// Whether two meshes share the same base partition and may be traversed
    /// jointly.
    pub fn shares_base_with(&self, other: &Mesh) -> bool {
        self.num_base_elements == other.num_base_elements
            && (0..self.num_base_elements)
                .all(|i| self.elements[i].vertices == other.elements[i].vertices)
    }
}

/// A uniform `cells_per_dim` x `cells_per_dim` quadrilateral mesh of the unit
/// square, boundary marker 1.
pub fn create_unit_square_uniform_quad_mesh_2d(cells_per_dim: usize) -> Mesh {
    assert!(cells_per_dim > 0);
    let n = cells_per_dim;
    let h = 1.0 / n as f64;
    let mut vertices = Vec::with_capacity((n + 1) * (n + 1));
    for j in 0..=n {
        for i in 0..=n {
            vertices.push(Point2::new(i as f64 * h, j as f64 * h));
        }
    }
    let vertex = |i: usize, j: usize| j * (n + 1) + i;
    let mut cells = Vec::with_capacity(n * n);
    for j in 0..n {
        for i in 0..n {
            cells.push([
                vertex(i, j),
                vertex(i + 1, j),
                vertex(i + 1, j + 1),
                vertex(i, j + 1),
            ]);
        }
    }
    Mesh::from_vertices_and_cells(vertices, &cells, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_square_mesh_has_expected_counts() {
        let mesh = create_unit_square_uniform_quad_mesh_2d(2);
        assert_eq!(mesh.num_base_elements(), 4);
        assert_eq!(mesh.num_vertices(), 9);
        assert_eq!(mesh.active_elements().count(), 4);
        // Interior edges have neighbors, boundary edges do not.
        assert_eq!(mesh.base_neighbor(0, 1), Some((1, 3)));
        assert_eq!(mesh.base_neighbor(0, 0), None);
        assert!(mesh.element(0).edge_is_boundary(0));
        assert!(!mesh.element(0).edge_is_boundary(1));
    }

    #[test]
    fn refinement_creates_four_sons_and_bumps_seq() {
        let mut mesh = create_unit_square_uniform_quad_mesh_2d(1);
        assert_eq!(mesh.seq(), 0);
        mesh.refine_element(0);
        assert_eq!(mesh.seq(), 1);
        assert_eq!(mesh.num_elements(), 5);
        assert_eq!(mesh.active_elements().count(), 4);

        let children = *mesh.element(0).children().unwrap();
        for (son, &child) in children.iter().enumerate() {
            assert_eq!(mesh.element(child).son(), son as u8);
            assert_eq!(mesh.element(child).parent(), Some(0));
        }
        // Son 0 keeps the parent's corner 0.
        assert_eq!(
            mesh.element(children[0]).vertices()[0],
            mesh.element(0).vertices()[0]
        );
        // Sibling sons share the refinement center.
        assert_eq!(
            mesh.element(children[0]).vertices()[2],
            mesh.element(children[2]).vertices()[0]
        );
    }

    #[test]
    fn refinement_shares_midpoint_vertices_between_siblings() {
        let mut mesh = create_unit_square_uniform_quad_mesh_2d(1);
        mesh.refine_element(0);
        let children = *mesh.element(0).children().unwrap();
        // Son 0 corner 1 and son 1 corner 0 are both the midpoint of edge 0.
        assert_eq!(
            mesh.element(children[0]).vertices()[1],
            mesh.element(children[1]).vertices()[0]
        );
        // 4 midpoints + 1 center on top of the original 4 vertices.
        assert_eq!(mesh.num_vertices(), 9);
    }

    #[test]
    fn sub_path_apply_nests_quarters() {
        let mut path = SubPath::new();
        path.push(0);
        path.push(2);
        // Son 0 then son 2: the center of the innermost square is the center of
        // quarter 2 of quarter 0.
        let p = path.apply(&Point2::new(0.0, 0.0));
        assert_eq!(p, Point2::new(-0.25, -0.25));
        assert_ne!(path.index(), SubPath::from_slice(&[2, 0]).index());
        assert_eq!(SubPath::new().index(), 0);
    }

    #[test]
    fn edge_markers_propagate_to_descendants() {
        let mut mesh = create_unit_square_uniform_quad_mesh_2d(1);
        mesh.refine_element(0);
        mesh.set_edge_marker(0, 0, 7);
        let children = *mesh.element(0).children().unwrap();
        assert_eq!(mesh.element(children[0]).edge_marker(0), 7);
        assert_eq!(mesh.element(children[1]).edge_marker(0), 7);
        assert_eq!(mesh.element(children[2]).edge_marker(0), 0);
    }
}
