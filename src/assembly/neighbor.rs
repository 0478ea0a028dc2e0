//! Neighbor search across element edges of hierarchically refined meshes.
//!
//! Since refinement is unconstrained, the elements on the two sides of an edge
//! may sit at different depths of their trees. A [`NeighborSearch`] resolves
//! one side: given an active central element, an edge and a pending
//! sub-element path, it finds every active element on the other side together
//! with the sub-element transformations that restrict both traces to the
//! shared edge segment.
//!
//! When several meshes meet at the same edge, each mesh's search may partition
//! the edge differently. A [`NeighborTree`] collects the central paths of all
//! searches into one binary tree of edge bisections; aligning each search with
//! the tree's leaves yields a common finest partition over which all traces
//! can be integrated jointly.

use crate::mesh::{ElementIndex, Mesh, SubPath};
use eyre::{bail, eyre, Result};

/// The bisection bit of son `son` on edge `edge`: 0 for the first half, 1 for
/// the second, `None` if the son does not touch the edge.
pub(crate) fn bisection_bit(son: u8, edge: u8) -> Option<u8> {
    if son == edge {
        Some(0)
    } else if son == (edge + 1) % 4 {
        Some(1)
    } else {
        None
    }
}

/// The son covering half `bit` of edge `edge`.
pub(crate) fn edge_son(edge: u8, bit: u8) -> u8 {
    if bit == 0 {
        edge
    } else {
        (edge + 1) % 4
    }
}

/// One active element on the far side of an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub neighbor: ElementIndex,
    /// The neighbor's local index of the shared edge.
    pub neighbor_edge: u8,
    /// Sub-element transformations below the central pending sub-element that
    /// restrict the central trace to the shared segment.
    pub central_path: SubPath,
    /// Sub-element transformations restricting the neighbor trace.
    pub neighbor_path: SubPath,
}

/// All neighbors across one edge of a (sub-)element.
#[derive(Debug, Clone)]
pub struct NeighborSearch {
    central: ElementIndex,
    edge: u8,
    entries: Vec<NeighborEntry>,
}

impl NeighborSearch {
    /// Finds the neighbors across edge `edge` of the sub-element of `central`
    /// given by `pending`.
    ///
    /// The edge need not lie on the boundary of `central` itself: a pending
    /// son that does not touch it makes the edge interior to the element, and
    /// the far side is then a sibling sub-element of `central`, which acts as
    /// its own neighbor. For boundary edges the search is empty.
    pub fn new(
        mesh: &Mesh,
        central: ElementIndex,
        edge: u8,
        pending: &SubPath,
    ) -> Result<Self> {
        debug_assert!(mesh.element(central).is_leaf());

        // Climb through the pending sub-elements first, recording which half
        // of the shared edge each one occupies. A son that does not touch the
        // edge is the sibling case: the far side is the adjacent sub-element
        // of the same element, with the collected bits restricting its trace.
        let mut pending_bits_fine_first = Vec::new();
        let sons = pending.as_slice();
        for (depth, &son) in sons.iter().enumerate().rev() {
            match bisection_bit(son, edge) {
                Some(bit) => pending_bits_fine_first.push(bit),
                None => {
                    let (sibling, far_edge) = if edge == (son + 1) % 4 {
                        ((son + 1) % 4, (son + 3) % 4)
                    } else {
                        ((son + 3) % 4, son)
                    };
                    let mut neighbor_path = SubPath::new();
                    for &above in &sons[..depth] {
                        neighbor_path.push(above);
                    }
                    neighbor_path.push(sibling);
                    // Opposite orientation on the far side.
                    for &bit in pending_bits_fine_first.iter().rev() {
                        neighbor_path.push(edge_son(far_edge, 1 - bit));
                    }
                    return Ok(Self {
                        central,
                        edge,
                        entries: vec![NeighborEntry {
                            neighbor: central,
                            neighbor_edge: far_edge,
                            central_path: SubPath::new(),
                            neighbor_path,
                        }],
                    });
                }
            }
        }

        // The edge lies on the element's boundary. Climb towards the root,
        // recording which half of the shared edge the current element
        // occupies, until the far side's subtree root is known.
        let mut bits_fine_first = Vec::new();
        let mut current = central;
        let (far_root, far_edge) = loop {
            let element = mesh.element(current);
            match element.parent() {
                Some(parent) => {
                    let son = element.son();
                    if let Some(bit) = bisection_bit(son, edge) {
                        bits_fine_first.push(bit);
                        current = parent;
                    } else {
                        // The edge is interior to the parent; the far side is
                        // a sibling.
                        let children = mesh.element(parent).children().ok_or_else(|| {
                            eyre!("Element {current} has a parent without children")
                        })?;
                        break if edge == (son + 1) % 4 {
                            (children[(son as usize + 1) % 4], (son + 3) % 4)
                        } else {
                            (children[(son as usize + 3) % 4], son)
                        };
                    }
                }
                None => match mesh.base_neighbor(current, edge) {
                    Some((neighbor, neighbor_edge)) => break (neighbor, neighbor_edge),
                    None => {
                        return Ok(Self {
                            central,
                            edge,
                            entries: Vec::new(),
                        })
                    }
                },
            }
        };

        let mut bits: Vec<u8> = bits_fine_first.into_iter().rev().collect();
        bits.extend(pending_bits_fine_first.into_iter().rev());

        let mut entries = Vec::new();
        let mut central_extra = SubPath::new();
        descend(
            mesh,
            far_root,
            far_edge,
            &bits,
            edge,
            &mut central_extra,
            &mut entries,
        );
        Ok(Self {
            central,
            edge,
            entries,
        })
    }

    pub fn central(&self) -> ElementIndex {
        self.central
    }

    pub fn edge(&self) -> u8 {
        self.edge
    }

    /// The neighbor entries, ordered along the central edge orientation.
    pub fn entries(&self) -> &[NeighborEntry] {
        &self.entries
    }

    pub fn is_boundary(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refines the entries so that their central paths coincide with the
    /// leaves of `tree`.
    ///
    /// Every entry whose central path ends at an interior node of the tree is
    /// replaced by one entry per leaf below it, with both traces restricted
    /// accordingly. Fails if an entry's central path is not a node of the
    /// tree, which indicates the tree was built from a different edge.
    pub fn align_with_tree(&mut self, tree: &NeighborTree) -> Result<UpdateOutcome> {
        let mut aligned = Vec::with_capacity(self.entries.len());
        let mut replaced = false;
        for entry in self.entries.drain(..) {
            let bits = path_to_bits(&entry.central_path, self.edge)
                .ok_or_else(|| eyre!("Central path leaves edge {}", self.edge))?;
            let node = tree
                .find(&bits)
                .ok_or_else(|| eyre!("Central path missing from the neighbor tree"))?;
            let suffixes = tree.leaf_suffixes(node);
            if suffixes.len() == 1 && suffixes[0].is_empty() {
                aligned.push(entry);
                continue;
            }
            replaced = true;
            for suffix in suffixes {
                let mut central_path = entry.central_path.clone();
                let mut neighbor_path = entry.neighbor_path.clone();
                for &bit in &suffix {
                    central_path.push(edge_son(self.edge, bit));
                    // Opposite orientation on the far side.
                    neighbor_path.push(edge_son(entry.neighbor_edge, 1 - bit));
                }
                aligned.push(NeighborEntry {
                    central_path,
                    neighbor_path,
                    ..entry.clone()
                });
            }
        }
        self.entries = aligned;
        Ok(if replaced {
            UpdateOutcome::Replaced(self.entries.len())
        } else {
            UpdateOutcome::Unchanged
        })
    }
}

/// Result of aligning a search with a neighbor tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Unchanged,
    /// Entries were split; the new total entry count.
    Replaced(usize),
}

fn descend(
    mesh: &Mesh,
    element: ElementIndex,
    far_edge: u8,
    bits: &[u8],
    central_edge: u8,
    central_extra: &mut SubPath,
    entries: &mut Vec<NeighborEntry>,
) {
    match mesh.element(element).children() {
        None => {
            // Active neighbor. Remaining bits restrict its trace to the
            // central segment; the far side sees the edge reversed.
            let mut neighbor_path = SubPath::new();
            for &bit in bits {
                neighbor_path.push(edge_son(far_edge, 1 - bit));
            }
            entries.push(NeighborEntry {
                neighbor: element,
                neighbor_edge: far_edge,
                central_path: central_extra.clone(),
                neighbor_path,
            });
        }
        Some(children) => {
            if let Some((&bit, rest)) = bits.split_first() {
                let child = children[edge_son(far_edge, 1 - bit) as usize];
                descend(mesh, child, far_edge, rest, central_edge, central_extra, entries);
            } else {
                // The far side is finer: split the central trace, walking the
                // segments along the central orientation.
                for central_bit in [0u8, 1] {
                    let child = children[edge_son(far_edge, 1 - central_bit) as usize];
                    central_extra.push(edge_son(central_edge, central_bit));
                    descend(
                        mesh,
                        child,
                        far_edge,
                        &[],
                        central_edge,
                        central_extra,
                        entries,
                    );
                    central_extra.pop();
                }
            }
        }
    }
}

/// Converts a central path of edge sons back into bisection bits.
fn path_to_bits(path: &SubPath, edge: u8) -> Option<Vec<u8>> {
    path.as_slice()
        .iter()
        .map(|&son| bisection_bit(son, edge))
        .collect()
}

/// A binary tree of edge bisections shared by all meshes meeting at one edge.
///
/// Nodes are stored in an arena; child links are indices. The root represents
/// the whole edge.
#[derive(Debug, Clone)]
pub struct NeighborTree {
    nodes: Vec<[Option<usize>; 2]>,
}

impl Default for NeighborTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NeighborTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![[None, None]],
        }
    }

    /// Inserts a bisection path, creating missing nodes.
    pub fn insert(&mut self, bits: &[u8]) {
        let mut node = 0;
        for &bit in bits {
            node = match self.nodes[node][bit as usize] {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push([None, None]);
                    self.nodes[node][bit as usize] = Some(child);
                    child
                }
            };
        }
    }

    /// Inserts the central paths of a search, interpreted on its edge.
    pub fn insert_search(&mut self, search: &NeighborSearch) -> Result<()> {
        for entry in search.entries() {
            let bits = path_to_bits(&entry.central_path, search.edge())
                .ok_or_else(|| eyre!("Central path leaves edge {}", search.edge()))?;
            self.insert(&bits);
        }
        Ok(())
    }

    fn find(&self, bits: &[u8]) -> Option<usize> {
        let mut node = 0;
        for &bit in bits {
            node = self.nodes[node][bit as usize]?;
        }
        Some(node)
    }

    /// A bisection covers both halves or none.
    fn verify_node(&self, node: usize) -> Result<()> {
        let [left, right] = self.nodes[node];
        if left.is_some() != right.is_some() {
            bail!("Neighbor tree bisects only one half of an edge segment");
        }
        for child in [left, right].into_iter().flatten() {
            self.verify_node(child)?;
        }
        Ok(())
    }

    /// Checks that the tree's leaves tile the edge completely.
    pub fn verify(&self) -> Result<()> {
        self.verify_node(0)
    }

    fn collect_suffixes(&self, node: usize, prefix: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
        let [left, right] = self.nodes[node];
        if left.is_none() && right.is_none() {
            out.push(prefix.clone());
            return;
        }
        for (bit, child) in [left, right].into_iter().enumerate() {
            if let Some(child) = child {
                prefix.push(bit as u8);
                self.collect_suffixes(child, prefix, out);
                prefix.pop();
            }
        }
    }

    /// The bit paths from `node` down to each leaf below it, ordered along the
    /// edge.
    fn leaf_suffixes(&self, node: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.collect_suffixes(node, &mut Vec::new(), &mut out);
        out
    }

    /// The number of leaves, i.e. segments of the common partition.
    pub fn num_segments(&self) -> usize {
        self.leaf_suffixes(0).len()
    }

    /// The bit paths of all segments, ordered along the edge.
    pub fn segments(&self) -> Vec<Vec<u8>> {
        self.leaf_suffixes(0)
    }
}
