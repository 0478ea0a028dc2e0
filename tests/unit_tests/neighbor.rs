use conflux::assembly::neighbor::NeighborSearch;
use conflux::mesh::{create_unit_square_uniform_quad_mesh_2d, Mesh, SubPath};
use conflux::refmap::RefMap;
use proptest::collection::vec;
use proptest::prelude::*;

fn randomly_refined_mesh(choices: &[u8]) -> Mesh {
    let mut mesh = create_unit_square_uniform_quad_mesh_2d(2);
    for &choice in choices {
        let leaves: Vec<_> = mesh.active_elements().collect();
        mesh.refine_element(leaves[choice as usize % leaves.len()]);
    }
    mesh
}

proptest! {
    /// For every inner edge of every leaf, the neighbor entries must tile the
    /// edge exactly, with each sub-edge geometrically coinciding with the
    /// matching sub-edge seen from the neighbor, in opposite orientation.
    #[test]
    fn neighbor_segments_tile_inner_edges(choices in vec(any::<u8>(), 0..6)) {
        let mesh = randomly_refined_mesh(&choices);
        for element in mesh.active_elements() {
            for edge in 0..4u8 {
                if mesh.element(element).edge_is_boundary(edge) {
                    continue;
                }
                let search = NeighborSearch::new(&mesh, element, edge, &SubPath::new()).unwrap();
                prop_assert!(!search.entries().is_empty());

                let corners = mesh.element_corners(element);
                let (start, end) = RefMap::from_corners(corners).edge_endpoints(edge);
                let full_length = (end - start).norm();

                let mut covered = 0.0;
                for entry in search.entries() {
                    let central = RefMap::for_sub_element(corners, &entry.central_path)
                        .edge_endpoints(edge);
                    covered += (central.1 - central.0).norm();

                    let far_corners = mesh.element_corners(entry.neighbor);
                    let far = RefMap::for_sub_element(far_corners, &entry.neighbor_path)
                        .edge_endpoints(entry.neighbor_edge);
                    prop_assert!((central.0 - far.1).norm() < 1e-12);
                    prop_assert!((central.1 - far.0).norm() < 1e-12);
                }
                prop_assert!((covered - full_length).abs() < 1e-12);
            }
        }
    }
}

#[test]
fn boundary_edges_have_no_neighbors() {
    let mesh = create_unit_square_uniform_quad_mesh_2d(1);
    for edge in 0..4u8 {
        let search = NeighborSearch::new(&mesh, 0, edge, &SubPath::new()).unwrap();
        assert!(search.is_boundary());
        assert!(search.entries().is_empty());
    }
}
