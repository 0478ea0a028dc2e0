use std::sync::Arc;

use conflux::mesh::create_unit_square_uniform_quad_mesh_2d;
use conflux::nalgebra::{DMatrix, DVector};
use conflux::{Assembler, Continuity, Form, OrderPolicy, Space, WeakForm};
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};

fn continuous_space(cells: usize, degree: u32) -> Arc<Space> {
    let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(cells));
    let mut space = Space::new(mesh, degree, Continuity::Continuous);
    space.assign_dofs().unwrap();
    Arc::new(space)
}

fn single_space_assembler(space: Arc<Space>, form: Form) -> Assembler {
    let mut wf = WeakForm::new(1);
    wf.add_form(form).unwrap();
    Assembler::new(vec![space], wf).unwrap()
}

fn assembled_dense(assembler: &mut Assembler) -> DMatrix<f64> {
    let mut matrix = assembler.create_sparse_structure().unwrap();
    assembler.assemble_matrix(&mut matrix).unwrap();
    DMatrix::from(&matrix)
}

#[test]
fn poisson_with_dirichlet_walls_reduces_to_the_center_dof() {
    let mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(2));
    let mut space = Space::new(mesh, 1, Continuity::Continuous);
    space.set_essential_bc(|_, _| Some(0.0));
    space.assign_dofs().unwrap();

    let mut wf = WeakForm::new(1);
    wf.add_form(Form::volume_matrix(0, 0, |u, v, _, _| u.grad.dot(&v.grad)).symmetric())
        .unwrap();
    wf.add_form(Form::volume_vector(0, |v, _, _| v.value)).unwrap();
    let mut assembler = Assembler::new(vec![Arc::new(space)], wf).unwrap();

    // Only the center vertex of the 2x2 grid is unconstrained.
    assert_eq!(assembler.num_dofs(), 1);
    let mut matrix = assembler.create_sparse_structure().unwrap();
    let mut rhs = DVector::zeros(1);
    assembler
        .assemble(Some(&mut matrix), Some(&mut rhs), None, false)
        .unwrap();

    // The bilinear stiffness diagonal is 2/3 per element regardless of size,
    // and the hat function integrates to h^2.
    let diag = matrix.get_entry(0, 0).unwrap().into_value();
    assert_scalar_eq!(diag, 8.0 / 3.0, comp = abs, tol = 1e-13);
    assert_scalar_eq!(rhs[0], 0.25, comp = abs, tol = 1e-13);
}

#[test]
fn multimesh_mass_coupling_integrates_to_the_domain_area() {
    let coarse = continuous_space(2, 1);
    let mut fine_mesh = create_unit_square_uniform_quad_mesh_2d(2);
    fine_mesh.refine_all();
    let mut fine = Space::new(Arc::new(fine_mesh), 1, Continuity::Continuous);
    fine.assign_dofs().unwrap();

    let mut wf = WeakForm::new(2);
    wf.add_form(Form::volume_matrix(0, 1, |u, v, _, _| u.value * v.value))
        .unwrap();
    let mut assembler = Assembler::new(vec![coarse, Arc::new(fine)], wf).unwrap();
    assert_eq!(assembler.num_dofs(), 9 + 25);

    let mut matrix = assembler.create_sparse_structure().unwrap();
    assembler.assemble_matrix(&mut matrix).unwrap();

    // Both bases are partitions of unity, so the entries of the coupling
    // block sum to the area of the unit square. Every traversal state pairs
    // a fine leaf with a pending sub-element of a coarse element.
    let total: f64 = matrix.values().iter().sum();
    assert_scalar_eq!(total, 1.0, comp = abs, tol = 1e-12);
}

#[test]
fn repeated_assembly_is_bitwise_deterministic() {
    let space = continuous_space(4, 2);
    let form = Form::volume_matrix(0, 0, |u, v, _, _| u.grad.dot(&v.grad) + u.value * v.value);
    let mut assembler = single_space_assembler(space, form);

    let mut first = assembler.create_sparse_structure().unwrap();
    assembler.assemble_matrix(&mut first).unwrap();
    // The second pass runs against a warm cache and must reproduce the exact
    // same floating point values.
    let mut second = assembler.create_sparse_structure().unwrap();
    assembler.assemble_matrix(&mut second).unwrap();
    assert_eq!(first.values(), second.values());
}

#[test]
fn adaptive_quadrature_matches_a_high_fixed_order() {
    let weighted_mass = |order: OrderPolicy| {
        Form::volume_matrix(0, 0, |u, v, g, _| {
            (g.x.x + g.x.y).exp() * u.value * v.value
        })
        .with_order(order)
    };

    let mut fixed = single_space_assembler(
        continuous_space(2, 1),
        weighted_mass(OrderPolicy::Fixed(16)),
    );
    let mut adaptive = single_space_assembler(
        continuous_space(2, 1),
        weighted_mass(OrderPolicy::Adaptive {
            rel_tol: 1e-7,
            max_depth: 8,
            start_order: 4,
        }),
    );

    let reference = assembled_dense(&mut fixed);
    let refined = assembled_dense(&mut adaptive);
    assert_matrix_eq!(refined, reference, comp = abs, tol = 1e-7);
}

#[test]
fn dg_jump_penalty_vanishes_on_constants() {
    let mut mesh = create_unit_square_uniform_quad_mesh_2d(2);
    mesh.refine_element(1);
    let mut space = Space::new(Arc::new(mesh), 0, Continuity::Discontinuous);
    space.assign_dofs().unwrap();
    assert_eq!(space.num_dofs(), Some(7));

    let form = Form::dg_matrix(0, 0, |u, v, _, _| {
        (u.central.value - u.neighbor.value) * (v.central.value - v.neighbor.value)
    });
    let mut assembler = single_space_assembler(Arc::new(space), form);
    let dense = assembled_dense(&mut assembler);

    // Visiting every inner edge from both sides keeps the penalty symmetric,
    // and jumps of the constant function vanish even across the hanging
    // edges of the refined element.
    assert_matrix_eq!(dense, dense.transpose(), comp = abs, tol = 1e-13);
    let ones = DVector::from_element(7, 1.0);
    assert!((&dense * ones).amax() < 1e-13);
    for i in 0..7 {
        assert!(dense[(i, i)] > 0.0);
    }
}

#[test]
fn previous_iterate_scales_the_mass_matrix() {
    let mut plain = single_space_assembler(
        continuous_space(2, 1),
        Form::volume_matrix(0, 0, |u, v, _, _| u.value * v.value),
    );
    let mass = assembled_dense(&mut plain);

    let form = Form::volume_matrix(0, 0, |u, v, _, ext| ext[0].value * u.value * v.value);
    let mut assembler = single_space_assembler(continuous_space(2, 1), form);
    let mut matrix = assembler.create_sparse_structure().unwrap();
    let iterate = DVector::from_element(9, 3.0);
    assembler
        .assemble(
            Some(&mut matrix),
            None::<&mut DVector<f64>>,
            Some(&iterate),
            false,
        )
        .unwrap();

    assert_matrix_eq!(DMatrix::from(&matrix), mass * 3.0, comp = abs, tol = 1e-13);
}

#[test]
fn absent_iterate_reads_as_zero_external_functions() {
    let mass = assembled_dense(&mut single_space_assembler(
        continuous_space(2, 1),
        Form::volume_matrix(0, 0, |u, v, _, _| u.value * v.value),
    ));

    // Without an iterate the external function argument is the zero function,
    // so the shifted coefficient reduces to 1.
    let form =
        Form::volume_matrix(0, 0, |u, v, _, ext| (1.0 + ext[0].value) * u.value * v.value);
    let mut assembler = single_space_assembler(continuous_space(2, 1), form);
    let shifted = assembled_dense(&mut assembler);
    assert_matrix_eq!(shifted, mass, comp = abs, tol = 1e-13);
}

#[test]
fn uncoupled_spaces_may_live_on_unrelated_base_partitions() {
    // No form couples the two spaces, so each stage traverses only its own
    // mesh and the differing base partitions never meet.
    let mut wf = WeakForm::new(2);
    wf.add_form(Form::volume_matrix(0, 0, |u, v, _, _| u.value * v.value))
        .unwrap();
    wf.add_form(Form::volume_matrix(1, 1, |u, v, _, _| u.value * v.value))
        .unwrap();
    let mut assembler =
        Assembler::new(vec![continuous_space(2, 1), continuous_space(3, 1)], wf).unwrap();

    let mut matrix = assembler.create_sparse_structure().unwrap();
    assembler.assemble_matrix(&mut matrix).unwrap();
    let dense = DMatrix::from(&matrix);

    // Each diagonal mass block sums to the domain area (partition of unity).
    assert_scalar_eq!(dense.view((0, 0), (9, 9)).sum(), 1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(dense.view((9, 9), (16, 16)).sum(), 1.0, comp = abs, tol = 1e-12);
}

#[test]
fn multimesh_dg_jump_couples_a_refined_mesh_to_its_base() {
    let coarse_mesh = Arc::new(create_unit_square_uniform_quad_mesh_2d(2));
    let mut coarse = Space::new(coarse_mesh, 0, Continuity::Discontinuous);
    coarse.assign_dofs().unwrap();
    let mut fine_mesh = create_unit_square_uniform_quad_mesh_2d(2);
    fine_mesh.refine_all();
    let mut fine = Space::new(Arc::new(fine_mesh), 0, Continuity::Discontinuous);
    fine.assign_dofs().unwrap();

    // Every fine-mesh inner edge inside a coarse element makes that edge
    // interior to the coarse element, which then neighbors itself through a
    // sibling sub-element.
    let mut wf = WeakForm::new(2);
    wf.add_form(Form::dg_matrix(0, 1, |u, v, _, _| {
        (u.central.value - u.neighbor.value) * (v.central.value - v.neighbor.value)
    }))
    .unwrap();
    let mut assembler = Assembler::new(vec![Arc::new(coarse), Arc::new(fine)], wf).unwrap();
    assert_eq!(assembler.num_dofs(), 4 + 16);

    let mut dense = DMatrix::zeros(20, 20);
    assembler.assemble_matrix(&mut dense).unwrap();

    // The coupling block is populated, and jumps of the globally constant
    // fine function vanish on every edge segment.
    let coupling = dense.view((0, 4), (4, 16));
    assert!(coupling.amax() > 0.0);
    let ones = DVector::from_element(16, 1.0);
    assert!((coupling * ones).amax() < 1e-13);
    // The form writes to block (0, 1) only.
    assert!(dense.view((0, 0), (4, 4)).amax() == 0.0);
    assert!(dense.view((4, 0), (16, 4)).amax() == 0.0);
}

#[test]
fn marked_surface_load_integrates_over_its_edges() {
    let mut mesh = create_unit_square_uniform_quad_mesh_2d(2);
    // The two bottom elements; edge 0 runs along y = 0.
    mesh.set_edge_marker(0, 0, 7);
    mesh.set_edge_marker(1, 0, 7);
    let mut space = Space::new(Arc::new(mesh), 1, Continuity::Continuous);
    space.assign_dofs().unwrap();

    let mut wf = WeakForm::new(1);
    wf.add_form(Form::surface_vector(0, |v, _, _| v.value).with_marker(7))
        .unwrap();
    let mut assembler = Assembler::new(vec![Arc::new(space)], wf).unwrap();
    let mut rhs = DVector::zeros(assembler.num_dofs());
    assembler.assemble_vector(&mut rhs).unwrap();

    // Partition of unity on the marked side only.
    assert_scalar_eq!(rhs.sum(), 1.0, comp = abs, tol = 1e-13);
}
