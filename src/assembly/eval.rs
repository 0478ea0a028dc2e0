//! Evaluation of weak form integrals on traversal states.
//!
//! For every [`State`] the evaluator integrates the applicable forms over the
//! state's cell (volume forms), its boundary edges (surface forms) and its
//! inner edges (DG forms), producing local dense contributions together with
//! the assembly lists needed to scatter them. Inner edges are visited once
//! from each side; DG integrands must be written accordingly.
//!
//! Quadrature orders follow the form's [`OrderPolicy`]; the adaptive policy
//! recursively subdivides the integration domain, comparing estimates of
//! consecutive orders on the sub-domains until the requested relative accuracy
//! is reached.

use crate::assembly::cache::{
    AffineKey, AssemblingCache, GeneralKey, ShapeValues, VOLUME_DOMAIN,
};
use crate::assembly::neighbor::{edge_son, NeighborSearch, NeighborTree};
use crate::assembly::traversal::{Stage, State};
use crate::mesh::{ElementIndex, SubPath};
use crate::refmap::{edge_reference_point, RefMap};
use crate::solution::Solution;
use crate::space::{DofEntry, Space};
use crate::weak_form::{
    DgFunc, Form, FuncPoint, GeomPoint, Integrand, OrderPolicy, Symmetry,
};
use eyre::{eyre, Result};
use log::warn;
use nalgebra::{DMatrix, DVector, Point2, Vector2};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Domain tag for edge quadrature points traversed against the edge
/// orientation, as seen from the neighboring element.
fn reversed_edge_domain(edge: u8) -> u8 {
    8 + edge
}

/// A dense local matrix contribution with its scatter targets.
#[derive(Debug, Clone)]
pub(crate) struct LocalMatrix {
    pub test_space: usize,
    pub trial_space: usize,
    pub rows: Vec<DofEntry>,
    pub cols: Vec<DofEntry>,
    pub values: DMatrix<f64>,
    pub symmetry: Symmetry,
}

/// A dense local vector contribution with its scatter targets.
#[derive(Debug, Clone)]
pub(crate) struct LocalVector {
    pub test_space: usize,
    pub rows: Vec<DofEntry>,
    pub values: DVector<f64>,
}

/// The integration domain of one cell evaluation.
#[derive(Debug, Clone, Copy)]
enum CellDomain {
    Volume,
    Edge(u8),
}

impl CellDomain {
    fn tag(&self) -> u8 {
        match self {
            CellDomain::Volume => VOLUME_DOMAIN,
            CellDomain::Edge(edge) => *edge,
        }
    }

    /// The sons an adaptive subdivision of this domain descends into.
    fn sons(&self) -> &'static [u8] {
        const VOLUME_SONS: [u8; 4] = [0, 1, 2, 3];
        const EDGE_SONS: [[u8; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];
        match self {
            CellDomain::Volume => &VOLUME_SONS,
            CellDomain::Edge(edge) => &EDGE_SONS[*edge as usize],
        }
    }
}

/// Quadrature points, weights and geometry on one cell (or cell edge).
struct CellGeometry {
    points: Vec<Point2<f64>>,
    jxw: Vec<f64>,
    geom: Vec<GeomPoint>,
}

fn concat(head: &SubPath, tail: &SubPath) -> SubPath {
    let mut path = head.clone();
    for &son in tail.as_slice() {
        path.push(son);
    }
    path
}

/// Evaluates the forms of one stage on its states.
pub(crate) struct StateAssembler<'a> {
    spaces: &'a [Arc<Space>],
    stage: &'a Stage,
    /// Previous-iterate functions indexed like `spaces`; empty when no
    /// iterate is supplied, in which case the external functions are zero.
    ext: &'a [Solution],
    cache: &'a mut AssemblingCache,
    /// Quadrature geometry of the current state, keyed by domain tag,
    /// sub-path index, order and marker. Valid for one state only.
    geometry: FxHashMap<(u8, u64, u32, i32), Rc<CellGeometry>>,
}

impl<'a> StateAssembler<'a> {
    pub fn new(
        spaces: &'a [Arc<Space>],
        stage: &'a Stage,
        ext: &'a [Solution],
        cache: &'a mut AssemblingCache,
    ) -> Self {
        Self {
            spaces,
            stage,
            ext,
            cache,
            geometry: FxHashMap::default(),
        }
    }

    /// Integrates every applicable form on `state` and collects the local
    /// contributions.
    pub fn assemble_state(
        &mut self,
        state: &State,
        forms: &[&Form],
        assemble_matrix: bool,
        assemble_vector: bool,
        matrices: &mut Vec<LocalMatrix>,
        vectors: &mut Vec<LocalVector>,
    ) -> Result<()> {
        self.geometry.clear();
        let mut dg_forms = Vec::new();
        for &form in forms {
            match form.integrand() {
                Integrand::VolumeMatrix(f) => {
                    if assemble_matrix && form.marker().matches(state.marker) {
                        for &(test, trial) in form.matrix_blocks() {
                            let values = self.matrix_local(
                                state,
                                CellDomain::Volume,
                                state.marker,
                                form,
                                test,
                                trial,
                                f,
                            )?;
                            matrices.push(self.matrix_contribution(
                                state, form, test, trial, values,
                            ));
                        }
                    }
                }
                Integrand::VolumeVector(f) => {
                    if assemble_vector && form.marker().matches(state.marker) {
                        for &test in form.vector_blocks() {
                            let values = self.vector_local(
                                state,
                                CellDomain::Volume,
                                state.marker,
                                form,
                                test,
                                f,
                            )?;
                            vectors.push(LocalVector {
                                test_space: test,
                                rows: self.asm_list(test, state).entries.clone(),
                                values,
                            });
                        }
                    }
                }
                Integrand::SurfaceMatrix(f) => {
                    if assemble_matrix {
                        for edge in 0..4u8 {
                            let marker = state.edge_markers[edge as usize];
                            if state.bnd[edge as usize] && form.marker().matches(marker) {
                                for &(test, trial) in form.matrix_blocks() {
                                    let values = self.matrix_local(
                                        state,
                                        CellDomain::Edge(edge),
                                        marker,
                                        form,
                                        test,
                                        trial,
                                        f,
                                    )?;
                                    matrices.push(self.matrix_contribution(
                                        state, form, test, trial, values,
                                    ));
                                }
                            }
                        }
                    }
                }
                Integrand::SurfaceVector(f) => {
                    if assemble_vector {
                        for edge in 0..4u8 {
                            let marker = state.edge_markers[edge as usize];
                            if state.bnd[edge as usize] && form.marker().matches(marker) {
                                for &test in form.vector_blocks() {
                                    let values = self.vector_local(
                                        state,
                                        CellDomain::Edge(edge),
                                        marker,
                                        form,
                                        test,
                                        f,
                                    )?;
                                    vectors.push(LocalVector {
                                        test_space: test,
                                        rows: self.asm_list(test, state).entries.clone(),
                                        values,
                                    });
                                }
                            }
                        }
                    }
                }
                Integrand::DgMatrix(_) | Integrand::DgVector(_) => dg_forms.push(form),
            }
        }

        if !dg_forms.is_empty() {
            for edge in 0..4u8 {
                if state.is_inner_edge(edge) {
                    self.assemble_dg_edge(
                        state,
                        edge,
                        &dg_forms,
                        assemble_matrix,
                        assemble_vector,
                        matrices,
                        vectors,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn matrix_contribution(
        &self,
        state: &State,
        form: &Form,
        test: usize,
        trial: usize,
        values: DMatrix<f64>,
    ) -> LocalMatrix {
        LocalMatrix {
            test_space: test,
            trial_space: trial,
            rows: self.asm_list(test, state).entries.clone(),
            cols: self.asm_list(trial, state).entries.clone(),
            values,
            symmetry: form.symmetry(),
        }
    }

    fn asm_list(&self, space: usize, state: &State) -> &crate::space::AsmList {
        let local = self
            .stage
            .local_space(space)
            .expect("Form space belongs to the stage");
        let mesh = self.stage.mesh_of_space[local];
        self.spaces[space].element_assembly_list(state.elements[mesh])
    }

    /// The traversal position of a space's mesh in the given state.
    fn space_position<'s>(&self, space: usize, state: &'s State) -> (ElementIndex, &'s SubPath) {
        let local = self
            .stage
            .local_space(space)
            .expect("Form space belongs to the stage");
        let mesh = self.stage.mesh_of_space[local];
        (state.elements[mesh], &state.paths[mesh])
    }

    fn quadrature_order(&self, form: &Form, test: usize, trial: Option<usize>) -> u32 {
        match form.order() {
            OrderPolicy::Fixed(order) => order,
            OrderPolicy::Adaptive { start_order, .. } => start_order,
            OrderPolicy::Computed { extra } => {
                let mut order = self.spaces[test].shapeset().degree() + extra;
                if let Some(trial) = trial {
                    order += self.spaces[trial].shapeset().degree();
                }
                order += self
                    .ext
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| self.stage.local_space(i).is_some())
                    .map(|(_, sol)| sol.space().shapeset().degree())
                    .max()
                    .unwrap_or(0);
                order
            }
        }
    }

    /// Whether the cell's reference mapping has a constant Jacobian.
    fn state_is_affine(&self, state: &State) -> bool {
        RefMap::from_corners(self.stage.state_corners(state)).is_affine()
    }

    fn computed_order(&self, form: &Form, state: &State, test: usize, trial: Option<usize>) -> u32 {
        let base = self.quadrature_order(form, test, trial);
        match form.order() {
            OrderPolicy::Computed { .. } if !self.state_is_affine(state) => base + 2,
            _ => base,
        }
    }

    fn matrix_local(
        &mut self,
        state: &State,
        domain: CellDomain,
        marker: i32,
        form: &Form,
        test: usize,
        trial: usize,
        f: &(dyn Fn(&FuncPoint, &FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync),
    ) -> Result<DMatrix<f64>> {
        let order = self.computed_order(form, state, test, Some(trial));
        let symmetry = if test == trial {
            form.symmetry()
        } else {
            Symmetry::NonSym
        };
        match form.order() {
            OrderPolicy::Adaptive {
                rel_tol, max_depth, ..
            } => self.adaptive_local(domain, rel_tol, max_depth, order, |this, extra, order| {
                this.matrix_cell(state, domain, marker, extra, order, test, trial, f, symmetry)
            }),
            _ => self.matrix_cell(
                state,
                domain,
                marker,
                &SubPath::new(),
                order,
                test,
                trial,
                f,
                symmetry,
            ),
        }
    }

    fn vector_local(
        &mut self,
        state: &State,
        domain: CellDomain,
        marker: i32,
        form: &Form,
        test: usize,
        f: &(dyn Fn(&FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync),
    ) -> Result<DVector<f64>> {
        let order = self.computed_order(form, state, test, None);
        let column = match form.order() {
            OrderPolicy::Adaptive {
                rel_tol, max_depth, ..
            } => self.adaptive_local(domain, rel_tol, max_depth, order, |this, extra, order| {
                this.vector_cell(state, domain, marker, extra, order, test, f)
            })?,
            _ => self.vector_cell(state, domain, marker, &SubPath::new(), order, test, f)?,
        };
        Ok(DVector::from_column_slice(column.as_slice()))
    }

    /// Adaptive refinement of the integration domain. The estimate of order
    /// `order + 1` summed over the sons is compared against the whole-domain
    /// estimate of order `order`; sub-domains that disagree are subdivided
    /// until `rel_tol` is met or `max_depth` is exhausted.
    fn adaptive_local<E>(
        &mut self,
        domain: CellDomain,
        rel_tol: f64,
        max_depth: u32,
        order: u32,
        mut eval: E,
    ) -> Result<DMatrix<f64>>
    where
        E: FnMut(&mut Self, &SubPath, u32) -> Result<DMatrix<f64>>,
    {
        fn recurse<'b, E>(
            this: &mut StateAssembler<'b>,
            eval: &mut E,
            sons: &[u8],
            extra: &mut SubPath,
            order: u32,
            rel_tol: f64,
            depth_left: u32,
        ) -> Result<DMatrix<f64>>
        where
            E: FnMut(&mut StateAssembler<'b>, &SubPath, u32) -> Result<DMatrix<f64>>,
        {
            let coarse = eval(this, extra, order)?;
            let mut fine = DMatrix::zeros(coarse.nrows(), coarse.ncols());
            for &son in sons {
                extra.push(son);
                fine += eval(this, extra, order + 1)?;
                extra.pop();
            }
            let scale = fine.amax().max(coarse.amax());
            let error = (&fine - &coarse).amax();
            if scale == 0.0 || error <= rel_tol * scale {
                return Ok(fine);
            }
            if depth_left == 0 {
                warn!(
                    "Adaptive quadrature stopped at the depth limit \
                     (relative error {:.3e} > {:.3e})",
                    error / scale,
                    rel_tol
                );
                return Ok(fine);
            }
            let mut total = DMatrix::zeros(coarse.nrows(), coarse.ncols());
            for &son in sons {
                extra.push(son);
                total += recurse(this, eval, sons, extra, order, rel_tol, depth_left - 1)?;
                extra.pop();
            }
            Ok(total)
        }

        let mut extra = SubPath::new();
        recurse(
            self,
            &mut eval,
            domain.sons(),
            &mut extra,
            order,
            rel_tol,
            max_depth,
        )
    }

    /// Quadrature points and geometry on the sub-cell reached by `extra`,
    /// shared between all forms integrating the same domain at the same
    /// order on the current state.
    fn cell_geometry(
        &mut self,
        state: &State,
        domain: CellDomain,
        marker: i32,
        extra: &SubPath,
        order: u32,
    ) -> Rc<CellGeometry> {
        let key = (domain.tag(), extra.index(), order, marker);
        if let Some(geometry) = self.geometry.get(&key) {
            return Rc::clone(geometry);
        }
        let corners = self.stage.state_corners(state);
        let refmap = RefMap::for_sub_element(corners, extra);
        let geometry = match domain {
            CellDomain::Volume => {
                let rule = self.cache.volume_rule(order);
                let mut jxw = Vec::with_capacity(rule.points.len());
                let mut geom = Vec::with_capacity(rule.points.len());
                for (&w, point) in rule.weights.iter().zip(&rule.points) {
                    let j_det = refmap.jacobian(point).determinant();
                    jxw.push(w * j_det.abs());
                    geom.push(GeomPoint {
                        x: refmap.map(point),
                        normal: Vector2::zeros(),
                        marker,
                    });
                }
                CellGeometry {
                    points: rule.points.clone(),
                    jxw,
                    geom,
                }
            }
            CellDomain::Edge(edge) => {
                let rule = self.cache.edge_rule(order);
                let normal = refmap.edge_unit_normal(edge);
                let tangent_len = refmap.edge_tangent(edge).norm();
                let points: Vec<_> = rule
                    .points
                    .iter()
                    .map(|&t| edge_reference_point(edge, t))
                    .collect();
                let jxw = rule.weights.iter().map(|&w| w * tangent_len).collect();
                let geom = points
                    .iter()
                    .map(|point| GeomPoint {
                        x: refmap.map(point),
                        normal,
                        marker,
                    })
                    .collect();
                CellGeometry { points, jxw, geom }
            }
        };
        let geometry = Rc::new(geometry);
        self.geometry.insert(key, Rc::clone(&geometry));
        geometry
    }

    /// Values and physical gradients of all shapes of a space on one point
    /// set, read through the cache.
    fn basis_values(
        &mut self,
        space: usize,
        element: ElementIndex,
        path: &SubPath,
        order: u32,
        domain: u8,
        points: &[Point2<f64>],
    ) -> Result<Vec<Rc<ShapeValues>>> {
        let space = &self.spaces[space];
        let shapeset = space.shapeset();
        let refmap = RefMap::from_corners(space.mesh().element_corners(element));
        let sub_idx = path.index();
        let num_shapes = shapeset.num_shapes();
        let mut tables = Vec::with_capacity(num_shapes);

        if let Some(inv) = refmap.constant_inverse_jacobian() {
            for shape in 0..num_shapes {
                let key = AffineKey::new(&inv, shape, order, sub_idx, domain, shapeset.id());
                tables.push(self.cache.affine_values(key, || {
                    let mut value = Vec::with_capacity(points.len());
                    let mut dx = Vec::with_capacity(points.len());
                    let mut dy = Vec::with_capacity(points.len());
                    for point in points {
                        let xi = path.apply(point);
                        let (v, gx, gy) = shapeset.eval(shape, &xi);
                        let grad = inv.transpose() * Vector2::new(gx, gy);
                        value.push(v);
                        dx.push(grad.x);
                        dy.push(grad.y);
                    }
                    ShapeValues { value, dx, dy }
                }));
            }
        } else {
            let inverses = points
                .iter()
                .map(|point| {
                    let xi = path.apply(point);
                    refmap
                        .jacobian(&xi)
                        .try_inverse()
                        .ok_or_else(|| eyre!("Degenerate element {element}: singular Jacobian"))
                })
                .collect::<Result<Vec<_>>>()?;
            for shape in 0..num_shapes {
                let key = GeneralKey {
                    shape,
                    order,
                    sub_idx,
                    domain,
                    shapeset: shapeset.id(),
                };
                let reference = self.cache.general_values(key, || {
                    let mut value = Vec::with_capacity(points.len());
                    let mut dx = Vec::with_capacity(points.len());
                    let mut dy = Vec::with_capacity(points.len());
                    for point in points {
                        let xi = path.apply(point);
                        let (v, gx, gy) = shapeset.eval(shape, &xi);
                        value.push(v);
                        dx.push(gx);
                        dy.push(gy);
                    }
                    ShapeValues { value, dx, dy }
                });
                let mut dx = Vec::with_capacity(points.len());
                let mut dy = Vec::with_capacity(points.len());
                for (k, inv) in inverses.iter().enumerate() {
                    let grad =
                        inv.transpose() * Vector2::new(reference.dx[k], reference.dy[k]);
                    dx.push(grad.x);
                    dy.push(grad.y);
                }
                tables.push(Rc::new(ShapeValues {
                    value: reference.value.clone(),
                    dx,
                    dy,
                }));
            }
        }
        Ok(tables)
    }

    /// External function values per quadrature point, indexed `[point][space]`.
    ///
    /// Only spaces of the current stage can be evaluated on the state; the
    /// entries of every other space, and of all spaces when no previous
    /// iterate was supplied, are identically zero.
    fn ext_by_point(
        &self,
        state: &State,
        extra: &SubPath,
        points: &[Point2<f64>],
    ) -> Result<Vec<Vec<FuncPoint>>> {
        let mut by_point = vec![Vec::with_capacity(self.spaces.len()); points.len()];
        for i in 0..self.spaces.len() {
            if let (Some(solution), Some(local)) = (self.ext.get(i), self.stage.local_space(i)) {
                let mesh = self.stage.mesh_of_space[local];
                let path = concat(&state.paths[mesh], extra);
                let values = solution.evaluate(state.elements[mesh], &path, points)?;
                for (k, slot) in by_point.iter_mut().enumerate() {
                    slot.push(FuncPoint {
                        value: values.values[k],
                        grad: values.gradients[k],
                    });
                }
            } else {
                for slot in by_point.iter_mut() {
                    slot.push(FuncPoint::default());
                }
            }
        }
        Ok(by_point)
    }

    #[allow(clippy::too_many_arguments)]
    fn matrix_cell(
        &mut self,
        state: &State,
        domain: CellDomain,
        marker: i32,
        extra: &SubPath,
        order: u32,
        test: usize,
        trial: usize,
        f: &(dyn Fn(&FuncPoint, &FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync),
        symmetry: Symmetry,
    ) -> Result<DMatrix<f64>> {
        let geometry = self.cell_geometry(state, domain, marker, extra, order);
        let (test_elem, test_pending) = self.space_position(test, state);
        let test_path = concat(test_pending, extra);
        let test_basis = self.basis_values(
            test,
            test_elem,
            &test_path,
            order,
            domain.tag(),
            &geometry.points,
        )?;
        let (trial_elem, trial_pending) = self.space_position(trial, state);
        let trial_path = concat(trial_pending, extra);
        let trial_basis = self.basis_values(
            trial,
            trial_elem,
            &trial_path,
            order,
            domain.tag(),
            &geometry.points,
        )?;
        let ext = self.ext_by_point(state, extra, &geometry.points)?;

        let num_test = test_basis.len();
        let num_trial = trial_basis.len();
        let mut local = DMatrix::zeros(num_test, num_trial);
        for r in 0..num_test {
            let cols = match symmetry {
                Symmetry::NonSym => num_trial,
                _ => r + 1,
            };
            for c in 0..cols {
                let mut sum = 0.0;
                for (k, (&jxw, geom)) in geometry.jxw.iter().zip(&geometry.geom).enumerate() {
                    let u = FuncPoint {
                        value: trial_basis[c].value[k],
                        grad: Vector2::new(trial_basis[c].dx[k], trial_basis[c].dy[k]),
                    };
                    let v = FuncPoint {
                        value: test_basis[r].value[k],
                        grad: Vector2::new(test_basis[r].dx[k], test_basis[r].dy[k]),
                    };
                    sum += jxw * f(&u, &v, geom, &ext[k]);
                }
                local[(r, c)] = sum;
                match symmetry {
                    Symmetry::Sym if c < r => local[(c, r)] = sum,
                    Symmetry::AntiSym if c < r => local[(c, r)] = -sum,
                    _ => {}
                }
            }
        }
        Ok(local)
    }

    fn vector_cell(
        &mut self,
        state: &State,
        domain: CellDomain,
        marker: i32,
        extra: &SubPath,
        order: u32,
        test: usize,
        f: &(dyn Fn(&FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync),
    ) -> Result<DMatrix<f64>> {
        let geometry = self.cell_geometry(state, domain, marker, extra, order);
        let (test_elem, test_pending) = self.space_position(test, state);
        let test_path = concat(test_pending, extra);
        let test_basis = self.basis_values(
            test,
            test_elem,
            &test_path,
            order,
            domain.tag(),
            &geometry.points,
        )?;
        let ext = self.ext_by_point(state, extra, &geometry.points)?;

        let mut local = DMatrix::zeros(test_basis.len(), 1);
        for (r, basis) in test_basis.iter().enumerate() {
            let mut sum = 0.0;
            for (k, (&jxw, geom)) in geometry.jxw.iter().zip(&geometry.geom).enumerate() {
                let v = FuncPoint {
                    value: basis.value[k],
                    grad: Vector2::new(basis.dx[k], basis.dy[k]),
                };
                sum += jxw * f(&v, geom, &ext[k]);
            }
            local[(r, 0)] = sum;
        }
        Ok(local)
    }

    /// Assembles all DG forms on one inner edge of a state.
    ///
    /// Each participating mesh resolves its own neighbors across the edge;
    /// the resulting partitions are merged in a [`NeighborTree`] and every
    /// search is aligned with its leaves, so that all traces are integrated
    /// over the same segments.
    #[allow(clippy::too_many_arguments)]
    fn assemble_dg_edge(
        &mut self,
        state: &State,
        edge: u8,
        dg_forms: &[&Form],
        assemble_matrix: bool,
        assemble_vector: bool,
        matrices: &mut Vec<LocalMatrix>,
        vectors: &mut Vec<LocalVector>,
    ) -> Result<()> {
        // The meshes whose traces appear in the integrands.
        let mut needed = vec![false; self.stage.meshes.len()];
        for form in dg_forms {
            for &(test, trial) in form.matrix_blocks() {
                for space in [test, trial] {
                    let local = self
                        .stage
                        .local_space(space)
                        .ok_or_else(|| eyre!("DG form space outside the stage"))?;
                    needed[self.stage.mesh_of_space[local]] = true;
                }
            }
            for &test in form.vector_blocks() {
                let local = self
                    .stage
                    .local_space(test)
                    .ok_or_else(|| eyre!("DG form space outside the stage"))?;
                needed[self.stage.mesh_of_space[local]] = true;
            }
        }
        for i in 0..self.ext.len() {
            if let Some(local) = self.stage.local_space(i) {
                needed[self.stage.mesh_of_space[local]] = true;
            }
        }

        let mut searches: Vec<Option<NeighborSearch>> = vec![None; self.stage.meshes.len()];
        let mut tree = NeighborTree::new();
        for (m, mesh) in self.stage.meshes.iter().enumerate() {
            if needed[m] {
                let search =
                    NeighborSearch::new(mesh, state.elements[m], edge, &state.paths[m])?;
                if search.is_boundary() {
                    // All meshes cover the same domain, so an inner edge of the
                    // representative is an inner edge of every mesh.
                    return Err(eyre!(
                        "Inner edge {edge} of a traversal cell is a boundary edge of mesh {m}"
                    ));
                }
                tree.insert_search(&search)?;
                searches[m] = Some(search);
            }
        }
        tree.verify()?;
        for search in searches.iter_mut().flatten() {
            search.align_with_tree(&tree)?;
        }

        let segments = tree.segments();
        for (s, segment_bits) in segments.iter().enumerate() {
            let mut segment_path = SubPath::new();
            for &bit in segment_bits {
                segment_path.push(edge_son(edge, bit));
            }
            for form in dg_forms {
                match form.integrand() {
                    Integrand::DgMatrix(f) if assemble_matrix => {
                        for &(test, trial) in form.matrix_blocks() {
                            self.dg_matrix_segment(
                                state,
                                edge,
                                &segment_path,
                                &searches,
                                s,
                                form,
                                test,
                                trial,
                                f,
                                matrices,
                            )?;
                        }
                    }
                    Integrand::DgVector(f) if assemble_vector => {
                        for &test in form.vector_blocks() {
                            self.dg_vector_segment(
                                state,
                                edge,
                                &segment_path,
                                &searches,
                                s,
                                form,
                                test,
                                f,
                                vectors,
                            )?;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// The two-sided basis of a space on one edge segment: central tables,
    /// neighbor tables and the neighbor's assembly list.
    #[allow(clippy::too_many_arguments)]
    fn dg_basis(
        &mut self,
        space: usize,
        state: &State,
        searches: &[Option<NeighborSearch>],
        segment: usize,
        order: u32,
        edge: u8,
        central_points: &[Point2<f64>],
        rule_params: &[f64],
    ) -> Result<(Vec<Rc<ShapeValues>>, Vec<Rc<ShapeValues>>, ElementIndex)> {
        let local = self
            .stage
            .local_space(space)
            .ok_or_else(|| eyre!("DG form space outside the stage"))?;
        let mesh = self.stage.mesh_of_space[local];
        let search = searches[mesh]
            .as_ref()
            .ok_or_else(|| eyre!("Missing neighbor search for mesh {mesh}"))?;
        let entry = search.entries()[segment].clone();

        let central_path = concat(&state.paths[mesh], &entry.central_path);
        let central = self.basis_values(
            space,
            state.elements[mesh],
            &central_path,
            order,
            edge,
            central_points,
        )?;

        // The neighbor walks the shared segment in the opposite direction.
        let neighbor_points: Vec<_> = rule_params
            .iter()
            .map(|&t| edge_reference_point(entry.neighbor_edge, -t))
            .collect();
        let neighbor = self.basis_values(
            space,
            entry.neighbor,
            &entry.neighbor_path,
            order,
            reversed_edge_domain(entry.neighbor_edge),
            &neighbor_points,
        )?;
        Ok((central, neighbor, entry.neighbor))
    }

    /// External function traces per point, indexed `[point][space]`; spaces
    /// without an evaluable iterate read as zero on both sides.
    fn dg_ext_by_point(
        &self,
        state: &State,
        searches: &[Option<NeighborSearch>],
        segment: usize,
        central_points: &[Point2<f64>],
        rule_params: &[f64],
    ) -> Result<Vec<Vec<DgFunc>>> {
        let mut by_point = vec![Vec::with_capacity(self.spaces.len()); central_points.len()];
        for i in 0..self.spaces.len() {
            if let (Some(solution), Some(local)) = (self.ext.get(i), self.stage.local_space(i)) {
                let mesh = self.stage.mesh_of_space[local];
                let search = searches[mesh]
                    .as_ref()
                    .ok_or_else(|| eyre!("Missing neighbor search for mesh {mesh}"))?;
                let entry = &search.entries()[segment];

                let central_path = concat(&state.paths[mesh], &entry.central_path);
                let central =
                    solution.evaluate(state.elements[mesh], &central_path, central_points)?;
                let neighbor_points: Vec<_> = rule_params
                    .iter()
                    .map(|&t| edge_reference_point(entry.neighbor_edge, -t))
                    .collect();
                let neighbor =
                    solution.evaluate(entry.neighbor, &entry.neighbor_path, &neighbor_points)?;
                for (k, slot) in by_point.iter_mut().enumerate() {
                    slot.push(DgFunc {
                        central: FuncPoint {
                            value: central.values[k],
                            grad: central.gradients[k],
                        },
                        neighbor: FuncPoint {
                            value: neighbor.values[k],
                            grad: neighbor.gradients[k],
                        },
                    });
                }
            } else {
                for slot in by_point.iter_mut() {
                    slot.push(DgFunc::default());
                }
            }
        }
        Ok(by_point)
    }

    #[allow(clippy::too_many_arguments)]
    fn dg_matrix_segment(
        &mut self,
        state: &State,
        edge: u8,
        segment_path: &SubPath,
        searches: &[Option<NeighborSearch>],
        segment: usize,
        form: &Form,
        test: usize,
        trial: usize,
        f: &(dyn Fn(&DgFunc, &DgFunc, &GeomPoint, &[DgFunc]) -> f64 + Send + Sync),
        matrices: &mut Vec<LocalMatrix>,
    ) -> Result<()> {
        let order = self.computed_order(form, state, test, Some(trial));
        let rule = self.cache.edge_rule(order);
        let geometry =
            self.cell_geometry(state, CellDomain::Edge(edge), state.marker, segment_path, order);

        let (test_central, test_neighbor, test_neighbor_elem) = self.dg_basis(
            test,
            state,
            searches,
            segment,
            order,
            edge,
            &geometry.points,
            &rule.points,
        )?;
        let (trial_central, trial_neighbor, trial_neighbor_elem) = self.dg_basis(
            trial,
            state,
            searches,
            segment,
            order,
            edge,
            &geometry.points,
            &rule.points,
        )?;
        let ext = self.dg_ext_by_point(state, searches, segment, &geometry.points, &rule.points)?;

        let two_sided = |tables: &[Vec<Rc<ShapeValues>>; 2], i: usize, k: usize| {
            let (side, idx) = if i < tables[0].len() {
                (0, i)
            } else {
                (1, i - tables[0].len())
            };
            let trace = FuncPoint {
                value: tables[side][idx].value[k],
                grad: Vector2::new(tables[side][idx].dx[k], tables[side][idx].dy[k]),
            };
            if side == 0 {
                DgFunc {
                    central: trace,
                    neighbor: FuncPoint::default(),
                }
            } else {
                DgFunc {
                    central: FuncPoint::default(),
                    neighbor: trace,
                }
            }
        };

        let test_tables = [test_central, test_neighbor];
        let trial_tables = [trial_central, trial_neighbor];
        let num_test = test_tables[0].len() + test_tables[1].len();
        let num_trial = trial_tables[0].len() + trial_tables[1].len();
        let mut local = DMatrix::zeros(num_test, num_trial);
        for r in 0..num_test {
            for c in 0..num_trial {
                let mut sum = 0.0;
                for (k, (&jxw, geom)) in geometry.jxw.iter().zip(&geometry.geom).enumerate() {
                    let u = two_sided(&trial_tables, c, k);
                    let v = two_sided(&test_tables, r, k);
                    sum += jxw * f(&u, &v, geom, &ext[k]);
                }
                local[(r, c)] = sum;
            }
        }

        let mut rows = self.asm_list(test, state).entries.clone();
        rows.extend(
            self.spaces[test]
                .element_assembly_list(test_neighbor_elem)
                .entries
                .iter()
                .cloned(),
        );
        let mut cols = self.asm_list(trial, state).entries.clone();
        cols.extend(
            self.spaces[trial]
                .element_assembly_list(trial_neighbor_elem)
                .entries
                .iter()
                .cloned(),
        );
        matrices.push(LocalMatrix {
            test_space: test,
            trial_space: trial,
            rows,
            cols,
            values: local,
            symmetry: Symmetry::NonSym,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dg_vector_segment(
        &mut self,
        state: &State,
        edge: u8,
        segment_path: &SubPath,
        searches: &[Option<NeighborSearch>],
        segment: usize,
        form: &Form,
        test: usize,
        f: &(dyn Fn(&DgFunc, &GeomPoint, &[DgFunc]) -> f64 + Send + Sync),
        vectors: &mut Vec<LocalVector>,
    ) -> Result<()> {
        let order = self.computed_order(form, state, test, None);
        let rule = self.cache.edge_rule(order);
        let geometry =
            self.cell_geometry(state, CellDomain::Edge(edge), state.marker, segment_path, order);

        let (central, neighbor, neighbor_elem) = self.dg_basis(
            test,
            state,
            searches,
            segment,
            order,
            edge,
            &geometry.points,
            &rule.points,
        )?;
        let ext = self.dg_ext_by_point(state, searches, segment, &geometry.points, &rule.points)?;

        let num_central = central.len();
        let mut local = DVector::zeros(num_central + neighbor.len());
        for (r, (side, idx)) in (0..num_central)
            .map(|i| (0usize, i))
            .chain((0..neighbor.len()).map(|i| (1, i)))
            .enumerate()
        {
            let tables = if side == 0 { &central } else { &neighbor };
            let mut sum = 0.0;
            for (k, (&jxw, geom)) in geometry.jxw.iter().zip(&geometry.geom).enumerate() {
                let trace = FuncPoint {
                    value: tables[idx].value[k],
                    grad: Vector2::new(tables[idx].dx[k], tables[idx].dy[k]),
                };
                let v = if side == 0 {
                    DgFunc {
                        central: trace,
                        neighbor: FuncPoint::default(),
                    }
                } else {
                    DgFunc {
                        central: FuncPoint::default(),
                        neighbor: trace,
                    }
                };
                sum += jxw * f(&v, geom, &ext[k]);
            }
            local[r] = sum;
        }

        let mut rows = self.asm_list(test, state).entries.clone();
        rows.extend(
            self.spaces[test]
                .element_assembly_list(neighbor_elem)
                .entries
                .iter()
                .cloned(),
        );
        vectors.push(LocalVector {
            test_space: test,
            rows,
            values: local,
        });
        Ok(())
    }
}
