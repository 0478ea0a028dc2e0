//! Weak form descriptions.
//!
//! A [`WeakForm`] is a collection of [`Form`]s over a fixed set of spaces. Each
//! form carries a pointwise integrand together with the block(s) of the system
//! it contributes to, an optional marker restriction, a symmetry flag and a
//! quadrature order policy. The assembler decides where and how each form is
//! integrated; the integrand only sees function traces and geometry at a single
//! quadrature point.

use eyre::{bail, ensure, Result};
use nalgebra::{Point2, Vector2};
use smallvec::SmallVec;

/// Value and physical gradient of a function at a quadrature point.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncPoint {
    pub value: f64,
    pub grad: Vector2<f64>,
}

/// Two-sided trace of a function at a quadrature point of an inner edge.
///
/// For basis functions, the side the function is not supported on is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct DgFunc {
    pub central: FuncPoint,
    pub neighbor: FuncPoint,
}

/// Geometry at a quadrature point.
#[derive(Debug, Clone, Copy)]
pub struct GeomPoint {
    pub x: Point2<f64>,
    /// Outward unit normal of the central element; zero for volume points.
    pub normal: Vector2<f64>,
    /// Element marker for volume points, edge marker for surface points.
    pub marker: i32,
}

type VolumeMatrixFn = dyn Fn(&FuncPoint, &FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync;
type VolumeVectorFn = dyn Fn(&FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync;
type DgMatrixFn = dyn Fn(&DgFunc, &DgFunc, &GeomPoint, &[DgFunc]) -> f64 + Send + Sync;
type DgVectorFn = dyn Fn(&DgFunc, &GeomPoint, &[DgFunc]) -> f64 + Send + Sync;

/// The pointwise integrand of a form. Surface integrands share the volume
/// signatures; they receive the edge normal and marker through [`GeomPoint`].
pub enum Integrand {
    VolumeMatrix(Box<VolumeMatrixFn>),
    VolumeVector(Box<VolumeVectorFn>),
    SurfaceMatrix(Box<VolumeMatrixFn>),
    SurfaceVector(Box<VolumeVectorFn>),
    DgMatrix(Box<DgMatrixFn>),
    DgVector(Box<DgVectorFn>),
}

/// The integration domain and target (matrix or vector) of a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    VolumeMatrix,
    VolumeVector,
    SurfaceMatrix,
    SurfaceVector,
    DgMatrix,
    DgVector,
}

impl FormKind {
    pub fn is_matrix(&self) -> bool {
        matches!(
            self,
            FormKind::VolumeMatrix | FormKind::SurfaceMatrix | FormKind::DgMatrix
        )
    }

    pub fn is_dg(&self) -> bool {
        matches!(self, FormKind::DgMatrix | FormKind::DgVector)
    }
}

/// Symmetry of a matrix form's bilinear integrand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Symmetry {
    #[default]
    NonSym,
    /// `f(u, v) == f(v, u)`: only the lower part of each block is integrated
    /// and the transpose is mirrored into block `(trial, test)`.
    Sym,
    /// `f(u, v) == -f(v, u)`: mirrored with a sign flip.
    AntiSym,
}

/// How the quadrature order of a form is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderPolicy {
    /// Polynomial degrees of the arguments plus the geometry, plus `extra`.
    Computed { extra: u32 },
    /// A fixed polynomial order.
    Fixed(u32),
    /// Adaptive refinement of the integration domain: starting from
    /// `start_order`, sub-element estimates of orders `k` and `k + 1` are
    /// compared and subdivision continues until the relative difference drops
    /// below `rel_tol` or `max_depth` is reached.
    Adaptive {
        rel_tol: f64,
        max_depth: u32,
        start_order: u32,
    },
}

impl Default for OrderPolicy {
    fn default() -> Self {
        OrderPolicy::Computed { extra: 0 }
    }
}

impl OrderPolicy {
    /// The adaptive policy with default tolerance `1e-4` and depth limit 5.
    pub fn adaptive(start_order: u32) -> Self {
        OrderPolicy::Adaptive {
            rel_tol: 1e-4,
            max_depth: 5,
            start_order,
        }
    }
}

/// Restriction of a form to parts of the domain or boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerFilter {
    #[default]
    Any,
    Marker(i32),
}

impl MarkerFilter {
    pub fn matches(&self, marker: i32) -> bool {
        match self {
            MarkerFilter::Any => true,
            MarkerFilter::Marker(m) => *m == marker,
        }
    }
}

/// The system blocks a form contributes to. A single form may scatter into
/// several blocks, e.g. one stiffness expression shared by two components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocks {
    Matrix(SmallVec<[(usize, usize); 2]>),
    Vector(SmallVec<[usize; 2]>),
}

/// A single term of a weak form.
pub struct Form {
    integrand: Integrand,
    blocks: Blocks,
    marker: MarkerFilter,
    symmetry: Symmetry,
    order: OrderPolicy,
}

impl Form {
    fn new(integrand: Integrand, blocks: Blocks) -> Self {
        Self {
            integrand,
            blocks,
            marker: MarkerFilter::default(),
            symmetry: Symmetry::default(),
            order: OrderPolicy::default(),
        }
    }

    pub fn volume_matrix<F>(test: usize, trial: usize, f: F) -> Self
    where
        F: Fn(&FuncPoint, &FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            Integrand::VolumeMatrix(Box::new(f)),
            Blocks::Matrix(SmallVec::from_slice(&[(test, trial)])),
        )
    }

    pub fn volume_vector<F>(test: usize, f: F) -> Self
    where
        F: Fn(&FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            Integrand::VolumeVector(Box::new(f)),
            Blocks::Vector(SmallVec::from_slice(&[test])),
        )
    }

    pub fn surface_matrix<F>(test: usize, trial: usize, f: F) -> Self
    where
        F: Fn(&FuncPoint, &FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            Integrand::SurfaceMatrix(Box::new(f)),
            Blocks::Matrix(SmallVec::from_slice(&[(test, trial)])),
        )
    }

    pub fn surface_vector<F>(test: usize, f: F) -> Self
    where
        F: Fn(&FuncPoint, &GeomPoint, &[FuncPoint]) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            Integrand::SurfaceVector(Box::new(f)),
            Blocks::Vector(SmallVec::from_slice(&[test])),
        )
    }

    pub fn dg_matrix<F>(test: usize, trial: usize, f: F) -> Self
    where
        F: Fn(&DgFunc, &DgFunc, &GeomPoint, &[DgFunc]) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            Integrand::DgMatrix(Box::new(f)),
            Blocks::Matrix(SmallVec::from_slice(&[(test, trial)])),
        )
    }

    pub fn dg_vector<F>(test: usize, f: F) -> Self
    where
        F: Fn(&DgFunc, &GeomPoint, &[DgFunc]) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            Integrand::DgVector(Box::new(f)),
            Blocks::Vector(SmallVec::from_slice(&[test])),
        )
    }

    /// Adds a further matrix block the form scatters into.
    pub fn with_block(mut self, test: usize, trial: usize) -> Self {
        match &mut self.blocks {
            Blocks::Matrix(blocks) => blocks.push((test, trial)),
            Blocks::Vector(_) => panic!("Vector forms take test-space blocks only"),
        }
        self
    }

    /// Adds a further vector block the form scatters into.
    pub fn with_vector_block(mut self, test: usize) -> Self {
        match &mut self.blocks {
            Blocks::Vector(blocks) => blocks.push(test),
            Blocks::Matrix(_) => panic!("Matrix forms take (test, trial) blocks"),
        }
        self
    }

    /// Restricts the form to elements (or boundary edges) with the marker.
    pub fn with_marker(mut self, marker: i32) -> Self {
        self.marker = MarkerFilter::Marker(marker);
        self
    }

    pub fn symmetric(mut self) -> Self {
        self.symmetry = Symmetry::Sym;
        self
    }

    pub fn antisymmetric(mut self) -> Self {
        self.symmetry = Symmetry::AntiSym;
        self
    }

    pub fn with_order(mut self, order: OrderPolicy) -> Self {
        self.order = order;
        self
    }

    pub fn kind(&self) -> FormKind {
        match &self.integrand {
            Integrand::VolumeMatrix(_) => FormKind::VolumeMatrix,
            Integrand::VolumeVector(_) => FormKind::VolumeVector,
            Integrand::SurfaceMatrix(_) => FormKind::SurfaceMatrix,
            Integrand::SurfaceVector(_) => FormKind::SurfaceVector,
            Integrand::DgMatrix(_) => FormKind::DgMatrix,
            Integrand::DgVector(_) => FormKind::DgVector,
        }
    }

    pub fn integrand(&self) -> &Integrand {
        &self.integrand
    }

    /// The `(test, trial)` blocks of a matrix form; empty for vector forms.
    pub fn matrix_blocks(&self) -> &[(usize, usize)] {
        match &self.blocks {
            Blocks::Matrix(blocks) => blocks,
            Blocks::Vector(_) => &[],
        }
    }

    /// The test-space blocks of a vector form; empty for matrix forms.
    pub fn vector_blocks(&self) -> &[usize] {
        match &self.blocks {
            Blocks::Vector(blocks) => blocks,
            Blocks::Matrix(_) => &[],
        }
    }

    pub fn marker(&self) -> MarkerFilter {
        self.marker
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn order(&self) -> OrderPolicy {
        self.order
    }

    /// The spaces this form reads from or writes to.
    fn spaces(&self) -> impl Iterator<Item = usize> + '_ {
        let (matrix, vector) = match &self.blocks {
            Blocks::Matrix(blocks) => (blocks.as_slice(), [].as_slice()),
            Blocks::Vector(blocks) => ([].as_slice(), blocks.as_slice()),
        };
        matrix
            .iter()
            .flat_map(|&(test, trial)| [test, trial])
            .chain(vector.iter().copied())
    }
}

impl std::fmt::Debug for Form {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Form")
            .field("kind", &self.kind())
            .field("blocks", &self.blocks)
            .field("marker", &self.marker)
            .field("symmetry", &self.symmetry)
            .field("order", &self.order)
            .finish()
    }
}

/// A complete weak formulation over `num_spaces` spaces.
#[derive(Debug, Default)]
pub struct WeakForm {
    num_spaces: usize,
    forms: Vec<Form>,
    seq: u64,
}

impl WeakForm {
    pub fn new(num_spaces: usize) -> Self {
        Self {
            num_spaces,
            forms: Vec::new(),
            seq: 0,
        }
    }

    pub fn num_spaces(&self) -> usize {
        self.num_spaces
    }

    pub fn forms(&self) -> &[Form] {
        &self.forms
    }

    /// The structural sequence number, bumped whenever a form is added.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Adds a form after validating its block indices and flags.
    pub fn add_form(&mut self, form: Form) -> Result<()> {
        for space in form.spaces() {
            ensure!(
                space < self.num_spaces,
                "Form references space {space}, but the weak form has {} spaces",
                self.num_spaces
            );
        }
        if form.symmetry() != Symmetry::NonSym && !form.kind().is_matrix() {
            bail!("Symmetry flags apply to matrix forms only");
        }
        if let OrderPolicy::Adaptive { rel_tol, .. } = form.order() {
            ensure!(rel_tol > 0.0, "Adaptive tolerance must be positive");
        }
        self.forms.push(form);
        self.seq += 1;
        Ok(())
    }

    /// Partitions the spaces into assembly stages: connected components of the
    /// coupling graph induced by matrix blocks. Every space belongs to exactly
    /// one stage; stages and their members are ordered by space index.
    pub fn stages(&self) -> Vec<Vec<usize>> {
        let mut parent: Vec<usize> = (0..self.num_spaces).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let root = find(parent, parent[i]);
                parent[i] = root;
            }
            parent[i]
        }
        for form in &self.forms {
            for &(test, trial) in form.matrix_blocks() {
                let a = find(&mut parent, test);
                let b = find(&mut parent, trial);
                parent[a.max(b)] = a.min(b);
            }
        }

        let mut stages: Vec<Vec<usize>> = Vec::new();
        let mut stage_of_root = vec![usize::MAX; self.num_spaces];
        for space in 0..self.num_spaces {
            let root = find(&mut parent, space);
            if stage_of_root[root] == usize::MAX {
                stage_of_root[root] = stages.len();
                stages.push(Vec::new());
            }
            stages[stage_of_root[root]].push(space);
        }
        stages
    }

    /// The forms of the given kind whose blocks touch only spaces in `stage`.
    pub fn stage_forms<'a>(
        &'a self,
        stage: &'a [usize],
    ) -> impl Iterator<Item = &'a Form> + 'a {
        self.forms
            .iter()
            .filter(move |form| form.spaces().all(|space| stage.contains(&space)))
    }
}
