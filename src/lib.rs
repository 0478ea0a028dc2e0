//! Finite element assembly over independently refined quadrilateral meshes.
//!
//! Each component of a coupled problem may live on its own refinement of a
//! shared base mesh; the assembler integrates the weak form on the finest
//! common partition of all meshes involved, with support for discontinuous
//! Galerkin edge terms, essential boundary conditions and adaptive
//! quadrature.

pub mod assembly;
pub mod mesh;
pub mod quadrature;
pub mod refmap;
pub mod solution;
pub mod space;
pub mod weak_form;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use assembly::{Assembler, MatrixSink, VectorSink};
pub use solution::Solution;
pub use space::{Continuity, Space};
pub use weak_form::{Form, MarkerFilter, OrderPolicy, Symmetry, WeakForm};
