//! Assembly of weak forms over one or several meshes.
//!
//! The entry point is [`Assembler`](global::Assembler): it groups the coupled
//! spaces of a weak form into stages, traverses the meshes of each stage
//! jointly and scatters the integrated local contributions into global
//! matrices and vectors.

pub mod cache;
pub mod global;
pub mod neighbor;
pub mod traversal;

pub(crate) mod eval;
pub(crate) mod pattern;

pub use global::{Assembler, MatrixSink, VectorSink};
