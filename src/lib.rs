//! Domain-decomposed tree-matrix solver.
//!
//! A compartmental cable model can be cut at arbitrary nodes ("split
//! points") and its pieces distributed over many hosts and threads. Every
//! step the pieces are triangularized locally, the split-node rows are
//! exchanged and combined, and back-substitution recovers a solution equal
//! to solving the undivided tree matrix.

pub mod analysis;
pub mod error;
pub mod ir;
pub mod output;
pub mod parser;
pub mod solver;
pub mod stats;
pub mod tree;
