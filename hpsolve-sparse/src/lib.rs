//! Linear operators and Krylov solvers used by `hpsolve`.
//!
//! The solvers here only see the system through the [`LinearOperator`](cg::LinearOperator)
//! trait, which lets the condensed boundary system be applied matrix-free.

pub mod cg;

pub use nalgebra_sparse::CsrMatrix;
