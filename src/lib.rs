//! Static condensation, global assembly and solution of spectral/hp element boundary systems.
//!
//! Element operators are condensed onto their boundary modes, the condensed operators are
//! combined into a global boundary system through a signed [`BoundaryMap`](boundary_map::BoundaryMap),
//! and that system is solved directly (banded or packed Cholesky, pivoted LU), with
//! preconditioned conjugate gradients or through multilevel static condensation.
//! [`StokesSystem`](stokes::StokesSystem) extends this to the velocity-pressure saddle point
//! problem.

pub mod assembly;
pub mod boundary_map;
pub mod comm;
pub mod condensation;
pub mod direct;
pub mod element;
pub mod error;
pub mod multi_rhs;
pub mod multilevel;
pub mod operator;
pub mod partition;
pub mod preconditioner;
pub mod procedural;
pub mod reference;
pub mod settings;
pub mod source;
pub mod stokes;
pub mod storage;
pub mod system;

#[cfg(feature = "proptest")]
pub mod proptest;

pub use boundary_map::ElementVectors;
pub use error::{SolverError, SolverResult};
pub use hpsolve_traits::Real;
pub use settings::SolverSettings;
pub use system::{GlobalBoundarySystem, Solution};

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
pub extern crate fenris_nested_vec as nested_vec;
