//! Preconditioners for the condensed boundary system.
//!
//! All variants are built once per boundary system and applied once per CG iteration.
//! When a dof is pinned, the block containing it is pinned in the same way as the operator.
use crate::boundary_map::BoundaryMap;
use crate::comm::Communicator;
use crate::condensation::CondensedOperator;
use crate::error::{SolverError, SolverResult};
use crate::settings::{OverlapSettings, PreconditionerKind};
use hpsolve_sparse::cg::LinearOperator;
use hpsolve_traits::Real;
use log::info;
use nalgebra::{Cholesky, DMatrix, DVector, DVectorView, DVectorViewMut, Dyn};
use std::error::Error;

mod block;
mod diagonal;
mod low_energy;
mod overlap;

pub use block::*;
pub use diagonal::*;
pub use low_energy::*;
pub use overlap::*;

/// Everything a preconditioner may need from the boundary system it is built for.
pub struct PreconditionerContext<'a, T: Real> {
    pub condensed: &'a CondensedOperator<T>,
    pub map: &'a BoundaryMap,
    pub comm: &'a dyn Communicator<T>,
    pub pinned: Option<usize>,
    pub overlap: &'a OverlapSettings,
}

/// Inverse of a dense symmetric positive definite block on a subset of the global dofs.
#[derive(Debug, Clone)]
pub struct BlockInverse<T: Real> {
    dofs: Vec<usize>,
    factor: Option<Cholesky<T, Dyn>>,
}

impl<T: Real> BlockInverse<T> {
    /// Factors `block`, the restriction of the operator to `dofs`.
    ///
    /// If the pinned dof is part of the block, its row and column are replaced by the identity.
    pub fn new(dofs: Vec<usize>, mut block: DMatrix<T>, pinned: Option<usize>, context: &str) -> SolverResult<Self> {
        SolverError::check_dimension("preconditioner block", None, dofs.len(), block.nrows())?;
        if let Some(local) = pinned.and_then(|p| dofs.iter().position(|&d| d == p)) {
            crate::direct::pin_dense(&mut block, local);
        }
        if dofs.is_empty() {
            return Ok(Self { dofs, factor: None });
        }
        let dim = block.nrows();
        let factor = Cholesky::new(block).ok_or_else(|| SolverError::NonPositivePivot {
            context: context.to_string(),
            row: 0,
            dim,
            bandwidth: dim.saturating_sub(1),
            pivot: f64::NAN,
        })?;
        Ok(Self {
            dofs,
            factor: Some(factor),
        })
    }

    pub fn dofs(&self) -> &[usize] {
        &self.dofs
    }

    /// `z[dofs] += A_block⁻¹ r[dofs]`
    pub fn apply_add(&self, r: &[T], z: &mut [T]) {
        if let Some(factor) = &self.factor {
            let local = DVector::from_iterator(self.dofs.len(), self.dofs.iter().map(|&d| r[d]));
            let solution = factor.solve(&local);
            for (&d, &value) in self.dofs.iter().zip(solution.iter()) {
                z[d] += value;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Preconditioner<T: Real> {
    Identity,
    Diagonal(DiagonalPreconditioner<T>),
    Block(BlockPreconditioner<T>),
    LowEnergy(LowEnergyPreconditioner<T>),
    Overlap(OverlapPreconditioner<T>),
}

impl<T: Real> Preconditioner<T> {
    pub fn build(kind: PreconditionerKind, context: &PreconditionerContext<T>) -> SolverResult<Self> {
        let preconditioner = match kind {
            PreconditionerKind::None => Self::Identity,
            PreconditionerKind::Diagonal => Self::Diagonal(DiagonalPreconditioner::build(context)?),
            PreconditionerKind::Block => Self::Block(BlockPreconditioner::build(context)?),
            PreconditionerKind::LowEnergy => Self::LowEnergy(LowEnergyPreconditioner::build(context)?),
            PreconditionerKind::Overlap => Self::Overlap(OverlapPreconditioner::build(context)?),
        };
        info!("Built {:?} preconditioner ({} dofs)", kind, context.map.num_solve_dofs());
        Ok(preconditioner)
    }

    pub fn kind(&self) -> PreconditionerKind {
        match self {
            Self::Identity => PreconditionerKind::None,
            Self::Diagonal(_) => PreconditionerKind::Diagonal,
            Self::Block(_) => PreconditionerKind::Block,
            Self::LowEnergy(_) => PreconditionerKind::LowEnergy,
            Self::Overlap(_) => PreconditionerKind::Overlap,
        }
    }

    /// The correction `z = M⁻¹ r`.
    pub fn apply_to(&self, r: &DVector<T>, comm: &dyn Communicator<T>) -> SolverResult<DVector<T>> {
        let mut z = DVector::zeros(r.len());
        match self {
            Self::Identity => z.copy_from(r),
            Self::Diagonal(p) => p.apply_into(r.as_slice(), z.as_mut_slice()),
            Self::Block(p) => p.apply_into(r.as_slice(), z.as_mut_slice()),
            Self::LowEnergy(p) => p.apply_into(r, &mut z, comm)?,
            Self::Overlap(p) => p.apply_into(r.as_slice(), z.as_mut_slice(), comm),
        }
        Ok(z)
    }

    /// Pairs the preconditioner with the communicator used while applying it.
    pub fn bind<'a>(&'a self, comm: &'a dyn Communicator<T>) -> BoundPreconditioner<'a, T> {
        BoundPreconditioner {
            preconditioner: self,
            comm,
        }
    }
}

/// A preconditioner usable as a [`LinearOperator`] in CG.
pub struct BoundPreconditioner<'a, T: Real> {
    preconditioner: &'a Preconditioner<T>,
    comm: &'a dyn Communicator<T>,
}

impl<'a, T: Real> LinearOperator<T> for BoundPreconditioner<'a, T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        let z = self.preconditioner.apply_to(&x.clone_owned(), self.comm)?;
        y.copy_from(&z);
        Ok(())
    }
}
