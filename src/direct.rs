//! Direct factorization of assembled boundary systems.
use crate::error::{SolverError, SolverResult};
use crate::storage::{cholesky_in_place, cholesky_solve_in_place, pin_dof, StorageLayout, SymmetricStorage};
use hpsolve_traits::Real;
use log::info;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn, LU};

/// A factored global matrix, reusable for many right-hand sides.
#[derive(Debug, Clone)]
pub enum DirectSolver<T: Real> {
    /// Cholesky factor in packed or banded upper storage.
    Upper {
        factor: SymmetricStorage<T>,
        pinned: Option<usize>,
    },
    DenseCholesky {
        factor: Cholesky<T, Dyn>,
        pinned: Option<usize>,
    },
    /// Pivoted LU for non-symmetric (or indefinite) systems.
    DenseLu {
        factor: LU<T, Dyn, Dyn>,
        pinned: Option<usize>,
    },
}

/// Zeroes row and column `dof` of a dense matrix and puts 1 on the diagonal.
pub fn pin_dense<T: Real>(matrix: &mut DMatrix<T>, dof: usize) {
    matrix.row_mut(dof).fill(T::zero());
    matrix.column_mut(dof).fill(T::zero());
    matrix[(dof, dof)] = T::one();
}

impl<T: Real> DirectSolver<T> {
    /// Factors a symmetric positive definite matrix in upper storage, pinning `pinned` first.
    pub fn factor_upper(
        mut storage: SymmetricStorage<T>,
        pinned: Option<usize>,
        context: &str,
    ) -> SolverResult<Self> {
        let upper = storage.as_upper_mut();
        let dim = upper.dim();
        let bandwidth = upper.bandwidth();
        if let Some(dof) = pinned {
            pin_dof(upper, dof);
        }
        cholesky_in_place(upper).map_err(|failure| SolverError::NonPositivePivot {
            context: context.to_string(),
            row: failure.row,
            dim,
            bandwidth,
            pivot: failure.pivot,
        })?;
        info!(
            "Factored {} ({:?} storage, dim = {}, bandwidth = {})",
            context,
            storage.layout(),
            dim,
            bandwidth
        );
        Ok(Self::Upper {
            factor: storage,
            pinned,
        })
    }

    /// Factors a dense symmetric positive definite matrix by Cholesky.
    pub fn factor_dense_symmetric(mut matrix: DMatrix<T>, pinned: Option<usize>, context: &str) -> SolverResult<Self> {
        if let Some(dof) = pinned {
            pin_dense(&mut matrix, dof);
        }
        let dim = matrix.nrows();
        let factor = Cholesky::new(matrix).ok_or_else(|| SolverError::NonPositivePivot {
            context: context.to_string(),
            row: 0,
            dim,
            bandwidth: dim.saturating_sub(1),
            pivot: f64::NAN,
        })?;
        info!("Factored {} (dense Cholesky, dim = {})", context, dim);
        Ok(Self::DenseCholesky { factor, pinned })
    }

    /// Factors a general dense matrix by pivoted LU.
    pub fn factor_dense_general(mut matrix: DMatrix<T>, pinned: Option<usize>, context: &str) -> SolverResult<Self> {
        if let Some(dof) = pinned {
            pin_dense(&mut matrix, dof);
        }
        let dim = matrix.nrows();
        let factor = matrix.lu();
        if !factor.is_invertible() {
            return Err(SolverError::SingularBlock {
                context: context.to_string(),
                dim,
            });
        }
        info!("Factored {} (dense LU, dim = {})", context, dim);
        Ok(Self::DenseLu { factor, pinned })
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Upper { factor, .. } => factor.as_upper().dim(),
            Self::DenseCholesky { factor, .. } => factor.l_dirty().nrows(),
            Self::DenseLu { factor, .. } => factor.l().nrows(),
        }
    }

    pub fn pinned(&self) -> Option<usize> {
        match self {
            Self::Upper { pinned, .. } | Self::DenseCholesky { pinned, .. } | Self::DenseLu { pinned, .. } => *pinned,
        }
    }

    pub fn layout(&self) -> StorageLayout {
        match self {
            Self::Upper { factor, .. } => factor.layout(),
            Self::DenseCholesky { .. } | Self::DenseLu { .. } => StorageLayout::Dense,
        }
    }

    /// Overwrites `rhs` with the solution. The pinned entry of the right-hand side is zeroed first.
    pub fn solve_in_place(&self, rhs: &mut DVector<T>) -> SolverResult<()> {
        SolverError::check_dimension("direct solve right-hand side", None, self.dim(), rhs.len())?;
        if let Some(dof) = self.pinned() {
            rhs[dof] = T::zero();
        }
        match self {
            Self::Upper { factor, .. } => cholesky_solve_in_place(factor.as_upper(), rhs.as_mut_slice()),
            Self::DenseCholesky { factor, .. } => factor.solve_mut(rhs),
            Self::DenseLu { factor, .. } => {
                if !factor.solve_mut(rhs) {
                    return Err(SolverError::SingularBlock {
                        context: "dense LU solve".to_string(),
                        dim: rhs.len(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn solve(&self, rhs: &DVector<T>) -> SolverResult<DVector<T>> {
        let mut x = rhs.clone();
        self.solve_in_place(&mut x)?;
        Ok(x)
    }
}
