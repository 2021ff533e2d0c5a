use super::PreconditionerContext;
use crate::error::{SolverError, SolverResult};
use hpsolve_sparse::cg::LinearOperator;
use hpsolve_traits::{to_f64, Real};
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use std::error::Error;

/// Jacobi preconditioner: the inverse of the assembled diagonal.
#[derive(Debug, Clone)]
pub struct DiagonalPreconditioner<T: Real> {
    inverse_diagonal: DVector<T>,
}

impl<T: Real> DiagonalPreconditioner<T> {
    pub fn build(context: &PreconditionerContext<T>) -> SolverResult<Self> {
        let map = context.map;
        let mut diagonal = DVector::zeros(map.num_solve_dofs());
        for e in 0..map.num_elements() {
            let (family, scale) = context.condensed.element(e);
            let schur = family.schur();
            for (local, g) in map.element_solve_dofs(e) {
                diagonal[g] += scale * schur[(local, local)];
            }
        }
        context.comm.reduce_sum(diagonal.as_mut_slice());
        if let Some(dof) = context.pinned {
            diagonal[dof] = T::one();
        }
        Self::from_diagonal(diagonal)
    }

    pub fn from_diagonal(mut diagonal: DVector<T>) -> SolverResult<Self> {
        let dim = diagonal.len();
        for (i, d) in diagonal.iter_mut().enumerate() {
            if !(*d > T::zero()) {
                return Err(SolverError::NonPositivePivot {
                    context: "diagonal preconditioner".to_string(),
                    row: i,
                    dim,
                    bandwidth: 0,
                    pivot: to_f64(*d),
                });
            }
            *d = T::one() / *d;
        }
        Ok(Self {
            inverse_diagonal: diagonal,
        })
    }

    pub fn inverse_diagonal(&self) -> &DVector<T> {
        &self.inverse_diagonal
    }

    pub fn apply_into(&self, r: &[T], z: &mut [T]) {
        for ((z, &r), &d) in z.iter_mut().zip(r).zip(self.inverse_diagonal.iter()) {
            *z = d * r;
        }
    }
}

impl<T: Real> LinearOperator<T> for DiagonalPreconditioner<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.copy_from(&x.component_mul(&self.inverse_diagonal));
        Ok(())
    }
}
