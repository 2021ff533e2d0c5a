//! Matrix-free application of the condensed global boundary operator.
use crate::assembly::BoundaryAssembler;
use crate::boundary_map::BoundaryMap;
use crate::comm::Communicator;
use crate::condensation::CondensedOperator;
use crate::error::SolverResult;
use hpsolve_sparse::cg::LinearOperator;
use hpsolve_traits::Real;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::CsrMatrix;
use std::cell::RefCell;
use std::error::Error;

/// The condensed global operator on vectors of length `nsolve`, applied as
/// scatter, element-wise `s Ā_f`, gather.
///
/// If a dof is pinned, its row and column are those of the identity.
pub struct BoundaryOperator<'a, T: Real> {
    condensed: &'a CondensedOperator<T>,
    map: &'a BoundaryMap,
    comm: &'a dyn Communicator<T>,
    pinned: Option<usize>,
    buffers: RefCell<(DVector<T>, DVector<T>, DVector<T>)>,
}

impl<'a, T: Real> BoundaryOperator<'a, T> {
    pub fn new(condensed: &'a CondensedOperator<T>, map: &'a BoundaryMap, comm: &'a dyn Communicator<T>) -> Self {
        Self {
            condensed,
            map,
            comm,
            pinned: None,
            buffers: RefCell::new((DVector::zeros(0), DVector::zeros(0), DVector::zeros(map.num_global_dofs()))),
        }
    }

    pub fn with_pinned(self, pinned: Option<usize>) -> Self {
        Self { pinned, ..self }
    }

    pub fn dim(&self) -> usize {
        self.map.num_solve_dofs()
    }

    pub fn map(&self) -> &BoundaryMap {
        self.map
    }

    /// Applies the element operators to a global vector of length `nsolve` or `nglobal` and
    /// returns the gathered result on the solve dofs. Pinning is not applied.
    pub fn apply_unpinned(&self, x: &[T], y: &mut [T]) {
        let mut buffers = self.buffers.borrow_mut();
        let (local_x, local_y, global) = &mut *buffers;
        global.resize_vertically_mut(self.map.num_global_dofs(), T::zero());
        global.fill(T::zero());
        for e in 0..self.map.num_elements() {
            let count = self.map.element_boundary_count(e);
            local_x.resize_vertically_mut(count, T::zero());
            local_y.resize_vertically_mut(count, T::zero());
            self.map.scatter_element(e, x, local_x.as_mut_slice());
            self.condensed.apply_element(e, local_x, local_y);
            self.map.gather_element_into(e, local_y.as_slice(), global.as_mut_slice());
        }
        self.comm.reduce_sum(global.as_mut_slice());
        let n = self.dim();
        y[..n].copy_from_slice(&global.as_slice()[..n]);
    }

    /// Column `j` of the (unpinned) operator, computed from the elements adjacent to dof `j` only.
    pub fn column(&self, j: usize) -> DVector<T> {
        let n = self.dim();
        let mut column = DVector::zeros(n);
        for &(e, local_j) in self.map.dof_elements(j) {
            let (family, scale) = self.condensed.element(e);
            let signs = self.map.element_signs(e);
            let schur = family.schur();
            for (local_i, g) in self.map.element_solve_dofs(e) {
                let value = (signs[local_i] * signs[local_j]).apply(schur[(local_i, local_j)] * scale);
                column[g] += value;
            }
        }
        self.comm.reduce_sum(column.as_mut_slice());
        column
    }

    /// The process-local contribution to the assembled operator, without pinning.
    pub fn assemble_csr(&self) -> SolverResult<CsrMatrix<T>> {
        BoundaryAssembler::default().assemble_csr(self.condensed, self.map)
    }
}

impl<'a, T: Real> LinearOperator<T> for BoundaryOperator<'a, T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        let mut x_owned = x.clone_owned();
        if let Some(dof) = self.pinned {
            x_owned[dof] = T::zero();
        }
        let mut result = DVector::zeros(self.dim());
        self.apply_unpinned(x_owned.as_slice(), result.as_mut_slice());
        if let Some(dof) = self.pinned {
            result[dof] = x[dof];
        }
        y.copy_from(&result);
        Ok(())
    }
}
