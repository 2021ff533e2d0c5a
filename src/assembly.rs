//! Assembly of condensed element operators into global boundary matrices.
use crate::boundary_map::{BoundaryMap, ElementVectors};
use crate::comm::Communicator;
use crate::condensation::CondensedOperator;
use crate::error::{SolverError, SolverResult};
use crate::storage::UpperStorage;
use hpsolve_traits::Real;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use std::cell::RefCell;

#[derive(Debug, Clone)]
struct AssemblerWorkspace<T: Real> {
    element_matrix: DMatrix<T>,
    solve_dofs: Vec<(usize, usize)>,
}

impl<T: Real> Default for AssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            element_matrix: DMatrix::zeros(0, 0),
            solve_dofs: Vec::new(),
        }
    }
}

/// Assembles signed, scaled condensed element matrices over the solve dofs.
#[derive(Debug, Clone)]
pub struct BoundaryAssembler<T: Real> {
    // Buffers reused across elements
    workspace: RefCell<AssemblerWorkspace<T>>,
}

impl<T: Real> Default for BoundaryAssembler<T> {
    fn default() -> Self {
        Self {
            workspace: RefCell::new(AssemblerWorkspace::default()),
        }
    }
}

impl<T: Real> BoundaryAssembler<T> {
    /// Visits every solve/solve entry `(I, J, value)` of every element's contribution.
    fn for_each_entry(
        &self,
        operator: &CondensedOperator<T>,
        map: &BoundaryMap,
        mut visit: impl FnMut(usize, usize, T),
    ) -> SolverResult<()> {
        let ws = &mut *self.workspace.borrow_mut();
        for e in 0..map.num_elements() {
            let (family, scale) = operator.element(e);
            SolverError::check_dimension(
                "condensed element matrix",
                Some(e),
                map.element_boundary_count(e),
                family.num_boundary(),
            )?;
            ws.element_matrix.clone_from(family.schur());
            ws.element_matrix *= scale;
            let signs = map.element_signs(e);

            ws.solve_dofs.clear();
            ws.solve_dofs.extend(map.element_solve_dofs(e));
            for &(local_j, global_j) in &ws.solve_dofs {
                for &(local_i, global_i) in &ws.solve_dofs {
                    let value = (signs[local_i] * signs[local_j]).apply(ws.element_matrix[(local_i, local_j)]);
                    visit(global_i, global_j, value);
                }
            }
        }
        Ok(())
    }

    /// Adds the upper triangle of the condensed global matrix into `storage`.
    pub fn assemble_into_upper<S>(
        &self,
        storage: &mut S,
        operator: &CondensedOperator<T>,
        map: &BoundaryMap,
    ) -> SolverResult<()>
    where
        S: ?Sized + UpperStorage<T>,
    {
        SolverError::check_dimension("global storage", None, map.num_solve_dofs(), storage.dim())?;
        self.for_each_entry(operator, map, |i, j, value| {
            if i <= j {
                storage.add_symmetric(i, j, value);
            }
        })
    }

    pub fn assemble_dense(&self, operator: &CondensedOperator<T>, map: &BoundaryMap) -> SolverResult<DMatrix<T>> {
        let n = map.num_solve_dofs();
        let mut matrix = DMatrix::zeros(n, n);
        self.for_each_entry(operator, map, |i, j, value| matrix[(i, j)] += value)?;
        Ok(matrix)
    }

    /// The process-local contribution to the condensed global matrix in CSR format.
    pub fn assemble_csr(&self, operator: &CondensedOperator<T>, map: &BoundaryMap) -> SolverResult<CsrMatrix<T>> {
        let n = map.num_solve_dofs();
        let mut coo = CooMatrix::new(n, n);
        self.for_each_entry(operator, map, |i, j, value| coo.push(i, j, value))?;
        Ok(CsrMatrix::from(&coo))
    }
}

/// Condenses element right-hand sides and gathers them into a global vector of length `nglobal`.
pub fn assemble_condensed_rhs<T, C>(
    operator: &CondensedOperator<T>,
    map: &BoundaryMap,
    rhs: &ElementVectors<T>,
    comm: &C,
) -> SolverResult<DVector<T>>
where
    T: Real,
    C: ?Sized + Communicator<T>,
{
    SolverError::check_dimension("element right-hand sides", None, map.num_elements(), rhs.len())?;
    let mut global = DVector::zeros(map.num_global_dofs());
    for (e, f) in rhs.iter().enumerate() {
        let (family, _) = operator.element(e);
        let f_b = family
            .condense_rhs(f)
            .map_err(|err| with_element(err, e))?;
        map.gather_element_into(e, f_b.as_slice(), global.as_mut_slice());
    }
    comm.reduce_sum(global.as_mut_slice());
    let num_fixed = map.num_global_dofs() - map.num_solve_dofs();
    global.rows_mut(map.num_solve_dofs(), num_fixed).fill(T::zero());
    Ok(global)
}

/// Attaches an element index to dimension errors raised without one.
pub(crate) fn with_element(err: SolverError, element: usize) -> SolverError {
    match err {
        SolverError::DimensionMismatch {
            what,
            element: None,
            expected,
            actual,
        } => SolverError::DimensionMismatch {
            what,
            element: Some(element),
            expected,
            actual,
        },
        other => other,
    }
}

/// `y = A x` for a CSR matrix and slices.
pub(crate) fn csr_mul<T: Real>(a: &CsrMatrix<T>, x: &[T], y: &mut [T]) {
    let x = DVectorView::from_slice(x, x.len());
    let n = y.len();
    let mut y = DVectorViewMut::from_slice(y, n);
    spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(a), Op::NoOp(&x));
}

/// Dense sub-matrix of a CSR matrix on the given (row = column) indices.
pub(crate) fn extract_block<T: Real>(a: &CsrMatrix<T>, dofs: &[usize]) -> DMatrix<T> {
    let n = dofs.len();
    DMatrix::from_fn(n, n, |i, j| {
        a.get_entry(dofs[i], dofs[j])
            .map(|entry| entry.into_value())
            .unwrap_or_else(T::zero)
    })
}
