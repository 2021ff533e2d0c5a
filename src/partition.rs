//! Partitioning of dense element operators into boundary and interior blocks.
use crate::error::{SolverError, SolverResult};
use hpsolve_traits::Real;
use nalgebra::{DMatrix, DMatrixView};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symmetry {
    /// Self-adjoint operators (mass, Helmholtz, Laplacian).
    Symmetric,
    /// Operators with a convective ("wave") term, where `D != Bᵀ`.
    NonSymmetric,
}

/// Dense operator of one element, with its boundary modes ordered first.
///
/// Logically partitioned as
///
/// ```text
/// [ A  B ]   boundary rows
/// [ D  C ]   interior rows
/// ```
///
/// For symmetric operators `D = Bᵀ`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalElementMatrix<T: Real> {
    matrix: DMatrix<T>,
    num_boundary: usize,
    symmetry: Symmetry,
}

impl<T: Real> LocalElementMatrix<T> {
    pub fn new(matrix: DMatrix<T>, num_boundary: usize, symmetry: Symmetry) -> SolverResult<Self> {
        SolverError::check_dimension("local element matrix (columns)", None, matrix.nrows(), matrix.ncols())?;
        if num_boundary > matrix.nrows() {
            return Err(SolverError::dimension(
                "local element matrix (boundary modes)",
                None,
                matrix.nrows(),
                num_boundary,
            ));
        }
        Ok(Self {
            matrix,
            num_boundary,
            symmetry,
        })
    }

    /// Assembles the element matrix from its four blocks.
    pub fn from_blocks(
        a: &DMatrix<T>,
        b: &DMatrix<T>,
        c: &DMatrix<T>,
        d: Option<&DMatrix<T>>,
    ) -> SolverResult<Self> {
        let nb = a.nrows();
        let ni = c.nrows();
        SolverError::check_dimension("boundary block (columns)", None, nb, a.ncols())?;
        SolverError::check_dimension("interior block (columns)", None, ni, c.ncols())?;
        SolverError::check_dimension("coupling block (rows)", None, nb, b.nrows())?;
        SolverError::check_dimension("coupling block (columns)", None, ni, b.ncols())?;

        let mut matrix = DMatrix::zeros(nb + ni, nb + ni);
        matrix.view_mut((0, 0), (nb, nb)).copy_from(a);
        matrix.view_mut((0, nb), (nb, ni)).copy_from(b);
        matrix.view_mut((nb, nb), (ni, ni)).copy_from(c);
        let symmetry = match d {
            Some(d) => {
                SolverError::check_dimension("interior coupling block (rows)", None, ni, d.nrows())?;
                SolverError::check_dimension("interior coupling block (columns)", None, nb, d.ncols())?;
                matrix.view_mut((nb, 0), (ni, nb)).copy_from(d);
                Symmetry::NonSymmetric
            }
            None => {
                matrix.view_mut((nb, 0), (ni, nb)).copy_from(&b.transpose());
                Symmetry::Symmetric
            }
        };
        Ok(Self {
            matrix,
            num_boundary: nb,
            symmetry,
        })
    }

    pub fn num_boundary(&self) -> usize {
        self.num_boundary
    }

    pub fn num_interior(&self) -> usize {
        self.matrix.nrows() - self.num_boundary
    }

    pub fn num_modes(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn matrix(&self) -> &DMatrix<T> {
        &self.matrix
    }

    pub fn into_matrix(self) -> DMatrix<T> {
        self.matrix
    }

    pub fn a(&self) -> DMatrixView<T> {
        let nb = self.num_boundary;
        self.matrix.view((0, 0), (nb, nb))
    }

    pub fn b(&self) -> DMatrixView<T> {
        let (nb, ni) = (self.num_boundary, self.num_interior());
        self.matrix.view((0, nb), (nb, ni))
    }

    pub fn c(&self) -> DMatrixView<T> {
        let (nb, ni) = (self.num_boundary, self.num_interior());
        self.matrix.view((nb, nb), (ni, ni))
    }

    pub fn d(&self) -> DMatrixView<T> {
        let (nb, ni) = (self.num_boundary, self.num_interior());
        self.matrix.view((nb, 0), (ni, nb))
    }

    /// Multiplies every block by `factor`.
    pub fn scale_mut(&mut self, factor: T) {
        self.matrix *= factor;
    }
}
