//! Packed and banded storage of symmetric matrices, with an in-place Cholesky factorization.
//!
//! Both layouts store the upper triangle column by column, following the LAPACK 'U'
//! conventions, so that a single factorization routine serves both.
use hpsolve_traits::Real;
use serde::{Deserialize, Serialize};

/// Position of entry `(row, col)`, `row <= col`, in upper packed storage.
#[inline]
pub fn packed_index(row: usize, col: usize) -> usize {
    debug_assert!(row <= col, "packed storage only holds the upper triangle");
    row + col * (col + 1) / 2
}

/// Position of entry `(row, col)`, `col - bandwidth <= row <= col`, in upper band storage.
#[inline]
pub fn banded_index(row: usize, col: usize, bandwidth: usize) -> usize {
    debug_assert!(row <= col && col - row <= bandwidth, "entry outside of the band");
    (bandwidth + row - col) + col * (bandwidth + 1)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageLayout {
    /// Banded when `2 * bandwidth < nsolve`, packed otherwise.
    #[default]
    Auto,
    Packed,
    Banded,
    /// Full dense storage (the only layout for non-symmetric systems).
    Dense,
}

impl StorageLayout {
    /// Resolves `Auto` to a concrete symmetric layout.
    pub fn resolve(self, dim: usize, bandwidth: usize) -> Self {
        match self {
            Self::Auto if 2 * bandwidth < dim => Self::Banded,
            Self::Auto => Self::Packed,
            other => other,
        }
    }
}

/// Upper triangle of a symmetric matrix with (at most) a given bandwidth.
pub trait UpperStorage<T> {
    fn dim(&self) -> usize;

    /// Number of super-diagonals that may be non-zero.
    fn bandwidth(&self) -> usize;

    /// Entry `(row, col)` with `row <= col` inside the band.
    fn get(&self, row: usize, col: usize) -> T;

    fn get_mut(&mut self, row: usize, col: usize) -> &mut T;

    fn as_slice(&self) -> &[T];

    fn as_mut_slice(&mut self) -> &mut [T];

    /// Adds `value` to the symmetric entry `(i, j)`. Entries outside the band are ignored.
    fn add_symmetric(&mut self, i: usize, j: usize, value: T)
    where
        T: Real,
    {
        let (row, col) = if i <= j { (i, j) } else { (j, i) };
        if col - row <= self.bandwidth() {
            *self.get_mut(row, col) += value;
        }
    }

    /// Symmetric entry `(i, j)`, zero outside the band.
    fn entry(&self, i: usize, j: usize) -> T
    where
        T: Real,
    {
        let (row, col) = if i <= j { (i, j) } else { (j, i) };
        if col - row <= self.bandwidth() {
            self.get(row, col)
        } else {
            T::zero()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedMatrix<T> {
    dim: usize,
    data: Vec<T>,
}

impl<T: Real> PackedMatrix<T> {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![T::zero(); dim * (dim + 1) / 2],
        }
    }
}

impl<T: Copy> UpperStorage<T> for PackedMatrix<T> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn bandwidth(&self) -> usize {
        self.dim.saturating_sub(1)
    }

    fn get(&self, row: usize, col: usize) -> T {
        self.data[packed_index(row, col)]
    }

    fn get_mut(&mut self, row: usize, col: usize) -> &mut T {
        &mut self.data[packed_index(row, col)]
    }

    fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandedMatrix<T> {
    dim: usize,
    bandwidth: usize,
    data: Vec<T>,
}

impl<T: Real> BandedMatrix<T> {
    pub fn zeros(dim: usize, bandwidth: usize) -> Self {
        let bandwidth = bandwidth.min(dim.saturating_sub(1));
        Self {
            dim,
            bandwidth,
            data: vec![T::zero(); dim * (bandwidth + 1)],
        }
    }
}

impl<T: Copy> UpperStorage<T> for BandedMatrix<T> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn bandwidth(&self) -> usize {
        self.bandwidth
    }

    fn get(&self, row: usize, col: usize) -> T {
        self.data[banded_index(row, col, self.bandwidth)]
    }

    fn get_mut(&mut self, row: usize, col: usize) -> &mut T {
        &mut self.data[banded_index(row, col, self.bandwidth)]
    }

    fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// Symmetric global matrix in one of the two upper layouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymmetricStorage<T> {
    Packed(PackedMatrix<T>),
    Banded(BandedMatrix<T>),
}

impl<T: Real> SymmetricStorage<T> {
    /// Zero storage for the given (resolved) layout. `Dense` and `Auto` fall back to packed.
    pub fn zeros(layout: StorageLayout, dim: usize, bandwidth: usize) -> Self {
        match layout.resolve(dim, bandwidth) {
            StorageLayout::Banded => Self::Banded(BandedMatrix::zeros(dim, bandwidth)),
            _ => Self::Packed(PackedMatrix::zeros(dim)),
        }
    }

    pub fn layout(&self) -> StorageLayout {
        match self {
            Self::Packed(_) => StorageLayout::Packed,
            Self::Banded(_) => StorageLayout::Banded,
        }
    }

    pub fn as_upper(&self) -> &dyn UpperStorage<T> {
        match self {
            Self::Packed(m) => m,
            Self::Banded(m) => m,
        }
    }

    pub fn as_upper_mut(&mut self) -> &mut dyn UpperStorage<T> {
        match self {
            Self::Packed(m) => m,
            Self::Banded(m) => m,
        }
    }
}

/// A non-positive pivot encountered during factorization.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PivotFailure {
    pub row: usize,
    pub pivot: f64,
}

/// Overwrites the upper triangle with the Cholesky factor `U`, `A = UᵀU`.
pub fn cholesky_in_place<T, S>(storage: &mut S) -> Result<(), PivotFailure>
where
    T: Real,
    S: ?Sized + UpperStorage<T>,
{
    let n = storage.dim();
    let kd = storage.bandwidth();
    for j in 0..n {
        let first = j.saturating_sub(kd);
        for i in first..j {
            let mut s = storage.get(i, j);
            for k in first.max(i.saturating_sub(kd))..i {
                s -= storage.get(k, i) * storage.get(k, j);
            }
            *storage.get_mut(i, j) = s / storage.get(i, i);
        }
        let mut d = storage.get(j, j);
        for k in first..j {
            let u = storage.get(k, j);
            d -= u * u;
        }
        if !(d > T::zero()) {
            return Err(PivotFailure {
                row: j,
                pivot: hpsolve_traits::to_f64(d),
            });
        }
        *storage.get_mut(j, j) = d.sqrt();
    }
    Ok(())
}

/// Solves `UᵀU x = b` in place, given the factor computed by [`cholesky_in_place`].
pub fn cholesky_solve_in_place<T, S>(factor: &S, b: &mut [T])
where
    T: Real,
    S: ?Sized + UpperStorage<T>,
{
    let n = factor.dim();
    let kd = factor.bandwidth();
    assert_eq!(b.len(), n);
    // Uᵀ y = b
    for i in 0..n {
        let mut s = b[i];
        for k in i.saturating_sub(kd)..i {
            s -= factor.get(k, i) * b[k];
        }
        b[i] = s / factor.get(i, i);
    }
    // U x = y
    for i in (0..n).rev() {
        let mut s = b[i];
        for k in (i + 1)..n.min(i + kd + 1) {
            s -= factor.get(i, k) * b[k];
        }
        b[i] = s / factor.get(i, i);
    }
}

/// `y = A x` for a symmetric matrix held in upper storage (not a factor).
pub fn symmetric_mul<T, S>(matrix: &S, x: &[T], y: &mut [T])
where
    T: Real,
    S: ?Sized + UpperStorage<T>,
{
    let n = matrix.dim();
    let kd = matrix.bandwidth();
    for value in y.iter_mut() {
        *value = T::zero();
    }
    for j in 0..n {
        for i in j.saturating_sub(kd)..j {
            let a = matrix.get(i, j);
            y[i] += a * x[j];
            y[j] += a * x[i];
        }
        y[j] += matrix.get(j, j) * x[j];
    }
}

/// Replaces row and column `dof` by the corresponding row and column of the identity.
pub fn pin_dof<T, S>(storage: &mut S, dof: usize)
where
    T: Real,
    S: ?Sized + UpperStorage<T>,
{
    let n = storage.dim();
    let kd = storage.bandwidth();
    for i in dof.saturating_sub(kd)..dof {
        *storage.get_mut(i, dof) = T::zero();
    }
    for j in (dof + 1)..n.min(dof + kd + 1) {
        *storage.get_mut(dof, j) = T::zero();
    }
    *storage.get_mut(dof, dof) = T::one();
}
