use nalgebra::{DMatrix, DVector};

/// Asserts that two matrices (or references to matrices) agree entrywise to an absolute tolerance.
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let (left, right) = ($x, $y);
        assert_eq!(left.shape(), right.shape(), "matrix shapes differ");
        let max_abs_diff = (left.clone() - right.clone()).amax();
        if !(max_abs_diff <= $tol) {
            panic!(
                "matrices differ by {:e} (abstol {:e})\nleft: {}\nright: {}",
                max_abs_diff, $tol, left, right
            );
        }
    }};
}

/// Deterministic pseudo-random numbers in [-1, 1) from a 64-bit LCG.
pub fn pseudo_random_values(count: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let bits = (state >> 11) as f64 / (1u64 << 53) as f64;
            2.0 * bits - 1.0
        })
        .collect()
}

/// A symmetric, strictly diagonally dominant (hence positive definite) matrix.
pub fn spd_matrix(n: usize, seed: u64) -> DMatrix<f64> {
    let values = pseudo_random_values(n * n, seed);
    let mut m = DMatrix::from_column_slice(n, n, &values);
    m = &m + m.transpose();
    for i in 0..n {
        let off_diagonal: f64 = (0..n).filter(|&j| j != i).map(|j| m[(i, j)].abs()).sum();
        m[(i, i)] = off_diagonal + 1.0 + (i as f64) * 0.1;
    }
    m
}

/// A non-symmetric matrix with a strictly dominant diagonal.
pub fn diagonally_dominant_matrix(n: usize, seed: u64) -> DMatrix<f64> {
    let values = pseudo_random_values(n * n, seed);
    let mut m = DMatrix::from_column_slice(n, n, &values);
    for i in 0..n {
        let off_diagonal: f64 = (0..n).filter(|&j| j != i).map(|j| m[(i, j)].abs()).sum();
        m[(i, i)] = off_diagonal + 2.0;
    }
    m
}

pub fn pseudo_random_vector(n: usize, seed: u64) -> DVector<f64> {
    DVector::from_vec(pseudo_random_values(n, seed))
}
