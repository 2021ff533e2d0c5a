//! Proptest strategies for element operators and boundary maps.
use crate::boundary_map::Sign;
use crate::partition::{LocalElementMatrix, Symmetry};
use ::proptest::collection::vec;
use ::proptest::prelude::*;
use nalgebra::DMatrix;

impl Arbitrary for Sign {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        any::<bool>().prop_map(Sign::from_flip).boxed()
    }
}

/// Symmetric positive definite `n × n` matrices.
///
/// Built as `G Gᵀ + n I` from a matrix `G` with entries in `[-1, 1]`, so the smallest
/// eigenvalue is at least `n`.
pub fn spd_matrix(n: usize) -> impl Strategy<Value = DMatrix<f64>> {
    vec(-1.0..=1.0, n * n).prop_map(move |values| {
        let g = DMatrix::from_vec(n, n, values);
        &g * g.transpose() + DMatrix::identity(n, n) * (n as f64)
    })
}

/// Symmetric positive definite element operators with `1..=max_boundary` boundary modes and
/// `0..=max_interior` interior modes.
pub fn symmetric_local_matrix(
    max_boundary: usize,
    max_interior: usize,
) -> impl Strategy<Value = LocalElementMatrix<f64>> {
    (1..=max_boundary.max(1), 0..=max_interior)
        .prop_flat_map(|(nb, ni)| (Just(nb), spd_matrix(nb + ni)))
        .prop_filter_map("valid element matrix", |(nb, matrix)| {
            LocalElementMatrix::new(matrix, nb, Symmetry::Symmetric).ok()
        })
}
