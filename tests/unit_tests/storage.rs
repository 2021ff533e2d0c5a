use hpsolve::storage::{
    banded_index, cholesky_in_place, cholesky_solve_in_place, packed_index, pin_dof, symmetric_mul, BandedMatrix,
    PackedMatrix, StorageLayout, SymmetricStorage, UpperStorage,
};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};

/// SPD pentadiagonal matrix.
fn banded_spd(n: usize) -> DMatrix<f64> {
    DMatrix::from_fn(n, n, |i, j| match i.abs_diff(j) {
        0 => 6.0 + i as f64 * 0.1,
        1 => -1.5,
        2 => 0.5,
        _ => 0.0,
    })
}

fn fill_upper(storage: &mut dyn UpperStorage<f64>, matrix: &DMatrix<f64>) {
    for j in 0..matrix.ncols() {
        for i in 0..=j {
            storage.add_symmetric(i, j, matrix[(i, j)]);
        }
    }
}

#[test]
fn packed_and_banded_index_follow_lapack_upper_layout() {
    assert_eq!(packed_index(0, 0), 0);
    assert_eq!(packed_index(0, 1), 1);
    assert_eq!(packed_index(1, 1), 2);
    assert_eq!(packed_index(0, 2), 3);
    assert_eq!(packed_index(2, 2), 5);

    // Column-major with the diagonal in row `bandwidth`
    assert_eq!(banded_index(0, 0, 2), 2);
    assert_eq!(banded_index(0, 1, 2), 4);
    assert_eq!(banded_index(1, 1, 2), 5);
    assert_eq!(banded_index(0, 2, 2), 6);
    assert_eq!(banded_index(2, 2, 2), 8);
}

#[test]
fn auto_layout_selects_banded_for_narrow_bands() {
    assert_eq!(StorageLayout::Auto.resolve(10, 4), StorageLayout::Banded);
    assert_eq!(StorageLayout::Auto.resolve(10, 5), StorageLayout::Packed);
    assert_eq!(StorageLayout::Packed.resolve(10, 1), StorageLayout::Packed);
    assert_eq!(StorageLayout::Dense.resolve(10, 1), StorageLayout::Dense);
    assert_eq!(SymmetricStorage::<f64>::zeros(StorageLayout::Auto, 10, 2).layout(), StorageLayout::Banded);
    assert_eq!(SymmetricStorage::<f64>::zeros(StorageLayout::Dense, 10, 2).layout(), StorageLayout::Packed);
}

#[test]
fn packed_and_banded_cholesky_agree_with_dense_solve() {
    let n = 9;
    let matrix = banded_spd(n);
    let b = util::pseudo_random_vector(n, 13);
    let expected = matrix.clone().cholesky().unwrap().solve(&b);

    let mut packed = PackedMatrix::zeros(n);
    let mut banded = BandedMatrix::zeros(n, 2);
    fill_upper(&mut packed, &matrix);
    fill_upper(&mut banded, &matrix);
    assert_eq!(banded.as_slice().len(), n * 3);

    let mut y = vec![0.0; n];
    symmetric_mul(&banded, expected.as_slice(), &mut y);
    assert_matrix_eq!(DVector::from_vec(y), b, comp = abs, tol = 1e-12);

    let storages: [&mut dyn UpperStorage<f64>; 2] = [&mut packed, &mut banded];
    for storage in storages {
        cholesky_in_place(&mut *storage).unwrap();
        let mut x = b.clone();
        cholesky_solve_in_place(&*storage, x.as_mut_slice());
        assert_matrix_eq!(x, expected, comp = abs, tol = 1e-12);
    }
}

#[test]
fn entries_outside_the_band_are_ignored() {
    let mut banded = BandedMatrix::zeros(5, 1);
    banded.add_symmetric(0, 3, 7.0);
    banded.add_symmetric(2, 1, 3.0);
    assert_eq!(banded.entry(0, 3), 0.0);
    assert_eq!(banded.entry(1, 2), 3.0);
    assert_eq!(banded.entry(2, 1), 3.0);
}

#[test]
fn cholesky_reports_first_non_positive_pivot() {
    let mut matrix = banded_spd(6);
    matrix[(3, 3)] = -1.0;
    let mut packed = PackedMatrix::zeros(6);
    fill_upper(&mut packed, &matrix);
    let failure = cholesky_in_place(&mut packed).unwrap_err();
    assert_eq!(failure.row, 3);
    assert!(failure.pivot <= 0.0);
}

#[test]
fn pinned_dof_becomes_identity_row() {
    let n = 6;
    let mut banded = BandedMatrix::zeros(n, 2);
    fill_upper(&mut banded, &banded_spd(n));
    pin_dof(&mut banded, 2);
    for j in 0..n {
        assert_eq!(banded.entry(2, j), if j == 2 { 1.0 } else { 0.0 });
    }
    cholesky_in_place(&mut banded).unwrap();
    let mut x = vec![1.0; n];
    x[2] = 0.0;
    cholesky_solve_in_place(&banded, &mut x);
    assert_eq!(x[2], 0.0);
}
