use hpsolve::boundary_map::{apply_sign_change, BoundaryMap, Sign};
use hpsolve::comm::SerialCommunicator;
use hpsolve::element::{DofGroup, DofKind};
use hpsolve::error::ErrorCategory;
use hpsolve::nested_vec::NestedVec;
use proptest::collection::vec;
use proptest::prelude::*;

/// Two 1D elements of order 2: [0, 1 | 3] and [1, 2 | 4], where dof 1 is shared, dof 2 is fixed
/// and dofs 3, 4 are edge-like modes in the boundary map.
fn two_element_map() -> BoundaryMap {
    let dofs = NestedVec::from(vec![vec![0, 1, 3], vec![1, 2, 4]]);
    let signs = NestedVec::from(vec![
        vec![Sign::Positive, Sign::Positive, Sign::Positive],
        vec![Sign::Positive, Sign::Positive, Sign::Negative],
    ]);
    let groups = vec![
        DofGroup::vertex(0),
        DofGroup::vertex(1),
        DofGroup::edge(0),
        DofGroup::edge(1),
        DofGroup::vertex(2),
    ];
    // Dof 4 is fixed: nsolve = 4
    BoundaryMap::from_parts(dofs, signs, 5, 4, groups).unwrap()
}

#[test]
fn gather_sums_shared_dofs_applies_signs_and_zeroes_fixed_dofs() {
    let map = two_element_map();
    let local = NestedVec::from(vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]]);
    let global = map.gather(&local, &SerialCommunicator).unwrap();
    assert_eq!(global.as_slice(), &[1.0, 12.0, 20.0, 3.0, 0.0]);
    assert_eq!(map.multiplicity(1), 2);
    assert_eq!(map.dof_elements(1), &[(0, 1), (1, 0)]);
}

#[test]
fn scatter_reads_signed_global_values() {
    let map = two_element_map();
    let local = map.scatter(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(local.get(0).unwrap(), &[1.0, 2.0, 4.0]);
    assert_eq!(local.get(1).unwrap(), &[2.0, 3.0, -5.0]);
}

#[test]
fn scatter_of_short_vector_reads_zero() {
    let map = two_element_map();
    let local = map.scatter(&[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(local.get(1).unwrap(), &[2.0, 3.0, 0.0]);
}

#[test]
fn bandwidth_and_solve_dofs() {
    let map = two_element_map();
    assert_eq!(map.num_solve_dofs(), 4);
    assert_eq!(map.num_global_dofs(), 5);
    assert!(map.is_solve_dof(3));
    assert!(!map.is_solve_dof(4));
    // Element 0 spans solve dofs 0..=3
    assert_eq!(map.bandwidth(), 3);
    let solve: Vec<_> = map.element_solve_dofs(1).collect();
    assert_eq!(solve, vec![(0, 1), (1, 2)]);
    assert_eq!(map.dof_group(2).kind, DofKind::Edge);
}

#[test]
fn from_parts_rejects_inconsistent_maps() {
    let signs = || NestedVec::from(vec![vec![Sign::Positive; 2]]);
    let groups = vec![DofGroup::vertex(0), DofGroup::vertex(1), DofGroup::vertex(2)];

    // Index out of range
    let dofs = NestedVec::from(vec![vec![0, 3]]);
    let err = BoundaryMap::from_parts(dofs, signs(), 3, 3, groups.clone()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Dimension);

    // Dof 2 is not referenced by any element
    let dofs = NestedVec::from(vec![vec![0, 1]]);
    let err = BoundaryMap::from_parts(dofs, signs(), 3, 3, groups.clone()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    // More solve dofs than global dofs
    let dofs = NestedVec::from(vec![vec![0, 1], vec![1, 2]]);
    let signs = NestedVec::from(vec![vec![Sign::Positive; 2], vec![Sign::Positive; 2]]);
    assert!(BoundaryMap::from_parts(dofs, signs, 3, 4, groups).is_err());
}

#[test]
fn sign_products() {
    assert_eq!(Sign::Negative * Sign::Negative, Sign::Positive);
    assert_eq!(Sign::Positive * Sign::Negative, Sign::Negative);
    assert_eq!(Sign::from_flip(true), Sign::Negative);
    assert_eq!(Sign::Negative.apply(2.0), -2.0);
}

proptest! {
    #[test]
    fn sign_change_is_an_involution(
        (values, signs) in (1usize..20).prop_flat_map(|n| (vec(-10.0..10.0f64, n), vec(any::<Sign>(), n)))
    ) {
        let mut changed = values.clone();
        apply_sign_change(&signs, &mut changed);
        for ((&v, &c), &s) in values.iter().zip(&changed).zip(&signs) {
            prop_assert_eq!(c, s.apply(v));
            prop_assert_eq!(c.abs(), v.abs());
        }
        apply_sign_change(&signs, &mut changed);
        prop_assert_eq!(changed, values);
    }

    #[test]
    fn gather_is_adjoint_of_scatter_on_solve_dofs(x in vec(-5.0..5.0f64, 5), y in vec(-5.0..5.0f64, 6)) {
        // <gather(y), x> = <y, scatter(x)> when fixed entries of x vanish
        let map = two_element_map();
        let mut x = x;
        x[4] = 0.0;
        let local = NestedVec::from(vec![y[0..3].to_vec(), y[3..6].to_vec()]);
        let gathered = map.gather(&local, &SerialCommunicator).unwrap();
        let scattered = map.scatter(&x);
        let lhs: f64 = gathered.iter().zip(&x).map(|(a, b)| a * b).sum();
        let rhs: f64 = local
            .iter_array_elements()
            .zip(scattered.iter_array_elements())
            .map(|(a, b)| a * b)
            .sum();
        prop_assert!((lhs - rhs).abs() <= 1e-10);
    }
}
