use hpsolve::multi_rhs::MultiRhsCache;
use hpsolve::settings::{MultiRhsSettings, MultiRhsUpdate};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};

fn cache(capacity: usize, update: MultiRhsUpdate) -> MultiRhsCache<f64> {
    MultiRhsCache::new(MultiRhsSettings { capacity, update })
}

fn insert_solution(cache: &mut MultiRhsCache<f64>, a: &DMatrix<f64>, x: &DVector<f64>) -> bool {
    cache.insert(x.clone(), a * x)
}

#[test]
fn empty_cache_yields_zero_guess() {
    let cache = cache(3, MultiRhsUpdate::EvictOldest);
    assert!(cache.is_empty());
    assert_eq!(cache.initial_guess(&DVector::repeat(4, 1.0)), DVector::zeros(4));
}

#[test]
fn cached_solution_is_reproduced_exactly() {
    let a = util::spd_matrix(8, 1);
    let x1 = util::pseudo_random_vector(8, 2);
    let x2 = util::pseudo_random_vector(8, 3);
    let mut cache = cache(3, MultiRhsUpdate::EvictOldest);
    assert!(insert_solution(&mut cache, &a, &x1));
    assert!(insert_solution(&mut cache, &a, &x2));

    assert_matrix_eq!(cache.initial_guess(&(&a * &x1)), x1, comp = abs, tol = 1e-10);
    assert_matrix_eq!(cache.initial_guess(&(&a * &x2)), x2, comp = abs, tol = 1e-10);
    // Linear combinations lie in the span as well
    let x = &x1 * 2.0 - &x2;
    assert_matrix_eq!(cache.initial_guess(&(&a * &x)), x, comp = abs, tol = 1e-10);
}

#[test]
fn guess_minimizes_energy_error_over_cached_space() {
    let a = util::spd_matrix(6, 4);
    let x1 = util::pseudo_random_vector(6, 5);
    let target = util::pseudo_random_vector(6, 6);
    let mut cache = cache(2, MultiRhsUpdate::EvictOldest);
    insert_solution(&mut cache, &a, &x1);

    let guess = cache.initial_guess(&(&a * &target));
    // The A-orthogonality of the error against the cached direction
    let error = &target - &guess;
    assert!((x1.dot(&(&a * &error))).abs() <= 1e-10);
}

#[test]
fn dependent_and_zero_energy_solutions_are_rejected() {
    let a = util::spd_matrix(5, 7);
    let x = util::pseudo_random_vector(5, 8);
    let mut cache = cache(4, MultiRhsUpdate::EvictOldest);
    assert!(insert_solution(&mut cache, &a, &x));
    assert!(!insert_solution(&mut cache, &a, &(&x * 3.0)));
    assert!(!cache.insert(DVector::zeros(5), DVector::zeros(5)));
    // Negative energy
    assert!(!cache.insert(x.clone(), -(&a * &x)));
    assert_eq!(cache.len(), 1);
}

#[test]
fn full_cache_evicts_or_restarts() {
    let a = util::spd_matrix(6, 9);
    let solutions: Vec<_> = (0..3).map(|seed| util::pseudo_random_vector(6, 20 + seed)).collect();

    let mut evicting = cache(2, MultiRhsUpdate::EvictOldest);
    let mut restarting = cache(2, MultiRhsUpdate::Restart);
    for x in &solutions {
        insert_solution(&mut evicting, &a, x);
        insert_solution(&mut restarting, &a, x);
    }
    assert_eq!(evicting.len(), 2);
    assert_eq!(restarting.len(), 1);
    assert_eq!(evicting.capacity(), 2);

    // The oldest solution has left the evicting cache, the newest is still there
    let newest = &solutions[2];
    assert_matrix_eq!(evicting.initial_guess(&(&a * newest)), newest.clone(), comp = abs, tol = 1e-10);
    assert_matrix_eq!(restarting.initial_guess(&(&a * newest)), newest.clone(), comp = abs, tol = 1e-10);

    evicting.clear();
    assert!(evicting.is_empty());
}

#[test]
fn evicting_cache_spans_the_remaining_solutions() {
    let a = util::spd_matrix(6, 13);
    let solutions: Vec<_> = (0..4).map(|seed| util::pseudo_random_vector(6, 40 + seed)).collect();
    let mut cache = cache(2, MultiRhsUpdate::EvictOldest);
    for x in &solutions {
        assert!(insert_solution(&mut cache, &a, x));
    }
    assert_eq!(cache.len(), 2);

    // Only the two most recent solutions are covered, including combinations of them
    let (x2, x3) = (&solutions[2], &solutions[3]);
    let combined = x2 * 0.5 - x3 * 3.0;
    for x in [x2, x3, &combined] {
        assert_matrix_eq!(cache.initial_guess(&(&a * x)), x.clone(), comp = abs, tol = 1e-10);
    }
    let oldest = &solutions[0];
    let error = (cache.initial_guess(&(&a * oldest)) - oldest).amax();
    assert!(error > 1e-6);
}
