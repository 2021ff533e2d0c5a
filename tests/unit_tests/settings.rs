use hpsolve::error::ErrorCategory;
use hpsolve::partition::Symmetry;
use hpsolve::settings::{
    read_partition, MultiRhsSettings, MultiRhsUpdate, OverlapPatches, PreconditionerKind, RecursionSettings,
    SingularHandling, SolveMethod, SolverSettings, TopLevelSolve,
};
use hpsolve::storage::StorageLayout;
use hpsolve_sparse::cg::BetaUpdate;
use std::io::Cursor;

#[test]
fn settings_round_trip_through_json() {
    let mut settings = SolverSettings::iterative(PreconditionerKind::LowEnergy);
    settings.field = "pressure".to_string();
    settings.beta_update = BetaUpdate::FletcherReeves;
    settings.singular = SingularHandling::Pinned { dof: Some(3) };
    settings.multi_rhs = Some(MultiRhsSettings {
        capacity: 3,
        update: MultiRhsUpdate::Restart,
    });
    settings.overlap.patches = OverlapPatches::Partition(vec![vec![0, 1], vec![1, 2]]);

    let json = serde_json::to_string(&settings).unwrap();
    let parsed: SolverSettings = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, settings);
}

#[test]
fn missing_fields_take_default_values() {
    let parsed: SolverSettings = serde_json::from_str(r#"{ "solve_method": "Iterative", "tolerance": 1e-6 }"#).unwrap();
    assert_eq!(parsed.solve_method, SolveMethod::Iterative);
    assert_eq!(parsed.tolerance, 1e-6);
    assert_eq!(parsed.preconditioner, PreconditionerKind::Diagonal);
    assert_eq!(parsed.storage, StorageLayout::Auto);
    assert_eq!(parsed.beta_update, BetaUpdate::PolakRibiere);
    assert_eq!(parsed.singular, SingularHandling::Regular);
}

#[test]
fn iteration_cap_scales_with_problem_size() {
    let settings = SolverSettings::default();
    assert_eq!(settings.max_iterations(5), 200);
    assert_eq!(settings.max_iterations(100), 1000);
}

#[test]
fn validate_rejects_unsupported_combinations() {
    let check = |settings: SolverSettings, symmetry| settings.validate(symmetry).map_err(|err| err.category());
    let configuration = Err(ErrorCategory::Configuration);

    assert_eq!(check(SolverSettings::direct(), Symmetry::Symmetric), Ok(()));
    assert_eq!(check(SolverSettings::direct(), Symmetry::NonSymmetric), Ok(()));
    assert_eq!(
        check(SolverSettings::iterative(PreconditionerKind::Block), Symmetry::NonSymmetric),
        configuration
    );

    let banded = SolverSettings {
        storage: StorageLayout::Banded,
        ..SolverSettings::direct()
    };
    assert_eq!(check(banded, Symmetry::NonSymmetric), configuration);

    let remove_mean = SolverSettings {
        singular: SingularHandling::RemoveMean,
        ..SolverSettings::direct()
    };
    assert_eq!(check(remove_mean, Symmetry::Symmetric), configuration);

    let cached_direct = SolverSettings {
        multi_rhs: Some(MultiRhsSettings::default()),
        ..SolverSettings::direct()
    };
    assert_eq!(check(cached_direct, Symmetry::Symmetric), configuration);

    let zero_capacity = SolverSettings {
        multi_rhs: Some(MultiRhsSettings {
            capacity: 0,
            update: MultiRhsUpdate::EvictOldest,
        }),
        ..SolverSettings::iterative(PreconditionerKind::Diagonal)
    };
    assert_eq!(check(zero_capacity, Symmetry::Symmetric), configuration);

    let bad_tolerance = SolverSettings {
        tolerance: 0.0,
        ..SolverSettings::iterative(PreconditionerKind::None)
    };
    assert_eq!(check(bad_tolerance, Symmetry::Symmetric), configuration);

    let tiny_patches = SolverSettings {
        recursion: Some(RecursionSettings {
            patch_size: 1,
            ..RecursionSettings::default()
        }),
        ..SolverSettings::direct()
    };
    assert_eq!(check(tiny_patches, Symmetry::Symmetric), configuration);

    let multilevel = SolverSettings {
        recursion: Some(RecursionSettings {
            top: TopLevelSolve::Iterative,
            ..RecursionSettings::default()
        }),
        ..SolverSettings::direct()
    };
    assert_eq!(check(multilevel.clone(), Symmetry::Symmetric), Ok(()));
    assert_eq!(check(multilevel, Symmetry::NonSymmetric), configuration);
}

#[test]
fn read_partition_groups_elements_by_part() {
    let input = "0\n1\n# comment line\n0\n\n2 # trailing comment\n1\n";
    let parts = read_partition(Cursor::new(input)).unwrap();
    assert_eq!(parts, vec![vec![0, 2], vec![1, 4], vec![3]]);
}

#[test]
fn read_partition_drops_empty_parts() {
    let parts = read_partition(Cursor::new("3\n0\n3\n")).unwrap();
    assert_eq!(parts, vec![vec![1], vec![0, 2]]);
}

#[test]
fn read_partition_accepts_sparse_part_ids() {
    let input = format!("{}\n0\n{}\n", usize::MAX, usize::MAX);
    let parts = read_partition(Cursor::new(input)).unwrap();
    assert_eq!(parts, vec![vec![1], vec![0, 2]]);
}

#[test]
fn read_partition_rejects_malformed_lines() {
    let err = read_partition(Cursor::new("0\nx\n")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(read_partition(Cursor::new("-1\n")).is_err());
}
