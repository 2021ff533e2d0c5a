use hpsolve::error::ErrorCategory;
use hpsolve::nested_vec::NestedVec;
use hpsolve::procedural::StokesQuadMesh;
use hpsolve::settings::{
    MultiRhsSettings, MultiRhsUpdate, PreconditionerKind, RecursionSettings, SingularHandling, SolverSettings,
};
use hpsolve::source::{BoundaryDofSource, StokesOperatorSource};
use hpsolve::stokes::{StokesRhs, StokesSolution, StokesSystem};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

fn pinned(base: SolverSettings) -> SolverSettings {
    SolverSettings {
        singular: SingularHandling::Pinned { dof: None },
        tolerance: 1e-12,
        ..base
    }
}

fn stokes_rhs<F>(mesh: &StokesQuadMesh<f64>, f: F) -> StokesRhs<f64>
where
    F: Fn(&[f64]) -> [f64; 2],
{
    StokesRhs {
        velocity: mesh.load_vectors(f).unwrap(),
        pressure: NestedVec::from(vec![vec![0.0; mesh.num_pressure_modes()]; mesh.num_elements()]),
    }
}

fn solve_stokes<F>(mesh: &StokesQuadMesh<f64>, settings: SolverSettings, f: F) -> StokesSolution<f64>
where
    F: Fn(&[f64]) -> [f64; 2],
{
    let boundary = vec![DVector::zeros(mesh.num_global_dofs()); 2];
    let mut system = StokesSystem::build(mesh, settings).unwrap();
    assert_eq!(system.pinned_pressure(), Some(0));
    system.solve(&stokes_rhs(mesh, f), &boundary).unwrap()
}

fn flat_pressure(solution: &StokesSolution<f64>) -> DMatrix<f64> {
    DMatrix::from_iterator(
        solution.pressure.total_num_elements(),
        1,
        solution.pressure.iter_array_elements().copied(),
    )
}

fn swirl(x: &[f64]) -> [f64; 2] {
    [(PI * x[1]).sin(), x[0] * x[0]]
}

#[test]
fn gradient_forcing_is_balanced_by_pressure() {
    // f = ∇x: the exact solution is u = 0, p = x + c
    let mesh = StokesQuadMesh::<f64>::unit_square(3, 3).unwrap();
    let solution = solve_stokes(&mesh, pinned(SolverSettings::direct()), |_| [1.0, 0.0]);

    for component in &solution.velocity {
        for element in component.iter() {
            assert!(element.iter().all(|u| u.abs() < 1e-10));
        }
    }
    assert!(solution.constant_pressure(0).abs() < 1e-14);
    let x0 = mesh.mesh().element_center(0)[0];
    for e in 0..mesh.num_elements() {
        let expected = mesh.mesh().element_center(e)[0] - x0;
        let difference = solution.constant_pressure(e) - solution.constant_pressure(0);
        assert!((difference - expected).abs() < 1e-10, "element {}", e);
    }
}

#[test]
fn velocity_is_discretely_divergence_free() {
    let mesh = StokesQuadMesh::<f64>::unit_square(2, 4).unwrap();
    let solution = solve_stokes(&mesh, pinned(SolverSettings::direct()), swirl);

    let mut velocity_norm = 0.0;
    for e in 0..mesh.num_elements() {
        let divergence = mesh.divergence_operator(e).unwrap();
        let mut residual = DVector::zeros(mesh.num_pressure_modes());
        for (c, block) in divergence.blocks.iter().enumerate() {
            let u = DVector::from_column_slice(solution.velocity[c].get(e).unwrap());
            velocity_norm += u.norm();
            residual += block * u;
        }
        assert!(residual.amax() < 1e-10, "element {}: {}", e, residual.amax());
    }
    assert!(velocity_norm > 1e-3);
}

#[test]
fn uzawa_iterations_match_direct_solve() {
    let mesh = StokesQuadMesh::<f64>::unit_square(3, 3).unwrap();
    let direct = solve_stokes(&mesh, pinned(SolverSettings::direct()), swirl);
    assert_eq!(direct.iterations, 0);

    for kind in [PreconditionerKind::None, PreconditionerKind::Diagonal] {
        let uzawa = solve_stokes(&mesh, pinned(SolverSettings::iterative(kind)), swirl);
        assert!(uzawa.iterations > 0);
        for c in 0..2 {
            assert_matrix_eq!(
                uzawa.velocity_boundary[c],
                direct.velocity_boundary[c],
                comp = abs,
                tol = 1e-8
            );
        }
        assert_matrix_eq!(flat_pressure(&uzawa), flat_pressure(&direct), comp = abs, tol = 1e-7);
    }
}

#[test]
fn uzawa_reuses_cached_pressure_solutions() {
    let mesh = StokesQuadMesh::<f64>::unit_square(4, 3).unwrap();
    let settings = SolverSettings {
        multi_rhs: Some(MultiRhsSettings {
            capacity: 4,
            update: MultiRhsUpdate::EvictOldest,
        }),
        ..pinned(SolverSettings::iterative(PreconditionerKind::Diagonal))
    };
    let mut system = StokesSystem::build(&mesh, settings).unwrap();
    let boundary = vec![DVector::zeros(mesh.num_global_dofs()); 2];
    let other = |x: &[f64]| [x[0] * x[1], (2.0 * x[0]).cos()];

    let first = system.solve(&stokes_rhs(&mesh, swirl), &boundary).unwrap();
    assert_eq!(system.multi_rhs_cache().map(|cache| cache.len()), Some(1));
    let second = system.solve(&stokes_rhs(&mesh, other), &boundary).unwrap();
    assert_eq!(system.multi_rhs_cache().map(|cache| cache.len()), Some(2));
    assert!(first.iterations.min(second.iterations) > 4);

    // The pressure of a combined forcing lies in the cached space
    let combined_forcing = |x: &[f64]| {
        let (a, b) = (swirl(x), other(x));
        [0.5 * a[0] - 2.0 * b[0], 0.5 * a[1] - 2.0 * b[1]]
    };
    let combined = system.solve(&stokes_rhs(&mesh, combined_forcing), &boundary).unwrap();
    assert!(
        combined.iterations <= 2,
        "{} vs {} and {}",
        combined.iterations,
        first.iterations,
        second.iterations
    );

    let expected = flat_pressure(&first) * 0.5 - flat_pressure(&second) * 2.0;
    assert_matrix_eq!(flat_pressure(&combined), expected, comp = abs, tol = 1e-7);
    for c in 0..2 {
        let expected = &first.velocity_boundary[c] * 0.5 - &second.velocity_boundary[c] * 2.0;
        assert_matrix_eq!(combined.velocity_boundary[c], expected, comp = abs, tol = 1e-8);
    }
}

#[test]
fn unsupported_stokes_configurations_are_rejected() {
    let mesh = StokesQuadMesh::<f64>::unit_square(2, 3).unwrap();
    let rejected = [
        pinned(SolverSettings::iterative(PreconditionerKind::Block)),
        pinned(SolverSettings::iterative(PreconditionerKind::LowEnergy)),
        SolverSettings {
            recursion: Some(RecursionSettings::default()),
            ..pinned(SolverSettings::direct())
        },
        SolverSettings {
            singular: SingularHandling::Pinned {
                dof: Some(mesh.num_elements()),
            },
            ..SolverSettings::direct()
        },
    ];
    for settings in rejected {
        let err = StokesSystem::build(&mesh, settings).err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}

#[test]
fn stokes_mesh_requires_quadratic_velocity() {
    assert!(StokesQuadMesh::<f64>::unit_square(2, 1).is_err());
}
