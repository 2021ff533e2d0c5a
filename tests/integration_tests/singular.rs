use hpsolve::element::DofKind;
use hpsolve::error::ErrorCategory;
use hpsolve::procedural::{BoundaryCondition, QuadMesh};
use hpsolve::settings::{PreconditionerKind, SingularHandling, SolverSettings};
use hpsolve::source::BoundaryDofSource;
use hpsolve::{GlobalBoundarySystem, Solution};
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;
use std::f64::consts::PI;

/// Pure Neumann problem with a compatible (mean-free) forcing.
fn neumann_mesh() -> QuadMesh<f64> {
    QuadMesh::unit_square(3, 3)
        .unwrap()
        .with_boundary(BoundaryCondition::Natural)
}

fn solve(mesh: &QuadMesh<f64>, settings: SolverSettings) -> (Solution<f64>, Option<usize>) {
    let rhs = mesh
        .load_vectors(|x| (PI * x[0]).cos() * (PI * x[1]).cos())
        .unwrap();
    let mut system = GlobalBoundarySystem::build(mesh, settings).unwrap();
    let solution = system.solve(&rhs, &mesh.dirichlet_values(|_| 0.0)).unwrap();
    (solution, system.pinned_dof())
}

fn with_singular(handling: SingularHandling, base: SolverSettings) -> SolverSettings {
    SolverSettings {
        singular: handling,
        tolerance: 1e-12,
        ..base
    }
}

#[test]
fn pinned_direct_and_iterative_solves_agree() {
    let mesh = neumann_mesh();
    assert_eq!(mesh.num_solve_dofs(), mesh.num_global_dofs());
    let pinned = SingularHandling::Pinned { dof: None };

    let (direct, pinned_dof) = solve(&mesh, with_singular(pinned.clone(), SolverSettings::direct()));
    let pinned_dof = pinned_dof.unwrap();
    assert_eq!(mesh.dof_group(pinned_dof).kind, DofKind::Vertex);
    assert_eq!(direct.boundary[pinned_dof], 0.0);

    for kind in [PreconditionerKind::Diagonal, PreconditionerKind::Block, PreconditionerKind::LowEnergy] {
        let (iterative, dof) = solve(&mesh, with_singular(pinned.clone(), SolverSettings::iterative(kind)));
        assert_eq!(dof, Some(pinned_dof));
        assert_matrix_eq!(iterative.boundary, direct.boundary, comp = abs, tol = 1e-8);
    }
}

#[test]
fn explicit_pin_selects_the_dof() {
    let mesh = neumann_mesh();
    let first_vertex = (0..mesh.num_solve_dofs())
        .find(|&g| mesh.dof_group(g).kind == DofKind::Vertex)
        .unwrap();
    let (solution, dof) = solve(
        &mesh,
        with_singular(
            SingularHandling::Pinned {
                dof: Some(first_vertex),
            },
            SolverSettings::direct(),
        ),
    );
    assert_eq!(dof, Some(first_vertex));
    assert_eq!(solution.boundary[first_vertex], 0.0);

    let out_of_range = with_singular(
        SingularHandling::Pinned {
            dof: Some(mesh.num_solve_dofs()),
        },
        SolverSettings::direct(),
    );
    let err = GlobalBoundarySystem::build(&mesh, out_of_range).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn mean_removal_differs_from_pinned_solution_by_a_constant() {
    let mesh = neumann_mesh();
    let (pinned, _) = solve(
        &mesh,
        with_singular(SingularHandling::Pinned { dof: None }, SolverSettings::direct()),
    );
    let (mean_free, dof) = solve(
        &mesh,
        with_singular(
            SingularHandling::RemoveMean,
            SolverSettings::iterative(PreconditionerKind::Diagonal),
        ),
    );
    assert_eq!(dof, None);

    let vertex_dofs: Vec<_> = (0..mesh.num_solve_dofs())
        .filter(|&g| mesh.dof_group(g).kind == DofKind::Vertex)
        .collect();
    let vertex_sum: f64 = vertex_dofs.iter().map(|&g| mean_free.boundary[g]).sum();
    assert!(vertex_sum.abs() < 1e-9);

    let shift = mean_free.boundary[vertex_dofs[0]] - pinned.boundary[vertex_dofs[0]];
    for g in 0..mesh.num_solve_dofs() {
        let expected = if vertex_dofs.contains(&g) { shift } else { 0.0 };
        let difference = mean_free.boundary[g] - pinned.boundary[g];
        assert!((difference - expected).abs() < 1e-8, "dof {}", g);
    }
}

#[test]
fn mean_removal_requires_an_iterative_solve() {
    let mesh = neumann_mesh();
    let settings = with_singular(SingularHandling::RemoveMean, SolverSettings::direct());
    let err = GlobalBoundarySystem::build(&mesh, settings).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn pinned_solution_ignores_the_pinned_rhs_entry() {
    let mesh = neumann_mesh();
    for settings in [
        SolverSettings::direct(),
        SolverSettings::iterative(PreconditionerKind::Block),
    ] {
        let settings = with_singular(SingularHandling::Pinned { dof: None }, settings);
        let mut system = GlobalBoundarySystem::build(&mesh, settings).unwrap();
        let dof = system.pinned_dof().unwrap();
        let n = system.num_solve_dofs();

        let b = DVector::from_iterator(n, (0..n).map(|i| ((i * 7 % 5) as f64) - 2.0));
        let mut shifted = b.clone();
        shifted[dof] += 3.5;
        let (x, _) = system.solve_boundary(&b, &DVector::zeros(n)).unwrap();
        let (y, _) = system.solve_boundary(&shifted, &DVector::zeros(n)).unwrap();
        assert_eq!(x[dof], 0.0);
        assert_matrix_eq!(x, y, comp = abs, tol = 1e-9);
    }
}
