use hpsolve::boundary_map::Sign;
use hpsolve::element::{DofKind, ElementShape};
use hpsolve::error::ErrorCategory;
use hpsolve::procedural::{BoundaryCondition, QuadMesh, SegmentMesh, StokesQuadMesh, TensorMesh};
use hpsolve::source::{BoundaryDofSource, LocalOperatorSource};
use hpsolve::SolverError;
use matrixcompare::assert_matrix_eq;
use std::collections::BTreeSet;

fn element_dofs(source: &impl BoundaryDofSource, element: usize) -> Vec<usize> {
    let mut dofs = vec![0; source.element_boundary_count(element)];
    source.populate_boundary_dofs(&mut dofs, element);
    dofs
}

fn element_signs(source: &impl BoundaryDofSource, element: usize) -> Vec<Sign> {
    let mut signs = vec![Sign::Positive; source.element_boundary_count(element)];
    source.populate_signs(&mut signs, element);
    signs
}

fn count_negative(signs: &[Sign]) -> usize {
    signs.iter().filter(|&&s| s == Sign::Negative).count()
}

#[test]
fn dirichlet_square_numbers_unknowns_before_fixed_dofs() {
    let mesh = QuadMesh::<f64>::unit_square(2, 2).unwrap();
    assert_eq!(mesh.num_elements(), 4);
    // 9 vertices and 12 edges with one mode each
    assert_eq!(mesh.num_global_dofs(), 21);
    // The center vertex and the four edges touching it
    assert_eq!(mesh.num_solve_dofs(), 5);
    assert_eq!(mesh.element_boundary_count(0), 8);

    let vertex_unknowns: Vec<_> = (0..5)
        .filter(|&dof| mesh.dof_group(dof).kind == DofKind::Vertex)
        .collect();
    assert_eq!(vertex_unknowns.len(), 1);
    assert_eq!(mesh.dof_position(vertex_unknowns[0]), Some(vec![0.5, 0.5]));

    for e in 0..4 {
        let dofs = element_dofs(&mesh, e);
        assert_eq!(dofs.iter().filter(|&&dof| dof < 5).count(), 3);
    }
}

#[test]
fn neighbors_share_edge_dofs() {
    let mesh = QuadMesh::<f64>::unit_square(2, 3).unwrap();
    let first: BTreeSet<_> = element_dofs(&mesh, 0).into_iter().collect();
    let second: BTreeSet<_> = element_dofs(&mesh, 1).into_iter().collect();
    let diagonal: BTreeSet<_> = element_dofs(&mesh, 3).into_iter().collect();
    // Two vertices and two edge modes
    assert_eq!(first.intersection(&second).count(), 4);
    assert_eq!(first.intersection(&diagonal).count(), 1);

    let shared_edge: Vec<_> = first
        .intersection(&second)
        .filter(|&&dof| mesh.dof_group(dof).kind == DofKind::Edge)
        .map(|&dof| mesh.dof_group(dof))
        .collect();
    assert_eq!(shared_edge.len(), 2);
    assert_eq!(shared_edge[0], shared_edge[1]);
}

#[test]
fn natural_boundary_leaves_every_dof_free() {
    let mesh = QuadMesh::<f64>::unit_square(2, 2)
        .unwrap()
        .with_boundary(BoundaryCondition::Natural);
    assert_eq!(mesh.num_solve_dofs(), mesh.num_global_dofs());

    let cube = TensorMesh::<f64>::unit_cube(2, 2).unwrap();
    // 27 vertices, 54 edges, 36 faces
    assert_eq!(cube.num_global_dofs(), 27 + 54 + 36);
    // Center vertex, 6 edges and 12 faces touching it
    assert_eq!(cube.num_solve_dofs(), 1 + 6 + 12);
}

#[test]
fn dirichlet_values_interpolate_at_fixed_vertices() {
    let mesh = QuadMesh::<f64>::unit_square(2, 2).unwrap();
    let values = mesh.dirichlet_values(|x| 1.0 + x[0]);
    for dof in 0..mesh.num_global_dofs() {
        let expected = match mesh.dof_position(dof) {
            Some(x) if dof >= mesh.num_solve_dofs() => 1.0 + x[0],
            _ => 0.0,
        };
        assert_eq!(values[dof], expected);
    }
}

#[test]
fn mirrored_columns_flip_odd_edge_modes() {
    let plain = QuadMesh::<f64>::unit_square(2, 3).unwrap();
    for e in 0..4 {
        assert_eq!(count_negative(&element_signs(&plain, e)), 0);
    }

    let mirrored = plain.clone().with_mirrored_columns();
    assert_eq!(mirrored.element_geometry(1).reversed, vec![true, false]);
    assert_eq!(mirrored.element_geometry(2).reversed, vec![false, false]);
    // The cubic mode of both horizontal edges
    assert_eq!(count_negative(&element_signs(&mirrored, 0)), 0);
    assert_eq!(count_negative(&element_signs(&mirrored, 1)), 2);
    assert_eq!(count_negative(&element_signs(&mirrored, 3)), 2);
    assert_eq!(mirrored.num_solve_dofs(), plain.num_solve_dofs());

    // Even modes never change sign
    let quadratic = QuadMesh::<f64>::unit_square(2, 2).unwrap().with_mirrored_columns();
    assert_eq!(count_negative(&element_signs(&quadratic, 1)), 0);
}

#[test]
fn element_families_follow_mesh_uniformity() {
    let uniform = QuadMesh::<f64>::unit_square(3, 2).unwrap().with_lambda(2.0);
    let family = uniform.element_family(4).unwrap();
    assert_eq!(family.scale, 1.0);
    assert_eq!(family.key.shape, ElementShape::Quadrilateral);
    assert_eq!(uniform.lambda(), 2.0);

    let graded = QuadMesh::<f64>::new(ElementShape::Quadrilateral, vec![vec![0.25, 0.75], vec![1.0]], 2).unwrap();
    assert!(graded.element_family(0).is_none());

    let segments = SegmentMesh::<f64>::segment(vec![0.25, 0.75], 3).unwrap();
    let family = segments.element_family(1).unwrap();
    assert_eq!(family.scale, 2.0 / 0.75);
    // The unit-scale operator belongs to an element of length 2
    let unit = segments.reference().laplacian_matrix(&[2.0]).unwrap();
    let operator = segments.local_operator(1).unwrap();
    assert_matrix_eq!(operator.matrix().clone(), unit * family.scale, comp = abs, tol = 1e-12);
}

#[test]
fn invalid_meshes_are_rejected() {
    let err = QuadMesh::<f64>::new(ElementShape::Quadrilateral, vec![vec![0.5, -0.5], vec![1.0]], 2).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    let err = QuadMesh::<f64>::new(ElementShape::Quadrilateral, vec![vec![1.0]], 2).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Dimension);

    let segment = SegmentMesh::<f64>::segment(vec![1.0], 2).unwrap();
    assert!(matches!(
        StokesQuadMesh::new(segment).unwrap_err(),
        SolverError::UnsupportedShape { .. }
    ));
    let linear = QuadMesh::<f64>::unit_square(2, 1).unwrap();
    assert_eq!(
        StokesQuadMesh::new(linear).unwrap_err().category(),
        ErrorCategory::Configuration
    );
}

#[test]
fn stokes_mesh_loads_both_components() {
    let stokes = StokesQuadMesh::<f64>::unit_square(2, 3).unwrap();
    assert_eq!(stokes.num_pressure_modes(), 4);
    let loads = stokes.load_vectors(|_| [1.0, 0.0]).unwrap();
    assert_eq!(loads.len(), 2);
    let total: f64 = (0..4).map(|e| loads[0].get(e).unwrap()[..4].iter().sum::<f64>()).sum();
    assert!((total - 1.0).abs() < 1e-12);
    assert!((0..4).all(|e| loads[1].get(e).unwrap().iter().all(|&v| v == 0.0)));
}
