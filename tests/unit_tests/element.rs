use hpsolve::element::{DofGroup, DofKind, ElementShape, ModeCounts};
use hpsolve::error::ErrorCategory;
use hpsolve::SolverError;

#[test]
fn mode_counts_of_tensor_product_shapes() {
    let quad = ElementShape::Quadrilateral.mode_counts(4).unwrap();
    assert_eq!(
        quad,
        ModeCounts {
            vertex: 4,
            edge: 12,
            face: 0,
            interior: 9
        }
    );
    assert_eq!(quad.boundary(), 16);
    assert_eq!(quad.total(), 25);

    let hex = ElementShape::Hexahedron.mode_counts(3).unwrap();
    assert_eq!((hex.vertex, hex.edge, hex.face, hex.interior), (8, 24, 24, 8));
    assert_eq!(hex.total(), 64);

    let segment = ElementShape::Segment.mode_counts(5).unwrap();
    assert_eq!((segment.boundary(), segment.interior), (2, 4));
}

#[test]
fn mode_counts_of_simplices_match_polynomial_space() {
    // Full polynomial space of degree p
    let p = 4;
    let tri = ElementShape::Triangle.mode_counts(p).unwrap();
    assert_eq!(tri.total(), (p + 1) * (p + 2) / 2);
    let tet = ElementShape::Tetrahedron.mode_counts(p).unwrap();
    assert_eq!(tet.total(), (p + 1) * (p + 2) * (p + 3) / 6);
    // Triangle times line
    let prism = ElementShape::Prism.mode_counts(p).unwrap();
    assert_eq!(prism.total(), (p + 1) * (p + 1) * (p + 2) / 2);
}

#[test]
fn linear_elements_have_only_vertex_modes() {
    for shape in [
        ElementShape::Segment,
        ElementShape::Triangle,
        ElementShape::Quadrilateral,
        ElementShape::Tetrahedron,
        ElementShape::Prism,
        ElementShape::Hexahedron,
    ] {
        let counts = shape.mode_counts(1).unwrap();
        assert_eq!(counts.total(), shape.num_vertices(), "{:?}", shape);
    }
}

#[test]
fn unsupported_mode_counts_are_reported() {
    let err = ElementShape::Pyramid.mode_counts(3).unwrap_err();
    assert!(matches!(
        err,
        SolverError::UnsupportedShape {
            shape: ElementShape::Pyramid,
            ..
        }
    ));
    let err = ElementShape::Quadrilateral.mode_counts(0).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn dof_groups_order_by_kind_first() {
    let mut groups = vec![DofGroup::face(0), DofGroup::edge(3), DofGroup::vertex(7), DofGroup::edge(1)];
    groups.sort();
    assert_eq!(
        groups,
        vec![DofGroup::vertex(7), DofGroup::edge(1), DofGroup::edge(3), DofGroup::face(0)]
    );
    assert_eq!(DofGroup::new(DofKind::Element, 2).kind, DofKind::Element);
}
