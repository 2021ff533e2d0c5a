//! Element shapes and the boundary/interior mode hierarchy of the modified modal basis.
use crate::error::{SolverError, SolverResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementShape {
    Segment,
    Triangle,
    Quadrilateral,
    Tetrahedron,
    Pyramid,
    Prism,
    Hexahedron,
}

/// Number of modes attached to each kind of entity of an element.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeCounts {
    pub vertex: usize,
    pub edge: usize,
    pub face: usize,
    pub interior: usize,
}

impl ModeCounts {
    pub fn boundary(&self) -> usize {
        self.vertex + self.edge + self.face
    }

    pub fn total(&self) -> usize {
        self.boundary() + self.interior
    }
}

impl ElementShape {
    pub fn dimension(&self) -> usize {
        use ElementShape::*;
        match self {
            Segment => 1,
            Triangle | Quadrilateral => 2,
            Tetrahedron | Pyramid | Prism | Hexahedron => 3,
        }
    }

    pub fn num_vertices(&self) -> usize {
        use ElementShape::*;
        match self {
            Segment => 2,
            Triangle => 3,
            Quadrilateral => 4,
            Tetrahedron => 4,
            Pyramid => 5,
            Prism => 6,
            Hexahedron => 8,
        }
    }

    /// Number of edges carrying boundary modes.
    ///
    /// A segment has no edges: its single one-dimensional entity is the element interior.
    pub fn num_edges(&self) -> usize {
        use ElementShape::*;
        match self {
            Segment => 0,
            Triangle => 3,
            Quadrilateral => 4,
            Tetrahedron => 6,
            Pyramid => 8,
            Prism => 9,
            Hexahedron => 12,
        }
    }

    pub fn num_faces(&self) -> usize {
        use ElementShape::*;
        match self {
            Segment | Triangle | Quadrilateral => 0,
            Tetrahedron => 4,
            Pyramid => 5,
            Prism => 5,
            Hexahedron => 6,
        }
    }

    /// Mode counts of the modified modal basis of polynomial order `order` (at least 1).
    pub fn mode_counts(&self, order: usize) -> SolverResult<ModeCounts> {
        use ElementShape::*;
        if order == 0 {
            return Err(SolverError::configuration(
                "order",
                order,
                "the modal basis requires polynomial order >= 1",
            ));
        }
        // Bubble counts on the line, triangle and tetrahedron of order p
        let p = order;
        let line = p - 1;
        let tri = (p - 1) * p.saturating_sub(2) / 2;
        let tet = (p - 1) * p.saturating_sub(2) * p.saturating_sub(3) / 6;
        let quad = line * line;

        let counts = match self {
            Segment => ModeCounts {
                vertex: 2,
                edge: 0,
                face: 0,
                interior: line,
            },
            Triangle => ModeCounts {
                vertex: 3,
                edge: 3 * line,
                face: 0,
                interior: tri,
            },
            Quadrilateral => ModeCounts {
                vertex: 4,
                edge: 4 * line,
                face: 0,
                interior: quad,
            },
            Tetrahedron => ModeCounts {
                vertex: 4,
                edge: 6 * line,
                face: 4 * tri,
                interior: tet,
            },
            Prism => ModeCounts {
                vertex: 6,
                edge: 9 * line,
                face: 2 * tri + 3 * quad,
                interior: tri * line,
            },
            Hexahedron => ModeCounts {
                vertex: 8,
                edge: 12 * line,
                face: 6 * quad,
                interior: quad * line,
            },
            Pyramid => {
                return Err(SolverError::UnsupportedShape {
                    shape: *self,
                    operation: "mode_counts",
                })
            }
        };
        Ok(counts)
    }
}

/// The kind of mesh entity a global degree of freedom is attached to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DofKind {
    Vertex,
    Edge,
    Face,
    /// Modes owned by a single element or patch that still take part in a boundary system.
    Element,
}

/// Identifies the mesh entity (vertex, edge, face) a global dof belongs to.
///
/// Dofs of the same edge or face share a group, while all vertex dofs are grouped by kind only
/// in the block preconditioners.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DofGroup {
    pub kind: DofKind,
    pub id: usize,
}

impl DofGroup {
    pub fn new(kind: DofKind, id: usize) -> Self {
        Self { kind, id }
    }

    pub fn vertex(id: usize) -> Self {
        Self::new(DofKind::Vertex, id)
    }

    pub fn edge(id: usize) -> Self {
        Self::new(DofKind::Edge, id)
    }

    pub fn face(id: usize) -> Self {
        Self::new(DofKind::Face, id)
    }
}
