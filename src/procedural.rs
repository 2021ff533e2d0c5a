//! Structured meshes of axis-aligned tensor-product elements.
//!
//! The meshes number the boundary modes of every element globally, with unknowns first and
//! Dirichlet dofs last, and supply the element operators of `-Δu + λu`. They are mostly
//! intended for tests and demos.
use crate::boundary_map::{ElementVectors, Sign};
use crate::element::{DofGroup, DofKind, ElementShape};
use crate::error::{SolverError, SolverResult};
use crate::partition::LocalElementMatrix;
use crate::reference::{ElementGeometry, ReferenceElement};
use crate::source::{
    BoundaryDofSource, DivergenceOperator, ElementFamily, FamilyKey, LocalOperatorSource, StokesOperatorSource,
};
use fenris_nested_vec::NestedVec;
use hpsolve_traits::Real;
use itertools::Itertools;
use nalgebra::{convert, DVector};
use rustc_hash::FxHashMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BoundaryCondition {
    /// Every dof on the domain boundary is fixed.
    Dirichlet,
    /// No dof is fixed. The Laplacian is then singular with the constants as null space.
    Natural,
}

/// A structured mesh of segments, quadrilaterals or hexahedra.
///
/// Cell `c = (c_0, c_1, c_2)` has linear index `c_0 + n_0 (c_1 + n_1 c_2)`, and grid vertices
/// are numbered the same way with `n_d + 1` vertices per axis.
#[derive(Debug, Clone)]
pub struct TensorMesh<T: Real> {
    reference: ReferenceElement,
    widths: Vec<Vec<T>>,
    lambda: T,
    boundary: BoundaryCondition,
    mirror_columns: bool,
    numbering: Numbering,
}

pub type SegmentMesh<T> = TensorMesh<T>;
pub type QuadMesh<T> = TensorMesh<T>;
pub type HexMesh<T> = TensorMesh<T>;

#[derive(Debug, Clone, Default)]
struct Numbering {
    dofs: NestedVec<usize>,
    signs: NestedVec<Sign>,
    groups: Vec<DofGroup>,
    /// Grid vertex of every vertex dof.
    vertices: Vec<Option<usize>>,
    num_solve: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DofKey {
    kind: DofKind,
    vertices: Vec<usize>,
    bubble: Vec<usize>,
}

impl<T: Real> TensorMesh<T> {
    /// A mesh with the given cell widths per axis, Dirichlet boundaries and `λ = 0`.
    pub fn new(shape: ElementShape, widths: Vec<Vec<T>>, order: usize) -> SolverResult<Self> {
        let reference = ReferenceElement::new(shape, order)?;
        SolverError::check_dimension("mesh axes", None, shape.dimension(), widths.len())?;
        for axis in &widths {
            if axis.is_empty() {
                return Err(SolverError::configuration("widths", "[]", "every axis needs at least one cell"));
            }
            if let Some(w) = axis.iter().find(|&&w| !(w > T::zero())) {
                return Err(SolverError::configuration("widths", w, "cell widths must be positive"));
            }
        }
        let mut mesh = Self {
            reference,
            widths,
            lambda: T::zero(),
            boundary: BoundaryCondition::Dirichlet,
            mirror_columns: false,
            numbering: Numbering::default(),
        };
        mesh.renumber();
        Ok(mesh)
    }

    pub fn segment(widths: Vec<T>, order: usize) -> SolverResult<Self> {
        Self::new(ElementShape::Segment, vec![widths], order)
    }

    /// Uniform mesh of the unit interval, square or cube.
    pub fn unit_box(shape: ElementShape, cells_per_dim: usize, order: usize) -> SolverResult<Self> {
        let h = T::one() / convert::<f64, T>(cells_per_dim as f64);
        Self::new(shape, vec![vec![h; cells_per_dim]; shape.dimension()], order)
    }

    pub fn unit_square(cells_per_dim: usize, order: usize) -> SolverResult<Self> {
        Self::unit_box(ElementShape::Quadrilateral, cells_per_dim, order)
    }

    pub fn unit_cube(cells_per_dim: usize, order: usize) -> SolverResult<Self> {
        Self::unit_box(ElementShape::Hexahedron, cells_per_dim, order)
    }

    /// Uses the operator `-Δu + λu`.
    pub fn with_lambda(self, lambda: T) -> Self {
        Self { lambda, ..self }
    }

    pub fn with_boundary(mut self, boundary: BoundaryCondition) -> Self {
        self.boundary = boundary;
        self.renumber();
        self
    }

    /// Reverses the local x axis of every element in an odd column, which introduces sign
    /// changes of odd edge modes between neighbors.
    pub fn with_mirrored_columns(mut self) -> Self {
        self.mirror_columns = true;
        self.renumber();
        self
    }

    pub fn reference(&self) -> &ReferenceElement {
        &self.reference
    }

    pub fn dimension(&self) -> usize {
        self.widths.len()
    }

    pub fn lambda(&self) -> T {
        self.lambda
    }

    pub fn cells_per_axis(&self) -> Vec<usize> {
        self.widths.iter().map(Vec::len).collect()
    }

    fn cell_index(&self, element: usize) -> Vec<usize> {
        let mut rest = element;
        self.widths
            .iter()
            .map(|axis| {
                let c = rest % axis.len();
                rest /= axis.len();
                c
            })
            .collect()
    }

    fn vertex_id(&self, grid: &[usize]) -> usize {
        grid.iter()
            .zip(&self.widths)
            .rev()
            .fold(0, |acc, (&i, axis)| acc * (axis.len() + 1) + i)
    }

    fn vertex_grid(&self, vertex: usize) -> Vec<usize> {
        let mut rest = vertex;
        self.widths
            .iter()
            .map(|axis| {
                let i = rest % (axis.len() + 1);
                rest /= axis.len() + 1;
                i
            })
            .collect()
    }

    fn is_reversed(&self, cell: &[usize]) -> Vec<bool> {
        (0..self.dimension())
            .map(|d| d == 0 && self.mirror_columns && cell[0] % 2 == 1)
            .collect()
    }

    /// Physical position of a grid vertex.
    pub fn vertex_position(&self, vertex: usize) -> Vec<T> {
        self.vertex_grid(vertex)
            .iter()
            .zip(&self.widths)
            .map(|(&i, axis)| axis[..i].iter().fold(T::zero(), |acc, &w| acc + w))
            .collect()
    }

    pub fn element_geometry(&self, element: usize) -> ElementGeometry<T> {
        let cell = self.cell_index(element);
        let origin = cell
            .iter()
            .zip(&self.widths)
            .map(|(&c, axis)| axis[..c].iter().fold(T::zero(), |acc, &w| acc + w))
            .collect();
        let lengths = cell.iter().zip(&self.widths).map(|(&c, axis)| axis[c]).collect();
        ElementGeometry::new(origin, lengths).with_reversed(self.is_reversed(&cell))
    }

    pub fn element_center(&self, element: usize) -> Vec<T> {
        self.element_geometry(element).center()
    }

    /// Position of a vertex dof, `None` for edge, face and element dofs.
    pub fn dof_position(&self, dof: usize) -> Option<Vec<T>> {
        self.numbering
            .vertices
            .get(dof)
            .copied()
            .flatten()
            .map(|v| self.vertex_position(v))
    }

    /// Element load vectors `∫ f φ_i` of the forcing `f`.
    pub fn load_vectors<F>(&self, f: F) -> SolverResult<ElementVectors<T>>
    where
        F: Fn(&[T]) -> T,
    {
        let mut loads = NestedVec::new();
        for e in 0..self.num_elements() {
            let load = self.reference.load_vector(&self.element_geometry(e), &f)?;
            loads.push(load.as_slice());
        }
        Ok(loads)
    }

    /// Global vector with `g` interpolated at the vertices of the fixed dofs.
    ///
    /// Edge and face modes of the boundary data are set to zero, and so are all unknowns.
    pub fn dirichlet_values<F>(&self, g: F) -> DVector<T>
    where
        F: Fn(&[T]) -> T,
    {
        let mut values = DVector::zeros(self.num_global_dofs());
        for dof in self.numbering.num_solve..self.num_global_dofs() {
            if let Some(x) = self.dof_position(dof) {
                values[dof] = g(&x);
            }
        }
        values
    }

    fn is_uniform(&self) -> bool {
        self.widths
            .iter()
            .all(|axis| axis.iter().all(|&w| w == axis[0]))
    }

    /// Assigns global dofs to the boundary modes of every element.
    fn renumber(&mut self) {
        let dim = self.dimension();
        let cells = self.cells_per_axis();
        let modes: Vec<_> = self
            .reference
            .modes()
            .iter()
            .filter(|mode| mode.kind != DofKind::Element)
            .cloned()
            .collect();

        let mut keys: FxHashMap<DofKey, usize> = FxHashMap::default();
        let mut key_list: Vec<(DofKey, bool)> = Vec::new();
        let mut element_keys = Vec::with_capacity(self.num_elements());
        let mut signs = NestedVec::new();

        for e in 0..self.num_elements() {
            let cell = self.cell_index(e);
            let reversed = self.is_reversed(&cell);
            let grid_of = |corner: &[usize]| -> Vec<usize> {
                (0..dim)
                    .map(|d| cell[d] + if reversed[d] { 1 - corner[d] } else { corner[d] })
                    .collect()
            };

            let mut local_keys = Vec::with_capacity(modes.len());
            let mut local_signs = Vec::with_capacity(modes.len());
            for mode in &modes {
                let free: Vec<usize> = (0..dim).filter(|&d| mode.pattern[d].is_none()).collect();
                let corners: Vec<Vec<usize>> = free
                    .iter()
                    .map(|_| 0..2)
                    .multi_cartesian_product()
                    .map(|choice| {
                        let mut corner: Vec<usize> = mode.pattern.iter().map(|p| p.unwrap_or(0)).collect();
                        for (&d, &a) in free.iter().zip(&choice) {
                            corner[d] = a;
                        }
                        corner
                    })
                    .collect();
                let corners = if corners.is_empty() {
                    vec![mode.pattern.iter().map(|p| p.unwrap_or(0)).collect()]
                } else {
                    corners
                };
                let grids: Vec<Vec<usize>> = corners.iter().map(|c| grid_of(c)).collect();
                let on_boundary = (0..dim).any(|d| {
                    grids.iter().all(|g| g[d] == 0) || grids.iter().all(|g| g[d] == cells[d])
                });
                let fixed = self.boundary == BoundaryCondition::Dirichlet && on_boundary;

                // Odd modes change sign when the local direction runs against increasing
                // global vertex numbers
                let mut sign = Sign::Positive;
                for &d in &free {
                    let mut start: Vec<usize> = mode.pattern.iter().map(|p| p.unwrap_or(0)).collect();
                    let mut end = start.clone();
                    start[d] = 0;
                    end[d] = 1;
                    let flip = self.vertex_id(&grid_of(&start)) > self.vertex_id(&grid_of(&end));
                    if flip && mode.index[d] % 2 == 1 {
                        sign = sign.flipped();
                    }
                }

                let mut vertices: Vec<usize> = grids.iter().map(|g| self.vertex_id(g)).collect();
                vertices.sort_unstable();
                let key = DofKey {
                    kind: mode.kind,
                    vertices,
                    bubble: mode.bubble_index(),
                };
                let index = *keys.entry(key.clone()).or_insert_with(|| {
                    key_list.push((key, fixed));
                    key_list.len() - 1
                });
                local_keys.push(index);
                local_signs.push(sign);
            }
            element_keys.push(local_keys);
            signs.push(&local_signs);
        }

        // Unknowns in order of first appearance, then the fixed dofs
        let num_solve = key_list.iter().filter(|(_, fixed)| !fixed).count();
        let mut global = vec![0; key_list.len()];
        let (mut next_solve, mut next_fixed) = (0, num_solve);
        for (index, (_, fixed)) in key_list.iter().enumerate() {
            let counter = if *fixed { &mut next_fixed } else { &mut next_solve };
            global[index] = *counter;
            *counter += 1;
        }

        let mut groups = vec![DofGroup::vertex(0); key_list.len()];
        let mut vertices = vec![None; key_list.len()];
        let mut entity_ids: FxHashMap<(DofKind, Vec<usize>), usize> = FxHashMap::default();
        for (index, (key, _)) in key_list.iter().enumerate() {
            let dof = global[index];
            groups[dof] = match key.kind {
                DofKind::Vertex => {
                    vertices[dof] = key.vertices.first().copied();
                    DofGroup::vertex(key.vertices[0])
                }
                kind => {
                    let count = entity_ids.len();
                    let id = *entity_ids.entry((kind, key.vertices.clone())).or_insert(count);
                    DofGroup::new(kind, id)
                }
            };
        }

        let mut dofs = NestedVec::new();
        for local in &element_keys {
            let mut array = dofs.begin_array();
            for &index in local {
                array.push_single(global[index]);
            }
        }
        self.numbering = Numbering {
            dofs,
            signs,
            groups,
            vertices,
            num_solve,
        };
    }
}

impl<T: Real> BoundaryDofSource for TensorMesh<T> {
    fn num_elements(&self) -> usize {
        self.widths.iter().map(Vec::len).product()
    }

    fn num_global_dofs(&self) -> usize {
        self.numbering.groups.len()
    }

    fn num_solve_dofs(&self) -> usize {
        self.numbering.num_solve
    }

    fn element_boundary_count(&self, element_index: usize) -> usize {
        self.numbering.dofs.get(element_index).map_or(0, <[usize]>::len)
    }

    fn populate_boundary_dofs(&self, output: &mut [usize], element_index: usize) {
        if let Some(dofs) = self.numbering.dofs.get(element_index) {
            output.copy_from_slice(dofs);
        }
    }

    fn populate_signs(&self, output: &mut [Sign], element_index: usize) {
        if let Some(signs) = self.numbering.signs.get(element_index) {
            output.copy_from_slice(signs);
        }
    }

    fn dof_group(&self, global_dof: usize) -> DofGroup {
        self.numbering.groups[global_dof]
    }
}

impl<T: Real> LocalOperatorSource<T> for TensorMesh<T> {
    fn element_family(&self, element_index: usize) -> Option<ElementFamily<T>> {
        let key = FamilyKey {
            shape: self.reference.shape(),
            order: self.reference.order(),
            tag: 0,
        };
        if self.is_uniform() {
            Some(ElementFamily { key, scale: T::one() })
        } else if self.dimension() == 1 && self.lambda == T::zero() {
            // The 1D stiffness matrix is (2 / h) times the reference one
            let h = self.widths[0][element_index];
            Some(ElementFamily {
                key,
                scale: (T::one() + T::one()) / h,
            })
        } else {
            None
        }
    }

    fn local_operator(&self, element_index: usize) -> eyre::Result<LocalElementMatrix<T>> {
        let geometry = self.element_geometry(element_index);
        let matrix = self
            .reference
            .helmholtz_matrix(&geometry.lengths, self.lambda)?;
        Ok(self.reference.partition(matrix)?)
    }
}

/// Stokes flow `-Δu + ∇p = f, ∇·u = 0` on a quadrilateral mesh, with `Q_N` velocity and a
/// discontinuous `P_{N-2}` Legendre pressure in every element.
#[derive(Debug, Clone)]
pub struct StokesQuadMesh<T: Real> {
    mesh: QuadMesh<T>,
}

impl<T: Real> StokesQuadMesh<T> {
    pub fn new(mesh: QuadMesh<T>) -> SolverResult<Self> {
        let shape = mesh.reference().shape();
        if shape != ElementShape::Quadrilateral {
            return Err(SolverError::UnsupportedShape {
                shape,
                operation: "Stokes mesh",
            });
        }
        if mesh.reference().order() < 2 {
            return Err(SolverError::configuration(
                "order",
                mesh.reference().order(),
                "Stokes elements require velocity order >= 2",
            ));
        }
        Ok(Self {
            mesh: mesh.with_lambda(T::zero()),
        })
    }

    pub fn unit_square(cells_per_dim: usize, order: usize) -> SolverResult<Self> {
        Self::new(QuadMesh::unit_square(cells_per_dim, order)?)
    }

    pub fn mesh(&self) -> &QuadMesh<T> {
        &self.mesh
    }

    pub fn num_pressure_modes(&self) -> usize {
        self.mesh.reference().num_pressure_modes()
    }

    /// Load vectors of every velocity component of the forcing `f(x) -> [f_x, f_y]`.
    pub fn load_vectors<F>(&self, f: F) -> SolverResult<Vec<ElementVectors<T>>>
    where
        F: Fn(&[T]) -> [T; 2],
    {
        (0..2)
            .map(|k| self.mesh.load_vectors(|x| f(x)[k]))
            .collect()
    }
}

impl<T: Real> BoundaryDofSource for StokesQuadMesh<T> {
    fn num_elements(&self) -> usize {
        self.mesh.num_elements()
    }

    fn num_global_dofs(&self) -> usize {
        self.mesh.num_global_dofs()
    }

    fn num_solve_dofs(&self) -> usize {
        self.mesh.num_solve_dofs()
    }

    fn element_boundary_count(&self, element_index: usize) -> usize {
        self.mesh.element_boundary_count(element_index)
    }

    fn populate_boundary_dofs(&self, output: &mut [usize], element_index: usize) {
        self.mesh.populate_boundary_dofs(output, element_index)
    }

    fn populate_signs(&self, output: &mut [Sign], element_index: usize) {
        self.mesh.populate_signs(output, element_index)
    }

    fn dof_group(&self, global_dof: usize) -> DofGroup {
        self.mesh.dof_group(global_dof)
    }
}

impl<T: Real> LocalOperatorSource<T> for StokesQuadMesh<T> {
    fn element_family(&self, element_index: usize) -> Option<ElementFamily<T>> {
        self.mesh.element_family(element_index)
    }

    fn local_operator(&self, element_index: usize) -> eyre::Result<LocalElementMatrix<T>> {
        self.mesh.local_operator(element_index)
    }
}

impl<T: Real> StokesOperatorSource<T> for StokesQuadMesh<T> {
    fn num_velocity_components(&self) -> usize {
        2
    }

    fn divergence_operator(&self, element_index: usize) -> eyre::Result<DivergenceOperator<T>> {
        let geometry = self.mesh.element_geometry(element_index);
        let blocks = self.mesh.reference().divergence_matrices(&geometry)?;
        Ok(DivergenceOperator { blocks })
    }
}
