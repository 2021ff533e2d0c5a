//! Reference operators of the modified modal basis on tensor-product elements.
//!
//! The one-dimensional basis of order `p` on `[-1, 1]` consists of the two vertex modes
//! `(1 - ξ) / 2` and `(1 + ξ) / 2` and the bubbles `φ_k = (1 - ξ²) / 4 · P_{k-2}^{(1,1)}(ξ)`
//! for `k = 2..=p`. Tensor products of these give the basis on quadrilaterals and hexahedra,
//! ordered vertices first, then edges, faces and the element interior.
use crate::condensation::{condense, CondensedElement};
use crate::element::{DofKind, ElementShape, ModeCounts};
use crate::error::{SolverError, SolverResult};
use crate::partition::{LocalElementMatrix, Symmetry};
use fenris_quadrature::univariate;
use hpsolve_traits::{to_f64, Real};
use itertools::{izip, Itertools};
use nalgebra::{convert, DMatrix, DVector};
use numeric_literals::replace_float_literals;

/// Values and derivatives of the Legendre polynomials `L_0..=L_n` at `x`.
pub fn legendre(n: usize, x: f64) -> (Vec<f64>, Vec<f64>) {
    let mut values = Vec::with_capacity(n + 1);
    let mut derivatives = Vec::with_capacity(n + 1);
    values.push(1.0);
    derivatives.push(0.0);
    if n >= 1 {
        values.push(x);
        derivatives.push(1.0);
    }
    for k in 2..=n {
        let m = k as f64;
        let next = ((2.0 * m - 1.0) * x * values[k - 1] - (m - 1.0) * values[k - 2]) / m;
        // Unlike the closed form, this recurrence is valid at |x| = 1
        let next_derivative = derivatives[k - 2] + (2.0 * m - 1.0) * values[k - 1];
        values.push(next);
        derivatives.push(next_derivative);
    }
    (values, derivatives)
}

/// Gauss-Legendre rule with `n` points on `[-1, 1]`, returned as `(points, weights)` with
/// points in ascending order.
///
/// Exact for polynomials of degree up to `2n - 1`.
pub fn gauss_legendre<T: Real>(n: usize) -> (Vec<T>, Vec<T>) {
    let (weights, points) = univariate::gauss(n);
    points
        .into_iter()
        .map(|[x]| x)
        .zip(weights)
        .sorted_by(|(x1, _), (x2, _)| x1.total_cmp(x2))
        .map(|(x, w)| (convert::<f64, T>(x), convert::<f64, T>(w)))
        .unzip()
}

/// Values and derivatives of the one-dimensional modal basis of order `order` at `xi`.
#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
pub fn modal_basis<T: Real>(order: usize, xi: T) -> (Vec<T>, Vec<T>) {
    let (l, _) = legendre(order.saturating_sub(1), to_f64(xi));
    let l: Vec<T> = l.into_iter().map(convert).collect();
    let mut values = vec![(1.0 - xi) / 2.0, (1.0 + xi) / 2.0];
    let mut derivatives = vec![-0.5, 0.5];
    for k in 2..=order {
        let kf: T = convert(k as f64);
        values.push((kf - 1.0) * (l[k - 2] - xi * l[k - 1]) / (2.0 * kf));
        derivatives.push(-(kf - 1.0) / 2.0 * l[k - 1]);
    }
    (values, derivatives)
}

/// Reference mass and stiffness matrices of the one-dimensional basis, indexed by mode
/// number `0..=order`.
#[derive(Debug, Clone)]
struct LineMatrices<T: Real> {
    mass: DMatrix<T>,
    stiffness: DMatrix<T>,
}

impl<T: Real> LineMatrices<T> {
    fn new(order: usize) -> Self {
        let n = order + 1;
        let mut mass = DMatrix::zeros(n, n);
        let mut stiffness = DMatrix::zeros(n, n);
        let (points, weights) = gauss_legendre::<T>(order + 2);
        for (&xi, &w) in points.iter().zip(&weights) {
            let (phi, dphi) = modal_basis(order, xi);
            for i in 0..n {
                for j in 0..n {
                    mass[(i, j)] += w * phi[i] * phi[j];
                    stiffness[(i, j)] += w * dphi[i] * dphi[j];
                }
            }
        }
        Self { mass, stiffness }
    }
}

/// One local mode of a tensor-product element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMode {
    pub kind: DofKind,
    /// Index of the vertex, edge or face among the element's entities of that kind.
    pub entity: usize,
    /// Per axis, `Some(0 | 1)` if the entity lies on the lower or upper side, `None` if the
    /// entity extends along the axis.
    pub pattern: Vec<Option<usize>>,
    /// One-dimensional mode number per axis.
    pub index: Vec<usize>,
}

impl LocalMode {
    /// Bubble numbers along the free axes of the entity.
    pub fn bubble_index(&self) -> Vec<usize> {
        self.pattern
            .iter()
            .zip(&self.index)
            .filter(|(fixed, _)| fixed.is_none())
            .map(|(_, &k)| k)
            .collect()
    }
}

const F: Option<usize> = None;
const L: Option<usize> = Some(0);
const U: Option<usize> = Some(1);

fn entity_patterns(shape: ElementShape) -> SolverResult<Vec<(DofKind, Vec<Vec<Option<usize>>>)>> {
    let owned = |patterns: &[&[Option<usize>]]| patterns.iter().map(|p| p.to_vec()).collect_vec();
    let patterns = match shape {
        ElementShape::Segment => vec![
            (DofKind::Vertex, owned(&[&[L], &[U]])),
            (DofKind::Element, owned(&[&[F]])),
        ],
        ElementShape::Quadrilateral => vec![
            (DofKind::Vertex, owned(&[&[L, L], &[U, L], &[U, U], &[L, U]])),
            (DofKind::Edge, owned(&[&[F, L], &[U, F], &[F, U], &[L, F]])),
            (DofKind::Element, owned(&[&[F, F]])),
        ],
        ElementShape::Hexahedron => vec![
            (
                DofKind::Vertex,
                owned(&[
                    &[L, L, L],
                    &[U, L, L],
                    &[U, U, L],
                    &[L, U, L],
                    &[L, L, U],
                    &[U, L, U],
                    &[U, U, U],
                    &[L, U, U],
                ]),
            ),
            (
                DofKind::Edge,
                owned(&[
                    // Bottom
                    &[F, L, L],
                    &[U, F, L],
                    &[F, U, L],
                    &[L, F, L],
                    // Vertical
                    &[L, L, F],
                    &[U, L, F],
                    &[U, U, F],
                    &[L, U, F],
                    // Top
                    &[F, L, U],
                    &[U, F, U],
                    &[F, U, U],
                    &[L, F, U],
                ]),
            ),
            (
                DofKind::Face,
                owned(&[
                    &[F, F, L],
                    &[F, L, F],
                    &[U, F, F],
                    &[F, U, F],
                    &[L, F, F],
                    &[F, F, U],
                ]),
            ),
            (DofKind::Element, owned(&[&[F, F, F]])),
        ],
        _ => {
            return Err(SolverError::UnsupportedShape {
                shape,
                operation: "reference element",
            })
        }
    };
    Ok(patterns)
}

/// The reference element of a tensor-product shape with the modified modal basis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceElement {
    shape: ElementShape,
    order: usize,
    modes: Vec<LocalMode>,
    counts: ModeCounts,
}

impl ReferenceElement {
    pub fn new(shape: ElementShape, order: usize) -> SolverResult<Self> {
        let counts = shape.mode_counts(order)?;
        let patterns = entity_patterns(shape)?;

        let mut modes = Vec::with_capacity(counts.total());
        for (kind, entities) in patterns {
            for (entity, pattern) in entities.into_iter().enumerate() {
                let free: Vec<usize> = (0..pattern.len()).filter(|&d| pattern[d].is_none()).collect();
                // First free axis runs fastest, so iterate the free axes in reverse order
                let bubbles = free.iter().rev().map(|_| 2..=order).multi_cartesian_product();
                let mut push = |bubble: &[usize]| {
                    let mut index: Vec<usize> = pattern.iter().map(|fixed| fixed.unwrap_or(0)).collect();
                    for (&axis, &k) in free.iter().rev().zip(bubble) {
                        index[axis] = k;
                    }
                    modes.push(LocalMode {
                        kind,
                        entity,
                        pattern: pattern.clone(),
                        index,
                    });
                };
                if free.is_empty() {
                    push(&[]);
                } else {
                    for bubble in bubbles {
                        push(&bubble);
                    }
                }
            }
        }
        debug_assert_eq!(modes.len(), counts.total());
        Ok(Self {
            shape,
            order,
            modes,
            counts,
        })
    }

    pub fn shape(&self) -> ElementShape {
        self.shape
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn dimension(&self) -> usize {
        self.shape.dimension()
    }

    pub fn mode_counts(&self) -> ModeCounts {
        self.counts
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn num_boundary_modes(&self) -> usize {
        self.counts.boundary()
    }

    /// Local modes in boundary-first order.
    pub fn modes(&self) -> &[LocalMode] {
        &self.modes
    }

    fn check_lengths<T: Real>(&self, lengths: &[T]) -> SolverResult<()> {
        SolverError::check_dimension("element lengths", None, self.dimension(), lengths.len())
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    fn tensor_matrix<T: Real>(&self, lengths: &[T], stiffness_axis: Option<usize>) -> DMatrix<T> {
        let line = LineMatrices::<T>::new(self.order);
        let n = self.num_modes();
        DMatrix::from_fn(n, n, |i, j| {
            let (a, b) = (&self.modes[i].index, &self.modes[j].index);
            (0..self.dimension())
                .map(|d| {
                    if stiffness_axis == Some(d) {
                        line.stiffness[(a[d], b[d])] * 2.0 / lengths[d]
                    } else {
                        line.mass[(a[d], b[d])] * lengths[d] / 2.0
                    }
                })
                .fold(1.0, |acc, factor| acc * factor)
        })
    }

    /// Mass matrix of an axis-aligned element with the given edge lengths.
    pub fn mass_matrix<T: Real>(&self, lengths: &[T]) -> SolverResult<DMatrix<T>> {
        self.check_lengths(lengths)?;
        Ok(self.tensor_matrix(lengths, None))
    }

    /// Stiffness matrix `∫ ∇φ_i · ∇φ_j`.
    pub fn laplacian_matrix<T: Real>(&self, lengths: &[T]) -> SolverResult<DMatrix<T>> {
        self.check_lengths(lengths)?;
        let n = self.num_modes();
        let mut matrix = DMatrix::zeros(n, n);
        for axis in 0..self.dimension() {
            matrix += self.tensor_matrix(lengths, Some(axis));
        }
        Ok(matrix)
    }

    /// `∫ ∇φ_i · ∇φ_j + λ φ_i φ_j`.
    pub fn helmholtz_matrix<T: Real>(&self, lengths: &[T], lambda: T) -> SolverResult<DMatrix<T>> {
        let mut matrix = self.laplacian_matrix(lengths)?;
        if lambda != T::zero() {
            matrix += self.mass_matrix(lengths)? * lambda;
        }
        Ok(matrix)
    }

    /// Wraps a symmetric matrix in this element's mode ordering as a partitioned operator.
    pub fn partition<T: Real>(&self, matrix: DMatrix<T>) -> SolverResult<LocalElementMatrix<T>> {
        SolverError::check_dimension("reference element matrix", None, self.num_modes(), matrix.nrows())?;
        LocalElementMatrix::new(matrix, self.num_boundary_modes(), Symmetry::Symmetric)
    }

    pub fn condense<T: Real>(&self, matrix: DMatrix<T>) -> SolverResult<CondensedElement<T>> {
        condense(&self.partition(matrix)?)
    }

    /// Load vector `∫ f φ_i` over the element, using Gauss quadrature with `order + 4` points
    /// per axis.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn load_vector<T, F>(&self, geometry: &ElementGeometry<T>, f: F) -> SolverResult<DVector<T>>
    where
        T: Real,
        F: Fn(&[T]) -> T,
    {
        geometry.check(self.dimension())?;
        let dim = self.dimension();
        let (points, weights) = gauss_legendre::<T>(self.order + 4);
        let line: Vec<_> = points.iter().map(|&xi| modal_basis(self.order, xi).0).collect();

        let mut load = DVector::zeros(self.num_modes());
        let jacobian = geometry.lengths.iter().fold(1.0, |acc, &h| acc * h / 2.0);
        for q in (0..dim).map(|_| 0..points.len()).multi_cartesian_product() {
            let x: Vec<T> = q.iter().enumerate().map(|(d, &qd)| geometry.map(d, points[qd])).collect();
            let weight = q.iter().fold(jacobian, |acc, &qd| acc * weights[qd]);
            let value = f(&x) * weight;
            for (i, mode) in self.modes.iter().enumerate() {
                let phi = izip!(&q, &mode.index).fold(1.0, |acc, (&qd, &k)| acc * line[qd][k]);
                load[i] += value * phi;
            }
        }
        Ok(load)
    }

    /// L2 projection of `f` onto the element basis.
    pub fn project<T, F>(&self, geometry: &ElementGeometry<T>, f: F) -> SolverResult<DVector<T>>
    where
        T: Real,
        F: Fn(&[T]) -> T,
    {
        let load = self.load_vector(geometry, f)?;
        let mass = self.mass_matrix(&geometry.lengths)?;
        let dim = mass.nrows();
        let cholesky = mass.cholesky().ok_or_else(|| SolverError::SingularBlock {
            context: "reference mass matrix".to_string(),
            dim,
        })?;
        Ok(cholesky.solve(&load))
    }

    /// Number of Legendre pressure modes `L_a(ξ) L_b(η)..` with degrees up to `order - 2`.
    pub fn num_pressure_modes(&self) -> usize {
        (self.order - 1).pow(self.dimension() as u32)
    }

    /// Pressure-velocity blocks `D_k = -∫ q ∂_k φ` for every axis `k`.
    ///
    /// Pressure mode `a + b (p - 1) + c (p - 1)²` is `L_a(ξ) L_b(η) L_c(ζ)`, in the element's
    /// local coordinates.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn divergence_matrices<T: Real>(&self, geometry: &ElementGeometry<T>) -> SolverResult<Vec<DMatrix<T>>> {
        let dim = self.dimension();
        geometry.check(dim)?;
        let p = self.order;
        if p < 2 {
            return Err(SolverError::configuration(
                "order",
                p,
                "pressure modes require velocity order >= 2",
            ));
        }
        let nq = p - 1;

        // gradient[(a, i)] = ∫ L_a φ_i', value[(a, i)] = ∫ L_a φ_i
        let mut gradient = DMatrix::<T>::zeros(nq, p + 1);
        let mut value = DMatrix::<T>::zeros(nq, p + 1);
        let (points, weights) = gauss_legendre::<T>(p + 2);
        for (&xi, &w) in points.iter().zip(&weights) {
            let (phi, dphi) = modal_basis(p, xi);
            let (l, _) = legendre(nq - 1, to_f64(xi));
            for a in 0..nq {
                let la: T = convert(l[a]);
                for i in 0..=p {
                    gradient[(a, i)] += w * la * dphi[i];
                    value[(a, i)] += w * la * phi[i];
                }
            }
        }

        let pressure_modes: Vec<Vec<usize>> = (0..dim)
            .map(|_| 0..nq)
            .multi_cartesian_product()
            .map(|mut q| {
                q.reverse();
                q
            })
            .collect();
        debug_assert_eq!(pressure_modes.len(), self.num_pressure_modes());

        let blocks = (0..dim)
            .map(|k| {
                let sign = if geometry.reversed[k] { 1.0 } else { -1.0 };
                DMatrix::from_fn(pressure_modes.len(), self.num_modes(), |row, col| {
                    let q = &pressure_modes[row];
                    let a = &self.modes[col].index;
                    (0..dim).fold(sign, |acc, d| {
                        if d == k {
                            acc * gradient[(q[d], a[d])]
                        } else {
                            acc * value[(q[d], a[d])] * geometry.lengths[d] / 2.0
                        }
                    })
                })
            })
            .collect();
        Ok(blocks)
    }
}

/// Placement of an axis-aligned element in physical space.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementGeometry<T> {
    /// Corner with the smallest coordinates.
    pub origin: Vec<T>,
    pub lengths: Vec<T>,
    /// Axes along which the local coordinate runs against the physical one.
    pub reversed: Vec<bool>,
}

impl<T: Real> ElementGeometry<T> {
    pub fn new(origin: Vec<T>, lengths: Vec<T>) -> Self {
        let reversed = vec![false; lengths.len()];
        Self {
            origin,
            lengths,
            reversed,
        }
    }

    pub fn with_reversed(self, reversed: Vec<bool>) -> Self {
        Self { reversed, ..self }
    }

    fn check(&self, dim: usize) -> SolverResult<()> {
        SolverError::check_dimension("element origin", None, dim, self.origin.len())?;
        SolverError::check_dimension("element lengths", None, dim, self.lengths.len())?;
        SolverError::check_dimension("element orientation", None, dim, self.reversed.len())
    }

    /// Physical coordinate along `axis` of the local coordinate `xi`.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn map(&self, axis: usize, xi: T) -> T {
        let t = if self.reversed[axis] { (1.0 - xi) / 2.0 } else { (1.0 + xi) / 2.0 };
        self.origin[axis] + t * self.lengths[axis]
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn center(&self) -> Vec<T> {
        izip!(&self.origin, &self.lengths).map(|(&o, &h)| o + h / 2.0).collect()
    }
}
