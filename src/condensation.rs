//! Static condensation of element interiors.
//!
//! For an element operator partitioned as `[A B; D C]`, the condensed boundary operator is
//! `Ā = A - B C⁻¹ D`. Elements of one family share a single factorization of the family
//! operator; an element with scale `s` has `Ā_e = s Ā_f`, while `B_e C_e⁻¹` and `C_e⁻¹ D_e` are
//! independent of the scale.
use crate::error::{SolverError, SolverResult};
use crate::partition::{LocalElementMatrix, Symmetry};
use crate::source::{FamilyKey, LocalOperatorSource};
use hpsolve_traits::Real;
use log::info;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn, LU};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

/// Factorization of an interior block.
#[derive(Debug, Clone)]
pub enum InteriorFactor<T: Real> {
    /// The element has no interior modes.
    Empty,
    Cholesky(Cholesky<T, Dyn>),
    Lu(LU<T, Dyn, Dyn>),
}

impl<T: Real> InteriorFactor<T> {
    pub fn factor(c: DMatrix<T>, symmetry: Symmetry, context: impl FnOnce() -> String) -> SolverResult<Self> {
        let dim = c.nrows();
        if dim == 0 {
            return Ok(Self::Empty);
        }
        match symmetry {
            Symmetry::Symmetric => Cholesky::new(c)
                .map(Self::Cholesky)
                .ok_or_else(|| SolverError::SingularBlock {
                    context: context(),
                    dim,
                }),
            Symmetry::NonSymmetric => {
                let lu = c.lu();
                if lu.is_invertible() {
                    Ok(Self::Lu(lu))
                } else {
                    Err(SolverError::SingularBlock {
                        context: context(),
                        dim,
                    })
                }
            }
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Cholesky(chol) => chol.l_dirty().nrows(),
            Self::Lu(lu) => lu.l().nrows(),
        }
    }

    /// Computes `C⁻¹ rhs` by triangular solves.
    pub fn solve(&self, rhs: &DMatrix<T>) -> SolverResult<DMatrix<T>> {
        match self {
            Self::Empty => Ok(rhs.clone()),
            Self::Cholesky(chol) => Ok(chol.solve(rhs)),
            Self::Lu(lu) => lu.solve(rhs).ok_or_else(|| SolverError::SingularBlock {
                context: "interior block".to_string(),
                dim: rhs.nrows(),
            }),
        }
    }

    pub fn solve_vector(&self, rhs: &DVector<T>) -> SolverResult<DVector<T>> {
        match self {
            Self::Empty => Ok(rhs.clone()),
            Self::Cholesky(chol) => Ok(chol.solve(rhs)),
            Self::Lu(lu) => lu.solve(rhs).ok_or_else(|| SolverError::SingularBlock {
                context: "interior block".to_string(),
                dim: rhs.nrows(),
            }),
        }
    }
}

/// Condensed form of a single (unscaled) element operator.
#[derive(Debug, Clone)]
pub struct CondensedElement<T: Real> {
    symmetry: Symmetry,
    /// `Ā = A - B C⁻¹ D`
    schur: DMatrix<T>,
    interior: InteriorFactor<T>,
    /// `B`
    coupling: DMatrix<T>,
    /// `C⁻¹ D`
    interior_coupling: DMatrix<T>,
}

/// Condenses the interior of a local element matrix.
#[allow(non_snake_case)]
pub fn condense<T: Real>(local: &LocalElementMatrix<T>) -> SolverResult<CondensedElement<T>> {
    let symmetry = local.symmetry();
    let ni = local.num_interior();
    let interior = InteriorFactor::factor(local.c().into_owned(), symmetry, || {
        format!("interior block ({} interior modes)", ni)
    })?;
    let B = local.b().into_owned();
    let C_inv_D = interior.solve(&local.d().into_owned())?;
    let mut schur = local.a().into_owned();
    if ni > 0 {
        schur.gemm(-T::one(), &B, &C_inv_D, T::one());
    }
    if symmetry == Symmetry::Symmetric {
        symmetrize_mut(&mut schur);
    }
    Ok(CondensedElement {
        symmetry,
        schur,
        interior,
        coupling: B,
        interior_coupling: C_inv_D,
    })
}

/// Replaces `m` by `(m + mᵀ) / 2`.
pub(crate) fn symmetrize_mut<T: Real>(m: &mut DMatrix<T>) {
    let half = T::one() / (T::one() + T::one());
    let n = m.nrows();
    for j in 0..n {
        for i in 0..j {
            let avg = (m[(i, j)] + m[(j, i)]) * half;
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

impl<T: Real> CondensedElement<T> {
    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn num_boundary(&self) -> usize {
        self.schur.nrows()
    }

    pub fn num_interior(&self) -> usize {
        self.interior_coupling.nrows()
    }

    /// The condensed boundary matrix `Ā`.
    pub fn schur(&self) -> &DMatrix<T> {
        &self.schur
    }

    pub fn interior_factor(&self) -> &InteriorFactor<T> {
        &self.interior
    }

    pub fn coupling(&self) -> &DMatrix<T> {
        &self.coupling
    }

    /// `C⁻¹ D`, used for interior back-substitution.
    pub fn interior_coupling(&self) -> &DMatrix<T> {
        &self.interior_coupling
    }

    /// Condensed boundary right-hand side `f_b - B C⁻¹ f_i` for an element of scale `s`.
    ///
    /// Independent of the scale, since `B_e C_e⁻¹ = B_f C_f⁻¹`.
    pub fn condense_rhs(&self, rhs: &[T]) -> SolverResult<DVector<T>> {
        let nb = self.num_boundary();
        let ni = self.num_interior();
        SolverError::check_dimension("element right-hand side", None, nb + ni, rhs.len())?;
        let mut f_b = DVector::from_column_slice(&rhs[..nb]);
        if ni > 0 {
            let f_i = DVector::from_column_slice(&rhs[nb..]);
            let y = self.interior.solve_vector(&f_i)?;
            f_b.gemv(-T::one(), &self.coupling, &y, T::one());
        }
        Ok(f_b)
    }

    /// Interior solution `u_i = (1/s) C⁻¹ f_i - C⁻¹ D u_b` for an element of scale `s`.
    pub fn back_substitute(&self, scale: T, rhs: &[T], boundary: &DVector<T>) -> SolverResult<DVector<T>> {
        let nb = self.num_boundary();
        let ni = self.num_interior();
        SolverError::check_dimension("element right-hand side", None, nb + ni, rhs.len())?;
        SolverError::check_dimension("element boundary solution", None, nb, boundary.len())?;
        if ni == 0 {
            return Ok(DVector::zeros(0));
        }
        let f_i = DVector::from_column_slice(&rhs[nb..]);
        let mut u_i = self.interior.solve_vector(&f_i)?;
        u_i /= scale;
        u_i.gemv(-T::one(), &self.interior_coupling, boundary, T::one());
        Ok(u_i)
    }
}

/// The condensed operators of all elements, shared across families.
#[derive(Debug, Clone)]
pub struct CondensedOperator<T: Real> {
    families: Vec<CondensedElement<T>>,
    family_keys: Vec<Option<FamilyKey>>,
    element_family: Vec<usize>,
    element_scale: Vec<T>,
    symmetry: Symmetry,
}

impl<T: Real> CondensedOperator<T> {
    /// Condenses every family of the source.
    ///
    /// Local operators of family representatives are requested sequentially, after which the
    /// factorizations run in parallel.
    pub fn build<S>(source: &S) -> SolverResult<Self>
    where
        S: ?Sized + LocalOperatorSource<T>,
    {
        let num_elements = source.num_elements();
        let mut family_index: FxHashMap<FamilyKey, usize> = FxHashMap::default();
        let mut family_keys = Vec::new();
        let mut element_family = Vec::with_capacity(num_elements);
        let mut element_scale = Vec::with_capacity(num_elements);
        let mut representatives = Vec::new();

        for e in 0..num_elements {
            let membership = source.element_family(e);
            let scale = membership.as_ref().map(|m| m.scale).unwrap_or_else(T::one);
            // Back-substitution divides by the scale of every element, cached family or not
            if !(scale > T::zero()) {
                return Err(SolverError::configuration(
                    "family scale",
                    hpsolve_traits::to_f64(scale),
                    format!("element {} has a non-positive family scale", e),
                ));
            }
            let existing = membership
                .as_ref()
                .and_then(|m| family_index.get(&m.key).copied());
            match existing {
                Some(index) => {
                    element_family.push(index);
                    element_scale.push(scale);
                }
                None => {
                    let mut local = source.local_operator(e)?;
                    local.scale_mut(T::one() / scale);
                    let index = family_keys.len();
                    if let Some(m) = &membership {
                        family_index.insert(m.key, index);
                    }
                    family_keys.push(membership.map(|m| m.key));
                    element_family.push(index);
                    element_scale.push(scale);
                    representatives.push(local);
                }
            }
        }

        let symmetry = if representatives
            .iter()
            .all(|local| local.symmetry() == Symmetry::Symmetric)
        {
            Symmetry::Symmetric
        } else {
            Symmetry::NonSymmetric
        };

        let families = representatives
            .into_par_iter()
            .enumerate()
            .map(|(index, local)| {
                condense(&local).map_err(|err| match err {
                    SolverError::SingularBlock { context, dim } => SolverError::SingularBlock {
                        context: format!("{} of family {}", context, index),
                        dim,
                    },
                    other => other,
                })
            })
            .collect::<SolverResult<Vec<_>>>()?;

        info!(
            "Condensed {} elements in {} families ({:?})",
            num_elements,
            families.len(),
            symmetry
        );

        Ok(Self {
            families,
            family_keys,
            element_family,
            element_scale,
            symmetry,
        })
    }

    pub fn num_elements(&self) -> usize {
        self.element_family.len()
    }

    pub fn num_families(&self) -> usize {
        self.families.len()
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn family(&self, index: usize) -> &CondensedElement<T> {
        &self.families[index]
    }

    pub fn family_key(&self, index: usize) -> Option<FamilyKey> {
        self.family_keys[index]
    }

    pub fn element_family(&self, element: usize) -> usize {
        self.element_family[element]
    }

    pub fn element_scale(&self, element: usize) -> T {
        self.element_scale[element]
    }

    /// The condensed operator of the element's family together with the element scale.
    pub fn element(&self, element: usize) -> (&CondensedElement<T>, T) {
        (
            &self.families[self.element_family[element]],
            self.element_scale[element],
        )
    }

    /// The scaled condensed matrix `s Ā_f` of an element.
    pub fn element_schur(&self, element: usize) -> DMatrix<T> {
        let (family, scale) = self.element(element);
        family.schur() * scale
    }

    /// `y = s Ā_f x` for a local boundary vector.
    pub fn apply_element(&self, element: usize, x: &DVector<T>, y: &mut DVector<T>) {
        let (family, scale) = self.element(element);
        y.gemv(scale, family.schur(), x, T::zero());
    }
}
