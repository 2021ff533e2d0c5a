//! Local-to-global maps of boundary modes, sign changes and scatter/gather.
use crate::comm::Communicator;
use crate::element::DofGroup;
use crate::error::{SolverError, SolverResult};
use crate::source::BoundaryDofSource;
use fenris_nested_vec::NestedVec;
use hpsolve_traits::Real;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Element-local vectors (boundary modes first, then interior modes), one array per element.
pub type ElementVectors<T> = NestedVec<T>;

/// Orientation of a local boundary mode relative to the global mode it maps to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sign {
    #[default]
    Positive,
    Negative,
}

impl Sign {
    pub fn from_flip(flip: bool) -> Self {
        if flip {
            Self::Negative
        } else {
            Self::Positive
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Positive => Self::Negative,
            Self::Negative => Self::Positive,
        }
    }

    pub fn is_negative(self) -> bool {
        self == Self::Negative
    }

    #[inline]
    pub fn apply<T: Real>(self, value: T) -> T {
        match self {
            Self::Positive => value,
            Self::Negative => -value,
        }
    }
}

impl Mul for Sign {
    type Output = Sign;

    fn mul(self, rhs: Sign) -> Sign {
        Sign::from_flip(self != rhs)
    }
}

/// Multiplies local boundary coefficients by their sign changes. The operation is an involution.
pub fn apply_sign_change<T: Real>(signs: &[Sign], values: &mut [T]) {
    assert_eq!(signs.len(), values.len());
    for (value, sign) in values.iter_mut().zip(signs) {
        *value = sign.apply(*value);
    }
}

/// Per-element boundary maps and sign changes for one boundary system.
#[derive(Debug, Clone)]
pub struct BoundaryMap {
    dofs: NestedVec<usize>,
    signs: NestedVec<Sign>,
    num_global: usize,
    num_solve: usize,
    groups: Vec<DofGroup>,
    multiplicity: Vec<usize>,
    // (element, local index) pairs touching each global dof
    adjacency: NestedVec<(usize, usize)>,
}

impl BoundaryMap {
    pub fn from_source<S>(source: &S) -> SolverResult<Self>
    where
        S: ?Sized + BoundaryDofSource,
    {
        Self::collect(source, |_| {})
    }

    /// Like [`from_source`](Self::from_source) for a source holding this process' elements only.
    ///
    /// A global dof only needs to appear in the boundary map of one element on some process.
    pub fn from_source_with_communicator<S, T>(source: &S, comm: &dyn Communicator<T>) -> SolverResult<Self>
    where
        S: ?Sized + BoundaryDofSource,
    {
        Self::collect(source, |used| comm.reduce_max(used))
    }

    fn collect<S>(source: &S, merge_usage: impl FnOnce(&mut [usize])) -> SolverResult<Self>
    where
        S: ?Sized + BoundaryDofSource,
    {
        let num_elements = source.num_elements();
        let mut dofs = NestedVec::new();
        let mut signs = NestedVec::new();
        let mut dof_buffer = Vec::new();
        let mut sign_buffer = Vec::new();
        for e in 0..num_elements {
            let count = source.element_boundary_count(e);
            dof_buffer.resize(count, usize::MAX);
            sign_buffer.resize(count, Sign::Positive);
            source.populate_boundary_dofs(&mut dof_buffer, e);
            source.populate_signs(&mut sign_buffer, e);
            dofs.push(&dof_buffer);
            signs.push(&sign_buffer);
        }
        let num_global = source.num_global_dofs();
        let groups = (0..num_global).map(|g| source.dof_group(g)).collect();
        Self::assemble(dofs, signs, num_global, source.num_solve_dofs(), groups, merge_usage)
    }

    /// Validates and assembles a boundary map from explicit per-element data.
    pub fn from_parts(
        dofs: NestedVec<usize>,
        signs: NestedVec<Sign>,
        num_global: usize,
        num_solve: usize,
        groups: Vec<DofGroup>,
    ) -> SolverResult<Self> {
        Self::assemble(dofs, signs, num_global, num_solve, groups, |_| {})
    }

    fn assemble(
        dofs: NestedVec<usize>,
        signs: NestedVec<Sign>,
        num_global: usize,
        num_solve: usize,
        groups: Vec<DofGroup>,
        merge_usage: impl FnOnce(&mut [usize]),
    ) -> SolverResult<Self> {
        SolverError::check_dimension("sign change arrays", None, dofs.len(), signs.len())?;
        SolverError::check_dimension("dof groups", None, num_global, groups.len())?;
        if num_solve > num_global {
            return Err(SolverError::dimension("solve dofs", None, num_global, num_solve));
        }

        let mut multiplicity = vec![0; num_global];
        for (e, (element_dofs, element_signs)) in dofs.iter().zip(signs.iter()).enumerate() {
            SolverError::check_dimension("sign change", Some(e), element_dofs.len(), element_signs.len())?;
            for &g in element_dofs {
                if g >= num_global {
                    return Err(SolverError::dimension("boundary map index", Some(e), num_global, g));
                }
                multiplicity[g] += 1;
            }
        }
        let mut used: Vec<usize> = multiplicity.iter().map(|&m| usize::from(m > 0)).collect();
        merge_usage(&mut used);
        if let Some(unused) = used.iter().position(|&u| u == 0) {
            return Err(SolverError::configuration(
                "boundary map",
                unused,
                "global dof does not appear in any element boundary map",
            ));
        }

        let mut adjacency_lists = vec![Vec::new(); num_global];
        for (e, element_dofs) in dofs.iter().enumerate() {
            for (local, &g) in element_dofs.iter().enumerate() {
                adjacency_lists[g].push((e, local));
            }
        }

        Ok(Self {
            dofs,
            signs,
            num_global,
            num_solve,
            groups,
            multiplicity,
            adjacency: NestedVec::from(adjacency_lists),
        })
    }

    pub fn num_elements(&self) -> usize {
        self.dofs.len()
    }

    pub fn num_global_dofs(&self) -> usize {
        self.num_global
    }

    pub fn num_solve_dofs(&self) -> usize {
        self.num_solve
    }

    pub fn element_dofs(&self, element: usize) -> &[usize] {
        self.dofs.get(element).unwrap_or(&[])
    }

    pub fn element_signs(&self, element: usize) -> &[Sign] {
        self.signs.get(element).unwrap_or(&[])
    }

    pub fn element_boundary_count(&self, element: usize) -> usize {
        self.element_dofs(element).len()
    }

    pub fn dof_group(&self, dof: usize) -> DofGroup {
        self.groups[dof]
    }

    /// Number of element boundary slots mapping to the dof.
    pub fn multiplicity(&self, dof: usize) -> usize {
        self.multiplicity[dof]
    }

    /// The `(element, local index)` pairs mapping to the dof.
    pub fn dof_elements(&self, dof: usize) -> &[(usize, usize)] {
        self.adjacency.get(dof).unwrap_or(&[])
    }

    pub fn is_solve_dof(&self, dof: usize) -> bool {
        dof < self.num_solve
    }

    pub fn apply_sign_change<T: Real>(&self, element: usize, values: &mut [T]) {
        apply_sign_change(self.element_signs(element), values);
    }

    /// Adds the signed local values of an element into a global vector.
    pub fn gather_element_into<T: Real>(&self, element: usize, local: &[T], global: &mut [T]) {
        let dofs = self.element_dofs(element);
        let signs = self.element_signs(element);
        assert_eq!(local.len(), dofs.len());
        for ((&g, &sign), &value) in dofs.iter().zip(signs).zip(local) {
            if g < global.len() {
                global[g] += sign.apply(value);
            }
        }
    }

    /// Reads the element's local values from a global vector and applies the sign change.
    ///
    /// Entries beyond the end of `global` read as zero, so a vector of length `nsolve`
    /// scatters with zero fixed values.
    pub fn scatter_element<T: Real>(&self, element: usize, global: &[T], local: &mut [T]) {
        let dofs = self.element_dofs(element);
        let signs = self.element_signs(element);
        assert_eq!(local.len(), dofs.len());
        for ((&g, &sign), value) in dofs.iter().zip(signs).zip(local.iter_mut()) {
            *value = sign.apply(global.get(g).copied().unwrap_or_else(T::zero));
        }
    }

    /// Sums signed element values into a global vector of length `nglobal`.
    ///
    /// Contributions are merged across processes, and entries of fixed dofs are zeroed.
    pub fn gather<T, C>(&self, local: &ElementVectors<T>, comm: &C) -> SolverResult<DVector<T>>
    where
        T: Real,
        C: ?Sized + Communicator<T>,
    {
        SolverError::check_dimension("element vectors", None, self.num_elements(), local.len())?;
        let mut global = DVector::zeros(self.num_global);
        for (e, values) in local.iter().enumerate() {
            SolverError::check_dimension("element vector", Some(e), self.element_boundary_count(e), values.len())?;
            self.gather_element_into(e, values, global.as_mut_slice());
        }
        comm.reduce_sum(global.as_mut_slice());
        global.rows_mut(self.num_solve, self.num_global - self.num_solve).fill(T::zero());
        Ok(global)
    }

    /// Reads every element's local values from a global vector.
    pub fn scatter<T: Real>(&self, global: &[T]) -> ElementVectors<T> {
        let mut local = NestedVec::new();
        let mut values = Vec::new();
        for e in 0..self.num_elements() {
            values.clear();
            values.resize(self.element_boundary_count(e), T::zero());
            self.scatter_element(e, global, &mut values);
            local.push(&values);
        }
        local
    }

    /// Largest distance between two solve dofs of the same element.
    pub fn bandwidth(&self) -> usize {
        self.dofs
            .iter()
            .map(|element_dofs| {
                let mut solve = element_dofs.iter().filter(|&&g| g < self.num_solve);
                let first = solve.next().copied();
                let (min, max) = solve.fold((first, first), |(min, max), &g| {
                    (min.map(|m| m.min(g)), max.map(|m| m.max(g)))
                });
                match (min, max) {
                    (Some(min), Some(max)) => max - min,
                    _ => 0,
                }
            })
            .max()
            .unwrap_or(0)
    }

    /// Solve dofs of an element, as `(local index, global index)` pairs.
    pub fn element_solve_dofs(&self, element: usize) -> impl '_ + Iterator<Item = (usize, usize)> {
        self.element_dofs(element)
            .iter()
            .copied()
            .enumerate()
            .filter(move |&(_, g)| g < self.num_solve)
    }
}
