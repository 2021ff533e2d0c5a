//! Recursive condensation of the boundary system over patches of elements.
//!
//! On every level, patches play the role of elements: dofs that belong to a single patch are
//! eliminated by static condensation, and the condensed patch matrices on the dofs shared by
//! two or more patches form the system of the next level.
use crate::boundary_map::BoundaryMap;
use crate::comm::Communicator;
use crate::condensation::CondensedOperator;
use crate::direct::DirectSolver;
use crate::error::{SolverError, SolverResult};
use crate::preconditioner::DiagonalPreconditioner;
use crate::settings::{RecursionSettings, SolverSettings, TopLevelSolve};
use crate::storage::{StorageLayout, SymmetricStorage, UpperStorage};
use crate::system::conjugate_gradient;
use hpsolve_sparse::cg::{CgWorkspace, NullSpaceProjection};
use hpsolve_traits::Real;
use log::info;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;
use std::collections::BTreeSet;

/// A dense symmetric matrix on a subset of the dofs of one level.
#[derive(Debug, Clone)]
struct LevelElement<T: Real> {
    dofs: Vec<usize>,
    matrix: DMatrix<T>,
}

#[derive(Debug, Clone)]
struct Patch<T: Real> {
    /// Shared dofs, numbered on the current level.
    boundary: Vec<usize>,
    /// Numbers of the shared dofs on the next level.
    next: Vec<usize>,
    interior: Vec<usize>,
    interior_factor: Option<Cholesky<T, Dyn>>,
    /// `B`, coupling of boundary to interior dofs.
    coupling: DMatrix<T>,
}

impl<T: Real> Patch<T> {
    /// `C⁻¹ v`
    fn solve_interior(&self, v: DVector<T>) -> DVector<T> {
        match &self.interior_factor {
            Some(factor) => factor.solve(&v),
            None => v,
        }
    }
}

#[derive(Debug, Clone)]
struct Level<T: Real> {
    num_dofs: usize,
    num_next: usize,
    patches: Vec<Patch<T>>,
}

#[derive(Debug, Clone)]
enum TopLevel<T: Real> {
    Direct(DirectSolver<T>),
    Iterative {
        matrix: CsrMatrix<T>,
        preconditioner: DiagonalPreconditioner<T>,
    },
}

#[derive(Debug, Clone)]
pub struct MultilevelSolver<T: Real> {
    num_dofs: usize,
    pinned: Option<usize>,
    levels: Vec<Level<T>>,
    top: TopLevel<T>,
}

fn chunks(count: usize, size: usize) -> Vec<Vec<usize>> {
    (0..count)
        .collect::<Vec<_>>()
        .chunks(size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Signed, scaled condensed element matrices restricted to the solve dofs.
///
/// The pinned dof is decoupled from all others and given a unit diagonal in one element.
fn level_zero_elements<T: Real>(
    condensed: &CondensedOperator<T>,
    map: &BoundaryMap,
    pinned: Option<usize>,
) -> Vec<LevelElement<T>> {
    let pin_owner = pinned.and_then(|p| map.dof_elements(p).first().map(|&(e, _)| e));
    (0..map.num_elements())
        .map(|e| {
            let (family, scale) = condensed.element(e);
            let signs = map.element_signs(e);
            let solve: Vec<_> = map.element_solve_dofs(e).collect();
            let mut matrix = DMatrix::from_fn(solve.len(), solve.len(), |i, j| {
                let (li, gi) = solve[i];
                let (lj, gj) = solve[j];
                if Some(gi) == pinned || Some(gj) == pinned {
                    T::zero()
                } else {
                    (signs[li] * signs[lj]).apply(family.schur()[(li, lj)] * scale)
                }
            });
            if pin_owner == Some(e) {
                if let Some(i) = solve.iter().position(|&(_, g)| Some(g) == pinned) {
                    matrix[(i, i)] = T::one();
                }
            }
            LevelElement {
                dofs: solve.into_iter().map(|(_, g)| g).collect(),
                matrix,
            }
        })
        .collect()
}

/// Condenses one level: returns the level and the elements of the next level.
fn condense_level<T: Real>(
    level_index: usize,
    num_dofs: usize,
    elements: Vec<LevelElement<T>>,
    groups: &[Vec<usize>],
) -> SolverResult<(Level<T>, Vec<LevelElement<T>>)> {
    let mut patch_dofs = Vec::with_capacity(groups.len());
    let mut count = vec![0usize; num_dofs];
    let mut assigned = vec![false; elements.len()];
    for group in groups {
        let mut dofs = BTreeSet::new();
        for &e in group {
            let element = elements
                .get(e)
                .ok_or_else(|| SolverError::dimension("recursion partition element index", Some(e), elements.len(), e))?;
            if std::mem::replace(&mut assigned[e], true) {
                return Err(SolverError::configuration(
                    "recursion.partition",
                    e,
                    "element is assigned to more than one patch",
                ));
            }
            dofs.extend(element.dofs.iter().copied());
        }
        for &d in &dofs {
            count[d] += 1;
        }
        patch_dofs.push(dofs.into_iter().collect::<Vec<_>>());
    }

    if let Some(missing) = assigned.iter().position(|&a| !a) {
        return Err(SolverError::configuration(
            "recursion.partition",
            missing,
            "element is not assigned to any patch",
        ));
    }

    let mut next_index = vec![usize::MAX; num_dofs];
    let mut num_next = 0;
    for (d, &c) in count.iter().enumerate() {
        if c >= 2 {
            next_index[d] = num_next;
            num_next += 1;
        }
    }

    // Sum the element matrices of each patch over the patch dofs
    let assembled: Vec<_> = groups
        .iter()
        .zip(patch_dofs)
        .map(|(group, dofs)| {
            let n = dofs.len();
            let mut matrix = DMatrix::zeros(n, n);
            for &e in group {
                let element = &elements[e];
                let local: Vec<usize> = element
                    .dofs
                    .iter()
                    .map(|d| dofs.binary_search(d).unwrap_or(usize::MAX))
                    .collect();
                for (j, &lj) in local.iter().enumerate() {
                    for (i, &li) in local.iter().enumerate() {
                        matrix[(li, lj)] += element.matrix[(i, j)];
                    }
                }
            }
            (dofs, matrix)
        })
        .collect();

    let condensed: Vec<(Patch<T>, LevelElement<T>)> = assembled
        .into_par_iter()
        .enumerate()
        .map(|(p, (dofs, matrix))| -> SolverResult<(Patch<T>, LevelElement<T>)> {
            let (boundary_local, interior_local): (Vec<usize>, Vec<usize>) =
                (0..dofs.len()).partition(|&i| count[dofs[i]] >= 2);
            let select = |rows: &[usize], cols: &[usize]| {
                DMatrix::from_fn(rows.len(), cols.len(), |i, j| matrix[(rows[i], cols[j])])
            };
            let a = select(&boundary_local, &boundary_local);
            let b = select(&boundary_local, &interior_local);
            let c = select(&interior_local, &interior_local);

            let (interior_factor, schur) = if interior_local.is_empty() {
                (None, a)
            } else {
                let dim = c.nrows();
                let factor = Cholesky::new(c).ok_or_else(|| SolverError::SingularBlock {
                    context: format!("interior block of level {} patch {}", level_index, p),
                    dim,
                })?;
                let c_inv_bt = factor.solve(&b.transpose());
                let mut schur = a;
                schur.gemm(-T::one(), &b, &c_inv_bt, T::one());
                crate::condensation::symmetrize_mut(&mut schur);
                (Some(factor), schur)
            };

            let boundary: Vec<usize> = boundary_local.iter().map(|&i| dofs[i]).collect();
            let next: Vec<usize> = boundary.iter().map(|&d| next_index[d]).collect();
            let patch = Patch {
                boundary,
                next: next.clone(),
                interior: interior_local.iter().map(|&i| dofs[i]).collect(),
                interior_factor,
                coupling: b,
            };
            Ok((patch, LevelElement { dofs: next, matrix: schur }))
        })
        .collect::<SolverResult<Vec<_>>>()?;

    let (patches, next_elements) = condensed.into_iter().unzip();
    let level = Level {
        num_dofs,
        num_next,
        patches,
    };
    Ok((level, next_elements))
}

impl<T: Real> MultilevelSolver<T> {
    pub fn build(
        condensed: &CondensedOperator<T>,
        map: &BoundaryMap,
        pinned: Option<usize>,
        settings: &SolverSettings,
        comm: &dyn Communicator<T>,
    ) -> SolverResult<Self> {
        if comm.size() > 1 {
            return Err(SolverError::configuration(
                "recursion",
                "Some",
                "multilevel condensation is only available on a single process",
            ));
        }
        let recursion = settings.recursion.clone().unwrap_or_default();
        let num_dofs = map.num_solve_dofs();

        let mut elements = level_zero_elements(condensed, map, pinned);
        let mut level_dofs = num_dofs;
        let mut levels = Vec::new();
        for level_index in 0..recursion.levels {
            let groups = match (&recursion.partition, level_index) {
                (Some(partition), 0) => partition.clone(),
                _ => chunks(elements.len(), recursion.patch_size),
            };
            if groups.len() < 2 {
                break;
            }
            let (level, next) = condense_level(level_index, level_dofs, elements, &groups)?;
            info!(
                "Multilevel condensation level {}: {} patches, {} -> {} dofs",
                level_index,
                level.patches.len(),
                level.num_dofs,
                level.num_next
            );
            level_dofs = level.num_next;
            levels.push(level);
            elements = next;
        }

        let top = Self::build_top(&elements, level_dofs, &recursion, settings)?;
        Ok(Self {
            num_dofs,
            pinned,
            levels,
            top,
        })
    }

    fn build_top(
        elements: &[LevelElement<T>],
        dim: usize,
        recursion: &RecursionSettings,
        settings: &SolverSettings,
    ) -> SolverResult<TopLevel<T>> {
        match recursion.top {
            TopLevelSolve::Direct => {
                let bandwidth = elements
                    .iter()
                    .map(|element| match (element.dofs.iter().min(), element.dofs.iter().max()) {
                        (Some(min), Some(max)) => max - min,
                        _ => 0,
                    })
                    .max()
                    .unwrap_or(0);
                let layout = match settings.storage.resolve(dim, bandwidth) {
                    StorageLayout::Dense => StorageLayout::Packed,
                    layout => layout,
                };
                let mut storage = SymmetricStorage::zeros(layout, dim, bandwidth);
                let upper = storage.as_upper_mut();
                for element in elements {
                    for (j, &gj) in element.dofs.iter().enumerate() {
                        for (i, &gi) in element.dofs.iter().enumerate() {
                            if gi <= gj {
                                upper.add_symmetric(gi, gj, element.matrix[(i, j)]);
                            }
                        }
                    }
                }
                Ok(TopLevel::Direct(DirectSolver::factor_upper(storage, None, "multilevel top-level system")?))
            }
            TopLevelSolve::Iterative => {
                let mut coo = CooMatrix::new(dim, dim);
                let mut diagonal = DVector::zeros(dim);
                for element in elements {
                    for (j, &gj) in element.dofs.iter().enumerate() {
                        for (i, &gi) in element.dofs.iter().enumerate() {
                            coo.push(gi, gj, element.matrix[(i, j)]);
                        }
                        diagonal[gj] += element.matrix[(j, j)];
                    }
                }
                Ok(TopLevel::Iterative {
                    matrix: CsrMatrix::from(&coo),
                    preconditioner: DiagonalPreconditioner::from_diagonal(diagonal)?,
                })
            }
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of unknowns of the top-level system.
    pub fn top_level_dim(&self) -> usize {
        self.levels.last().map(|l| l.num_next).unwrap_or(self.num_dofs)
    }

    /// Solves the condensed boundary system for a right-hand side of length `nsolve`.
    ///
    /// Returns the solution and the number of CG iterations spent on the top level.
    pub fn solve(&self, rhs: &DVector<T>, settings: &SolverSettings) -> SolverResult<(DVector<T>, usize)> {
        SolverError::check_dimension("multilevel right-hand side", None, self.num_dofs, rhs.len())?;
        let mut g = rhs.clone();
        if let Some(dof) = self.pinned {
            g[dof] = T::zero();
        }

        // Forward reduction, keeping the right-hand side of every level
        let mut level_rhs = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            let mut next = DVector::zeros(level.num_next);
            for patch in &level.patches {
                for (&b, &n) in patch.boundary.iter().zip(&patch.next) {
                    next[n] = g[b];
                }
            }
            for patch in &level.patches {
                if patch.interior.is_empty() {
                    continue;
                }
                let f_i = DVector::from_iterator(patch.interior.len(), patch.interior.iter().map(|&d| g[d]));
                let correction = &patch.coupling * patch.solve_interior(f_i);
                for (&n, &c) in patch.next.iter().zip(correction.iter()) {
                    next[n] -= c;
                }
            }
            level_rhs.push(g);
            g = next;
        }

        let (mut x, iterations) = match &self.top {
            TopLevel::Direct(solver) => (solver.solve(&g)?, 0),
            TopLevel::Iterative { matrix, preconditioner } => {
                let mut x = DVector::zeros(g.len());
                let mut workspace = CgWorkspace::default();
                let iterations = conjugate_gradient(
                    matrix,
                    preconditioner,
                    NullSpaceProjection::None,
                    settings,
                    &mut workspace,
                    &g,
                    &mut x,
                )?;
                (x, iterations)
            }
        };

        // Back-substitution, top level first
        for (level, g) in self.levels.iter().zip(level_rhs).rev() {
            let mut x_level = DVector::zeros(level.num_dofs);
            for patch in &level.patches {
                let x_b = DVector::from_iterator(patch.next.len(), patch.next.iter().map(|&n| x[n]));
                for (&b, &value) in patch.boundary.iter().zip(x_b.iter()) {
                    x_level[b] = value;
                }
                if patch.interior.is_empty() {
                    continue;
                }
                let mut f_i = DVector::from_iterator(patch.interior.len(), patch.interior.iter().map(|&d| g[d]));
                f_i.gemv_tr(-T::one(), &patch.coupling, &x_b, T::one());
                let x_i = patch.solve_interior(f_i);
                for (&d, &value) in patch.interior.iter().zip(x_i.iter()) {
                    x_level[d] = value;
                }
            }
            x = x_level;
        }
        Ok((x, iterations))
    }
}
