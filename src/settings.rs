//! Solver configuration.
use crate::error::{SolverError, SolverResult};
use crate::partition::Symmetry;
use crate::storage::StorageLayout;
use hpsolve_sparse::cg::BetaUpdate;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SolveMethod {
    #[default]
    Direct,
    Iterative,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PreconditionerKind {
    None,
    #[default]
    Diagonal,
    Block,
    LowEnergy,
    Overlap,
}

/// Treatment of a one-dimensional null space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SingularHandling {
    /// The operator is non-singular.
    #[default]
    Regular,
    /// Pin one dof to zero. `None` selects the last vertex solve dof.
    Pinned { dof: Option<usize> },
    /// Keep iterates orthogonal to the vertex-constant null space (iterative solves only).
    RemoveMean,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MultiRhsUpdate {
    /// Drop the oldest stored solution when the cache is full.
    #[default]
    EvictOldest,
    /// Empty the cache when it is full and start over from the new solution.
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiRhsSettings {
    pub capacity: usize,
    pub update: MultiRhsUpdate,
}

impl Default for MultiRhsSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            update: MultiRhsUpdate::EvictOldest,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TopLevelSolve {
    #[default]
    Direct,
    /// Jacobi-preconditioned CG.
    Iterative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursionSettings {
    /// Maximum number of condensation levels above the element boundary system.
    pub levels: usize,
    /// Number of elements (or patches of the previous level) grouped into one patch.
    pub patch_size: usize,
    /// Explicit level-0 patches as lists of elements. Overrides `patch_size` on level 0.
    pub partition: Option<Vec<Vec<usize>>>,
    pub top: TopLevelSolve,
}

impl Default for RecursionSettings {
    fn default() -> Self {
        Self {
            levels: 2,
            patch_size: 4,
            partition: None,
            top: TopLevelSolve::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OverlapPatches {
    /// All dofs of the elements sharing a vertex.
    #[default]
    ByVertex,
    /// The dofs of a single element.
    ByElement,
    /// Element groups, typically read with [`read_partition`].
    Partition(Vec<Vec<usize>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OverlapSettings {
    pub patches: OverlapPatches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Name of the field, used in error reports.
    pub field: String,
    pub solve_method: SolveMethod,
    pub preconditioner: PreconditionerKind,
    pub storage: StorageLayout,
    /// Relative residual tolerance of CG.
    pub tolerance: f64,
    pub max_iterations_per_dof: usize,
    pub min_iterations_cap: usize,
    pub beta_update: BetaUpdate,
    pub singular: SingularHandling,
    pub multi_rhs: Option<MultiRhsSettings>,
    pub recursion: Option<RecursionSettings>,
    pub overlap: OverlapSettings,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            field: "u".to_string(),
            solve_method: SolveMethod::Direct,
            preconditioner: PreconditionerKind::Diagonal,
            storage: StorageLayout::Auto,
            tolerance: 1e-10,
            max_iterations_per_dof: 10,
            min_iterations_cap: 200,
            beta_update: BetaUpdate::PolakRibiere,
            singular: SingularHandling::Regular,
            multi_rhs: None,
            recursion: None,
            overlap: OverlapSettings::default(),
        }
    }
}

impl SolverSettings {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn iterative(preconditioner: PreconditionerKind) -> Self {
        Self {
            solve_method: SolveMethod::Iterative,
            preconditioner,
            ..Self::default()
        }
    }

    /// Iteration cap of CG for a system with `num_dofs` unknowns.
    pub fn max_iterations(&self, num_dofs: usize) -> usize {
        self.min_iterations_cap
            .max(self.max_iterations_per_dof.saturating_mul(num_dofs))
    }

    /// Rejects unsupported option combinations before any assembly takes place.
    pub fn validate(&self, symmetry: Symmetry) -> SolverResult<()> {
        let non_symmetric = symmetry == Symmetry::NonSymmetric;
        // Multilevel solves replace the outer direct/iterative stage
        let uses_cg = self.solve_method == SolveMethod::Iterative && self.recursion.is_none();

        if non_symmetric && self.solve_method == SolveMethod::Iterative {
            return Err(SolverError::configuration(
                "solve_method",
                "Iterative",
                "conjugate gradients require a symmetric operator",
            ));
        }
        if non_symmetric && matches!(self.storage, StorageLayout::Banded | StorageLayout::Packed) {
            return Err(SolverError::configuration(
                "storage",
                format!("{:?}", self.storage),
                "banded and packed factorizations of non-symmetric systems are not implemented",
            ));
        }
        if non_symmetric && self.recursion.is_some() {
            return Err(SolverError::configuration(
                "recursion",
                "Some",
                "multilevel condensation requires a symmetric operator",
            ));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(SolverError::configuration(
                "tolerance",
                self.tolerance,
                "tolerance must be positive and finite",
            ));
        }
        if let Some(multi_rhs) = &self.multi_rhs {
            if multi_rhs.capacity == 0 {
                return Err(SolverError::configuration("multi_rhs.capacity", 0, "capacity must be positive"));
            }
            if !uses_cg {
                return Err(SolverError::configuration(
                    "multi_rhs",
                    "Some",
                    "the multi-RHS cache only accelerates non-recursive iterative solves",
                ));
            }
        }
        if self.singular == SingularHandling::RemoveMean
            && (self.solve_method == SolveMethod::Direct || self.recursion.is_some())
        {
            return Err(SolverError::configuration(
                "singular",
                "RemoveMean",
                "direct and multilevel solves require a pinned dof",
            ));
        }
        if let Some(recursion) = &self.recursion {
            if recursion.levels == 0 {
                return Err(SolverError::configuration("recursion.levels", 0, "at least one level is required"));
            }
            if recursion.patch_size < 2 {
                return Err(SolverError::configuration(
                    "recursion.patch_size",
                    recursion.patch_size,
                    "patches must group at least two elements",
                ));
            }
        }
        Ok(())
    }
}

/// Reads a partition file: one part id per element per line, in element order.
///
/// Blank lines and everything after `#` are ignored. Returns the elements of each part in
/// ascending part id order, with empty parts removed.
pub fn read_partition<R: BufRead>(reader: R) -> SolverResult<Vec<Vec<usize>>> {
    let mut parts: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut element = 0;
    for (line_number, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| SolverError::configuration("partition", line_number + 1, err.to_string()))?;
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let part: usize = content.parse().map_err(|_| {
            SolverError::configuration(
                "partition",
                content,
                format!("line {} is not a non-negative part id", line_number + 1),
            )
        })?;
        parts.entry(part).or_default().push(element);
        element += 1;
    }
    // Part ids need not be contiguous, unused ids are empty parts
    if let Some(&last) = parts.keys().next_back() {
        let empty = last - (parts.len() - 1);
        if empty > 0 {
            warn!("Partition has {} empty parts", empty);
        }
    }
    Ok(parts.into_values().collect())
}
