//! Interfaces to the collaborators that supply element operators and dof numbering.
use crate::boundary_map::Sign;
use crate::element::{DofGroup, ElementShape};
use crate::partition::LocalElementMatrix;
use hpsolve_traits::Real;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Element-to-global numbering of boundary modes.
///
/// Global dofs `0..num_solve_dofs()` are unknowns, dofs `num_solve_dofs()..num_global_dofs()`
/// carry fixed (Dirichlet) values.
pub trait BoundaryDofSource {
    fn num_elements(&self) -> usize;

    fn num_global_dofs(&self) -> usize;

    fn num_solve_dofs(&self) -> usize;

    fn element_boundary_count(&self, element_index: usize) -> usize;

    fn populate_boundary_dofs(&self, output: &mut [usize], element_index: usize);

    /// Sign changes of the element's boundary modes relative to the global orientation.
    fn populate_signs(&self, output: &mut [Sign], element_index: usize);

    fn dof_group(&self, global_dof: usize) -> DofGroup;
}

/// Key of a class of elements that share one local operator up to a scalar factor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FamilyKey {
    pub shape: ElementShape,
    pub order: usize,
    /// Distinguishes otherwise equal shape/order combinations, e.g. different aspect ratios.
    pub tag: usize,
}

/// Membership of an element in a family: its operator is `scale` times the family operator.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ElementFamily<T> {
    pub key: FamilyKey,
    pub scale: T,
}

pub trait LocalOperatorSource<T: Real>: BoundaryDofSource {
    /// The family of the element, or `None` if it must be factored on its own.
    ///
    /// The family operator is taken to be the operator of the first element of the family
    /// divided by its scale.
    fn element_family(&self, _element_index: usize) -> Option<ElementFamily<T>> {
        None
    }

    /// The local operator, already scaled by the element's geometric factors.
    fn local_operator(&self, element_index: usize) -> eyre::Result<LocalElementMatrix<T>>;
}

/// Pressure-velocity coupling of one element of a Stokes problem.
///
/// `blocks[k]` is the `num_pressure_modes × num_velocity_modes` block coupling pressure to
/// velocity component `k`, exactly as it appears in the saddle-point matrix. Velocity modes use
/// the boundary-first ordering of the scalar operator and pressure mode 0 is the constant mode.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceOperator<T: Real> {
    pub blocks: Vec<DMatrix<T>>,
}

impl<T: Real> DivergenceOperator<T> {
    pub fn num_pressure_modes(&self) -> usize {
        self.blocks.first().map(|b| b.nrows()).unwrap_or(0)
    }
}

/// A Stokes problem: every velocity component uses the scalar operator and numbering of the
/// underlying [`LocalOperatorSource`].
pub trait StokesOperatorSource<T: Real>: LocalOperatorSource<T> {
    fn num_velocity_components(&self) -> usize;

    fn divergence_operator(&self, element_index: usize) -> eyre::Result<DivergenceOperator<T>>;
}
