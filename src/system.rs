//! The global boundary system: condensation, assembly, solve and interior back-substitution.
use crate::assembly::{assemble_condensed_rhs, with_element, BoundaryAssembler};
use crate::boundary_map::{BoundaryMap, ElementVectors};
use crate::comm::{Communicator, SerialCommunicator};
use crate::condensation::CondensedOperator;
use crate::direct::DirectSolver;
use crate::element::DofKind;
use crate::error::{SolverError, SolverResult};
use crate::multi_rhs::MultiRhsCache;
use crate::multilevel::MultilevelSolver;
use crate::operator::BoundaryOperator;
use crate::partition::Symmetry;
use crate::preconditioner::{Preconditioner, PreconditionerContext};
use crate::settings::{SingularHandling, SolveMethod, SolverSettings};
use crate::source::LocalOperatorSource;
use crate::storage::{StorageLayout, SymmetricStorage};
use fenris_nested_vec::NestedVec;
use hpsolve_sparse::cg::{
    CgWorkspace, ConjugateGradient, LinearOperator, NullSpaceProjection, RelativeResidualCriterion,
};
use hpsolve_traits::{to_f64, Real};
use log::{debug, info};
use nalgebra::DVector;
use std::sync::Arc;

/// Runs preconditioned CG with the tolerance, iteration cap and β-update of `settings`.
pub(crate) fn conjugate_gradient<T, A, P>(
    operator: A,
    preconditioner: P,
    projection: NullSpaceProjection<T>,
    settings: &SolverSettings,
    workspace: &mut CgWorkspace<T>,
    b: &DVector<T>,
    x: &mut DVector<T>,
) -> SolverResult<usize>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
{
    let tolerance = T::from_f64(settings.tolerance)
        .ok_or_else(|| SolverError::configuration("tolerance", settings.tolerance, "not representable"))?;
    let output = ConjugateGradient::with_workspace(workspace)
        .with_operator(operator)
        .with_preconditioner(preconditioner)
        .with_projection(projection)
        .with_beta_update(settings.beta_update)
        .with_max_iter(settings.max_iterations(b.len()))
        .with_stopping_criterion(RelativeResidualCriterion::new(tolerance))
        .solve_with_guess(b, x)
        .map_err(|err| SolverError::from_cg(&settings.field, err))?;
    debug!(
        "CG for field '{}' converged in {} iterations (residual norm {:e})",
        settings.field,
        output.num_iterations,
        to_f64(output.residual_norm)
    );
    Ok(output.num_iterations)
}

/// The last vertex solve dof, or the last solve dof if there are no vertex dofs.
fn default_pinned_dof(map: &BoundaryMap) -> Option<usize> {
    let n = map.num_solve_dofs();
    (0..n)
        .rev()
        .find(|&g| map.dof_group(g).kind == DofKind::Vertex)
        .or_else(|| n.checked_sub(1))
}

#[derive(Debug, Clone)]
enum Backend<T: Real> {
    Direct(DirectSolver<T>),
    Iterative { preconditioner: Preconditioner<T> },
    Multilevel(MultilevelSolver<T>),
}

/// Solution of a condensed solve, with interior modes recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution<T: Real> {
    /// Global boundary coefficients, including the fixed values (length `nglobal`).
    pub boundary: DVector<T>,
    /// Local coefficients of every element in boundary-first order.
    pub elements: ElementVectors<T>,
    /// CG iterations of the outer solve (zero for direct solves).
    pub iterations: usize,
}

impl<T: Real> Solution<T> {
    pub fn element_coefficients(&self, element: usize) -> &[T] {
        self.elements.get(element).unwrap_or(&[])
    }
}

/// A condensed boundary system, factored or preconditioned once and solved many times.
pub struct GlobalBoundarySystem<T: Real> {
    settings: SolverSettings,
    comm: Arc<dyn Communicator<T>>,
    map: BoundaryMap,
    condensed: CondensedOperator<T>,
    /// Dof pinned in the operator itself.
    pinned: Option<usize>,
    bandwidth: usize,
    backend: Backend<T>,
    cache: Option<MultiRhsCache<T>>,
    workspace: CgWorkspace<T>,
}

impl<T: Real> GlobalBoundarySystem<T> {
    pub fn build<S>(source: &S, settings: SolverSettings) -> SolverResult<Self>
    where
        S: ?Sized + LocalOperatorSource<T>,
    {
        Self::build_with_communicator(source, settings, Arc::new(SerialCommunicator))
    }

    pub fn build_with_communicator<S>(
        source: &S,
        settings: SolverSettings,
        comm: Arc<dyn Communicator<T>>,
    ) -> SolverResult<Self>
    where
        S: ?Sized + LocalOperatorSource<T>,
    {
        // Symmetry-independent checks first
        settings.validate(Symmetry::Symmetric)?;
        let map = BoundaryMap::from_source_with_communicator(source, &*comm)?;
        let condensed = CondensedOperator::build(source)?;
        settings.validate(condensed.symmetry())?;
        Self::from_parts(map, condensed, settings, comm)
    }

    fn from_parts(
        map: BoundaryMap,
        condensed: CondensedOperator<T>,
        settings: SolverSettings,
        comm: Arc<dyn Communicator<T>>,
    ) -> SolverResult<Self> {
        SolverError::check_dimension("condensed elements", None, map.num_elements(), condensed.num_elements())?;
        for e in 0..map.num_elements() {
            let (family, _) = condensed.element(e);
            SolverError::check_dimension(
                "condensed element matrix",
                Some(e),
                map.element_boundary_count(e),
                family.num_boundary(),
            )?;
        }

        let nsolve = map.num_solve_dofs();
        let (pinned, preconditioner_pin) = match &settings.singular {
            SingularHandling::Regular => (None, None),
            SingularHandling::Pinned { dof: Some(dof) } => {
                if *dof >= nsolve {
                    return Err(SolverError::configuration(
                        "singular.dof",
                        dof,
                        format!("pinned dof must be a solve dof (nsolve = {})", nsolve),
                    ));
                }
                (Some(*dof), Some(*dof))
            }
            SingularHandling::Pinned { dof: None } => {
                let dof = default_pinned_dof(&map);
                (dof, dof)
            }
            SingularHandling::RemoveMean => (None, default_pinned_dof(&map)),
        };

        let mut bandwidth = [map.bandwidth()];
        comm.reduce_max(&mut bandwidth);
        let bandwidth = bandwidth[0];

        let backend = Self::build_backend(&map, &condensed, &settings, &*comm, pinned, preconditioner_pin, bandwidth)?;
        let cache = match (&backend, &settings.multi_rhs) {
            (Backend::Iterative { .. }, Some(multi_rhs)) => Some(MultiRhsCache::new(multi_rhs.clone())),
            _ => None,
        };

        info!(
            "Built boundary system for field '{}': nsolve = {}, nglobal = {}, {} families, bandwidth = {}, {}",
            settings.field,
            nsolve,
            map.num_global_dofs(),
            condensed.num_families(),
            bandwidth,
            match &backend {
                Backend::Direct(solver) => format!("direct ({:?} storage)", solver.layout()),
                Backend::Iterative { preconditioner } => format!("CG ({:?} preconditioner)", preconditioner.kind()),
                Backend::Multilevel(ml) => format!("multilevel ({} levels)", ml.num_levels()),
            }
        );

        Ok(Self {
            settings,
            comm,
            map,
            condensed,
            pinned,
            bandwidth,
            backend,
            cache,
            workspace: CgWorkspace::default(),
        })
    }

    fn build_backend(
        map: &BoundaryMap,
        condensed: &CondensedOperator<T>,
        settings: &SolverSettings,
        comm: &dyn Communicator<T>,
        pinned: Option<usize>,
        preconditioner_pin: Option<usize>,
        bandwidth: usize,
    ) -> SolverResult<Backend<T>> {
        if settings.recursion.is_some() {
            return Ok(Backend::Multilevel(MultilevelSolver::build(
                condensed, map, pinned, settings, comm,
            )?));
        }

        let nsolve = map.num_solve_dofs();
        let context = format!("boundary system of field '{}'", settings.field);
        match settings.solve_method {
            SolveMethod::Direct => {
                let assembler = BoundaryAssembler::default();
                let solver = match (condensed.symmetry(), settings.storage.resolve(nsolve, bandwidth)) {
                    (Symmetry::NonSymmetric, _) => {
                        let mut matrix = assembler.assemble_dense(condensed, map)?;
                        comm.reduce_sum(matrix.as_mut_slice());
                        DirectSolver::factor_dense_general(matrix, pinned, &context)?
                    }
                    (Symmetry::Symmetric, StorageLayout::Dense) => {
                        let mut matrix = assembler.assemble_dense(condensed, map)?;
                        comm.reduce_sum(matrix.as_mut_slice());
                        DirectSolver::factor_dense_symmetric(matrix, pinned, &context)?
                    }
                    (Symmetry::Symmetric, layout) => {
                        let mut storage = SymmetricStorage::zeros(layout, nsolve, bandwidth);
                        assembler.assemble_into_upper(storage.as_upper_mut(), condensed, map)?;
                        comm.reduce_sum(storage.as_upper_mut().as_mut_slice());
                        DirectSolver::factor_upper(storage, pinned, &context)?
                    }
                };
                Ok(Backend::Direct(solver))
            }
            SolveMethod::Iterative => {
                let preconditioner_context = PreconditionerContext {
                    condensed,
                    map,
                    comm,
                    pinned: preconditioner_pin,
                    overlap: &settings.overlap,
                };
                let preconditioner = Preconditioner::build(settings.preconditioner, &preconditioner_context)?;
                Ok(Backend::Iterative { preconditioner })
            }
        }
    }

    /// Regenerates the condensed operators, storage and preconditioner, e.g. after a change of
    /// mesh or polynomial order. The multi-RHS cache is discarded.
    pub fn rebuild<S>(&mut self, source: &S) -> SolverResult<()>
    where
        S: ?Sized + LocalOperatorSource<T>,
    {
        let rebuilt = Self::build_with_communicator(source, self.settings.clone(), Arc::clone(&self.comm))?;
        *self = rebuilt;
        Ok(())
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn num_solve_dofs(&self) -> usize {
        self.map.num_solve_dofs()
    }

    pub fn num_global_dofs(&self) -> usize {
        self.map.num_global_dofs()
    }

    pub fn num_families(&self) -> usize {
        self.condensed.num_families()
    }

    /// The dof pinned to remove a null space, if any.
    pub fn pinned_dof(&self) -> Option<usize> {
        self.pinned
    }

    pub fn bandwidth(&self) -> usize {
        self.bandwidth
    }

    /// Layout of the factored global matrix, if the system is solved directly.
    pub fn storage_layout(&self) -> Option<StorageLayout> {
        match &self.backend {
            Backend::Direct(solver) => Some(solver.layout()),
            _ => None,
        }
    }

    pub fn boundary_map(&self) -> &BoundaryMap {
        &self.map
    }

    pub fn condensed(&self) -> &CondensedOperator<T> {
        &self.condensed
    }

    pub fn preconditioner(&self) -> Option<&Preconditioner<T>> {
        match &self.backend {
            Backend::Iterative { preconditioner } => Some(preconditioner),
            _ => None,
        }
    }

    pub fn multi_rhs_cache(&self) -> Option<&MultiRhsCache<T>> {
        self.cache.as_ref()
    }

    pub fn communicator(&self) -> &dyn Communicator<T> {
        &*self.comm
    }

    /// The matrix-free condensed operator, pinned like the system.
    pub fn operator(&self) -> BoundaryOperator<'_, T> {
        BoundaryOperator::new(&self.condensed, &self.map, &*self.comm).with_pinned(self.pinned)
    }

    /// Indicator of the vertex solve dofs, which spans the null space removed by `RemoveMean`.
    fn null_space_direction(&self) -> DVector<T> {
        DVector::from_fn(self.map.num_solve_dofs(), |g, _| {
            if self.map.dof_group(g).kind == DofKind::Vertex {
                T::one()
            } else {
                T::zero()
            }
        })
    }

    fn projection(&self) -> NullSpaceProjection<T> {
        match (&self.settings.singular, self.pinned) {
            (SingularHandling::RemoveMean, _) => NullSpaceProjection::Orthogonal(self.null_space_direction()),
            (_, Some(dof)) => NullSpaceProjection::Pinned(dof),
            _ => NullSpaceProjection::None,
        }
    }

    /// Solves the condensed system `Ā x = b` for the solve dofs only.
    ///
    /// `initial_guess` is used by iterative solves, unless the multi-RHS cache provides a guess.
    pub fn solve_boundary(&mut self, b: &DVector<T>, initial_guess: &DVector<T>) -> SolverResult<(DVector<T>, usize)> {
        let n = self.map.num_solve_dofs();
        SolverError::check_dimension("boundary right-hand side", None, n, b.len())?;
        SolverError::check_dimension("boundary initial guess", None, n, initial_guess.len())?;

        match &self.backend {
            Backend::Direct(solver) => Ok((solver.solve(b)?, 0)),
            Backend::Multilevel(solver) => solver.solve(b, &self.settings),
            Backend::Iterative { preconditioner } => {
                let projection = self.projection();
                let operator = BoundaryOperator::new(&self.condensed, &self.map, &*self.comm).with_pinned(self.pinned);
                let mut b = b.clone();
                if let Some(dof) = self.pinned {
                    b[dof] = T::zero();
                }

                let mut x = match &self.cache {
                    Some(cache) if !cache.is_empty() => cache.initial_guess(&b),
                    _ => initial_guess.clone(),
                };
                let iterations = conjugate_gradient(
                    &operator,
                    preconditioner.bind(&*self.comm),
                    projection,
                    &self.settings,
                    &mut self.workspace,
                    &b,
                    &mut x,
                )?;

                if let Some(cache) = &mut self.cache {
                    let mut ax = DVector::zeros(n);
                    operator
                        .apply((&mut ax).into(), (&x).into())
                        .map_err(|err| SolverError::Source(eyre::eyre!("{}", err)))?;
                    cache.insert(x.clone(), ax);
                }
                Ok((x, iterations))
            }
        }
    }

    /// Solves for the given element right-hand sides.
    ///
    /// `initial_guess` has length `nglobal`: entries `nsolve..` are the fixed (Dirichlet) values,
    /// entries `..nsolve` the initial guess of an iterative solve.
    pub fn solve(&mut self, rhs: &ElementVectors<T>, initial_guess: &DVector<T>) -> SolverResult<Solution<T>> {
        let n = self.map.num_solve_dofs();
        let nglobal = self.map.num_global_dofs();
        SolverError::check_dimension("initial guess", None, nglobal, initial_guess.len())?;

        let mut f = assemble_condensed_rhs(&self.condensed, &self.map, rhs, &*self.comm)?;

        // Move the contribution of the fixed values to the right-hand side
        if n < nglobal {
            let mut lifted = initial_guess.clone();
            lifted.rows_mut(0, n).fill(T::zero());
            let mut correction = DVector::zeros(n);
            self.operator()
                .apply_unpinned(lifted.as_slice(), correction.as_mut_slice());
            f.rows_mut(0, n).axpy(-T::one(), &correction, T::one());
        }

        let b = f.rows(0, n).into_owned();
        let guess = initial_guess.rows(0, n).into_owned();
        let (x, iterations) = self.solve_boundary(&b, &guess)?;

        let mut boundary = initial_guess.clone();
        boundary.rows_mut(0, n).copy_from(&x);
        let elements = self.back_substitute(rhs, &boundary)?;
        Ok(Solution {
            boundary,
            elements,
            iterations,
        })
    }

    /// Recovers the local coefficients of every element from the global boundary solution.
    pub fn back_substitute(&self, rhs: &ElementVectors<T>, boundary: &DVector<T>) -> SolverResult<ElementVectors<T>> {
        SolverError::check_dimension("element right-hand sides", None, self.map.num_elements(), rhs.len())?;
        SolverError::check_dimension("boundary solution", None, self.map.num_global_dofs(), boundary.len())?;
        let mut elements = NestedVec::new();
        let mut local = Vec::new();
        for (e, f) in rhs.iter().enumerate() {
            let (family, scale) = self.condensed.element(e);
            local.resize(self.map.element_boundary_count(e), T::zero());
            self.map.scatter_element(e, boundary.as_slice(), &mut local);
            let u_b = DVector::from_column_slice(&local);
            let u_i = family
                .back_substitute(scale, f, &u_b)
                .map_err(|err| with_element(err, e))?;
            let mut array = elements.begin_array();
            for &value in local.iter().chain(u_i.iter()) {
                array.push_single(value);
            }
        }
        Ok(elements)
    }
}
