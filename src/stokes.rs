//! Condensed Stokes systems with one constant pressure mode per element.
//!
//! Every velocity component is condensed with the scalar operator of the source. The pressure
//! modes beyond the constant one are then eliminated against the velocity boundary modes, so
//! that each element contributes a symmetric indefinite block on its velocity boundary modes
//! and its constant pressure mode.
//!
//! Unknowns of the augmented system are numbered component by component: velocity solve dof
//! `g` of component `c` is `c * nsolve + g`, followed by one pressure unknown per element and
//! finally the fixed velocity dofs.
use crate::assembly::{csr_mul, with_element};
use crate::boundary_map::{BoundaryMap, ElementVectors, Sign};
use crate::comm::{Communicator, SerialCommunicator};
use crate::condensation::{symmetrize_mut, CondensedElement, CondensedOperator};
use crate::direct::DirectSolver;
use crate::error::{SolverError, SolverResult};
use crate::multi_rhs::MultiRhsCache;
use crate::partition::Symmetry;
use crate::preconditioner::DiagonalPreconditioner;
use crate::settings::{PreconditionerKind, SingularHandling, SolveMethod, SolverSettings};
use crate::source::{DivergenceOperator, StokesOperatorSource};
use crate::storage::{StorageLayout, SymmetricStorage};
use crate::system::conjugate_gradient;
use fenris_nested_vec::NestedVec;
use hpsolve_sparse::cg::{CgWorkspace, IdentityOperator, LinearOperator, NullSpaceProjection};
use hpsolve_traits::Real;
use log::info;
use nalgebra::{Cholesky, DMatrix, DVector, DVectorView, DVectorViewMut, Dyn};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use std::error::Error;
use std::sync::Arc;

/// Element right-hand sides of a Stokes problem.
#[derive(Debug, Clone, PartialEq)]
pub struct StokesRhs<T: Real> {
    /// Per velocity component, the element load vectors in boundary-first order.
    pub velocity: Vec<ElementVectors<T>>,
    /// Right-hand side of the continuity equation, one entry per pressure mode.
    pub pressure: ElementVectors<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StokesSolution<T: Real> {
    /// Per component, global velocity boundary coefficients including fixed values.
    pub velocity_boundary: Vec<DVector<T>>,
    /// Per component, local velocity coefficients of every element.
    pub velocity: Vec<ElementVectors<T>>,
    /// Pressure coefficients of every element, constant mode first.
    pub pressure: ElementVectors<T>,
    /// CG iterations of the pressure solve (zero for direct solves).
    pub iterations: usize,
}

impl<T: Real> StokesSolution<T> {
    /// Coefficient of the constant pressure mode of an element.
    pub fn constant_pressure(&self, element: usize) -> T {
        self.pressure
            .get(element)
            .and_then(|p| p.first().copied())
            .unwrap_or_else(T::zero)
    }
}

#[derive(Debug, Copy, Clone)]
struct Numbering {
    components: usize,
    velocity_solve: usize,
    velocity_global: usize,
    elements: usize,
}

impl Numbering {
    fn velocity(&self, component: usize, dof: usize) -> usize {
        if dof < self.velocity_solve {
            component * self.velocity_solve + dof
        } else {
            let num_fixed = self.velocity_global - self.velocity_solve;
            self.num_solve() + component * num_fixed + (dof - self.velocity_solve)
        }
    }

    fn pressure(&self, element: usize) -> usize {
        self.components * self.velocity_solve + element
    }

    fn num_velocity(&self) -> usize {
        self.components * self.velocity_solve
    }

    fn num_solve(&self) -> usize {
        self.num_velocity() + self.elements
    }
}

#[derive(Debug, Clone)]
struct StokesElement<T: Real> {
    /// `[[M_uu, M_up], [M_upᵀ, M_pp]]` on the velocity boundary modes and the constant pressure.
    matrix: DMatrix<T>,
    /// Pressure coupling `E_k = D_b - D_i C⁻¹ Bᵀ` of all components, side by side.
    coupling: DMatrix<T>,
    /// `P = -(1/s) Σ_k D_i C⁻¹ D_iᵀ`
    pressure: DMatrix<T>,
    /// Factor of `-P_ii`, absent when the element has a single pressure mode.
    pressure_interior: Option<Cholesky<T, Dyn>>,
    divergence_interior: Vec<DMatrix<T>>,
}

impl<T: Real> StokesElement<T> {
    fn build(
        family: &CondensedElement<T>,
        scale: T,
        divergence: &DivergenceOperator<T>,
        components: usize,
        element: usize,
    ) -> SolverResult<Self> {
        let nb = family.num_boundary();
        let ni = family.num_interior();
        let np = divergence.num_pressure_modes();
        SolverError::check_dimension("divergence blocks", Some(element), components, divergence.blocks.len())?;
        if np == 0 {
            return Err(SolverError::dimension("pressure modes", Some(element), 1, 0));
        }
        for block in &divergence.blocks {
            SolverError::check_dimension("divergence block rows", Some(element), np, block.nrows())?;
            SolverError::check_dimension("divergence block columns", Some(element), nb + ni, block.ncols())?;
        }

        let n = components * nb;
        let mut coupling = DMatrix::zeros(np, n);
        let mut pressure = DMatrix::zeros(np, np);
        let mut divergence_interior = Vec::with_capacity(components);
        for (k, block) in divergence.blocks.iter().enumerate() {
            let d_i = block.columns(nb, ni).into_owned();
            let mut e_k = block.columns(0, nb).into_owned();
            if ni > 0 {
                e_k.gemm(-T::one(), &d_i, family.interior_coupling(), T::one());
                let w = family.interior_factor().solve(&d_i.transpose())?;
                pressure.gemm(-T::one() / scale, &d_i, &w, T::one());
            }
            coupling.columns_mut(k * nb, nb).copy_from(&e_k);
            divergence_interior.push(d_i);
        }
        symmetrize_mut(&mut pressure);

        let schur = family.schur() * scale;
        let mut matrix = DMatrix::zeros(n + 1, n + 1);
        for k in 0..components {
            matrix.view_mut((k * nb, k * nb), (nb, nb)).copy_from(&schur);
        }
        let mut m_up = coupling.row(0).transpose();
        let mut m_pp = pressure[(0, 0)];

        let pressure_interior = if np > 1 {
            let e_i = coupling.rows(1, np - 1).into_owned();
            let p_i0 = DVector::from_fn(np - 1, |i, _| pressure[(i + 1, 0)]);
            let dim = np - 1;
            let factor = Cholesky::new(-pressure.view((1, 1), (dim, dim)).into_owned()).ok_or_else(|| {
                SolverError::SingularBlock {
                    context: format!("interior pressure block of element {}", element),
                    dim,
                }
            })?;
            let x = factor.solve(&e_i);
            let y = factor.solve(&p_i0);
            let mut uu = matrix.view_mut((0, 0), (n, n));
            uu += e_i.tr_mul(&x);
            m_up += e_i.tr_mul(&y);
            m_pp += p_i0.dot(&y);
            Some(factor)
        } else {
            None
        };

        matrix.view_mut((0, n), (n, 1)).copy_from(&m_up);
        matrix.view_mut((n, 0), (1, n)).copy_from(&m_up.transpose());
        matrix[(n, n)] = m_pp;
        symmetrize_mut(&mut matrix);

        Ok(Self {
            matrix,
            coupling,
            pressure,
            pressure_interior,
            divergence_interior,
        })
    }

    fn num_pressure_modes(&self) -> usize {
        self.pressure.nrows()
    }

    /// Condensed element right-hand side and the reduced continuity right-hand side `ĝ`.
    fn condense_rhs(
        &self,
        family: &CondensedElement<T>,
        scale: T,
        velocity: &[&[T]],
        continuity: &[T],
    ) -> SolverResult<(DVector<T>, DVector<T>)> {
        let nb = family.num_boundary();
        let ni = family.num_interior();
        let np = self.num_pressure_modes();
        let n = velocity.len() * nb;
        SolverError::check_dimension("continuity right-hand side", None, np, continuity.len())?;

        let mut r = DVector::zeros(n + 1);
        let mut g_hat = DVector::from_column_slice(continuity);
        for (k, f) in velocity.iter().enumerate() {
            let f_b = family.condense_rhs(f)?;
            r.rows_mut(k * nb, nb).copy_from(&f_b);
            if ni > 0 {
                let y = family
                    .interior_factor()
                    .solve_vector(&DVector::from_column_slice(&f[nb..]))?;
                g_hat.gemv(-T::one() / scale, &self.divergence_interior[k], &y, T::one());
            }
        }
        r[n] = g_hat[0];
        if let Some(factor) = &self.pressure_interior {
            let z = factor.solve(&g_hat.rows(1, np - 1).into_owned());
            r.rows_mut(0, n)
                .gemv_tr(T::one(), &self.coupling.rows(1, np - 1), &z, T::one());
            r[n] += (1..np).map(|i| self.pressure[(i, 0)] * z[i - 1]).fold(T::zero(), |a, b| a + b);
        }
        Ok((r, g_hat))
    }

    /// Recovers the pressure modes and the full local velocity coefficients.
    fn back_substitute(
        &self,
        family: &CondensedElement<T>,
        scale: T,
        velocity: &[&[T]],
        g_hat: &DVector<T>,
        velocity_boundary: &[DVector<T>],
        constant_pressure: T,
    ) -> SolverResult<(Vec<DVector<T>>, DVector<T>)> {
        let nb = family.num_boundary();
        let np = self.num_pressure_modes();
        let mut p = DVector::zeros(np);
        p[0] = constant_pressure;
        if let Some(factor) = &self.pressure_interior {
            let u = DVector::from_iterator(
                velocity_boundary.len() * nb,
                velocity_boundary.iter().flat_map(|u| u.iter().copied()),
            );
            let mut h = g_hat.rows(1, np - 1).into_owned();
            h.gemv(-T::one(), &self.coupling.rows(1, np - 1), &u, T::one());
            for i in 0..np - 1 {
                h[i] -= self.pressure[(i + 1, 0)] * constant_pressure;
            }
            p.rows_mut(1, np - 1).copy_from(&(-factor.solve(&h)));
        }

        let mut coefficients = Vec::with_capacity(velocity.len());
        for (k, (f, u_b)) in velocity.iter().zip(velocity_boundary).enumerate() {
            let mut modified = DVector::from_column_slice(f);
            modified
                .rows_mut(nb, f.len() - nb)
                .gemv_tr(-T::one(), &self.divergence_interior[k], &p, T::one());
            let u_i = family.back_substitute(scale, modified.as_slice(), u_b)?;
            coefficients.push(DVector::from_iterator(
                nb + u_i.len(),
                u_b.iter().copied().chain(u_i.iter().copied()),
            ));
        }
        Ok((coefficients, p))
    }
}

/// `S = Gᵀ K⁻¹ G - M_pp`, the pressure Schur complement of the augmented system.
struct PressureSchurOperator<'a, T: Real> {
    velocity: &'a DirectSolver<T>,
    gradient: &'a CsrMatrix<T>,
    divergence: &'a CsrMatrix<T>,
    pressure_diagonal: &'a DVector<T>,
    comm: &'a dyn Communicator<T>,
}

impl<'a, T: Real> PressureSchurOperator<'a, T> {
    fn gradient_mul(&self, p: &[T]) -> DVector<T> {
        let mut w = DVector::zeros(self.gradient.nrows());
        csr_mul(self.gradient, p, w.as_mut_slice());
        self.comm.reduce_sum(w.as_mut_slice());
        w
    }

    fn divergence_mul(&self, w: &[T]) -> DVector<T> {
        let mut y = DVector::zeros(self.divergence.nrows());
        csr_mul(self.divergence, w, y.as_mut_slice());
        self.comm.reduce_sum(y.as_mut_slice());
        y
    }

    fn apply_schur(&self, p: &DVector<T>) -> SolverResult<DVector<T>> {
        let mut w = self.gradient_mul(p.as_slice());
        self.velocity.solve_in_place(&mut w)?;
        let mut y = self.divergence_mul(w.as_slice());
        y -= self.pressure_diagonal.component_mul(p);
        Ok(y)
    }
}

impl<'a, T: Real> LinearOperator<T> for PressureSchurOperator<'a, T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.copy_from(&self.apply_schur(&x.clone_owned())?);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StokesBackend<T: Real> {
    Direct(DirectSolver<T>),
    /// CG on the pressure Schur complement.
    Uzawa {
        velocity: DirectSolver<T>,
        gradient: CsrMatrix<T>,
        divergence: CsrMatrix<T>,
        pressure_diagonal: DVector<T>,
        preconditioner: Option<DiagonalPreconditioner<T>>,
    },
}

/// Augmented indices and signs of the local rows of an element block.
fn element_indices(map: &BoundaryMap, numbering: &Numbering, element: usize) -> Vec<(usize, Sign)> {
    let dofs = map.element_dofs(element);
    let signs = map.element_signs(element);
    (0..numbering.components)
        .flat_map(move |c| {
            dofs.iter()
                .zip(signs)
                .map(move |(&g, &sign)| (numbering.velocity(c, g), sign))
        })
        .chain(std::iter::once((numbering.pressure(element), Sign::Positive)))
        .collect()
}

/// Borrowed pieces of a Stokes system needed to assemble its global matrices.
struct StokesAssembly<'a, T: Real> {
    map: &'a BoundaryMap,
    elements: &'a [StokesElement<T>],
    numbering: Numbering,
    pressure_pin: Option<usize>,
    settings: &'a SolverSettings,
    comm: &'a dyn Communicator<T>,
}

impl<'a, T: Real> StokesAssembly<'a, T> {
    fn build_direct(&self) -> SolverResult<StokesBackend<T>> {
        let ns = self.numbering.num_solve();
        let mut matrix = DMatrix::zeros(ns, ns);
        for (e, element) in self.elements.iter().enumerate() {
            let indices = element_indices(self.map, &self.numbering, e);
            for (j, &(gj, sj)) in indices.iter().enumerate() {
                for (i, &(gi, si)) in indices.iter().enumerate() {
                    if gi < ns && gj < ns {
                        matrix[(gi, gj)] += (si * sj).apply(element.matrix[(i, j)]);
                    }
                }
            }
        }
        self.comm.reduce_sum(matrix.as_mut_slice());
        let pinned = self.pressure_pin.map(|e| self.numbering.pressure(e));
        let context = format!("Stokes system of field '{}'", self.settings.field);
        Ok(StokesBackend::Direct(DirectSolver::factor_dense_general(matrix, pinned, &context)?))
    }

    fn build_uzawa(&self) -> SolverResult<StokesBackend<T>> {
        let nu = self.numbering.num_velocity();
        let nel = self.numbering.elements;

        let element_bandwidth = |e: usize| {
            let velocity: Vec<usize> = element_indices(self.map, &self.numbering, e)
                .into_iter()
                .map(|(g, _)| g)
                .filter(|&g| g < nu)
                .collect();
            match (velocity.iter().min(), velocity.iter().max()) {
                (Some(min), Some(max)) => max - min,
                _ => 0,
            }
        };
        let mut bandwidth = [(0..nel).map(element_bandwidth).max().unwrap_or(0)];
        self.comm.reduce_max(&mut bandwidth);
        let bandwidth = bandwidth[0];
        let layout = match self.settings.storage.resolve(nu, bandwidth) {
            StorageLayout::Dense => StorageLayout::Packed,
            layout => layout,
        };

        let mut storage = SymmetricStorage::zeros(layout, nu, bandwidth);
        let mut coo = CooMatrix::new(nu, nel);
        let mut pressure_diagonal = DVector::zeros(nel);
        for (e, element) in self.elements.iter().enumerate() {
            let indices = element_indices(self.map, &self.numbering, e);
            let n = indices.len() - 1;
            let upper = storage.as_upper_mut();
            for (j, &(gj, sj)) in indices[..n].iter().enumerate() {
                if gj >= nu {
                    continue;
                }
                for (i, &(gi, si)) in indices[..n].iter().enumerate() {
                    if gi <= gj {
                        upper.add_symmetric(gi, gj, (si * sj).apply(element.matrix[(i, j)]));
                    }
                }
                coo.push(gj, e, sj.apply(element.matrix[(j, n)]));
            }
            pressure_diagonal[e] = element.matrix[(n, n)];
        }
        self.comm.reduce_sum(storage.as_upper_mut().as_mut_slice());
        self.comm.reduce_sum(pressure_diagonal.as_mut_slice());

        let context = format!("velocity block of field '{}'", self.settings.field);
        let velocity = DirectSolver::factor_upper(storage, None, &context)?;
        let gradient = CsrMatrix::from(&coo);
        let divergence = gradient.transpose();

        let preconditioner = match self.settings.preconditioner {
            PreconditionerKind::Diagonal => {
                let operator = PressureSchurOperator {
                    velocity: &velocity,
                    gradient: &gradient,
                    divergence: &divergence,
                    pressure_diagonal: &pressure_diagonal,
                    comm: self.comm,
                };
                // Diagonal of S, one unit vector at a time
                let mut diagonal = DVector::zeros(nel);
                for j in 0..nel {
                    let mut unit = DVector::zeros(nel);
                    unit[j] = T::one();
                    diagonal[j] = operator.apply_schur(&unit)?[j];
                }
                if let Some(pin) = self.pressure_pin {
                    diagonal[pin] = T::one();
                }
                Some(DiagonalPreconditioner::from_diagonal(diagonal)?)
            }
            _ => None,
        };

        Ok(StokesBackend::Uzawa {
            velocity,
            gradient,
            divergence,
            pressure_diagonal,
            preconditioner,
        })
    }
}

/// A condensed Stokes system, solved by a direct factorization of the augmented system or by
/// Uzawa iteration on the element pressures.
pub struct StokesSystem<T: Real> {
    settings: SolverSettings,
    comm: Arc<dyn Communicator<T>>,
    map: BoundaryMap,
    condensed: CondensedOperator<T>,
    elements: Vec<StokesElement<T>>,
    numbering: Numbering,
    pressure_pin: Option<usize>,
    backend: StokesBackend<T>,
    cache: Option<MultiRhsCache<T>>,
    workspace: CgWorkspace<T>,
}

impl<T: Real> StokesSystem<T> {
    pub fn build<S>(source: &S, settings: SolverSettings) -> SolverResult<Self>
    where
        S: ?Sized + StokesOperatorSource<T>,
    {
        Self::build_with_communicator(source, settings, Arc::new(SerialCommunicator))
    }

    pub fn build_with_communicator<S>(
        source: &S,
        settings: SolverSettings,
        comm: Arc<dyn Communicator<T>>,
    ) -> SolverResult<Self>
    where
        S: ?Sized + StokesOperatorSource<T>,
    {
        settings.validate(Symmetry::Symmetric)?;
        if settings.recursion.is_some() {
            return Err(SolverError::configuration(
                "recursion",
                "Some",
                "multilevel condensation is not available for Stokes systems",
            ));
        }
        if settings.solve_method == SolveMethod::Iterative
            && !matches!(settings.preconditioner, PreconditionerKind::None | PreconditionerKind::Diagonal)
        {
            return Err(SolverError::configuration(
                "preconditioner",
                format!("{:?}", settings.preconditioner),
                "the Stokes pressure solve supports the None and Diagonal preconditioners",
            ));
        }
        // Pressure unknowns are numbered by local element index
        if comm.size() > 1 {
            return Err(SolverError::configuration(
                "communicator",
                comm.size(),
                "Stokes systems are only available on a single process",
            ));
        }
        let components = source.num_velocity_components();
        if components == 0 {
            return Err(SolverError::configuration(
                "num_velocity_components",
                0,
                "at least one velocity component is required",
            ));
        }

        let map = BoundaryMap::from_source_with_communicator(source, &*comm)?;
        let condensed = CondensedOperator::build(source)?;
        if condensed.symmetry() != Symmetry::Symmetric {
            return Err(SolverError::configuration(
                "symmetry",
                "NonSymmetric",
                "Stokes systems require a symmetric velocity operator",
            ));
        }

        let mut elements = Vec::with_capacity(map.num_elements());
        for e in 0..map.num_elements() {
            let (family, scale) = condensed.element(e);
            SolverError::check_dimension(
                "condensed element matrix",
                Some(e),
                map.element_boundary_count(e),
                family.num_boundary(),
            )?;
            let divergence = source.divergence_operator(e)?;
            elements.push(StokesElement::build(family, scale, &divergence, components, e)?);
        }

        let numbering = Numbering {
            components,
            velocity_solve: map.num_solve_dofs(),
            velocity_global: map.num_global_dofs(),
            elements: map.num_elements(),
        };
        let pressure_pin = match settings.singular {
            SingularHandling::Pinned { dof } => {
                let dof = dof.unwrap_or(0);
                if dof >= numbering.elements {
                    return Err(SolverError::configuration(
                        "singular.dof",
                        dof,
                        "the pinned pressure must be an element index",
                    ));
                }
                Some(dof)
            }
            _ => None,
        };

        let assembly = StokesAssembly {
            map: &map,
            elements: &elements,
            numbering,
            pressure_pin,
            settings: &settings,
            comm: &*comm,
        };
        let backend = match settings.solve_method {
            SolveMethod::Direct => assembly.build_direct()?,
            SolveMethod::Iterative => assembly.build_uzawa()?,
        };
        let cache = match (&backend, &settings.multi_rhs) {
            (StokesBackend::Uzawa { .. }, Some(multi_rhs)) => Some(MultiRhsCache::new(multi_rhs.clone())),
            _ => None,
        };
        info!(
            "Built Stokes system for field '{}': {} components, {} velocity solve dofs, {} pressures, {}",
            settings.field,
            components,
            numbering.velocity_solve,
            numbering.elements,
            match settings.solve_method {
                SolveMethod::Direct => "direct",
                SolveMethod::Iterative => "Uzawa CG",
            }
        );

        Ok(Self {
            settings,
            comm,
            map,
            condensed,
            elements,
            numbering,
            pressure_pin,
            backend,
            cache,
            workspace: CgWorkspace::default(),
        })
    }

    pub fn num_velocity_components(&self) -> usize {
        self.numbering.components
    }

    pub fn num_solve_dofs(&self) -> usize {
        self.numbering.num_solve()
    }

    pub fn boundary_map(&self) -> &BoundaryMap {
        &self.map
    }

    pub fn pinned_pressure(&self) -> Option<usize> {
        self.pressure_pin
    }

    pub fn multi_rhs_cache(&self) -> Option<&MultiRhsCache<T>> {
        self.cache.as_ref()
    }

    /// Solves the augmented system for the unknowns `0..num_solve_dofs()`.
    fn solve_augmented(&mut self, rhs: &DVector<T>) -> SolverResult<(DVector<T>, usize)> {
        let nu = self.numbering.num_velocity();
        let nel = self.numbering.elements;
        match &self.backend {
            StokesBackend::Direct(solver) => Ok((solver.solve(rhs)?, 0)),
            StokesBackend::Uzawa {
                velocity,
                gradient,
                divergence,
                pressure_diagonal,
                preconditioner,
            } => {
                let operator = PressureSchurOperator {
                    velocity,
                    gradient,
                    divergence,
                    pressure_diagonal,
                    comm: &*self.comm,
                };
                let r_u = rhs.rows(0, nu).into_owned();
                let r_p = rhs.rows(nu, nel).into_owned();
                let k_inv_r = velocity.solve(&r_u)?;
                let b = operator.divergence_mul(k_inv_r.as_slice()) - r_p;

                let projection = match (&self.settings.singular, self.pressure_pin) {
                    (SingularHandling::RemoveMean, _) => NullSpaceProjection::Orthogonal(DVector::repeat(nel, T::one())),
                    (_, Some(pin)) => NullSpaceProjection::Pinned(pin),
                    _ => NullSpaceProjection::None,
                };
                let mut p = match &self.cache {
                    Some(cache) if !cache.is_empty() => cache.initial_guess(&b),
                    _ => DVector::zeros(nel),
                };
                let iterations = match preconditioner {
                    Some(diagonal) => conjugate_gradient(
                        &operator,
                        diagonal,
                        projection,
                        &self.settings,
                        &mut self.workspace,
                        &b,
                        &mut p,
                    )?,
                    None => conjugate_gradient(
                        &operator,
                        IdentityOperator,
                        projection,
                        &self.settings,
                        &mut self.workspace,
                        &b,
                        &mut p,
                    )?,
                };
                if let Some(cache) = &mut self.cache {
                    let sp = operator.apply_schur(&p)?;
                    cache.insert(p.clone(), sp);
                }

                let mut u = r_u - operator.gradient_mul(p.as_slice());
                velocity.solve_in_place(&mut u)?;
                let mut x = DVector::zeros(nu + nel);
                x.rows_mut(0, nu).copy_from(&u);
                x.rows_mut(nu, nel).copy_from(&p);
                Ok((x, iterations))
            }
        }
    }

    /// Solves the Stokes problem.
    ///
    /// `velocity_boundary[c]` has length `nglobal` of the velocity numbering and carries the
    /// fixed (Dirichlet) values of component `c` in its entries `nsolve..`.
    pub fn solve(&mut self, rhs: &StokesRhs<T>, velocity_boundary: &[DVector<T>]) -> SolverResult<StokesSolution<T>> {
        let numbering = self.numbering;
        let nel = numbering.elements;
        let nc = numbering.components;
        let nsv = numbering.velocity_solve;
        SolverError::check_dimension("velocity right-hand sides", None, nc, rhs.velocity.len())?;
        SolverError::check_dimension("velocity boundary values", None, nc, velocity_boundary.len())?;
        SolverError::check_dimension("pressure right-hand sides", None, nel, rhs.pressure.len())?;
        for (f, u) in rhs.velocity.iter().zip(velocity_boundary) {
            SolverError::check_dimension("velocity right-hand sides", None, nel, f.len())?;
            SolverError::check_dimension("velocity boundary values", None, numbering.velocity_global, u.len())?;
        }

        let ns = numbering.num_solve();
        let mut global_rhs = DVector::zeros(ns);
        let mut reduced_continuity = Vec::with_capacity(nel);
        for (e, element) in self.elements.iter().enumerate() {
            let (family, scale) = self.condensed.element(e);
            let velocity: Vec<&[T]> = rhs.velocity.iter().map(|f| f.get(e).unwrap_or(&[])).collect();
            let continuity = rhs.pressure.get(e).unwrap_or(&[]);
            let (mut r, g_hat) = element
                .condense_rhs(family, scale, &velocity, continuity)
                .map_err(|err| with_element(err, e))?;

            // Dirichlet lifting
            let nb = family.num_boundary();
            let mut known = DVector::zeros(r.len());
            for (c, values) in velocity_boundary.iter().enumerate() {
                let dofs = self.map.element_dofs(e);
                let signs = self.map.element_signs(e);
                for (l, (&g, &sign)) in dofs.iter().zip(signs).enumerate() {
                    if g >= nsv {
                        known[c * nb + l] = sign.apply(values[g]);
                    }
                }
            }
            r.gemv(-T::one(), &element.matrix, &known, T::one());

            for (&(g, sign), &value) in element_indices(&self.map, &self.numbering, e).iter().zip(r.iter()) {
                if g < ns {
                    global_rhs[g] += sign.apply(value);
                }
            }
            reduced_continuity.push(g_hat);
        }
        self.comm.reduce_sum(global_rhs.as_mut_slice());

        let (x, iterations) = self.solve_augmented(&global_rhs)?;

        let velocity_solution: Vec<DVector<T>> = velocity_boundary
            .iter()
            .enumerate()
            .map(|(c, values)| {
                let mut u = values.clone();
                u.rows_mut(0, nsv).copy_from(&x.rows(c * nsv, nsv));
                u
            })
            .collect();

        let mut velocity = vec![NestedVec::new(); nc];
        let mut pressure = NestedVec::new();
        for (e, element) in self.elements.iter().enumerate() {
            let (family, scale) = self.condensed.element(e);
            let local_boundary: Vec<DVector<T>> = velocity_solution
                .iter()
                .map(|u| {
                    let mut local = DVector::zeros(family.num_boundary());
                    self.map.scatter_element(e, u.as_slice(), local.as_mut_slice());
                    local
                })
                .collect();
            let element_rhs: Vec<&[T]> = rhs.velocity.iter().map(|f| f.get(e).unwrap_or(&[])).collect();
            let (coefficients, p) = element
                .back_substitute(
                    family,
                    scale,
                    &element_rhs,
                    &reduced_continuity[e],
                    &local_boundary,
                    x[numbering.pressure(e)],
                )
                .map_err(|err| with_element(err, e))?;
            for (c, u) in coefficients.iter().enumerate() {
                velocity[c].push(u.as_slice());
            }
            pressure.push(p.as_slice());
        }

        Ok(StokesSolution {
            velocity_boundary: velocity_solution,
            velocity,
            pressure,
            iterations,
        })
    }
}
