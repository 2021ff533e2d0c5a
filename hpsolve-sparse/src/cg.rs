use core::fmt;
use hpsolve_traits::Real;
use nalgebra::storage::StorageMut;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Dyn, Scalar, Vector};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use num::Zero;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// A linear map `y = A x` on vectors of a fixed dimension.
pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        (**self).apply(y, x)
    }
}

impl<T: Real> LinearOperator<T> for DMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T: Real> LinearOperator<T> for CsrMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(self), Op::NoOp(&x));
        Ok(())
    }
}

/// The identity, i.e. an unpreconditioned solve.
#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.copy_from(&x);
        Ok(())
    }
}

/// What a stopping criterion gets to see after every iteration.
#[derive(Debug, Copy, Clone)]
pub struct IterationState<T> {
    pub iteration: usize,
    /// Norm of the recursively updated residual.
    pub residual_norm: T,
    /// Norm of the (projected) right-hand side.
    pub rhs_norm: T,
}

pub trait CgStoppingCriterion<T: Scalar> {
    fn has_converged(&self, state: &IterationState<T>) -> Result<bool, SolveErrorKind>;
}

/// Stops once `||r|| <= tol * ||b||`.
#[derive(Debug, Copy, Clone)]
pub struct RelativeResidualCriterion<T: Scalar> {
    tol: T,
}

impl<T: Scalar + Zero> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }
}

impl Default for RelativeResidualCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl<T: Real> CgStoppingCriterion<T> for RelativeResidualCriterion<T> {
    fn has_converged(&self, state: &IterationState<T>) -> Result<bool, SolveErrorKind> {
        Ok(state.residual_norm <= self.tol * state.rhs_norm)
    }
}

/// Formula used for the search direction update.
///
/// In exact arithmetic both coincide for a fixed SPD preconditioner. Polak-Ribière is
/// more forgiving when the preconditioner is only approximately symmetric.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BetaUpdate {
    FletcherReeves,
    #[default]
    PolakRibiere,
}

/// Removes a null-space component from residuals and corrections during CG.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NullSpaceProjection<T: Scalar> {
    #[default]
    None,
    /// Keep a single degree of freedom fixed at zero.
    Pinned(usize),
    /// Keep vectors orthogonal to the given direction.
    Orthogonal(DVector<T>),
}

impl<T: Real> NullSpaceProjection<T> {
    pub fn project<S>(&self, v: &mut Vector<T, Dyn, S>)
    where
        S: StorageMut<T, Dyn>,
    {
        match self {
            Self::None => {}
            Self::Pinned(dof) => {
                if let Some(entry) = v.get_mut(*dof) {
                    *entry = T::zero();
                }
            }
            Self::Orthogonal(direction) => {
                let norm_squared = direction.norm_squared();
                if norm_squared > T::zero() {
                    let c = v.dot(direction) / norm_squared;
                    v.axpy(-c, direction, T::one());
                }
            }
        }
    }
}

/// Vectors reused between solves of the same dimension.
#[derive(Debug, Clone)]
pub struct CgWorkspace<T: Scalar> {
    residual: DVector<T>,
    previous_residual: DVector<T>,
    preconditioned: DVector<T>,
    direction: DVector<T>,
    image: DVector<T>,
}

impl<T: Scalar + Zero> Default for CgWorkspace<T> {
    fn default() -> Self {
        let empty = || DVector::zeros(0);
        Self {
            residual: empty(),
            previous_residual: empty(),
            preconditioned: empty(),
            direction: empty(),
            image: empty(),
        }
    }
}

impl<T: Scalar + Zero> CgWorkspace<T> {
    fn resize(&mut self, dim: usize) {
        for v in [
            &mut self.residual,
            &mut self.previous_residual,
            &mut self.preconditioned,
            &mut self.direction,
            &mut self.image,
        ] {
            v.resize_vertically_mut(dim, T::zero());
        }
    }
}

#[derive(Debug, Clone)]
struct CgOptions<T: Scalar> {
    max_iter: Option<usize>,
    beta_update: BetaUpdate,
    projection: NullSpaceProjection<T>,
}

/// Preconditioned conjugate gradients, configured through a builder.
///
/// ```ignore
/// let output = ConjugateGradient::new()
///     .with_operator(&a)
///     .with_preconditioner(&jacobi)
///     .with_stopping_criterion(RelativeResidualCriterion::new(1e-10))
///     .solve_with_guess(&b, &mut x)?;
/// ```
#[derive(Debug)]
pub struct ConjugateGradient<'a, T, A, P, Criterion>
where
    T: Scalar,
{
    borrowed_workspace: Option<&'a mut CgWorkspace<T>>,
    own_workspace: CgWorkspace<T>,
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    options: CgOptions<T>,
}

impl<'a, T: Scalar + Zero> ConjugateGradient<'a, T, (), IdentityOperator, ()> {
    pub fn new() -> Self {
        Self {
            borrowed_workspace: None,
            own_workspace: CgWorkspace::default(),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            options: CgOptions {
                max_iter: None,
                beta_update: BetaUpdate::default(),
                projection: NullSpaceProjection::None,
            },
        }
    }

    /// Solves with buffers owned by the caller, avoiding reallocation across solves.
    pub fn with_workspace(workspace: &'a mut CgWorkspace<T>) -> Self {
        Self {
            borrowed_workspace: Some(workspace),
            ..Self::new()
        }
    }
}

impl<'a, T: Scalar, A, P, Criterion> ConjugateGradient<'a, T, A, P, Criterion> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> ConjugateGradient<'a, T, A, P2, Criterion> {
        ConjugateGradient {
            borrowed_workspace: self.borrowed_workspace,
            own_workspace: self.own_workspace,
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            options: self.options,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.options.max_iter = Some(max_iter);
        self
    }

    pub fn with_beta_update(mut self, beta_update: BetaUpdate) -> Self {
        self.options.beta_update = beta_update;
        self
    }

    /// Projection applied to the residual and to the preconditioned residual in every iteration.
    ///
    /// The initial guess is projected as well, so that the iterate stays in the subspace.
    pub fn with_projection(mut self, projection: NullSpaceProjection<T>) -> Self {
        self.options.projection = projection;
        self
    }
}

impl<'a, T: Scalar, P, Criterion> ConjugateGradient<'a, T, (), P, Criterion> {
    pub fn with_operator<A>(self, operator: A) -> ConjugateGradient<'a, T, A, P, Criterion> {
        ConjugateGradient {
            borrowed_workspace: self.borrowed_workspace,
            own_workspace: self.own_workspace,
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            options: self.options,
        }
    }
}

impl<'a, T: Scalar, A, P> ConjugateGradient<'a, T, A, P, ()> {
    pub fn with_stopping_criterion<Criterion>(
        self,
        stopping_criterion: Criterion,
    ) -> ConjugateGradient<'a, T, A, P, Criterion> {
        ConjugateGradient {
            borrowed_workspace: self.borrowed_workspace,
            own_workspace: self.own_workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            options: self.options,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(Box<dyn Error>),
    PreconditionerError(Box<dyn Error>),
    StoppingCriterionError(Box<dyn Error>),
    /// `pᵀ A p <= 0` for a search direction `p`.
    IndefiniteOperator,
    /// `zᵀ r <= 0` for a preconditioned residual `z`.
    IndefinitePreconditioner,
    MaxIterationsReached { max_iter: usize },
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => write!(f, "operator application failed: {}", err),
            Self::PreconditionerError(err) => write!(f, "preconditioner application failed: {}", err),
            Self::StoppingCriterionError(err) => write!(f, "stopping criterion failed: {}", err),
            Self::IndefiniteOperator => write!(f, "non-positive curvature p^T A p"),
            Self::IndefinitePreconditioner => write!(f, "non-positive z^T r, preconditioner is not positive definite"),
            Self::MaxIterationsReached { max_iter } => write!(f, "no convergence within {} iterations", max_iter),
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    /// State of the solver when it gave up.
    pub output: CgOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CG stopped after {} iterations: {}", self.output.num_iterations, self.kind)
    }
}

impl<T: fmt::Debug> std::error::Error for SolveError<T> {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CgOutput<T> {
    /// Number of updates made to the initial guess.
    pub num_iterations: usize,
    /// Norm of the recursively updated residual when the solver stopped.
    pub residual_norm: T,
}

impl<'a, T, A, P, Criterion> ConjugateGradient<'a, T, A, P, Criterion>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
    Criterion: CgStoppingCriterion<T>,
{
    /// Solves `A x = b`, starting from the current contents of `x`.
    pub fn solve_with_guess<'b>(
        &mut self,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<CgOutput<T>, SolveError<T>> {
        let Self {
            borrowed_workspace,
            own_workspace,
            operator,
            preconditioner,
            stopping_criterion,
            options,
        } = self;
        let workspace = match borrowed_workspace {
            Some(workspace) => &mut **workspace,
            None => own_workspace,
        };
        let mut solve = CgSolve {
            operator: &*operator,
            preconditioner: &*preconditioner,
            stopping_criterion: &*stopping_criterion,
            options: &*options,
            output: CgOutput {
                num_iterations: 0,
                residual_norm: T::zero(),
            },
        };
        solve.run(workspace, b.into(), x.into())
    }
}

/// A single solve, borrowing the configuration of its builder.
struct CgSolve<'s, T: Scalar, A, P, Criterion> {
    operator: &'s A,
    preconditioner: &'s P,
    stopping_criterion: &'s Criterion,
    options: &'s CgOptions<T>,
    output: CgOutput<T>,
}

impl<'s, T, A, P, Criterion> CgSolve<'s, T, A, P, Criterion>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
    Criterion: CgStoppingCriterion<T>,
{
    fn fail(&self, kind: SolveErrorKind) -> SolveError<T> {
        SolveError {
            output: self.output.clone(),
            kind,
        }
    }

    /// `z = P r`, projected.
    fn precondition(&self, z: &mut DVector<T>, r: &DVector<T>) -> Result<(), SolveError<T>> {
        self.preconditioner
            .apply((&mut *z).into(), r.into())
            .map_err(|err| self.fail(SolveErrorKind::PreconditionerError(err)))?;
        self.options.projection.project(z);
        Ok(())
    }

    /// `y = A x`, projected.
    fn multiply(&self, y: &mut DVector<T>, x: DVectorView<T>) -> Result<(), SolveError<T>> {
        self.operator
            .apply((&mut *y).into(), x)
            .map_err(|err| self.fail(SolveErrorKind::OperatorError(err)))?;
        self.options.projection.project(y);
        Ok(())
    }

    fn run(
        &mut self,
        workspace: &mut CgWorkspace<T>,
        b: DVectorView<T>,
        mut x: DVectorViewMut<T>,
    ) -> Result<CgOutput<T>, SolveError<T>> {
        assert_eq!(b.len(), x.len(), "right-hand side and solution must have equal length");
        workspace.resize(x.len());
        let CgWorkspace {
            residual: r,
            previous_residual: r_prev,
            preconditioned: z,
            direction: p,
            image: ap,
        } = workspace;
        let options: &'s CgOptions<T> = self.options;
        let projection = &options.projection;

        // ||b|| in the projected space
        z.copy_from(&b);
        projection.project(&mut *z);
        let rhs_norm = z.norm();
        if rhs_norm == T::zero() {
            x.fill(T::zero());
            return Ok(self.output.clone());
        }

        projection.project(&mut x);
        self.multiply(&mut *r, x.as_view())?;
        // r = b - A x
        r.axpy(T::one(), &b, -T::one());
        projection.project(&mut *r);

        self.precondition(&mut *z, &*r)?;
        p.copy_from(&*z);
        let mut rho = z.dot(&*r);

        loop {
            self.output.residual_norm = r.norm();
            let state = IterationState {
                iteration: self.output.num_iterations,
                residual_norm: self.output.residual_norm,
                rhs_norm,
            };
            if self
                .stopping_criterion
                .has_converged(&state)
                .map_err(|kind| self.fail(kind))?
            {
                return Ok(self.output.clone());
            }
            if let Some(max_iter) = options.max_iter {
                if self.output.num_iterations >= max_iter {
                    return Err(self.fail(SolveErrorKind::MaxIterationsReached { max_iter }));
                }
            }

            self.multiply(&mut *ap, p.as_view())?;
            let curvature = p.dot(&*ap);
            if curvature <= T::zero() {
                return Err(self.fail(SolveErrorKind::IndefiniteOperator));
            }
            if rho <= T::zero() {
                return Err(self.fail(SolveErrorKind::IndefinitePreconditioner));
            }

            let alpha = rho / curvature;
            x.axpy(alpha, &*p, T::one());
            r_prev.copy_from(&*r);
            r.axpy(-alpha, &*ap, T::one());
            projection.project(&mut *r);
            self.output.num_iterations += 1;

            self.precondition(&mut *z, &*r)?;
            let rho_next = z.dot(&*r);
            let beta = match options.beta_update {
                BetaUpdate::FletcherReeves => rho_next / rho,
                BetaUpdate::PolakRibiere => (rho_next - z.dot(&*r_prev)) / rho,
            };
            // A negative beta restarts along the preconditioned residual
            let beta = if beta > T::zero() { beta } else { T::zero() };
            // p = z + beta p
            p.axpy(T::one(), &*z, beta);
            rho = rho_next;
        }
    }
}
