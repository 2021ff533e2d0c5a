//! Error types for the condensation and solve engine.
use crate::element::ElementShape;
use hpsolve_sparse::cg::{SolveError, SolveErrorKind};
use hpsolve_traits::{to_f64, Real};
use std::error::Error;
use std::fmt;

/// Broad classification of engine failures.
///
/// None of these are recoverable inside the engine: a failed build or solve aborts the
/// enclosing simulation step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unsupported or inconsistent combination of options.
    Configuration,
    /// Non-positive pivots, singular blocks, failed convergence.
    Numerical,
    /// Block sizes inconsistent with the requested operator.
    Dimension,
}

/// Which basis a boundary vector is currently expressed in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BasisState {
    Standard,
    LowEnergy,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolverError {
    Configuration {
        parameter: &'static str,
        value: String,
        reason: String,
    },
    UnsupportedShape {
        shape: ElementShape,
        operation: &'static str,
    },
    WrongBasis {
        expected: BasisState,
        found: BasisState,
    },
    NonPositivePivot {
        context: String,
        row: usize,
        dim: usize,
        bandwidth: usize,
        pivot: f64,
    },
    SingularBlock {
        context: String,
        dim: usize,
    },
    ConvergenceFailure {
        field: String,
        iterations: usize,
        max_iterations: usize,
        residual_norm: f64,
    },
    IndefiniteOperator {
        field: String,
        iterations: usize,
        reason: String,
    },
    DimensionMismatch {
        what: &'static str,
        element: Option<usize>,
        expected: usize,
        actual: usize,
    },
    Source(eyre::Report),
}

impl SolverError {
    pub fn category(&self) -> ErrorCategory {
        use SolverError::*;
        match self {
            Configuration { .. } | UnsupportedShape { .. } | WrongBasis { .. } => ErrorCategory::Configuration,
            NonPositivePivot { .. } | SingularBlock { .. } | ConvergenceFailure { .. } | IndefiniteOperator { .. } => {
                ErrorCategory::Numerical
            }
            DimensionMismatch { .. } => ErrorCategory::Dimension,
            // Collaborators only fail on inconsistent input data
            Source(_) => ErrorCategory::Dimension,
        }
    }

    pub(crate) fn configuration(parameter: &'static str, value: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Configuration {
            parameter,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn dimension(what: &'static str, element: Option<usize>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what,
            element,
            expected,
            actual,
        }
    }

    /// Checks that `actual == expected`, returning a dimension mismatch error otherwise.
    pub(crate) fn check_dimension(
        what: &'static str,
        element: Option<usize>,
        expected: usize,
        actual: usize,
    ) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::dimension(what, element, expected, actual))
        }
    }
}

impl SolverError {
    /// Attaches the field identity to a failed CG solve.
    pub(crate) fn from_cg<T: Real>(field: &str, error: SolveError<T>) -> Self {
        let iterations = error.output.num_iterations;
        let residual_norm = to_f64(error.output.residual_norm);
        match error.kind {
            SolveErrorKind::MaxIterationsReached { max_iter } => Self::ConvergenceFailure {
                field: field.to_string(),
                iterations,
                max_iterations: max_iter,
                residual_norm,
            },
            kind @ (SolveErrorKind::IndefiniteOperator | SolveErrorKind::IndefinitePreconditioner) => {
                Self::IndefiniteOperator {
                    field: field.to_string(),
                    iterations,
                    reason: kind.to_string(),
                }
            }
            SolveErrorKind::OperatorError(err)
            | SolveErrorKind::PreconditionerError(err)
            | SolveErrorKind::StoppingCriterionError(err) => match err.downcast::<SolverError>() {
                Ok(inner) => *inner,
                Err(other) => Self::Source(eyre::eyre!("CG for field '{}' failed: {}", field, other)),
            },
            kind => Self::Source(eyre::eyre!("CG for field '{}' failed: {}", field, kind)),
        }
    }
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SolverError::*;
        match self {
            Configuration {
                parameter,
                value,
                reason,
            } => write!(f, "Unsupported configuration {} = {}: {}", parameter, value, reason),
            UnsupportedShape { shape, operation } => {
                write!(f, "Operation '{}' is not implemented for {:?} elements", operation, shape)
            }
            WrongBasis { expected, found } => write!(
                f,
                "Boundary vector is in the {:?} basis, but the {:?} basis was expected",
                found, expected
            ),
            NonPositivePivot {
                context,
                row,
                dim,
                bandwidth,
                pivot,
            } => write!(
                f,
                "Non-positive pivot {:e} in row {} while factoring {} (dim = {}, bandwidth = {})",
                pivot, row, context, dim, bandwidth
            ),
            SingularBlock { context, dim } => {
                write!(f, "Numerically singular {} (dim = {})", context, dim)
            }
            ConvergenceFailure {
                field,
                iterations,
                max_iterations,
                residual_norm,
            } => write!(
                f,
                "CG for field '{}' did not converge: {} of {} iterations, residual norm {:e}",
                field, iterations, max_iterations, residual_norm
            ),
            IndefiniteOperator {
                field,
                iterations,
                reason,
            } => write!(
                f,
                "CG for field '{}' broke down after {} iterations: {}",
                field, iterations, reason
            ),
            DimensionMismatch {
                what,
                element,
                expected,
                actual,
            } => {
                write!(f, "Dimension mismatch in {}", what)?;
                if let Some(element) = element {
                    write!(f, " of element {}", element)?;
                }
                write!(f, ": expected {}, got {}", expected, actual)
            }
            Source(report) => write!(f, "Operator source failed: {}", report),
        }
    }
}

impl Error for SolverError {}

impl From<eyre::Report> for SolverError {
    fn from(report: eyre::Report) -> Self {
        Self::Source(report)
    }
}

pub type SolverResult<T> = Result<T, SolverError>;
