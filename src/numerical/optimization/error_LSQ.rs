//! Error types of the least-squares optimizers.
//!
//! Failures are grouped the way a caller has to react to them:
//! configuration errors are raised before the first iteration, numerical
//! failures and tolerance exhaustion are raised mid-solve and never retried,
//! dimension mismatches are raised on first detection.
use crate::somelinalg::LinearAlgebraError;
use thiserror::Error;

/// Result alias used throughout the optimization module
pub type LSQResult<T> = Result<T, OptimizationError>;

#[derive(Debug, Error)]
pub enum OptimizationError {
    /// Bounds were supplied to a solver that cannot honour them.
    #[error("bound constraints are not supported by this optimizer")]
    UnsupportedBounds,
    /// Gauss-Newton has no built-in stopping rule, so it cannot run without a checker.
    #[error("a convergence checker is required by the Gauss-Newton optimizer")]
    NullConvergenceChecker,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("the parameter vector is empty")]
    NoParameters,
    #[error("the target vector is empty")]
    NoObservations,
    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("matrix is singular")]
    SingularMatrix,
    #[error("unable to perform QR decomposition on the {rows}x{cols} jacobian")]
    UnableToPerformQR { rows: usize, cols: usize },
    /// `NaN` or infinity met in the named quantity
    #[error("non-finite value encountered in {0}")]
    Numerical(&'static str),
    #[error("convergence failed: {0}")]
    ConvergenceFailure(&'static str),
    #[error(
        "cost relative tolerance is too small ({0}), no further reduction in the sum of squares is possible"
    )]
    TooSmallCostRelativeTolerance(f64),
    #[error(
        "parameters relative tolerance is too small ({0}), no further improvement in the approximate solution is possible"
    )]
    TooSmallParametersRelativeTolerance(f64),
    #[error(
        "orthogonality tolerance is too small ({0}), solution is orthogonal to the jacobian"
    )]
    TooSmallOrthogonalityTolerance(f64),
    #[error("maximal number of evaluations ({0}) exceeded")]
    TooManyEvaluations(usize),
    /// The model function returned `None`.
    #[error("user function failed to compute the {0}")]
    UserFunction(&'static str),
    #[error(transparent)]
    Linear(#[from] LinearAlgebraError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OptimizationError {
    /// The solve never started because the request itself is wrong.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            OptimizationError::UnsupportedBounds
                | OptimizationError::NullConvergenceChecker
                | OptimizationError::InvalidConfig(_)
                | OptimizationError::NoParameters
                | OptimizationError::NoObservations
        )
    }

    /// The solver stalled at machine precision: the requested tolerance cannot be reached.
    ///
    /// This usually means the current point is already as good as floating
    /// point arithmetic allows; loosen the named tolerance.
    pub fn is_tolerance_exhaustion(&self) -> bool {
        matches!(
            self,
            OptimizationError::TooSmallCostRelativeTolerance(_)
                | OptimizationError::TooSmallParametersRelativeTolerance(_)
                | OptimizationError::TooSmallOrthogonalityTolerance(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(OptimizationError::UnsupportedBounds.is_configuration_error());
        assert!(OptimizationError::NullConvergenceChecker.is_configuration_error());
        assert!(!OptimizationError::SingularMatrix.is_configuration_error());
        assert!(OptimizationError::TooSmallCostRelativeTolerance(1e-20).is_tolerance_exhaustion());
        assert!(
            OptimizationError::TooSmallOrthogonalityTolerance(0.0).is_tolerance_exhaustion()
        );
        assert!(!OptimizationError::TooManyEvaluations(10).is_tolerance_exhaustion());
    }

    #[test]
    fn test_linear_algebra_error_converts() {
        let err: OptimizationError = LinearAlgebraError::Singular.into();
        assert!(matches!(err, OptimizationError::Linear(LinearAlgebraError::Singular)));
        let msg = OptimizationError::DimensionMismatch {
            what: "objective",
            expected: 3,
            found: 2,
        }
        .to_string();
        assert!(msg.contains("expected 3"));
    }
}
