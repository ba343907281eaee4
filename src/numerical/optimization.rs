//! Nonlinear least squares: `min_x (t - f(x))^T W (t - f(x))`.
//!
//! Two optimizers share the problem definition, the weighted residual
//! evaluator and the result type:
//! - [`gauss_newton::GaussNewtonOptimizer`] solves the normal equations every
//!   iteration and stops only when its convergence checker says so;
//! - [`LM_optimization::LevenbergMarquardtOptimizer`] is the MINPACK trust
//!   region method built on a pivoted Householder QR.
use crate::numerical::optimization::LSQ_base::LeastSquaresOptimum;
use crate::numerical::optimization::error_LSQ::LSQResult;
use crate::numerical::optimization::problem_LSQ::{LeastSquaresProblem, ModelFunction};

/// Levenberg-Marquardt outer and inner loop
#[allow(non_snake_case)]
pub mod LM_optimization;
/// weighted residual and cost evaluator, result type and its statistics
#[allow(non_snake_case)]
pub mod LSQ_base;
#[allow(non_snake_case)]
pub mod config_LSQ;
/// fitting parametric curves to weighted observations
pub mod curve_fitting;
#[allow(non_snake_case)]
pub mod error_LSQ;
/// Gauss-Newton optimizer with LU or QR normal equation solves
pub mod gauss_newton;
/// model function, convergence checkers and problem definition
#[allow(non_snake_case)]
pub mod problem_LSQ;
/// pivoted Householder QR with rank detection
#[allow(non_snake_case)]
pub mod qr_LM;
/// trust region subproblem: Levenberg-Marquardt parameter search
#[allow(non_snake_case)]
pub mod trust_region_LM;
/// machine constants and the scaled euclidean norm
pub mod utils;


/// Common interface of the least squares optimizers.
pub trait LeastSquaresOptimizer {
    /// Solve `problem` from its start point.
    fn optimize<M: ModelFunction>(
        &self,
        problem: &LeastSquaresProblem<M>,
    ) -> LSQResult<LeastSquaresOptimum>;

    fn name(&self) -> &'static str;
}
