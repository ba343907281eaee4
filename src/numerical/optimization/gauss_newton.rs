//! Gauss-Newton least squares optimizer.
//!
//! Each iteration assembles the normal equations `(J~^T J~) dx = J~^T r~`
//! row by row from the weighted Jacobian `J~ = W^(1/2) J` and the weighted
//! residuals `r~ = W^(1/2) r`, and solves them with a dense LU or QR
//! decomposition. There is no step control: termination is entirely up to
//! the convergence checker, so a solver without a checker refuses to run.
use crate::numerical::optimization::LeastSquaresOptimizer;
use crate::numerical::optimization::LSQ_base::{LeastSquaresBase, LeastSquaresOptimum};
use crate::numerical::optimization::config_LSQ::SolverSettings;
use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::problem_LSQ::{
    ConvergenceChecker, LeastSquaresProblem, ModelFunction, PointVectorValuePair,
    SimpleVectorValueChecker,
};
use crate::somelinalg::LUsolver::{solve_with_lu, solve_with_qr};
use crate::somelinalg::linear_sys_diagnostics::poorly_conditioned;
use log::{debug, error, info};
use nalgebra::{DMatrix, DVector};
use strum_macros::{Display, EnumIter, EnumString};

/// Condition number above which the normal matrix is reported as poorly conditioned
const CONDITION_WARNING_THRESHOLD: f64 = 1e12;

/// Dense solver used for the normal equations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum DecompositionMethod {
    LU,
    QR,
}

impl DecompositionMethod {
    fn solve(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> LSQResult<DVector<f64>> {
        let solution = match self {
            DecompositionMethod::LU => solve_with_lu(a, b),
            DecompositionMethod::QR => solve_with_qr(a, b),
        };
        solution.map_err(|e| {
            error!("{} solve of the normal equations failed: {}", self, e);
            OptimizationError::ConvergenceFailure("unable to solve: singular problem")
        })
    }
}

pub struct GaussNewtonOptimizer {
    decomposition: DecompositionMethod,
    checker: Option<Box<dyn ConvergenceChecker>>,
}

impl Default for GaussNewtonOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussNewtonOptimizer {
    /// LU decomposition and no convergence checker; one must be set with
    /// [`with_checker`](Self::with_checker) before optimizing.
    pub fn new() -> Self {
        Self {
            decomposition: DecompositionMethod::LU,
            checker: None,
        }
    }

    /// Decomposition from the `[gauss_newton]` section, with a
    /// [`SimpleVectorValueChecker`] built from its thresholds.
    pub fn from_settings(settings: &SolverSettings) -> Self {
        let s = &settings.gauss_newton;
        Self::new()
            .with_decomposition(s.decomposition)
            .with_checker(SimpleVectorValueChecker::new(
                s.relative_threshold,
                s.absolute_threshold,
            ))
    }

    #[must_use]
    pub fn with_decomposition(self, decomposition: DecompositionMethod) -> Self {
        Self {
            decomposition,
            ..self
        }
    }

    #[must_use]
    pub fn with_checker<C: ConvergenceChecker + 'static>(self, checker: C) -> Self {
        Self {
            checker: Some(Box::new(checker)),
            ..self
        }
    }

    pub fn decomposition(&self) -> DecompositionMethod {
        self.decomposition
    }
}

/// Accumulate `A = sum_i g_i g_i^T` and `b = sum_i r_i g_i` over the rows
/// `g_i` of the weighted Jacobian and the weighted residuals `r_i`.
pub fn assemble_normal_equations(
    weighted_jacobian: &DMatrix<f64>,
    weighted_residuals: &DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let n = weighted_jacobian.ncols();
    let mut a = DMatrix::zeros(n, n);
    let mut b = DVector::zeros(n);
    for (i, grad) in weighted_jacobian.row_iter().enumerate() {
        let residual = weighted_residuals[i];
        for j in 0..n {
            b[j] += residual * grad[j];
        }
        for k in 0..n {
            let gk = grad[k];
            for l in 0..n {
                a[(k, l)] += gk * grad[l];
            }
        }
    }
    (a, b)
}

impl LeastSquaresOptimizer for GaussNewtonOptimizer {
    fn optimize<M: ModelFunction>(
        &self,
        problem: &LeastSquaresProblem<M>,
    ) -> LSQResult<LeastSquaresOptimum> {
        let mut base = LeastSquaresBase::new(problem)?;
        base.check_parameters()?;
        let checker = self
            .checker
            .as_ref()
            .ok_or(OptimizationError::NullConvergenceChecker)?;
        info!(
            "{} ({}): {} observations, {} parameters",
            self.name(),
            self.decomposition,
            base.rows(),
            base.cols()
        );

        let mut point = problem.start_point().clone();
        let mut previous: Option<PointVectorValuePair> = None;
        let mut iterations = 0;
        loop {
            iterations += 1;
            let objective = base.compute_objective_value(&point)?;
            let residuals = base.compute_residuals(&objective)?;
            let weighted_jacobian = base.compute_weighted_jacobian(&point)?;
            let current = PointVectorValuePair::new(point.clone(), objective);

            let (a, b) =
                assemble_normal_equations(&weighted_jacobian, &base.weighted_residuals(&residuals));

            if let Some(previous) = &previous {
                if checker.converged(iterations, previous, &current) {
                    let optimum = base.optimum(
                        self.name(),
                        current.point,
                        current.value,
                        residuals,
                        weighted_jacobian,
                        iterations,
                    );
                    info!("\n{}", optimum.summary_table());
                    return Ok(optimum);
                }
            }

            poorly_conditioned(&a, CONDITION_WARNING_THRESHOLD);
            let dx = self.decomposition.solve(&a, &b)?;
            point += &dx;
            debug!(
                "iteration {}: cost {:e}, |dx| = {:e}",
                iterations,
                base.compute_cost(&residuals),
                dx.norm()
            );
            previous = Some(current);
        }
    }

    fn name(&self) -> &'static str {
        "Gauss-Newton"
    }
}
