//! Levenberg-Marquardt least squares optimizer.
//!
//! This is a trust region method in the form of MINPACK `lmder`: every outer
//! iteration factorizes the weighted Jacobian with a pivoted Householder QR,
//! the inner iterations pick a damping parameter for the current trust
//! region radius, evaluate the trial point and grow, shrink or roll back.
//! # Example
//! ```rust, ignore
//! use RustedLSQ::numerical::optimization::LM_optimization::LevenbergMarquardtOptimizer;
//! use RustedLSQ::numerical::optimization::LSQ_base::LeastSquaresOptimum;
//! use RustedLSQ::numerical::optimization::problem_LSQ::{FnModel, LeastSquaresProblem};
//! use RustedLSQ::numerical::optimization::LeastSquaresOptimizer;
//! use nalgebra::{DMatrix, DVector};
//! // fit y = a*exp(b*t)
//! let t = vec![0.0, 1.0, 2.0, 3.0];
//! let y = vec![2.0, 2.7, 3.6, 4.9];
//! let t2 = t.clone();
//! let model = FnModel::new(
//!     move |p: &DVector<f64>| DVector::from_iterator(t.len(), t.iter().map(|ti| p[0] * (p[1] * ti).exp())),
//!     move |p: &DVector<f64>| {
//!         DMatrix::from_fn(t2.len(), 2, |i, j| {
//!             let e = (p[1] * t2[i]).exp();
//!             if j == 0 { e } else { p[0] * t2[i] * e }
//!         })
//!     },
//! );
//! let problem = LeastSquaresProblem::new(model, DVector::from_vec(y), DVector::from_vec(vec![1.0, 0.1]));
//! let optimum = LevenbergMarquardtOptimizer::new().optimize(&problem).unwrap();
//! println!("{}", optimum.summary_table());
//! ```
use crate::numerical::optimization::LeastSquaresOptimizer;
use crate::numerical::optimization::LSQ_base::{LeastSquaresBase, LeastSquaresOptimum};
use crate::numerical::optimization::config_LSQ::SolverSettings;
use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::problem_LSQ::{
    ConvergenceChecker, LeastSquaresProblem, ModelFunction, PointVectorValuePair,
};
use crate::numerical::optimization::qr_LM::QRHouseholder;
use crate::numerical::optimization::trust_region_LM::{LMSearchBuffers, determine_lm_parameter};
use crate::numerical::optimization::utils::{enorm, epsmch};
use log::{debug, info, warn};
use nalgebra::DVector;

/// Smallest ratio of actual to predicted reduction for which a step is accepted
const MIN_ACCEPTED_RATIO: f64 = 1.0e-4;

/// Levenberg-Marquardt optimizer.
///
/// The runtime and termination behavior can be controlled by various
/// hyperparameters, see the `with_*` methods. The optional convergence
/// checker is consulted after every accepted step, in addition to the
/// built-in tolerance tests.
pub struct LevenbergMarquardtOptimizer {
    initial_step_bound_factor: f64,
    cost_relative_tolerance: f64,
    par_relative_tolerance: f64,
    ortho_tolerance: f64,
    qr_ranking_threshold: f64,
    checker: Option<Box<dyn ConvergenceChecker>>,
}

impl Default for LevenbergMarquardtOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardtOptimizer {
    pub fn new() -> Self {
        Self {
            initial_step_bound_factor: 100.0,
            cost_relative_tolerance: 1e-10,
            par_relative_tolerance: 1e-10,
            ortho_tolerance: 1e-10,
            qr_ranking_threshold: f64::MIN_POSITIVE,
            checker: None,
        }
    }

    /// Build from the `[levenberg_marquardt]` section of the settings.
    pub fn from_settings(settings: &SolverSettings) -> Self {
        let s = &settings.levenberg_marquardt;
        Self::new()
            .with_initial_step_bound_factor(s.initial_step_bound_factor)
            .with_cost_relative_tolerance(s.cost_relative_tolerance)
            .with_par_relative_tolerance(s.par_relative_tolerance)
            .with_ortho_tolerance(s.ortho_tolerance)
            .with_qr_ranking_threshold(s.qr_ranking_threshold)
    }

    /// Set factor for the initial step bound.
    ///
    /// The bound is `factor*||D*x||` for a non-zero starting point, else the
    /// factor itself. In most cases it should lie in `[0.1, 100]`.
    ///
    /// # Panics
    ///
    /// Panics if `factor <= 0`.
    #[must_use]
    pub fn with_initial_step_bound_factor(self, factor: f64) -> Self {
        assert!(factor > 0.0, "initial step bound factor must be > 0");
        Self {
            initial_step_bound_factor: factor,
            ..self
        }
    }

    /// Desired relative error in the cost.
    ///
    /// Convergence is declared when both the actual and the predicted
    /// relative reductions of the cost are at most this tolerance.
    ///
    /// # Panics
    ///
    /// Panics if the tolerance is negative.
    #[must_use]
    pub fn with_cost_relative_tolerance(self, tolerance: f64) -> Self {
        assert!(!tolerance.is_sign_negative(), "cost tolerance must be >= 0");
        Self {
            cost_relative_tolerance: tolerance,
            ..self
        }
    }

    /// Desired relative error in the parameters, compared with
    /// `delta / ||D*x||`.
    ///
    /// # Panics
    ///
    /// Panics if the tolerance is negative.
    #[must_use]
    pub fn with_par_relative_tolerance(self, tolerance: f64) -> Self {
        assert!(!tolerance.is_sign_negative(), "parameter tolerance must be >= 0");
        Self {
            par_relative_tolerance: tolerance,
            ..self
        }
    }

    /// Desired orthogonality between the residual vector and the Jacobian
    /// columns.
    ///
    /// The optimizer stops before computing a step when
    /// ```math
    ///   \max_j \frac{|(\mathbf{J}^\top \vec{r})_j|}{\|\mathbf{J}\vec{e}_j\|\,\text{cost}} \leq \texttt{tol}.
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the tolerance is negative.
    #[must_use]
    pub fn with_ortho_tolerance(self, tolerance: f64) -> Self {
        assert!(!tolerance.is_sign_negative(), "orthogonality tolerance must be >= 0");
        Self {
            ortho_tolerance: tolerance,
            ..self
        }
    }

    /// Squared column norm at or below which the QR factorization declares
    /// the remaining columns rank deficient.
    ///
    /// The default `f64::MIN_POSITIVE` only catches columns that cancel
    /// exactly. Linearly dependent columns usually leave a rounding residue
    /// after the Householder reflections, so a Jacobian that is known to be
    /// rank deficient needs a threshold such as `1e-20`; otherwise the
    /// null-space component of the point drifts.
    ///
    /// # Panics
    ///
    /// Panics if the threshold is negative.
    #[must_use]
    pub fn with_qr_ranking_threshold(self, threshold: f64) -> Self {
        assert!(!threshold.is_sign_negative(), "ranking threshold must be >= 0");
        Self {
            qr_ranking_threshold: threshold,
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

    pub fn initial_step_bound_factor(&self) -> f64 {
        self.initial_step_bound_factor
    }

    pub fn cost_relative_tolerance(&self) -> f64 {
        self.cost_relative_tolerance
    }

    pub fn par_relative_tolerance(&self) -> f64 {
        self.par_relative_tolerance
    }

    pub fn ortho_tolerance(&self) -> f64 {
        self.ortho_tolerance
    }

    pub fn qr_ranking_threshold(&self) -> f64 {
        self.qr_ranking_threshold
    }

    /// Largest cosine of the angle between the weighted residuals and a
    /// column of the weighted Jacobian.
    fn max_cosine(&self, ws: &LMWorkspace, cost: f64) -> f64 {
        let mut max_cosine: f64 = 0.0;
        if cost == 0.0 {
            return max_cosine;
        }
        let permutation = ws.qr.permutation();
        for j in 0..ws.qr.solved_cols() {
            let pj = permutation[j];
            let s = ws.qr.jac_norm()[pj];
            if s != 0.0 {
                let mut sum = 0.0;
                for i in 0..=j {
                    sum += ws.qr.r(i, j) * ws.qtf[i];
                }
                max_cosine = max_cosine.max(sum.abs() / (s * cost));
            }
        }
        max_cosine
    }

    /// Outer and inner iterations. Returns once one of the convergence tests
    /// passes; `state` then holds the result.
    fn iterate<M: ModelFunction>(
        &self,
        base: &mut LeastSquaresBase<'_, M>,
        state: &mut LMState,
        ws: &mut LMWorkspace,
    ) -> LSQResult<()> {
        let n = base.cols();
        let solved_cols = ws.qr.solved_cols();
        loop {
            state.iterations += 1;
            let previous = state.pair();

            // QR decomposition of the jacobian and Q^T * weighted residuals
            let weighted_jacobian = base.compute_weighted_jacobian(&state.point)?;
            ws.qr.factorize(&weighted_jacobian)?;
            ws.qtf.gemv(1.0, base.weight_sqrt(), &state.residuals, 0.0);
            ws.qr.q_t_y(&mut ws.qtf);
            ws.qr.store_r_diagonal();

            if state.first_iteration {
                // scale the point according to the norms of the columns
                // of the initial jacobian
                for k in 0..n {
                    let dk = ws.qr.jac_norm()[k];
                    ws.diag[k] = if dk == 0.0 { 1.0 } else { dk };
                }
                state.x_norm = enorm(&state.point.component_mul(&ws.diag));
                state.delta = if state.x_norm == 0.0 {
                    self.initial_step_bound_factor
                } else {
                    self.initial_step_bound_factor * state.x_norm
                };
            }

            let max_cosine = self.max_cosine(ws, state.cost);
            if max_cosine <= self.ortho_tolerance {
                info!(
                    "residuals orthogonal to the jacobian columns (max cosine {:e})",
                    max_cosine
                );
                return Ok(());
            }

            for j in 0..n {
                ws.diag[j] = ws.diag[j].max(ws.qr.jac_norm()[j]);
            }

            let mut ratio = 0.0;
            while ratio < MIN_ACCEPTED_RATIO {
                let previous_cost = state.save(ws);

                state.lm_par = determine_lm_parameter(
                    &mut ws.qr,
                    &ws.qtf,
                    state.delta,
                    &ws.diag,
                    state.lm_par,
                    &mut ws.search,
                    &mut ws.lm_dir,
                )?;

                // new point and norm of the evolution direction
                let permutation = ws.qr.permutation();
                let mut lm_norm = 0.0;
                for j in 0..solved_cols {
                    let pj = permutation[j];
                    ws.lm_dir[pj] = -ws.lm_dir[pj];
                    state.point[pj] = ws.old_x[pj] + ws.lm_dir[pj];
                    let s = ws.diag[pj] * ws.lm_dir[pj];
                    lm_norm += s * s;
                }
                let lm_norm = lm_norm.sqrt();
                if !lm_norm.is_finite() {
                    return Err(OptimizationError::Numerical("step norm is not finite"));
                }
                if state.first_iteration {
                    state.delta = state.delta.min(lm_norm);
                }

                state.evaluate(base)?;

                // scaled actual reduction
                let act_red = if 0.1 * state.cost < previous_cost {
                    let r = state.cost / previous_cost;
                    1.0 - r * r
                } else {
                    -1.0
                };

                // scaled predicted reduction and directional derivative
                let work1 = &mut ws.search.work1;
                for j in 0..solved_cols {
                    let dir_j = ws.lm_dir[permutation[j]];
                    work1[j] = 0.0;
                    for i in 0..=j {
                        work1[i] += ws.qr.r(i, j) * dir_j;
                    }
                }
                let mut coeff1 = 0.0;
                for j in 0..solved_cols {
                    coeff1 += work1[j] * work1[j];
                }
                let pc2 = previous_cost * previous_cost;
                coeff1 /= pc2;
                let coeff2 = state.lm_par * lm_norm * lm_norm / pc2;
                let pre_red = coeff1 + 2.0 * coeff2;
                let dir_der = -(coeff1 + coeff2);

                ratio = if pre_red == 0.0 { 0.0 } else { act_red / pre_red };

                // update the step bound
                if ratio <= 0.25 {
                    let mut tmp = if act_red < 0.0 {
                        0.5 * dir_der / (dir_der + 0.5 * act_red)
                    } else {
                        0.5
                    };
                    if 0.1 * state.cost >= previous_cost || tmp < 0.1 {
                        tmp = 0.1;
                    }
                    state.delta = tmp * state.delta.min(10.0 * lm_norm);
                    state.lm_par /= tmp;
                } else if state.lm_par == 0.0 || ratio >= 0.75 {
                    state.delta = 2.0 * lm_norm;
                    state.lm_par *= 0.5;
                }
                debug!(
                    "iteration {}: cost {:e}, ratio {:e}, delta {:e}, lm_par {:e}",
                    state.iterations, state.cost, ratio, state.delta, state.lm_par
                );

                if ratio >= MIN_ACCEPTED_RATIO {
                    state.first_iteration = false;
                    state.x_norm = enorm(&state.point.component_mul(&ws.diag));
                    if let Some(checker) = &self.checker {
                        if checker.converged(state.iterations, &previous, &state.pair()) {
                            info!("convergence checker satisfied");
                            return Ok(());
                        }
                    }
                } else {
                    warn!(
                        "step rejected (ratio {:e}), cost {:e} -> {:e}",
                        ratio, previous_cost, state.cost
                    );
                    state.restore(ws, previous_cost);
                }

                // default convergence criteria
                let cost_converged = act_red.abs() <= self.cost_relative_tolerance
                    && pre_red <= self.cost_relative_tolerance
                    && ratio <= 2.0;
                if cost_converged || state.delta <= self.par_relative_tolerance * state.x_norm {
                    info!(
                        "converged: relative cost change {:e}, relative step {:e}",
                        act_red.abs(),
                        state.delta / state.x_norm
                    );
                    return Ok(());
                }

                // tolerances that cannot be met in floating point
                let eps = epsmch();
                if act_red.abs() <= eps && pre_red <= eps && ratio <= 2.0 {
                    return Err(OptimizationError::TooSmallCostRelativeTolerance(
                        self.cost_relative_tolerance,
                    ));
                } else if state.delta <= eps * state.x_norm {
                    return Err(OptimizationError::TooSmallParametersRelativeTolerance(
                        self.par_relative_tolerance,
                    ));
                } else if max_cosine <= eps {
                    return Err(OptimizationError::TooSmallOrthogonalityTolerance(
                        self.ortho_tolerance,
                    ));
                }
            }
        }
    }
}

impl LeastSquaresOptimizer for LevenbergMarquardtOptimizer {
    fn optimize<M: ModelFunction>(
        &self,
        problem: &LeastSquaresProblem<M>,
    ) -> LSQResult<LeastSquaresOptimum> {
        let mut base = LeastSquaresBase::new(problem)?;
        base.check_parameters()?;
        let (m, n) = (base.rows(), base.cols());
        info!(
            "{}: {} observations, {} parameters",
            self.name(),
            m,
            n
        );
        let mut ws = LMWorkspace::new(m, n, self.qr_ranking_threshold);
        let mut state = LMState::new(&mut base, problem.start_point().clone())?;
        if let Err(e) = self.iterate(&mut base, &mut state, &mut ws) {
            warn!("{} failed after {} iterations: {}", self.name(), state.iterations, e);
            return Err(e);
        }

        let weighted_jacobian = base.compute_weighted_jacobian(&state.point)?;
        let optimum = base.optimum(
            self.name(),
            state.point,
            state.objective,
            state.residuals,
            weighted_jacobian,
            state.iterations,
        );
        info!("\n{}", optimum.summary_table());
        Ok(optimum)
    }

    fn name(&self) -> &'static str {
        "Levenberg-Marquardt"
    }
}

/// Buffers of one solve, sized once for an `m x n` problem and reused by
/// all iterations. Rollback swaps them with the state instead of copying.
pub struct LMWorkspace {
    pub(crate) qr: QRHouseholder,
    pub(crate) search: LMSearchBuffers,
    /// scaling of the parameters, `D`
    pub(crate) diag: DVector<f64>,
    pub(crate) lm_dir: DVector<f64>,
    pub(crate) old_x: DVector<f64>,
    pub(crate) old_res: DVector<f64>,
    pub(crate) old_obj: DVector<f64>,
    /// `Q^T * W^(1/2) * r`
    pub(crate) qtf: DVector<f64>,
}

impl LMWorkspace {
    pub fn new(m: usize, n: usize, qr_ranking_threshold: f64) -> Self {
        Self {
            qr: QRHouseholder::new(m, n, qr_ranking_threshold),
            search: LMSearchBuffers::new(n),
            diag: DVector::zeros(n),
            lm_dir: DVector::zeros(n),
            old_x: DVector::zeros(n),
            old_res: DVector::zeros(m),
            old_obj: DVector::zeros(m),
            qtf: DVector::zeros(m),
        }
    }
}

/// Iteration state of a solve.
struct LMState {
    point: DVector<f64>,
    objective: DVector<f64>,
    residuals: DVector<f64>,
    cost: f64,
    /// trust region radius
    delta: f64,
    /// damping parameter, warm start of the next parameter search
    lm_par: f64,
    /// `||D*x||`
    x_norm: f64,
    first_iteration: bool,
    iterations: usize,
}

impl LMState {
    /// Evaluate the starting point.
    fn new<M: ModelFunction>(
        base: &mut LeastSquaresBase<'_, M>,
        point: DVector<f64>,
    ) -> LSQResult<Self> {
        let objective = base.compute_objective_value(&point)?;
        let residuals = base.compute_residuals(&objective)?;
        let cost = base.compute_cost(&residuals);
        if !cost.is_finite() {
            return Err(OptimizationError::Numerical("cost at the starting point"));
        }
        Ok(Self {
            point,
            objective,
            residuals,
            cost,
            delta: 0.0,
            lm_par: 0.0,
            x_norm: 0.0,
            first_iteration: true,
            iterations: 0,
        })
    }

    fn pair(&self) -> PointVectorValuePair {
        PointVectorValuePair::new(self.point.clone(), self.objective.clone())
    }

    /// Remember the current point before a trial step, returns the current cost.
    fn save(&mut self, ws: &mut LMWorkspace) -> f64 {
        ws.old_x.copy_from(&self.point);
        std::mem::swap(&mut self.residuals, &mut ws.old_res);
        std::mem::swap(&mut self.objective, &mut ws.old_obj);
        self.cost
    }

    /// Evaluate the model at `point`. The objective value and residuals are
    /// written into the buffers already held by the state; only the vector
    /// returned by the model itself is allocated.
    fn evaluate<M: ModelFunction>(&mut self, base: &mut LeastSquaresBase<'_, M>) -> LSQResult<()> {
        let objective = base.compute_objective_value(&self.point)?;
        self.objective.copy_from(&objective);
        base.compute_residuals_into(&self.objective, &mut self.residuals)?;
        self.cost = base.compute_cost(&self.residuals);
        Ok(())
    }

    /// Undo a rejected trial step.
    fn restore(&mut self, ws: &mut LMWorkspace, previous_cost: f64) {
        self.cost = previous_cost;
        self.point.copy_from(&ws.old_x);
        std::mem::swap(&mut self.residuals, &mut ws.old_res);
        std::mem::swap(&mut self.objective, &mut ws.old_obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::optimization::problem_LSQ::FnModel;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn linear_problem() -> LeastSquaresProblem<impl ModelFunction> {
        // f(x) = [x - 3, 2x - 7]
        let model = FnModel::new(
            |x: &DVector<f64>| DVector::from_vec(vec![x[0] - 3.0, 2.0 * x[0] - 7.0]),
            |_x: &DVector<f64>| DMatrix::from_row_slice(2, 1, &[1.0, 2.0]),
        );
        LeastSquaresProblem::new(model, DVector::zeros(2), DVector::zeros(1))
    }

    #[test]
    fn test_defaults_and_builders() {
        let lm = LevenbergMarquardtOptimizer::default();
        assert_eq!(lm.initial_step_bound_factor(), 100.0);
        assert_eq!(lm.cost_relative_tolerance(), 1e-10);
        assert_eq!(lm.par_relative_tolerance(), 1e-10);
        assert_eq!(lm.ortho_tolerance(), 1e-10);
        assert_eq!(lm.qr_ranking_threshold(), f64::MIN_POSITIVE);

        let lm = lm
            .with_initial_step_bound_factor(0.1)
            .with_cost_relative_tolerance(1e-6)
            .with_par_relative_tolerance(1e-7)
            .with_ortho_tolerance(0.0)
            .with_qr_ranking_threshold(1e-20);
        assert_eq!(lm.initial_step_bound_factor(), 0.1);
        assert_eq!(lm.cost_relative_tolerance(), 1e-6);
        assert_eq!(lm.par_relative_tolerance(), 1e-7);
        assert_eq!(lm.ortho_tolerance(), 0.0);
        assert_eq!(lm.qr_ranking_threshold(), 1e-20);
    }

    #[test]
    #[should_panic(expected = "initial step bound factor must be > 0")]
    fn test_zero_step_bound_panics() {
        let _ = LevenbergMarquardtOptimizer::new().with_initial_step_bound_factor(0.0);
    }

    #[test]
    #[should_panic(expected = "cost tolerance must be >= 0")]
    fn test_negative_tolerance_panics() {
        let _ = LevenbergMarquardtOptimizer::new().with_cost_relative_tolerance(-1.0);
    }

    #[test]
    fn test_from_settings() {
        let settings = SolverSettings::from_toml_str(
            "[levenberg_marquardt]\ninitial_step_bound_factor = 1.0\northo_tolerance = 1e-8",
        )
        .unwrap();
        let lm = LevenbergMarquardtOptimizer::from_settings(&settings);
        assert_eq!(lm.initial_step_bound_factor(), 1.0);
        assert_eq!(lm.ortho_tolerance(), 1e-8);
        assert_eq!(lm.cost_relative_tolerance(), 1e-10);
    }

    #[test]
    fn test_linear_problem() {
        let problem = linear_problem();
        let optimum = LevenbergMarquardtOptimizer::new().optimize(&problem).unwrap();
        assert_relative_eq!(optimum.point[0], 3.4, epsilon = 1e-10);
        assert_relative_eq!(optimum.chi_square(), 0.2, epsilon = 1e-10);
        assert_eq!(optimum.optimizer, "Levenberg-Marquardt");
    }

    #[test]
    fn test_bounds_are_rejected_before_evaluation() {
        let calls = Rc::new(RefCell::new(0usize));
        let counter = calls.clone();
        let model = FnModel::new(
            move |x: &DVector<f64>| {
                *counter.borrow_mut() += 1;
                DVector::from_vec(vec![x[0]])
            },
            |_x: &DVector<f64>| DMatrix::from_element(1, 1, 1.0),
        );
        let problem = LeastSquaresProblem::new(model, DVector::zeros(1), DVector::zeros(1))
            .with_bounds(Some(DVector::from_vec(vec![-1.0])), None);
        let result = LevenbergMarquardtOptimizer::new().optimize(&problem);
        assert!(matches!(result, Err(OptimizationError::UnsupportedBounds)));
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_zero_residual_start_converges_immediately() {
        let model = FnModel::new(
            |x: &DVector<f64>| DVector::from_vec(vec![x[0], x[0] + x[1]]),
            |_x: &DVector<f64>| DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 1.0]),
        );
        let problem = LeastSquaresProblem::new(
            model,
            DVector::from_vec(vec![1.0, 3.0]),
            DVector::from_vec(vec![1.0, 2.0]),
        );
        let optimum = LevenbergMarquardtOptimizer::new().optimize(&problem).unwrap();
        assert_eq!(optimum.iterations, 1);
        assert_eq!(optimum.evaluations, 1);
        assert_eq!(optimum.cost, 0.0);
    }

    #[test]
    fn test_save_and_restore_roll_back_the_state() {
        let problem = linear_problem();
        let mut base = LeastSquaresBase::new(&problem).unwrap();
        let mut state = LMState::new(&mut base, DVector::zeros(1)).unwrap();
        let mut ws = LMWorkspace::new(2, 1, f64::MIN_POSITIVE);
        let point = state.point.clone();
        let objective = state.objective.clone();
        let residuals = state.residuals.clone();

        let buffers = |state: &LMState, ws: &LMWorkspace| {
            let mut ptrs = vec![
                state.objective.as_ptr(),
                state.residuals.as_ptr(),
                ws.old_obj.as_ptr(),
                ws.old_res.as_ptr(),
            ];
            ptrs.sort();
            ptrs
        };
        let before = buffers(&state, &ws);

        let previous_cost = state.save(&mut ws);
        state.point[0] = 10.0;
        state.evaluate(&mut base).unwrap();
        assert_eq!(state.objective, DVector::from_vec(vec![7.0, 13.0]));
        assert_eq!(state.residuals, DVector::from_vec(vec![-7.0, -13.0]));
        assert!(state.cost > previous_cost);
        // the trial wrote into the swapped buffers, nothing was replaced
        assert_eq!(buffers(&state, &ws), before);

        state.restore(&mut ws, previous_cost);
        assert_eq!(state.point, point);
        assert_eq!(state.objective, objective);
        assert_eq!(state.residuals, residuals);
        assert_eq!(state.cost, previous_cost);
        assert_eq!(buffers(&state, &ws), before);
    }

    #[test]
    fn test_checker_stops_the_iteration() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let checker = move |iteration: usize, _: &PointVectorValuePair, _: &PointVectorValuePair| {
            log.borrow_mut().push(iteration);
            true
        };
        // Rosenbrock needs many iterations, the checker stops after the first accepted step
        let model = FnModel::new(
            |x: &DVector<f64>| DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]),
            |x: &DVector<f64>| DMatrix::from_row_slice(2, 2, &[-20.0 * x[0], 10.0, -1.0, 0.0]),
        );
        let problem = LeastSquaresProblem::new(
            model,
            DVector::zeros(2),
            DVector::from_vec(vec![-1.2, 1.0]),
        );
        let optimum = LevenbergMarquardtOptimizer::new()
            .with_checker(checker)
            .optimize(&problem)
            .unwrap();
        assert_eq!(*seen.borrow(), vec![1]);
        assert_eq!(optimum.iterations, 1);
    }

    #[test]
    fn test_model_failure_is_propagated() {
        struct Failing;
        impl ModelFunction for Failing {
            fn value(&self, _x: &DVector<f64>) -> Option<DVector<f64>> {
                Some(DVector::from_vec(vec![1.0, 2.0]))
            }
            fn jacobian(&self, _x: &DVector<f64>) -> Option<DMatrix<f64>> {
                None
            }
        }
        let problem = LeastSquaresProblem::new(Failing, DVector::zeros(2), DVector::zeros(1));
        let result = LevenbergMarquardtOptimizer::new().optimize(&problem);
        assert!(matches!(result, Err(OptimizationError::UserFunction(_))));
    }

    #[test]
    fn test_evaluation_budget_is_enforced() {
        let model = FnModel::new(
            |x: &DVector<f64>| DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]),
            |x: &DVector<f64>| DMatrix::from_row_slice(2, 2, &[-20.0 * x[0], 10.0, -1.0, 0.0]),
        );
        let problem = LeastSquaresProblem::new(
            model,
            DVector::zeros(2),
            DVector::from_vec(vec![-1.2, 1.0]),
        )
        .with_max_evaluations(3);
        let result = LevenbergMarquardtOptimizer::new().optimize(&problem);
        assert!(matches!(result, Err(OptimizationError::TooManyEvaluations(3))));
    }
}
