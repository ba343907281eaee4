//! Fitting a parametric curve `y = f(t; p)` to weighted observations.
//!
//! [`CurveFitter`] turns the observations into a [`LeastSquaresProblem`]
//! whose target is the observed `y`, whose weight matrix is the diagonal of
//! the observation weights and whose Jacobian rows are the gradients of `f`
//! with respect to the parameters. Any [`LeastSquaresOptimizer`] can then
//! solve it.
//!
//! ```rust, ignore
//! let mut fitter = CurveFitter::new(|t: f64, p: &[f64]| p[0] * (p[1] * t).exp(), |t: f64, p: &[f64]| {
//!     let e = (p[1] * t).exp();
//!     vec![e, p[0] * t * e]
//! });
//! for (t, y) in data { fitter.add_observation(1.0, t, y); }
//! let fit = fitter.fit(&LevenbergMarquardtOptimizer::new(), &[1.0, 0.1])?;
//! println!("{:?} R^2 = {}", fit.parameters(), fit.r_squared);
//! ```
use crate::numerical::optimization::LSQ_base::LeastSquaresOptimum;
use crate::numerical::optimization::LeastSquaresOptimizer;
use crate::numerical::optimization::config_LSQ::SolverSettings;
use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::problem_LSQ::{
    DEFAULT_MAX_EVALUATIONS, LeastSquaresProblem, ModelFunction,
};
use log::info;
use nalgebra::{DMatrix, DVector};

/// Curve `y = f(t; p)` with its gradient `df/dp`.
pub trait ParametricFunction {
    fn value(&self, t: f64, parameters: &[f64]) -> f64;
    fn gradient(&self, t: f64, parameters: &[f64]) -> Vec<f64>;
}

/// Closure pair `(value, gradient)`
impl<V, G> ParametricFunction for (V, G)
where
    V: Fn(f64, &[f64]) -> f64,
    G: Fn(f64, &[f64]) -> Vec<f64>,
{
    fn value(&self, t: f64, parameters: &[f64]) -> f64 {
        (self.0)(t, parameters)
    }

    fn gradient(&self, t: f64, parameters: &[f64]) -> Vec<f64> {
        (self.1)(t, parameters)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedObservation {
    pub weight: f64,
    pub t: f64,
    pub y: f64,
}

/// Evaluates the curve at every observation abscissa.
struct CurveModel<'a, F: ParametricFunction> {
    function: &'a F,
    observations: &'a [WeightedObservation],
}

impl<F: ParametricFunction> ModelFunction for CurveModel<'_, F> {
    fn value(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let p = x.as_slice();
        let values: Vec<f64> = self
            .observations
            .iter()
            .map(|o| self.function.value(o.t, p))
            .collect();
        Some(DVector::from_vec(values))
    }

    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        let p = x.as_slice();
        let mut jacobian = DMatrix::zeros(self.observations.len(), p.len());
        for (i, o) in self.observations.iter().enumerate() {
            let gradient = self.function.gradient(o.t, p);
            // a gradient of the wrong length is a broken model, not a fit failure
            if gradient.len() != p.len() {
                return None;
            }
            for (j, g) in gradient.into_iter().enumerate() {
                jacobian[(i, j)] = g;
            }
        }
        Some(jacobian)
    }
}

pub struct CurveFitter<F: ParametricFunction> {
    function: F,
    observations: Vec<WeightedObservation>,
    max_evaluations: usize,
}

impl<V, G> CurveFitter<(V, G)>
where
    V: Fn(f64, &[f64]) -> f64,
    G: Fn(f64, &[f64]) -> Vec<f64>,
{
    pub fn new(value: V, gradient: G) -> Self {
        Self::with_function((value, gradient))
    }
}

impl<F: ParametricFunction> CurveFitter<F> {
    pub fn with_function(function: F) -> Self {
        Self {
            function,
            observations: Vec::new(),
            max_evaluations: DEFAULT_MAX_EVALUATIONS,
        }
    }

    /// Takes the evaluation budget from the `[problem]` section.
    #[must_use]
    pub fn with_settings(self, settings: &SolverSettings) -> Self {
        self.with_max_evaluations(settings.max_evaluations)
    }

    #[must_use]
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        assert!(max_evaluations > 0, "max evaluations must be > 0");
        self.max_evaluations = max_evaluations;
        self
    }

    pub fn add_observation(&mut self, weight: f64, t: f64, y: f64) {
        self.observations.push(WeightedObservation { weight, t, y });
    }

    /// Unit-weight observations from paired slices.
    pub fn add_observations(&mut self, t: &[f64], y: &[f64]) {
        for (&ti, &yi) in t.iter().zip(y.iter()) {
            self.add_observation(1.0, ti, yi);
        }
    }

    pub fn clear_observations(&mut self) {
        self.observations.clear();
    }

    pub fn observations(&self) -> &[WeightedObservation] {
        &self.observations
    }

    pub fn fit<O: LeastSquaresOptimizer>(
        &self,
        optimizer: &O,
        initial_guess: &[f64],
    ) -> LSQResult<CurveFit> {
        if initial_guess.is_empty() {
            return Err(OptimizationError::NoParameters);
        }
        if self.observations.is_empty() {
            return Err(OptimizationError::NoObservations);
        }
        let model = CurveModel {
            function: &self.function,
            observations: &self.observations,
        };
        let target = DVector::from_iterator(
            self.observations.len(),
            self.observations.iter().map(|o| o.y),
        );
        let weights: Vec<f64> = self.observations.iter().map(|o| o.weight).collect();
        let problem = LeastSquaresProblem::new(model, target, DVector::from_column_slice(initial_guess))
            .with_diagonal_weights(&weights)
            .with_max_evaluations(self.max_evaluations);

        let optimum = optimizer.optimize(&problem)?;
        let predicted: Vec<f64> = optimum.value.iter().copied().collect();
        let observed: Vec<f64> = self.observations.iter().map(|o| o.y).collect();
        let r_squared = r_squared(&observed, &predicted);
        info!(
            "{} fit of {} observations: parameters {:?}, R^2 = {}",
            optimizer.name(),
            self.observations.len(),
            optimum.point.as_slice(),
            r_squared
        );
        Ok(CurveFit { optimum, r_squared })
    }
}

/// Fitted parameters with the statistics of the underlying solve.
#[derive(Debug, Clone)]
pub struct CurveFit {
    pub optimum: LeastSquaresOptimum,
    pub r_squared: f64,
}

impl CurveFit {
    pub fn parameters(&self) -> &[f64] {
        self.optimum.point.as_slice()
    }
}

/// Coefficient of determination `1 - SS_res / SS_tot`.
///
/// Constant data has `SS_tot = 0`; the result is then `1` for a perfect fit
/// and `-inf` otherwise.
pub fn r_squared(observed: &[f64], predicted: &[f64]) -> f64 {
    let mean = observed.iter().sum::<f64>() / observed.len() as f64;
    let ss_tot = observed.iter().map(|y| (y - mean).powi(2)).sum::<f64>();
    let ss_res = observed
        .iter()
        .zip(predicted.iter())
        .map(|(y, y_pred)| (y - y_pred).powi(2))
        .sum::<f64>();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { f64::NEG_INFINITY };
    }
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::optimization::LM_optimization::LevenbergMarquardtOptimizer;
    use crate::numerical::optimization::gauss_newton::GaussNewtonOptimizer;
    use crate::numerical::optimization::problem_LSQ::SimpleVectorValueChecker;
    use approx::assert_relative_eq;

    fn exponential() -> CurveFitter<impl ParametricFunction> {
        CurveFitter::new(
            |t: f64, p: &[f64]| p[0] * (p[1] * t).exp(),
            |t: f64, p: &[f64]| {
                let e = (p[1] * t).exp();
                vec![e, p[0] * t * e]
            },
        )
    }

    fn exact_data() -> (Vec<f64>, Vec<f64>) {
        let t: Vec<f64> = (0..6).map(|i| i as f64).collect();
        let y = t.iter().map(|ti| 2.0 * (0.3 * ti).exp()).collect();
        (t, y)
    }

    #[test]
    fn test_exponential_fit_lm() {
        let (t, y) = exact_data();
        let mut fitter = exponential();
        fitter.add_observations(&t, &y);
        let fit = fitter
            .fit(&LevenbergMarquardtOptimizer::new(), &[1.0, 0.1])
            .unwrap();
        assert_relative_eq!(fit.parameters()[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(fit.parameters()[1], 0.3, epsilon = 1e-8);
        assert_relative_eq!(fit.r_squared, 1.0, epsilon = 1e-12);
        assert!(fit.optimum.cost < 1e-8);
    }

    #[test]
    fn test_weighted_fit_lm() {
        let (t, y) = exact_data();
        let mut fitter = exponential();
        for (i, (&ti, &yi)) in t.iter().zip(y.iter()).enumerate() {
            fitter.add_observation((i + 1) as f64, ti, yi);
        }
        let fit = fitter
            .fit(&LevenbergMarquardtOptimizer::new(), &[1.0, 0.1])
            .unwrap();
        assert_relative_eq!(fit.parameters()[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(fit.parameters()[1], 0.3, epsilon = 1e-8);
    }

    #[test]
    fn test_noisy_fit_lm_and_gn_agree() {
        let (t, y) = exact_data();
        let noise = [0.01, -0.02, 0.015, -0.01, 0.02, -0.005];
        let mut fitter = exponential();
        for i in 0..t.len() {
            fitter.add_observation(1.0, t[i], y[i] + noise[i]);
        }
        let lm = fitter
            .fit(&LevenbergMarquardtOptimizer::new(), &[1.0, 0.1])
            .unwrap();
        assert_relative_eq!(lm.parameters()[0], 2.00124, epsilon = 1e-4);
        assert_relative_eq!(lm.parameters()[1], 0.29993, epsilon = 1e-4);
        assert!(lm.r_squared > 0.999 && lm.r_squared < 1.0);
        assert!(lm.optimum.reduced_chi_square().is_some());

        let gn = GaussNewtonOptimizer::new()
            .with_checker(SimpleVectorValueChecker::new(1e-12, 1e-14).with_max_iterations(100));
        let gn = fitter.fit(&gn, &[1.9, 0.28]).unwrap();
        assert_relative_eq!(gn.parameters()[0], lm.parameters()[0], epsilon = 1e-6);
        assert_relative_eq!(gn.parameters()[1], lm.parameters()[1], epsilon = 1e-6);
    }

    #[test]
    fn test_empty_inputs() {
        let fitter = exponential();
        assert!(matches!(
            fitter.fit(&LevenbergMarquardtOptimizer::new(), &[1.0, 0.1]),
            Err(OptimizationError::NoObservations)
        ));
        let (t, y) = exact_data();
        let mut fitter = exponential();
        fitter.add_observations(&t, &y);
        assert!(matches!(
            fitter.fit(&LevenbergMarquardtOptimizer::new(), &[]),
            Err(OptimizationError::NoParameters)
        ));
        fitter.clear_observations();
        assert!(fitter.observations().is_empty());
    }

    #[test]
    fn test_wrong_gradient_length() {
        let mut fitter = CurveFitter::new(
            |t: f64, p: &[f64]| p[0] + p[1] * t,
            |_t: f64, _p: &[f64]| vec![1.0],
        );
        fitter.add_observations(&[0.0, 1.0, 2.0], &[1.0, 2.0, 3.0]);
        let result = fitter.fit(&LevenbergMarquardtOptimizer::new(), &[0.0, 0.0]);
        assert!(matches!(result, Err(OptimizationError::UserFunction(_))));
    }

    #[test]
    fn test_evaluation_budget_from_settings() {
        let settings = SolverSettings::from_toml_str("[problem]\nmax_evaluations = 2").unwrap();
        let (t, y) = exact_data();
        let mut fitter = exponential().with_settings(&settings);
        fitter.add_observations(&t, &y);
        let result = fitter.fit(&LevenbergMarquardtOptimizer::new(), &[1.0, 0.1]);
        assert!(matches!(result, Err(OptimizationError::TooManyEvaluations(2))));
    }

    #[test]
    fn test_r_squared() {
        let observed = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(r_squared(&observed, &observed), 1.0);
        let mean = [2.5; 4];
        assert_relative_eq!(r_squared(&observed, &mean), 0.0);
        assert_eq!(r_squared(&[1.0, 1.0], &[1.0, 1.0]), 1.0);
        assert_eq!(r_squared(&[1.0, 1.0], &[1.0, 2.0]), f64::NEG_INFINITY);
    }
}
