use nalgebra::{DMatrix, DVector};

/// Default cap on objective function evaluations per solve
pub const DEFAULT_MAX_EVALUATIONS: usize = 10_000;

/// A vector valued model `f: R^n -> R^m` together with its Jacobian.
///
/// The least squares engine fits `f(x)` against a target vector, so the
/// model does not know about the target and the residuals. Returning `None`
/// reports that the model could not be evaluated at `x`; the solve is then
/// aborted with [`OptimizationError::UserFunction`](super::error_LSQ::OptimizationError::UserFunction).
pub trait ModelFunction {
    /// Compute `f(x)`, a vector of length `m`.
    fn value(&self, x: &DVector<f64>) -> Option<DVector<f64>>;

    /// Compute the `m x n` Jacobian `J_ij = df_i/dx_j`.
    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>>;
}

impl<M: ModelFunction + ?Sized> ModelFunction for &M {
    fn value(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        (**self).value(x)
    }

    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        (**self).jacobian(x)
    }
}

/// Model built from two closures, for problems that do not need their own type.
pub struct FnModel<F, J>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
    J: Fn(&DVector<f64>) -> DMatrix<f64>,
{
    value_fn: F,
    jacobian_fn: J,
}

impl<F, J> FnModel<F, J>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
    J: Fn(&DVector<f64>) -> DMatrix<f64>,
{
    pub fn new(value_fn: F, jacobian_fn: J) -> Self {
        Self {
            value_fn,
            jacobian_fn,
        }
    }
}

impl<F, J> ModelFunction for FnModel<F, J>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
    J: Fn(&DVector<f64>) -> DMatrix<f64>,
{
    fn value(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        Some((self.value_fn)(x))
    }

    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        Some((self.jacobian_fn)(x))
    }
}

/// A parameter vector and the model value at that point
#[derive(Debug, Clone, PartialEq)]
pub struct PointVectorValuePair {
    pub point: DVector<f64>,
    pub value: DVector<f64>,
}

impl PointVectorValuePair {
    pub fn new(point: DVector<f64>, value: DVector<f64>) -> Self {
        Self { point, value }
    }
}

/// Decides whether two successive iterates are close enough to stop.
pub trait ConvergenceChecker {
    fn converged(
        &self,
        iteration: usize,
        previous: &PointVectorValuePair,
        current: &PointVectorValuePair,
    ) -> bool;
}

impl<F> ConvergenceChecker for F
where
    F: Fn(usize, &PointVectorValuePair, &PointVectorValuePair) -> bool,
{
    fn converged(
        &self,
        iteration: usize,
        previous: &PointVectorValuePair,
        current: &PointVectorValuePair,
    ) -> bool {
        self(iteration, previous, current)
    }
}

fn components_close(p: &DVector<f64>, c: &DVector<f64>, relative: f64, absolute: f64) -> bool {
    if p.len() != c.len() {
        return false;
    }
    p.iter().zip(c.iter()).all(|(pi, ci)| {
        let difference = (pi - ci).abs();
        let size = pi.abs().max(ci.abs());
        difference <= size * relative || difference <= absolute
    })
}

/// Compares the objective values of two iterates component by component.
///
/// Two values are considered converged when for every `i`
/// `|p_i - c_i| <= max(relative * max(|p_i|, |c_i|), absolute)`.
/// With `max_iterations` set the checker also reports convergence once the
/// iteration count reaches that number.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleVectorValueChecker {
    pub relative_threshold: f64,
    pub absolute_threshold: f64,
    pub max_iterations: Option<usize>,
}

impl SimpleVectorValueChecker {
    pub fn new(relative_threshold: f64, absolute_threshold: f64) -> Self {
        assert!(
            relative_threshold >= 0.0 && absolute_threshold >= 0.0,
            "thresholds must be non-negative"
        );
        Self {
            relative_threshold,
            absolute_threshold,
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        assert!(max_iterations > 0, "max_iterations must be > 0");
        self.max_iterations = Some(max_iterations);
        self
    }
}

impl ConvergenceChecker for SimpleVectorValueChecker {
    fn converged(
        &self,
        iteration: usize,
        previous: &PointVectorValuePair,
        current: &PointVectorValuePair,
    ) -> bool {
        if let Some(max) = self.max_iterations {
            if iteration >= max {
                return true;
            }
        }
        components_close(
            &previous.value,
            &current.value,
            self.relative_threshold,
            self.absolute_threshold,
        )
    }
}

/// Same test as [`SimpleVectorValueChecker`], applied to the parameter vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct SimplePointChecker {
    pub relative_threshold: f64,
    pub absolute_threshold: f64,
    pub max_iterations: Option<usize>,
}

impl SimplePointChecker {
    pub fn new(relative_threshold: f64, absolute_threshold: f64) -> Self {
        assert!(
            relative_threshold >= 0.0 && absolute_threshold >= 0.0,
            "thresholds must be non-negative"
        );
        Self {
            relative_threshold,
            absolute_threshold,
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        assert!(max_iterations > 0, "max_iterations must be > 0");
        self.max_iterations = Some(max_iterations);
        self
    }
}

impl ConvergenceChecker for SimplePointChecker {
    fn converged(
        &self,
        iteration: usize,
        previous: &PointVectorValuePair,
        current: &PointVectorValuePair,
    ) -> bool {
        if let Some(max) = self.max_iterations {
            if iteration >= max {
                return true;
            }
        }
        components_close(
            &previous.point,
            &current.point,
            self.relative_threshold,
            self.absolute_threshold,
        )
    }
}

/// Everything a solver needs to know about one fit: the model, the observed
/// target, the starting point and the optional weights, bounds and budget.
pub struct LeastSquaresProblem<M: ModelFunction> {
    model: M,
    target: DVector<f64>,
    start: DVector<f64>,
    weight: Option<DMatrix<f64>>,
    lower_bound: Option<DVector<f64>>,
    upper_bound: Option<DVector<f64>>,
    max_evaluations: usize,
}

impl<M: ModelFunction> LeastSquaresProblem<M> {
    pub fn new(model: M, target: DVector<f64>, start: DVector<f64>) -> Self {
        Self {
            model,
            target,
            start,
            weight: None,
            lower_bound: None,
            upper_bound: None,
            max_evaluations: DEFAULT_MAX_EVALUATIONS,
        }
    }

    /// Symmetric positive semi-definite `m x m` weight matrix.
    pub fn with_weight(mut self, weight: DMatrix<f64>) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Diagonal weight matrix built from one weight per observation.
    pub fn with_diagonal_weights(mut self, weights: &[f64]) -> Self {
        self.weight = Some(DMatrix::from_diagonal(&DVector::from_column_slice(
            weights,
        )));
        self
    }

    /// Box constraints. None of the solvers in this crate support them, they
    /// are rejected before the first iteration.
    pub fn with_bounds(mut self, lower: Option<DVector<f64>>, upper: Option<DVector<f64>>) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        assert!(max_evaluations > 0, "max_evaluations must be > 0");
        self.max_evaluations = max_evaluations;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn target(&self) -> &DVector<f64> {
        &self.target
    }

    pub fn start_point(&self) -> &DVector<f64> {
        &self.start
    }

    pub fn weight(&self) -> Option<&DMatrix<f64>> {
        self.weight.as_ref()
    }

    pub fn lower_bound(&self) -> Option<&DVector<f64>> {
        self.lower_bound.as_ref()
    }

    pub fn upper_bound(&self) -> Option<&DVector<f64>> {
        self.upper_bound.as_ref()
    }

    pub fn max_evaluations(&self) -> usize {
        self.max_evaluations
    }
}
