use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::problem_LSQ::{LeastSquaresProblem, ModelFunction};
use crate::somelinalg::LinearAlgebraError;
use crate::somelinalg::some_matrix_inv::{inverse_rank_revealing, matrix_sqrt};
use log::{debug, error};
use nalgebra::{DMatrix, DVector};
use tabled::{builder::Builder, settings::Style};

/// `(J~^T J~)^-1` for an already weighted Jacobian `J~ = W^(1/2) J`.
pub fn covariance_from_weighted_jacobian(
    weighted_jacobian: &DMatrix<f64>,
    threshold: f64,
) -> LSQResult<DMatrix<f64>> {
    let jtj = weighted_jacobian.transpose() * weighted_jacobian;
    inverse_rank_revealing(&jtj, threshold).map_err(|e| match e {
        LinearAlgebraError::Singular => OptimizationError::SingularMatrix,
        other => OptimizationError::Linear(other),
    })
}

/// Weighted residual and cost evaluator shared by the solvers.
///
/// One instance lives for exactly one solve: it borrows the problem, caches
/// the square root of the weight matrix and counts evaluations.
pub struct LeastSquaresBase<'a, M: ModelFunction> {
    problem: &'a LeastSquaresProblem<M>,
    weight: DMatrix<f64>,
    weight_sqrt: DMatrix<f64>,
    rows: usize,
    cols: usize,
    evaluations: usize,
    jacobian_evaluations: usize,
}

impl<'a, M: ModelFunction> LeastSquaresBase<'a, M> {
    pub fn new(problem: &'a LeastSquaresProblem<M>) -> LSQResult<Self> {
        let cols = problem.start_point().len();
        let rows = problem.target().len();
        if cols == 0 {
            return Err(OptimizationError::NoParameters);
        }
        if rows == 0 {
            return Err(OptimizationError::NoObservations);
        }
        let weight = match problem.weight() {
            Some(w) => {
                if w.nrows() != rows {
                    return Err(OptimizationError::DimensionMismatch {
                        what: "weight matrix rows",
                        expected: rows,
                        found: w.nrows(),
                    });
                }
                if w.ncols() != rows {
                    return Err(OptimizationError::DimensionMismatch {
                        what: "weight matrix columns",
                        expected: rows,
                        found: w.ncols(),
                    });
                }
                w.clone()
            }
            None => DMatrix::identity(rows, rows),
        };
        let weight_sqrt = matrix_sqrt(&weight)?;
        Ok(Self {
            problem,
            weight,
            weight_sqrt,
            rows,
            cols,
            evaluations: 0,
            jacobian_evaluations: 0,
        })
    }

    /// Reject bound constraints, which no solver here supports.
    pub fn check_parameters(&self) -> LSQResult<()> {
        if self.problem.lower_bound().is_some() || self.problem.upper_bound().is_some() {
            error!("bound constraints are not supported");
            return Err(OptimizationError::UnsupportedBounds);
        }
        Ok(())
    }

    /// Evaluate the model at `x`, counting the call against the budget.
    pub fn compute_objective_value(&mut self, x: &DVector<f64>) -> LSQResult<DVector<f64>> {
        self.evaluations += 1;
        let max = self.problem.max_evaluations();
        if self.evaluations > max {
            return Err(OptimizationError::TooManyEvaluations(max));
        }
        let value = self
            .problem
            .model()
            .value(x)
            .ok_or(OptimizationError::UserFunction("objective function returned None"))?;
        if value.len() != self.rows {
            return Err(OptimizationError::DimensionMismatch {
                what: "objective value length",
                expected: self.rows,
                found: value.len(),
            });
        }
        Ok(value)
    }

    /// `t - f`
    pub fn compute_residuals(&self, objective_value: &DVector<f64>) -> LSQResult<DVector<f64>> {
        let target = self.problem.target();
        if objective_value.len() != target.len() {
            return Err(OptimizationError::DimensionMismatch {
                what: "objective value length",
                expected: target.len(),
                found: objective_value.len(),
            });
        }
        Ok(target - objective_value)
    }

    /// `t - f` written into `out`, which must already have length `m`.
    pub fn compute_residuals_into(
        &self,
        objective_value: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> LSQResult<()> {
        let target = self.problem.target();
        if objective_value.len() != target.len() || out.len() != target.len() {
            return Err(OptimizationError::DimensionMismatch {
                what: "objective value length",
                expected: target.len(),
                found: objective_value.len().min(out.len()),
            });
        }
        out.copy_from(target);
        *out -= objective_value;
        Ok(())
    }

    /// `sqrt(r^T W r)`
    pub fn compute_cost(&self, residuals: &DVector<f64>) -> f64 {
        let quadratic = residuals.dot(&(&self.weight * residuals));
        quadratic.max(0.0).sqrt()
    }

    /// `W^(1/2) r`
    pub fn weighted_residuals(&self, residuals: &DVector<f64>) -> DVector<f64> {
        &self.weight_sqrt * residuals
    }

    /// `W^(1/2) J(x)`
    pub fn compute_weighted_jacobian(&mut self, x: &DVector<f64>) -> LSQResult<DMatrix<f64>> {
        self.jacobian_evaluations += 1;
        let jacobian = self
            .problem
            .model()
            .jacobian(x)
            .ok_or(OptimizationError::UserFunction("jacobian returned None"))?;
        if jacobian.nrows() != self.rows {
            return Err(OptimizationError::DimensionMismatch {
                what: "jacobian rows",
                expected: self.rows,
                found: jacobian.nrows(),
            });
        }
        if jacobian.ncols() != self.cols {
            return Err(OptimizationError::DimensionMismatch {
                what: "jacobian columns",
                expected: self.cols,
                found: jacobian.ncols(),
            });
        }
        Ok(&self.weight_sqrt * jacobian)
    }

    /// Covariance matrix of the parameters at `x`.
    ///
    /// `threshold` is the singularity threshold of the rank revealing
    /// inversion of `J~^T J~`.
    pub fn compute_covariances(
        &mut self,
        x: &DVector<f64>,
        threshold: f64,
    ) -> LSQResult<DMatrix<f64>> {
        let j = self.compute_weighted_jacobian(x)?;
        covariance_from_weighted_jacobian(&j, threshold)
    }

    /// Square roots of the covariance diagonal, one per parameter.
    pub fn compute_sigma(&mut self, x: &DVector<f64>, threshold: f64) -> LSQResult<DVector<f64>> {
        let covariances = self.compute_covariances(x, threshold)?;
        Ok(covariances.diagonal().map(|c| c.sqrt()))
    }

    pub fn problem(&self) -> &LeastSquaresProblem<M> {
        self.problem
    }

    /// Number of observations `m`
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of parameters `n`
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn jacobian_evaluations(&self) -> usize {
        self.jacobian_evaluations
    }

    pub fn weight_sqrt(&self) -> &DMatrix<f64> {
        &self.weight_sqrt
    }

    /// Package the final state of a solve.
    pub fn optimum(
        &self,
        optimizer: &'static str,
        point: DVector<f64>,
        value: DVector<f64>,
        residuals: DVector<f64>,
        weighted_jacobian: DMatrix<f64>,
        iterations: usize,
    ) -> LeastSquaresOptimum {
        let cost = self.compute_cost(&residuals);
        debug!(
            "{} finished after {} iterations, {} evaluations, cost {:e}",
            optimizer, iterations, self.evaluations, cost
        );
        LeastSquaresOptimum {
            optimizer,
            point,
            value,
            residuals,
            cost,
            iterations,
            evaluations: self.evaluations,
            jacobian_evaluations: self.jacobian_evaluations,
            weighted_jacobian,
        }
    }
}

/// Result of a solve.
///
/// Keeps the weighted Jacobian at the returned point so that the statistics
/// below do not need another model evaluation.
#[derive(Debug, Clone)]
pub struct LeastSquaresOptimum {
    pub optimizer: &'static str,
    pub point: DVector<f64>,
    /// model value at `point`
    pub value: DVector<f64>,
    pub residuals: DVector<f64>,
    /// `sqrt(r^T W r)`
    pub cost: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub jacobian_evaluations: usize,
    pub weighted_jacobian: DMatrix<f64>,
}

impl LeastSquaresOptimum {
    pub fn observations(&self) -> usize {
        self.residuals.len()
    }

    pub fn parameters(&self) -> usize {
        self.point.len()
    }

    /// Root mean square of the weighted residuals, `sqrt(c^2 / m)`.
    pub fn rms(&self) -> f64 {
        (self.chi_square() / self.observations() as f64).sqrt()
    }

    /// `c^2`
    pub fn chi_square(&self) -> f64 {
        self.cost * self.cost
    }

    /// `c^2 / (m - n)`, `None` when there are no degrees of freedom left.
    pub fn reduced_chi_square(&self) -> Option<f64> {
        let m = self.observations();
        let n = self.parameters();
        if m > n {
            Some(self.chi_square() / (m - n) as f64)
        } else {
            None
        }
    }

    pub fn covariances(&self, threshold: f64) -> LSQResult<DMatrix<f64>> {
        covariance_from_weighted_jacobian(&self.weighted_jacobian, threshold)
    }

    pub fn sigma(&self, threshold: f64) -> LSQResult<DVector<f64>> {
        let covariances = self.covariances(threshold)?;
        Ok(covariances.diagonal().map(|c| c.sqrt()))
    }

    pub fn summary_table(&self) -> String {
        let mut builder = Builder::default();
        builder.push_record(["quantity", "value"]);
        builder.push_record(["optimizer".to_string(), self.optimizer.to_string()]);
        builder.push_record(["iterations".to_string(), self.iterations.to_string()]);
        builder.push_record(["evaluations".to_string(), self.evaluations.to_string()]);
        builder.push_record([
            "jacobian evaluations".to_string(),
            self.jacobian_evaluations.to_string(),
        ]);
        builder.push_record(["cost".to_string(), format!("{:e}", self.cost)]);
        builder.push_record(["rms".to_string(), format!("{:e}", self.rms())]);
        builder.push_record(["chi square".to_string(), format!("{:e}", self.chi_square())]);
        if let Some(reduced) = self.reduced_chi_square() {
            builder.push_record(["reduced chi square".to_string(), format!("{:e}", reduced)]);
        }
        for (i, p) in self.point.iter().enumerate() {
            builder.push_record([format!("x[{}]", i), format!("{:.10e}", p)]);
        }
        let mut table = builder.build();
        table.with(Style::modern_rounded());
        table.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::optimization::problem_LSQ::FnModel;
    use approx::assert_relative_eq;

    fn linear_problem() -> LeastSquaresProblem<impl ModelFunction> {
        // f(x) = [x - 3, 2x - 7]
        let model = FnModel::new(
            |x: &DVector<f64>| DVector::from_vec(vec![x[0] - 3.0, 2.0 * x[0] - 7.0]),
            |_x: &DVector<f64>| DMatrix::from_row_slice(2, 1, &[1.0, 2.0]),
        );
        LeastSquaresProblem::new(model, DVector::zeros(2), DVector::zeros(1))
    }

    #[test]
    fn test_residuals_and_cost() {
        let problem = linear_problem();
        let mut base = LeastSquaresBase::new(&problem).unwrap();
        let x = DVector::from_vec(vec![3.4]);
        let value = base.compute_objective_value(&x).unwrap();
        let r = base.compute_residuals(&value).unwrap();
        assert_relative_eq!(r, DVector::from_vec(vec![-0.4, 0.2]), epsilon = 1e-14);
        assert_relative_eq!(base.compute_cost(&r), 0.2_f64.sqrt(), epsilon = 1e-14);
        assert_eq!(base.evaluations(), 1);
        assert!(base.compute_residuals(&DVector::zeros(3)).is_err());

        let mut out = DVector::from_element(2, f64::NAN);
        base.compute_residuals_into(&value, &mut out).unwrap();
        assert_eq!(out, r);
        let mut short = DVector::zeros(1);
        assert!(base.compute_residuals_into(&value, &mut short).is_err());
    }

    #[test]
    fn test_weighted_cost_and_jacobian() {
        let problem = linear_problem().with_diagonal_weights(&[4.0, 9.0]);
        let mut base = LeastSquaresBase::new(&problem).unwrap();
        let r = DVector::from_vec(vec![1.0, 1.0]);
        assert_relative_eq!(base.compute_cost(&r), 13.0_f64.sqrt());
        assert_relative_eq!(base.weighted_residuals(&r), DVector::from_vec(vec![2.0, 3.0]));
        let j = base.compute_weighted_jacobian(&DVector::zeros(1)).unwrap();
        assert_relative_eq!(j, DMatrix::from_row_slice(2, 1, &[2.0, 6.0]));
        assert_eq!(base.jacobian_evaluations(), 1);
    }

    #[test]
    fn test_dimension_checks() {
        let bad_weight = linear_problem().with_weight(DMatrix::identity(3, 3));
        assert!(matches!(
            LeastSquaresBase::new(&bad_weight),
            Err(OptimizationError::DimensionMismatch { .. })
        ));

        let model = FnModel::new(
            |_x: &DVector<f64>| DVector::zeros(3),
            |_x: &DVector<f64>| DMatrix::zeros(2, 2),
        );
        let problem = LeastSquaresProblem::new(model, DVector::zeros(2), DVector::zeros(1));
        let mut base = LeastSquaresBase::new(&problem).unwrap();
        assert!(matches!(
            base.compute_objective_value(&DVector::zeros(1)),
            Err(OptimizationError::DimensionMismatch { expected: 2, found: 3, .. })
        ));
        assert!(matches!(
            base.compute_weighted_jacobian(&DVector::zeros(1)),
            Err(OptimizationError::DimensionMismatch { what: "jacobian columns", .. })
        ));

        let empty = linear_problem();
        let no_params = LeastSquaresProblem::new(empty.model(), DVector::zeros(2), DVector::zeros(0));
        assert!(matches!(
            LeastSquaresBase::new(&no_params),
            Err(OptimizationError::NoParameters)
        ));
    }

    #[test]
    fn test_bounds_are_rejected() {
        let problem = linear_problem().with_bounds(None, Some(DVector::from_vec(vec![1.0])));
        let base = LeastSquaresBase::new(&problem).unwrap();
        assert!(matches!(
            base.check_parameters(),
            Err(OptimizationError::UnsupportedBounds)
        ));
    }

    #[test]
    fn test_evaluation_budget() {
        let problem = linear_problem().with_max_evaluations(2);
        let mut base = LeastSquaresBase::new(&problem).unwrap();
        let x = DVector::zeros(1);
        assert!(base.compute_objective_value(&x).is_ok());
        assert!(base.compute_objective_value(&x).is_ok());
        assert!(matches!(
            base.compute_objective_value(&x),
            Err(OptimizationError::TooManyEvaluations(2))
        ));
    }

    #[test]
    fn test_sigma_scales_inversely_with_weight() {
        let x = DVector::from_vec(vec![3.4]);
        let plain = linear_problem();
        let mut base = LeastSquaresBase::new(&plain).unwrap();
        let sigma_plain = base.compute_sigma(&x, 1e-14).unwrap();
        // J^T J = 5
        assert_relative_eq!(sigma_plain[0], (1.0_f64 / 5.0).sqrt(), epsilon = 1e-14);

        let heavy = linear_problem().with_diagonal_weights(&[100.0, 100.0]);
        let mut base = LeastSquaresBase::new(&heavy).unwrap();
        let sigma_heavy = base.compute_sigma(&x, 1e-14).unwrap();
        assert_relative_eq!(sigma_plain[0] / sigma_heavy[0], 10.0, epsilon = 1e-12);

        let mixed = linear_problem().with_diagonal_weights(&[1.0, 100.0]);
        let mut base = LeastSquaresBase::new(&mixed).unwrap();
        let sigma_mixed = base.compute_sigma(&x, 1e-14).unwrap();
        assert!(sigma_mixed[0] < sigma_plain[0]);
        assert!(sigma_mixed[0] > sigma_heavy[0]);
    }

    #[test]
    fn test_singular_covariance() {
        let j = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 2.0, 2.0]);
        assert!(matches!(
            covariance_from_weighted_jacobian(&j, 1e-10),
            Err(OptimizationError::SingularMatrix)
        ));
    }

    #[test]
    fn test_optimum_statistics() {
        let problem = linear_problem();
        let mut base = LeastSquaresBase::new(&problem).unwrap();
        let x = DVector::from_vec(vec![3.4]);
        let value = base.compute_objective_value(&x).unwrap();
        let r = base.compute_residuals(&value).unwrap();
        let j = base.compute_weighted_jacobian(&x).unwrap();
        let optimum = base.optimum("test", x, value, r, j, 1);
        assert_relative_eq!(optimum.chi_square(), 0.2, epsilon = 1e-14);
        assert_relative_eq!(optimum.rms(), 0.1_f64.sqrt(), epsilon = 1e-14);
        assert_relative_eq!(optimum.reduced_chi_square().unwrap(), 0.2, epsilon = 1e-14);
        assert_relative_eq!(optimum.covariances(1e-14).unwrap()[(0, 0)], 0.2, epsilon = 1e-14);
        let table = optimum.summary_table();
        assert!(table.contains("chi square"));
        assert!(table.contains("x[0]"));
    }
}
