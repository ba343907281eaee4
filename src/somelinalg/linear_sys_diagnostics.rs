use log::warn;
use nalgebra::DMatrix;

/// Ratio of the largest to the smallest singular value.
/// A matrix with a zero singular value has infinite condition number.
pub fn condition_number(A: &DMatrix<f64>) -> f64 {
    let singular_values = A.singular_values();
    if singular_values.is_empty() {
        return f64::INFINITY;
    }
    let max_sigma = singular_values.max();
    let min_sigma = singular_values.min();
    if min_sigma == 0.0 {
        f64::INFINITY
    } else {
        max_sigma / min_sigma
    }
}

pub fn poorly_conditioned(A: &DMatrix<f64>, threshold: f64) -> bool {
    // A system of linear equations is said to be poorly conditioned if the solution is sensitive to small changes in the input data.
    let condition_number = condition_number(A);
    let poorly_conditioned = condition_number > threshold;
    if poorly_conditioned {
        warn!(
            "The system of linear equations is poorly conditioned. Condition number = {:.2e}",
            condition_number
        );
    }
    poorly_conditioned
}

/// famous example of ill-conditioned matrix
#[cfg(test)]
fn hilbert_matrix(n: usize) -> DMatrix<f64> {
    let mut A = DMatrix::zeros(n, n);
    for i in 1..n + 1 {
        for j in 1..n + 1 {
            A[(i - 1, j - 1)] = 1.0 / (i as f64 + j as f64 - 1.0);
        }
    }
    A
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_poorly_conditioned() {
        let A = DMatrix::from_vec(2, 2, vec![1.0, 1.0, 1.00001, 1.0]);
        let threshold = 1e5;
        assert!(poorly_conditioned(&A, threshold));
    }
    #[test]
    fn test_poorly_conditioned_hilbert() {
        let A = hilbert_matrix(6);
        let threshold = 1e5;
        assert!(poorly_conditioned(&A, threshold));
        assert!(!poorly_conditioned(&DMatrix::identity(6, 6), threshold));
    }
    #[test]
    fn test_condition_number_of_singular() {
        let A = DMatrix::zeros(3, 3);
        assert_eq!(condition_number(&A), f64::INFINITY);
    }
}
