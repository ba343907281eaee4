//! Rank revealing QR factorization of the weighted Jacobian.
//!
//! The factorization works on `A = -J~` (the negated weighted Jacobian) with
//! Householder reflections and column pivoting. `Q` is never formed: the
//! Householder vectors stay in the lower part of the work matrix and are
//! applied to vectors on demand by [`QRHouseholder::q_t_y`].
#![allow(clippy::excessive_precision)]

use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::utils::enorm;
use log::warn;
use nalgebra::{DMatrix, DVector};
use std::fmt::Display;

/// Householder QR state for one `m x n` Jacobian.
///
/// Storage is column-wise in the original column order; the pivoting is
/// purely logical, `permutation[k]` is the original index of the column
/// that ended up in position `k`. After [`factorize`](Self::factorize)
///
/// * the strictly upper part of `R` is `a[(i, permutation[k])]`, `i < k`,
/// * `diag_r[permutation[k]]` is `R_kk`,
/// * `a[(i, permutation[k])]`, `i >= k`, is the Householder vector `u_k`
///   with coefficient `beta[permutation[k]]`, `H_k = I - beta*u*u^T`.
#[derive(Debug, Clone, PartialEq)]
pub struct QRHouseholder {
    a: DMatrix<f64>,
    permutation: Vec<usize>,
    diag_r: DVector<f64>,
    jac_norm: DVector<f64>,
    beta: DVector<f64>,
    rank: usize,
    ranking_threshold: f64,
}

impl Display for QRHouseholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QRHouseholder {{")?;
        writeln!(f, "rank: {}", self.rank)?;
        writeln!(f, "permutation: {:?}", self.permutation)?;
        writeln!(f, "diag_r: {:?}", self.diag_r.as_slice())?;
        writeln!(f, "jac_norm: {:?}", self.jac_norm.as_slice())?;
        writeln!(f, "beta: {:?}", self.beta.as_slice())?;
        write!(f, "}}")
    }
}

impl QRHouseholder {
    /// Buffers for an `m x n` Jacobian. `ranking_threshold` is compared with
    /// the squared norm of the active part of the candidate pivot column.
    pub fn new(rows: usize, cols: usize, ranking_threshold: f64) -> Self {
        Self {
            a: DMatrix::zeros(rows, cols),
            permutation: (0..cols).collect(),
            diag_r: DVector::zeros(cols),
            jac_norm: DVector::zeros(cols),
            beta: DVector::zeros(cols),
            rank: 0,
            ranking_threshold,
        }
    }

    /// Factorize `-weighted_jacobian` in place of the previous factorization.
    ///
    /// At step `k` the remaining column with the largest squared norm over
    /// rows `k..m` becomes the pivot. These norms change with every
    /// reflection, so they are recomputed each step. Factoring stops as soon
    /// as that largest squared norm is at or below the ranking threshold;
    /// the number of completed steps is the rank.
    pub fn factorize(&mut self, weighted_jacobian: &DMatrix<f64>) -> LSQResult<()> {
        let (m, n) = self.a.shape();
        if weighted_jacobian.nrows() != m {
            return Err(OptimizationError::DimensionMismatch {
                what: "weighted jacobian rows",
                expected: m,
                found: weighted_jacobian.nrows(),
            });
        }
        if weighted_jacobian.ncols() != n {
            return Err(OptimizationError::DimensionMismatch {
                what: "weighted jacobian columns",
                expected: n,
                found: weighted_jacobian.ncols(),
            });
        }
        self.a.copy_from(weighted_jacobian);
        self.a.neg_mut();

        for k in 0..n {
            self.permutation[k] = k;
            self.jac_norm[k] = enorm(&self.a.column(k));
        }
        self.diag_r.fill(0.0);
        self.beta.fill(0.0);
        self.rank = n;

        for k in 0..n {
            // select the column with the greatest norm on active components
            let mut next_column = k;
            let mut ak2 = f64::NEG_INFINITY;
            for i in k..n {
                let column = self.a.column(self.permutation[i]);
                let norm2: f64 = (k..m).map(|j| column[j] * column[j]).sum();
                if !norm2.is_finite() {
                    return Err(OptimizationError::UnableToPerformQR { rows: m, cols: n });
                }
                if norm2 > ak2 {
                    next_column = i;
                    ak2 = norm2;
                }
            }
            if ak2 <= self.ranking_threshold {
                self.rank = k;
                if k < m.min(n) {
                    warn!(
                        "jacobian is rank deficient: rank {} of {} columns",
                        k, n
                    );
                }
                return Ok(());
            }
            self.permutation.swap(k, next_column);
            let pk = self.permutation[k];

            // choose alpha such that H_k u = alpha e_k
            let akk = self.a[(k, pk)];
            let alpha = if akk > 0.0 { -ak2.sqrt() } else { ak2.sqrt() };
            let beta_k = 1.0 / (ak2 - akk * alpha);
            self.beta[pk] = beta_k;
            self.diag_r[pk] = alpha;
            self.a[(k, pk)] -= alpha;

            // apply the reflection to the remaining columns
            for dk in (1..n - k).rev() {
                let pj = self.permutation[k + dk];
                let mut gamma = 0.0;
                for j in k..m {
                    gamma += self.a[(j, pk)] * self.a[(j, pj)];
                }
                gamma *= beta_k;
                for j in k..m {
                    let update = gamma * self.a[(j, pk)];
                    self.a[(j, pj)] -= update;
                }
            }
        }
        Ok(())
    }

    /// Overwrite `y` with `Q^T y` using the stored reflections.
    ///
    /// Must be called before [`store_r_diagonal`](Self::store_r_diagonal),
    /// which overwrites the leading entry of each Householder vector.
    pub fn q_t_y(&self, y: &mut DVector<f64>) {
        let m = self.a.nrows();
        for k in 0..self.rank {
            let pk = self.permutation[k];
            let mut gamma = 0.0;
            for i in k..m {
                gamma += self.a[(i, pk)] * y[i];
            }
            gamma *= self.beta[pk];
            for i in k..m {
                y[i] -= gamma * self.a[(i, pk)];
            }
        }
    }

    /// Move the diagonal of `R` into the work matrix, so that the leading
    /// `solved_cols x solved_cols` block (in pivot order) holds `R`.
    /// Entries beyond the rank are zero.
    pub fn store_r_diagonal(&mut self) {
        for k in 0..self.solved_cols() {
            let pk = self.permutation[k];
            self.a[(k, pk)] = self.diag_r[pk];
        }
    }

    /// `min(m, n)`
    pub fn solved_cols(&self) -> usize {
        self.a.nrows().min(self.a.ncols())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Diagonal of `R`, indexed by original column
    pub fn diag_r(&self) -> &DVector<f64> {
        &self.diag_r
    }

    /// Euclidean norms of the columns of the weighted Jacobian
    pub fn jac_norm(&self) -> &DVector<f64> {
        &self.jac_norm
    }

    pub fn beta(&self) -> &DVector<f64> {
        &self.beta
    }

    pub fn ranking_threshold(&self) -> f64 {
        self.ranking_threshold
    }

    /// Entry `(i, k)` of `R` in pivot order, valid for `i < k` or after
    /// [`store_r_diagonal`](Self::store_r_diagonal) for `i == k`.
    #[inline]
    pub fn r(&self, i: usize, k: usize) -> f64 {
        self.a[(i, self.permutation[k])]
    }

    #[inline]
    pub(crate) fn work_matrix(&self) -> &DMatrix<f64> {
        &self.a
    }

    #[inline]
    pub(crate) fn work_matrix_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.a
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
/// TESTING
/////////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn factorized(j: &DMatrix<f64>, threshold: f64) -> QRHouseholder {
        let mut qr = QRHouseholder::new(j.nrows(), j.ncols(), threshold);
        qr.factorize(j).unwrap();
        qr
    }

    #[test]
    fn test_pivoted_qr() {
        #[rustfmt::skip]
        let a = DMatrix::<f64>::from_row_slice(4, 3, &[
            2.0,  1.,  4.0,
            0.0, 10., -1.0,
            0.0,  4.,  0.5,
            1.0,  0.,   0.,
        ]);
        let qr = factorized(&a, f64::MIN_POSITIVE);

        assert_eq!(qr.permutation(), &[1, 2, 0]);
        assert_eq!(qr.rank(), 3);
        let column_norms = DVector::from_vec(vec![
            2.23606797749979,
            10.816653826391969,
            4.153311931459037,
        ]);
        assert_relative_eq!(*qr.jac_norm(), column_norms, epsilon = 1e-14);
        let r_diag = [
            10.816653826391967,
            4.1368161505254095,
            1.0778765953488594,
        ];
        for (k, expected) in r_diag.iter().enumerate() {
            let pk = qr.permutation()[k];
            assert_relative_eq!(qr.diag_r()[pk].abs(), *expected, epsilon = 1e-12);
        }
    }

    /// `Q^T (A P)` must reproduce `R`: stored upper part above the diagonal,
    /// `diag_r` on it and zeros below.
    fn check_q_t_a_equals_r(j: &DMatrix<f64>, qr: &QRHouseholder) {
        let (m, n) = j.shape();
        let mut r = DMatrix::zeros(m, n);
        for k in 0..qr.rank() {
            let pk = qr.permutation()[k];
            let mut y = -j.column(pk).into_owned();
            qr.q_t_y(&mut y);
            r.set_column(k, &y);
        }
        let scale = j.norm().max(1.0);
        for k in 0..qr.rank() {
            let pk = qr.permutation()[k];
            for i in 0..m {
                let expected = if i < k {
                    qr.r(i, k)
                } else if i == k {
                    qr.diag_r()[pk]
                } else {
                    0.0
                };
                assert_relative_eq!(r[(i, k)], expected, epsilon = 1e-12 * scale);
            }
        }
    }

    #[test]
    fn test_random_full_rank_factorization() {
        let mut rng = rand::rng();
        for &(m, n) in &[(4, 3), (6, 6), (10, 4), (7, 2)] {
            let j = DMatrix::from_fn(m, n, |_, _| rng.random_range(-10.0..10.0));
            let qr = factorized(&j, f64::MIN_POSITIVE);
            assert_eq!(qr.rank(), n);
            check_q_t_a_equals_r(&j, &qr);

            // |R_kk| non-increasing in pivot order
            let d: Vec<f64> = qr
                .permutation()
                .iter()
                .map(|&p| qr.diag_r()[p].abs())
                .collect();
            for w in d.windows(2) {
                assert!(w[0] >= w[1] * (1.0 - 1e-12));
            }
        }
    }

    #[test]
    fn test_q_t_y_preserves_norm() {
        let mut rng = rand::rng();
        let j = DMatrix::from_fn(8, 3, |_, _| rng.random_range(-1.0..1.0));
        let qr = factorized(&j, f64::MIN_POSITIVE);
        let y0 = DVector::from_fn(8, |_, _| rng.random_range(-1.0..1.0));
        let mut y = y0.clone();
        qr.q_t_y(&mut y);
        assert_relative_eq!(y.norm(), y0.norm(), epsilon = 1e-12);
    }

    #[test]
    fn test_rank_one_matrix() {
        let j = DMatrix::from_fn(10, 5, |i, k| ((i + 1) * (k + 1)) as f64);
        let qr = factorized(&j, 1e-12);
        assert_eq!(qr.rank(), 1);
        let p0 = qr.permutation()[0];
        assert_relative_eq!(qr.diag_r()[p0].abs(), 98.107084351742913, epsilon = 1e-10);
        for &p in &qr.permutation()[1..] {
            assert_eq!(qr.diag_r()[p], 0.0);
        }
    }

    #[test]
    fn test_linear_combination_column_lowers_rank() {
        let mut rng = rand::rng();
        let mut j = DMatrix::from_fn(6, 3, |_, _| rng.random_range(-5.0..5.0));
        let combination = j.column(0) * 2.0 - j.column(1) * 0.5;
        j.set_column(2, &combination);
        let qr = factorized(&j, 1e-20);
        assert_eq!(qr.rank(), 2);
    }

    #[test]
    fn test_identical_columns_are_exactly_rank_one() {
        let j = DMatrix::from_row_slice(2, 2, &[3.0, 3.0, 4.0, 4.0]);
        let qr = factorized(&j, f64::MIN_POSITIVE);
        assert_eq!(qr.rank(), 1);
        assert_relative_eq!(qr.diag_r()[qr.permutation()[0]].abs(), 5.0, epsilon = 1e-14);
    }

    #[test]
    fn test_identical_columns_need_a_relative_threshold() {
        // the second column leaves a rounding residue after the first
        // reflection, far above f64::MIN_POSITIVE
        let j = DMatrix::from_row_slice(3, 2, &[0.1, 0.1, 0.7, 0.7, 0.3, 0.3]);
        let qr = factorized(&j, 1e-20);
        assert_eq!(qr.rank(), 1);
        assert_relative_eq!(
            qr.diag_r()[qr.permutation()[0]].abs(),
            0.59_f64.sqrt(),
            epsilon = 1e-14
        );
    }

    #[test]
    fn test_wide_matrix_rank_is_bounded_by_rows() {
        let j = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, -1.0, 0.5, 2.0]);
        let qr = factorized(&j, f64::MIN_POSITIVE);
        assert_eq!(qr.rank(), 2);
        assert_eq!(qr.solved_cols(), 2);
    }

    #[test]
    fn test_non_finite_jacobian_is_an_error() {
        let j = DMatrix::from_row_slice(2, 2, &[1.0, f64::NAN, 0.0, 1.0]);
        let mut qr = QRHouseholder::new(2, 2, f64::MIN_POSITIVE);
        assert!(matches!(
            qr.factorize(&j),
            Err(OptimizationError::UnableToPerformQR { rows: 2, cols: 2 })
        ));
        let j = DMatrix::from_row_slice(2, 2, &[1e200, 0.0, 1e200, 1.0]);
        assert!(qr.factorize(&j).is_err());
    }

    #[test]
    fn test_refactorization_resets_state() {
        let mut qr = QRHouseholder::new(3, 2, 1e-20);
        qr.factorize(&DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        assert_eq!(qr.rank(), 1);
        qr.factorize(&DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(qr.rank(), 2);
        assert!(qr.diag_r().iter().all(|d| d.abs() > 0.5));
    }
}
