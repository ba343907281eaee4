//! Solver for the trust-region sub-problem in the LM algorithm.
#![allow(clippy::excessive_precision)]

use crate::numerical::optimization::error_LSQ::{LSQResult, OptimizationError};
use crate::numerical::optimization::qr_LM::QRHouseholder;
use crate::numerical::optimization::utils::dwarf;
use log::debug;
use nalgebra::DVector;

/// Maximal number of damped directions computed per parameter search
const MAX_LM_PAR_EVALUATIONS: usize = 10;
const P1: f64 = 0.1;
const P001: f64 = 0.001;

/// Scratch vectors of the parameter search, all of length `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct LMSearchBuffers {
    pub work1: DVector<f64>,
    /// diagonal of the triangular factor `S` built by [`determine_lm_direction`],
    /// indexed by pivot position
    pub lm_diag: DVector<f64>,
    pub work3: DVector<f64>,
}

impl LMSearchBuffers {
    pub fn new(n: usize) -> Self {
        Self {
            work1: DVector::zeros(n),
            lm_diag: DVector::zeros(n),
            work3: DVector::zeros(n),
        }
    }
}

/// Approximately solve the LM trust-region subproblem.
///
/// With `A = -J~ = Q*R*P^T` already factorized (and `R` diagonal stored),
/// `qy = Q^T * r~` and the scaling `D = diag`, find `lm_par >= 0` and `x` with
/// ```math
/// (\mathbf{A}^\top\mathbf{A} + \lambda \mathbf{D}\mathbf{D})\vec{x} = \mathbf{A}^\top\vec{r},
/// \quad \lambda = 0 \text{ or } |\,\|\mathbf{D}\vec{x}\| - \Delta\,| \leq 0.1\Delta.
/// ```
/// The Gauss-Newton direction is tried first. Otherwise `lm_par` (warm
/// started from the previous value) is bracketed in `[parl, paru]` and
/// refined with Newton steps on the secular equation `||D x(lambda)|| = delta`.
/// At most ten damped directions are computed, so the returned `lm_par` is
/// an approximation. On return `lm_dir` holds `x` for the returned `lm_par`.
///
/// # Reference
///
/// This method resembles `LMPAR` from `MINPACK`:
///
/// > Moré J.J. (1978) The Levenberg-Marquardt algorithm: Implementation and theory. In: Watson G.A. (eds) Numerical Analysis. Lecture Notes in Mathematics, vol 630. Springer, Berlin, Heidelberg.
pub fn determine_lm_parameter(
    qr: &mut QRHouseholder,
    qy: &DVector<f64>,
    delta: f64,
    diag: &DVector<f64>,
    lm_par: f64,
    buffers: &mut LMSearchBuffers,
    lm_dir: &mut DVector<f64>,
) -> LSQResult<f64> {
    debug_assert!(delta >= 0.0);
    debug_assert!(lm_par >= 0.0);
    let rank = qr.rank();
    let solved_cols = qr.solved_cols();
    let n = lm_dir.len();
    let permutation = qr.permutation().to_vec();
    let diag_r = qr.diag_r().clone();

    // Gauss-Newton direction; for a rank deficient jacobian the least squares
    // solution with the trailing components set to zero
    for j in 0..rank {
        lm_dir[permutation[j]] = qy[j];
    }
    for j in rank..n {
        lm_dir[permutation[j]] = 0.0;
    }
    for k in (0..rank).rev() {
        let pk = permutation[k];
        let ypk = lm_dir[pk] / diag_r[pk];
        for i in 0..k {
            lm_dir[permutation[i]] -= ypk * qr.r(i, k);
        }
        lm_dir[pk] = ypk;
    }

    let work1 = &mut buffers.work1;
    let mut dx_norm = 0.0;
    for j in 0..solved_cols {
        let pj = permutation[j];
        let s = diag[pj] * lm_dir[pj];
        work1[pj] = s;
        dx_norm += s * s;
    }
    dx_norm = dx_norm.sqrt();
    let mut fp = dx_norm - delta;
    if fp <= P1 * delta {
        debug!("Gauss-Newton direction accepted, ||D*x|| = {:e}", dx_norm);
        return Ok(0.0);
    }

    // the Newton step gives a lower bound parl for the zero of the
    // secular function if the jacobian has full rank, otherwise parl = 0
    let mut parl = 0.0;
    if rank == solved_cols {
        for j in 0..solved_cols {
            let pj = permutation[j];
            work1[pj] *= diag[pj] / dx_norm;
        }
        let mut sum2 = 0.0;
        for j in 0..solved_cols {
            let pj = permutation[j];
            let mut sum = 0.0;
            for i in 0..j {
                sum += qr.r(i, j) * work1[permutation[i]];
            }
            let s = (work1[pj] - sum) / diag_r[pj];
            work1[pj] = s;
            sum2 += s * s;
        }
        parl = fp / (delta * sum2);
    }

    // upper bound paru = ||(A*D^-1)^T r|| / delta
    let mut sum2 = 0.0;
    for j in 0..solved_cols {
        let pj = permutation[j];
        let mut sum = 0.0;
        for i in 0..=j {
            sum += qr.r(i, j) * qy[i];
        }
        sum /= diag[pj];
        sum2 += sum * sum;
    }
    let g_norm = sum2.sqrt();
    let mut paru = g_norm / delta;
    if paru == 0.0 {
        paru = dwarf() / delta.min(P1);
    }

    // move the warm start into [parl, paru]
    let mut lm_par = paru.min(lm_par.max(parl));
    if lm_par == 0.0 {
        lm_par = g_norm / dx_norm;
    }

    for iteration in 1..=MAX_LM_PAR_EVALUATIONS {
        if lm_par == 0.0 {
            lm_par = dwarf().max(P001 * paru);
        }
        let s_par = lm_par.sqrt();
        for j in 0..solved_cols {
            let pj = permutation[j];
            buffers.work1[pj] = s_par * diag[pj];
        }
        determine_lm_direction(qr, qy, &buffers.work1, &mut buffers.lm_diag, &mut buffers.work3, lm_dir);

        dx_norm = 0.0;
        for j in 0..solved_cols {
            let pj = permutation[j];
            let s = diag[pj] * lm_dir[pj];
            buffers.work3[pj] = s;
            dx_norm += s * s;
        }
        dx_norm = dx_norm.sqrt();
        if iteration == MAX_LM_PAR_EVALUATIONS {
            break;
        }
        let previous_fp = fp;
        fp = dx_norm - delta;

        // accept lm_par if ||D*x|| is close enough to delta, or if parl is
        // zero and the secular function stopped decreasing below zero
        if fp.abs() <= P1 * delta || (parl == 0.0 && fp <= previous_fp && previous_fp < 0.0) {
            break;
        }

        // Newton correction
        let work1 = &mut buffers.work1;
        for j in 0..solved_cols {
            let pj = permutation[j];
            work1[pj] = buffers.work3[pj] * diag[pj] / dx_norm;
        }
        for j in 0..solved_cols {
            let pj = permutation[j];
            work1[pj] /= buffers.lm_diag[j];
            let tmp = work1[pj];
            for i in (j + 1)..solved_cols {
                work1[permutation[i]] -= qr.r(i, j) * tmp;
            }
        }
        let mut sum2 = 0.0;
        for j in 0..solved_cols {
            let s = work1[permutation[j]];
            sum2 += s * s;
        }
        let correction = fp / (delta * sum2);

        if fp > 0.0 {
            parl = parl.max(lm_par);
        } else if fp < 0.0 {
            paru = paru.min(lm_par);
        }

        lm_par = parl.max(lm_par + correction);
        if !lm_par.is_finite() {
            return Err(OptimizationError::Numerical(
                "damping parameter became non-finite",
            ));
        }
    }
    debug!(
        "lm_par = {:e}, ||D*x|| = {:e}, delta = {:e}",
        lm_par, dx_norm, delta
    );
    Ok(lm_par)
}

/// Solve `min ||[A; D]*x - [r; 0]||` for the given diagonal `D`.
///
/// The rows of `D` are eliminated from `R` with Givens rotations, which
/// gives an upper triangular `S` with `S^T S = R^T R + P^T D D P`. The strict
/// lower part of the first `solved_cols` rows of the work matrix receives
/// `S^T`, its diagonal goes to `lm_diag` (pivot order); `R` itself is restored.
/// A zero on the diagonal of `S` truncates the solution there.
pub fn determine_lm_direction(
    qr: &mut QRHouseholder,
    qy: &DVector<f64>,
    diag: &DVector<f64>,
    lm_diag: &mut DVector<f64>,
    work: &mut DVector<f64>,
    lm_dir: &mut DVector<f64>,
) {
    let solved_cols = qr.solved_cols();
    let permutation = qr.permutation().to_vec();
    let diag_r = qr.diag_r().clone();
    let n = lm_dir.len();
    let a = qr.work_matrix_mut();

    // copy R^T into the lower part and keep the diagonal of R in lm_dir
    for j in 0..solved_cols {
        let pj = permutation[j];
        for i in (j + 1)..solved_cols {
            a[(i, pj)] = a[(j, permutation[i])];
        }
        lm_dir[j] = diag_r[pj];
        work[j] = qy[j];
    }

    // eliminate the diagonal matrix D with Givens rotations
    let p5 = 0.5;
    let p25 = 0.25;
    for j in 0..solved_cols {
        let pj = permutation[j];
        let dpj = diag[pj];
        if dpj != 0.0 {
            for k in (j + 1)..lm_diag.len() {
                lm_diag[k] = 0.0;
            }
        }
        lm_diag[j] = dpj;

        // the rotations only modify one element of (Q^T*r, 0) beyond the first n
        let mut qtbpj = 0.0;
        for k in j..solved_cols {
            let pk = permutation[k];
            if lm_diag[k] != 0.0 {
                let rkk = a[(k, pk)];
                let (sin, cos) = if rkk.abs() < lm_diag[k].abs() {
                    let cotan = rkk / lm_diag[k];
                    let sin = p5 / (p25 + p25 * (cotan * cotan)).sqrt();
                    (sin, sin * cotan)
                } else {
                    let tan = lm_diag[k] / rkk;
                    let cos = p5 / (p25 + p25 * (tan * tan)).sqrt();
                    (cos * tan, cos)
                };

                // modified diagonal element of R and element of (Q^T*r, 0)
                a[(k, pk)] = cos * rkk + sin * lm_diag[k];
                let temp = cos * work[k] + sin * qtbpj;
                qtbpj = -sin * work[k] + cos * qtbpj;
                work[k] = temp;

                // accumulate the transformation in the row of S
                for i in (k + 1)..solved_cols {
                    let rik = a[(i, pk)];
                    let temp2 = cos * rik + sin * lm_diag[i];
                    lm_diag[i] = -sin * rik + cos * lm_diag[i];
                    a[(i, pk)] = temp2;
                }
            }
        }

        // store the diagonal of S and restore the diagonal of R
        lm_diag[j] = a[(j, permutation[j])];
        a[(j, permutation[j])] = lm_dir[j];
    }

    // solve the triangular system, a singular S gives a least squares solution
    let mut n_sing = solved_cols;
    for j in 0..solved_cols {
        if lm_diag[j] == 0.0 && n_sing == solved_cols {
            n_sing = j;
        }
        if n_sing < solved_cols {
            work[j] = 0.0;
        }
    }
    for j in (0..n_sing).rev() {
        let pj = permutation[j];
        let mut sum = 0.0;
        for i in (j + 1)..n_sing {
            sum += a[(i, pj)] * work[i];
        }
        work[j] = (work[j] - sum) / lm_diag[j];
    }

    // permute back
    for j in 0..solved_cols {
        lm_dir[permutation[j]] = work[j];
    }
    for j in solved_cols..n {
        lm_dir[permutation[j]] = 0.0;
    }
}
