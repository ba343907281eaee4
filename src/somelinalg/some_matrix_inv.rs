use crate::somelinalg::LinearAlgebraError;
use log::warn;
use nalgebra::{DMatrix, SymmetricEigen};

/// Invert a square matrix through its QR decomposition.
///
/// The decomposition is rank revealing in the weak sense used by least-squares
/// codes: the matrix is declared singular as soon as one diagonal entry of `R`
/// has magnitude at or below `threshold`.
pub fn inverse_rank_revealing(
    mat: &DMatrix<f64>,
    threshold: f64,
) -> Result<DMatrix<f64>, LinearAlgebraError> {
    let (n, m) = mat.shape();
    if n != m {
        return Err(LinearAlgebraError::NotSquare { rows: n, cols: m });
    }
    let qr = mat.clone().qr();
    let r = qr.r();
    if let Some((j, rjj)) = r
        .diagonal()
        .iter()
        .enumerate()
        .find(|(_, rjj)| !(rjj.abs() > threshold))
    {
        warn!("R[{},{}] = {:e} is below the singularity threshold {:e}", j, j, rjj, threshold);
        return Err(LinearAlgebraError::Singular);
    }
    qr.solve(&DMatrix::identity(n, n))
        .ok_or(LinearAlgebraError::Singular)
}

/// `true` if every off-diagonal entry is exactly zero
pub fn is_diagonal(mat: &DMatrix<f64>) -> bool {
    let (n, m) = mat.shape();
    (0..m).all(|j| (0..n).all(|i| i == j || mat[(i, j)] == 0.0))
}

/// Square root of a symmetric positive semi-definite matrix.
///
/// Diagonal matrices are handled entry by entry, everything else goes through
/// the eigendecomposition `W = V*L*V^T`, `sqrt(W) = V*sqrt(L)*V^T`.
/// Eigenvalues that are negative only because of rounding are clamped to zero.
pub fn matrix_sqrt(mat: &DMatrix<f64>) -> Result<DMatrix<f64>, LinearAlgebraError> {
    let (n, m) = mat.shape();
    if n != m {
        return Err(LinearAlgebraError::NotSquare { rows: n, cols: m });
    }
    if is_diagonal(mat) {
        let mut sqrt = DMatrix::zeros(n, n);
        for i in 0..n {
            let wi = mat[(i, i)];
            if wi < 0.0 {
                return Err(LinearAlgebraError::NotPositiveSemiDefinite { eigenvalue: wi });
            }
            sqrt[(i, i)] = wi.sqrt();
        }
        return Ok(sqrt);
    }

    let eigen = SymmetricEigen::new(mat.clone());
    let max_abs = eigen.eigenvalues.iter().fold(0.0_f64, |acc, l| acc.max(l.abs()));
    let noise = f64::EPSILON * n as f64 * max_abs;
    let mut sqrt_l = eigen.eigenvalues.clone();
    for l in sqrt_l.iter_mut() {
        if *l < -noise {
            return Err(LinearAlgebraError::NotPositiveSemiDefinite { eigenvalue: *l });
        }
        *l = l.max(0.0).sqrt();
    }
    let v = &eigen.eigenvectors;
    Ok(v * DMatrix::from_diagonal(&sqrt_l) * v.transpose())
}
