use crate::somelinalg::LinearAlgebraError;
use log::debug;
use nalgebra::{DMatrix, DVector};

fn check_square(mat: &DMatrix<f64>) -> Result<usize, LinearAlgebraError> {
    let (n, m) = mat.shape();
    if n != m {
        return Err(LinearAlgebraError::NotSquare { rows: n, cols: m });
    }
    Ok(n)
}

/// Solve `A*x = b` with LU decomposition (partial pivoting).
///
/// nalgebra reports a singular `U` by returning `None`, which becomes
/// `LinearAlgebraError::Singular` here.
pub fn solve_with_lu(mat: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LinearAlgebraError> {
    let n = check_square(mat)?;
    if b.len() != n {
        return Err(LinearAlgebraError::NotSquare { rows: b.len(), cols: n });
    }
    let lu = mat.clone().lu();
    let x = lu.solve(b).ok_or(LinearAlgebraError::Singular)?;
    if x.iter().any(|v| !v.is_finite()) {
        debug!("LU solve produced non-finite entries");
        return Err(LinearAlgebraError::Singular);
    }
    Ok(x)
}

/// Solve `A*x = b` with Householder QR decomposition.
pub fn solve_with_qr(mat: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LinearAlgebraError> {
    let n = check_square(mat)?;
    if b.len() != n {
        return Err(LinearAlgebraError::NotSquare { rows: b.len(), cols: n });
    }
    let qr = mat.clone().qr();
    let x = qr.solve(b).ok_or(LinearAlgebraError::Singular)?;
    if x.iter().any(|v| !v.is_finite()) {
        debug!("QR solve produced non-finite entries");
        return Err(LinearAlgebraError::Singular);
    }
    Ok(x)
}
