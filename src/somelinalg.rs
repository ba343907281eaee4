//! some linear algebra functions used throughout the code
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
use thiserror::Error;

/// dense LU and QR solves of square systems
pub mod LUsolver;
/// diagnostics for linear systems and matrices: if it is singular
/// or poorly conditioned
pub mod linear_sys_diagnostics;
/// matrix inversion and matrix square root
pub mod some_matrix_inv;

/// Failures of the dense linear algebra helpers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinearAlgebraError {
    #[error("matrix is singular")]
    Singular,
    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix is not positive semi-definite (eigenvalue {eigenvalue})")]
    NotPositiveSemiDefinite { eigenvalue: f64 },
}
