//! numerical methods
/// nonlinear least squares optimizers: Gauss-Newton and Levenberg-Marquardt
pub mod optimization;
