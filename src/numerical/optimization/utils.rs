#![allow(unexpected_cfgs)]
use nalgebra::{Dim, U1, Vector, storage::Storage};
use num_traits::float::Float;

cfg_if::cfg_if! {
    if #[cfg(feature = "RUSTC_IS_NIGHTLY")] {
        use core::intrinsics::{likely, unlikely};
    } else {
        #[inline]
        fn likely(b: bool) -> bool {
            b
        }

        #[inline]
        fn unlikely(b: bool) -> bool {
            b
        }
    }
}

/// Twice the unit roundoff of `f64`, the floor below which relative
/// tolerances cannot be met.
#[inline]
pub(crate) fn epsmch() -> f64 {
    f64::EPSILON
}

/// Smallest positive normal `f64`
#[inline]
pub(crate) fn dwarf() -> f64 {
    f64::MIN_POSITIVE
}

#[inline]
fn giant() -> f64 {
    f64::MAX
}

/// Euclidean norm which neither overflows nor underflows for extreme components.
///
/// Components are split in three groups (small, intermediate, large) and
/// each group is accumulated with its own scaling, as in MINPACK `enorm`.
#[inline]
pub(crate) fn enorm<N, VS>(v: &Vector<f64, N, VS>) -> f64
where
    N: Dim,
    VS: Storage<f64, N, U1>,
{
    let mut s1 = 0.0;
    let mut s2 = 0.0;
    let mut s3 = 0.0;
    let mut x1max = 0.0;
    let mut x3max = 0.0;
    let agiant = Float::sqrt(giant()) / v.nrows().max(1) as f64;
    let rdwarf = Float::sqrt(dwarf());
    for xi in v.iter() {
        let xabs = xi.abs();
        if unlikely(xabs.is_nan()) {
            return xabs;
        }
        if unlikely(xabs >= agiant || xabs <= rdwarf) {
            if xabs > rdwarf {
                // sum for large components
                if xabs > x1max {
                    s1 = 1.0 + s1 * Float::powi(x1max / xabs, 2);
                    x1max = xabs;
                } else {
                    s1 += Float::powi(xabs / x1max, 2);
                }
            } else {
                // sum for small components
                if xabs > x3max {
                    s3 = 1.0 + s3 * Float::powi(x3max / xabs, 2);
                    x3max = xabs;
                } else if xabs != 0.0 {
                    s3 += Float::powi(xabs / x3max, 2);
                }
            }
        } else {
            s2 += xabs * xabs;
        }
    }

    if unlikely(s1 != 0.0) {
        x1max * Float::sqrt(s1 + (s2 / x1max) / x1max)
    } else if likely(s2 != 0.0) {
        Float::sqrt(if likely(s2 >= x3max) {
            s2 * (1.0 + (x3max / s2) * (x3max * s3))
        } else {
            x3max * ((s2 / x3max) + (x3max * s3))
        })
    } else {
        x3max * Float::sqrt(s3)
    }
}
