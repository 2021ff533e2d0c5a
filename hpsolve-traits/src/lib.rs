use nalgebra::RealField;
use num::ToPrimitive;

pub use nalgebra;

/// Scalar type used throughout `hpsolve`.
///
/// `ToPrimitive` is required so that residual norms and pivots can be reported in errors
/// independently of the scalar type. `Send + Sync` allow factorizations to be built in parallel.
pub trait Real: RealField + Copy + ToPrimitive + Send + Sync {}

impl<T: RealField + Copy + ToPrimitive + Send + Sync> Real for T {}

/// Converts a real value to `f64` for reporting purposes.
///
/// Values that cannot be represented are reported as NaN.
pub fn to_f64<T: Real>(value: T) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}
