//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Apply polynomial coefficients to a value.
///
/// The order of the coefficients is highest power first, i.e. if there are 3
/// coefficients it's a 2nd order polynomial with c[0]*x^2 + c[1]*x + c[2].
pub fn poly_val<T>(value: T, coeffs: &[T]) -> T
where
    T: Float + std::ops::AddAssign,
{
    let mut res = T::from(0).unwrap();

    for i in 0..(coeffs.len() as i32) {
        res += value.powi(coeffs.len() as i32 - 1 - i) * coeffs[i as usize];
    }

    res
}

/// Differentiate a polynomial, returning the coefficients of its derivative.
///
/// Coefficient order is highest power first, matching `poly_val`. The
/// derivative of a constant polynomial is the empty coefficient vector, which
/// `poly_val` evaluates to zero.
pub fn poly_deriv<T>(coeffs: &[T]) -> Vec<T>
where
    T: Float,
{
    if coeffs.len() < 2 {
        return vec![];
    }

    let order = coeffs.len() - 1;

    coeffs[..order]
        .iter()
        .enumerate()
        .map(|(i, c)| *c * T::from(order - i).unwrap())
        .collect()
}

/// Clamp a value between a minimum and maximum.
pub fn clamp<T>(value: &T, min: &T, max: &T) -> T
where
    T: Float,
{
    let mut ret = *value;

    if ret > *max {
        ret = *max
    }
    if ret < *min {
        ret = *min
    }

    ret
}

/// Check that every element of a slice is finite.
pub fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
