use num::Float;

/// Panics with the offending tensors logged when `$a` holds a NaN. Used around the log-space
/// box encoding where a degenerate ground truth box turns into `ln(0)`.
#[macro_export]
macro_rules! check_nan {
    ($a:expr, $b:expr, $c: expr) => {{
        use burn::tensor::cast::ToElement;
        if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
            tracing::error!("A = {}", $a);
            tracing::error!("B = {}", $b);
            tracing::error!("C = {}", $c);
            panic!("found nan in line {}", line!());
        }
    }};
}

/// Single tensor variant of [`check_nan!`].
#[macro_export]
macro_rules! check_nan_1 {
    ($a:expr) => {{
        use burn::tensor::cast::ToElement;
        if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
            tracing::error!("A = {}", $a);
            panic!("found nan in line {}", line!());
        };
    }};
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}

/// Relative comparison, `|a - b| <= rel * max(|a|, |b|, 1)`.
pub fn assert_rel_eq<F>(a: &F, b: &F, rel: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    let scale = a.abs().max(b.abs()).max(F::one());
    assert!(
        (*a - *b).abs() <= rel * scale,
        "Values differ: {:?} vs {:?} (relative tolerance: {:?})",
        *a,
        *b,
        rel
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::Tensor,
    };

    #[test]
    fn test_assert_rel_eq_scales_with_magnitude() {
        assert_rel_eq(&1000.0f32, &1000.05, 1e-4);
        assert_rel_eq(&0.0f32, &0.00005, 1e-4);
    }

    #[test]
    #[should_panic]
    fn test_assert_approx_eq_fails_outside_tolerance() {
        assert_approx_eq(&1.0f32, &1.1, 1e-3);
    }

    #[test]
    #[should_panic(expected = "found nan")]
    fn test_check_nan_panics() {
        let device = &NdArrayDevice::default();
        let t = Tensor::<NdArray, 1>::from_floats([1.0, f32::NAN], device);
        check_nan_1!(t);
    }

    #[test]
    fn test_check_nan_passes_finite() {
        let device = &NdArrayDevice::default();
        let t = Tensor::<NdArray, 1>::from_floats([1.0, 2.0], device);
        check_nan!(t, t, t);
    }
}
