//! Inverse transforms from coefficients to residuals
//!
//! Two standardized transform shapes exist: DD (2x2, four layers) and DDS
//! (4x4, sixteen layers). Each has a dedicated variant for LOQ0 when 1D
//! scaling is in use. A second set of entry points folds dequantization
//! into the same call for the single-pass coefficient-to-residual path the
//! decode loop prefers.
//!
//! Lookup is a `match` over the closed (transform, scaling) space. Asking
//! for an accelerated implementation that this build does not provide falls
//! back silently to the scalar one; that fallback is the documented policy.

use crate::config::{ScalingMode, TemporalSignal, TransformType, LAYER_COUNT_DD, LAYER_COUNT_DDS};
use crate::dequant::Dequant;

/// Requested implementation class for transform lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acceleration {
    #[default]
    Scalar,
    /// Reserved for SIMD builds; currently resolves to the scalar path.
    Simd,
}

/// A transform from dequantized coefficients to residuals.
pub type TransformFn = fn(&[i16], &mut [i16]);

/// A transform that dequantizes raw coefficients on the way through.
pub type DequantTransformFn = fn(&Dequant, TemporalSignal, &[i16], &mut [i16]);

#[inline]
fn saturate_i16(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Dequantize `num_layers` coefficients: scale by the layer step-width and
/// push values away from zero by the layer offset. Matches the reference's
/// 16-bit truncating arithmetic.
#[inline]
fn dequant_coeffs(
    dequant: &Dequant,
    temporal: TemporalSignal,
    num_layers: usize,
    coeffs: &[i16],
    out: &mut [i16],
) {
    let temporal = temporal as usize;
    for i in 0..num_layers {
        let sign = i32::from(coeffs[i].signum());
        let scaled = (i32::from(coeffs[i]) * i32::from(dequant.step_width[temporal][i])) as i16;
        out[i] = (i32::from(scaled) + sign * i32::from(dequant.offset[temporal][i])) as i16;
    }
}

/// Inverse 2x2 transform, 1D scaling variant.
pub fn inverse_dd_1d(coeffs: &[i16], residuals: &mut [i16]) {
    let c: [i32; 4] = [
        i32::from(coeffs[0]),
        i32::from(coeffs[1]),
        i32::from(coeffs[2]),
        i32::from(coeffs[3]),
    ];

    residuals[0] = saturate_i16(c[0] + c[1] + c[2]);
    residuals[1] = saturate_i16(c[0] - c[1] - c[2]);
    residuals[2] = saturate_i16(c[3] + c[1] - c[2]);
    residuals[3] = saturate_i16(c[3] - c[1] + c[2]);
}

/// Inverse 2x2 transform, 2D scaling variant.
pub fn inverse_dd_2d(coeffs: &[i16], residuals: &mut [i16]) {
    let c: [i32; 4] = [
        i32::from(coeffs[0]),
        i32::from(coeffs[1]),
        i32::from(coeffs[2]),
        i32::from(coeffs[3]),
    ];

    residuals[0] = saturate_i16(c[0] + c[1] + c[2] + c[3]);
    residuals[1] = saturate_i16(c[0] - c[1] + c[2] - c[3]);
    residuals[2] = saturate_i16(c[0] + c[1] - c[2] - c[3]);
    residuals[3] = saturate_i16(c[0] - c[1] - c[2] + c[3]);
}

/// Butterfly over the four row sums of a 4x4 coefficient block.
#[inline]
fn dds_row_pass(coeffs: &[i16]) -> ([i32; 4], [i32; 4], [i32; 4], [i32; 4]) {
    let mut a = [0i32; 4];
    let mut h = [0i32; 4];
    let mut v = [0i32; 4];
    let mut d = [0i32; 4];

    for row in 0..4 {
        let c0 = i32::from(coeffs[row * 4]);
        let c1 = i32::from(coeffs[row * 4 + 1]);
        let c2 = i32::from(coeffs[row * 4 + 2]);
        let c3 = i32::from(coeffs[row * 4 + 3]);

        a[row] = c0 + c1 + c2 + c3;
        h[row] = c0 - c1 + c2 - c3;
        v[row] = c0 + c1 - c2 - c3;
        d[row] = c0 - c1 - c2 + c3;
    }

    (a, h, v, d)
}

/// Inverse 4x4 transform, 1D scaling variant.
pub fn inverse_dds_1d(coeffs: &[i16], residuals: &mut [i16]) {
    let (a, h, v, d) = dds_row_pass(coeffs);

    for (group, t) in [a, h, v, d].iter().enumerate() {
        let out = &mut residuals[group * 4..group * 4 + 4];
        out[0] = saturate_i16(t[0] + t[1] + t[3]);
        out[1] = saturate_i16(t[0] - t[1] - t[3]);
        out[2] = saturate_i16(t[1] + t[2] - t[3]);
        out[3] = saturate_i16(t[2] - t[1] + t[3]);
    }
}

/// Inverse 4x4 transform, 2D scaling variant.
pub fn inverse_dds_2d(coeffs: &[i16], residuals: &mut [i16]) {
    let (a, h, v, d) = dds_row_pass(coeffs);

    for (group, t) in [a, h, v, d].iter().enumerate() {
        let out = &mut residuals[group * 4..group * 4 + 4];
        out[0] = saturate_i16(t[0] + t[1] + t[2] + t[3]);
        out[1] = saturate_i16(t[0] - t[1] + t[2] - t[3]);
        out[2] = saturate_i16(t[0] + t[1] - t[2] - t[3]);
        out[3] = saturate_i16(t[0] - t[1] - t[2] + t[3]);
    }
}

/// Fused dequantize + inverse DD, 1D variant.
pub fn dequant_inverse_dd_1d(
    dequant: &Dequant,
    temporal: TemporalSignal,
    coeffs: &[i16],
    residuals: &mut [i16],
) {
    let mut dq = [0i16; LAYER_COUNT_DD];
    dequant_coeffs(dequant, temporal, LAYER_COUNT_DD, coeffs, &mut dq);
    inverse_dd_1d(&dq, residuals);
}

/// Fused dequantize + inverse DD, 2D variant.
pub fn dequant_inverse_dd_2d(
    dequant: &Dequant,
    temporal: TemporalSignal,
    coeffs: &[i16],
    residuals: &mut [i16],
) {
    let mut dq = [0i16; LAYER_COUNT_DD];
    dequant_coeffs(dequant, temporal, LAYER_COUNT_DD, coeffs, &mut dq);
    inverse_dd_2d(&dq, residuals);
}

/// Fused dequantize + inverse DDS, 1D variant.
pub fn dequant_inverse_dds_1d(
    dequant: &Dequant,
    temporal: TemporalSignal,
    coeffs: &[i16],
    residuals: &mut [i16],
) {
    let mut dq = [0i16; LAYER_COUNT_DDS];
    dequant_coeffs(dequant, temporal, LAYER_COUNT_DDS, coeffs, &mut dq);
    inverse_dds_1d(&dq, residuals);
}

/// Fused dequantize + inverse DDS, 2D variant.
pub fn dequant_inverse_dds_2d(
    dequant: &Dequant,
    temporal: TemporalSignal,
    coeffs: &[i16],
    residuals: &mut [i16],
) {
    let mut dq = [0i16; LAYER_COUNT_DDS];
    dequant_coeffs(dequant, temporal, LAYER_COUNT_DDS, coeffs, &mut dq);
    inverse_dds_2d(&dq, residuals);
}

/// Best available transform implementation for the request. Never fails:
/// an unavailable accelerated path resolves to the scalar implementation.
pub fn transform_fn(
    transform: TransformType,
    scaling: ScalingMode,
    _acceleration: Acceleration,
) -> TransformFn {
    match (transform, scaling) {
        (TransformType::Dd, ScalingMode::Scale1D) => inverse_dd_1d,
        (TransformType::Dd, _) => inverse_dd_2d,
        (TransformType::Dds, ScalingMode::Scale1D) => inverse_dds_1d,
        (TransformType::Dds, _) => inverse_dds_2d,
    }
}

/// Best available fused dequant + transform implementation for the request.
/// Same fallback policy as [`transform_fn`].
pub fn dequant_transform_fn(
    transform: TransformType,
    scaling: ScalingMode,
    _acceleration: Acceleration,
) -> DequantTransformFn {
    match (transform, scaling) {
        (TransformType::Dd, ScalingMode::Scale1D) => dequant_inverse_dd_1d,
        (TransformType::Dd, _) => dequant_inverse_dd_2d,
        (TransformType::Dds, ScalingMode::Scale1D) => dequant_inverse_dds_1d,
        (TransformType::Dds, _) => dequant_inverse_dds_2d,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dd_2d_dc_only() {
        // A lone average coefficient spreads equally over the 2x2 block.
        let coeffs = [10, 0, 0, 0];
        let mut residuals = [0i16; 4];
        inverse_dd_2d(&coeffs, &mut residuals);
        assert_eq!(residuals, [10, 10, 10, 10]);
    }

    #[test]
    fn test_dd_2d_known_block() {
        let coeffs = [1, 2, 3, 4];
        let mut residuals = [0i16; 4];
        inverse_dd_2d(&coeffs, &mut residuals);
        assert_eq!(residuals, [10, -2, -4, 0]);
    }

    #[test]
    fn test_dd_1d_known_block() {
        let coeffs = [1, 2, 3, 4];
        let mut residuals = [0i16; 4];
        inverse_dd_1d(&coeffs, &mut residuals);
        // [c0+c1+c2, c0-c1-c2, c3+c1-c2, c3-c1+c2]
        assert_eq!(residuals, [6, -4, 3, 5]);
    }

    #[test]
    fn test_dd_saturates() {
        let coeffs = [i16::MAX, i16::MAX, i16::MAX, i16::MAX];
        let mut residuals = [0i16; 4];
        inverse_dd_2d(&coeffs, &mut residuals);
        assert_eq!(residuals[0], i16::MAX);
    }

    #[test]
    fn test_dds_2d_dc_only() {
        let mut coeffs = [0i16; 16];
        coeffs[0] = 5;
        let mut residuals = [0i16; 16];
        inverse_dds_2d(&coeffs, &mut residuals);
        // The AA coefficient contributes to every output through both
        // butterfly passes.
        assert_eq!(residuals, [5i16; 16]);
    }

    #[test]
    fn test_dds_variants_differ() {
        let coeffs: [i16; 16] = core::array::from_fn(|i| i as i16 + 1);
        let mut out_1d = [0i16; 16];
        let mut out_2d = [0i16; 16];
        inverse_dds_1d(&coeffs, &mut out_1d);
        inverse_dds_2d(&coeffs, &mut out_2d);
        assert_ne!(out_1d, out_2d);
    }

    #[test]
    fn test_dequant_fused_matches_manual() {
        let mut dequant = Dequant::default();
        for layer in 0..LAYER_COUNT_DD {
            dequant.step_width[0][layer] = 3;
            dequant.offset[0][layer] = 2;
        }

        let coeffs = [4i16, -4, 0, 1];
        let mut fused = [0i16; 4];
        dequant_inverse_dd_2d(&dequant, TemporalSignal::Inter, &coeffs, &mut fused);

        // Manual: dequantized = coeff * 3 + sign * 2 -> [14, -14, 0, 5].
        let mut manual = [0i16; 4];
        inverse_dd_2d(&[14, -14, 0, 5], &mut manual);
        assert_eq!(fused, manual);
    }

    #[test]
    fn test_lookup_falls_back_to_scalar() {
        // Simd is a silent alias for the scalar path in this build.
        let scalar = transform_fn(TransformType::Dds, ScalingMode::Scale2D, Acceleration::Scalar);
        let simd = transform_fn(TransformType::Dds, ScalingMode::Scale2D, Acceleration::Simd);
        assert_eq!(scalar as usize, simd as usize);
    }

    #[test]
    fn test_lookup_selects_scaling_variant() {
        let one_d = transform_fn(TransformType::Dd, ScalingMode::Scale1D, Acceleration::Scalar);
        let two_d = transform_fn(TransformType::Dd, ScalingMode::Scale2D, Acceleration::Scalar);
        assert_ne!(one_d as usize, two_d as usize);
    }
}
