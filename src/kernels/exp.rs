//! Fast exponential approximation.
//!
//! Inputs are clamped to ±88.3762626647949 (the largest magnitude whose
//! exponential is finite in f32), then range-reduced as `x = m·ln2 + r`
//! with `|r| <= ln2/2` so that a short Taylor expansion of `exp(r)` scaled
//! by `2^m` stays within ~1e-4 relative error.
//!
//! The in-place softmax only ever feeds non-positive arguments here (after
//! max subtraction), so the positive clamp is unreachable from that path;
//! it is enforced regardless.

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

/// Largest input magnitude before the approximation saturates.
pub const EXP_CLAMP: f32 = 88.376_263;

const LN2: f32 = std::f32::consts::LN_2;
const INV_LN2: f32 = std::f32::consts::LOG2_E;

/// Scalar counterpart of the vector approximation, lane-equivalent.
pub fn exp_approx(x: f32) -> f32 {
    let x = x.clamp(-EXP_CLAMP, EXP_CLAMP);

    let m = (x * INV_LN2 + 0.5).floor();
    let r = x - m * LN2;

    let r2 = r * r;
    let r3 = r2 * r;
    let r4 = r3 * r;
    let poly = 1.0 + r + r2 * 0.5 + r3 * (1.0 / 6.0) + r4 * (1.0 / 24.0);

    // 2^m assembled directly in the exponent field.
    let pow2 = f32::from_bits((((m as i32) + 127) as u32) << 23);
    poly * pow2
}

/// Eight-lane exponential approximation; the softmax and SiLU kernels keep
/// their hot loops in this form.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn exp256(x: __m256) -> __m256 {
    let x = _mm256_min_ps(x, _mm256_set1_ps(EXP_CLAMP));
    let x = _mm256_max_ps(x, _mm256_set1_ps(-EXP_CLAMP));

    let ln2 = _mm256_set1_ps(LN2);
    let inv_ln2 = _mm256_set1_ps(INV_LN2);

    // m = floor(x / ln2 + 0.5); r = x - m * ln2
    let m = _mm256_floor_ps(_mm256_fmadd_ps(x, inv_ln2, _mm256_set1_ps(0.5)));
    let r = _mm256_fnmadd_ps(m, ln2, x);

    let c1 = _mm256_set1_ps(1.0);
    let c2 = _mm256_set1_ps(0.5);
    let c3 = _mm256_set1_ps(1.0 / 6.0);
    let c4 = _mm256_set1_ps(1.0 / 24.0);

    let r2 = _mm256_mul_ps(r, r);
    let r3 = _mm256_mul_ps(r2, r);
    let r4 = _mm256_mul_ps(r3, r);

    let mut poly = _mm256_add_ps(c1, r);
    poly = _mm256_fmadd_ps(r2, c2, poly);
    poly = _mm256_fmadd_ps(r3, c3, poly);
    poly = _mm256_fmadd_ps(r4, c4, poly);

    // Scale by 2^m through the exponent field.
    let mut exponent = _mm256_cvtps_epi32(m);
    exponent = _mm256_add_epi32(exponent, _mm256_set1_epi32(127));
    exponent = _mm256_slli_epi32(exponent, 23);
    let pow2 = _mm256_castsi256_ps(exponent);

    _mm256_mul_ps(poly, pow2)
}
