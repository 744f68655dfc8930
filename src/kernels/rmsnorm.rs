//! RMS normalization: scale each row by `1 / sqrt(mean(x_i^2) + eps)`,
//! then multiply element-wise by the learned gain vector. No mean
//! subtraction.

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

use crate::error::{EngineError, Result};

/// Row-wise RMS norm of `rows x dim` input into an equally shaped output.
pub fn rmsnorm(
    input: &[f32],
    gamma: &[f32],
    output: &mut [f32],
    rows: usize,
    dim: usize,
    eps: f32,
) -> Result<()> {
    check_shapes(input.len(), gamma.len(), output.len(), rows, dim)?;
    for row in 0..rows {
        let x = &input[row * dim..(row + 1) * dim];
        let out = &mut output[row * dim..(row + 1) * dim];
        let denom = inv_rms(x, eps);
        scale_row(x, gamma, denom, out);
    }
    Ok(())
}

/// In-place variant used when the destination is the source buffer, e.g.
/// the per-head query/key norms.
pub fn rmsnorm_inplace(
    data: &mut [f32],
    gamma: &[f32],
    rows: usize,
    dim: usize,
    eps: f32,
) -> Result<()> {
    check_shapes(data.len(), gamma.len(), data.len(), rows, dim)?;
    for row in 0..rows {
        let x = &mut data[row * dim..(row + 1) * dim];
        let denom = inv_rms(x, eps);
        for (value, &weight) in x.iter_mut().zip(gamma.iter()) {
            *value = weight * (*value * denom);
        }
    }
    Ok(())
}

/// Fused residual add + RMS norm: writes `input + skip` into `out_skip`
/// and its normalization into `output`, in one pass over the data.
pub fn skip_rmsnorm(
    input: &[f32],
    skip: &[f32],
    gamma: &[f32],
    output: &mut [f32],
    out_skip: &mut [f32],
    eps: f32,
) -> Result<()> {
    let dim = gamma.len();
    if input.len() != dim || skip.len() != dim || output.len() != dim || out_skip.len() != dim {
        return Err(EngineError::Shape(format!(
            "skip_rmsnorm buffers must all have {dim} elements"
        )));
    }

    // Pass 1: residual sum into out_skip, accumulating sum of squares.
    let mut sum_sq = 0.0f32;
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            let mut vsum = _mm256_setzero_ps();
            while i + 8 <= dim {
                let vin = _mm256_loadu_ps(input.as_ptr().add(i));
                let vskip = _mm256_loadu_ps(skip.as_ptr().add(i));
                let vadd = _mm256_add_ps(vin, vskip);
                _mm256_storeu_ps(out_skip.as_mut_ptr().add(i), vadd);
                vsum = _mm256_add_ps(vsum, _mm256_mul_ps(vadd, vadd));
                i += 8;
            }
            sum_sq += crate::kernels::hsum(vsum);
        }
    }
    while i < dim {
        let v = input[i] + skip[i];
        out_skip[i] = v;
        sum_sq += v * v;
        i += 1;
    }

    let denom = 1.0 / ((sum_sq / dim as f32) + eps).sqrt();

    // Pass 2: normalize the residual sum and apply the gain.
    scale_row(out_skip, gamma, denom, output);
    Ok(())
}

fn check_shapes(
    input_len: usize,
    gamma_len: usize,
    output_len: usize,
    rows: usize,
    dim: usize,
) -> Result<()> {
    if input_len != rows * dim || output_len != rows * dim {
        return Err(EngineError::Shape(format!(
            "rmsnorm expects {rows} x {dim} buffers, got input {input_len} / output {output_len}"
        )));
    }
    if gamma_len != dim {
        return Err(EngineError::Shape(format!(
            "rmsnorm gamma has {gamma_len} elements, expected {dim}"
        )));
    }
    Ok(())
}

/// `1 / sqrt(mean(x^2) + eps)` for one row.
fn inv_rms(x: &[f32], eps: f32) -> f32 {
    let dim = x.len();
    let mut sum_sq = 0.0f32;
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            let mut vsum = _mm256_setzero_ps();
            while i + 8 <= dim {
                let vx = _mm256_loadu_ps(x.as_ptr().add(i));
                vsum = _mm256_add_ps(vsum, _mm256_mul_ps(vx, vx));
                i += 8;
            }
            sum_sq += crate::kernels::hsum(vsum);
        }
    }
    while i < dim {
        sum_sq += x[i] * x[i];
        i += 1;
    }
    1.0 / ((sum_sq / dim as f32) + eps).sqrt()
}

fn scale_row(x: &[f32], gamma: &[f32], denom: f32, out: &mut [f32]) {
    let dim = x.len();
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            let vdenom = _mm256_set1_ps(denom);
            while i + 8 <= dim {
                let vx = _mm256_loadu_ps(x.as_ptr().add(i));
                let vw = _mm256_loadu_ps(gamma.as_ptr().add(i));
                let vnorm = _mm256_mul_ps(vx, vdenom);
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(vw, vnorm));
                i += 8;
            }
        }
    }
    while i < dim {
        out[i] = gamma[i] * x[i] * denom;
        i += 1;
    }
}
