//! General matrix–vector product against weights in (out, in) layout:
//! `out[m, n] = sum_k in[m, k] * w[n, k]`.
//!
//! The hot projections all run with `m = 1`, so the SIMD path parallelizes
//! across the output rows of each input row.

use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::kernels::dot;

/// Selectable implementation; the dispatcher is a `match`, not a table of
/// function pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearImpl {
    Naive,
    Simd,
}

/// Computes `output = input x weight^T` with the best available
/// implementation.
pub fn linear(
    input: &[f32],
    weight: &[f32],
    m: usize,
    k: usize,
    n: usize,
    output: &mut [f32],
) -> Result<()> {
    linear_with(LinearImpl::Simd, input, weight, m, k, n, output)
}

/// Computes `output = input x weight^T` with an explicit implementation
/// choice.
pub fn linear_with(
    implementation: LinearImpl,
    input: &[f32],
    weight: &[f32],
    m: usize,
    k: usize,
    n: usize,
    output: &mut [f32],
) -> Result<()> {
    if input.len() != m * k {
        return Err(EngineError::Shape(format!(
            "linear input has {} elements, expected {m} x {k}",
            input.len()
        )));
    }
    if weight.len() != n * k {
        return Err(EngineError::Shape(format!(
            "linear weight has {} elements, expected {n} x {k}",
            weight.len()
        )));
    }
    if output.len() != m * n {
        return Err(EngineError::Shape(format!(
            "linear output has {} elements, expected {m} x {n}",
            output.len()
        )));
    }
    match implementation {
        LinearImpl::Naive => naive(input, weight, m, k, n, output),
        LinearImpl::Simd => simd(input, weight, m, k, n, output),
    }
    Ok(())
}

/// Strictly sequential triple-loop reference.
fn naive(input: &[f32], weight: &[f32], m: usize, k: usize, n: usize, output: &mut [f32]) {
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for t in 0..k {
                sum += input[i * k + t] * weight[j * k + t];
            }
            output[i * n + j] = sum;
        }
    }
}

fn simd(input: &[f32], weight: &[f32], m: usize, k: usize, n: usize, output: &mut [f32]) {
    for i in 0..m {
        let in_row = &input[i * k..(i + 1) * k];
        let out_row = &mut output[i * n..(i + 1) * n];
        out_row.par_iter_mut().enumerate().for_each(|(j, out)| {
            let w_row = &weight[j * k..(j + 1) * k];
            *out = dot(in_row, w_row);
        });
    }
}
