//! Grouped-query attention over cached history.
//!
//! Query heads share KV groups: head `a` attends with group
//! `a / (num_heads / num_groups)`. Keys and values arrive as the cache's
//! per-layer slabs in `[groups, max_seq_len, head_dim]` order, so a head
//! walks its group's tile with sequentially increasing addresses.

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::kernels::{dot, softmax::softmax};

/// Single-position attention: scores each query head against the first
/// `seq_len` cached rows of its group, softmaxes, and accumulates the
/// weighted values. The result overwrites `query` in place — each head
/// reads its own query row exactly once before writing it.
#[allow(clippy::too_many_arguments)]
pub fn gqa_forward(
    query: &mut [f32],
    keys: &[f32],
    values: &[f32],
    num_heads: usize,
    num_groups: usize,
    head_dim: usize,
    seq_len: usize,
    max_seq_len: usize,
    scale: f32,
) -> Result<()> {
    if num_groups == 0 || num_heads % num_groups != 0 {
        return Err(EngineError::Shape(format!(
            "num_heads ({num_heads}) must be a multiple of num_groups ({num_groups})"
        )));
    }
    if seq_len == 0 || seq_len > max_seq_len {
        return Err(EngineError::Shape(format!(
            "seq_len {seq_len} outside [1, {max_seq_len}]"
        )));
    }
    if query.len() != num_heads * head_dim {
        return Err(EngineError::Shape(format!(
            "query has {} elements, expected {num_heads} x {head_dim}",
            query.len()
        )));
    }
    let slab = num_groups * max_seq_len * head_dim;
    if keys.len() != slab || values.len() != slab {
        return Err(EngineError::Shape(format!(
            "cache slabs must hold {num_groups} x {max_seq_len} x {head_dim} floats"
        )));
    }

    let heads_per_group = num_heads / num_groups;
    query
        .par_chunks_mut(head_dim)
        .enumerate()
        .for_each(|(head, q)| {
            let group = head / heads_per_group;
            let tile = group * max_seq_len * head_dim;
            let key_tile = &keys[tile..tile + seq_len * head_dim];
            let value_tile = &values[tile..tile + seq_len * head_dim];

            let mut scores = vec![0.0f32; seq_len];
            for (pos, score) in scores.iter_mut().enumerate() {
                let key_row = &key_tile[pos * head_dim..(pos + 1) * head_dim];
                *score = dot(q, key_row) * scale;
            }
            softmax(&mut scores);

            // q has been consumed; reuse it as the output accumulator.
            let first_value = &value_tile[..head_dim];
            scale_into(scores[0], first_value, q);
            for (pos, &weight) in scores.iter().enumerate().skip(1) {
                let value_row = &value_tile[pos * head_dim..(pos + 1) * head_dim];
                axpy(weight, value_row, q);
            }
        });

    Ok(())
}

/// `out[i] = weight * v[i]`.
fn scale_into(weight: f32, v: &[f32], out: &mut [f32]) {
    let n = out.len();
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            let vw = _mm256_set1_ps(weight);
            while i + 8 <= n {
                let vv = _mm256_loadu_ps(v.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(vw, vv));
                i += 8;
            }
        }
    }
    while i < n {
        out[i] = weight * v[i];
        i += 1;
    }
}

/// `out[i] += weight * v[i]`.
fn axpy(weight: f32, v: &[f32], out: &mut [f32]) {
    let n = out.len();
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        // SAFETY: features checked; indices stay in bounds.
        unsafe {
            let vw = _mm256_set1_ps(weight);
            while i + 8 <= n {
                let vv = _mm256_loadu_ps(v.as_ptr().add(i));
                let vout = _mm256_loadu_ps(out.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_fmadd_ps(vw, vv, vout));
                i += 8;
            }
        }
    }
    while i < n {
        out[i] += weight * v[i];
        i += 1;
    }
}
