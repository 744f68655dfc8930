//! Element-wise add and multiply over contiguous buffers.

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

use rayon::prelude::*;

use crate::error::{EngineError, Result};

/// Chunk granularity for the parallel add; residual vectors shorter than
/// this run on the calling thread.
const PAR_CHUNK: usize = 4096;

/// `out[i] = a[i] + b[i]`, parallel across chunks for long buffers.
pub fn add(a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
    check_lengths(a.len(), b.len(), out.len())?;
    if out.len() <= PAR_CHUNK {
        add_chunk(a, b, out);
        return Ok(());
    }
    out.par_chunks_mut(PAR_CHUNK)
        .zip(a.par_chunks(PAR_CHUNK))
        .zip(b.par_chunks(PAR_CHUNK))
        .for_each(|((out_chunk, a_chunk), b_chunk)| {
            add_chunk(a_chunk, b_chunk, out_chunk);
        });
    Ok(())
}

/// `out[i] = a[i] * b[i]`.
pub fn mul(a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
    check_lengths(a.len(), b.len(), out.len())?;
    let n = out.len();
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vb = _mm256_loadu_ps(b.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(va, vb));
                i += 8;
            }
        }
    }
    while i < n {
        out[i] = a[i] * b[i];
        i += 1;
    }
    Ok(())
}

fn add_chunk(a: &[f32], b: &[f32], out: &mut [f32]) {
    let n = out.len();
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vb = _mm256_loadu_ps(b.as_ptr().add(i));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_add_ps(va, vb));
                i += 8;
            }
        }
    }
    while i < n {
        out[i] = a[i] + b[i];
        i += 1;
    }
}

fn check_lengths(a: usize, b: usize, out: usize) -> Result<()> {
    if a != b || a != out {
        return Err(EngineError::Shape(format!(
            "element-wise operands must match: a={a}, b={b}, out={out}"
        )));
    }
    Ok(())
}
