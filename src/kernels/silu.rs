//! SiLU activation: `x * sigmoid(x)`, i.e. `x / (1 + exp(-x))`.

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

use crate::error::{EngineError, Result};
#[cfg(target_arch = "x86_64")]
use crate::kernels::exp::exp256;

/// Applies SiLU element-wise. The SIMD loop peels to a 32-byte-aligned
/// input start so the hot loads are aligned; the tail and non-AVX2 path
/// use the exact scalar form.
pub fn silu(x: &[f32], out: &mut [f32]) -> Result<()> {
    if x.len() != out.len() {
        return Err(EngineError::Shape(format!(
            "silu buffers must match: input {} vs output {}",
            x.len(),
            out.len()
        )));
    }
    let n = x.len();
    let mut i = 0;

    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        while i < n && (x.as_ptr() as usize + i * 4) % 32 != 0 {
            out[i] = silu_scalar(x[i]);
            i += 1;
        }
        // SAFETY: features checked; loads are aligned after the peel,
        // stores stay unaligned-tolerant.
        unsafe {
            let vone = _mm256_set1_ps(1.0);
            while i + 8 <= n {
                let vx = _mm256_load_ps(x.as_ptr().add(i));
                let vneg = _mm256_sub_ps(_mm256_setzero_ps(), vx);
                let vexp = exp256(vneg);
                let vsigmoid = _mm256_div_ps(vone, _mm256_add_ps(vone, vexp));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(vx, vsigmoid));
                i += 8;
            }
        }
    }

    while i < n {
        out[i] = silu_scalar(x[i]);
        i += 1;
    }
    Ok(())
}

#[inline]
fn silu_scalar(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}
