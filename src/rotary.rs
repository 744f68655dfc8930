//! Rotary positional embeddings.
//!
//! `sin` and `cos` tables are precomputed once at model-load time for every
//! `(position, pair)` combination with `angle(pos, i) = pos * theta^(-2i/h)`,
//! and are read-only afterwards. Application treats each head vector as two
//! halves `(x1, x2)` of length `h/2` and rotates pair-wise:
//! `(x1*c - x2*s, x1*s + x2*c)`.

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

use rayon::prelude::*;

use crate::error::{EngineError, Result};

pub struct RotaryEmbedding {
    sin: Vec<f32>,
    cos: Vec<f32>,
    max_positions: usize,
    head_dim: usize,
}

impl RotaryEmbedding {
    /// Precomputes tables for `max_positions` positions of `head_dim`-sized
    /// heads with rotation base `theta`.
    pub fn new(max_positions: usize, head_dim: usize, theta: f32) -> Result<Self> {
        if max_positions == 0 {
            return Err(EngineError::Range(
                "max_positions must be positive".to_string(),
            ));
        }
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(EngineError::Shape(format!(
                "head_dim must be even and positive, got {head_dim}"
            )));
        }
        if !(theta > 0.0) {
            return Err(EngineError::Range(format!(
                "rotary base must be positive, got {theta}"
            )));
        }

        let half = head_dim / 2;
        let mut sin = vec![0.0f32; max_positions * half];
        let mut cos = vec![0.0f32; max_positions * half];
        for pos in 0..max_positions {
            for i in 0..half {
                let inv_freq = theta.powf(-2.0 * i as f32 / head_dim as f32);
                let angle = pos as f32 * inv_freq;
                sin[pos * half + i] = angle.sin();
                cos[pos * half + i] = angle.cos();
            }
        }
        Ok(Self {
            sin,
            cos,
            max_positions,
            head_dim,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Precomputed sine row for one position.
    pub fn sin_row(&self, position: usize) -> Result<&[f32]> {
        self.check_position(position)?;
        let half = self.head_dim / 2;
        Ok(&self.sin[position * half..(position + 1) * half])
    }

    /// Precomputed cosine row for one position.
    pub fn cos_row(&self, position: usize) -> Result<&[f32]> {
        self.check_position(position)?;
        let half = self.head_dim / 2;
        Ok(&self.cos[position * half..(position + 1) * half])
    }

    /// Rotates `num_heads` consecutive head vectors in place at the given
    /// position, parallel over heads.
    pub fn rotate(&self, vectors: &mut [f32], num_heads: usize, position: usize) -> Result<()> {
        self.check_position(position)?;
        if vectors.len() != num_heads * self.head_dim {
            return Err(EngineError::Shape(format!(
                "expected {num_heads} x {} floats, got {}",
                self.head_dim,
                vectors.len()
            )));
        }
        let half = self.head_dim / 2;
        let sin = &self.sin[position * half..(position + 1) * half];
        let cos = &self.cos[position * half..(position + 1) * half];

        vectors.par_chunks_mut(self.head_dim).for_each(|head| {
            let (x1, x2) = head.split_at_mut(half);
            rotate_half(x1, x2, sin, cos);
        });
        Ok(())
    }

    fn check_position(&self, position: usize) -> Result<()> {
        if position >= self.max_positions {
            return Err(EngineError::Range(format!(
                "position {position} out of range (max positions: {})",
                self.max_positions
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RotaryEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryEmbedding")
            .field("max_positions", &self.max_positions)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

fn rotate_half(x1: &mut [f32], x2: &mut [f32], sin: &[f32], cos: &[f32]) {
    let half = x1.len();
    let mut i = 0;
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") {
        // SAFETY: feature checked; indices stay in bounds.
        unsafe {
            while i + 8 <= half {
                let v1 = _mm256_loadu_ps(x1.as_ptr().add(i));
                let v2 = _mm256_loadu_ps(x2.as_ptr().add(i));
                let vs = _mm256_loadu_ps(sin.as_ptr().add(i));
                let vc = _mm256_loadu_ps(cos.as_ptr().add(i));

                let new1 = _mm256_sub_ps(_mm256_mul_ps(v1, vc), _mm256_mul_ps(v2, vs));
                let new2 = _mm256_add_ps(_mm256_mul_ps(v1, vs), _mm256_mul_ps(v2, vc));

                _mm256_storeu_ps(x1.as_mut_ptr().add(i), new1);
                _mm256_storeu_ps(x2.as_mut_ptr().add(i), new2);
                i += 8;
            }
        }
    }
    while i < half {
        let (a, b) = (x1[i], x2[i]);
        let (s, c) = (sin[i], cos[i]);
        x1[i] = a * c - b * s;
        x2[i] = a * s + b * c;
        i += 1;
    }
}
