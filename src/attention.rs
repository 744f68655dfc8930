//! Per-layer self-attention block.
//!
//! For one token: Q/K/V projection, per-head RMS norm of queries and keys,
//! rotary rotation at the token position, cache append, grouped-query
//! attention over the cached history, output projection.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::kernels::gqa::gqa_forward;
use crate::kernels::linear::linear;
use crate::kernels::rmsnorm::rmsnorm_inplace;
use crate::kvcache::KVCache;
use crate::rotary::RotaryEmbedding;
use crate::tensor::Tensor;

pub struct SelfAttention {
    q_proj: Tensor,
    k_proj: Tensor,
    v_proj: Tensor,
    o_proj: Tensor,
    q_norm: Tensor,
    k_norm: Tensor,
    rope: Arc<RotaryEmbedding>,
    layer_idx: usize,
    embed_dim: usize,
    head_dim: usize,
    num_heads: usize,
    num_groups: usize,
    norm_eps: f32,
    scale: f32,
    // Scratch projections, lazily sized by `prepare`.
    query: Vec<f32>,
    key: Vec<f32>,
    value: Vec<f32>,
}

impl SelfAttention {
    /// Builds the block from its weight views. Dimensions are derived from
    /// the weight shapes, the way the archive declares them.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        q_proj: Tensor,
        k_proj: Tensor,
        v_proj: Tensor,
        o_proj: Tensor,
        q_norm: Tensor,
        k_norm: Tensor,
        rope: Arc<RotaryEmbedding>,
        layer_idx: usize,
        norm_eps: f32,
    ) -> Result<Self> {
        let embed_dim = dim_at(&k_proj, 1, "k_proj")?;
        let head_dim = dim_at(&k_norm, 0, "k_norm")?;
        let q_rows = dim_at(&q_proj, 0, "q_proj")?;
        let k_rows = dim_at(&k_proj, 0, "k_proj")?;
        if head_dim == 0 || q_rows % head_dim != 0 || k_rows % head_dim != 0 {
            return Err(EngineError::Header(format!(
                "layer {layer_idx}: projection rows ({q_rows}, {k_rows}) not divisible by head_dim {head_dim}"
            )));
        }
        let num_heads = q_rows / head_dim;
        let num_groups = k_rows / head_dim;
        if num_groups == 0 || num_heads % num_groups != 0 {
            return Err(EngineError::Header(format!(
                "layer {layer_idx}: {num_heads} query heads not divisible into {num_groups} KV groups"
            )));
        }

        let scale = 1.0 / (head_dim as f32).sqrt();
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            rope,
            layer_idx,
            embed_dim,
            head_dim,
            num_heads,
            num_groups,
            norm_eps,
            scale,
            query: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Sizes the scratch projections and queues async prefetches for every
    /// weight this block owns.
    pub fn prepare(&mut self) {
        if self.query.len() < self.num_heads * self.head_dim {
            self.query.resize(self.num_heads * self.head_dim, 0.0);
        }
        if self.key.len() < self.num_groups * self.head_dim {
            self.key.resize(self.num_groups * self.head_dim, 0.0);
        }
        if self.value.len() < self.num_groups * self.head_dim {
            self.value.resize(self.num_groups * self.head_dim, 0.0);
        }

        self.q_proj.prefetch_async();
        self.k_proj.prefetch_async();
        self.v_proj.prefetch_async();
        self.o_proj.prefetch_async();
        self.q_norm.prefetch_async();
        self.k_norm.prefetch_async();
    }

    /// Transforms one hidden-state vector given the cache up through the
    /// previous token, writing the `[hidden]` result into `output`.
    pub fn run(
        &mut self,
        input: &[f32],
        token_idx: usize,
        cache: &mut KVCache,
        output: &mut [f32],
    ) -> Result<()> {
        let all_heads = self.num_heads * self.head_dim;
        let grouped = self.num_groups * self.head_dim;

        linear(
            input,
            self.q_proj.as_f32()?,
            1,
            self.embed_dim,
            all_heads,
            &mut self.query[..all_heads],
        )?;
        linear(
            input,
            self.k_proj.as_f32()?,
            1,
            self.embed_dim,
            grouped,
            &mut self.key[..grouped],
        )?;
        linear(
            input,
            self.v_proj.as_f32()?,
            1,
            self.embed_dim,
            grouped,
            &mut self.value[..grouped],
        )?;

        rmsnorm_inplace(
            &mut self.query[..all_heads],
            self.q_norm.as_f32()?,
            self.num_heads,
            self.head_dim,
            self.norm_eps,
        )?;
        rmsnorm_inplace(
            &mut self.key[..grouped],
            self.k_norm.as_f32()?,
            self.num_groups,
            self.head_dim,
            self.norm_eps,
        )?;

        self.rope
            .rotate(&mut self.query[..all_heads], self.num_heads, token_idx)?;
        self.rope
            .rotate(&mut self.key[..grouped], self.num_groups, token_idx)?;

        cache.write_current_key(self.layer_idx, &self.key[..grouped])?;
        cache.write_current_value(self.layer_idx, &self.value[..grouped])?;

        gqa_forward(
            &mut self.query[..all_heads],
            cache.layer_keys(self.layer_idx)?,
            cache.layer_values(self.layer_idx)?,
            self.num_heads,
            self.num_groups,
            self.head_dim,
            token_idx + 1,
            cache.max_seq_len(),
            self.scale,
        )?;

        linear(
            &self.query[..all_heads],
            self.o_proj.as_f32()?,
            1,
            all_heads,
            self.embed_dim,
            output,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SelfAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfAttention")
            .field("layer_idx", &self.layer_idx)
            .field("num_heads", &self.num_heads)
            .field("num_groups", &self.num_groups)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

fn dim_at(tensor: &Tensor, axis: usize, name: &str) -> Result<usize> {
    tensor.shape().get(axis).copied().ok_or_else(|| {
        EngineError::Header(format!(
            "{name} weight is missing dimension {axis} (shape {:?})",
            tensor.shape()
        ))
    })
}
