//! One decoder layer: RMS norm, self-attention, fused residual + norm,
//! gated MLP, final residual.

use crate::attention::SelfAttention;
use crate::error::{EngineError, Result};
use crate::kernels::elemwise;
use crate::kernels::linear::linear;
use crate::kernels::rmsnorm::{rmsnorm, skip_rmsnorm};
use crate::kernels::silu::silu;
use crate::kvcache::KVCache;
use crate::tensor::{DType, Tensor};

pub struct Decoder {
    input_norm: Tensor,
    post_attn_norm: Tensor,
    mlp_gate: Tensor,
    mlp_up: Tensor,
    mlp_down: Tensor,
    self_attn: SelfAttention,
    layer_idx: usize,
    norm_eps: f32,
}

impl Decoder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        input_norm: Tensor,
        self_attn: SelfAttention,
        post_attn_norm: Tensor,
        mlp_gate: Tensor,
        mlp_up: Tensor,
        mlp_down: Tensor,
        layer_idx: usize,
        norm_eps: f32,
    ) -> Self {
        Self {
            input_norm,
            post_attn_norm,
            mlp_gate,
            mlp_up,
            mlp_down,
            self_attn,
            layer_idx,
            norm_eps,
        }
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Queues async prefetches for every weight this layer owns, in the
    /// order of first use.
    pub fn prepare(&mut self) {
        self.input_norm.prefetch_async();
        self.self_attn.prepare();
        self.post_attn_norm.prefetch_async();
        self.mlp_gate.prefetch_async();
        self.mlp_up.prefetch_async();
        self.mlp_down.prefetch_async();
    }

    /// Runs the layer for the token at `token_idx`:
    ///
    /// ```text
    /// a = rmsnorm(input);  b = attn(a);  c = input + b
    /// d = rmsnorm(c)                       (fused with the add)
    /// output = c + down(silu(gate(d)) * up(d))
    /// ```
    pub fn run(
        &mut self,
        input: &[f32],
        token_idx: usize,
        cache: &mut KVCache,
        output: &mut [f32],
    ) -> Result<()> {
        let hidden = input.len();
        if output.len() != hidden {
            return Err(EngineError::Shape(format!(
                "decoder output has {} elements, expected {hidden}",
                output.len()
            )));
        }
        let up_dim = self
            .mlp_up
            .shape()
            .first()
            .copied()
            .unwrap_or_default();

        // Transient buffers, 64-byte aligned like every owned tensor.
        let mut normed = Tensor::zeros(DType::F32, &[hidden])?;
        let mut attn_out = Tensor::zeros(DType::F32, &[hidden])?;
        let mut residual = Tensor::zeros(DType::F32, &[hidden])?;
        let mut gate = Tensor::zeros(DType::F32, &[up_dim])?;
        let mut gate_act = Tensor::zeros(DType::F32, &[up_dim])?;
        let mut up = Tensor::zeros(DType::F32, &[up_dim])?;
        let mut fused = Tensor::zeros(DType::F32, &[up_dim])?;
        let mut mlp_out = Tensor::zeros(DType::F32, &[hidden])?;

        // Pre-attention norm.
        rmsnorm(
            input,
            self.input_norm.as_f32()?,
            normed.as_f32_mut()?,
            1,
            hidden,
            self.norm_eps,
        )?;

        // Self-attention on the normed state.
        self.self_attn
            .run(normed.as_f32()?, token_idx, cache, attn_out.as_f32_mut()?)?;

        // Residual add and post-attention norm, fused: `residual` receives
        // input + attn_out, `normed` its normalization.
        skip_rmsnorm(
            attn_out.as_f32()?,
            input,
            self.post_attn_norm.as_f32()?,
            normed.as_f32_mut()?,
            residual.as_f32_mut()?,
            self.norm_eps,
        )?;

        // Gated MLP: down(silu(gate(d)) * up(d)).
        linear(
            normed.as_f32()?,
            self.mlp_gate.as_f32()?,
            1,
            hidden,
            up_dim,
            gate.as_f32_mut()?,
        )?;
        silu(gate.as_f32()?, gate_act.as_f32_mut()?)?;
        linear(
            normed.as_f32()?,
            self.mlp_up.as_f32()?,
            1,
            hidden,
            up_dim,
            up.as_f32_mut()?,
        )?;
        elemwise::mul(gate_act.as_f32()?, up.as_f32()?, fused.as_f32_mut()?)?;
        linear(
            fused.as_f32()?,
            self.mlp_down.as_f32()?,
            1,
            up_dim,
            hidden,
            mlp_out.as_f32_mut()?,
        )?;

        // Final residual.
        elemwise::add(residual.as_f32()?, mlp_out.as_f32()?, output)?;
        Ok(())
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("layer_idx", &self.layer_idx)
            .field("self_attn", &self.self_attn)
            .finish()
    }
}
