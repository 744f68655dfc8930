use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Model hyper-parameters for a Qwen3-style dense decoder.
///
/// Defaults match the Qwen3 1.7B release. The configuration is immutable
/// per model instance; `validate` is called once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Qwen3Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub vocab_size: usize,
    pub bos_token_id: usize,
    pub eos_token_id: usize,
}

impl Default for Qwen3Config {
    fn default() -> Self {
        Self {
            hidden_size: 2048,
            intermediate_size: 6144,
            max_position_embeddings: 40960,
            num_attention_heads: 16,
            num_hidden_layers: 28,
            num_key_value_heads: 8,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            vocab_size: 151_936,
            bos_token_id: 151_643,
            eos_token_id: 151_645,
        }
    }
}

impl Qwen3Config {
    /// Per-head feature dimension, `hidden_size / num_attention_heads`.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Checks every dimension constraint the decoder stack relies on.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("num_attention_heads", self.num_attention_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_key_value_heads", self.num_key_value_heads),
            ("vocab_size", self.vocab_size),
        ];
        for (name, value) in dimensions {
            if value == 0 {
                return Err(EngineError::Range(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(self.rms_norm_eps > 0.0) {
            return Err(EngineError::Range(format!(
                "rms_norm_eps must be positive, got {}",
                self.rms_norm_eps
            )));
        }
        if !(self.rope_theta > 0.0) {
            return Err(EngineError::Range(format!(
                "rope_theta must be positive, got {}",
                self.rope_theta
            )));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(EngineError::Shape(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(EngineError::Shape(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(EngineError::Shape(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        Ok(())
    }
}
