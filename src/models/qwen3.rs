//! Model driver for a Qwen3-style dense decoder.
//!
//! **Data flow for one token**: embedding row copy into the hidden-state
//! buffer, in-place update through every decoder layer, final RMS norm,
//! projection through the tied embedding matrix, softmax. The KV cache is
//! the only state that survives across tokens.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::configuration::Qwen3Config;
use crate::decoder::Decoder;
use crate::error::{EngineError, Result};
use crate::kernels::linear::linear;
use crate::kernels::rmsnorm::rmsnorm;
use crate::kernels::softmax::softmax;
use crate::kvcache::KVCache;
use crate::rotary::RotaryEmbedding;
use crate::safetensors::Safetensor;
use crate::tensor::{DType, Tensor};

/// Wraps one named archive tensor as a read-only view and checks its shape
/// against what the configuration demands.
fn wrap_tensor(weights: &Safetensor, name: &str, expected_shape: &[usize]) -> Result<Tensor> {
    let tensor = weights.view_f32(name)?;
    if tensor.shape() != expected_shape {
        return Err(EngineError::Header(format!(
            "tensor {name} has shape {:?}, expected {expected_shape:?}",
            tensor.shape()
        )));
    }
    Ok(tensor)
}

/// Single-sequence, single-token inference driver.
///
/// Calls must be serialized by the caller; the model is not safe for
/// concurrent `predict_next_token` invocations.
pub struct Qwen3Model {
    config: Qwen3Config,
    head_dim: usize,
    tokens_processed: usize,

    // `weights` must stay alive for as long as the decoder blocks hold
    // views into it; it is replaced only after the blocks are dropped.
    weights: Option<Safetensor>,
    kv_cache: Option<KVCache>,
    decoders: Vec<Decoder>,

    embedding_weight: Option<Tensor>,
    final_norm_weight: Option<Tensor>,

    hidden_state: Tensor,
    decoder_output: Tensor,
    norm_output: Tensor,
    logits: Vec<f32>,
}

impl Qwen3Model {
    pub fn new(config: Qwen3Config) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        Ok(Self {
            head_dim,
            tokens_processed: 0,
            weights: None,
            kv_cache: None,
            decoders: Vec::new(),
            embedding_weight: None,
            final_norm_weight: None,
            hidden_state: Tensor::zeros(DType::F32, &[hidden])?,
            decoder_output: Tensor::zeros(DType::F32, &[hidden])?,
            norm_output: Tensor::zeros(DType::F32, &[hidden])?,
            logits: vec![0.0; config.vocab_size],
            config,
        })
    }

    pub fn config(&self) -> &Qwen3Config {
        &self.config
    }

    /// Tokens accepted since construction or the last `reset_cache`.
    pub fn tokens_processed(&self) -> usize {
        self.tokens_processed
    }

    /// Opens the weight archive and builds the full decoder stack.
    ///
    /// Wraps the embedding and final-norm tensors, precomputes the rotary
    /// tables, sizes the KV cache, and constructs one prepared decoder per
    /// layer from the ten tensors under its `model.layers.<l>.` prefix.
    pub fn load_weights(&mut self, path: impl AsRef<Path>, use_mmap: bool) -> Result<()> {
        let config = self.config.clone();
        let hidden = config.hidden_size;
        let head_dim = self.head_dim;
        let all_heads = config.num_attention_heads * head_dim;
        let grouped = config.num_key_value_heads * head_dim;

        // Old views die before the archive they borrow from.
        self.decoders.clear();
        self.embedding_weight = None;
        self.final_norm_weight = None;

        let weights = Safetensor::open(path, use_mmap)?;
        if log::log_enabled!(log::Level::Debug) {
            weights.log_header();
        }

        let embedding = wrap_tensor(
            &weights,
            "model.embed_tokens.weight",
            &[config.vocab_size, hidden],
        )?;
        let final_norm = wrap_tensor(&weights, "model.norm.weight", &[hidden])?;

        let rope = Arc::new(RotaryEmbedding::new(
            config.max_position_embeddings,
            head_dim,
            config.rope_theta,
        )?);

        let mut kv_cache = KVCache::new(
            config.num_hidden_layers,
            config.num_key_value_heads,
            config.max_position_embeddings,
            head_dim,
        )?;

        let mut decoders = Vec::with_capacity(config.num_hidden_layers);
        for layer in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{layer}.");

            let input_norm =
                wrap_tensor(&weights, &format!("{prefix}input_layernorm.weight"), &[hidden])?;
            let post_attn_norm = wrap_tensor(
                &weights,
                &format!("{prefix}post_attention_layernorm.weight"),
                &[hidden],
            )?;

            let q_proj = wrap_tensor(
                &weights,
                &format!("{prefix}self_attn.q_proj.weight"),
                &[all_heads, hidden],
            )?;
            let k_proj = wrap_tensor(
                &weights,
                &format!("{prefix}self_attn.k_proj.weight"),
                &[grouped, hidden],
            )?;
            let v_proj = wrap_tensor(
                &weights,
                &format!("{prefix}self_attn.v_proj.weight"),
                &[grouped, hidden],
            )?;
            let o_proj = wrap_tensor(
                &weights,
                &format!("{prefix}self_attn.o_proj.weight"),
                &[hidden, all_heads],
            )?;
            let q_norm = wrap_tensor(
                &weights,
                &format!("{prefix}self_attn.q_norm.weight"),
                &[head_dim],
            )?;
            let k_norm = wrap_tensor(
                &weights,
                &format!("{prefix}self_attn.k_norm.weight"),
                &[head_dim],
            )?;

            let mlp_gate = wrap_tensor(
                &weights,
                &format!("{prefix}mlp.gate_proj.weight"),
                &[config.intermediate_size, hidden],
            )?;
            let mlp_up = wrap_tensor(
                &weights,
                &format!("{prefix}mlp.up_proj.weight"),
                &[config.intermediate_size, hidden],
            )?;
            let mlp_down = wrap_tensor(
                &weights,
                &format!("{prefix}mlp.down_proj.weight"),
                &[hidden, config.intermediate_size],
            )?;

            let self_attn = crate::attention::SelfAttention::new(
                q_proj,
                k_proj,
                v_proj,
                o_proj,
                q_norm,
                k_norm,
                Arc::clone(&rope),
                layer,
                config.rms_norm_eps,
            )?;

            let mut decoder = Decoder::new(
                input_norm,
                self_attn,
                post_attn_norm,
                mlp_gate,
                mlp_up,
                mlp_down,
                layer,
                config.rms_norm_eps,
            );
            decoder.prepare();
            debug!("layer {layer}: decoder wired and prefetching");
            decoders.push(decoder);
        }

        kv_cache.reset();
        self.tokens_processed = 0;

        self.embedding_weight = Some(embedding);
        self.final_norm_weight = Some(final_norm);
        self.kv_cache = Some(kv_cache);
        self.decoders = decoders;
        self.weights = Some(weights);

        info!(
            "loaded {} decoder layers ({} heads / {} groups, head_dim {}, KV cache {} MiB)",
            self.config.num_hidden_layers,
            self.config.num_attention_heads,
            self.config.num_key_value_heads,
            self.head_dim,
            self.kv_cache.as_ref().map(KVCache::total_memory_bytes).unwrap_or(0) >> 20,
        );
        Ok(())
    }

    /// Rewinds the KV cache and token counter for a fresh sequence, without
    /// reallocating.
    pub fn reset_cache(&mut self) -> Result<()> {
        self.ensure_weights_loaded()?;
        let cache = self
            .kv_cache
            .as_mut()
            .ok_or_else(|| EngineError::State("KV cache has not been initialized".to_string()))?;
        cache.reset();
        self.tokens_processed = 0;
        Ok(())
    }

    /// Feeds one prompt token through the decoder stack, updating the cache
    /// but producing no logits.
    pub fn process_prompt_token(&mut self, token_id: usize) -> Result<()> {
        self.ensure_weights_loaded()?;
        self.check_token_valid(token_id)?;
        self.ensure_position_capacity()?;

        self.embed_token(token_id)?;
        let token_index = self.current_token_index()?;
        self.run_decoder_stack(token_index)?;

        self.advance()?;
        Ok(())
    }

    /// Feeds one token and returns the normalized next-token distribution
    /// over the vocabulary.
    pub fn predict_next_token(&mut self, token_id: usize) -> Result<&[f32]> {
        self.ensure_weights_loaded()?;
        self.check_token_valid(token_id)?;
        self.ensure_position_capacity()?;

        self.embed_token(token_id)?;
        let token_index = self.current_token_index()?;
        self.run_decoder_stack(token_index)?;
        self.apply_final_norm()?;
        self.run_lm_head()?;

        self.advance()?;
        Ok(&self.logits)
    }

    fn ensure_weights_loaded(&self) -> Result<()> {
        if self.weights.is_none()
            || self.embedding_weight.is_none()
            || self.final_norm_weight.is_none()
        {
            return Err(EngineError::State(
                "model weights have not been loaded".to_string(),
            ));
        }
        Ok(())
    }

    fn check_token_valid(&self, token_id: usize) -> Result<()> {
        if token_id >= self.config.vocab_size {
            return Err(EngineError::Range(format!(
                "token id {token_id} outside vocabulary of {}",
                self.config.vocab_size
            )));
        }
        Ok(())
    }

    /// The upcoming `advance` must succeed before any layer work starts, so
    /// a full cache can never leave a token half-applied.
    fn ensure_position_capacity(&self) -> Result<()> {
        let cache = self
            .kv_cache
            .as_ref()
            .ok_or_else(|| EngineError::State("KV cache unavailable".to_string()))?;
        if cache.remaining() <= 1 {
            return Err(EngineError::Capacity(format!(
                "exceeded maximum position embeddings ({})",
                cache.max_seq_len()
            )));
        }
        Ok(())
    }

    fn current_token_index(&self) -> Result<usize> {
        self.kv_cache
            .as_ref()
            .map(KVCache::current_index)
            .ok_or_else(|| EngineError::State("KV cache unavailable".to_string()))
    }

    fn advance(&mut self) -> Result<()> {
        let cache = self
            .kv_cache
            .as_mut()
            .ok_or_else(|| EngineError::State("KV cache unavailable".to_string()))?;
        cache.advance()?;
        self.tokens_processed += 1;
        Ok(())
    }

    /// Copies one embedding row into the hidden-state buffer.
    fn embed_token(&mut self, token_id: usize) -> Result<()> {
        let hidden = self.config.hidden_size;
        let embedding = self
            .embedding_weight
            .as_ref()
            .ok_or_else(|| EngineError::State("embedding weight unavailable".to_string()))?
            .as_f32()?;
        let row = &embedding[token_id * hidden..(token_id + 1) * hidden];
        self.hidden_state.as_f32_mut()?.copy_from_slice(row);
        Ok(())
    }

    /// Runs every decoder layer, ping-ponging between the two hidden-state
    /// buffers; afterwards `hidden_state` holds the final state.
    fn run_decoder_stack(&mut self, token_index: usize) -> Result<()> {
        let cache = self
            .kv_cache
            .as_mut()
            .ok_or_else(|| EngineError::State("KV cache unavailable".to_string()))?;

        let mut input = &mut self.hidden_state;
        let mut output = &mut self.decoder_output;
        for decoder in &mut self.decoders {
            // The borrow of `input` ends before `output` is written; the
            // buffers swap roles every layer to avoid copies.
            decoder.run(input.as_f32()?, token_index, cache, output.as_f32_mut()?)?;
            std::mem::swap(&mut input, &mut output);
        }

        // After an odd layer count the final state sits in the auxiliary
        // buffer; swap ownership so `hidden_state` always holds it.
        if self.decoders.len() % 2 == 1 {
            std::mem::swap(&mut self.hidden_state, &mut self.decoder_output);
        }
        Ok(())
    }

    fn apply_final_norm(&mut self) -> Result<()> {
        let gamma = self
            .final_norm_weight
            .as_ref()
            .ok_or_else(|| EngineError::State("final norm weight unavailable".to_string()))?
            .as_f32()?;
        rmsnorm(
            self.hidden_state.as_f32()?,
            gamma,
            self.norm_output.as_f32_mut()?,
            1,
            self.config.hidden_size,
            self.config.rms_norm_eps,
        )
    }

    /// Projects through the tied embedding matrix and normalizes in place.
    fn run_lm_head(&mut self) -> Result<()> {
        let embedding = self
            .embedding_weight
            .as_ref()
            .ok_or_else(|| EngineError::State("embedding weight unavailable".to_string()))?
            .as_f32()?;
        linear(
            self.norm_output.as_f32()?,
            embedding,
            1,
            self.config.hidden_size,
            self.config.vocab_size,
            &mut self.logits,
        )?;
        softmax(&mut self.logits);
        Ok(())
    }
}

impl std::fmt::Debug for Qwen3Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qwen3Model")
            .field("config", &self.config)
            .field("layers", &self.decoders.len())
            .field("tokens_processed", &self.tokens_processed)
            .field("loaded", &self.weights.is_some())
            .finish()
    }
}
