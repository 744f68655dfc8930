//! CPU inference engine for Qwen3-style dense decoders.
//!
//! The crate covers the hot single-token path: a memory-mapped safetensor
//! weight store with zero-copy views and background residency hints, a KV
//! history cache laid out for the grouped-query attention kernel, AVX2
//! numerical primitives with scalar fallbacks, and the per-layer decoder
//! pipeline (RMS norm, self-attention with rotary embeddings, gated MLP).
//!
//! Tokenization and sampling are the caller's responsibility: the engine
//! consumes integer token ids and emits a normalized probability vector
//! over the vocabulary, one token at a time.
//!
//! ```no_run
//! use qwen3_infer::{Qwen3Config, Qwen3Model};
//!
//! # fn main() -> qwen3_infer::Result<()> {
//! let mut model = Qwen3Model::new(Qwen3Config::default())?;
//! model.load_weights("model.safetensors", true)?;
//!
//! let config = model.config().clone();
//! model.process_prompt_token(config.bos_token_id)?;
//! let probabilities = model.predict_next_token(1234)?;
//! assert_eq!(probabilities.len(), config.vocab_size);
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod configuration;
pub mod decoder;
pub mod error;
pub mod kernels;
pub mod kvcache;
pub mod models;
pub mod prefetch;
pub mod rotary;
pub mod safetensors;
pub mod tensor;

pub use configuration::Qwen3Config;
pub use error::{EngineError, Result};
pub use kvcache::KVCache;
pub use models::Qwen3Model;
pub use prefetch::Prefetcher;
pub use rotary::RotaryEmbedding;
pub use safetensors::{Safetensor, TensorInfo};
pub use tensor::{DType, Tensor};
