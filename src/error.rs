use thiserror::Error;

/// Error taxonomy for the inference engine.
///
/// Kernels and the weight archive surface errors upward; the model driver
/// validates preconditions (token range, position capacity) before doing
/// any work, so a returned error never leaves partially updated state.
#[derive(Debug, Error)]
pub enum EngineError {
    /// File open/read failures, mapping failures.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed archive header, missing required tensor, or a stored
    /// shape incompatible with the model configuration.
    #[error("malformed weight archive: {0}")]
    Header(String),

    /// A tensor or buffer whose dimensions violate a kernel contract.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Token id, layer/group/position index, or configuration value out of
    /// its valid range.
    #[error("out of range: {0}")]
    Range(String),

    /// KV cache advance past its last position, or an attempt to process a
    /// token beyond the maximum position embeddings.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// API called before `load_weights`, or a mutation attempted through a
    /// read-only view.
    #[error("invalid state: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
