//! Key/value history cache for the decoder stack.
//!
//! Keys and values each live in one contiguous, zero-initialized allocation
//! logically shaped `[layers, groups, positions, head_dim]`, so that for a
//! fixed `(layer, group)` all token positions occupy one contiguous
//! `positions x head_dim` tile. The attention kernel walks that tile with
//! sequentially increasing addresses.
//!
//! A single `current_index` is shared across layers: one token updates every
//! layer before the next token begins, so all layers advance together.

use crate::error::{EngineError, Result};
use crate::tensor::{DType, Tensor};

pub struct KVCache {
    keys: Tensor,
    values: Tensor,
    num_layers: usize,
    num_groups: usize,
    max_seq_len: usize,
    head_dim: usize,
    current: usize,
}

impl KVCache {
    pub fn new(
        num_layers: usize,
        num_groups: usize,
        max_seq_len: usize,
        head_dim: usize,
    ) -> Result<Self> {
        let dimensions = [
            ("num_layers", num_layers),
            ("num_groups", num_groups),
            ("max_seq_len", max_seq_len),
            ("head_dim", head_dim),
        ];
        for (name, value) in dimensions {
            if value == 0 {
                return Err(EngineError::Range(format!(
                    "KV cache {name} must be positive"
                )));
            }
        }
        let shape = [num_layers, num_groups, max_seq_len, head_dim];
        Ok(Self {
            keys: Tensor::zeros(DType::F32, &shape)?,
            values: Tensor::zeros(DType::F32, &shape)?,
            num_layers,
            num_groups,
            max_seq_len,
            head_dim,
            current: 0,
        })
    }

    #[inline]
    fn offset(&self, layer: usize, group: usize, token: usize) -> usize {
        ((layer * self.num_groups + group) * self.max_seq_len + token) * self.head_dim
    }

    fn check_indices(&self, layer: usize, group: usize, token: usize) -> Result<()> {
        if layer >= self.num_layers {
            return Err(EngineError::Range(format!(
                "layer index {layer} out of range (layers: {})",
                self.num_layers
            )));
        }
        if group >= self.num_groups {
            return Err(EngineError::Range(format!(
                "group index {group} out of range (groups: {})",
                self.num_groups
            )));
        }
        if token >= self.max_seq_len {
            return Err(EngineError::Range(format!(
                "token index {token} out of range (max positions: {})",
                self.max_seq_len
            )));
        }
        Ok(())
    }

    /// Appends the concatenated `[groups * head_dim]` key vector at the
    /// current position, splitting it across groups.
    pub fn write_current_key(&mut self, layer: usize, key: &[f32]) -> Result<()> {
        self.write_current(layer, key, true)
    }

    /// As [`write_current_key`](Self::write_current_key), for values.
    pub fn write_current_value(&mut self, layer: usize, value: &[f32]) -> Result<()> {
        self.write_current(layer, value, false)
    }

    fn write_current(&mut self, layer: usize, data: &[f32], is_key: bool) -> Result<()> {
        self.check_indices(layer, 0, self.current)?;
        if data.len() != self.num_groups * self.head_dim {
            return Err(EngineError::Shape(format!(
                "expected {} floats ({} groups x {}), got {}",
                self.num_groups * self.head_dim,
                self.num_groups,
                self.head_dim,
                data.len()
            )));
        }
        let (num_groups, max_seq_len, head_dim) = (self.num_groups, self.max_seq_len, self.head_dim);
        let current = self.current;
        let storage = if is_key {
            self.keys.as_f32_mut()?
        } else {
            self.values.as_f32_mut()?
        };
        for group in 0..num_groups {
            let offset = ((layer * num_groups + group) * max_seq_len + current) * head_dim;
            let src = &data[group * head_dim..(group + 1) * head_dim];
            storage[offset..offset + head_dim].copy_from_slice(src);
        }
        Ok(())
    }

    /// The contiguous `[max_seq_len, head_dim]` key tile for one
    /// `(layer, group)` pair. The attention kernel reads the first
    /// `current_index + 1` rows.
    pub fn key_slab(&self, layer: usize, group: usize) -> Result<&[f32]> {
        self.check_indices(layer, group, 0)?;
        let start = self.offset(layer, group, 0);
        let len = self.max_seq_len * self.head_dim;
        Ok(&self.keys.as_f32()?[start..start + len])
    }

    /// As [`key_slab`](Self::key_slab), for values.
    pub fn value_slab(&self, layer: usize, group: usize) -> Result<&[f32]> {
        self.check_indices(layer, group, 0)?;
        let start = self.offset(layer, group, 0);
        let len = self.max_seq_len * self.head_dim;
        Ok(&self.values.as_f32()?[start..start + len])
    }

    /// All key tiles of one layer, contiguous in `[groups, max_seq_len,
    /// head_dim]` order — the layout the attention kernel consumes.
    pub fn layer_keys(&self, layer: usize) -> Result<&[f32]> {
        self.check_indices(layer, 0, 0)?;
        let start = self.offset(layer, 0, 0);
        let len = self.num_groups * self.max_seq_len * self.head_dim;
        Ok(&self.keys.as_f32()?[start..start + len])
    }

    /// As [`layer_keys`](Self::layer_keys), for values.
    pub fn layer_values(&self, layer: usize) -> Result<&[f32]> {
        self.check_indices(layer, 0, 0)?;
        let start = self.offset(layer, 0, 0);
        let len = self.num_groups * self.max_seq_len * self.head_dim;
        Ok(&self.values.as_f32()?[start..start + len])
    }

    /// Single stored key vector at an explicit position.
    pub fn key_at(&self, layer: usize, group: usize, token: usize) -> Result<&[f32]> {
        self.check_indices(layer, group, token)?;
        let start = self.offset(layer, group, token);
        Ok(&self.keys.as_f32()?[start..start + self.head_dim])
    }

    /// Single stored value vector at an explicit position.
    pub fn value_at(&self, layer: usize, group: usize, token: usize) -> Result<&[f32]> {
        self.check_indices(layer, group, token)?;
        let start = self.offset(layer, group, token);
        Ok(&self.values.as_f32()?[start..start + self.head_dim])
    }

    /// Moves the shared write position forward by one. Fails once the last
    /// valid write position would no longer be addressable.
    pub fn advance(&mut self) -> Result<()> {
        if self.current >= self.max_seq_len - 1 {
            return Err(EngineError::Capacity(format!(
                "token limit reached: {}",
                self.max_seq_len
            )));
        }
        self.current += 1;
        Ok(())
    }

    /// Rewinds to position zero without touching storage; stale contents
    /// beyond the new write position are never read.
    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn remaining(&self) -> usize {
        self.max_seq_len - self.current
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Total bytes held by both caches.
    pub fn total_memory_bytes(&self) -> usize {
        self.keys.byte_size() + self.values.byte_size()
    }
}

impl std::fmt::Debug for KVCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KVCache")
            .field("num_layers", &self.num_layers)
            .field("num_groups", &self.num_groups)
            .field("max_seq_len", &self.max_seq_len)
            .field("head_dim", &self.head_dim)
            .field("current_index", &self.current)
            .finish()
    }
}
