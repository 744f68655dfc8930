//! Shared fixtures: safetensor archive writers for the integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use qwen3_infer::Qwen3Config;

/// One tensor destined for a test archive.
pub struct TensorFixture {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorFixture {
    pub fn new(name: &str, shape: &[usize], data: Vec<f32>) -> Self {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            data,
        }
    }
}

/// Writes a safetensor file: little-endian u64 header length, JSON header
/// with entries in the given order, then the raw tensor bytes. The header
/// is padded with trailing spaces so the data section stays 8-byte aligned,
/// as the format's writers do.
pub fn write_archive(path: &Path, metadata: Option<&str>, tensors: &[TensorFixture]) -> Result<()> {
    let mut entries = Vec::new();
    if let Some(meta) = metadata {
        entries.push(format!("\"__metadata__\":{meta}"));
    }
    let mut offset = 0usize;
    for tensor in tensors {
        let bytes = tensor.data.len() * 4;
        let dims = tensor
            .shape
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        entries.push(format!(
            "\"{}\":{{\"dtype\":\"F32\",\"shape\":[{dims}],\"data_offsets\":[{offset},{}]}}",
            tensor.name,
            offset + bytes
        ));
        offset += bytes;
    }
    let mut header = format!("{{{}}}", entries.join(","));
    while (8 + header.len()) % 8 != 0 {
        header.push(' ');
    }

    let mut file = File::create(path)?;
    file.write_u64::<LittleEndian>(header.len() as u64)?;
    file.write_all(header.as_bytes())?;
    for tensor in tensors {
        for &value in &tensor.data {
            file.write_f32::<LittleEndian>(value)?;
        }
    }
    Ok(())
}

/// Writes a raw file with an arbitrary header payload, for malformed-header
/// cases.
pub fn write_raw_archive(path: &Path, header: &str, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_u64::<LittleEndian>(header.len() as u64)?;
    file.write_all(header.as_bytes())?;
    file.write_all(data)?;
    Ok(())
}

/// A configuration small enough for exhaustive end-to-end runs.
pub fn tiny_config() -> Qwen3Config {
    Qwen3Config {
        hidden_size: 8,
        intermediate_size: 16,
        max_position_embeddings: 8,
        num_attention_heads: 2,
        num_hidden_layers: 2,
        num_key_value_heads: 1,
        rms_norm_eps: 1e-6,
        rope_theta: 1_000_000.0,
        vocab_size: 11,
        bos_token_id: 0,
        eos_token_id: 1,
    }
}

/// How a model fixture fills its weights.
#[derive(Clone, Copy)]
pub enum WeightFill {
    /// Projections and embeddings all zero, gain vectors all one.
    ZeroWithUnitGains,
    /// Small deterministic pseudo-random values everywhere.
    Patterned,
}

fn fill_values(name: &str, len: usize, fill: WeightFill) -> Vec<f32> {
    match fill {
        WeightFill::ZeroWithUnitGains => {
            if name.ends_with("layernorm.weight")
                || name.ends_with("norm.weight")
            {
                vec![1.0; len]
            } else {
                vec![0.0; len]
            }
        }
        WeightFill::Patterned => {
            let seed: u32 = name.bytes().fold(17u32, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as u32)
            });
            (0..len)
                .map(|i| {
                    let x = seed.wrapping_add(i as u32).wrapping_mul(2_654_435_761);
                    ((x >> 8) as f32 / (1u32 << 24) as f32 - 0.5) * 0.2
                })
                .collect()
        }
    }
}

/// Builds the complete tensor set the model driver expects for `config`.
pub fn model_tensors(config: &Qwen3Config, fill: WeightFill) -> Vec<TensorFixture> {
    let hidden = config.hidden_size;
    let head_dim = config.head_dim();
    let all_heads = config.num_attention_heads * head_dim;
    let grouped = config.num_key_value_heads * head_dim;
    let inter = config.intermediate_size;

    let mut specs: Vec<(String, Vec<usize>)> = vec![
        (
            "model.embed_tokens.weight".to_string(),
            vec![config.vocab_size, hidden],
        ),
        ("model.norm.weight".to_string(), vec![hidden]),
    ];
    for layer in 0..config.num_hidden_layers {
        let prefix = format!("model.layers.{layer}.");
        specs.push((format!("{prefix}input_layernorm.weight"), vec![hidden]));
        specs.push((
            format!("{prefix}post_attention_layernorm.weight"),
            vec![hidden],
        ));
        specs.push((
            format!("{prefix}self_attn.q_proj.weight"),
            vec![all_heads, hidden],
        ));
        specs.push((
            format!("{prefix}self_attn.k_proj.weight"),
            vec![grouped, hidden],
        ));
        specs.push((
            format!("{prefix}self_attn.v_proj.weight"),
            vec![grouped, hidden],
        ));
        specs.push((
            format!("{prefix}self_attn.o_proj.weight"),
            vec![hidden, all_heads],
        ));
        specs.push((format!("{prefix}self_attn.q_norm.weight"), vec![head_dim]));
        specs.push((format!("{prefix}self_attn.k_norm.weight"), vec![head_dim]));
        specs.push((format!("{prefix}mlp.gate_proj.weight"), vec![inter, hidden]));
        specs.push((format!("{prefix}mlp.up_proj.weight"), vec![inter, hidden]));
        specs.push((format!("{prefix}mlp.down_proj.weight"), vec![hidden, inter]));
    }

    specs
        .into_iter()
        .map(|(name, shape)| {
            let len = shape.iter().product();
            let data = fill_values(&name, len, fill);
            TensorFixture {
                name,
                shape,
                data,
            }
        })
        .collect()
}

/// Writes a full model archive for `config` into `path`.
pub fn write_model_archive(path: &Path, config: &Qwen3Config, fill: WeightFill) -> Result<()> {
    write_archive(path, None, &model_tensors(config, fill))
}
