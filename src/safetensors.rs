//! Safetensor weight archive: a little-endian `u64` header length, a JSON
//! object describing tensors, and the raw tensor bytes.
//!
//! The archive exposes tensors as zero-copy views. The backing storage is
//! either a read-only shared memory mapping (eligible for residency hints)
//! or an owned 64-byte-aligned buffer read from disk once.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;
use memmap2::Mmap;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::tensor::{AlignedBuf, DType, Tensor};

const HEADER_LEN_BYTES: usize = 8;

/// One header record: element type, row-major shape, and the `[begin, end)`
/// byte range relative to the first byte after the JSON header.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data_offsets: (usize, usize),
}

impl TensorInfo {
    pub fn byte_size(&self) -> usize {
        self.data_offsets.1 - self.data_offsets.0
    }
}

enum Backing {
    /// Read-only shared mapping of the whole file; tensor data begins at
    /// `data_offset`.
    Mapped { map: Mmap, data_offset: usize },
    /// Tensor data copied into an aligned owned buffer.
    Memory { buf: AlignedBuf, len: usize },
}

/// Parsed safetensor archive. Holds its backing storage (mapping or owned
/// buffer) for its entire lifetime; views handed out by [`view_f32`] borrow
/// that storage and must not outlive the archive.
///
/// [`view_f32`]: Safetensor::view_f32
pub struct Safetensor {
    /// Records in header insertion order; consumers rely on reproducible
    /// enumeration.
    tensors: Vec<(String, TensorInfo)>,
    index: HashMap<String, usize>,
    metadata: HashMap<String, String>,
    backing: Backing,
}

impl Safetensor {
    /// Opens an archive, either memory-mapping the file or reading it into
    /// an owned buffer.
    pub fn open(path: impl AsRef<Path>, use_mmap: bool) -> Result<Safetensor> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let (tensors, metadata, backing) = if use_mmap {
            // SAFETY: read-only shared mapping; the file is treated as
            // immutable for the archive's lifetime.
            let map = unsafe { Mmap::map(&file)? };
            if map.len() < HEADER_LEN_BYTES {
                return Err(EngineError::Header(format!(
                    "file too small for a header: {} bytes",
                    map.len()
                )));
            }
            let header_len = LittleEndian::read_u64(&map[..HEADER_LEN_BYTES]) as usize;
            let data_offset = HEADER_LEN_BYTES
                .checked_add(header_len)
                .filter(|&end| end <= map.len())
                .ok_or_else(|| {
                    EngineError::Header(format!("header length {header_len} exceeds file size"))
                })?;
            let data_len = map.len() - data_offset;
            let (tensors, metadata) =
                parse_header(&map[HEADER_LEN_BYTES..data_offset], data_len)?;
            (tensors, metadata, Backing::Mapped { map, data_offset })
        } else {
            let file_len = file.metadata()?.len() as usize;
            if file_len < HEADER_LEN_BYTES {
                return Err(EngineError::Header(format!(
                    "file too small for a header: {file_len} bytes"
                )));
            }
            let header_len = file.read_u64::<LittleEndian>()? as usize;
            let data_offset = HEADER_LEN_BYTES
                .checked_add(header_len)
                .filter(|&end| end <= file_len)
                .ok_or_else(|| {
                    EngineError::Header(format!("header length {header_len} exceeds file size"))
                })?;
            let mut header = vec![0u8; header_len];
            file.read_exact(&mut header)?;
            let data_len = file_len - data_offset;
            let (tensors, metadata) = parse_header(&header, data_len)?;
            let mut buf = AlignedBuf::zeroed(data_len)?;
            file.read_exact(buf.as_mut_slice(data_len))?;
            (tensors, metadata, Backing::Memory { buf, len: data_len })
        };

        let index = tensors
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();

        debug!(
            "opened weight archive {} ({} tensors, {} metadata entries, mmap={})",
            path.display(),
            tensors.len(),
            metadata.len(),
            use_mmap
        );
        Ok(Safetensor {
            tensors,
            index,
            metadata,
            backing,
        })
    }

    /// Tensor names in original header insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|(name, _)| name.as_str())
    }

    pub fn lookup(&self, name: &str) -> Option<&TensorInfo> {
        self.index.get(name).map(|&i| &self.tensors[i].1)
    }

    /// Byte length of a tensor's data range; zero when the name is absent.
    pub fn byte_size(&self, name: &str) -> usize {
        self.lookup(name).map(TensorInfo::byte_size).unwrap_or(0)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Dumps every header record through the logging facade, for inspecting
    /// unfamiliar archives.
    pub fn log_header(&self) {
        for (key, value) in &self.metadata {
            debug!("__metadata__ {key}: {value}");
        }
        for (name, info) in &self.tensors {
            debug!(
                "tensor {name}: dtype {} shape {:?} offsets [{}, {})",
                info.dtype.name(),
                info.shape,
                info.data_offsets.0,
                info.data_offsets.1
            );
        }
    }

    pub fn is_mmapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }

    /// Returns a non-owning, read-only view of an `F32` tensor. The view's
    /// lifetime is bounded by the archive: it holds a raw pointer into the
    /// archive's backing storage, so the archive must be kept alive for as
    /// long as the view is used.
    pub fn view_f32(&self, name: &str) -> Result<Tensor> {
        let info = self
            .lookup(name)
            .ok_or_else(|| EngineError::Header(format!("missing tensor: {name}")))?;
        if info.dtype != DType::F32 {
            return Err(EngineError::Header(format!(
                "tensor {name} has dtype {}, expected F32",
                info.dtype.name()
            )));
        }
        let data = self.data();
        let bytes = &data[info.data_offsets.0..info.data_offsets.1];
        if bytes.as_ptr() as usize % DType::F32.size() != 0 {
            return Err(EngineError::Header(format!(
                "tensor {name} data is not aligned for F32 access"
            )));
        }
        // SAFETY: the range was bounds-checked at parse time and the
        // backing storage outlives the archive; the model driver keeps the
        // archive alive for as long as any view exists.
        Ok(unsafe {
            Tensor::from_raw_parts(
                bytes.as_ptr(),
                info.shape.clone(),
                DType::F32,
                self.is_mmapped(),
            )
        })
    }

    fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped { map, data_offset } => &map[*data_offset..],
            Backing::Memory { buf, len } => {
                // SAFETY: the buffer was filled with exactly `len` bytes.
                unsafe { std::slice::from_raw_parts(buf.as_ptr(), *len) }
            }
        }
    }
}

impl std::fmt::Debug for Safetensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safetensor")
            .field("tensors", &self.tensors.len())
            .field("metadata", &self.metadata.len())
            .field("mmapped", &self.is_mmapped())
            .finish()
    }
}

/// Parses the JSON header object. Every entry is either `__metadata__`
/// (a string-to-string map) or a tensor record with `dtype`, `shape`, and
/// `data_offsets`. Any deviation fails with a header error; an archive is
/// never partially constructed.
fn parse_header(
    bytes: &[u8],
    data_len: usize,
) -> Result<(Vec<(String, TensorInfo)>, HashMap<String, String>)> {
    let root: serde_json::Map<String, Value> = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::Header(format!("invalid JSON header: {e}")))?;

    let mut tensors = Vec::with_capacity(root.len());
    let mut metadata = HashMap::new();

    for (name, value) in root {
        if name == "__metadata__" {
            let map = value.as_object().ok_or_else(|| {
                EngineError::Header("__metadata__ must be an object".to_string())
            })?;
            for (key, entry) in map {
                let text = entry.as_str().ok_or_else(|| {
                    EngineError::Header(format!("__metadata__ entry {key} must be a string"))
                })?;
                metadata.insert(key.clone(), text.to_string());
            }
            continue;
        }

        let record = value
            .as_object()
            .ok_or_else(|| EngineError::Header(format!("tensor {name} must be an object")))?;

        let dtype = record
            .get("dtype")
            .and_then(Value::as_str)
            .and_then(DType::parse)
            .ok_or_else(|| {
                EngineError::Header(format!("tensor {name} has a missing or unknown dtype"))
            })?;

        let shape = record
            .get("shape")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Header(format!("tensor {name} is missing its shape")))?
            .iter()
            .map(|dim| {
                dim.as_u64().map(|d| d as usize).ok_or_else(|| {
                    EngineError::Header(format!("tensor {name} has a non-integer dimension"))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let offsets = record
            .get("data_offsets")
            .and_then(Value::as_array)
            .filter(|arr| arr.len() == 2)
            .ok_or_else(|| {
                EngineError::Header(format!(
                    "tensor {name} must carry a two-element data_offsets array"
                ))
            })?;
        let begin = offsets[0].as_u64().map(|v| v as usize);
        let end = offsets[1].as_u64().map(|v| v as usize);
        let (begin, end) = match (begin, end) {
            (Some(begin), Some(end)) if begin <= end && end <= data_len => (begin, end),
            _ => {
                return Err(EngineError::Header(format!(
                    "tensor {name} has offsets outside the file"
                )))
            }
        };

        let expected = shape.iter().product::<usize>() * dtype.size();
        if expected != end - begin {
            return Err(EngineError::Header(format!(
                "tensor {name}: shape {shape:?} needs {expected} bytes, offsets span {}",
                end - begin
            )));
        }

        tensors.push((
            name,
            TensorInfo {
                dtype,
                shape,
                data_offsets: (begin, end),
            },
        ));
    }

    Ok((tensors, metadata))
}
