use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{EngineError, Result};
use crate::prefetch::{self, Prefetcher};

/// Alignment of every owned buffer, chosen to permit aligned SIMD loads.
pub(crate) const BUFFER_ALIGN: usize = 64;

/// Element types a weight archive can declare. The inference path consumes
/// `F32` only; the remaining tags exist for the archive boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    I32,
    U8,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
        }
    }

    /// Parses the dtype string used by the archive header.
    pub(crate) fn parse(s: &str) -> Option<DType> {
        match s {
            "F32" => Some(DType::F32),
            "F64" => Some(DType::F64),
            "I32" => Some(DType::I32),
            "U8" => Some(DType::U8),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "F32",
            DType::F64 => "F64",
            DType::I32 => "I32",
            DType::U8 => "U8",
        }
    }
}

/// Heap allocation aligned to [`BUFFER_ALIGN`], zero-initialized.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    pub(crate) fn zeroed(bytes: usize) -> Result<Self> {
        let layout = Layout::from_size_align(bytes.max(1), BUFFER_ALIGN)
            .map_err(|e| EngineError::Range(format!("allocation of {bytes} bytes: {e}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.layout.size());
        // SAFETY: the allocation spans `layout.size()` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `zeroed`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: the buffer is uniquely owned heap memory.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

enum Storage {
    /// Element count is zero; nothing is allocated.
    Empty,
    Owned(AlignedBuf),
    /// Non-owning view into memory managed elsewhere (the weight archive).
    Borrowed { ptr: *const u8, mmapped: bool },
}

/// Shape-tagged float buffer: either an owned, 64-byte-aligned allocation
/// or a borrowed view into the weight archive.
///
/// Ownership and the mmap flag are mutually exclusive for destruction: a
/// borrowed view never frees its backing, regardless of where it points.
pub struct Tensor {
    storage: Storage,
    shape: Vec<usize>,
    dtype: DType,
}

impl Tensor {
    /// Allocates a zero-initialized owned tensor. A zero in any dimension
    /// yields an empty tensor with no backing allocation.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Tensor> {
        let numel = element_count(shape);
        let storage = if numel == 0 {
            Storage::Empty
        } else {
            let bytes = numel
                .checked_mul(dtype.size())
                .ok_or_else(|| EngineError::Range(format!("tensor shape {shape:?} overflows")))?;
            Storage::Owned(AlignedBuf::zeroed(bytes)?)
        };
        Ok(Tensor {
            storage,
            shape: shape.to_vec(),
            dtype,
        })
    }

    /// Wraps externally managed memory as a read-only view.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for `element_count(shape) * dtype.size()` bytes
    /// for as long as the view (or any tensor moved out of it) is alive.
    /// The archive that hands out views keeps its backing storage mapped for
    /// its own lifetime; the model driver in turn keeps the archive alive
    /// for as long as its decoder blocks hold views.
    pub(crate) unsafe fn from_raw_parts(
        ptr: *const u8,
        shape: Vec<usize>,
        dtype: DType,
        mmapped: bool,
    ) -> Tensor {
        let storage = if element_count(&shape) == 0 {
            Storage::Empty
        } else {
            Storage::Borrowed { ptr, mmapped }
        };
        Tensor {
            storage,
            shape,
            dtype,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Product of the shape dimensions; zero for an empty shape.
    pub fn numel(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn byte_size(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    pub fn is_mmapped(&self) -> bool {
        matches!(self.storage, Storage::Borrowed { mmapped: true, .. })
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    pub(crate) fn data_ptr(&self) -> *const u8 {
        match &self.storage {
            Storage::Empty => std::ptr::null(),
            Storage::Owned(buf) => buf.as_ptr(),
            Storage::Borrowed { ptr, .. } => *ptr,
        }
    }

    /// Read access as a float slice.
    pub fn as_f32(&self) -> Result<&[f32]> {
        if self.dtype != DType::F32 {
            return Err(EngineError::Shape(format!(
                "expected F32 tensor, got {}",
                self.dtype.name()
            )));
        }
        let numel = self.numel();
        if numel == 0 {
            return Ok(&[]);
        }
        // SAFETY: storage spans `numel * 4` bytes and the pointer is
        // 4-byte aligned (owned buffers are 64-byte aligned; archive views
        // are alignment-checked at creation).
        Ok(unsafe { std::slice::from_raw_parts(self.data_ptr() as *const f32, numel) })
    }

    /// Mutable access as a float slice. Fails on borrowed views, which are
    /// read-only by construction.
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        if self.dtype != DType::F32 {
            return Err(EngineError::Shape(format!(
                "expected F32 tensor, got {}",
                self.dtype.name()
            )));
        }
        let numel = self.numel();
        match &mut self.storage {
            Storage::Empty => Ok(&mut []),
            Storage::Owned(buf) => {
                // SAFETY: owned allocation spans `numel * 4` aligned bytes.
                Ok(unsafe {
                    std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut f32, numel)
                })
            }
            Storage::Borrowed { .. } => Err(EngineError::State(
                "cannot mutate a borrowed tensor view".to_string(),
            )),
        }
    }

    /// Replaces the shape; the element count must be preserved.
    pub fn reshape(&mut self, new_shape: &[usize]) -> Result<()> {
        let new_numel = element_count(new_shape);
        if new_numel != self.numel() {
            return Err(EngineError::Shape(format!(
                "reshape {:?} -> {:?} changes element count ({} != {})",
                self.shape,
                new_shape,
                self.numel(),
                new_numel
            )));
        }
        self.shape = new_shape.to_vec();
        Ok(())
    }

    /// Issues a blocking residency hint for the view's byte range. Returns
    /// whether a hint was actually issued; owned buffers are already
    /// resident and report `false`.
    pub fn prefetch_sync(&self) -> bool {
        if !self.is_mmapped() || self.numel() == 0 {
            return false;
        }
        prefetch::advise_willneed(self.data_ptr(), self.byte_size())
    }

    /// Enqueues the view's byte range on the background prefetch worker and
    /// returns immediately. No-op on owned buffers.
    pub fn prefetch_async(&self) {
        if !self.is_mmapped() || self.numel() == 0 {
            return;
        }
        Prefetcher::global().enqueue(self.data_ptr(), self.byte_size());
    }
}

// SAFETY: owned storage is uniquely held; borrowed pointers reference the
// archive's read-only backing, which outlives every view by construction.
unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype.name())
            .field("owned", &self.is_owned())
            .field("mmapped", &self.is_mmapped())
            .finish()
    }
}

fn element_count(shape: &[usize]) -> usize {
    if shape.is_empty() {
        return 0;
    }
    shape.iter().product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_buffers_are_aligned_and_zeroed() {
        let tensor = Tensor::zeros(DType::F32, &[3, 5]).unwrap();
        assert_eq!(tensor.numel(), 15);
        assert_eq!(tensor.byte_size(), 60);
        assert_eq!(tensor.data_ptr() as usize % BUFFER_ALIGN, 0);
        assert!(tensor.as_f32().unwrap().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn zero_dimension_yields_empty_tensor() {
        let tensor = Tensor::zeros(DType::F32, &[4, 0, 2]).unwrap();
        assert_eq!(tensor.numel(), 0);
        assert!(tensor.as_f32().unwrap().is_empty());
        assert!(!tensor.is_owned());
    }

    #[test]
    fn reshape_preserves_element_count() {
        let mut tensor = Tensor::zeros(DType::F32, &[4, 6]).unwrap();
        tensor.reshape(&[2, 12]).unwrap();
        assert_eq!(tensor.shape(), &[2, 12]);
        assert!(matches!(
            tensor.reshape(&[5, 5]),
            Err(EngineError::Shape(_))
        ));
    }

    #[test]
    fn borrowed_view_rejects_mutation() {
        let backing = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut view = unsafe {
            Tensor::from_raw_parts(backing.as_ptr() as *const u8, vec![4], DType::F32, false)
        };
        assert_eq!(view.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert!(matches!(view.as_f32_mut(), Err(EngineError::State(_))));
    }

    #[test]
    fn dtype_mismatch_is_reported() {
        let tensor = Tensor::zeros(DType::U8, &[8]).unwrap();
        assert!(matches!(tensor.as_f32(), Err(EngineError::Shape(_))));
    }

    #[test]
    fn prefetch_on_owned_buffer_is_a_noop() {
        let tensor = Tensor::zeros(DType::F32, &[16]).unwrap();
        assert!(!tensor.prefetch_sync());
        tensor.prefetch_async(); // silently ignored
    }
}
