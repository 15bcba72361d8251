//! Host buffers exchanged through a process group.
//!
//! A [`Buffer`] is a typed, shaped view over a reference-counted host
//! allocation. Cloning a buffer clones the view, not the memory, which is
//! what lets a [`Work`](crate::Work) keep the memory of an in-flight
//! operation alive and lets the layout reconciler recognise buffers that are
//! already packed back to back in one allocation.
//!
//! # Aliasing
//!
//! Views over the same allocation may overlap, and the substrate writes
//! through raw pointers while an operation is pending. As with any
//! asynchronous communication API, callers must not read or write a buffer
//! until the [`Work`](crate::Work) that borrowed it has completed.

use crate::datatype::{Element, ElementType};
use crate::error::{Error, Result};
use std::alloc::{self, Layout as AllocLayout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment of every backing allocation.
const STORAGE_ALIGN: usize = 64;

/// Memory layout of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Dense strided storage
    #[default]
    Strided,
    /// Sparse (coordinate) storage, never communicable
    Sparse,
}

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Host-addressable memory
    #[default]
    Host,
    /// Accelerator memory, identified by ordinal
    Accelerator(u32),
}

/// Reference-counted backing allocation.
struct Storage {
    ptr: NonNull<u8>,
    bytes: usize,
}

// Storage is a plain heap allocation; synchronisation of its contents is the
// caller's responsibility, as documented at module level.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn zeroed(bytes: usize) -> Self {
        if bytes == 0 {
            return Storage {
                ptr: NonNull::<u64>::dangling().cast(),
                bytes: 0,
            };
        }
        let layout = Self::layout(bytes);
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Storage { ptr, bytes }
    }

    fn layout(bytes: usize) -> AllocLayout {
        match AllocLayout::from_size_align(bytes, STORAGE_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("buffer of {bytes} bytes exceeds the address space"),
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.bytes != 0 {
            // SAFETY: allocated in `zeroed` with the same layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.bytes)) };
        }
    }
}

/// A typed, shaped view over shared host memory.
///
/// # Example
///
/// ```
/// use ferrocoll::Buffer;
///
/// let flat = Buffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[4]).unwrap();
/// let parts = flat.split_with_sizes(&[1, 3]).unwrap();
/// assert!(parts[1].same_storage(&flat));
/// assert_eq!(parts[1].offset(), 1);
/// assert_eq!(parts[1].to_vec::<f32>().unwrap(), vec![2.0, 3.0, 4.0]);
/// ```
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    dtype: ElementType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    layout: Layout,
    device: Device,
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1].max(1);
    }
    strides
}

impl Buffer {
    /// Allocate a zero-filled buffer.
    pub fn zeros(dtype: ElementType, shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Buffer {
            storage: Arc::new(Storage::zeroed(numel * dtype.size_of())),
            dtype,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            offset: 0,
            layout: Layout::Strided,
            device: Device::Host,
        }
    }

    /// Allocate a zero-length one-dimensional buffer.
    pub fn empty(dtype: ElementType) -> Self {
        Self::zeros(dtype, &[0])
    }

    /// Allocate a buffer holding a copy of `data` with the given shape.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        Error::check(numel == data.len(), || {
            format!("shape {shape:?} holds {numel} elements, got {}", data.len())
        })?;
        let buf = Self::zeros(T::DTYPE, shape);
        buf.write_contiguous(bytemuck::cast_slice(data));
        Ok(buf)
    }

    /// Allocate a one-dimensional buffer from a vector.
    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        let buf = Self::zeros(T::DTYPE, &[data.len()]);
        buf.write_contiguous(bytemuck::cast_slice(data.as_slice()));
        buf
    }

    /// Allocate a `[buffers.len(), ...]` buffer able to hold every buffer
    /// of `buffers` back to back, typed like the first one.
    pub fn new_flat_like(buffers: &[Buffer]) -> Result<Self> {
        let first = buffers
            .first()
            .ok_or_else(|| Error::validation("cannot build a flat buffer from an empty list"))?;
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(buffers.len());
        shape.extend_from_slice(&first.shape);
        Ok(Self::zeros(first.dtype, &shape))
    }

    /// Element type.
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    /// Dimensions of the view.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Strides of the view, in elements.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset of the first element within the backing allocation, in elements.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of elements in the view.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the view in bytes.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }

    /// Size of dimension 0.
    pub fn leading_dim(&self) -> Result<usize> {
        self.shape
            .first()
            .copied()
            .ok_or_else(|| Error::validation("dimension 0 requested on a zero-dimensional buffer"))
    }

    /// Memory layout.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Memory location.
    pub fn device(&self) -> Device {
        self.device
    }

    /// True if the view has no gaps: row-major strides over its shape.
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// True for contiguous, strided, host-resident buffers.
    pub fn is_dense(&self) -> bool {
        self.layout == Layout::Strided && self.device == Device::Host && self.is_contiguous()
    }

    /// True if both views share the same backing allocation.
    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Pointer to the first element of the view.
    pub fn as_ptr(&self) -> *const u8 {
        self.as_mut_ptr().cast_const()
    }

    /// Mutable pointer to the first element of the view.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        if self.storage.bytes == 0 {
            return self.storage.ptr.as_ptr();
        }
        // SAFETY: every view is bounds-checked against its storage on creation.
        unsafe { self.storage.ptr.as_ptr().add(self.offset * self.dtype.size_of()) }
    }

    /// Same memory, described with a different layout.
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Same memory, described as living on `device`.
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Reinterpret a contiguous view with a new shape.
    pub fn view(&self, shape: &[usize]) -> Result<Buffer> {
        Error::check(self.is_contiguous(), || {
            "view requires a contiguous buffer".to_string()
        })?;
        let numel: usize = shape.iter().product();
        Error::check(numel == self.numel(), || {
            format!("cannot view {} elements as {shape:?}", self.numel())
        })?;
        Ok(Buffer {
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            ..self.clone()
        })
    }

    /// One-dimensional view of a contiguous buffer.
    pub fn flatten(&self) -> Result<Buffer> {
        self.view(&[self.numel()])
    }

    /// Sub-view of `len` rows starting at row `start` along dimension 0.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Buffer> {
        let rows = self.leading_dim()?;
        Error::check(start + len <= rows, || {
            format!("narrow [{start}, {}) exceeds dimension 0 of size {rows}", start + len)
        })?;
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Buffer {
            shape,
            offset: self.offset + start * self.strides[0],
            ..self.clone()
        })
    }

    /// Consecutive sub-views along dimension 0 with the given row counts.
    pub fn split_with_sizes(&self, sizes: &[usize]) -> Result<Vec<Buffer>> {
        let total: usize = sizes.iter().sum();
        Error::check(total == self.leading_dim()?, || {
            format!("split sizes sum to {total}, dimension 0 is {}", self.shape[0])
        })?;
        let mut start = 0;
        sizes
            .iter()
            .map(|&len| {
                let part = self.narrow(start, len);
                start += len;
                part
            })
            .collect()
    }

    /// One-dimensional view of `len` elements starting where this view
    /// starts, possibly reaching past its end into the same allocation.
    pub(crate) fn extent(&self, len: usize) -> Result<Buffer> {
        let end = (self.offset + len) * self.dtype.size_of();
        Error::check(len == 0 || end <= self.storage.bytes, || {
            format!("extent of {len} elements at offset {} exceeds the allocation", self.offset)
        })?;
        Ok(Buffer {
            shape: vec![len],
            strides: vec![1],
            ..self.clone()
        })
    }

    /// Swap two dimensions without moving data.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Buffer> {
        let ndim = self.shape.len();
        Error::check(dim0 < ndim && dim1 < ndim, || {
            format!("transpose({dim0}, {dim1}) on a {ndim}-dimensional buffer")
        })?;
        let mut out = self.clone();
        out.shape.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        Ok(out)
    }

    /// Copy the elements of the view into a vector, in row-major order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Error::check(T::DTYPE == self.dtype, || {
            format!("buffer holds {:?}, requested {:?}", self.dtype, T::DTYPE)
        })?;
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.numel()];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(out.as_mut_slice());
        let width = self.dtype.size_of();
        let base = self.storage.ptr.as_ptr();
        for (i, off) in self.element_offsets().into_iter().enumerate() {
            // SAFETY: offsets lie inside the storage; see module docs on aliasing.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    base.add(off * width),
                    dst.as_mut_ptr().add(i * width),
                    width,
                );
            }
        }
        Ok(out)
    }

    /// Overwrite the elements of the view from a slice, in row-major order.
    pub fn copy_from_slice<T: Element>(&self, data: &[T]) -> Result<()> {
        Error::check(T::DTYPE == self.dtype, || {
            format!("buffer holds {:?}, got {:?}", self.dtype, T::DTYPE)
        })?;
        Error::check(data.len() == self.numel(), || {
            format!("buffer holds {} elements, got {}", self.numel(), data.len())
        })?;
        let src: &[u8] = bytemuck::cast_slice(data);
        let width = self.dtype.size_of();
        let base = self.storage.ptr.as_ptr();
        for (i, off) in self.element_offsets().into_iter().enumerate() {
            // SAFETY: offsets lie inside the storage.
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(i * width), base.add(off * width), width);
            }
        }
        Ok(())
    }

    /// Copy `src` into this view element by element (row-major order on both
    /// sides). Element type and count must match; shapes may differ.
    pub fn copy_from(&self, src: &Buffer) -> Result<()> {
        Error::check(src.dtype == self.dtype, || {
            format!("copy from {:?} into {:?}", src.dtype, self.dtype)
        })?;
        Error::check(src.numel() == self.numel(), || {
            format!("copy of {} elements into {}", src.numel(), self.numel())
        })?;
        if self.numel() == 0 {
            return Ok(());
        }
        if self.is_contiguous() && src.is_contiguous() {
            // SAFETY: both ranges are in bounds; `copy` tolerates overlap.
            unsafe { std::ptr::copy(src.as_ptr(), self.as_mut_ptr(), self.nbytes()) };
            return Ok(());
        }
        let width = self.dtype.size_of();
        let src_base = src.storage.ptr.as_ptr();
        let dst_base = self.storage.ptr.as_ptr();
        for (s, d) in src.element_offsets().into_iter().zip(self.element_offsets()) {
            // SAFETY: offsets lie inside their storages.
            unsafe { std::ptr::copy(src_base.add(s * width), dst_base.add(d * width), width) };
        }
        Ok(())
    }

    fn write_contiguous(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.nbytes());
        if !bytes.is_empty() {
            // SAFETY: freshly allocated contiguous view of exactly this size.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_mut_ptr(), bytes.len()) };
        }
    }

    /// Storage offsets of every element, in row-major order.
    fn element_offsets(&self) -> Vec<usize> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let mut index = vec![0usize; self.shape.len()];
        for _ in 0..numel {
            let off: usize = index
                .iter()
                .zip(&self.strides)
                .map(|(i, s)| i * s)
                .sum();
            out.push(self.offset + off);
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        out
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .field("layout", &self.layout)
            .field("device", &self.device)
            .finish()
    }
}
