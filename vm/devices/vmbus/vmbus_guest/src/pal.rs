// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the bus manager and the host OS: memory, MSR access, and
//! child device node registration.

use crate::BusError;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// An opaque handle to a published child device node.
pub type NodeHandle = u64;

/// Attributes carried by a published child device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttributes {
    /// Always `"hyperv"`.
    pub bus: &'static str,
    /// Human-readable device name.
    pub pretty_name: String,
    /// The channel id backing the node.
    pub channel_id: u32,
    /// Device type UUID, 36 lowercase characters.
    pub type_id: String,
    /// Device instance UUID, 36 lowercase characters.
    pub instance_id: String,
}

/// A physically contiguous allocation handed out by the platform.
pub struct RawAlloc {
    /// Virtual address of the first byte.
    pub ptr: NonNull<u8>,
    /// Guest physical address of the first byte.
    pub gpa: u64,
}

/// Host OS primitives consumed by the bus manager.
///
/// Implementations are provided by the embedding kernel glue; the crate's
/// tests provide an in-process fake.
pub trait Platform: Send + Sync {
    /// Allocates `len` bytes of zeroed, physically contiguous, page-aligned
    /// memory.
    fn alloc_contiguous(&self, len: usize) -> Result<RawAlloc, BusError>;

    /// Allocates one zeroed page that is mapped executable, for the
    /// hypercall thunk.
    fn alloc_executable_page(&self) -> Result<RawAlloc, BusError>;

    /// Releases an allocation made by [`Self::alloc_contiguous`] or
    /// [`Self::alloc_executable_page`].
    fn free_contiguous(&self, ptr: NonNull<u8>, len: usize);

    fn cpu_count(&self) -> u32;
    fn current_cpu(&self) -> u32;

    /// Reads an MSR on the given CPU, cross-calling synchronously if it is
    /// not the current one.
    fn read_msr(&self, cpu: u32, msr: u32) -> u64;

    /// Writes an MSR on the given CPU, cross-calling synchronously if it is
    /// not the current one.
    fn write_msr(&self, cpu: u32, msr: u32, value: u64);

    /// The host interrupt vector the bus IRQ is wired to. Discovering the
    /// IRQ (ACPI `_CRS` on the VMBUS device) and installing the handler are
    /// the embedder's responsibility.
    fn interrupt_vector(&self) -> u8;

    /// Publishes a child device node for an offered channel.
    fn publish_node(&self, attributes: NodeAttributes) -> Result<NodeHandle, BusError>;

    /// Withdraws a node previously returned by [`Self::publish_node`].
    fn withdraw_node(&self, node: NodeHandle);
}

/// An owned contiguous allocation with RAII release through the platform.
///
/// The mapping is stable for the lifetime of the value; pages shared with
/// the hypervisor are held in one of these until the bus is torn down.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    gpa: u64,
    platform: Arc<dyn Platform>,
}

// SAFETY: the buffer exclusively owns its allocation, and all access goes
// through &self methods that are safe for concurrent use (plain loads/stores
// never race with the atomic view on the same words in this crate).
unsafe impl Send for DmaBuffer {}
// SAFETY: see above.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocates `len` bytes of zeroed contiguous memory.
    pub fn alloc(platform: &Arc<dyn Platform>, len: usize) -> Result<Self, BusError> {
        let raw = platform.alloc_contiguous(len)?;
        Ok(Self {
            ptr: raw.ptr,
            len,
            gpa: raw.gpa,
            platform: platform.clone(),
        })
    }

    /// Allocates one zeroed executable page.
    pub fn alloc_executable(platform: &Arc<dyn Platform>) -> Result<Self, BusError> {
        let raw = platform.alloc_executable_page()?;
        Ok(Self {
            ptr: raw.ptr,
            len: hvdef::HV_PAGE_SIZE_USIZE,
            gpa: raw.gpa,
            platform: platform.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The guest physical address of the first byte.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// The guest physical page number of the first page.
    pub fn base_pfn(&self) -> u64 {
        self.gpa >> hvdef::HV_PAGE_SHIFT
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copies an object out of the buffer.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut value = T::new_zeroed();
        let bytes = value.as_mut_bytes();
        assert!(offset + bytes.len() <= self.len);
        // SAFETY: the range was checked against the allocation length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                bytes.as_mut_ptr(),
                bytes.len(),
            );
        }
        value
    }

    /// Copies an object into the buffer.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, value: &T) {
        let bytes = value.as_bytes();
        assert!(offset + bytes.len() <= self.len);
        // SAFETY: the range was checked against the allocation length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// A 32-bit atomic view of the word at `word_index * 4`, for the
    /// lock-free event-flag bitmaps.
    pub fn atomic_u32(&self, word_index: usize) -> &AtomicU32 {
        let offset = word_index * 4;
        assert!(offset + 4 <= self.len);
        // SAFETY: the allocation is page-aligned so every word offset is
        // 4-byte aligned, the range was checked, and AtomicU32 has no
        // validity requirements beyond alignment.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.platform.free_contiguous(self.ptr, self.len);
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("gpa", &self.gpa)
            .field("len", &self.len)
            .finish()
    }
}

/// A counting semaphore, the registration worker's wakeup primitive.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn release(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
