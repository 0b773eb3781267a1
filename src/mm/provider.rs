//! Executable Memory Providers
//!
//! The thunk compiler never maps memory itself. It acquires read/write/
//! execute buffers from an injected `MemoryProvider` and hands them back on
//! failure or when an object is freed.
//!
//! # Providers
//! - `MappedProvider`: one mapping per buffer, tracked on a block list
//! - `ArenaProvider`: buffers carved out of a single RWX arena by a
//!   `linked_list_allocator` free list
//!
//! # Security Properties
//! - Buffers are fresh and never alias a live buffer
//! - `VMEM` is stripped from returned capabilities, so holders cannot unmap
//! - Foreign and double releases are detected and rejected

use alloc::alloc::{alloc, dealloc};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::cap::{representable_alignment, representable_length, Capability, Perms};
use crate::config::{ARENA_ALIGN, DEFAULT_ARENA_SIZE, MAX_OBJECT_SIZE};

use super::address_space::{AddressSpace, Fault, MapError, Prot};

/// Error type for provider operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    /// No memory left to satisfy the request.
    OutOfMemory,
    /// Zero or oversized request.
    InvalidSize,
    /// The alignment the request needs cannot be honoured.
    Unaligned,
    /// The released capability is untagged.
    Invalid,
    /// The released capability is sealed.
    Sealed,
    /// The released capability is not a live buffer of this provider.
    Foreign,
    /// The underlying mapping operation failed.
    Map(MapError),
    /// Scrubbing the released buffer faulted.
    Fault(Fault),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "executable memory exhausted"),
            Self::InvalidSize => write!(f, "invalid buffer size"),
            Self::Unaligned => write!(f, "alignment cannot be honoured"),
            Self::Invalid => write!(f, "attempt to release invalid capability"),
            Self::Sealed => write!(f, "attempt to release sealed capability"),
            Self::Foreign => write!(f, "attempt to release unknown buffer"),
            Self::Map(e) => write!(f, "mapping failed: {}", e),
            Self::Fault(e) => write!(f, "scrub failed: {}", e),
        }
    }
}

impl From<MapError> for ProviderError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::Exhausted => Self::OutOfMemory,
            MapError::InvalidSize => Self::InvalidSize,
            other => Self::Map(other),
        }
    }
}

impl From<Fault> for ProviderError {
    fn from(e: Fault) -> Self {
        Self::Fault(e)
    }
}

/// Source of executable memory for compiled thunks.
pub trait MemoryProvider: Send + Sync {
    /// Acquire a fresh buffer of at least `size` bytes.
    ///
    /// The capability grants load, store, execute and capability
    /// load/store, and does not alias any live buffer.
    fn acquire(&self, size: usize) -> Result<Capability, ProviderError>;

    /// Return a buffer obtained from `acquire`.
    fn release(&self, buf: Capability) -> Result<(), ProviderError>;

    /// Number of buffers acquired and not yet released.
    fn outstanding(&self) -> usize;
}

impl<P: MemoryProvider + ?Sized> MemoryProvider for Arc<P> {
    fn acquire(&self, size: usize) -> Result<Capability, ProviderError> {
        (**self).acquire(size)
    }

    fn release(&self, buf: Capability) -> Result<(), ProviderError> {
        (**self).release(buf)
    }

    fn outstanding(&self) -> usize {
        (**self).outstanding()
    }
}

/// Check the shape of a capability handed back to a provider.
fn check_release(buf: &Capability) -> Result<(), ProviderError> {
    if !buf.is_valid() {
        return Err(ProviderError::Invalid);
    }
    if buf.is_sealed() {
        return Err(ProviderError::Sealed);
    }
    Ok(())
}

/// Provider mapping one region per buffer.
///
/// Each buffer is rounded up to whole pages. The root capability of every
/// mapping stays on the block list; callers only ever see it without
/// `VMEM`.
pub struct MappedProvider {
    space: Arc<AddressSpace>,
    blocks: Mutex<BTreeMap<usize, Capability>>,
}

impl MappedProvider {
    /// Create a provider mapping into `space`.
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self {
            space,
            blocks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl MemoryProvider for MappedProvider {
    fn acquire(&self, size: usize) -> Result<Capability, ProviderError> {
        let root = self.space.map(size, Prot::RWX)?;
        self.blocks.lock().insert(root.base(), root);
        log::trace!("xmalloc: block {:#x} ({:#x} bytes)", root.base(), root.length());
        Ok(root.clear_perms(Perms::VMEM))
    }

    fn release(&self, buf: Capability) -> Result<(), ProviderError> {
        check_release(&buf)?;
        let root = {
            let mut blocks = self.blocks.lock();
            match blocks.get(&buf.base()) {
                Some(root) if buf.is_subset_of(root) => {}
                _ => return Err(ProviderError::Foreign),
            }
            blocks.remove(&buf.base()).ok_or(ProviderError::Foreign)?
        };
        self.space.unmap(root)?;
        log::trace!("xfree: block {:#x}", root.base());
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.blocks.lock().len()
    }
}

/// Free-list state of the arena.
///
/// `linked_list_allocator` keeps its hole list inside the memory it manages,
/// so it runs over a host-side ledger the same size as the arena. Offsets
/// into the ledger are offsets into the arena.
struct ArenaInner {
    heap: Heap,
    ledger: NonNull<u8>,
    ledger_layout: Layout,
    live: BTreeMap<usize, Layout>,
}

// SAFETY: the ledger is owned exclusively by this struct and only touched
// through `heap` while the enclosing mutex is held.
unsafe impl Send for ArenaInner {}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        // SAFETY: `ledger` was allocated with `ledger_layout` in
        // `ArenaProvider::new` and nothing references it past this point.
        unsafe { dealloc(self.ledger.as_ptr(), self.ledger_layout) };
    }
}

/// Provider carving buffers out of one RWX arena.
pub struct ArenaProvider {
    space: Arc<AddressSpace>,
    root: Capability,
    max_align: usize,
    inner: Mutex<ArenaInner>,
}

impl ArenaProvider {
    /// Map an arena of `size` bytes in `space`.
    pub fn new(space: Arc<AddressSpace>, size: usize) -> Result<Self, ProviderError> {
        let root = space.map(size, Prot::RWX)?;
        let ledger_layout =
            Layout::from_size_align(root.length(), ARENA_ALIGN).map_err(|_| ProviderError::InvalidSize)?;

        // SAFETY: the layout has non-zero size (mappings are never empty).
        let ledger = match NonNull::new(unsafe { alloc(ledger_layout) }) {
            Some(ptr) => ptr,
            None => {
                space.unmap(root)?;
                return Err(ProviderError::OutOfMemory);
            }
        };

        // SAFETY: `ledger` is valid for `root.length()` bytes, exclusively
        // owned by the heap, and outlives it (both live in `ArenaInner`).
        let heap = unsafe { Heap::new(ledger.as_ptr(), root.length()) };

        let max_align = (1usize << root.base().trailing_zeros()).min(ARENA_ALIGN);
        log::debug!(
            "arena: {:#x} bytes at {:#x}, max align {:#x}",
            root.length(),
            root.base(),
            max_align
        );

        Ok(Self {
            space,
            root,
            max_align,
            inner: Mutex::new(ArenaInner {
                heap,
                ledger,
                ledger_layout,
                live: BTreeMap::new(),
            }),
        })
    }

    /// Map an arena of `DEFAULT_ARENA_SIZE` bytes.
    pub fn with_default_size(space: Arc<AddressSpace>) -> Result<Self, ProviderError> {
        Self::new(space, DEFAULT_ARENA_SIZE)
    }

    /// Bytes still available in the arena.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().heap.free()
    }
}

impl MemoryProvider for ArenaProvider {
    fn acquire(&self, size: usize) -> Result<Capability, ProviderError> {
        if size == 0 || size > MAX_OBJECT_SIZE {
            return Err(ProviderError::InvalidSize);
        }
        let len = representable_length(size);
        let align = representable_alignment(size).max(16);
        if align > self.max_align {
            return Err(ProviderError::Unaligned);
        }
        let layout = Layout::from_size_align(len, align).map_err(|_| ProviderError::InvalidSize)?;

        let mut inner = self.inner.lock();
        let ptr = inner
            .heap
            .allocate_first_fit(layout)
            .map_err(|_| ProviderError::OutOfMemory)?;
        let offset = ptr.as_ptr() as usize - inner.ledger.as_ptr() as usize;
        inner.live.insert(self.root.base() + offset, layout);
        drop(inner);

        let buf = self
            .root
            .clear_perms(Perms::VMEM)
            .bounds_narrow_exact(offset, len);
        debug_assert!(buf.is_valid());
        log::trace!("arena: acquire {:#x} ({:#x} bytes)", buf.base(), len);
        Ok(buf)
    }

    fn release(&self, buf: Capability) -> Result<(), ProviderError> {
        check_release(&buf)?;
        let mut inner = self.inner.lock();
        let layout = *inner.live.get(&buf.base()).ok_or(ProviderError::Foreign)?;
        if buf.top() > buf.base() + layout.size() || !buf.is_subset_of(&self.root) {
            return Err(ProviderError::Foreign);
        }
        inner.live.remove(&buf.base());

        let offset = buf.base() - self.root.base();
        self.space.fill(&self.root.bounds_narrow_exact(offset, layout.size()), 0, layout.size(), 0)?;

        // SAFETY: the pointer is the one `allocate_first_fit` returned for
        // this block, with the same layout, and it is released only once
        // because it was just removed from `live`.
        unsafe {
            let ptr = NonNull::new_unchecked(inner.ledger.as_ptr().add(offset));
            inner.heap.deallocate(ptr, layout);
        }
        log::trace!("arena: release {:#x}", buf.base());
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.inner.lock().live.len()
    }
}

impl Drop for ArenaProvider {
    fn drop(&mut self) {
        if let Err(e) = self.space.unmap(self.root) {
            log::warn!("arena: failed to unmap {:#x}: {}", self.root.base(), e);
        }
    }
}
