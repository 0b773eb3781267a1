//! Thunk Compiler
//!
//! Turns a class into objects.
//!
//! # Compilation
//! 1. Narrow the destination to exactly the object size and zero it
//! 2. Copy the template into the start of the object
//! 3. Apply every relocation to the copy, in descriptor order
//! 4. Run the constructor over the data region
//! 5. Seal the object as an entry
//!
//! A failure in steps 2-4 scrubs the destination. Objects obtained through
//! [`Compiler::alloc`] also hand their buffer back to the provider, so a
//! failed allocation leaves nothing behind.
//!
//! The entry spans code and data: `ADR` derives the data capability from
//! PCC, and the code narrows it before anything leaves the thunk.
//!
//! Only live objects from [`Compiler::alloc`] can be invoked. Each
//! allocation gets a fresh serial, so a handle kept past `free` is refused
//! even when its memory has been reused for a new object.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::cap::{Capability, Perms};
use crate::mm::{AddressSpace, MemoryProvider};
use crate::vm;

use super::class::{ClassId, ThunkClass, ThunkObject};
use super::reloc::{RelocEncoder, RelocError};
use super::{is_trusted, ThunkError};

/// Permissions a destination buffer must grant.
const BUFFER_PERMS: Perms = Perms::LOAD.union(Perms::STORE).union(Perms::EXECUTE);

/// Permissions the constructor and destructor get over the data region.
const DATA_REGION_PERMS: Perms = Perms::DATA.union(Perms::GLOBAL);

/// Live map entry, keyed by object base.
#[derive(Clone, Copy, Debug)]
struct LiveObject {
    class: ClassId,
    serial: u64,
}

/// JIT compiler for thunk objects.
pub struct Compiler<P, E> {
    space: Arc<AddressSpace>,
    provider: P,
    encoder: E,
    live: Mutex<BTreeMap<usize, LiveObject>>,
    next_serial: AtomicU64,
}

impl<P: MemoryProvider, E: RelocEncoder> Compiler<P, E> {
    /// Create a compiler drawing memory from `provider`.
    pub fn new(space: Arc<AddressSpace>, provider: P, encoder: E) -> Self {
        Self {
            space,
            provider,
            encoder,
            live: Mutex::new(BTreeMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Objects allocated and not yet freed.
    pub fn live_objects(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether `obj` came from `alloc` and has not been freed since.
    pub fn is_live(&self, obj: &ThunkObject) -> bool {
        is_current(&self.live.lock(), obj)
    }

    /// Compile `class` into `buf`.
    ///
    /// The buffer stays owned by the caller; on failure it is left zeroed.
    /// The result is not tracked as live, so [`Compiler::invoke`] refuses it.
    pub fn compile(&self, buf: Capability, class: &ThunkClass) -> Result<ThunkObject, ThunkError> {
        let layout = class.layout();
        if buf.is_sealed() || !buf.has_perms(BUFFER_PERMS) {
            return Err(ThunkError::BadBuffer);
        }
        let obj = buf.bounds_narrow_exact(0, layout.object_size());
        if !obj.is_valid() {
            return Err(ThunkError::BadBuffer);
        }

        self.space.fill(&obj, 0, layout.object_size(), 0)?;

        let result = self.emit(&obj, class).and_then(|()| self.construct(&obj, class));
        if let Err(e) = result {
            log::warn!("thunk: compiling {} failed: {}", class.id(), e);
            self.space.fill(&obj, 0, layout.object_size(), 0)?;
            return Err(e);
        }

        let entry = obj.seal_entry();
        log::debug!("thunk: compiled {} at {:#x}", class.id(), entry.base());
        Ok(ThunkObject::new(entry, class.id()))
    }

    /// Copy the template and apply the relocations.
    fn emit(&self, obj: &Capability, class: &ThunkClass) -> Result<(), ThunkError> {
        let meta = class.metaclass();
        let code_size = meta.code_size()?;
        if code_size != class.layout().code_size() {
            return Err(ThunkError::CodeSizeMismatch {
                expected: code_size,
                found: class.layout().code_size(),
            });
        }
        if let Some(reloc) = meta.relocs().iter().find(|r| !self.encoder.supports(r.kind)) {
            return Err(RelocError::Unsupported(reloc.kind).into());
        }

        let code = obj.bounds_narrow_exact(0, code_size);
        for (i, word) in meta.template().words().iter().enumerate() {
            self.space.write_u32(&code, i * 4, *word)?;
        }

        for (reloc, value) in meta.relocs().iter().zip(class.reloc_values()) {
            let patch = code.bounds_narrow_exact(reloc.offset, 4);
            if !patch.is_valid() {
                return Err(RelocError::PatchOutOfBounds(reloc.offset).into());
            }
            let word = self.space.read_u32(&patch, 0)?;
            let word = self
                .encoder
                .apply(reloc.kind, patch.base(), code.base(), *value, word)?;
            self.space.write_u32(&patch, 0, word)?;
        }
        Ok(())
    }

    fn construct(&self, obj: &Capability, class: &ThunkClass) -> Result<(), ThunkError> {
        if let Some(ctor) = class.constructor() {
            ctor(&self.space, &data_region(obj, class)).map_err(ThunkError::Constructor)?;
        }
        Ok(())
    }

    /// Acquire memory for an object of `class` and compile into it.
    pub fn alloc(&self, class: &ThunkClass) -> Result<ThunkObject, ThunkError> {
        let buf = self.provider.acquire(class.object_size())?;
        match self.compile(buf, class) {
            Ok(obj) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                let entry = LiveObject {
                    class: class.id(),
                    serial,
                };
                self.live.lock().insert(buf.base(), entry);
                Ok(obj.with_serial(serial))
            }
            Err(e) => {
                if let Err(release) = self.provider.release(buf) {
                    log::warn!("thunk: failed to release {:#x}: {}", buf.base(), release);
                }
                Err(e)
            }
        }
    }

    /// Run the destructor and release an object obtained from `alloc`.
    pub fn free(&self, class: &ThunkClass, obj: ThunkObject) -> Result<(), ThunkError> {
        let buf = self.retire(class, obj)?;
        self.reclaim(class, buf)
    }

    /// Check `obj` and drop it from the live map, returning its buffer.
    ///
    /// After this the object can no longer be invoked or freed.
    pub(crate) fn retire(&self, class: &ThunkClass, obj: ThunkObject) -> Result<Capability, ThunkError> {
        let entry = obj.capability();
        if !entry.is_valid() {
            return Err(ThunkError::Invalid);
        }
        if !entry.is_sealed() {
            return Err(ThunkError::NotSealed);
        }
        if obj.class_id() != class.id() {
            return Err(ThunkError::ClassMismatch {
                expected: class.id(),
                found: obj.class_id(),
            });
        }

        let mut live = self.live.lock();
        match live.get(&entry.base()) {
            Some(o) if o.class != class.id() => {
                return Err(ThunkError::ClassMismatch {
                    expected: class.id(),
                    found: o.class,
                })
            }
            Some(o) if o.serial == obj.serial() => {}
            _ => return Err(ThunkError::UnknownObject),
        }
        let buf = entry.unseal_entry().ok_or(ThunkError::NotSealed)?;
        live.remove(&entry.base());
        Ok(buf)
    }

    /// Destroy, scrub and release the buffer of a retired object.
    pub(crate) fn reclaim(&self, class: &ThunkClass, buf: Capability) -> Result<(), ThunkError> {
        if let Some(dtor) = class.destructor() {
            dtor(&self.space, &data_region(&buf, class));
        }
        self.space.fill(&buf, 0, buf.length(), 0)?;
        self.provider.release(buf)?;
        log::debug!("thunk: freed {} at {:#x}", class.id(), buf.base());
        Ok(())
    }

    /// Call a trusted, live object with `args` and return its result.
    pub fn invoke(&self, obj: &ThunkObject, args: &[Capability]) -> Result<Capability, ThunkError> {
        let entry = obj.capability();
        if !is_trusted(&entry) {
            log::warn!("thunk: refusing to invoke untrusted entry {:?}", entry);
            return Err(ThunkError::Untrusted);
        }
        // Held across the call so the object cannot be freed under it.
        let live = self.live.lock();
        if !is_current(&live, obj) {
            log::warn!("thunk: refusing to invoke stale object at {:#x}", entry.base());
            return Err(ThunkError::UnknownObject);
        }
        Ok(vm::call(&self.space, entry, args)?)
    }
}

fn is_current(live: &BTreeMap<usize, LiveObject>, obj: &ThunkObject) -> bool {
    matches!(
        live.get(&obj.capability().base()),
        Some(o) if o.class == obj.class_id() && o.serial == obj.serial()
    )
}

/// Capability over the data region of an object, without execute or trust.
fn data_region(obj: &Capability, class: &ThunkClass) -> Capability {
    let layout = class.layout();
    obj.bounds_narrow_exact(layout.data_offset(), layout.data_len())
        .permission_intersect(DATA_REGION_PERMS)
}
