//! Gate Registry
//!
//! Owns every live gate class of one embedding. The map is the only shared
//! mutable state of the gate layer and is held just long enough to insert,
//! look up or remove an entry.
//!
//! # Lifecycle
//! ```text
//! create_gate ──► Created ──(alloc_object / free_object)*──► destroy_gate
//!                    │                                          │
//!                    └──── refused with Busy while objects live ◄┘
//! ```

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::cap::{representable_length, Capability};
use crate::mm::{AddressSpace, MemoryProvider};
use crate::thunk::{self, ClassId, Compiler, ObjectLayout, RelocEncoder, ThunkClass, ThunkError, ThunkObject};

use super::class::{GateClass, GATE_METACLASS, MAX_GATE_PERMS};
use super::token::Token;
use super::GateError;

/// Registry of live gate classes, with the compiler their objects use.
pub struct GateRegistry<P: MemoryProvider, E: RelocEncoder> {
    compiler: Compiler<P, E>,
    gates: Mutex<BTreeMap<ClassId, Arc<GateClass>>>,
}

impl<P: MemoryProvider, E: RelocEncoder> GateRegistry<P, E> {
    /// Create an empty registry compiling through `compiler`.
    pub fn new(compiler: Compiler<P, E>) -> Self {
        Self {
            compiler,
            gates: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn compiler(&self) -> &Compiler<P, E> {
        &self.compiler
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        self.compiler.space()
    }

    /// Number of registered gates.
    pub fn len(&self) -> usize {
        self.gates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a registered gate.
    pub fn get(&self, id: ClassId) -> Option<Arc<GateClass>> {
        self.gates.lock().get(&id).cloned()
    }

    /// Create a gate for objects of `size` bytes.
    ///
    /// Returns the gate and its root token. The root covers
    /// `representable_length(size)` bytes, since exact bounds of `size` may
    /// not be representable; the extra bytes lie inside the object's padded
    /// data region.
    pub fn create_gate(&self, size: usize) -> Result<(Arc<GateClass>, Token), GateError> {
        let code_size = GATE_METACLASS.header().validate().map_err(ThunkError::from)?;
        let layout = ObjectLayout::new(code_size, size)?;

        let token_space = self.space().reserve(layout.data_len())?;
        let gate = match self.build(layout, size, token_space) {
            Ok(gate) => Arc::new(gate),
            Err(e) => {
                if let Err(unmap) = self.space().unmap(token_space) {
                    log::warn!("gate: failed to drop token space {:#x}: {}", token_space.base(), unmap);
                }
                return Err(e);
            }
        };

        let root = gate.root_token();
        self.gates.lock().insert(gate.id(), gate.clone());
        log::debug!(
            "gate: created {} for {:#x} bytes, token space {:#x}",
            gate.id(),
            size,
            token_space.base()
        );
        Ok((gate, root))
    }

    fn build(&self, layout: ObjectLayout, size: usize, token_space: Capability) -> Result<GateClass, GateError> {
        let values = GATE_METACLASS.reloc_values(token_space.base(), layout.data_offset())?;
        let class = ThunkClass::new(GATE_METACLASS.header(), layout, values)?;
        let root = Token::from_capability(
            token_space
                .permission_intersect(MAX_GATE_PERMS)
                .bounds_narrow_exact(0, representable_length(size)),
        );
        debug_assert!(root.is_valid());
        Ok(GateClass::new(class, size, token_space, root))
    }

    /// Unregister `gate` and release its token space.
    ///
    /// Refused while any object of the gate is live. Tokens of a destroyed
    /// gate stay out of range for every later gate, since token space
    /// addresses are never handed out twice.
    pub fn destroy_gate(&self, gate: &Arc<GateClass>) -> Result<(), GateError> {
        {
            let mut gates = self.gates.lock();
            if !gates.contains_key(&gate.id()) {
                return Err(GateError::UnknownGate);
            }
            let live = gate.live_objects();
            if live > 0 {
                log::warn!("gate: refusing to destroy {} with {} live objects", gate.id(), live);
                return Err(GateError::Busy { live });
            }
            gates.remove(&gate.id());
        }
        self.space().unmap(gate.token_space())?;
        log::debug!("gate: destroyed {}", gate.id());
        Ok(())
    }

    /// Compile a new object of `gate`.
    pub fn alloc_object(&self, gate: &GateClass) -> Result<ThunkObject, GateError> {
        {
            let gates = self.gates.lock();
            if !gates.contains_key(&gate.id()) {
                return Err(GateError::Destroyed);
            }
            gate.retain();
        }
        self.compiler.alloc(gate.thunk_class()).map_err(|e| {
            gate.release();
            GateError::from(e)
        })
    }

    /// Free an object of `gate`.
    ///
    /// Once the object is retired it no longer counts against the gate,
    /// even if scrubbing or releasing its memory then fails.
    pub fn free_object(&self, gate: &GateClass, obj: ThunkObject) -> Result<(), GateError> {
        let buf = self.compiler.retire(gate.thunk_class(), obj)?;
        gate.release();
        self.compiler.reclaim(gate.thunk_class(), buf)?;
        Ok(())
    }

    /// Check that `obj` is a trusted, live object of a registered gate,
    /// without calling it.
    pub fn is_authorized(&self, obj: &ThunkObject) -> bool {
        thunk::is_trusted(&obj.capability())
            && self.gates.lock().contains_key(&obj.class_id())
            && self.compiler.is_live(obj)
    }

    /// Exchange `token` for a capability through the gate object `obj`.
    ///
    /// An unauthorised token is not an error: the result is simply
    /// untagged.
    pub fn invoke(&self, obj: &ThunkObject, token: &Token) -> Result<Capability, GateError> {
        if !thunk::is_trusted(&obj.capability()) {
            log::warn!("gate: refusing untrusted object {:?}", obj.capability());
            return Err(GateError::Untrusted);
        }
        if !self.gates.lock().contains_key(&obj.class_id()) {
            return Err(GateError::UnknownGate);
        }
        let cap = self.compiler.invoke(obj, &[token.capability()])?;
        if !cap.is_valid() {
            log::trace!("gate: token {:?} rejected", token.capability());
        }
        Ok(cap)
    }
}

impl<P: MemoryProvider, E: RelocEncoder> Drop for GateRegistry<P, E> {
    fn drop(&mut self) {
        let gates = core::mem::take(&mut *self.gates.lock());
        for gate in gates.values() {
            if gate.live_objects() > 0 {
                log::warn!("gate: {} dropped with {} live objects", gate.id(), gate.live_objects());
            }
            if let Err(e) = self.space().unmap(gate.token_space()) {
                log::warn!("gate: failed to drop token space of {}: {}", gate.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{A64Encoder, C64Encoder};
    use crate::cap::Perms;
    use crate::expose::ExposeClass;
    use crate::mm::{Fault, MappedProvider, Prot, ProviderError, TrustStripping};
    use alloc::vec;
    use alloc::vec::Vec;
    use core::mem::size_of;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[allow(dead_code)]
    #[repr(C)]
    struct Pair {
        a: i32,
        b: i64,
    }

    fn registry() -> GateRegistry<MappedProvider, C64Encoder> {
        let space = Arc::new(AddressSpace::new());
        GateRegistry::new(Compiler::new(space.clone(), MappedProvider::new(space), C64Encoder))
    }

    /// Provider whose `release` can be switched to fail.
    struct StuckRelease {
        inner: MappedProvider,
        stuck: AtomicBool,
    }

    impl MemoryProvider for StuckRelease {
        fn acquire(&self, size: usize) -> Result<Capability, ProviderError> {
            self.inner.acquire(size)
        }

        fn release(&self, buf: Capability) -> Result<(), ProviderError> {
            if self.stuck.load(Ordering::SeqCst) {
                return Err(ProviderError::Foreign);
            }
            self.inner.release(buf)
        }

        fn outstanding(&self) -> usize {
            self.inner.outstanding()
        }
    }

    #[test]
    fn test_scenario_field_token() {
        let reg = registry();
        let (gate, root) = reg.create_gate(size_of::<Pair>()).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();

        let whole = reg.invoke(&obj, &root).unwrap();
        let b = crate::token_for!(root, Pair, b);
        let field = reg.invoke(&obj, &b).unwrap();

        assert!(field.is_valid());
        assert_eq!(field.length(), 8);
        assert_eq!(field.base(), whole.base() + 8);
        assert!(!field.perms().contains(Perms::EXECUTE));

        // The field capability reaches the same bytes as the whole object.
        reg.space().write(&field, 0, &42i64.to_le_bytes()).unwrap();
        let mut bytes = [0u8; 8];
        reg.space().read(&whole, 8, &mut bytes).unwrap();
        assert_eq!(i64::from_le_bytes(bytes), 42);

        reg.free_object(&gate, obj).unwrap();
        reg.destroy_gate(&gate).unwrap();
    }

    #[test]
    fn test_root_token_yields_whole_object() {
        let reg = registry();
        let (gate, root) = reg.create_gate(64).unwrap();
        assert_eq!(gate.root_token(), root);
        assert_eq!(root.length(), 64);
        assert_eq!(root.perms(), MAX_GATE_PERMS);

        let obj = reg.alloc_object(&gate).unwrap();
        let cap = reg.invoke(&obj, &root).unwrap();
        let layout = gate.thunk_class().layout();
        assert!(cap.is_valid());
        assert!(!cap.is_sealed());
        assert_eq!(cap.base(), obj.capability().base() + layout.data_offset());
        assert_eq!(cap.length(), 64);
        assert_eq!(cap.perms(), MAX_GATE_PERMS & obj.capability().perms());
        assert_eq!(cap.perms(), MAX_GATE_PERMS);
    }

    #[test]
    fn test_unrepresentable_size_rounds_root_token() {
        let reg = registry();
        let size = 4097;
        let (gate, root) = reg.create_gate(size).unwrap();
        assert_eq!(root.length(), representable_length(size));
        assert_eq!(root.length(), 4098);
        assert!(root.length() <= gate.thunk_class().layout().data_len());
        // Exact bounds of `size` cannot be derived at all.
        assert!(!root.narrow(0, size).is_valid());

        let obj = reg.alloc_object(&gate).unwrap();
        let whole = reg.invoke(&obj, &root).unwrap();
        assert!(whole.is_valid());
        assert_eq!(whole.length(), 4098);
        for (offset, len) in [(4096, 2), (4097, 1)] {
            let token = root.narrow(offset, len);
            assert!(token.is_valid());
            let cap = reg.invoke(&obj, &token).unwrap();
            assert!(cap.is_valid());
            assert_eq!((cap.base(), cap.length()), (whole.base() + offset, len));
        }
    }

    #[test]
    fn test_token_permissions_carry_over() {
        let reg = registry();
        let (gate, root) = reg.create_gate(32).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();

        let ro = root.narrow(16, 16).restrict(Perms::READ_ONLY);
        let cap = reg.invoke(&obj, &ro).unwrap();
        assert!(cap.is_valid());
        assert_eq!(cap.perms(), Perms::READ_ONLY);
        assert_eq!(reg.space().write(&cap, 0, b"x"), Err(Fault::Permission));
    }

    #[test]
    fn test_out_of_range_tokens_are_rejected() {
        let reg = registry();
        let (gate, root) = reg.create_gate(32).unwrap();
        let (_, other_root) = reg.create_gate(32).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();
        let space = gate.token_space().clear_perms(Perms::VMEM);
        let data_len = gate.thunk_class().layout().data_len();

        let forged = [
            // Another gate's token.
            other_root,
            // Longer than the object.
            Token::from_capability(space.bounds_narrow_exact(0, data_len + 16)),
            // Past the end of the object.
            Token::from_capability(space.bounds_narrow_exact(data_len, 8)),
            // Untagged copy of a valid token.
            Token::from_capability(root.capability().invalidate()),
            Token::from_capability(Capability::from_address(root.base())),
            // Ordinary memory.
            Token::from_capability(reg.space().map(32, Prot::READ).unwrap()),
        ];
        for token in forged.iter() {
            let cap = reg.invoke(&obj, token).unwrap();
            assert!(!cap.is_valid(), "token {:?} yielded {:?}", token, cap);
        }
    }

    #[test]
    fn test_derived_tokens_stay_within_object() {
        let reg = registry();
        let (gate, root) = reg.create_gate(48).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();
        let whole = reg.invoke(&obj, &root).unwrap();

        for (offset, len) in [(0, 48), (0, 1), (47, 1), (16, 16), (8, 40)] {
            let token = root.narrow(offset, len);
            assert!(token.is_subset_of(&root));
            let cap = reg.invoke(&obj, &token).unwrap();
            assert!(cap.is_valid());
            assert_eq!((cap.base(), cap.length()), (whole.base() + offset, len));
            assert!(cap.is_subset_of(&whole));
        }
        // Widening fails at derivation time.
        assert!(!root.narrow(40, 16).is_valid());
    }

    #[test]
    fn test_token_is_useless_as_pointer() {
        let reg = registry();
        let (_, root) = reg.create_gate(16).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reg.space().read(&root.capability(), 0, &mut buf), Err(Fault::Guard));
        assert_eq!(reg.space().write(&root.capability(), 0, &buf), Err(Fault::Guard));
    }

    #[test]
    fn test_destroy_refused_while_objects_live() {
        let reg = registry();
        let (gate, _) = reg.create_gate(16).unwrap();
        let a = reg.alloc_object(&gate).unwrap();
        let b = reg.alloc_object(&gate).unwrap();
        assert_eq!(gate.live_objects(), 2);
        assert_eq!(reg.destroy_gate(&gate), Err(GateError::Busy { live: 2 }));

        reg.free_object(&gate, a).unwrap();
        assert_eq!(reg.destroy_gate(&gate), Err(GateError::Busy { live: 1 }));
        reg.free_object(&gate, b).unwrap();
        reg.destroy_gate(&gate).unwrap();

        assert!(!reg.space().is_mapped(gate.token_space_base()));
        assert!(reg.get(gate.id()).is_none());
        assert_eq!(reg.alloc_object(&gate), Err(GateError::Destroyed));
        assert_eq!(reg.destroy_gate(&gate), Err(GateError::UnknownGate));
    }

    #[test]
    fn test_stale_tokens_never_match_new_gates() {
        let reg = registry();
        let (old, old_root) = reg.create_gate(16).unwrap();
        reg.destroy_gate(&old).unwrap();

        let (gate, _) = reg.create_gate(16).unwrap();
        assert!(gate.token_space_base() > old.token_space_base());
        let obj = reg.alloc_object(&gate).unwrap();
        assert!(!reg.invoke(&obj, &old_root).unwrap().is_valid());
    }

    #[test]
    fn test_untrusted_objects_are_refused() {
        let space = Arc::new(AddressSpace::new());
        let reg = GateRegistry::new(Compiler::new(space.clone(), MappedProvider::new(space.clone()), C64Encoder));
        let (gate, root) = reg.create_gate(16).unwrap();

        // Genuine gate code compiled into general-purpose memory.
        let heap = TrustStripping::new(MappedProvider::new(space.clone()));
        let buf = heap.acquire(gate.thunk_class().object_size()).unwrap();
        let forged = reg.compiler().compile(buf, gate.thunk_class()).unwrap();
        assert!(forged.capability().is_sealed());
        assert!(!reg.is_authorized(&forged));
        assert_eq!(reg.invoke(&forged, &root), Err(GateError::Untrusted));

        // An unsealed capability is never authorised either.
        let raw = ThunkObject::new(forged.capability().unseal_entry().unwrap(), gate.id());
        assert!(!reg.is_authorized(&raw));
        assert_eq!(reg.invoke(&raw, &root), Err(GateError::Untrusted));

        let obj = reg.alloc_object(&gate).unwrap();
        assert!(reg.is_authorized(&obj));
    }

    #[test]
    fn test_freed_objects_are_refused() {
        let reg = registry();
        let (gate, root) = reg.create_gate(16).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();
        assert!(reg.invoke(&obj, &root).unwrap().is_valid());

        reg.free_object(&gate, obj).unwrap();
        assert!(!reg.is_authorized(&obj));
        assert_eq!(reg.invoke(&obj, &root), Err(GateError::Thunk(ThunkError::UnknownObject)));

        let next = reg.alloc_object(&gate).unwrap();
        assert!(reg.is_authorized(&next));
        assert!(!reg.is_authorized(&obj));
    }

    #[test]
    fn test_objects_of_other_classes_are_refused() {
        let reg = registry();
        let (_, root) = reg.create_gate(16).unwrap();
        let class = ExposeClass::new(16, Perms::DATA).unwrap();
        let obj = reg.compiler().alloc(class.thunk_class()).unwrap();

        assert!(reg.compiler().is_live(&obj));
        assert!(!reg.is_authorized(&obj));
        assert_eq!(reg.invoke(&obj, &root), Err(GateError::UnknownGate));
    }

    #[test]
    fn test_failed_release_still_retires_object() {
        let space = Arc::new(AddressSpace::new());
        let provider = StuckRelease {
            inner: MappedProvider::new(space.clone()),
            stuck: AtomicBool::new(false),
        };
        let reg = GateRegistry::new(Compiler::new(space, provider, C64Encoder));
        let (gate, _) = reg.create_gate(16).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();

        reg.compiler().provider().stuck.store(true, Ordering::SeqCst);
        assert_eq!(
            reg.free_object(&gate, obj),
            Err(GateError::Thunk(ThunkError::Provider(ProviderError::Foreign)))
        );
        assert_eq!(gate.live_objects(), 0);
        assert!(!reg.is_authorized(&obj));
        assert_eq!(
            reg.free_object(&gate, obj),
            Err(GateError::Thunk(ThunkError::UnknownObject))
        );
        reg.destroy_gate(&gate).unwrap();
    }

    #[test]
    fn test_huge_gate_allocation_fails_cleanly() {
        let reg = registry();
        let (gate, _) = reg.create_gate(1 << 45).unwrap();
        let regions = reg.space().region_count();

        assert_eq!(
            reg.alloc_object(&gate),
            Err(GateError::Thunk(ThunkError::Provider(ProviderError::OutOfMemory)))
        );
        assert_eq!(gate.live_objects(), 0);
        assert_eq!(reg.compiler().provider().outstanding(), 0);
        assert_eq!(reg.space().region_count(), regions);
        reg.destroy_gate(&gate).unwrap();
    }

    #[test]
    fn test_gate_objects_share_code() {
        let reg = registry();
        let (gate, _) = reg.create_gate(16).unwrap();
        let code_size = gate.thunk_class().layout().code_size();
        let codes: Vec<Vec<u8>> = (0..3)
            .map(|_| {
                let obj = reg.alloc_object(&gate).unwrap();
                let buf = obj.capability().unseal_entry().unwrap();
                let mut code = vec![0u8; code_size];
                reg.space().read(&buf, 0, &mut code).unwrap();
                code
            })
            .collect();
        assert_eq!(codes[0], codes[1]);
        assert_eq!(codes[1], codes[2]);
    }

    #[test]
    fn test_failed_compile_releases_everything() {
        let space = Arc::new(AddressSpace::new());
        let reg = GateRegistry::new(Compiler::new(space.clone(), MappedProvider::new(space.clone()), A64Encoder));
        let (gate, _) = reg.create_gate(16).unwrap();
        let regions = space.region_count();

        assert!(matches!(reg.alloc_object(&gate), Err(GateError::Thunk(ThunkError::Reloc(_)))));
        assert_eq!(gate.live_objects(), 0);
        assert_eq!(reg.compiler().provider().outstanding(), 0);
        assert_eq!(space.region_count(), regions);
        reg.destroy_gate(&gate).unwrap();
    }

    #[test]
    fn test_registry_drop_releases_token_spaces() {
        let space = Arc::new(AddressSpace::new());
        {
            let reg = GateRegistry::new(Compiler::new(space.clone(), MappedProvider::new(space.clone()), C64Encoder));
            reg.create_gate(16).unwrap();
            reg.create_gate(4096).unwrap();
            assert_eq!(reg.len(), 2);
        }
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn test_large_gate() {
        let reg = registry();
        let size = 100_000;
        let (gate, root) = reg.create_gate(size).unwrap();
        let obj = reg.alloc_object(&gate).unwrap();
        let whole = reg.invoke(&obj, &root).unwrap();
        assert!(whole.is_valid());
        assert!(whole.length() >= size);

        let tail = root.narrow(root.length() - 64, 64);
        let cap = reg.invoke(&obj, &tail).unwrap();
        assert!(cap.is_valid());
        assert_eq!(cap.base(), whole.base() + root.length() - 64);
    }

    #[test]
    fn test_concurrent_gate_creation() {
        use std::thread;

        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                thread::spawn(move || {
                    for _ in 0..8 {
                        let (gate, root) = reg.create_gate(32).unwrap();
                        let obj = reg.alloc_object(&gate).unwrap();
                        assert!(reg.invoke(&obj, &root).unwrap().is_valid());
                        reg.free_object(&gate, obj).unwrap();
                        reg.destroy_gate(&gate).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(reg.is_empty());
    }
}
