//! Data Exposure Thunks
//!
//! The simplest useful class: invoking one of its objects returns a
//! capability over the object's whole data region, restricted to the
//! class's exposure mask. The constructor decides what the region holds.

use crate::arch::templates::{EXPOSE_RELOCS, EXPOSE_TEMPLATE};
use crate::cap::{Capability, Perms};
use crate::mm::{AddressSpace, Fault};
use crate::thunk::{Metaclass, ObjectLayout, ThunkClass, ThunkError};

/// Permissions an exposure mask may never carry.
const NEVER_EXPOSED: Perms = Perms::EXECUTE
    .union(Perms::SYSTEM)
    .union(Perms::VMEM)
    .union(Perms::THUNK);

/// The data exposure metaclass: the data offset, then the mask.
pub static EXPOSE_METACLASS: Metaclass = Metaclass::new("expose", &EXPOSE_TEMPLATE, &EXPOSE_RELOCS);

/// A class whose objects hand out their data region.
#[derive(Debug)]
pub struct ExposeClass {
    class: ThunkClass,
    perms: Perms,
}

impl ExposeClass {
    /// Create a class with `data_size` bytes of data exposed with at most
    /// `perms`.
    pub fn new(data_size: usize, perms: Perms) -> Result<Self, ThunkError> {
        let perms = perms.difference(NEVER_EXPOSED);
        let layout = ObjectLayout::new(EXPOSE_METACLASS.validate()?, data_size)?;
        let values = [layout.data_offset() as u64, u64::from(perms.bits())];
        let class = ThunkClass::new(&EXPOSE_METACLASS, layout, values.to_vec())?;
        Ok(Self { class, perms })
    }

    pub fn with_constructor<F>(self, ctor: F) -> Self
    where
        F: Fn(&AddressSpace, &Capability) -> Result<(), Fault> + Send + Sync + 'static,
    {
        Self {
            class: self.class.with_constructor(ctor),
            ..self
        }
    }

    pub fn with_destructor<F>(self, dtor: F) -> Self
    where
        F: Fn(&AddressSpace, &Capability) + Send + Sync + 'static,
    {
        Self {
            class: self.class.with_destructor(dtor),
            ..self
        }
    }

    /// Effective exposure mask.
    #[inline]
    pub fn perms(&self) -> Perms {
        self.perms
    }

    #[inline]
    pub fn thunk_class(&self) -> &ThunkClass {
        &self.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{A64Encoder, C64Encoder};
    use crate::mm::{MappedProvider, MemoryProvider};
    use crate::thunk::{Compiler, RelocError, RelocKind};
    use alloc::sync::Arc;
    use alloc::vec;

    const HELLO: &[u8] = b"Hello World!\0";

    fn hello(perms: Perms) -> ExposeClass {
        ExposeClass::new(HELLO.len(), perms)
            .unwrap()
            .with_constructor(|space, data| space.write(data, 0, HELLO))
    }

    #[test]
    fn test_scenario_hello() {
        let space = Arc::new(AddressSpace::new());
        let c = Compiler::new(space.clone(), MappedProvider::new(space.clone()), C64Encoder);
        let class = hello(Perms::READ_ONLY);
        let obj = c.alloc(class.thunk_class()).unwrap();

        let msg = c.invoke(&obj, &[]).unwrap();
        assert!(msg.is_valid());
        assert!(!msg.is_sealed());
        assert_eq!(msg.perms(), Perms::READ_ONLY);
        assert!(!msg.perms().intersects(Perms::STORE | Perms::STORE_CAP | Perms::EXECUTE));
        assert_eq!(msg.length(), class.thunk_class().layout().data_len());

        let mut text = vec![0u8; HELLO.len()];
        space.read(&msg, 0, &mut text).unwrap();
        assert_eq!(&text[..], HELLO);
        assert_eq!(space.write(&msg, 0, b"J"), Err(Fault::Permission));

        c.free(class.thunk_class(), obj).unwrap();
        assert_eq!(c.provider().outstanding(), 0);
    }

    #[test]
    fn test_mask_never_exposes_code_rights() {
        let class = ExposeClass::new(16, Perms::ROOT).unwrap();
        assert_eq!(class.perms(), Perms::ROOT.difference(NEVER_EXPOSED));

        let space = Arc::new(AddressSpace::new());
        let c = Compiler::new(space.clone(), MappedProvider::new(space), C64Encoder);
        let obj = c.alloc(class.thunk_class()).unwrap();
        let data = c.invoke(&obj, &[]).unwrap();
        assert!(data.is_valid());
        assert!(!data.perms().intersects(NEVER_EXPOSED));
        assert!(data.perms().contains(Perms::STORE));
    }

    #[test]
    fn test_objects_are_independent() {
        let space = Arc::new(AddressSpace::new());
        let c = Compiler::new(space.clone(), MappedProvider::new(space.clone()), C64Encoder);
        let class = ExposeClass::new(32, Perms::DATA).unwrap();
        let a = c.invoke(&c.alloc(class.thunk_class()).unwrap(), &[]).unwrap();
        let b = c.invoke(&c.alloc(class.thunk_class()).unwrap(), &[]).unwrap();

        space.write(&a, 0, b"first").unwrap();
        let mut buf = [0u8; 5];
        space.read(&b, 0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 5]);
        assert!(a.top() <= b.base() || b.top() <= a.base());
    }

    #[test]
    fn test_scenario_plain_a64_refuses_adr() {
        let space = Arc::new(AddressSpace::new());
        let c = Compiler::new(space.clone(), MappedProvider::new(space.clone()), A64Encoder);
        let class = hello(Perms::READ_ONLY);
        assert_eq!(
            c.alloc(class.thunk_class()),
            Err(ThunkError::Reloc(RelocError::Unsupported(RelocKind::Adr)))
        );
        assert_eq!(c.provider().outstanding(), 0);
        assert_eq!(space.region_count(), 0);
    }
}
