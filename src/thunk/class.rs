//! Classes, Layouts and Objects
//!
//! A class binds a metaclass to an object layout and to the values its
//! relocations resolve to. Objects are what the compiler produces for a
//! class: one sealed entry capability each.
//!
//! # Object Layout
//! ```text
//! base                     base + data_offset             base + object_size
//! ┌─────────────────────────┬───────┬─────────────────────────────────────┐
//! │ code (patched template) │  pad  │ data (constructor-initialised)      │
//! └─────────────────────────┴───────┴─────────────────────────────────────┘
//! ```
//!
//! The data region ends exactly at the end of the object, starts on its
//! representable alignment, and has a representable length, so code can
//! narrow PCC to `[data, top)` without rounding.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cap::{align_up, representable_alignment, representable_length, Capability};
use crate::config::{CAP_SIZE, MAX_OBJECT_SIZE};
use crate::mm::{AddressSpace, Fault};

use super::metaclass::Metaclass;
use super::reloc::RelocValue;
use super::ThunkError;

/// Initialises the data region of a fresh object.
pub type Constructor = Box<dyn Fn(&AddressSpace, &Capability) -> Result<(), Fault> + Send + Sync>;

/// Tears down the data region of an object before its memory is released.
pub type Destructor = Box<dyn Fn(&AddressSpace, &Capability) + Send + Sync>;

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a class.
///
/// Objects remember the class they were compiled for.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct ClassId(u64);

impl ClassId {
    fn next() -> Self {
        Self(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// Placement of code and data inside an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    code_size: usize,
    data_offset: usize,
    object_size: usize,
}

impl ObjectLayout {
    /// Lay out `code_size` bytes of code followed by at least `data_size`
    /// bytes of data.
    pub fn new(code_size: usize, data_size: usize) -> Result<Self, ThunkError> {
        if data_size == 0 || data_size > MAX_OBJECT_SIZE {
            return Err(ThunkError::InvalidSize(data_size));
        }
        let data_len = representable_length(align_up(representable_length(data_size), CAP_SIZE));
        let align = representable_alignment(data_len).max(CAP_SIZE);
        let min_end = align_up(code_size, align)
            .checked_add(data_len)
            .filter(|&end| end <= MAX_OBJECT_SIZE)
            .ok_or(ThunkError::InvalidSize(data_size))?;
        let object_size = representable_length(min_end);
        Self::from_parts(code_size, object_size - data_len, object_size)
    }

    /// Use an explicit layout, checking that it is consistent.
    pub fn from_parts(code_size: usize, data_offset: usize, object_size: usize) -> Result<Self, ThunkError> {
        if object_size <= code_size || data_offset < code_size || data_offset >= object_size {
            return Err(ThunkError::ObjectTooSmall {
                object_size,
                code_size,
            });
        }
        let data_len = object_size - data_offset;
        if representable_length(object_size) != object_size
            || representable_length(data_len) != data_len
            || data_offset % representable_alignment(data_len) != 0
        {
            return Err(ThunkError::Unrepresentable {
                data_offset,
                object_size,
            });
        }
        Ok(Self {
            code_size,
            data_offset,
            object_size,
        })
    }

    #[inline]
    pub const fn code_size(&self) -> usize {
        self.code_size
    }

    #[inline]
    pub const fn data_offset(&self) -> usize {
        self.data_offset
    }

    #[inline]
    pub const fn data_len(&self) -> usize {
        self.object_size - self.data_offset
    }

    #[inline]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }
}

/// A metaclass bound to a layout and resolved relocation values.
pub struct ThunkClass {
    id: ClassId,
    metaclass: &'static Metaclass,
    layout: ObjectLayout,
    reloc_values: Vec<RelocValue>,
    ctor: Option<Constructor>,
    dtor: Option<Destructor>,
}

impl ThunkClass {
    /// Create a class; `reloc_values` follow the metaclass descriptor order.
    pub fn new(
        metaclass: &'static Metaclass,
        layout: ObjectLayout,
        reloc_values: Vec<RelocValue>,
    ) -> Result<Self, ThunkError> {
        let code_size = metaclass.validate()?;
        if code_size != layout.code_size() {
            return Err(ThunkError::CodeSizeMismatch {
                expected: code_size,
                found: layout.code_size(),
            });
        }
        if reloc_values.len() != metaclass.relocs().len() {
            return Err(ThunkError::RelocCount {
                expected: metaclass.relocs().len(),
                found: reloc_values.len(),
            });
        }
        let id = ClassId::next();
        log::debug!(
            "thunk: {} ({}) object size {:#x}, data at +{:#x}",
            id,
            metaclass.name(),
            layout.object_size(),
            layout.data_offset()
        );
        Ok(Self {
            id,
            metaclass,
            layout,
            reloc_values,
            ctor: None,
            dtor: None,
        })
    }

    pub fn with_constructor<F>(mut self, ctor: F) -> Self
    where
        F: Fn(&AddressSpace, &Capability) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.ctor = Some(Box::new(ctor));
        self
    }

    pub fn with_destructor<F>(mut self, dtor: F) -> Self
    where
        F: Fn(&AddressSpace, &Capability) + Send + Sync + 'static,
    {
        self.dtor = Some(Box::new(dtor));
        self
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    #[inline]
    pub fn metaclass(&self) -> &'static Metaclass {
        self.metaclass
    }

    #[inline]
    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.layout.object_size()
    }

    pub fn reloc_values(&self) -> &[RelocValue] {
        &self.reloc_values
    }

    pub(crate) fn constructor(&self) -> Option<&Constructor> {
        self.ctor.as_ref()
    }

    pub(crate) fn destructor(&self) -> Option<&Destructor> {
        self.dtor.as_ref()
    }
}

impl fmt::Debug for ThunkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkClass")
            .field("id", &self.id)
            .field("metaclass", &self.metaclass.name())
            .field("layout", &self.layout)
            .field("reloc_values", &self.reloc_values)
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .finish()
    }
}

/// A compiled thunk: a sealed entry and the class it belongs to.
///
/// The entry cannot be dereferenced; it can only be invoked. Objects from
/// [`Compiler::alloc`](super::Compiler::alloc) also carry the serial of
/// their allocation, so a handle kept past `free` never matches whatever
/// later reuses the same memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ThunkObject {
    entry: Capability,
    class: ClassId,
    serial: u64,
}

impl ThunkObject {
    /// Wrap a capability received from elsewhere.
    ///
    /// Nothing is checked here; invocation validates the entry.
    pub fn new(entry: Capability, class: ClassId) -> Self {
        Self {
            entry,
            class,
            serial: 0,
        }
    }

    pub(crate) fn with_serial(self, serial: u64) -> Self {
        Self { serial, ..self }
    }

    /// Allocation serial; zero for objects not allocated by a compiler.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[inline]
    pub fn capability(&self) -> Capability {
        self.entry
    }

    #[inline]
    pub fn class_id(&self) -> ClassId {
        self.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::templates::{EXPOSE_RELOCS, EXPOSE_TEMPLATE};
    use alloc::vec;

    static META: Metaclass = Metaclass::new("test", &EXPOSE_TEMPLATE, &EXPOSE_RELOCS);

    #[test]
    fn test_small_layout() {
        let layout = ObjectLayout::new(84, 16).unwrap();
        assert_eq!(layout.data_offset(), 96);
        assert_eq!(layout.data_len(), 16);
        assert_eq!(layout.object_size(), 112);
    }

    #[test]
    fn test_layout_pads_to_capability_size() {
        let layout = ObjectLayout::new(32, 13).unwrap();
        assert_eq!(layout.data_offset(), 32);
        assert_eq!(layout.data_len(), 16);
    }

    #[test]
    fn test_large_layout_is_representable() {
        for size in [4000usize, 4097, 8191, 100_000, 1 << 20, (1 << 20) + 1] {
            let layout = ObjectLayout::new(84, size).unwrap();
            let data_len = layout.data_len();
            assert!(data_len >= size);
            assert_eq!(representable_length(layout.object_size()), layout.object_size());
            assert_eq!(representable_length(data_len), data_len);
            assert_eq!(layout.data_offset() % representable_alignment(data_len), 0);
            assert_eq!(layout.data_offset() % CAP_SIZE, 0);
            assert!(layout.data_offset() >= 84);
        }
    }

    #[test]
    fn test_layout_errors() {
        assert_eq!(ObjectLayout::new(84, 0), Err(ThunkError::InvalidSize(0)));
        assert!(matches!(
            ObjectLayout::from_parts(84, 84, 84),
            Err(ThunkError::ObjectTooSmall { .. })
        ));
        assert!(matches!(
            ObjectLayout::from_parts(84, 80, 128),
            Err(ThunkError::ObjectTooSmall { .. })
        ));
    }

    #[test]
    fn test_class_checks_metaclass() {
        let layout = ObjectLayout::new(32, 16).unwrap();
        assert!(ThunkClass::new(&META, layout, vec![32, 0]).is_ok());
        assert_eq!(
            ThunkClass::new(&META, layout, vec![32]).err(),
            Some(ThunkError::RelocCount { expected: 2, found: 1 })
        );
        let wrong_code = ObjectLayout::new(64, 16).unwrap();
        assert_eq!(
            ThunkClass::new(&META, wrong_code, vec![0, 0]).err(),
            Some(ThunkError::CodeSizeMismatch { expected: 32, found: 64 })
        );
    }

    #[test]
    fn test_class_ids_are_unique() {
        let layout = ObjectLayout::new(32, 16).unwrap();
        let a = ThunkClass::new(&META, layout, vec![32, 0]).unwrap();
        let b = ThunkClass::new(&META, layout, vec![32, 0]).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
