//! Address Space
//!
//! Software MMU for the capability machine. Regions are either backed by
//! memory or reserved as guards: address ranges with no backing at all,
//! where every access faults.
//!
//! # Layout
//! ```text
//! MAP_WINDOW_BASE                                      MAP_WINDOW_LIMIT
//! ┌────────┬─────┬────────┬─────┬──────────────┬─────┬─ ─ ─ ─ ─ ─ ─ ─┐
//! │ region │ gap │ guard  │ gap │    region    │ gap │  never used   │
//! └────────┴─────┴────────┴─────┴──────────────┴─────┴─ ─ ─ ─ ─ ─ ─ ─┘
//! ```
//!
//! # Security Properties
//! - Addresses are handed out monotonically and never reused
//! - Every access is checked against tag, seal, permission and bounds
//!   before the mapping is consulted
//! - Unmapping requires the `VMEM` permission of the region's root
//! - Released backing memory is scrubbed

use alloc::collections::BTreeMap;
use core::fmt;

use spin::Mutex;

use crate::cap::{align_up, representable_alignment, representable_length, Capability, Perms};
use crate::config::{
    MAP_GUARD_GAP, MAP_WINDOW_BASE, MAP_WINDOW_LIMIT, MAX_BACKED_BYTES, MAX_OBJECT_SIZE, PAGE_SIZE,
};
use crate::security::ScrubbedBytes;

bitflags::bitflags! {
    /// Protection of a backed mapping.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    /// Read/write/execute, as executable memory providers need.
    pub const RWX: Self = Self::all();

    /// Permissions of a root capability over a mapping with this protection.
    fn root_perms(self) -> Perms {
        let mut perms = Perms::GLOBAL | Perms::VMEM | Perms::THUNK;
        if self.contains(Prot::READ) {
            perms |= Perms::LOAD | Perms::LOAD_CAP | Perms::MUTABLE_LOAD;
        }
        if self.contains(Prot::WRITE) {
            perms |= Perms::STORE | Perms::STORE_CAP | Perms::STORE_LOCAL_CAP;
        }
        if self.contains(Prot::EXEC) {
            perms |= Perms::EXECUTE;
        }
        perms
    }
}

/// A memory access that the machine refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The capability's tag is clear.
    Untagged,
    /// The capability is sealed.
    Sealed,
    /// The capability lacks a required permission.
    Permission,
    /// The access leaves the capability's bounds.
    Bounds,
    /// No mapping covers the address.
    Unmapped,
    /// The address lies in a guard reservation.
    Guard,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untagged => write!(f, "capability tag violation"),
            Self::Sealed => write!(f, "capability seal violation"),
            Self::Permission => write!(f, "capability permission violation"),
            Self::Bounds => write!(f, "capability bounds violation"),
            Self::Unmapped => write!(f, "access to unmapped memory"),
            Self::Guard => write!(f, "access to guard reservation"),
        }
    }
}

/// Error type for mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Zero or oversized length.
    InvalidSize,
    /// The mapping window has no room left.
    Exhausted,
    /// The capability does not name a live mapping.
    NotMapped,
    /// The capability lacks authority over the mapping.
    NoAuthority,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize => write!(f, "invalid mapping size"),
            Self::Exhausted => write!(f, "address space exhausted"),
            Self::NotMapped => write!(f, "no such mapping"),
            Self::NoAuthority => write!(f, "capability lacks authority over mapping"),
        }
    }
}

enum Backing {
    Memory(ScrubbedBytes),
    Guard,
}

struct Region {
    len: usize,
    backing: Backing,
}

struct AddressSpaceInner {
    regions: BTreeMap<usize, Region>,
    next: usize,
    limit: usize,
    mapped_bytes: usize,
}

impl AddressSpaceInner {
    /// Carve `[base, base + len)` out of the window.
    fn place(&mut self, len: usize) -> Result<usize, MapError> {
        let align = representable_alignment(len).max(PAGE_SIZE);
        let base = align_up(self.next, align);
        let end = base.checked_add(len).ok_or(MapError::Exhausted)?;
        if end > self.limit {
            return Err(MapError::Exhausted);
        }
        self.next = end.saturating_add(MAP_GUARD_GAP);
        Ok(base)
    }

    /// Check that `len` more backed bytes fit the budget.
    fn check_backing(&self, len: usize) -> Result<(), MapError> {
        match self.mapped_bytes.checked_add(len) {
            Some(total) if total <= MAX_BACKED_BYTES => Ok(()),
            _ => Err(MapError::Exhausted),
        }
    }

    /// Find the region containing `[addr, addr + len)`.
    fn region(&self, addr: usize, len: usize) -> Result<(usize, &Region), Fault> {
        let (&start, region) = self.regions.range(..=addr).next_back().ok_or(Fault::Unmapped)?;
        let end = addr.checked_add(len).ok_or(Fault::Unmapped)?;
        if end > start + region.len {
            return Err(Fault::Unmapped);
        }
        Ok((start, region))
    }

    fn bytes(&self, addr: usize, len: usize) -> Result<&[u8], Fault> {
        let (start, region) = self.region(addr, len)?;
        match &region.backing {
            Backing::Memory(bytes) => Ok(&bytes[addr - start..addr - start + len]),
            Backing::Guard => Err(Fault::Guard),
        }
    }

    fn bytes_mut(&mut self, addr: usize, len: usize) -> Result<&mut [u8], Fault> {
        let (start, _) = self.region(addr, len)?;
        let region = self.regions.get_mut(&start).ok_or(Fault::Unmapped)?;
        match &mut region.backing {
            Backing::Memory(bytes) => Ok(&mut bytes[addr - start..addr - start + len]),
            Backing::Guard => Err(Fault::Guard),
        }
    }
}

/// Check that `cap` authorises an access of `len` bytes at `offset` past its
/// cursor, returning the absolute address.
fn check_access(cap: &Capability, offset: usize, len: usize, perms: Perms) -> Result<usize, Fault> {
    if !cap.is_valid() {
        return Err(Fault::Untagged);
    }
    if cap.is_sealed() {
        return Err(Fault::Sealed);
    }
    if !cap.perms().contains(perms) {
        return Err(Fault::Permission);
    }
    let addr = cap.address().wrapping_add(offset);
    if !cap.covers(addr, len) {
        return Err(Fault::Bounds);
    }
    Ok(addr)
}

/// Length a mapping of `len` bytes actually occupies.
fn mapping_length(len: usize) -> Result<usize, MapError> {
    if len == 0 || len > MAX_OBJECT_SIZE {
        return Err(MapError::InvalidSize);
    }
    Ok(representable_length(align_up(representable_length(len), PAGE_SIZE)))
}

/// The simulated address space shared by providers, compiler and gates.
pub struct AddressSpace {
    inner: Mutex<AddressSpaceInner>,
}

impl AddressSpace {
    /// Create an address space over the default mapping window.
    pub fn new() -> Self {
        Self::with_window(MAP_WINDOW_BASE, MAP_WINDOW_LIMIT)
    }

    /// Create an address space handing out addresses in `[base, limit)`.
    pub fn with_window(base: usize, limit: usize) -> Self {
        Self {
            inner: Mutex::new(AddressSpaceInner {
                regions: BTreeMap::new(),
                next: base,
                limit,
                mapped_bytes: 0,
            }),
        }
    }

    /// Map `len` bytes of zeroed memory.
    ///
    /// The length is rounded to whole pages and to a representable length;
    /// the returned root capability covers the rounded region exactly.
    /// Fails with `Exhausted` past `MAX_BACKED_BYTES` or when the host
    /// cannot back the mapping.
    pub fn map(&self, len: usize, prot: Prot) -> Result<Capability, MapError> {
        let len = mapping_length(len)?;
        self.inner.lock().check_backing(len)?;
        let backing = ScrubbedBytes::try_zeroed(len).map_err(|_| {
            log::warn!("mm: no host memory for {:#x} bytes", len);
            MapError::Exhausted
        })?;
        let mut inner = self.inner.lock();
        inner.check_backing(len)?;
        let base = inner.place(len)?;
        inner.regions.insert(
            base,
            Region {
                len,
                backing: Backing::Memory(backing),
            },
        );
        inner.mapped_bytes += len;
        log::trace!("mm: mapped {:#x} bytes at {:#x} ({:?})", len, base, prot);
        Ok(Capability::root(base, len, prot.root_perms()))
    }

    /// Reserve `len` bytes of address space with no backing.
    ///
    /// The root capability carries full permissions, but any load, store or
    /// fetch through it faults.
    pub fn reserve(&self, len: usize) -> Result<Capability, MapError> {
        let len = mapping_length(len)?;
        let mut inner = self.inner.lock();
        let base = inner.place(len)?;
        inner.regions.insert(
            base,
            Region {
                len,
                backing: Backing::Guard,
            },
        );
        log::trace!("mm: reserved {:#x} bytes at {:#x}", len, base);
        Ok(Capability::root(base, len, Prot::RWX.root_perms()))
    }

    /// Remove the mapping whose root is `cap`.
    ///
    /// The capability must be valid, unsealed, carry `VMEM`, and cover the
    /// whole region.
    pub fn unmap(&self, cap: Capability) -> Result<(), MapError> {
        if !cap.is_valid() || cap.is_sealed() || !cap.perms().contains(Perms::VMEM) {
            return Err(MapError::NoAuthority);
        }
        let mut inner = self.inner.lock();
        let region = inner.regions.get(&cap.base()).ok_or(MapError::NotMapped)?;
        if cap.length() < region.len {
            return Err(MapError::NoAuthority);
        }
        let region = inner.regions.remove(&cap.base()).ok_or(MapError::NotMapped)?;
        if let Backing::Memory(_) = region.backing {
            inner.mapped_bytes -= region.len;
        }
        log::trace!("mm: unmapped {:#x} bytes at {:#x}", region.len, cap.base());
        Ok(())
    }

    /// Check whether any mapping starts at `base`.
    pub fn is_mapped(&self, base: usize) -> bool {
        self.inner.lock().regions.contains_key(&base)
    }

    /// Number of live regions, guards included.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Bytes of backed memory currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.inner.lock().mapped_bytes
    }

    /// Load `buf.len()` bytes at `offset` past the cursor of `cap`.
    pub fn read(&self, cap: &Capability, offset: usize, buf: &mut [u8]) -> Result<(), Fault> {
        let addr = check_access(cap, offset, buf.len(), Perms::LOAD)?;
        let inner = self.inner.lock();
        buf.copy_from_slice(inner.bytes(addr, buf.len())?);
        Ok(())
    }

    /// Store `data` at `offset` past the cursor of `cap`.
    pub fn write(&self, cap: &Capability, offset: usize, data: &[u8]) -> Result<(), Fault> {
        let addr = check_access(cap, offset, data.len(), Perms::STORE)?;
        let mut inner = self.inner.lock();
        inner.bytes_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Fill `len` bytes at `offset` past the cursor of `cap` with `byte`.
    pub fn fill(&self, cap: &Capability, offset: usize, len: usize, byte: u8) -> Result<(), Fault> {
        let addr = check_access(cap, offset, len, Perms::STORE)?;
        let mut inner = self.inner.lock();
        inner.bytes_mut(addr, len)?.fill(byte);
        Ok(())
    }

    /// Load a little-endian word at `offset` past the cursor of `cap`.
    pub fn read_u32(&self, cap: &Capability, offset: usize) -> Result<u32, Fault> {
        let mut word = [0u8; 4];
        self.read(cap, offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Store a little-endian word at `offset` past the cursor of `cap`.
    pub fn write_u32(&self, cap: &Capability, offset: usize, value: u32) -> Result<(), Fault> {
        self.write(cap, offset, &value.to_le_bytes())
    }

    /// Fetch the instruction word at the cursor of `pcc`.
    pub fn fetch(&self, pcc: &Capability) -> Result<u32, Fault> {
        let addr = check_access(pcc, 0, 4, Perms::EXECUTE)?;
        let inner = self.inner.lock();
        let bytes = inner.bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AddressSpace")
            .field("regions", &inner.regions.len())
            .field("mapped_bytes", &inner.mapped_bytes)
            .field("next", &format_args!("{:#x}", inner.next))
            .finish()
    }
}
