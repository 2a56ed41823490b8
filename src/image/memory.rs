//! Process memory as seen by the runtime core.
//!
//! Type descriptors, optional-field blobs, clause tables and indirection cells are all reached
//! through raw addresses. [`AddressSpace`] maps those addresses onto owned byte regions so every
//! dereference is bounds-checked: a pointer that leaves the mapped regions is reported as
//! [`crate::Error::OutOfBounds`] instead of reading arbitrary memory.
//!
//! Regions come in two flavours, mirroring where descriptors live in a real process:
//!
//! - [`RegionKind::Image`] - data baked into the executable by the ahead-of-time compiler
//! - [`RegionKind::Dynamic`] - data synthesized at run time by a type loader
//!
//! Writers need `&mut AddressSpace`, which makes construction single-writer and forces it to
//! finish before the space is shared for reading.

use crate::{
    image::{
        io::{read_le, NativeIO},
        target::TargetLayout,
    },
    Error, Result,
};

/// Origin of a mapped region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Baked into the compiled image
    Image,
    /// Synthesized at load time
    Dynamic,
}

/// Handle of a region inside an [`AddressSpace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

#[derive(Debug)]
struct Region {
    base: u64,
    kind: RegionKind,
    data: Vec<u8>,
    /// Bump pointer for [`AddressSpace::allocate`]
    used: usize,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

/// A sparse, bounds-checked model of process memory.
///
/// # Examples
///
/// ```rust
/// use eeruntime::image::{AddressSpace, RegionKind, TargetLayout};
///
/// let mut space = AddressSpace::new(TargetLayout::native64());
/// let region = space.map_region(0x1000, 0x100, RegionKind::Image)?;
/// let slot = space.allocate(region, 8, 8)?;
/// space.write_pointer(slot, 0xDEAD_BEEF)?;
/// assert_eq!(space.read_pointer(slot)?, 0xDEAD_BEEF);
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Debug)]
pub struct AddressSpace {
    layout: TargetLayout,
    /// Sorted by base address, never overlapping
    regions: Vec<Region>,
    system_array: Option<u64>,
}

impl AddressSpace {
    /// Create an empty address space for `layout`
    #[must_use]
    pub fn new(layout: TargetLayout) -> Self {
        AddressSpace {
            layout,
            regions: Vec::new(),
            system_array: None,
        }
    }

    /// The target layout every structure in this space follows
    #[must_use]
    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    /// Pointer size in bytes
    #[must_use]
    pub fn pointer_bytes(&self) -> u32 {
        self.layout.pointer_bytes()
    }

    /// Map `size` zeroed bytes at `base`, to be filled through [`AddressSpace::allocate`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] for the null page, empty regions or regions that would
    /// overlap an existing one.
    pub fn map_region(&mut self, base: u64, size: usize, kind: RegionKind) -> Result<RegionId> {
        let id = self.map_bytes(base, vec![0; size], kind)?;
        let index = self.region_index(id)?;
        self.regions[index].used = 0;
        Ok(id)
    }

    /// Map `data` at `base`, taking ownership of the bytes.
    ///
    /// The bump allocator of the region starts past the supplied bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] for the null page, empty regions or regions that would
    /// overlap an existing one.
    pub fn map_bytes(&mut self, base: u64, data: Vec<u8>, kind: RegionKind) -> Result<RegionId> {
        if base == 0 || data.is_empty() {
            return Err(Error::NotSupported(format!(
                "cannot map {} bytes at 0x{base:X}",
                data.len()
            )));
        }
        let Some(end) = base.checked_add(data.len() as u64) else {
            return Err(Error::NotSupported(format!(
                "region at 0x{base:X} wraps the address space"
            )));
        };

        let index = self.regions.partition_point(|region| region.base < base);
        let overlaps_prev = index > 0 && self.regions[index - 1].end() > base;
        let overlaps_next = index < self.regions.len() && self.regions[index].base < end;
        if overlaps_prev || overlaps_next {
            return Err(Error::NotSupported(format!(
                "region 0x{base:X}..0x{end:X} overlaps an existing mapping"
            )));
        }

        let used = data.len();
        self.regions.insert(
            index,
            Region {
                base,
                kind,
                data,
                used,
            },
        );

        // Ids are base addresses so they stay valid when later regions are inserted before them.
        Ok(RegionId(base))
    }

    fn region_index(&self, id: RegionId) -> Result<usize> {
        self.regions
            .binary_search_by_key(&id.0, |region| region.base)
            .map_err(|_| out_of_bounds_error!())
    }

    fn region_for(&self, address: u64) -> Option<&Region> {
        let index = self.regions.partition_point(|region| region.base <= address);
        if index == 0 {
            return None;
        }
        let region = &self.regions[index - 1];
        region.contains(address).then_some(region)
    }

    fn region_for_mut(&mut self, address: u64) -> Option<&mut Region> {
        let index = self.regions.partition_point(|region| region.base <= address);
        if index == 0 {
            return None;
        }
        let region = &mut self.regions[index - 1];
        region.contains(address).then_some(region)
    }

    /// Base address of a region
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for an unknown region id.
    pub fn region_base(&self, id: RegionId) -> Result<u64> {
        let index = self.region_index(id)?;
        Ok(self.regions[index].base)
    }

    /// Reserve `size` bytes aligned to `align` inside `region` and return their address.
    ///
    /// Regions created with [`AddressSpace::map_bytes`] start out fully reserved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when the region is exhausted.
    pub fn allocate(&mut self, region: RegionId, size: usize, align: usize) -> Result<u64> {
        let index = self.region_index(region)?;
        let region = &mut self.regions[index];

        let align = align.max(1) as u64;
        let cursor = region.base + region.used as u64;
        let start = cursor.div_ceil(align) * align;
        let Some(end) = start.checked_add(size as u64) else {
            return Err(out_of_bounds_error!());
        };
        if end > region.end() {
            return Err(out_of_bounds_error!());
        }

        region.used = (end - region.base) as usize;
        Ok(start)
    }

    /// Kind of the region `address` falls into, if it is mapped
    #[must_use]
    pub fn region_kind(&self, address: u64) -> Option<RegionKind> {
        self.region_for(address).map(|region| region.kind)
    }

    /// Returns true if `address` is inside a mapped region
    #[must_use]
    pub fn is_mapped(&self, address: u64) -> bool {
        self.region_for(address).is_some()
    }

    /// Borrow `len` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range is not inside a single mapped region.
    pub fn slice(&self, address: u64, len: usize) -> Result<&[u8]> {
        let Some(region) = self.region_for(address) else {
            return Err(out_of_bounds_error!());
        };

        let start = (address - region.base) as usize;
        let Some(end) = start.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        region
            .data
            .get(start..end)
            .ok_or_else(|| out_of_bounds_error!())
    }

    /// Borrow everything from `address` to the end of its region.
    ///
    /// Self-terminating encodings (optional-field blobs, clause tables) are decoded from here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `address` is not mapped.
    pub fn tail_from(&self, address: u64) -> Result<&[u8]> {
        let Some(region) = self.region_for(address) else {
            return Err(out_of_bounds_error!());
        };
        Ok(&region.data[(address - region.base) as usize..])
    }

    /// Mutably borrow `len` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range is not inside a single mapped region.
    pub fn slice_mut(&mut self, address: u64, len: usize) -> Result<&mut [u8]> {
        let Some(region) = self.region_for_mut(address) else {
            return Err(out_of_bounds_error!());
        };

        let start = (address - region.base) as usize;
        let Some(end) = start.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        region
            .data
            .get_mut(start..end)
            .ok_or_else(|| out_of_bounds_error!())
    }

    /// Read a little-endian primitive at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the value is not fully mapped.
    pub fn read<T: NativeIO>(&self, address: u64) -> Result<T> {
        read_le(self.slice(address, std::mem::size_of::<T>())?)
    }

    /// Write a little-endian primitive at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the value is not fully mapped.
    pub fn write<T: NativeIO>(&mut self, address: u64, value: T) -> Result<()> {
        let bytes = value.to_le_bytes();
        let bytes = bytes.as_ref();
        self.slice_mut(address, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `bytes` to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the destination is not fully mapped.
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.slice_mut(address, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Read a target-sized pointer at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the pointer is not fully mapped.
    pub fn read_pointer(&self, address: u64) -> Result<u64> {
        match self.pointer_bytes() {
            4 => Ok(u64::from(self.read::<u32>(address)?)),
            _ => self.read::<u64>(address),
        }
    }

    /// Write a target-sized pointer at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the slot is not fully mapped, and
    /// [`Error::NotSupported`] if `value` does not fit a 32-bit target pointer.
    pub fn write_pointer(&mut self, address: u64, value: u64) -> Result<()> {
        match self.pointer_bytes() {
            4 => {
                let narrow = u32::try_from(value).map_err(|_| {
                    Error::NotSupported(format!("pointer 0x{value:X} exceeds a 32-bit target"))
                })?;
                self.write(address, narrow)
            }
            _ => self.write(address, value),
        }
    }

    /// Register the class library's `System.Array` descriptor.
    ///
    /// Array descriptors report it as their base type.
    pub fn set_system_array_type(&mut self, descriptor: u64) {
        self.system_array = Some(descriptor);
    }

    /// The registered `System.Array` descriptor, if any
    #[must_use]
    pub fn system_array_type(&self) -> Option<u64> {
        self.system_array
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TargetLayout;

    fn memory() -> AddressSpace {
        let mut space = AddressSpace::new(TargetLayout::native64());
        space
            .map_bytes(0x1000, (0u8..16).collect(), RegionKind::Image)
            .unwrap();
        space.map_region(0x8000, 0x40, RegionKind::Dynamic).unwrap();
        space
    }

    #[test]
    fn test_memory_read() {
        let space = memory();
        assert_eq!(space.read::<u8>(0x1003).unwrap(), 3);
        assert_eq!(space.read::<u32>(0x1000).unwrap(), 0x0302_0100);
        assert_eq!(space.slice(0x100E, 2).unwrap(), &[14, 15]);
        assert!(space.slice(0x100E, 3).is_err());
        assert!(space.read::<u8>(0x0FFF).is_err());
        assert!(space.read::<u8>(0x1010).is_err());
    }

    #[test]
    fn test_memory_region_kind() {
        let space = memory();
        assert_eq!(space.region_kind(0x1000), Some(RegionKind::Image));
        assert_eq!(space.region_kind(0x803F), Some(RegionKind::Dynamic));
        assert_eq!(space.region_kind(0x8040), None);
        assert!(!space.is_mapped(0));
    }

    #[test]
    fn test_memory_overlap_rejected() {
        let mut space = memory();
        assert!(space.map_region(0x1008, 0x10, RegionKind::Image).is_err());
        assert!(space.map_region(0x0FF8, 0x10, RegionKind::Image).is_err());
        assert!(space.map_region(0, 0x10, RegionKind::Image).is_err());
        assert!(space.map_region(0x1010, 0x10, RegionKind::Image).is_ok());
    }

    #[test]
    fn test_memory_allocate() {
        let mut space = memory();
        let heap = RegionId(0x8000);
        let first = space.allocate(heap, 3, 1).unwrap();
        let second = space.allocate(heap, 8, 8).unwrap();
        assert_eq!(first, 0x8000);
        assert_eq!(second, 0x8008);
        assert!(space.allocate(heap, 0x40, 1).is_err());
    }

    #[test]
    fn test_memory_pointer_width() {
        let mut narrow = AddressSpace::new(TargetLayout::wasm32());
        narrow.map_region(0x100, 8, RegionKind::Image).unwrap();
        narrow.write_pointer(0x100, 0xAABB_CCDD).unwrap();
        assert_eq!(narrow.read_pointer(0x100).unwrap(), 0xAABB_CCDD);
        assert_eq!(narrow.read::<u32>(0x104).unwrap(), 0);
        assert!(narrow.write_pointer(0x100, 0x1_0000_0000).is_err());
    }
}
