//! Pointer encodings used inside type descriptors.
//!
//! Descriptors reference other structures in four ways:
//!
//! - plain absolute pointers
//! - absolute pointers that may point at an indirection cell (low bit set)
//! - 32-bit offsets relative to the address of the field holding them
//! - relative offsets that may point at an indirection cell (low bit set)
//!
//! Which encoding a tail field uses depends on the descriptor: images compiled for
//! position-independent targets use the relative forms, while dynamic descriptors and images
//! without relative pointer support use the absolute ones. [`ResolveTailPointer`] hides that
//! choice behind one interface, selected once per descriptor by [`tail_encoding`].

use crate::{
    image::{AddressSpace, TargetLayout},
    runtime::eetype::flags::INDIRECTION_CELL_POINTER,
    Result,
};

/// Follow `value` through an indirection cell when its low bit says so.
///
/// This is how interface map entries, generic arguments and other descriptor references are
/// stored: either the descriptor address itself, or the address of an import cell plus one.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the indirection cell is not mapped.
pub fn resolve_indirection(memory: &AddressSpace, value: u64) -> Result<u64> {
    if value & INDIRECTION_CELL_POINTER == 0 {
        return Ok(value);
    }
    memory.read_pointer(value & !INDIRECTION_CELL_POINTER)
}

/// Target of the 32-bit self-relative pointer stored at `field`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the field is not mapped.
pub fn follow_relative(memory: &AddressSpace, field: u64) -> Result<u64> {
    let distance = memory.read::<i32>(field)?;
    Ok(field.wrapping_add_signed(i64::from(distance)))
}

/// Address of entry `index` in a table of `entry_size` byte entries.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the entry lies past the end of the address space.
fn table_entry(table: u64, index: u16, entry_size: u32) -> Result<u64> {
    u64::from(index)
        .checked_mul(u64::from(entry_size))
        .and_then(|offset| table.checked_add(offset))
        .ok_or_else(|| out_of_bounds_error!())
}

/// The related-type slot of a descriptor header.
///
/// The slot either holds the related descriptor directly or, with
/// [`crate::runtime::eetype::EETypeFlags::RELATED_TYPE_VIA_IAT`], the address of an indirection
/// cell that holds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelatedTypeSlot {
    /// Address of the related descriptor, 0 for none
    Direct(u64),
    /// Address of the cell holding the related descriptor
    Indirect(u64),
}

impl RelatedTypeSlot {
    /// Decode the raw slot value
    #[must_use]
    pub fn from_raw(value: u64, via_indirection: bool) -> Self {
        if via_indirection {
            RelatedTypeSlot::Indirect(value)
        } else {
            RelatedTypeSlot::Direct(value)
        }
    }

    /// The related descriptor, or `None` for an empty slot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the indirection cell is not mapped.
    pub fn resolve(self, memory: &AddressSpace) -> Result<Option<u64>> {
        let target = match self {
            RelatedTypeSlot::Direct(address) => address,
            RelatedTypeSlot::Indirect(0) => 0,
            RelatedTypeSlot::Indirect(cell) => memory.read_pointer(cell)?,
        };
        Ok((target != 0).then_some(target))
    }
}

/// Reader for the tail fields whose encoding depends on the descriptor.
pub trait ResolveTailPointer: Send + Sync + std::fmt::Debug {
    /// Bytes a switchable pointer field occupies for a target with `pointer_bytes` pointers
    fn slot_size(&self, pointer_bytes: u32) -> u32;

    /// Read the pointer field at `field`
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not mapped.
    fn pointer(&self, memory: &AddressSpace, field: u64) -> Result<u64>;

    /// Read the pointer field at `field`, following an indirection cell if the value is marked
    ///
    /// # Errors
    ///
    /// Returns an error if the field or the indirection cell is not mapped.
    fn indirect_pointer(&self, memory: &AddressSpace, field: u64) -> Result<u64>;

    /// Entry `index` of the sealed virtual slot table referenced from `field`
    ///
    /// # Errors
    ///
    /// Returns an error if the table or the entry is not mapped.
    fn sealed_slot(&self, memory: &AddressSpace, field: u64, index: u16) -> Result<u64>;
}

/// Pointer-sized absolute encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct AbsolutePointers;

impl ResolveTailPointer for AbsolutePointers {
    fn slot_size(&self, pointer_bytes: u32) -> u32 {
        pointer_bytes
    }

    fn pointer(&self, memory: &AddressSpace, field: u64) -> Result<u64> {
        memory.read_pointer(field)
    }

    fn indirect_pointer(&self, memory: &AddressSpace, field: u64) -> Result<u64> {
        resolve_indirection(memory, memory.read_pointer(field)?)
    }

    fn sealed_slot(&self, memory: &AddressSpace, field: u64, index: u16) -> Result<u64> {
        let table = memory.read_pointer(field)?;
        memory.read_pointer(table_entry(table, index, memory.pointer_bytes())?)
    }
}

/// 32-bit self-relative encoding of position-independent images.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelativePointers;

impl ResolveTailPointer for RelativePointers {
    fn slot_size(&self, _pointer_bytes: u32) -> u32 {
        4
    }

    fn pointer(&self, memory: &AddressSpace, field: u64) -> Result<u64> {
        follow_relative(memory, field)
    }

    fn indirect_pointer(&self, memory: &AddressSpace, field: u64) -> Result<u64> {
        let distance = memory.read::<i32>(field)?;
        if distance & 1 == 0 {
            return Ok(field.wrapping_add_signed(i64::from(distance)));
        }

        let cell = field.wrapping_add_signed(i64::from(distance & !1));
        memory.read_pointer(cell)
    }

    fn sealed_slot(&self, memory: &AddressSpace, field: u64, index: u16) -> Result<u64> {
        // Every entry is relative to its own position in the table.
        let table = follow_relative(memory, field)?;
        follow_relative(memory, table_entry(table, index, 4)?)
    }
}

static ABSOLUTE: AbsolutePointers = AbsolutePointers;
static RELATIVE: RelativePointers = RelativePointers;

/// Encoding used by the tail of a descriptor.
///
/// Dynamic descriptors always use absolute pointers; image descriptors follow the target.
#[must_use]
pub fn tail_encoding(is_dynamic: bool, target: &TargetLayout) -> &'static dyn ResolveTailPointer {
    if is_dynamic || !target.relative_pointers {
        &ABSOLUTE
    } else {
        &RELATIVE
    }
}
