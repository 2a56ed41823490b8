//! Offset computation for the variable tail of a type descriptor.
//!
//! The tail is a sequence of optional fields stored in a fixed order right after the vtable.
//! Each field is present only when its predicate over the header flags and rare flags holds, so
//! the offset of a field is the sum of the sizes of every present field before it. The order is
//! shared with the compiler that emits descriptors and must never change.
//!
//! Offsets are a pure function of a [`LayoutShape`]. [`OffsetCache`] memoizes the full table per
//! shape for hot paths that resolve the same kinds of descriptors over and over.

use dashmap::DashMap;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    image::{PointerSize, TargetLayout},
    runtime::eetype::flags::{EETypeFlags, EETypeRareFlags},
};

#[cfg(feature = "trace")]
use crate::utils::trace::TraceEvent;

/// Fields of the variable tail, in storage order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum EETypeField {
    /// Interface pointers, one per implemented interface
    InterfaceMap,
    /// Finalizer entry point
    Finalizer,
    /// Pointer to the optional-fields blob
    OptionalFieldsPtr,
    /// Underlying type of `Nullable<T>`
    NullableType,
    /// Pointer to the sealed virtual slot table
    SealedVirtualSlots,
    /// Dispatch map allocated by the type loader
    DynamicDispatchMap,
    /// Open generic definition of an instantiation
    GenericDefinition,
    /// Arity, arguments and variance of an instantiation
    GenericComposition,
    /// Module record of a type loader
    DynamicModule,
    /// Template a dynamic type was built from
    DynamicTemplateType,
    /// GC statics of a dynamic type
    DynamicGcStatics,
    /// Non-GC statics of a dynamic type
    DynamicNonGcStatics,
    /// Thread static offset of a dynamic type
    DynamicThreadStaticOffset,
}

/// Everything the tail layout of a descriptor depends on.
///
/// `absolute` selects pointer-sized encodings for the fields that shrink to 32-bit relative
/// pointers in position-independent images. It holds for dynamic descriptors and for images built
/// without relative pointer support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutShape {
    /// Pointer width of the target
    pub pointer_size: PointerSize,
    /// Number of vtable slots following the header
    pub num_vtable_slots: u16,
    /// Number of interface map entries
    pub num_interfaces: u16,
    /// Header flags
    pub flags: EETypeFlags,
    /// Rare flags from the optional-fields blob
    pub rare_flags: EETypeRareFlags,
    /// Whether tail pointers use the absolute encoding
    pub absolute: bool,
}

impl LayoutShape {
    /// Shape of a descriptor laid out for `target`.
    ///
    /// Dynamic descriptors (rare flag `IS_DYNAMIC_TYPE`) always use absolute pointers.
    #[must_use]
    pub fn new(
        target: &TargetLayout,
        num_vtable_slots: u16,
        num_interfaces: u16,
        flags: EETypeFlags,
        rare_flags: EETypeRareFlags,
    ) -> Self {
        LayoutShape {
            pointer_size: target.pointer_size,
            num_vtable_slots,
            num_interfaces,
            flags,
            rare_flags,
            absolute: rare_flags.contains(EETypeRareFlags::IS_DYNAMIC_TYPE)
                || !target.relative_pointers,
        }
    }

    fn pointer_bytes(&self) -> u32 {
        self.pointer_size.bytes()
    }

    /// Offset of the first tail field, past the header and the vtable
    #[must_use]
    pub fn vtable_end(&self) -> u32 {
        let pointer = self.pointer_bytes();
        16 + pointer + pointer * u32::from(self.num_vtable_slots)
    }

    /// Returns true if `field` is stored in this layout
    #[must_use]
    pub fn is_present(&self, field: EETypeField) -> bool {
        let rare = self.rare_flags;
        match field {
            EETypeField::InterfaceMap => self.num_interfaces > 0,
            EETypeField::Finalizer => self.flags.contains(EETypeFlags::HAS_FINALIZER),
            EETypeField::OptionalFieldsPtr => self.flags.contains(EETypeFlags::OPTIONAL_FIELDS),
            EETypeField::NullableType => rare.contains(EETypeRareFlags::IS_NULLABLE),
            EETypeField::SealedVirtualSlots => {
                rare.contains(EETypeRareFlags::HAS_SEALED_VTABLE_ENTRIES)
            }
            EETypeField::DynamicDispatchMap => {
                rare.contains(EETypeRareFlags::HAS_DYNAMICALLY_ALLOCATED_DISPATCH_MAP)
            }
            EETypeField::GenericDefinition | EETypeField::GenericComposition => {
                self.flags.contains(EETypeFlags::IS_GENERIC)
            }
            EETypeField::DynamicModule => rare.contains(EETypeRareFlags::HAS_DYNAMIC_MODULE),
            EETypeField::DynamicTemplateType => rare.contains(EETypeRareFlags::IS_DYNAMIC_TYPE),
            EETypeField::DynamicGcStatics => {
                rare.contains(EETypeRareFlags::IS_DYNAMIC_TYPE_WITH_GC_STATICS)
            }
            EETypeField::DynamicNonGcStatics => {
                rare.contains(EETypeRareFlags::IS_DYNAMIC_TYPE_WITH_NON_GC_STATICS)
            }
            EETypeField::DynamicThreadStaticOffset => {
                rare.contains(EETypeRareFlags::IS_DYNAMIC_TYPE_WITH_THREAD_STATICS)
            }
        }
    }

    /// Bytes `field` occupies when present
    #[must_use]
    pub fn field_size(&self, field: EETypeField) -> u32 {
        let pointer = self.pointer_bytes();
        match field {
            EETypeField::InterfaceMap => pointer * u32::from(self.num_interfaces),
            EETypeField::SealedVirtualSlots
            | EETypeField::GenericDefinition
            | EETypeField::GenericComposition => {
                if self.absolute {
                    pointer
                } else {
                    4
                }
            }
            EETypeField::DynamicThreadStaticOffset => 4,
            _ => pointer,
        }
    }

    /// Offset of `field` from the start of the descriptor.
    ///
    /// The interface map offset is defined even without interfaces. Asking for any other absent
    /// field is a caller bug.
    #[must_use]
    pub fn field_offset(&self, field: EETypeField) -> u32 {
        debug_assert!(
            field == EETypeField::InterfaceMap || self.is_present(field),
            "{field:?} is not present in {self:?}"
        );
        debug_assert!(
            !(self.is_present(EETypeField::NullableType)
                && self.is_present(EETypeField::SealedVirtualSlots)),
            "nullable types never carry sealed virtual slots"
        );

        let mut offset = self.vtable_end();
        for current in EETypeField::iter() {
            if current == field {
                return offset;
            }
            if self.is_present(current) {
                offset += self.field_size(current);
            }
        }
        offset
    }

    /// Total descriptor size: header, vtable and every present tail field
    #[must_use]
    pub fn total_size(&self) -> u32 {
        EETypeField::iter()
            .filter(|field| self.is_present(*field))
            .map(|field| self.field_size(field))
            .sum::<u32>()
            + self.vtable_end()
    }

    /// Offset of every tail field plus the total size, in one walk
    #[must_use]
    pub fn offsets(&self) -> FieldOffsets {
        let mut offsets = [0u32; EETypeField::COUNT];
        let mut cursor = self.vtable_end();
        for field in EETypeField::iter() {
            offsets[field as usize] = cursor;
            if self.is_present(field) {
                cursor += self.field_size(field);
            }
        }
        FieldOffsets {
            offsets,
            total_size: cursor,
        }
    }
}

/// Precomputed offsets of one [`LayoutShape`].
///
/// Absent fields hold the offset they would have, which is the offset of the next present one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldOffsets {
    offsets: [u32; EETypeField::COUNT],
    total_size: u32,
}

impl FieldOffsets {
    /// Offset of `field` from the start of the descriptor
    #[must_use]
    pub fn get(&self, field: EETypeField) -> u32 {
        self.offsets[field as usize]
    }

    /// Descriptor size including every present tail field
    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }
}

/// Process-wide memo of [`FieldOffsets`] keyed by [`LayoutShape`].
///
/// Lookups never block each other; racing threads that miss on the same shape compute the same
/// table and one of them wins the insert.
///
/// # Examples
///
/// ```rust
/// use eeruntime::image::TargetLayout;
/// use eeruntime::runtime::eetype::{
///     EETypeField, EETypeFlags, EETypeRareFlags, LayoutShape, OffsetCache,
/// };
///
/// let shape = LayoutShape::new(
///     &TargetLayout::native64(),
///     2,
///     1,
///     EETypeFlags::HAS_FINALIZER,
///     EETypeRareFlags::empty(),
/// );
///
/// let cache = OffsetCache::new();
/// assert_eq!(cache.field_offset(&shape, EETypeField::Finalizer), 48);
/// assert_eq!(cache.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct OffsetCache {
    tables: DashMap<LayoutShape, FieldOffsets>,
}

impl OffsetCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets of `shape`, computed on first use
    pub fn offsets(&self, shape: &LayoutShape) -> FieldOffsets {
        if let Some(table) = self.tables.get(shape) {
            return *table;
        }
        *self.tables.entry(*shape).or_insert_with(|| {
            rt_trace!(
                LAYOUT,
                TraceEvent::OffsetCacheMiss {
                    vtable_slots: shape.num_vtable_slots,
                    interfaces: shape.num_interfaces,
                    flags: shape.flags.bits(),
                    rare_flags: shape.rare_flags.bits(),
                }
            );
            shape.offsets()
        })
    }

    /// Cached equivalent of [`LayoutShape::field_offset`]
    pub fn field_offset(&self, shape: &LayoutShape, field: EETypeField) -> u32 {
        debug_assert!(field == EETypeField::InterfaceMap || shape.is_present(field));
        self.offsets(shape).get(field)
    }

    /// Number of distinct shapes seen so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true before the first lookup
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Drop every cached table
    pub fn clear(&self) {
        self.tables.clear();
    }
}
