//! Read-only view of one type descriptor in an [`AddressSpace`].
//!
//! A descriptor is a packed, variable-length record: a fixed header, the vtable, and a tail of
//! optional fields whose presence depends on the header flags and the rare flags stored in the
//! optional-fields blob. [`TypeDescriptor`] decodes the header once and computes everything else
//! on demand, so the view stays cheap to copy and never goes stale.
//!
//! # Header layout
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0 | 2 | component size |
//! | 2 | 2 | [`EETypeFlags`] |
//! | 4 | 4 | base size, or the shape of a parameterized type |
//! | 8 | P | related type |
//! | 8+P | 2 | vtable slot count |
//! | 10+P | 2 | interface count |
//! | 12+P | 4 | hash code |

use std::fmt;

use crate::{
    image::{io::read_le_at, AddressSpace},
    runtime::{
        classlib::{Classlib, ExceptionId},
        eetype::{
            flags::{
                shape, CorElementType, EETypeFlags, EETypeKind, EETypeRareFlags, GenericVariance,
                OptionalFieldTag, COR_ELEMENT_TYPE_SHIFT,
            },
            layout::{EETypeField, LayoutShape, OffsetCache},
            optional::get_inline_field,
            pointer::{resolve_indirection, tail_encoding, RelatedTypeSlot, ResolveTailPointer},
        },
        object::ObjectRef,
    },
    Result,
};

/// Component size of `System.String` (one UTF-16 code unit).
pub const STRING_COMPONENT_SIZE: u16 = 2;

/// Slot value meaning "not implemented here" for the ICastable slot tags.
pub const NO_SLOT: u32 = 0xFFFF;

const VALUE_TYPE_PADDING_LOW_MASK: u32 = 0x7;
const VALUE_TYPE_PADDING_HIGH_MASK: u32 = 0xFFFF_FF00;
const VALUE_TYPE_PADDING_HIGH_SHIFT: u32 = 8;
const VALUE_TYPE_PADDING_ALIGNMENT_MASK: u32 = 0xF8;
const VALUE_TYPE_PADDING_ALIGNMENT_SHIFT: u32 = 3;

/// Decoded dynamic module record.
///
/// `{ cb_size: i32, <pad to P>, dispatch resolver, runtime exception factory }`. A function
/// pointer the record is too small to hold reads as 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicModule {
    /// Address of the record
    pub address: u64,
    /// Bytes of the record the producer filled in
    pub cb_size: i32,
    /// Interface dispatch resolver, 0 when absent
    pub dynamic_type_slot_dispatch_resolve: u64,
    /// Runtime exception factory, 0 when absent
    pub get_runtime_exception: u64,
}

/// A type descriptor at a fixed address.
///
/// The view borrows the address space it lives in. Every accessor that touches memory beyond
/// the header returns a [`Result`]: a damaged image surfaces as [`crate::Error::Malformed`] or
/// [`crate::Error::OutOfBounds`] instead of reading garbage. Asking for something the descriptor
/// cannot have, like the element type of a class, is a caller bug and trips a debug assertion.
///
/// The pointer encoding of the variable tail is picked once at construction from the rare
/// flags and the [`crate::image::TargetLayout`].
///
/// # Examples
///
/// ```rust
/// use eeruntime::image::{AddressSpace, RegionKind, TargetLayout};
/// use eeruntime::runtime::eetype::{EETypeFlags, TypeDescriptor, TypeDescriptorBuilder};
///
/// let mut memory = AddressSpace::new(TargetLayout::native64());
/// let region = memory.map_region(0x10000, 0x1000, RegionKind::Image)?;
///
/// let object = TypeDescriptorBuilder::new().base_size(24).build(&mut memory, region)?;
/// let string = TypeDescriptorBuilder::new()
///     .component_size(2)
///     .base_size(22)
///     .flags(EETypeFlags::empty())
///     .base_type(object)
///     .build(&mut memory, region)?;
///
/// let string = TypeDescriptor::new(&memory, string)?;
/// assert!(string.is_string());
/// assert_eq!(string.base_type()?.map(|t| t.address()), Some(object));
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Clone, Copy)]
pub struct TypeDescriptor<'m> {
    memory: &'m AddressSpace,
    address: u64,
    component_size: u16,
    flags: EETypeFlags,
    base_size: u32,
    related_type: u64,
    num_vtable_slots: u16,
    num_interfaces: u16,
    hash_code: u32,
    encoding: &'static dyn ResolveTailPointer,
    cache: Option<&'m OffsetCache>,
}

impl<'m> TypeDescriptor<'m> {
    /// Decode the descriptor header at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for a null address and an error if the header or the
    /// optional-fields blob is not mapped.
    pub fn new(memory: &'m AddressSpace, address: u64) -> Result<Self> {
        if address == 0 {
            return Err(malformed_error!("Null type descriptor"));
        }

        let layout = memory.layout();
        let header = memory.slice(address, layout.descriptor_header_size() as usize)?;
        let mut offset = 0;
        let component_size = read_le_at::<u16>(header, &mut offset)?;
        let flags = EETypeFlags::from_bits_retain(read_le_at::<u16>(header, &mut offset)?);
        let base_size = read_le_at::<u32>(header, &mut offset)?;
        let related_type = match layout.pointer_bytes() {
            4 => u64::from(read_le_at::<u32>(header, &mut offset)?),
            _ => read_le_at::<u64>(header, &mut offset)?,
        };
        let num_vtable_slots = read_le_at::<u16>(header, &mut offset)?;
        let num_interfaces = read_le_at::<u16>(header, &mut offset)?;
        let hash_code = read_le_at::<u32>(header, &mut offset)?;

        let mut descriptor = TypeDescriptor {
            memory,
            address,
            component_size,
            flags,
            base_size,
            related_type,
            num_vtable_slots,
            num_interfaces,
            hash_code,
            encoding: tail_encoding(true, layout),
            cache: None,
        };

        // The optional-fields pointer sits before every encoding-dependent field.
        let dynamic = descriptor
            .rare_flags()?
            .contains(EETypeRareFlags::IS_DYNAMIC_TYPE);
        descriptor.encoding = tail_encoding(dynamic, layout);
        Ok(descriptor)
    }

    /// Route tail offset computations through `cache`
    #[must_use]
    pub fn with_offset_cache(mut self, cache: &'m OffsetCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// View another descriptor in the same space, sharing the offset cache.
    ///
    /// # Errors
    ///
    /// Same as [`TypeDescriptor::new`].
    pub fn descriptor_at(&self, address: u64) -> Result<TypeDescriptor<'m>> {
        let descriptor = TypeDescriptor::new(self.memory, address)?;
        Ok(match self.cache {
            Some(cache) => descriptor.with_offset_cache(cache),
            None => descriptor,
        })
    }

    fn optional_descriptor(&self, address: u64) -> Result<Option<TypeDescriptor<'m>>> {
        if address == 0 {
            return Ok(None);
        }
        self.descriptor_at(address).map(Some)
    }

    /// Address of the descriptor
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The address space the descriptor lives in
    #[must_use]
    pub fn memory(&self) -> &'m AddressSpace {
        self.memory
    }

    /// Per-element size of arrays and strings, generic arity of generic definitions
    #[must_use]
    pub fn component_size(&self) -> u16 {
        self.component_size
    }

    /// Header flags
    #[must_use]
    pub fn flags(&self) -> EETypeFlags {
        self.flags
    }

    /// Instance size, including the object header and type pointer
    #[must_use]
    pub fn base_size(&self) -> u32 {
        self.base_size
    }

    /// Number of vtable slots following the header
    #[must_use]
    pub fn num_vtable_slots(&self) -> u16 {
        self.num_vtable_slots
    }

    /// Number of implemented interfaces
    #[must_use]
    pub fn num_interfaces(&self) -> u16 {
        self.num_interfaces
    }

    /// Hash code computed by the compiler
    #[must_use]
    pub fn hash_code(&self) -> u32 {
        self.hash_code
    }

    /// Kind stored in the low flag bits
    #[must_use]
    pub fn kind(&self) -> EETypeKind {
        EETypeKind::from_flags(self.flags)
    }

    /// The raw related-type slot
    #[must_use]
    pub fn related_type_slot(&self) -> RelatedTypeSlot {
        RelatedTypeSlot::from_raw(self.related_type, self.is_related_type_via_iat())
    }

    /// Returns true for regular types
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.kind() == EETypeKind::Canonical
    }

    /// Returns true for copies of a type defined in another module
    #[must_use]
    pub fn is_cloned(&self) -> bool {
        self.kind() == EETypeKind::Cloned
    }

    /// Returns true for pointers, byrefs and arrays
    #[must_use]
    pub fn is_parameterized_type(&self) -> bool {
        self.kind() == EETypeKind::Parameterized
    }

    /// Returns true for open generic definitions
    #[must_use]
    pub fn is_generic_type_definition(&self) -> bool {
        self.kind() == EETypeKind::GenericTypeDefinition
    }

    /// Generic parameter count of a generic definition
    #[must_use]
    pub fn generic_parameter_count(&self) -> u16 {
        debug_assert!(self.is_generic_type_definition());
        self.component_size
    }

    /// Shape of a parameterized type: pointer, byref or array base size
    #[must_use]
    pub fn parameterized_type_shape(&self) -> u32 {
        debug_assert!(self.is_parameterized_type());
        self.base_size
    }

    fn szarray_base_size(&self) -> u32 {
        self.memory.layout().szarray_base_size()
    }

    /// Returns true for arrays of any rank
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.is_parameterized_type() && self.base_size >= self.szarray_base_size()
    }

    /// Returns true for single-dimensional zero-based arrays
    #[must_use]
    pub fn is_sz_array(&self) -> bool {
        self.is_array() && self.base_size == self.szarray_base_size()
    }

    /// Number of dimensions of an array.
    ///
    /// Every dimension past the first stores a lower bound and a length in the base size.
    #[must_use]
    pub fn array_rank(&self) -> u32 {
        debug_assert!(self.is_array());
        let bounds_size = i64::from(self.base_size) - i64::from(self.szarray_base_size());
        if bounds_size > 0 {
            (bounds_size / i64::from(shape::BOUNDS_PAIR_SIZE)) as u32
        } else {
            1
        }
    }

    /// Returns true for unmanaged pointer types
    #[must_use]
    pub fn is_pointer_type(&self) -> bool {
        self.is_parameterized_type() && self.base_size == shape::POINTER
    }

    /// Returns true for managed reference types
    #[must_use]
    pub fn is_byref_type(&self) -> bool {
        self.is_parameterized_type() && self.base_size == shape::BY_REF
    }

    /// Returns true for `System.String`, the only non-array type with components
    #[must_use]
    pub fn is_string(&self) -> bool {
        self.component_size == STRING_COMPONENT_SIZE
            && !self.is_array()
            && !self.is_generic_type_definition()
    }

    /// Returns true for interfaces
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(EETypeFlags::IS_INTERFACE)
    }

    /// Returns true for value types
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.flags.contains(EETypeFlags::VALUE_TYPE)
    }

    /// Returns true when instances hold references the GC must trace
    #[must_use]
    pub fn has_gc_pointers(&self) -> bool {
        self.flags.contains(EETypeFlags::HAS_POINTERS)
    }

    /// Returns true when a finalizer is stored in the tail
    #[must_use]
    pub fn is_finalizable(&self) -> bool {
        self.flags.contains(EETypeFlags::HAS_FINALIZER)
    }

    /// Returns true when the type implements ICastable
    #[must_use]
    pub fn is_icastable(&self) -> bool {
        self.flags.contains(EETypeFlags::ICASTABLE)
    }

    /// Returns true for generic instantiations
    #[must_use]
    pub fn is_generic(&self) -> bool {
        self.flags.contains(EETypeFlags::IS_GENERIC)
    }

    /// Returns true when the composition carries variance bytes
    #[must_use]
    pub fn has_generic_variance(&self) -> bool {
        self.flags.contains(EETypeFlags::GENERIC_VARIANCE)
    }

    /// Returns true when an optional-fields pointer is stored in the tail
    #[must_use]
    pub fn has_optional_fields(&self) -> bool {
        self.flags.contains(EETypeFlags::OPTIONAL_FIELDS)
    }

    /// Returns true when the related-type slot holds an indirection cell
    #[must_use]
    pub fn is_related_type_via_iat(&self) -> bool {
        self.flags.contains(EETypeFlags::RELATED_TYPE_VIA_IAT)
    }

    /// Element type code from the high flag bits, if it names a known code
    #[must_use]
    pub fn cor_element_type(&self) -> Option<CorElementType> {
        let raw = (self.flags.bits() & EETypeFlags::COR_ELEMENT_TYPE_MASK.bits())
            >> COR_ELEMENT_TYPE_SHIFT;
        CorElementType::from_repr(raw as u8)
    }

    /// Canonical, no indirect related type and no variance
    #[must_use]
    pub fn simple_casting(&self) -> bool {
        self.flags.bits() & EETypeFlags::COMPLEX_CASTING_MASK.bits() == 0
    }

    /// [`TypeDescriptor::simple_casting`] for both `self` and `other`
    #[must_use]
    pub fn both_simple_casting(&self, other: &TypeDescriptor<'_>) -> bool {
        (self.flags.bits() | other.flags.bits()) & EETypeFlags::COMPLEX_CASTING_MASK.bits() == 0
    }

    // Tail layout

    fn shape_with(&self, rare_flags: EETypeRareFlags) -> LayoutShape {
        LayoutShape::new(
            self.memory.layout(),
            self.num_vtable_slots,
            self.num_interfaces,
            self.flags,
            rare_flags,
        )
    }

    /// Everything the tail layout depends on.
    ///
    /// # Errors
    ///
    /// Returns an error if the optional-fields blob cannot be decoded.
    pub fn layout_shape(&self) -> Result<LayoutShape> {
        Ok(self.shape_with(self.rare_flags()?))
    }

    /// Offset of a tail field from the start of the descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the rare flags cannot be decoded.
    pub fn field_offset(&self, field: EETypeField) -> Result<u32> {
        let shape = self.layout_shape()?;
        Ok(match self.cache {
            Some(cache) => cache.field_offset(&shape, field),
            None => shape.field_offset(field),
        })
    }

    /// Absolute address of a tail field.
    ///
    /// # Errors
    ///
    /// Returns an error if the rare flags cannot be decoded.
    pub fn field_address(&self, field: EETypeField) -> Result<u64> {
        Ok(self.address + u64::from(self.field_offset(field)?))
    }

    /// Address of the optional-fields blob, if the descriptor has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer field is not mapped.
    pub fn optional_fields_ptr(&self) -> Result<Option<u64>> {
        if !self.has_optional_fields() {
            return Ok(None);
        }
        // Only header flags gate the fields before this one.
        let offset = self
            .shape_with(EETypeRareFlags::empty())
            .field_offset(EETypeField::OptionalFieldsPtr);
        let blob = self.memory.read_pointer(self.address + u64::from(offset))?;
        Ok((blob != 0).then_some(blob))
    }

    /// The optional-fields blob, running to the end of its region.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer field or the blob is not mapped.
    pub fn optional_fields(&self) -> Result<Option<&'m [u8]>> {
        match self.optional_fields_ptr()? {
            Some(blob) => self.memory.tail_from(blob).map(Some),
            None => Ok(None),
        }
    }

    /// Look up one optional field, falling back to `default`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn optional_field(&self, tag: OptionalFieldTag, default: u32) -> Result<u32> {
        get_inline_field(self.optional_fields()?, tag, default)
    }

    /// Rare flags, decoded from the optional-fields blob on every call.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn rare_flags(&self) -> Result<EETypeRareFlags> {
        let bits = self.optional_field(OptionalFieldTag::RareFlags, 0)?;
        Ok(EETypeRareFlags::from_bits_retain(bits))
    }

    fn has_rare_flag(&self, flag: EETypeRareFlags) -> Result<bool> {
        Ok(self.rare_flags()?.contains(flag))
    }

    /// Returns true for `Nullable<T>`
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn is_nullable(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::IS_NULLABLE)
    }

    /// Returns true when the nullable target is reached through an indirection cell
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn is_nullable_type_via_iat(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::NULLABLE_TYPE_VIA_IAT)
    }

    /// Returns true for descriptors synthesized by a type loader
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn is_dynamic_type(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::IS_DYNAMIC_TYPE)
    }

    /// Returns true when a type loader allocated the dispatch map
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn has_dynamically_allocated_dispatch_map(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::HAS_DYNAMICALLY_ALLOCATED_DISPATCH_MAP)
    }

    /// Returns true when the type has a class constructor
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn has_cctor(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::HAS_CCTOR)
    }

    /// Returns true when instances need 8-byte alignment on 32-bit targets
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn requires_align8(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::REQUIRES_ALIGN8)
    }

    /// Returns true for homogeneous floating-point aggregates
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn is_hfa(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::IS_HFA)
    }

    /// Returns true for byref-like value types
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn is_byref_like(&self) -> Result<bool> {
        self.has_rare_flag(EETypeRareFlags::IS_BYREF_LIKE)
    }

    /// Interfaces and abstract classes
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn is_abstract(&self) -> Result<bool> {
        Ok(self.is_interface() || self.has_rare_flag(EETypeRareFlags::IS_ABSTRACT_CLASS)?)
    }

    // Related type

    /// The base type.
    ///
    /// Clones answer with the base of their canonical type, arrays with the `System.Array`
    /// descriptor registered on the address space, pointers and byrefs with `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced descriptor is not mapped.
    pub fn base_type(&self) -> Result<Option<TypeDescriptor<'m>>> {
        match self.kind() {
            EETypeKind::Cloned => self.canonical_type()?.base_type(),
            EETypeKind::Parameterized => {
                if !self.is_array() {
                    return Ok(None);
                }
                match self.memory.system_array_type() {
                    Some(array) => self.descriptor_at(array).map(Some),
                    None => Ok(None),
                }
            }
            EETypeKind::Canonical | EETypeKind::GenericTypeDefinition => {
                match self.related_type_slot().resolve(self.memory)? {
                    Some(base) => self.descriptor_at(base).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    /// The canonical descriptor a clone was copied from.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the clone has no canonical type.
    pub fn canonical_type(&self) -> Result<TypeDescriptor<'m>> {
        debug_assert!(self.is_cloned());
        match self.related_type_slot().resolve(self.memory)? {
            Some(canonical) => self.descriptor_at(canonical),
            None => Err(malformed_error!(
                "Cloned type 0x{:X} has no canonical type",
                self.address
            )),
        }
    }

    /// Element type of a pointer, byref or array.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the element type is missing.
    pub fn related_parameter_type(&self) -> Result<TypeDescriptor<'m>> {
        debug_assert!(self.is_parameterized_type());
        match self.related_type_slot().resolve(self.memory)? {
            Some(element) => self.descriptor_at(element),
            None => Err(malformed_error!(
                "Parameterized type 0x{:X} has no element type",
                self.address
            )),
        }
    }

    /// Clones resolved to their canonical descriptor, everything else unchanged.
    ///
    /// # Errors
    ///
    /// Same as [`TypeDescriptor::canonical_type`].
    pub fn resolve_clone(&self) -> Result<TypeDescriptor<'m>> {
        if self.is_cloned() {
            self.canonical_type()
        } else {
            Ok(*self)
        }
    }

    /// Structural identity of two descriptors.
    ///
    /// Identical addresses are equivalent; clones are compared through their canonical types;
    /// parameterized types are equivalent when their element types are and their shapes match.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced descriptor is not mapped.
    pub fn is_equivalent_to(&self, other: &TypeDescriptor<'m>) -> Result<bool> {
        if self.address == other.address {
            return Ok(true);
        }

        let this = self.resolve_clone()?;
        let other = other.resolve_clone()?;
        if this.address == other.address {
            return Ok(true);
        }

        if this.is_parameterized_type() && other.is_parameterized_type() {
            return Ok(this.base_size == other.base_size
                && this
                    .related_parameter_type()?
                    .is_equivalent_to(&other.related_parameter_type()?)?);
        }

        Ok(false)
    }

    /// `System.Object`: the only class without a base type
    ///
    /// # Errors
    ///
    /// Returns an error if the related type cannot be resolved.
    pub fn is_system_object(&self) -> Result<bool> {
        if self.is_array() || self.is_interface() {
            return Ok(false);
        }
        Ok(self.base_type()?.is_none())
    }

    /// `System.Array`, recognized by its element type code
    #[must_use]
    pub fn is_system_array(&self) -> bool {
        self.cor_element_type() == Some(CorElementType::Array)
    }

    // Vtable and interfaces

    /// Entry `index` of the vtable
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is not mapped.
    pub fn vtable_slot(&self, index: u16) -> Result<u64> {
        debug_assert!(index < self.num_vtable_slots);
        let layout = self.memory.layout();
        let slot = self.address
            + u64::from(layout.descriptor_header_size())
            + u64::from(index) * u64::from(layout.pointer_bytes());
        self.memory.read_pointer(slot)
    }

    /// Interface `index` of the interface map, through its indirection cell when marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry or the interface descriptor is not mapped.
    pub fn interface(&self, index: u16) -> Result<TypeDescriptor<'m>> {
        debug_assert!(index < self.num_interfaces);
        let entry = self.field_address(EETypeField::InterfaceMap)?
            + u64::from(index) * u64::from(self.memory.pointer_bytes());
        let interface = resolve_indirection(self.memory, self.memory.read_pointer(entry)?)?;
        self.descriptor_at(interface)
    }

    /// All implemented interfaces in map order.
    ///
    /// # Errors
    ///
    /// Same as [`TypeDescriptor::interface`].
    pub fn interfaces(&self) -> Result<Vec<TypeDescriptor<'m>>> {
        (0..self.num_interfaces)
            .map(|index| self.interface(index))
            .collect()
    }

    /// Entry `index` of the sealed virtual slot table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table or the entry is not mapped.
    pub fn sealed_virtual_slot(&self, index: u16) -> Result<u64> {
        let field = self.field_address(EETypeField::SealedVirtualSlots)?;
        self.encoding.sealed_slot(self.memory, field, index)
    }

    /// Interfaces are present and a dispatch map is known for them.
    ///
    /// # Errors
    ///
    /// Returns an error if an optional-fields blob is malformed.
    pub fn has_dispatch_map(&self) -> Result<bool> {
        let mut current = *self;
        loop {
            if current.num_interfaces == 0 || !current.has_optional_fields() {
                return Ok(false);
            }
            if current.optional_field(OptionalFieldTag::DispatchMap, u32::MAX)? != u32::MAX {
                return Ok(true);
            }
            if current.has_dynamically_allocated_dispatch_map()? {
                return Ok(true);
            }
            if !current.is_dynamic_type()? {
                return Ok(false);
            }
            match current.dynamic_template_type()? {
                Some(template) => current = template,
                None => return Ok(false),
            }
        }
    }

    fn icastable_method(&self, tag: OptionalFieldTag) -> Result<u64> {
        debug_assert!(self.is_icastable());
        let mut current = *self;
        loop {
            if current.has_optional_fields() {
                let slot = current.optional_field(tag, NO_SLOT)?;
                if slot != NO_SLOT {
                    let slot = u16::try_from(slot)
                        .map_err(|_| malformed_error!("ICastable slot {} out of range", slot))?;
                    return if slot < current.num_vtable_slots {
                        current.vtable_slot(slot)
                    } else {
                        current.sealed_virtual_slot(slot - current.num_vtable_slots)
                    };
                }
            }

            match current.base_type()? {
                Some(base) => current = base,
                None => {
                    return Err(malformed_error!(
                        "ICastable type 0x{:X} has no {} slot",
                        self.address,
                        tag
                    ))
                }
            }
        }
    }

    /// Implementation of `ICastable.IsInstanceOfInterface`, searched up the base chain
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] when no type in the chain provides the slot.
    pub fn icastable_is_instance_method(&self) -> Result<u64> {
        self.icastable_method(OptionalFieldTag::ICastableIsInstSlot)
    }

    /// Implementation of `ICastable.GetImplType`, searched up the base chain
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] when no type in the chain provides the slot.
    pub fn icastable_get_impl_type_method(&self) -> Result<u64> {
        self.icastable_method(OptionalFieldTag::ICastableGetImplTypeSlot)
    }

    // Tail fields

    /// Entry point of the finalizer
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not mapped.
    pub fn finalizer_code(&self) -> Result<u64> {
        debug_assert!(self.is_finalizable());
        self.memory
            .read_pointer(self.field_address(EETypeField::Finalizer)?)
    }

    /// Underlying `T` of a `Nullable<T>`
    ///
    /// # Errors
    ///
    /// Returns an error if the field or the target descriptor is not mapped.
    pub fn nullable_type(&self) -> Result<TypeDescriptor<'m>> {
        let rare = self.rare_flags()?;
        debug_assert!(rare.contains(EETypeRareFlags::IS_NULLABLE));

        let shape = self.shape_with(rare);
        let field = self.address + u64::from(shape.field_offset(EETypeField::NullableType));
        let mut target = self.memory.read_pointer(field)?;
        if rare.contains(EETypeRareFlags::NULLABLE_TYPE_VIA_IAT) {
            target = self.memory.read_pointer(target)?;
        }
        self.descriptor_at(target)
    }

    /// Offset of the value inside a `Nullable<T>` instance, past its flag byte
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn nullable_value_offset(&self) -> Result<u8> {
        if !self.has_optional_fields() {
            return Ok(1);
        }
        // Stored minus one; the flag byte always comes first.
        let stored = self.optional_field(OptionalFieldTag::NullableValueOffset, 0)?;
        stored
            .checked_add(1)
            .and_then(|offset| u8::try_from(offset).ok())
            .ok_or_else(|| malformed_error!("Nullable value offset {} out of range", stored))
    }

    /// Padding added to a value type to reach its alignment
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn value_type_field_padding(&self) -> Result<u32> {
        if !self.has_optional_fields() {
            return Ok(0);
        }
        let data = self.optional_field(OptionalFieldTag::ValueTypeFieldPadding, 0)?;
        Ok((data & VALUE_TYPE_PADDING_LOW_MASK)
            | ((data & VALUE_TYPE_PADDING_HIGH_MASK)
                >> (VALUE_TYPE_PADDING_HIGH_SHIFT - VALUE_TYPE_PADDING_ALIGNMENT_SHIFT)))
    }

    /// Size of an unboxed value: base size without object header, type pointer and padding
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the base size is smaller than the overhead.
    pub fn value_type_size(&self) -> Result<u32> {
        debug_assert!(self.is_value_type());
        let pointer = self.memory.pointer_bytes();
        let overhead = pointer + pointer + self.value_type_field_padding()?;
        self.base_size.checked_sub(overhead).ok_or_else(|| {
            malformed_error!(
                "Base size {} of 0x{:X} is smaller than its overhead",
                self.base_size,
                self.address
            )
        })
    }

    /// Bytes of instance fields including the type pointer, without GC alignment padding
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the base size is smaller than the overhead.
    pub fn field_byte_count_non_gc_aligned(&self) -> Result<u32> {
        debug_assert!(!self.is_interface() && !self.is_parameterized_type());
        let overhead = self.memory.pointer_bytes() + self.value_type_field_padding()?;
        self.base_size.checked_sub(overhead).ok_or_else(|| {
            malformed_error!(
                "Base size {} of 0x{:X} is smaller than its overhead",
                self.base_size,
                self.address
            )
        })
    }

    /// Alignment of the instance fields in bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn field_alignment_requirement(&self) -> Result<u32> {
        let pointer = self.memory.pointer_bytes();
        if !self.has_optional_fields() {
            return Ok(pointer);
        }
        let data = self.optional_field(OptionalFieldTag::ValueTypeFieldPadding, 0)?;
        // One plus the log2 of the alignment, 0 for pointer alignment.
        let alignment =
            (data & VALUE_TYPE_PADDING_ALIGNMENT_MASK) >> VALUE_TYPE_PADDING_ALIGNMENT_SHIFT;
        Ok(if alignment == 0 {
            pointer
        } else {
            1 << (alignment - 1)
        })
    }

    /// Open generic definition of an instantiation
    ///
    /// # Errors
    ///
    /// Returns an error if the field or the definition is not mapped.
    pub fn generic_definition(&self) -> Result<TypeDescriptor<'m>> {
        debug_assert!(self.is_generic());
        let field = self.field_address(EETypeField::GenericDefinition)?;
        let definition = self.encoding.indirect_pointer(self.memory, field)?;
        self.descriptor_at(definition)
    }

    fn generic_composition(&self) -> Result<u64> {
        debug_assert!(self.is_generic());
        let field = self.field_address(EETypeField::GenericComposition)?;
        self.encoding.pointer(self.memory, field)
    }

    /// Number of type arguments of an instantiation
    ///
    /// # Errors
    ///
    /// Returns an error if the composition record is not mapped.
    pub fn generic_arity(&self) -> Result<u16> {
        self.memory.read::<u16>(self.generic_composition()?)
    }

    /// Type arguments of an instantiation, through indirection cells when marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the composition record or an argument is not mapped.
    pub fn generic_arguments(&self) -> Result<Vec<TypeDescriptor<'m>>> {
        let composition = self.generic_composition()?;
        let arity = self.memory.read::<u16>(composition)?;
        let pointer = u64::from(self.memory.pointer_bytes());

        let mut arguments = Vec::with_capacity(usize::from(arity));
        for index in 0..u64::from(arity) {
            let slot = composition + pointer + index * pointer;
            let argument = resolve_indirection(self.memory, self.memory.read_pointer(slot)?)?;
            arguments.push(self.descriptor_at(argument)?);
        }
        Ok(arguments)
    }

    /// Variance of each type parameter, `None` unless the type has generic variance.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for an unknown variance byte.
    pub fn generic_variance(&self) -> Result<Option<Vec<GenericVariance>>> {
        debug_assert!(self.is_generic());
        if !self.has_generic_variance() {
            return Ok(None);
        }

        let composition = self.generic_composition()?;
        let arity = self.memory.read::<u16>(composition)?;
        let pointer = u64::from(self.memory.pointer_bytes());
        let start = composition + pointer + u64::from(arity) * pointer;

        self.memory
            .slice(start, usize::from(arity))?
            .iter()
            .map(|&raw| {
                GenericVariance::from_repr(raw)
                    .ok_or_else(|| malformed_error!("Unknown generic variance 0x{:X}", raw))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Dispatch map allocated by a type loader
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not mapped.
    pub fn dynamic_dispatch_map(&self) -> Result<u64> {
        self.memory
            .read_pointer(self.field_address(EETypeField::DynamicDispatchMap)?)
    }

    /// Template a dynamic type was instantiated from
    ///
    /// # Errors
    ///
    /// Returns an error if the field or the template is not mapped.
    pub fn dynamic_template_type(&self) -> Result<Option<TypeDescriptor<'m>>> {
        debug_assert!(self.is_dynamic_type().unwrap_or(true));
        let template = self
            .memory
            .read_pointer(self.field_address(EETypeField::DynamicTemplateType)?)?;
        self.optional_descriptor(template)
    }

    /// Address of the GC statics field of a dynamic type
    ///
    /// # Errors
    ///
    /// Returns an error if the rare flags cannot be decoded.
    pub fn dynamic_gc_statics(&self) -> Result<u64> {
        self.field_address(EETypeField::DynamicGcStatics)
    }

    /// Address of the non-GC statics field of a dynamic type
    ///
    /// # Errors
    ///
    /// Returns an error if the rare flags cannot be decoded.
    pub fn dynamic_non_gc_statics(&self) -> Result<u64> {
        self.field_address(EETypeField::DynamicNonGcStatics)
    }

    /// Thread static offset of a dynamic type
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not mapped.
    pub fn dynamic_thread_static_offset(&self) -> Result<u32> {
        self.memory
            .read::<u32>(self.field_address(EETypeField::DynamicThreadStaticOffset)?)
    }

    /// Module record of a type loader, `None` when the type has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the field or the record is not mapped.
    pub fn dynamic_module(&self) -> Result<Option<DynamicModule>> {
        let rare = self.rare_flags()?;
        if !rare.contains(EETypeRareFlags::HAS_DYNAMIC_MODULE) {
            return Ok(None);
        }

        let field = self.address
            + u64::from(self.shape_with(rare).field_offset(EETypeField::DynamicModule));
        let address = self.memory.read_pointer(field)?;
        if address == 0 {
            return Ok(None);
        }

        let pointer = self.memory.pointer_bytes();
        let cb_size = self.memory.read::<i32>(address)?;
        let covers = |bytes: u32| i64::from(cb_size) >= i64::from(bytes);

        let dynamic_type_slot_dispatch_resolve = if covers(pointer * 2) {
            self.memory.read_pointer(address + u64::from(pointer))?
        } else {
            0
        };
        let get_runtime_exception = if covers(pointer * 3) {
            self.memory.read_pointer(address + u64::from(pointer) * 2)?
        } else {
            0
        };

        Ok(Some(DynamicModule {
            address,
            cb_size,
            dynamic_type_slot_dispatch_resolve,
            get_runtime_exception,
        }))
    }

    /// Address in the module that owns this type, for classlib lookups.
    ///
    /// Image types answer with their own address. Dynamic parameterized types defer to their
    /// element type, dynamic generic instantiations to their definition, and other dynamic types
    /// have no module (0).
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced descriptor is not mapped.
    pub fn associated_module_address(&self) -> Result<u64> {
        let mut current = *self;
        loop {
            if !current.is_dynamic_type()? {
                return Ok(current.address);
            }
            if current.is_parameterized_type() {
                current = current.related_parameter_type()?;
                continue;
            }
            if !current.is_generic() {
                return Ok(0);
            }
            return Ok(current.generic_definition()?.address);
        }
    }

    /// The classlib exception object for `id` that belongs with this type.
    ///
    /// A dynamic module's exception factory wins; parameterized types defer to their element
    /// type; everything else asks `classlib` by associated module address.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor chain is damaged or the classlib fails.
    pub fn classlib_exception(&self, classlib: &dyn Classlib, id: ExceptionId) -> Result<ObjectRef> {
        let mut current = *self;
        loop {
            if let Some(module) = current.dynamic_module()? {
                if module.get_runtime_exception != 0 {
                    return classlib.exception_from_function(module.get_runtime_exception, id);
                }
            }
            if current.is_parameterized_type() {
                current = current.related_parameter_type()?;
                continue;
            }
            return classlib.exception_from_module(current.associated_module_address()?, id);
        }
    }
}

impl PartialEq for TypeDescriptor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && std::ptr::eq(self.memory, other.memory)
    }
}

impl Eq for TypeDescriptor<'_> {}

impl fmt::Debug for TypeDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("address", &format_args!("0x{:X}", self.address))
            .field("kind", &self.kind())
            .field("flags", &self.flags)
            .field("base_size", &self.base_size)
            .field("component_size", &self.component_size)
            .field("num_vtable_slots", &self.num_vtable_slots)
            .field("num_interfaces", &self.num_interfaces)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TypeDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:X}", self.kind(), self.address)
    }
}
