//! Producer side of the type descriptor format.
//!
//! [`TypeDescriptorBuilder`] lays out a descriptor and every record it points to (optional-fields
//! blob, sealed virtual slot table, generic composition, dynamic module) inside one region of an
//! [`AddressSpace`]. It plays the part of the compiler for image descriptors and of the type
//! loader for dynamic ones, so it honours the same encoding switch as the reader: image
//! descriptors on targets with relative pointers get 32-bit relative fields, everything else gets
//! absolute pointers.
//!
//! Writing needs `&mut AddressSpace`, so a descriptor is complete before anyone can read it.

use crate::{
    image::{AddressSpace, PointerSize, RegionId, TargetLayout},
    runtime::eetype::{
        flags::{
            shape, CorElementType, EETypeFlags, EETypeKind, EETypeRareFlags, GenericVariance,
            OptionalFieldTag, INDIRECTION_CELL_POINTER,
        },
        layout::{EETypeField, LayoutShape},
        optional::OptionalFieldsBuilder,
    },
    Error, Result,
};

/// Inputs of [`size_of_descriptor`].
///
/// Mirrors what a type loader knows before it allocates a dynamic descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorSizeRequest {
    /// Number of vtable slots
    pub num_vtable_slots: u16,
    /// Number of interface map entries
    pub num_interfaces: u16,
    /// A finalizer pointer is needed
    pub has_finalizer: bool,
    /// An optional-fields pointer is needed
    pub requires_optional_fields: bool,
    /// A nullable target pointer is needed
    pub requires_nullable_type: bool,
    /// A sealed virtual slot table pointer is needed
    pub has_sealed_virtuals: bool,
    /// Generic definition and composition pointers are needed
    pub has_generic_info: bool,
    /// A non-GC statics pointer is needed
    pub has_non_gc_statics: bool,
    /// A GC statics pointer is needed
    pub has_gc_statics: bool,
    /// A thread static offset is needed
    pub has_thread_statics: bool,
}

/// Bytes a type loader allocates for a dynamic descriptor.
///
/// Dynamic descriptors always use absolute pointers. Nullable types never carry sealed
/// virtual slots.
#[must_use]
pub fn size_of_descriptor(pointer_size: PointerSize, request: &DescriptorSizeRequest) -> u32 {
    debug_assert!(
        !(request.requires_nullable_type && request.has_sealed_virtuals),
        "nullable types with sealed virtual slots are not supported"
    );

    let pointer = pointer_size.bytes();
    let optional = |present: bool, size: u32| if present { size } else { 0 };

    16 + pointer
        + pointer * u32::from(request.num_vtable_slots)
        + pointer * u32::from(request.num_interfaces)
        + optional(request.has_finalizer, pointer)
        + optional(request.requires_optional_fields, pointer)
        + optional(request.requires_nullable_type, pointer)
        + optional(request.has_sealed_virtuals, pointer)
        + optional(request.has_generic_info, pointer * 2)
        + optional(request.has_non_gc_statics, pointer)
        + optional(request.has_gc_statics, pointer)
        + optional(request.has_thread_statics, 4)
}

/// Shape value of a single-dimensional zero-based array
#[must_use]
pub fn szarray_shape(target: &TargetLayout) -> u32 {
    target.szarray_base_size()
}

/// Shape value of a multi-dimensional array of `rank` dimensions
#[must_use]
pub fn md_array_shape(target: &TargetLayout, rank: u32) -> u32 {
    target.szarray_base_size() + rank * shape::BOUNDS_PAIR_SIZE
}

#[derive(Clone, Debug)]
struct GenericInfo {
    definition: u64,
    arguments: Vec<u64>,
    variance: Option<Vec<GenericVariance>>,
}

#[derive(Clone, Copy, Debug)]
struct DynamicModuleInfo {
    cb_size: i32,
    dispatch_resolve: u64,
    get_runtime_exception: u64,
}

/// Fluent builder for one type descriptor.
///
/// Addresses passed in are stored as-is. Values with the low bit set are indirection cell
/// references wherever the format allows them (interface entries, generic definition and
/// arguments).
///
/// # Examples
///
/// ```rust
/// use eeruntime::image::{AddressSpace, RegionKind, TargetLayout};
/// use eeruntime::runtime::eetype::{
///     EETypeFlags, EETypeRareFlags, TypeDescriptor, TypeDescriptorBuilder,
/// };
///
/// let mut memory = AddressSpace::new(TargetLayout::portable64());
/// let region = memory.map_region(0x20000, 0x1000, RegionKind::Image)?;
///
/// let object = TypeDescriptorBuilder::new().base_size(24).build(&mut memory, region)?;
/// let definition = TypeDescriptorBuilder::new()
///     .generic_type_definition(1)
///     .build(&mut memory, region)?;
/// let list = TypeDescriptorBuilder::new()
///     .base_type(object)
///     .finalizer(0x4000)
///     .generic(definition, vec![object], None)
///     .rare_flags(EETypeRareFlags::HAS_CCTOR)
///     .build(&mut memory, region)?;
///
/// let list = TypeDescriptor::new(&memory, list)?;
/// assert!(list.has_cctor()?);
/// assert_eq!(list.finalizer_code()?, 0x4000);
/// assert_eq!(list.generic_definition()?.address(), definition);
/// assert_eq!(list.generic_arity()?, 1);
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct TypeDescriptorBuilder {
    component_size: u16,
    flags: EETypeFlags,
    base_size: u32,
    related_type: u64,
    hash_code: u32,
    vtable: Vec<u64>,
    interfaces: Vec<u64>,
    finalizer: Option<u64>,
    optional: OptionalFieldsBuilder,
    rare_flags: EETypeRareFlags,
    nullable_type: Option<u64>,
    sealed_slots: Option<Vec<u64>>,
    dynamic_dispatch_map: Option<u64>,
    generic: Option<GenericInfo>,
    dynamic_module: Option<DynamicModuleInfo>,
    dynamic_template: Option<u64>,
    gc_statics: Option<u64>,
    non_gc_statics: Option<u64>,
    thread_static_offset: Option<u32>,
}

impl TypeDescriptorBuilder {
    /// A canonical class with no fields, slots or base type
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_kind(mut self, kind: EETypeKind) -> Self {
        self.flags = (self.flags - EETypeFlags::KIND_MASK) | kind.to_flags();
        self
    }

    /// Add header flags; kind bits are managed by the kind setters
    #[must_use]
    pub fn flags(mut self, flags: EETypeFlags) -> Self {
        self.flags |= flags - EETypeFlags::KIND_MASK;
        self
    }

    /// Add rare flags, stored in the optional-fields blob
    #[must_use]
    pub fn rare_flags(mut self, flags: EETypeRareFlags) -> Self {
        self.rare_flags |= flags;
        self
    }

    /// Store an optional field other than the rare flags
    #[must_use]
    pub fn optional_field(mut self, tag: OptionalFieldTag, value: u32) -> Self {
        debug_assert!(tag != OptionalFieldTag::RareFlags, "use rare_flags()");
        self.optional.set(tag, value);
        self
    }

    /// Per-element size of arrays and strings
    #[must_use]
    pub fn component_size(mut self, size: u16) -> Self {
        self.component_size = size;
        self
    }

    /// Instance size, or the shape of a parameterized type
    #[must_use]
    pub fn base_size(mut self, size: u32) -> Self {
        self.base_size = size;
        self
    }

    /// Hash code stored in the header
    #[must_use]
    pub fn hash_code(mut self, hash: u32) -> Self {
        self.hash_code = hash;
        self
    }

    /// Element type code stored in the high flag bits
    #[must_use]
    pub fn cor_element_type(mut self, element: CorElementType) -> Self {
        self.flags = (self.flags - EETypeFlags::COR_ELEMENT_TYPE_MASK) | element.to_flags();
        self
    }

    /// Mark as a value type
    #[must_use]
    pub fn value_type(self) -> Self {
        self.flags(EETypeFlags::VALUE_TYPE)
    }

    /// Canonical type deriving from `base`
    #[must_use]
    pub fn base_type(mut self, base: u64) -> Self {
        self.related_type = base;
        self.flags -= EETypeFlags::RELATED_TYPE_VIA_IAT;
        self.with_kind(EETypeKind::Canonical)
    }

    /// Canonical type whose base is held by the indirection cell at `cell`
    #[must_use]
    pub fn base_type_via_cell(mut self, cell: u64) -> Self {
        self.related_type = cell;
        self.flags |= EETypeFlags::RELATED_TYPE_VIA_IAT;
        self.with_kind(EETypeKind::Canonical)
    }

    /// Clone of the canonical descriptor at `canonical`
    #[must_use]
    pub fn clone_of(mut self, canonical: u64) -> Self {
        self.related_type = canonical;
        self.flags -= EETypeFlags::RELATED_TYPE_VIA_IAT;
        self.with_kind(EETypeKind::Cloned)
    }

    /// Clone whose canonical descriptor is held by the indirection cell at `cell`
    #[must_use]
    pub fn clone_via_cell(mut self, cell: u64) -> Self {
        self.related_type = cell;
        self.flags |= EETypeFlags::RELATED_TYPE_VIA_IAT;
        self.with_kind(EETypeKind::Cloned)
    }

    /// Pointer, byref or array of `element`; see [`shape`], [`szarray_shape`] and
    /// [`md_array_shape`]
    #[must_use]
    pub fn parameterized(mut self, element: u64, shape: u32) -> Self {
        self.related_type = element;
        self.base_size = shape;
        self.flags -= EETypeFlags::RELATED_TYPE_VIA_IAT;
        self.with_kind(EETypeKind::Parameterized)
    }

    /// Open generic definition with `arity` parameters
    #[must_use]
    pub fn generic_type_definition(mut self, arity: u16) -> Self {
        self.component_size = arity;
        self.with_kind(EETypeKind::GenericTypeDefinition)
    }

    /// Append vtable slots
    #[must_use]
    pub fn vtable_slots(mut self, slots: impl IntoIterator<Item = u64>) -> Self {
        self.vtable.extend(slots);
        self
    }

    /// Append an interface map entry
    #[must_use]
    pub fn interface(mut self, interface: u64) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Append an interface map entry held by the indirection cell at `cell`
    #[must_use]
    pub fn interface_via_cell(self, cell: u64) -> Self {
        self.interface(cell | INDIRECTION_CELL_POINTER)
    }

    /// Store a finalizer entry point
    #[must_use]
    pub fn finalizer(mut self, code: u64) -> Self {
        self.finalizer = Some(code);
        self.flags(EETypeFlags::HAS_FINALIZER)
    }

    /// Make this `Nullable<T>` over `target`, optionally through an indirection cell
    #[must_use]
    pub fn nullable(mut self, target: u64, via_cell: bool) -> Self {
        self.nullable_type = Some(target);
        let mut rare = EETypeRareFlags::IS_NULLABLE;
        if via_cell {
            rare |= EETypeRareFlags::NULLABLE_TYPE_VIA_IAT;
        }
        self.value_type().rare_flags(rare)
    }

    /// Store a sealed virtual slot table
    #[must_use]
    pub fn sealed_virtual_slots(mut self, slots: Vec<u64>) -> Self {
        self.sealed_slots = Some(slots);
        self.rare_flags(EETypeRareFlags::HAS_SEALED_VTABLE_ENTRIES)
    }

    /// Store a dispatch map allocated at run time
    #[must_use]
    pub fn dynamic_dispatch_map(mut self, map: u64) -> Self {
        self.dynamic_dispatch_map = Some(map);
        self.rare_flags(EETypeRareFlags::HAS_DYNAMICALLY_ALLOCATED_DISPATCH_MAP)
    }

    /// Make this an instantiation of `definition` over `arguments`.
    ///
    /// Variance bytes are written, and the variance flag set, only when `variance` is given.
    #[must_use]
    pub fn generic(
        mut self,
        definition: u64,
        arguments: Vec<u64>,
        variance: Option<Vec<GenericVariance>>,
    ) -> Self {
        debug_assert!(variance
            .as_ref()
            .map_or(true, |variance| variance.len() == arguments.len()));
        if variance.is_some() {
            self.flags |= EETypeFlags::GENERIC_VARIANCE;
        }
        self.generic = Some(GenericInfo {
            definition,
            arguments,
            variance,
        });
        self.flags(EETypeFlags::IS_GENERIC)
    }

    /// Mark as synthesized by a type loader from `template`
    #[must_use]
    pub fn dynamic(mut self, template: u64) -> Self {
        self.dynamic_template = Some(template);
        self.rare_flags(EETypeRareFlags::IS_DYNAMIC_TYPE)
    }

    /// Attach a dynamic module record covering `cb_size` bytes
    #[must_use]
    pub fn dynamic_module(
        mut self,
        cb_size: i32,
        dispatch_resolve: u64,
        get_runtime_exception: u64,
    ) -> Self {
        self.dynamic_module = Some(DynamicModuleInfo {
            cb_size,
            dispatch_resolve,
            get_runtime_exception,
        });
        self.rare_flags(EETypeRareFlags::HAS_DYNAMIC_MODULE)
    }

    /// Store the GC statics pointer of a dynamic type
    #[must_use]
    pub fn gc_statics(mut self, data: u64) -> Self {
        self.gc_statics = Some(data);
        self.rare_flags(EETypeRareFlags::IS_DYNAMIC_TYPE_WITH_GC_STATICS)
    }

    /// Store the non-GC statics pointer of a dynamic type
    #[must_use]
    pub fn non_gc_statics(mut self, data: u64) -> Self {
        self.non_gc_statics = Some(data);
        self.rare_flags(EETypeRareFlags::IS_DYNAMIC_TYPE_WITH_NON_GC_STATICS)
    }

    /// Store the thread static offset of a dynamic type
    #[must_use]
    pub fn thread_static_offset(mut self, offset: u32) -> Self {
        self.thread_static_offset = Some(offset);
        self.rare_flags(EETypeRareFlags::IS_DYNAMIC_TYPE_WITH_THREAD_STATICS)
    }

    fn optional_blob(&self) -> Option<Vec<u8>> {
        let mut blob = self.optional.clone();
        if !self.rare_flags.is_empty() {
            blob.set(OptionalFieldTag::RareFlags, self.rare_flags.bits());
        }
        (!blob.is_empty()).then(|| blob.encode())
    }

    /// Lay out the descriptor in `region` and return its address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when the region is exhausted and [`Error::NotSupported`]
    /// when a relative field cannot reach its target or a count does not fit the header.
    pub fn build(&self, memory: &mut AddressSpace, region: RegionId) -> Result<u64> {
        if self.nullable_type.is_some() && self.sealed_slots.is_some() {
            return Err(Error::NotSupported(
                "nullable types with sealed virtual slots".to_string(),
            ));
        }

        let blob = self.optional_blob();
        let mut flags = self.flags;
        flags.set(EETypeFlags::OPTIONAL_FIELDS, blob.is_some());

        let num_vtable_slots = u16::try_from(self.vtable.len())
            .map_err(|_| Error::NotSupported(format!("{} vtable slots", self.vtable.len())))?;
        let num_interfaces = u16::try_from(self.interfaces.len())
            .map_err(|_| Error::NotSupported(format!("{} interfaces", self.interfaces.len())))?;

        let target = *memory.layout();
        let layout = LayoutShape::new(
            &target,
            num_vtable_slots,
            num_interfaces,
            flags,
            self.rare_flags,
        );
        let pointer = u64::from(target.pointer_bytes());

        let address = memory.allocate(region, layout.total_size() as usize, pointer as usize)?;

        // Header
        memory.write(address, self.component_size)?;
        memory.write(address + 2, flags.bits())?;
        memory.write(address + 4, self.base_size)?;
        memory.write_pointer(address + 8, self.related_type)?;
        memory.write(address + 8 + pointer, num_vtable_slots)?;
        memory.write(address + 10 + pointer, num_interfaces)?;
        memory.write(address + 12 + pointer, self.hash_code)?;

        let vtable = address + u64::from(target.descriptor_header_size());
        for (index, slot) in self.vtable.iter().enumerate() {
            memory.write_pointer(vtable + index as u64 * pointer, *slot)?;
        }

        let field = |name: EETypeField| address + u64::from(layout.field_offset(name));

        if num_interfaces > 0 {
            let map = field(EETypeField::InterfaceMap);
            for (index, interface) in self.interfaces.iter().enumerate() {
                memory.write_pointer(map + index as u64 * pointer, *interface)?;
            }
        }
        if let Some(code) = self.finalizer {
            memory.write_pointer(field(EETypeField::Finalizer), code)?;
        }
        if let Some(blob) = &blob {
            let blob_address = memory.allocate(region, blob.len(), 1)?;
            memory.write_bytes(blob_address, blob)?;
            memory.write_pointer(field(EETypeField::OptionalFieldsPtr), blob_address)?;
        }
        if let Some(target_type) = self.nullable_type {
            memory.write_pointer(field(EETypeField::NullableType), target_type)?;
        }
        if let Some(slots) = &self.sealed_slots {
            let at = field(EETypeField::SealedVirtualSlots);
            write_sealed_slots(memory, region, at, slots, layout.absolute)?;
        }
        if let Some(map) = self.dynamic_dispatch_map {
            memory.write_pointer(field(EETypeField::DynamicDispatchMap), map)?;
        }
        if let Some(generic) = &self.generic {
            let at = field(EETypeField::GenericDefinition);
            if layout.absolute {
                memory.write_pointer(at, generic.definition)?;
            } else {
                write_relative_indirect(memory, at, generic.definition)?;
            }

            let composition = write_generic_composition(memory, region, generic)?;
            let at = field(EETypeField::GenericComposition);
            if layout.absolute {
                memory.write_pointer(at, composition)?;
            } else {
                write_relative(memory, at, composition)?;
            }
        }
        if let Some(module) = self.dynamic_module {
            let record = memory.allocate(region, pointer as usize * 3, pointer as usize)?;
            memory.write(record, module.cb_size)?;
            memory.write_pointer(record + pointer, module.dispatch_resolve)?;
            memory.write_pointer(record + pointer * 2, module.get_runtime_exception)?;
            memory.write_pointer(field(EETypeField::DynamicModule), record)?;
        }
        if let Some(template) = self.dynamic_template {
            memory.write_pointer(field(EETypeField::DynamicTemplateType), template)?;
        }
        if let Some(data) = self.gc_statics {
            memory.write_pointer(field(EETypeField::DynamicGcStatics), data)?;
        }
        if let Some(data) = self.non_gc_statics {
            memory.write_pointer(field(EETypeField::DynamicNonGcStatics), data)?;
        }
        if let Some(offset) = self.thread_static_offset {
            memory.write(field(EETypeField::DynamicThreadStaticOffset), offset)?;
        }

        Ok(address)
    }
}

fn relative_distance(field: u64, target: u64) -> Result<i32> {
    let distance = i128::from(target) - i128::from(field);
    i32::try_from(distance).map_err(|_| {
        Error::NotSupported(format!(
            "relative pointer from 0x{field:X} cannot reach 0x{target:X}"
        ))
    })
}

fn write_relative(memory: &mut AddressSpace, field: u64, target: u64) -> Result<()> {
    memory.write(field, relative_distance(field, target)?)
}

/// Relative form of a possibly indirect reference: a marked value addresses the cell.
fn write_relative_indirect(memory: &mut AddressSpace, field: u64, value: u64) -> Result<()> {
    let marked = value & INDIRECTION_CELL_POINTER != 0;
    let distance = relative_distance(field, value & !INDIRECTION_CELL_POINTER)?;
    // The low bit of the distance is the marker, so the distance itself must be even.
    if distance & 1 != 0 {
        return Err(Error::NotSupported(format!(
            "target 0x{value:X} is misaligned for field 0x{field:X}"
        )));
    }
    memory.write(field, if marked { distance | 1 } else { distance })
}

fn write_sealed_slots(
    memory: &mut AddressSpace,
    region: RegionId,
    field: u64,
    slots: &[u64],
    absolute: bool,
) -> Result<()> {
    if absolute {
        let pointer = memory.pointer_bytes() as usize;
        let table = memory.allocate(region, pointer * slots.len().max(1), pointer)?;
        for (index, slot) in slots.iter().enumerate() {
            memory.write_pointer(table + (index * pointer) as u64, *slot)?;
        }
        return memory.write_pointer(field, table);
    }

    let table = memory.allocate(region, 4 * slots.len().max(1), 4)?;
    for (index, slot) in slots.iter().enumerate() {
        write_relative(memory, table + index as u64 * 4, *slot)?;
    }
    write_relative(memory, field, table)
}

fn write_generic_composition(
    memory: &mut AddressSpace,
    region: RegionId,
    generic: &GenericInfo,
) -> Result<u64> {
    let pointer = u64::from(memory.pointer_bytes());
    let arity = u16::try_from(generic.arguments.len()).map_err(|_| {
        Error::NotSupported(format!("{} generic arguments", generic.arguments.len()))
    })?;
    let variance_bytes = generic.variance.as_ref().map_or(0, Vec::len) as u64;
    let size = pointer + u64::from(arity) * pointer + variance_bytes;

    let record = memory.allocate(region, size as usize, pointer as usize)?;
    memory.write(record, arity)?;
    for (index, argument) in generic.arguments.iter().enumerate() {
        memory.write_pointer(record + pointer + index as u64 * pointer, *argument)?;
    }
    if let Some(variance) = &generic.variance {
        let bytes: Vec<u8> = variance.iter().map(|v| *v as u8).collect();
        memory.write_bytes(record + pointer + u64::from(arity) * pointer, &bytes)?;
    }
    Ok(record)
}
