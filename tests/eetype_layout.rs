//! Integration tests for type descriptors laid out by the builder and read back.
//!
//! Each scenario builds a handful of descriptors into a fresh address space for one target
//! layout and checks what the decoder sees, including the variable tail whose offsets depend
//! on flags, pointer size and pointer encoding.

use eeruntime::prelude::*;

const IMAGE_BASE: u64 = 0x20_0000;

fn image(layout: TargetLayout) -> Result<(AddressSpace, RegionId)> {
    let mut memory = AddressSpace::new(layout);
    let region = memory.map_region(IMAGE_BASE, 0x4000, RegionKind::Image)?;
    Ok((memory, region))
}

/// A class deriving from an exception that implements a disposable-style interface.
#[test]
fn test_class_hierarchy_with_interfaces() -> Result<()> {
    let (mut memory, region) = image(TargetLayout::native64())?;

    let object = TypeDescriptorBuilder::new()
        .base_size(24)
        .build(&mut memory, region)?;
    let disposable = TypeDescriptorBuilder::new()
        .flags(EETypeFlags::IS_INTERFACE)
        .vtable_slots([0x9_0000])
        .build(&mut memory, region)?;
    let comparable = TypeDescriptorBuilder::new()
        .flags(EETypeFlags::IS_INTERFACE)
        .build(&mut memory, region)?;
    let exception = TypeDescriptorBuilder::new()
        .base_size(128)
        .base_type(object)
        .interface(disposable)
        .vtable_slots([0x9_1000, 0x9_1010, 0x9_1020])
        .build(&mut memory, region)?;
    let io_exception = TypeDescriptorBuilder::new()
        .base_size(136)
        .base_type(exception)
        .build(&mut memory, region)?;

    let io_exception = TypeDescriptor::new(&memory, io_exception)?;
    let exception = TypeDescriptor::new(&memory, exception)?;
    let object = TypeDescriptor::new(&memory, object)?;
    let disposable = TypeDescriptor::new(&memory, disposable)?;
    let comparable = TypeDescriptor::new(&memory, comparable)?;

    assert_eq!(io_exception.kind(), EETypeKind::Canonical);
    assert_eq!(io_exception.base_type()?.map(|t| t.address()), Some(exception.address()));
    assert!(object.base_type()?.is_none());

    assert_eq!(exception.num_vtable_slots(), 3);
    assert_eq!(exception.vtable_slot(1)?, 0x9_1010);
    assert_eq!(exception.num_interfaces(), 1);
    assert_eq!(exception.interface(0)?.address(), disposable.address());

    assert!(is_instance_of_class(&io_exception, &object)?);
    assert!(!is_instance_of_class(&object, &exception)?);

    // Interfaces are inherited through the base chain.
    assert!(is_instance_of(&io_exception, &disposable)?);
    assert!(!is_instance_of(&io_exception, &comparable)?);
    assert!(disposable.is_interface());

    Ok(())
}

/// A generic instantiation in a position-independent image, read through relative pointers.
#[test]
fn test_relative_generic_instantiation() -> Result<()> {
    let (mut memory, region) = image(TargetLayout::portable64())?;

    let object = TypeDescriptorBuilder::new()
        .base_size(24)
        .build(&mut memory, region)?;
    let string = TypeDescriptorBuilder::new()
        .base_size(22)
        .component_size(2)
        .base_type(object)
        .build(&mut memory, region)?;
    let definition = TypeDescriptorBuilder::new()
        .generic_type_definition(2)
        .build(&mut memory, region)?;
    let instantiation = TypeDescriptorBuilder::new()
        .base_size(40)
        .base_type(object)
        .generic(
            definition,
            vec![string, object],
            Some(vec![GenericVariance::Covariant, GenericVariance::NonVariant]),
        )
        .finalizer(0x5_0000)
        .build(&mut memory, region)?;

    let instantiation = TypeDescriptor::new(&memory, instantiation)?;
    assert!(instantiation.is_generic());
    assert!(instantiation.has_generic_variance());
    assert!(instantiation.is_finalizable());
    assert_eq!(instantiation.finalizer_code()?, 0x5_0000);

    let definition = instantiation.generic_definition()?;
    assert!(definition.is_generic_type_definition());
    assert_eq!(definition.generic_parameter_count(), 2);

    assert_eq!(instantiation.generic_arity()?, 2);
    let arguments: Vec<u64> = instantiation
        .generic_arguments()?
        .iter()
        .map(TypeDescriptor::address)
        .collect();
    assert_eq!(arguments, vec![string, object]);
    assert_eq!(
        instantiation.generic_variance()?,
        Some(vec![GenericVariance::Covariant, GenericVariance::NonVariant])
    );

    Ok(())
}

/// Value type sizes and the nullable layout agree across pointer widths.
#[test]
fn test_value_types_across_targets() -> Result<()> {
    for layout in [TargetLayout::native64(), TargetLayout::wasm32()] {
        let (mut memory, region) = image(layout)?;
        let pointer = layout.pointer_bytes();

        let int32 = TypeDescriptorBuilder::new()
            .base_size(2 * pointer + 4)
            .value_type()
            .cor_element_type(CorElementType::I4)
            .build(&mut memory, region)?;
        let nullable = TypeDescriptorBuilder::new()
            .base_size(2 * pointer + 8)
            .nullable(int32, false)
            .optional_field(OptionalFieldTag::NullableValueOffset, 3)
            .build(&mut memory, region)?;
        let plain_nullable = TypeDescriptorBuilder::new()
            .base_size(2 * pointer + 4)
            .nullable(int32, false)
            .build(&mut memory, region)?;

        let int32 = TypeDescriptor::new(&memory, int32)?;
        assert!(int32.is_value_type());
        assert_eq!(int32.value_type_size()?, 4);
        assert_eq!(int32.cor_element_type(), Some(CorElementType::I4));
        assert_eq!(int32.nullable_value_offset()?, 1);

        let nullable = TypeDescriptor::new(&memory, nullable)?;
        assert!(nullable.is_nullable()?);
        assert_eq!(nullable.nullable_type()?.address(), int32.address());
        assert_eq!(nullable.nullable_value_offset()?, 4);
        assert_eq!(nullable.value_type_size()?, 8);

        // The flag byte directly precedes the value when the offset is the default.
        let plain_nullable = TypeDescriptor::new(&memory, plain_nullable)?;
        assert!(plain_nullable.is_nullable()?);
        assert_eq!(plain_nullable.nullable_value_offset()?, 1);
    }

    Ok(())
}

/// Single-dimensional and multi-dimensional arrays over the same element type.
#[test]
fn test_array_shapes() -> Result<()> {
    let layout = TargetLayout::native64();
    let (mut memory, region) = image(layout)?;

    let object = TypeDescriptorBuilder::new()
        .base_size(24)
        .build(&mut memory, region)?;
    let vector = TypeDescriptorBuilder::new()
        .parameterized(object, szarray_shape(&layout))
        .component_size(8)
        .build(&mut memory, region)?;
    let matrix = TypeDescriptorBuilder::new()
        .parameterized(object, md_array_shape(&layout, 2))
        .component_size(8)
        .build(&mut memory, region)?;

    let vector = TypeDescriptor::new(&memory, vector)?;
    assert!(vector.is_parameterized_type());
    assert!(vector.is_array());
    assert!(vector.is_sz_array());
    assert_eq!(vector.array_rank(), 1);
    assert_eq!(vector.component_size(), 8);
    assert_eq!(vector.related_parameter_type()?.address(), object);

    let matrix = TypeDescriptor::new(&memory, matrix)?;
    assert!(matrix.is_array());
    assert!(!matrix.is_sz_array());
    assert_eq!(matrix.array_rank(), 2);

    Ok(())
}

/// Cached and uncached offset computations agree and the cache fills per shape.
#[test]
fn test_offset_cache_agrees_with_direct_computation() -> Result<()> {
    let config = RuntimeConfig::portable64();
    let cache = config
        .offset_cache()
        .ok_or_else(|| Error::NotSupported("offset cache disabled".to_string()))?;
    let mut memory = config.address_space();
    let region = memory.map_region(IMAGE_BASE, 0x4000, RegionKind::Image)?;

    let object = TypeDescriptorBuilder::new()
        .base_size(24)
        .build(&mut memory, region)?;
    let finalizable = TypeDescriptorBuilder::new()
        .base_size(32)
        .base_type(object)
        .finalizer(0x7_0000)
        .rare_flags(EETypeRareFlags::HAS_CCTOR)
        .build(&mut memory, region)?;

    let fields = [
        EETypeField::Finalizer,
        EETypeField::OptionalFieldsPtr,
    ];
    for address in [object, finalizable] {
        let direct = TypeDescriptor::new(&memory, address)?;
        let cached = TypeDescriptor::new(&memory, address)?.with_offset_cache(&cache);
        for field in fields {
            let shape = direct.layout_shape()?;
            if shape.is_present(field) {
                assert_eq!(direct.field_offset(field)?, cached.field_offset(field)?);
            }
        }
    }
    assert!(!cache.is_empty());

    let finalizable = TypeDescriptor::new(&memory, finalizable)?.with_offset_cache(&cache);
    assert_eq!(finalizable.finalizer_code()?, 0x7_0000);
    assert!(finalizable.has_cctor()?);

    Ok(())
}

/// Optional field lookups through a descriptor and through the raw blob agree.
#[test]
fn test_optional_fields_blob() -> Result<()> {
    let (mut memory, region) = image(TargetLayout::native64())?;

    let descriptor = TypeDescriptorBuilder::new()
        .base_size(24)
        .optional_field(OptionalFieldTag::DispatchMap, 0x1234)
        .rare_flags(EETypeRareFlags::IS_ABSTRACT_CLASS)
        .build(&mut memory, region)?;
    let descriptor = TypeDescriptor::new(&memory, descriptor)?;

    assert!(descriptor.has_optional_fields());
    let blob = descriptor.optional_fields()?;
    assert!(blob.is_some());
    assert_eq!(
        get_inline_field(blob, OptionalFieldTag::DispatchMap, 0)?,
        0x1234
    );
    assert_eq!(
        descriptor.optional_field(OptionalFieldTag::DispatchMap, 0)?,
        0x1234
    );
    assert_eq!(
        descriptor.optional_field(OptionalFieldTag::ICastableIsInstSlot, 0xFFFF)?,
        0xFFFF
    );
    assert!(descriptor.is_abstract()?);

    // Without a blob every lookup yields its default.
    assert_eq!(
        get_inline_field(None, OptionalFieldTag::DispatchMap, 7)?,
        7
    );

    Ok(())
}
