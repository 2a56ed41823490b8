//! Type descriptors ("EETypes"): the binary format, a decoding view and a builder.
//!
//! A type descriptor is the runtime identity of a managed type. It is a packed record emitted by
//! the ahead-of-time compiler into an image, or synthesized by a type loader at run time, and is
//! consulted on every allocation, cast, box, unbox and exception dispatch.
//!
//! # Architecture
//!
//! ```text
//! +--------------------+  16 + P bytes
//! | fixed header       |
//! +--------------------+
//! | vtable slots       |  P x slots
//! +--------------------+
//! | variable tail      |  interface map, finalizer, optional fields, ... in a fixed order
//! +--------------------+
//! ```
//!
//! - [`flags`] - flag words, kinds, element types and optional-field tags
//! - [`optional`] - the optional-fields blob
//! - [`layout`] - tail field order and offset computation
//! - [`pointer`] - absolute, relative and indirection-cell pointer encodings
//! - [`TypeDescriptor`] - read-only view of one descriptor
//! - [`casting`] - class, interface and unbox type checks
//! - [`TypeDescriptorBuilder`] - writes descriptors into an [`crate::image::AddressSpace`]
//!
//! # Examples
//!
//! ```rust
//! use eeruntime::image::{AddressSpace, RegionKind, TargetLayout};
//! use eeruntime::runtime::eetype::{szarray_shape, TypeDescriptor, TypeDescriptorBuilder};
//!
//! let mut memory = AddressSpace::new(TargetLayout::native64());
//! let region = memory.map_region(0x40000, 0x1000, RegionKind::Image)?;
//! let object = TypeDescriptorBuilder::new().base_size(24).build(&mut memory, region)?;
//! let shape = szarray_shape(memory.layout());
//! let array = TypeDescriptorBuilder::new()
//!     .component_size(8)
//!     .parameterized(object, shape)
//!     .build(&mut memory, region)?;
//!
//! let array = TypeDescriptor::new(&memory, array)?;
//! assert!(array.is_sz_array());
//! assert_eq!(array.array_rank(), 1);
//! assert_eq!(array.related_parameter_type()?.address(), object);
//! # Ok::<(), eeruntime::Error>(())
//! ```

mod builder;
pub mod casting;
mod descriptor;
pub mod flags;
pub mod layout;
pub mod optional;
pub mod pointer;

pub use builder::{
    md_array_shape, size_of_descriptor, szarray_shape, DescriptorSizeRequest,
    TypeDescriptorBuilder,
};
pub use casting::{implements_interface, is_instance_of, is_instance_of_class, unbox_any_type_compare};
pub use descriptor::{DynamicModule, TypeDescriptor, NO_SLOT, STRING_COMPONENT_SIZE};
pub use flags::{
    shape, CorElementType, EETypeFlags, EETypeKind, EETypeRareFlags, GenericVariance,
    OptionalFieldTag,
};
pub use layout::{EETypeField, FieldOffsets, LayoutShape, OffsetCache};
pub use optional::{get_inline_field, OptionalFieldsBuilder};
pub use pointer::{
    resolve_indirection, tail_encoding, AbsolutePointers, RelatedTypeSlot, RelativePointers,
    ResolveTailPointer,
};
