//! Flag words, kinds and tags of the type descriptor binary format.
//!
//! Every bit assignment here is part of the contract with the ahead-of-time compiler. Changing
//! one breaks every image compiled against the old layout.

use bitflags::bitflags;
use strum::{Display, EnumIter, FromRepr};

bitflags! {
    /// Top-level descriptor flags stored in the fixed header.
    ///
    /// These are the cheap flags consulted on hot allocation and cast paths. The five high bits
    /// hold the [`CorElementType`] of primitive-like types and are not individual flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EETypeFlags: u16 {
        /// Two-bit [`EETypeKind`] field
        const KIND_MASK = 0x0003;
        /// The related-type slot holds the address of an indirection cell
        const RELATED_TYPE_VIA_IAT = 0x0004;
        /// The type implements ICastable
        const ICASTABLE = 0x0008;
        /// A finalizer pointer is present in the tail
        const HAS_FINALIZER = 0x0010;
        /// Instances contain GC references
        const HAS_POINTERS = 0x0020;
        /// The type is a value type
        const VALUE_TYPE = 0x0040;
        /// The generic composition carries variance information
        const GENERIC_VARIANCE = 0x0080;
        /// An optional-fields blob pointer is present in the tail
        const OPTIONAL_FIELDS = 0x0100;
        /// The type is an interface
        const IS_INTERFACE = 0x0200;
        /// The type is a generic instantiation
        const IS_GENERIC = 0x0400;
        /// Five-bit [`CorElementType`] field
        const COR_ELEMENT_TYPE_MASK = 0xF800;

        /// Everything that forces the slow cast path
        const COMPLEX_CASTING_MASK = Self::KIND_MASK.bits()
            | Self::RELATED_TYPE_VIA_IAT.bits()
            | Self::GENERIC_VARIANCE.bits();
    }
}

/// Shift of the [`CorElementType`] field inside [`EETypeFlags`].
pub const COR_ELEMENT_TYPE_SHIFT: u16 = 11;

bitflags! {
    /// Infrequently used flags stored in the optional-fields blob.
    ///
    /// Reading them costs an optional-field scan, so they are reserved for cold paths.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EETypeRareFlags: u32 {
        /// Instances must be 8-byte aligned on 32-bit targets
        const REQUIRES_ALIGN8 = 0x0000_0001;
        /// A sealed virtual slot table is present in the tail
        const HAS_SEALED_VTABLE_ENTRIES = 0x0000_0004;
        /// The type is `Nullable<T>`
        const IS_NULLABLE = 0x0000_0010;
        /// The nullable target slot holds the address of an indirection cell
        const NULLABLE_TYPE_VIA_IAT = 0x0000_0020;
        /// Synthesized at run time by a type loader
        const IS_DYNAMIC_TYPE = 0x0000_0040;
        /// The type has a class constructor
        const HAS_CCTOR = 0x0000_0080;
        /// A dynamically allocated dispatch map pointer is present in the tail
        const HAS_DYNAMICALLY_ALLOCATED_DISPATCH_MAP = 0x0000_0100;
        /// A dynamic GC statics pointer is present in the tail
        const IS_DYNAMIC_TYPE_WITH_GC_STATICS = 0x0000_0200;
        /// A dynamic non-GC statics pointer is present in the tail
        const IS_DYNAMIC_TYPE_WITH_NON_GC_STATICS = 0x0000_0400;
        /// A dynamic thread static offset is present in the tail
        const IS_DYNAMIC_TYPE_WITH_THREAD_STATICS = 0x0000_0800;
        /// A dynamic module pointer is present in the tail
        const HAS_DYNAMIC_MODULE = 0x0000_1000;
        /// The type is an abstract class
        const IS_ABSTRACT_CLASS = 0x0000_2000;
        /// The type is a homogeneous floating-point aggregate
        const IS_HFA = 0x0000_4000;
        /// The type is a byref-like value type
        const IS_BYREF_LIKE = 0x0000_8000;
    }
}

/// What the related-type slot of a descriptor refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u16)]
pub enum EETypeKind {
    /// A regular type; the related type is the base type
    Canonical = 0,
    /// A copy of a type from another module; the related type is the canonical descriptor
    Cloned = 1,
    /// Pointer, byref or array; the related type is the element type
    Parameterized = 2,
    /// An open generic definition; component size holds the arity
    GenericTypeDefinition = 3,
}

impl EETypeKind {
    /// Extract the kind from a flag word
    #[must_use]
    pub fn from_flags(flags: EETypeFlags) -> Self {
        match flags.bits() & EETypeFlags::KIND_MASK.bits() {
            0 => EETypeKind::Canonical,
            1 => EETypeKind::Cloned,
            2 => EETypeKind::Parameterized,
            _ => EETypeKind::GenericTypeDefinition,
        }
    }

    /// Flag bits encoding this kind
    #[must_use]
    pub fn to_flags(self) -> EETypeFlags {
        EETypeFlags::from_bits_retain(self as u16)
    }
}

/// Tags of the entries in an optional-fields blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum OptionalFieldTag {
    /// [`EETypeRareFlags`]
    RareFlags = 0,
    /// Index of the dispatch map
    DispatchMap = 1,
    /// Value type padding and alignment
    ValueTypeFieldPadding = 2,
    /// Offset of the value inside `Nullable<T>`, minus one
    NullableValueOffset = 3,
    /// Slot of ICastable.IsInstanceOfInterface
    ICastableIsInstSlot = 4,
    /// Slot of ICastable.GetImplType
    ICastableGetImplTypeSlot = 5,
}

/// Marks the last entry of an optional-fields blob.
pub const OPTIONAL_FIELD_LAST_FLAG: u8 = 0x80;
/// Extracts the [`OptionalFieldTag`] from an entry header.
pub const OPTIONAL_FIELD_TAG_MASK: u8 = 0x7F;

/// Low bit of a pointer that marks it as the address of an indirection cell.
pub const INDIRECTION_CELL_POINTER: u64 = 0x1;

/// Shape values stored in the base-size slot of parameterized descriptors.
pub mod shape {
    /// `T*`
    pub const POINTER: u32 = 0;
    /// `ref T`
    pub const BY_REF: u32 = 1;
    /// Bytes of bounds data per extra array dimension (a lower bound and a length)
    pub const BOUNDS_PAIR_SIZE: u32 = 2 * 4;
}

/// Element type codes as defined by ECMA-335, stored in the high bits of [`EETypeFlags`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CorElementType {
    End = 0x00,
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0A,
    U8 = 0x0B,
    R4 = 0x0C,
    R8 = 0x0D,
    String = 0x0E,
    Ptr = 0x0F,
    ByRef = 0x10,
    ValueType = 0x11,
    Class = 0x12,
    Var = 0x13,
    Array = 0x14,
    GenericInst = 0x15,
    TypedByRef = 0x16,
    I = 0x18,
    U = 0x19,
    FnPtr = 0x1B,
    Object = 0x1C,
    SzArray = 0x1D,
    MVar = 0x1E,
}

impl CorElementType {
    /// Returns true for the integer kinds that unbox interchangeably with enums of the same size
    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            CorElementType::I1
                | CorElementType::U1
                | CorElementType::I2
                | CorElementType::U2
                | CorElementType::I4
                | CorElementType::U4
                | CorElementType::I8
                | CorElementType::U8
                | CorElementType::I
                | CorElementType::U
        )
    }

    /// Flag bits encoding this element type
    #[must_use]
    pub fn to_flags(self) -> EETypeFlags {
        EETypeFlags::from_bits_retain(u16::from(self as u8) << COR_ELEMENT_TYPE_SHIFT)
    }
}

/// Variance of one generic parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum GenericVariance {
    /// Invariant parameter
    NonVariant = 0,
    /// `out T`
    Covariant = 1,
    /// `in T`
    Contravariant = 2,
    /// Array-style covariance used by the runtime for `T[]` interfaces
    ArrayCovariant = 0x20,
}
