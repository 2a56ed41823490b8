//! Target-dependent layout facts shared by every binary structure in an image.

use strum::{Display, EnumIter};

/// Width of a pointer in the target image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PointerSize {
    /// 32-bit targets (wasm32, x86, arm)
    #[strum(serialize = "32-bit")]
    Four,
    /// 64-bit targets
    #[strum(serialize = "64-bit")]
    Eight,
}

impl PointerSize {
    /// Size of a pointer in bytes
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            PointerSize::Four => 4,
            PointerSize::Eight => 8,
        }
    }

    /// Extra `u32` of padding that keeps array elements pointer-aligned after the length field
    #[must_use]
    pub const fn array_length_padding(self) -> u32 {
        match self {
            PointerSize::Four => 0,
            PointerSize::Eight => 1,
        }
    }
}

/// Layout switches a consumer binary was compiled with.
///
/// `relative_pointers` selects the self-relative encoding for pointer-typed tail fields of
/// descriptors baked into the image. Dynamically created descriptors ignore it and always use
/// absolute pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TargetLayout {
    /// Pointer width of the target
    pub pointer_size: PointerSize,
    /// Whether image descriptors use 32-bit self-relative pointers
    pub relative_pointers: bool,
}

impl TargetLayout {
    /// 64-bit target with absolute pointers
    #[must_use]
    pub const fn native64() -> Self {
        TargetLayout {
            pointer_size: PointerSize::Eight,
            relative_pointers: false,
        }
    }

    /// 64-bit position-independent target with relative pointers
    #[must_use]
    pub const fn portable64() -> Self {
        TargetLayout {
            pointer_size: PointerSize::Eight,
            relative_pointers: true,
        }
    }

    /// 32-bit WebAssembly target
    #[must_use]
    pub const fn wasm32() -> Self {
        TargetLayout {
            pointer_size: PointerSize::Four,
            relative_pointers: false,
        }
    }

    /// Pointer size in bytes
    #[must_use]
    pub const fn pointer_bytes(&self) -> u32 {
        self.pointer_size.bytes()
    }

    /// Size of the fixed descriptor header: four 16/32-bit fields plus the related-type pointer
    #[must_use]
    pub const fn descriptor_header_size(&self) -> u32 {
        16 + self.pointer_bytes()
    }

    /// Base size of a single-dimensional zero-based array: object header, type pointer and
    /// the (padded) length field
    #[must_use]
    pub const fn szarray_base_size(&self) -> u32 {
        self.pointer_bytes()
            + self.pointer_bytes()
            + (1 + self.pointer_size.array_length_padding()) * 4
    }
}

impl Default for TargetLayout {
    fn default() -> Self {
        TargetLayout::native64()
    }
}
