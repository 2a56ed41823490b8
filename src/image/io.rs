//! Little-endian primitive reads and writes over byte buffers.
//!
//! Every multi-byte value in a runtime image (descriptor headers, raw clause-table fields,
//! pointer slots) is stored little-endian. The [`crate::image::io::NativeIO`] trait gives the
//! primitive integer types a uniform byte conversion so that the cursor in
//! [`crate::image::parser`] and the address space in [`crate::image::memory`] share one
//! bounds-checked implementation.
//!
//! # Key Components
//!
//! - [`crate::image::io::NativeIO`] - Byte conversion for `u8`..`u64` and `i8`..`i64`
//! - [`crate::image::io::read_le`] - Read a value from the start of a buffer
//! - [`crate::image::io::read_le_at`] - Read at an offset and advance it
//! - [`crate::image::io::write_le_at`] - Write at an offset and advance it
//!
//! # Examples
//!
//! ```rust,ignore
//! use eeruntime::image::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x0102u16)?;
//! write_le_at(&mut data, &mut offset, 0x0304_0506u32)?;
//!
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x0102);
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0x0304_0506);
//! # Ok::<(), eeruntime::Error>(())
//! ```

use crate::Result;

/// Trait for primitive types that can be stored in a runtime image.
///
/// Implemented for the fixed-width integers; the associated `Bytes` array is what actually
/// lands in memory.
pub trait NativeIO: Sized + Copy {
    /// The in-memory representation, e.g. `[u8; 4]` for `u32`
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode into little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_native_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl NativeIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_native_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
}

/// Reads a value of type `T` from the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: NativeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a value of type `T` at `offset` and advances `offset` past it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the read would cross the end of `data`.
pub fn read_le_at<T: NativeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes `value` at `offset` and advances `offset` past it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the write would cross the end of `data`.
pub fn write_le_at<T: NativeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let Some(end) = offset.checked_add(bytes.len()) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}
