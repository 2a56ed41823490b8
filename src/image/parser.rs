//! Cursor-based decoder for the runtime's native binary encodings.
//!
//! This module provides [`crate::image::parser::NativeParser`], a bounds-checked cursor over a
//! byte slice, together with the prefix-bit variable-length unsigned integer codec shared by the
//! optional-fields blob of a type descriptor and by per-method exception clause tables.
//!
//! # Variable-length unsigned integers
//!
//! The number of consecutive set bits at the bottom of the first byte selects the encoded length;
//! the value bits follow the terminating zero bit:
//!
//! | first byte  | length | value bits |
//! |-------------|--------|------------|
//! | `xxxxxxx0`  | 1      | 7          |
//! | `xxxxxx01`  | 2      | 14         |
//! | `xxxxx011`  | 3      | 21         |
//! | `xxxx0111`  | 4      | 28         |
//! | `xxx01111`  | 5      | raw `u32` in the following 4 bytes |
//!
//! A first byte with the low five bits set is malformed.
//!
//! # Examples
//!
//! ```rust
//! use eeruntime::image::{encode_unsigned, NativeParser};
//!
//! let mut stream = Vec::new();
//! encode_unsigned(300, &mut stream);
//! encode_unsigned(5, &mut stream);
//!
//! let mut parser = NativeParser::new(&stream);
//! assert_eq!(parser.decode_unsigned()?, 300);
//! assert_eq!(parser.decode_unsigned()?, 5);
//! assert!(!parser.has_more_data());
//! # Ok::<(), eeruntime::Error>(())
//! ```

use crate::{
    image::io::{read_le_at, NativeIO},
    Result,
};

/// Largest value that fits the 1-byte form.
const ONE_BYTE_LIMIT: u32 = 1 << 7;
/// Largest value that fits the 2-byte form.
const TWO_BYTE_LIMIT: u32 = 1 << 14;
/// Largest value that fits the 3-byte form.
const THREE_BYTE_LIMIT: u32 = 1 << 21;
/// Largest value that fits the 4-byte form.
const FOUR_BYTE_LIMIT: u32 = 1 << 28;

/// A cursor over a byte slice that decodes native runtime encodings.
///
/// All operations are bounds-checked; a failed read leaves the cursor where it was only for the
/// primitive reads, multi-step decodes may have consumed a prefix.
///
/// # Examples
///
/// ```rust
/// use eeruntime::image::NativeParser;
///
/// let data = [0x04, 0x2A, 0x00, 0x00, 0x00];
/// let mut parser = NativeParser::new(&data);
/// assert_eq!(parser.decode_unsigned()?, 2);
/// assert_eq!(parser.read_le::<u32>()?, 42);
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct NativeParser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> NativeParser<'a> {
    /// Create a new parser positioned at the start of `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        NativeParser { data, position: 0 }
    }

    /// Total length of the underlying slice
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the underlying slice is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true while the cursor has not reached the end of the slice
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Number of bytes left after the cursor
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the cursor to an absolute position.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `pos` lies past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Move the cursor forward by `step` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if that would move past the end of the data.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let Some(target) = self.position.checked_add(step) else {
            return Err(out_of_bounds_error!());
        };
        self.seek(target)
    }

    /// Current position of the cursor
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// The complete underlying slice
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Look at the byte under the cursor without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data
            .get(self.position)
            .copied()
            .ok_or_else(|| out_of_bounds_error!())
    }

    /// Read a little-endian primitive and advance past it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if not enough data is left.
    pub fn read_le<T: NativeIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Borrow the next `length` bytes and advance past them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if not enough data is left.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let Some(end) = self.position.checked_add(length) else {
            return Err(out_of_bounds_error!());
        };
        let Some(bytes) = self.data.get(self.position..end) else {
            return Err(out_of_bounds_error!());
        };

        self.position = end;
        Ok(bytes)
    }

    /// Decode one prefix-bit variable-length unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for a first byte with the low five bits set, and
    /// [`crate::Error::OutOfBounds`] if the encoding is truncated.
    pub fn decode_unsigned(&mut self) -> Result<u32> {
        let first = u32::from(self.read_le::<u8>()?);

        if first & 0x01 == 0 {
            return Ok(first >> 1);
        }

        if first & 0x02 == 0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            return Ok((first >> 2) | (b1 << 6));
        }

        if first & 0x04 == 0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            return Ok((first >> 3) | (b1 << 5) | (b2 << 13));
        }

        if first & 0x08 == 0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            return Ok((first >> 4) | (b1 << 4) | (b2 << 12) | (b3 << 20));
        }

        if first & 0x10 == 0 {
            return self.read_le::<u32>();
        }

        Err(malformed_error!(
            "Invalid variable-length integer prefix - 0x{:02X} at {}",
            first,
            self.position - 1
        ))
    }
}

/// Number of bytes [`encode_unsigned`] produces for `value`.
#[must_use]
pub fn encoded_unsigned_len(value: u32) -> usize {
    if value < ONE_BYTE_LIMIT {
        1
    } else if value < TWO_BYTE_LIMIT {
        2
    } else if value < THREE_BYTE_LIMIT {
        3
    } else if value < FOUR_BYTE_LIMIT {
        4
    } else {
        5
    }
}

/// Append the prefix-bit encoding of `value` to `out`.
///
/// This is the exact inverse of [`NativeParser::decode_unsigned`] and always picks the shortest
/// form.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_unsigned(value: u32, out: &mut Vec<u8>) {
    match encoded_unsigned_len(value) {
        1 => out.push((value << 1) as u8),
        2 => {
            out.push(((value << 2) | 0x01) as u8);
            out.push((value >> 6) as u8);
        }
        3 => {
            out.push(((value << 3) | 0x03) as u8);
            out.push((value >> 5) as u8);
            out.push((value >> 13) as u8);
        }
        4 => {
            out.push(((value << 4) | 0x07) as u8);
            out.push((value >> 4) as u8);
            out.push((value >> 12) as u8);
            out.push((value >> 20) as u8);
        }
        _ => {
            out.push(0x0F);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}
