//! Offset-addressed reader for native-format blobs.
//!
//! Unlike [`crate::image::NativeParser`], which owns a cursor, [`NativeReader`] takes an offset on
//! every call and returns the offset just past what it decoded. This matches how native-format
//! tables are navigated: by stored offsets, not by sequential scans.
//!
//! Strings are stored as a variable-length byte count followed by that many UTF-8 bytes.

use crate::{image::parser::NativeParser, Result};

/// Random-access reader over a native-format blob.
///
/// # Examples
///
/// ```rust
/// use eeruntime::image::{encode_unsigned, NativeReader};
///
/// let mut blob = Vec::new();
/// encode_unsigned(5, &mut blob);
/// blob.extend_from_slice(b"Int32");
///
/// let reader = NativeReader::new(&blob);
/// let (next, name) = reader.decode_string(0)?;
/// assert_eq!(name, "Int32");
/// assert_eq!(next, blob.len());
/// assert!(reader.string_equals(0, "Int32")?);
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Clone, Copy, Debug)]
pub struct NativeReader<'a> {
    data: &'a [u8],
}

impl<'a> NativeReader<'a> {
    /// Create a reader over `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        NativeReader { data }
    }

    /// Size of the blob in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Decode an unsigned integer at `offset`, returning `(next_offset, value)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoding is invalid or truncated.
    pub fn decode_unsigned(&self, offset: usize) -> Result<(usize, u32)> {
        let mut parser = NativeParser::new(self.data);
        parser.seek(offset)?;
        let value = parser.decode_unsigned()?;
        Ok((parser.pos(), value))
    }

    /// Validate the string at `offset` and return `(payload_start, payload_end)`.
    fn string_bounds(&self, offset: usize) -> Result<(usize, usize)> {
        let (start, num_bytes) = self.decode_unsigned(offset)?;
        let num_bytes = num_bytes as usize;

        let end = start
            .checked_add(num_bytes)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                malformed_error!(
                    "String of {} bytes at offset {} overruns a {} byte blob",
                    num_bytes,
                    offset,
                    self.data.len()
                )
            })?;
        Ok((start, end))
    }

    /// Decode the string at `offset`, returning `(next_offset, value)`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the string overruns the blob or is not UTF-8.
    pub fn decode_string(&self, offset: usize) -> Result<(usize, String)> {
        let (start, end) = self.string_bounds(offset)?;
        if start == end {
            return Ok((end, String::new()));
        }

        let value = std::str::from_utf8(&self.data[start..end])
            .map_err(|e| malformed_error!("Invalid UTF-8 string at offset {} - {}", offset, e))?;
        Ok((end, value.to_string()))
    }

    /// Decode the string at `offset`.
    ///
    /// # Errors
    ///
    /// Same as [`NativeReader::decode_string`].
    pub fn read_string(&self, offset: usize) -> Result<String> {
        self.decode_string(offset).map(|(_, value)| value)
    }

    /// Skip the string at `offset`, returning the offset past it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the string overruns the blob.
    pub fn skip_string(&self, offset: usize) -> Result<usize> {
        self.string_bounds(offset).map(|(_, end)| end)
    }

    /// Compare the string at `offset` with `value` without allocating for ASCII data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the string overruns the blob.
    pub fn string_equals(&self, offset: usize, value: &str) -> Result<bool> {
        let (start, end) = self.string_bounds(offset)?;
        let stored = &self.data[start..end];

        if stored.len() < value.len() {
            return Ok(false);
        }

        for (&byte, &expected) in stored.iter().zip(value.as_bytes()) {
            if byte > 0x7F {
                return Ok(self.read_string(offset)? == value);
            }
            if byte != expected {
                return Ok(false);
            }
        }

        Ok(stored.len() == value.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::encode_unsigned, Error};

    fn blob(strings: &[&str]) -> (Vec<u8>, Vec<usize>) {
        let mut data = Vec::new();
        let mut offsets = Vec::new();
        for s in strings {
            offsets.push(data.len());
            encode_unsigned(s.len() as u32, &mut data);
            data.extend_from_slice(s.as_bytes());
        }
        (data, offsets)
    }

    #[test]
    fn test_decode_sequence() {
        let (data, offsets) = blob(&["System", "", "Object"]);
        let reader = NativeReader::new(&data);

        let (next, first) = reader.decode_string(offsets[0]).unwrap();
        assert_eq!(first, "System");
        assert_eq!(next, offsets[1]);

        let (next, empty) = reader.decode_string(next).unwrap();
        assert!(empty.is_empty());
        assert_eq!(reader.skip_string(next).unwrap(), data.len());
    }

    #[test]
    fn test_string_equals() {
        let (data, offsets) = blob(&["Runtime", "Größe"]);
        let reader = NativeReader::new(&data);

        assert!(reader.string_equals(offsets[0], "Runtime").unwrap());
        assert!(!reader.string_equals(offsets[0], "Runtim").unwrap());
        assert!(!reader.string_equals(offsets[0], "RuntimeX").unwrap());
        assert!(!reader.string_equals(offsets[0], "runtime").unwrap());
        assert!(reader.string_equals(offsets[1], "Größe").unwrap());
        assert!(!reader.string_equals(offsets[1], "Grosse").unwrap());
    }

    #[test]
    fn test_overrun_is_bad_image() {
        let mut data = Vec::new();
        encode_unsigned(10, &mut data);
        data.extend_from_slice(b"short");
        let reader = NativeReader::new(&data);

        assert!(matches!(
            reader.decode_string(0),
            Err(Error::Malformed { .. })
        ));
        assert!(reader.skip_string(0).is_err());
        assert!(reader.string_equals(0, "short").is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [0x04, 0xFF, 0xFE];
        let reader = NativeReader::new(&data);
        assert!(matches!(
            reader.decode_string(0),
            Err(Error::Malformed { .. })
        ));
    }
}
