//! Optional-fields blob: a self-terminating stream of tagged values.
//!
//! Each entry is one header byte (low seven bits: [`OptionalFieldTag`], high bit: last entry)
//! followed by a variable-length unsigned value. Lookups are a linear scan; blobs hold a handful
//! of entries at most.

use crate::{
    image::{encode_unsigned, NativeParser},
    runtime::eetype::flags::{OptionalFieldTag, OPTIONAL_FIELD_LAST_FLAG, OPTIONAL_FIELD_TAG_MASK},
    Result,
};

/// Tag of the lone terminator entry of an empty blob; no [`OptionalFieldTag`] uses it.
const EMPTY_BLOB_TAG: u8 = OPTIONAL_FIELD_TAG_MASK;

/// Look up `tag` in an optional-fields blob.
///
/// `blob` is `None` when the descriptor has no optional fields, which yields `default` without
/// scanning. Otherwise the stream is scanned up to the first entry carrying `tag`, or up to the
/// entry marked last.
///
/// # Errors
///
/// Returns an error if an entry value is malformed or the stream runs past the mapped data
/// before its last-marked entry.
///
/// # Examples
///
/// ```rust
/// use eeruntime::runtime::eetype::{get_inline_field, OptionalFieldTag, OptionalFieldsBuilder};
///
/// let blob = OptionalFieldsBuilder::new()
///     .field(OptionalFieldTag::NullableValueOffset, 7)
///     .encode();
///
/// assert_eq!(get_inline_field(Some(&blob), OptionalFieldTag::NullableValueOffset, 0)?, 7);
/// assert_eq!(get_inline_field(Some(&blob), OptionalFieldTag::RareFlags, 0)?, 0);
/// assert_eq!(get_inline_field(None, OptionalFieldTag::RareFlags, 9)?, 9);
/// # Ok::<(), eeruntime::Error>(())
/// ```
pub fn get_inline_field(blob: Option<&[u8]>, tag: OptionalFieldTag, default: u32) -> Result<u32> {
    let Some(blob) = blob else {
        return Ok(default);
    };

    let mut parser = NativeParser::new(blob);
    loop {
        let header = parser.read_le::<u8>()?;
        let value = parser.decode_unsigned()?;

        if header & OPTIONAL_FIELD_TAG_MASK == tag as u8 {
            return Ok(value);
        }
        if header & OPTIONAL_FIELD_LAST_FLAG != 0 {
            return Ok(default);
        }
    }
}

/// Producer side of the optional-fields blob.
///
/// Entries are written in insertion order; the last one gets the terminator bit.
#[derive(Clone, Debug, Default)]
pub struct OptionalFieldsBuilder {
    entries: Vec<(OptionalFieldTag, u32)>,
}

impl OptionalFieldsBuilder {
    /// Start an empty blob
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, replacing an earlier one with the same tag
    #[must_use]
    pub fn field(mut self, tag: OptionalFieldTag, value: u32) -> Self {
        self.set(tag, value);
        self
    }

    /// Append an entry in place, replacing an earlier one with the same tag
    pub fn set(&mut self, tag: OptionalFieldTag, value: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = value;
        } else {
            self.entries.push((tag, value));
        }
    }

    /// Returns true when no entry has been added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value recorded for `tag`, if any
    #[must_use]
    pub fn get(&self, tag: OptionalFieldTag) -> Option<u32> {
        self.entries
            .iter()
            .find_map(|(t, value)| (*t == tag).then_some(*value))
    }

    /// Encode the blob.
    ///
    /// An empty builder encodes a single terminator entry, which every lookup answers with its
    /// default.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.entries.is_empty() {
            out.push(OPTIONAL_FIELD_LAST_FLAG | EMPTY_BLOB_TAG);
            encode_unsigned(0, &mut out);
            return out;
        }

        let last = self.entries.len() - 1;
        for (index, (tag, value)) in self.entries.iter().enumerate() {
            let mut header = *tag as u8;
            if index == last {
                header |= OPTIONAL_FIELD_LAST_FLAG;
            }
            out.push(header);
            encode_unsigned(*value, &mut out);
        }
        out
    }
}
