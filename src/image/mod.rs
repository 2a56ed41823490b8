//! Binary image access: memory model, primitive I/O and the native encodings.
//!
//! Everything the runtime core reads (type descriptors, optional-field blobs, clause tables,
//! indirection cells) lives in an [`AddressSpace`]. The decoders in this module are the only code
//! that touches raw bytes; higher layers work in terms of addresses and decoded values.
//!
//! # Key Components
//!
//! - [`AddressSpace`] - Bounds-checked regions of image and dynamic memory
//! - [`TargetLayout`] - Pointer width and pointer-encoding mode of the target
//! - [`NativeParser`] - Cursor with the prefix-bit variable-length integer codec
//! - [`NativeReader`] - Offset-addressed reads, including length-prefixed strings
//! - [`encode_unsigned`] - Producer side of the integer codec

pub mod io;
mod memory;
mod parser;
mod reader;
mod target;

pub use memory::{AddressSpace, RegionId, RegionKind};
pub use parser::{encode_unsigned, encoded_unsigned_len, NativeParser};
pub use reader::NativeReader;
pub use target::{PointerSize, TargetLayout};
