// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # eeruntime
//!
//! The object model and exception dispatch core of an ahead-of-time compiled managed runtime.
//! Compiled code describes every type with a binary type descriptor (an `EEType`) and every
//! method's try regions with a compact clause table; this crate reads both, answers type
//! questions about objects, and unwinds the stack when an exception is thrown.
//!
//! ## Features
//!
//! - **Bit-exact descriptor decoding** - Header, vtable, interface map and the variable tail of
//!   optional pointers, in absolute, relative and indirection-cell encodings
//! - **Optional fields** - The tagged, variable-length side table of rarely used values
//! - **Two-pass exception dispatch** - Handler search with typed and filtered catches, then
//!   unwinding through finally and fault funclets
//! - **Runtime helpers** - Allocation routing, boxing, unboxing and array store checks
//! - **Lock-free thread ids** - Compact managed thread ids recycled on thread exit
//! - **Producers** - Descriptor and clause table builders for loaders, tests and fuzzers
//!
//! ## Quick Start
//!
//! ```rust
//! use eeruntime::prelude::*;
//!
//! let mut memory = AddressSpace::new(TargetLayout::native64());
//! let image = memory.map_region(0x10_0000, 0x1000, RegionKind::Image)?;
//!
//! let object = TypeDescriptorBuilder::new().base_size(24).build(&mut memory, image)?;
//! let exception = TypeDescriptorBuilder::new()
//!     .base_size(128)
//!     .base_type(object)
//!     .build(&mut memory, image)?;
//!
//! let exception = TypeDescriptor::new(&memory, exception)?;
//! let object = TypeDescriptor::new(&memory, object)?;
//! assert!(is_instance_of_class(&exception, &object)?);
//! # Ok::<(), eeruntime::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`image`] - The address space descriptors live in, and the native-format readers
//! - [`runtime`] - Type descriptors, exception dispatch, runtime helpers and thread ids
//! - [`config`] - Runtime and tracing configuration
//! - [`utils`] - Structured tracing
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Malformed images, unhandled exceptions
//! and fail-fast conditions are fatal; only [`Error::Thrown`], a class library exception raised
//! by a runtime helper, is meant to be caught. See [`Error::is_fatal`].

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub mod config;
pub mod image;
pub mod prelude;
pub mod runtime;
pub mod utils;

#[cfg(test)]
mod test;

/// `eeruntime` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `eeruntime` Error type
///
/// The main error type for all operations in this crate.
pub use error::{Error, FailFastReason, ThrownException};
