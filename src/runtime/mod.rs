//! The runtime core: type descriptors, exception dispatch and the helpers compiled code calls.
//!
//! # Architecture
//!
//! - [`eetype`] - Type descriptors, their optional fields and casting
//! - [`exceptions`] - Clause tables and the two-pass dispatcher
//! - [`exports`] - Allocation, boxing and type-check helpers over a [`exports::ManagedHeap`]
//! - [`classlib`] - Class library exceptions raised by the helpers
//! - [`threadid`] - Compact managed thread ids
//! - [`object`] - References to managed objects
//!
//! The heap, the platform unwinder, the funclet calling convention and the class library are
//! collaborators reached through traits; this module holds no process state apart from the
//! thread id dispenser.

pub mod classlib;
pub mod eetype;
pub mod exceptions;
pub mod exports;
pub mod object;
pub mod threadid;

pub use classlib::{Classlib, ExceptionId};
pub use object::ObjectRef;
