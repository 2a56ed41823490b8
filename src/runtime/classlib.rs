//! The class library as seen from the runtime core.
//!
//! Exceptions raised by runtime helpers (a failed unbox, an array store of the wrong type) are
//! objects of the class library that owns the type involved. The runtime only knows the kind of
//! failure, an [`ExceptionId`], and asks the [`Classlib`] for the matching object.

use strum::{Display, EnumIter, FromRepr};

use crate::{runtime::object::ObjectRef, Result};

/// Exception kinds a runtime helper can ask the class library for.
///
/// The discriminants are the values passed across the runtime/classlib boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u32)]
pub enum ExceptionId {
    /// `System.OutOfMemoryException`
    OutOfMemory = 1,
    /// `System.NullReferenceException`
    NullReference = 2,
    /// `System.DivideByZeroException`
    DivideByZero = 3,
    /// `System.InvalidCastException`
    InvalidCast = 4,
    /// `System.IndexOutOfRangeException`
    IndexOutOfRange = 5,
    /// `System.ArrayTypeMismatchException`
    ArrayTypeMismatch = 6,
    /// `System.OverflowException`
    Overflow = 7,
    /// `System.ArithmeticException`
    Arithmetic = 8,
    /// `System.DataMisalignedException`
    DataMisaligned = 9,
}

/// Resolves class library exception objects.
///
/// A process can host several class libraries; the runtime picks one through the module that
/// owns a type, or through the exception factory a type loader registered for a dynamic type.
pub trait Classlib: Send + Sync {
    /// Exception object for `id` from the class library that owns the module at
    /// `module_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if no class library owns the module.
    fn exception_from_module(&self, module_address: u64, id: ExceptionId) -> Result<ObjectRef>;

    /// Exception object for `id` produced by the exception factory at `function`.
    ///
    /// # Errors
    ///
    /// Returns an error if `function` is not a known factory.
    fn exception_from_function(&self, function: u64, id: ExceptionId) -> Result<ObjectRef>;
}
