//! References to managed objects.

use std::fmt;

/// Address of a managed object on the GC heap, or null.
///
/// The runtime core never looks inside objects; it only passes references between the heap,
/// the class library and the exception dispatcher.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectRef(u64);

impl ObjectRef {
    /// The null reference
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Reference to the object at `address`
    #[must_use]
    pub const fn new(address: u64) -> Self {
        ObjectRef(address)
    }

    /// The null reference
    #[must_use]
    pub const fn null() -> Self {
        Self::NULL
    }

    /// Returns true for the null reference
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Object address, 0 for null
    #[must_use]
    pub const fn address(self) -> u64 {
        self.0
    }

    /// `None` for the null reference
    #[must_use]
    pub fn non_null(self) -> Option<ObjectRef> {
        (!self.is_null()).then_some(self)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjectRef(null)")
        } else {
            write!(f, "ObjectRef(0x{:X})", self.0)
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reference() {
        assert!(ObjectRef::null().is_null());
        assert_eq!(ObjectRef::default(), ObjectRef::NULL);
        assert_eq!(ObjectRef::NULL.non_null(), None);
        assert_eq!(format!("{:?}", ObjectRef::NULL), "ObjectRef(null)");
    }

    #[test]
    fn test_object_reference() {
        let object = ObjectRef::new(0x7F00_1000);
        assert!(!object.is_null());
        assert_eq!(object.address(), 0x7F00_1000);
        assert_eq!(object.non_null(), Some(object));
        assert_eq!(object.to_string(), "0x7F001000");
    }
}
