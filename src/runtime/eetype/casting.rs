//! Type checks built on descriptor equivalence.
//!
//! These are the checks the exception dispatcher and the unbox helpers need: class ancestry,
//! interface implementation and the relaxed comparison used when unboxing enums and primitives.
//! Generic variance and ICastable are not consulted.

use crate::{runtime::eetype::TypeDescriptor, Result};

/// Upper bound on base-type and interface hops before a chain is treated as cyclic.
const MAX_HIERARCHY_DEPTH: usize = 1024;

/// Returns `true` if `object_type` is `class` or derives from it.
///
/// The base chain of `object_type` is walked outward and every step is compared with
/// [`TypeDescriptor::is_equivalent_to`], so clones on either side match their canonical type and
/// arrays match structurally.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the base chain does not terminate, and an error if a
/// descriptor on it is not mapped.
pub fn is_instance_of_class<'m>(
    object_type: &TypeDescriptor<'m>,
    class: &TypeDescriptor<'m>,
) -> Result<bool> {
    let mut current = Some(*object_type);
    for _ in 0..MAX_HIERARCHY_DEPTH {
        let Some(candidate) = current else {
            return Ok(false);
        };
        if candidate.is_equivalent_to(class)? {
            return Ok(true);
        }
        current = candidate.base_type()?;
    }

    Err(malformed_error!(
        "Base type chain of 0x{:X} does not terminate",
        object_type.address()
    ))
}

/// Returns `true` if `object_type` or one of its base types lists `interface` in its interface
/// map.
///
/// # Errors
///
/// Returns an error if a descriptor on the chain or an interface map entry is not mapped.
pub fn implements_interface<'m>(
    object_type: &TypeDescriptor<'m>,
    interface: &TypeDescriptor<'m>,
) -> Result<bool> {
    debug_assert!(interface.is_interface());

    let mut current = Some(*object_type);
    for _ in 0..MAX_HIERARCHY_DEPTH {
        let Some(candidate) = current else {
            return Ok(false);
        };
        if candidate.is_equivalent_to(interface)? {
            return Ok(true);
        }
        for index in 0..candidate.num_interfaces() {
            if candidate.interface(index)?.is_equivalent_to(interface)? {
                return Ok(true);
            }
        }
        current = candidate.base_type()?;
    }

    Err(malformed_error!(
        "Base type chain of 0x{:X} does not terminate",
        object_type.address()
    ))
}

/// Whether an object of type `object_type` may be viewed as `target`.
///
/// Interfaces are checked against the interface maps, everything else against the base chain.
///
/// # Errors
///
/// Same as [`is_instance_of_class`] and [`implements_interface`].
pub fn is_instance_of<'m>(
    object_type: &TypeDescriptor<'m>,
    target: &TypeDescriptor<'m>,
) -> Result<bool> {
    if target.is_interface() {
        implements_interface(object_type, target)
    } else {
        is_instance_of_class(object_type, target)
    }
}

/// The type check of the unbox helpers.
///
/// Equivalent types pass. So do two types with the same integral [`crate::runtime::eetype::CorElementType`],
/// which lets an enum unbox to its underlying primitive and back.
///
/// # Errors
///
/// Returns an error if a descriptor the comparison needs is not mapped.
pub fn unbox_any_type_compare<'m>(
    boxed_type: &TypeDescriptor<'m>,
    unbox_to: &TypeDescriptor<'m>,
) -> Result<bool> {
    if boxed_type.is_equivalent_to(unbox_to)? {
        return Ok(true);
    }

    Ok(match (boxed_type.cor_element_type(), unbox_to.cor_element_type()) {
        (Some(from), Some(to)) => from == to && to.is_integral(),
        _ => false,
    })
}
