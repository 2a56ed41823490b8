//! Runtime helpers called by compiled code: allocation, boxing, unboxing and friends.
//!
//! [`RuntimeExports`] routes each request through the type descriptor of the object involved.
//! It picks the allocator entry point, unwraps nullables and performs the type checks. The
//! heap itself is a collaborator behind [`ManagedHeap`]. Type mismatches are raised as
//! [`crate::Error::Thrown`] carrying the class library exception that owns the target type.
//!
//! Value data crosses this interface as byte slices laid out like the managed value: a
//! nullable starts with its `has_value` byte, and a reference slot is a little-endian pointer of
//! the target width.

use bitflags::bitflags;

use crate::{
    error::ThrownException,
    image::{AddressSpace, PointerSize},
    runtime::{
        classlib::{Classlib, ExceptionId},
        eetype::{is_instance_of, unbox_any_type_compare, TypeDescriptor},
        exceptions::{StackFrameIterator, StackWalker},
        object::ObjectRef,
    },
    Error, Result,
};

#[cfg(feature = "trace")]
use crate::utils::trace::TraceEvent;

bitflags! {
    /// Allocator entry point chosen for an object.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u8 {
        /// Registered for finalization
        const FINALIZABLE = 0x01;
        /// Object header 8-byte aligned
        const ALIGN8 = 0x02;
        /// Object header offset so the payload after it is 8-byte aligned
        const MISALIGN = 0x04;
    }
}

/// The garbage collected heap as seen by the runtime helpers.
///
/// Allocation entry points mirror the allocator fast paths; which one is used is decided by
/// [`RuntimeExports`] from the descriptor.
pub trait ManagedHeap {
    /// Allocate an object of the descriptor at `descriptor` through the entry point `flags` names.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails.
    fn allocate(&mut self, descriptor: u64, flags: AllocFlags) -> Result<ObjectRef>;

    /// Allocate an array or string with `length` elements.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails.
    fn allocate_array(&mut self, descriptor: u64, length: u32, flags: AllocFlags)
        -> Result<ObjectRef>;

    /// Descriptor address of `object`.
    ///
    /// # Errors
    ///
    /// Returns an error if `object` is not a live object.
    fn object_type(&self, object: ObjectRef) -> Result<u64>;

    /// Element count of an array or string.
    ///
    /// # Errors
    ///
    /// Returns an error if `array` is not a live array.
    fn array_length(&self, array: ObjectRef) -> Result<u32>;

    /// Copy `data` into the payload of `object`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is smaller than `data`.
    fn write_payload(&mut self, object: ObjectRef, data: &[u8]) -> Result<()>;

    /// Fill `out` from the payload of `object`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is smaller than `out`.
    fn read_payload(&self, object: ObjectRef, out: &mut [u8]) -> Result<()>;

    /// Copy every field of `source` into `destination`, which has the same type.
    ///
    /// # Errors
    ///
    /// Returns an error if either object is not live.
    fn copy_object_contents(&mut self, destination: ObjectRef, source: ObjectRef) -> Result<()>;
}

const CONSERVATIVE_REGION_MAGIC_64: u64 = 0x87DF_7A10_4F09_E0A9;
const CONSERVATIVE_REGION_MAGIC_32: u32 = 0x4F09_E0A9;
const CONSERVATIVE_REGION_HASH_SHIFT: u32 = 13;

/// A stack buffer the GC must scan conservatively.
///
/// The GC only honours a region whose magic is set and whose hash matches its bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConservativeRegion {
    /// Activation marker, 0 when disabled
    pub magic: u64,
    /// First byte of the region
    pub region_pointer_low: u64,
    /// First byte past the region
    pub region_pointer_high: u64,
    /// Hash of the bounds
    pub hash: u64,
}

impl ConservativeRegion {
    /// Describe and activate the `size` bytes at `begin`.
    #[must_use]
    pub fn new(pointer_size: PointerSize, begin: u64, size: u32) -> Self {
        let mut region = ConservativeRegion::default();
        region.initialize(pointer_size, begin, size);
        region
    }

    /// Describe and activate the `size` bytes at `begin`.
    ///
    /// Both must be pointer aligned.
    pub fn initialize(&mut self, pointer_size: PointerSize, begin: u64, size: u32) {
        let align = u64::from(pointer_size.bytes()) - 1;
        debug_assert!(begin & align == 0, "buffer not pointer aligned");
        debug_assert!(u64::from(size) & align == 0, "buffer size not pointer aligned");

        self.region_pointer_low = begin;
        self.region_pointer_high = begin + u64::from(size);
        self.hash = Self::bounds_hash(pointer_size, self.region_pointer_low, self.region_pointer_high);
        self.magic = Self::magic_for(pointer_size);
    }

    /// Deactivate the region
    pub fn disable(&mut self) {
        self.magic = 0;
    }

    /// Returns true if the GC would scan this region
    #[must_use]
    pub fn is_active(&self, pointer_size: PointerSize) -> bool {
        self.magic == Self::magic_for(pointer_size)
            && self.hash
                == Self::bounds_hash(pointer_size, self.region_pointer_low, self.region_pointer_high)
    }

    fn magic_for(pointer_size: PointerSize) -> u64 {
        match pointer_size {
            PointerSize::Eight => CONSERVATIVE_REGION_MAGIC_64,
            PointerSize::Four => u64::from(CONSERVATIVE_REGION_MAGIC_32),
        }
    }

    /// `((h << 13) ^ h) ^ bound`, folded over both bounds at the target width
    #[must_use]
    pub fn bounds_hash(pointer_size: PointerSize, low: u64, high: u64) -> u64 {
        match pointer_size {
            PointerSize::Eight => {
                let mut hash = CONSERVATIVE_REGION_MAGIC_64;
                hash = ((hash << CONSERVATIVE_REGION_HASH_SHIFT) ^ hash) ^ low;
                hash = ((hash << CONSERVATIVE_REGION_HASH_SHIFT) ^ hash) ^ high;
                hash
            }
            PointerSize::Four => {
                let mut hash = CONSERVATIVE_REGION_MAGIC_32;
                hash = ((hash << CONSERVATIVE_REGION_HASH_SHIFT) ^ hash) ^ low as u32;
                hash = ((hash << CONSERVATIVE_REGION_HASH_SHIFT) ^ hash) ^ high as u32;
                u64::from(hash)
            }
        }
    }
}

/// The runtime helper surface over a heap and a class library.
///
/// # Examples
///
/// ```rust,ignore
/// let mut exports = RuntimeExports::new(&memory, heap, classlib);
/// let boxed = exports.box_value(int32, &42i32.to_le_bytes())?;
/// let mut out = [0u8; 4];
/// exports.unbox_any(boxed, &mut out, int32)?;
/// ```
#[derive(Debug)]
pub struct RuntimeExports<'m, H: ManagedHeap, L: Classlib> {
    memory: &'m AddressSpace,
    heap: H,
    classlib: L,
    stack_trace_limit: usize,
}

impl<'m, H: ManagedHeap, L: Classlib> RuntimeExports<'m, H, L> {
    /// Helpers over the descriptors in `memory`
    pub fn new(memory: &'m AddressSpace, heap: H, classlib: L) -> Self {
        RuntimeExports {
            memory,
            heap,
            classlib,
            stack_trace_limit: 0,
        }
    }

    /// Stop stack traces after `limit` frames, 0 for no limit
    #[must_use]
    pub fn with_stack_trace_limit(mut self, limit: usize) -> Self {
        self.stack_trace_limit = limit;
        self
    }

    /// The heap
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// The heap, mutably
    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// The class library
    pub fn classlib(&self) -> &L {
        &self.classlib
    }

    fn descriptor(&self, address: u64) -> Result<TypeDescriptor<'m>> {
        TypeDescriptor::new(self.memory, address)
    }

    fn object_type(&self, object: ObjectRef) -> Result<TypeDescriptor<'m>> {
        self.descriptor(self.heap.object_type(object)?)
    }

    /// 8-byte alignment only needs help from the allocator on 32-bit targets.
    fn needs_align8(&self, descriptor: &TypeDescriptor<'m>) -> Result<bool> {
        Ok(self.memory.layout().pointer_size == PointerSize::Four && descriptor.requires_align8()?)
    }

    /// The class library exception for `id` that belongs with `descriptor`.
    fn throw(&self, descriptor: &TypeDescriptor<'m>, id: ExceptionId) -> Error {
        rt_trace!(
            HELPERS,
            TraceEvent::HelperException {
                descriptor: descriptor.address(),
                id: id as u32,
            }
        );
        match descriptor.classlib_exception(&self.classlib, id) {
            Ok(object) => Error::Thrown(ThrownException { id, object }),
            Err(error) => error,
        }
    }

    fn read_reference(&self, data: &[u8]) -> Result<ObjectRef> {
        let address = match self.memory.layout().pointer_size {
            PointerSize::Eight => u64::from_le_bytes(
                data.get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| out_of_bounds_error!())?,
            ),
            PointerSize::Four => u64::from(u32::from_le_bytes(
                data.get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| out_of_bounds_error!())?,
            )),
        };
        Ok(ObjectRef::new(address))
    }

    fn write_reference(&self, data: &mut [u8], object: ObjectRef) -> Result<()> {
        let bytes = self.memory.pointer_bytes() as usize;
        let slot = data.get_mut(..bytes).ok_or_else(|| out_of_bounds_error!())?;
        slot.copy_from_slice(&object.address().to_le_bytes()[..bytes]);
        Ok(())
    }

    /// Allocate an instance of a class or value type.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be decoded or the heap fails.
    pub fn new_object(&mut self, descriptor: u64) -> Result<ObjectRef> {
        let td = self.descriptor(descriptor)?;
        debug_assert!(
            !td.is_generic_type_definition()
                && !td.is_interface()
                && !td.is_array()
                && !td.is_string()
                && !td.is_byref_like().unwrap_or(false),
            "cannot instantiate {td}"
        );

        let flags = if self.needs_align8(&td)? {
            if td.is_value_type() {
                AllocFlags::MISALIGN
            } else if td.is_finalizable() {
                AllocFlags::FINALIZABLE | AllocFlags::ALIGN8
            } else {
                AllocFlags::ALIGN8
            }
        } else if td.is_finalizable() {
            AllocFlags::FINALIZABLE
        } else {
            AllocFlags::empty()
        };

        let object = self.heap.allocate(descriptor, flags)?;
        rt_trace!(
            ALLOCATION,
            TraceEvent::ObjectAllocated {
                descriptor,
                object: object.address(),
                flags: flags.bits(),
            }
        );
        Ok(object)
    }

    /// Allocate an array or string of `length` elements.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be decoded or the heap fails.
    pub fn new_array(&mut self, descriptor: u64, length: u32) -> Result<ObjectRef> {
        let td = self.descriptor(descriptor)?;
        debug_assert!(td.is_array() || td.is_string(), "{td} is not an array");

        let flags = if self.needs_align8(&td)? {
            AllocFlags::ALIGN8
        } else {
            AllocFlags::empty()
        };

        let object = self.heap.allocate_array(descriptor, length, flags)?;
        rt_trace!(
            ALLOCATION,
            TraceEvent::ArrayAllocated {
                descriptor,
                object: object.address(),
                length,
            }
        );
        Ok(object)
    }

    /// Box the value in `data`.
    ///
    /// A nullable boxes to null when its `has_value` byte is clear, and otherwise to a boxed
    /// instance of its underlying type.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is shorter than the value, a descriptor cannot be decoded, or
    /// the heap fails.
    pub fn box_value(&mut self, descriptor: u64, data: &[u8]) -> Result<ObjectRef> {
        let mut td = self.descriptor(descriptor)?;
        let mut payload = data;

        if td.is_nullable()? {
            if *data.first().ok_or_else(|| out_of_bounds_error!())? == 0 {
                return Ok(ObjectRef::NULL);
            }
            let offset = usize::from(td.nullable_value_offset()?);
            td = td.nullable_type()?;
            let size = td.value_type_size()? as usize;
            payload = data
                .get(offset..offset + size)
                .ok_or_else(|| out_of_bounds_error!())?;
        }

        let flags = if self.needs_align8(&td)? {
            AllocFlags::MISALIGN
        } else {
            AllocFlags::empty()
        };
        let object = self.heap.allocate(td.address(), flags)?;
        self.heap.write_payload(object, payload)?;
        rt_trace!(
            ALLOCATION,
            TraceEvent::ObjectAllocated {
                descriptor: td.address(),
                object: object.address(),
                flags: flags.bits(),
            }
        );
        Ok(object)
    }

    /// Box `data` when `descriptor` is a value type, otherwise return the reference it holds.
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeExports::box_value`].
    pub fn box_any(&mut self, data: &[u8], descriptor: u64) -> Result<ObjectRef> {
        if self.descriptor(descriptor)?.is_value_type() {
            self.box_value(descriptor, data)
        } else {
            self.read_reference(data)
        }
    }

    /// Unbox `object` into `data` as the type at `unbox_to`.
    ///
    /// Value types are checked with [`unbox_any_type_compare`] (nullables accept null and their
    /// underlying type); reference types with a cast check that lets null through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thrown`] with `NullReference` or `InvalidCast` on a mismatch, and an
    /// error if a descriptor cannot be decoded or `data` is too short.
    pub fn unbox_any(&mut self, object: ObjectRef, data: &mut [u8], unbox_to: u64) -> Result<()> {
        let target = self.descriptor(unbox_to)?;

        if target.is_value_type() {
            let valid = if target.is_nullable()? {
                object.is_null()
                    || self
                        .object_type(object)?
                        .is_equivalent_to(&target.nullable_type()?)?
            } else {
                !object.is_null() && unbox_any_type_compare(&self.object_type(object)?, &target)?
            };

            if !valid {
                let id = if object.is_null() {
                    ExceptionId::NullReference
                } else {
                    ExceptionId::InvalidCast
                };
                return Err(self.throw(&target, id));
            }
            return self.unbox_into(object, data, &target);
        }

        if !object.is_null() && !is_instance_of(&self.object_type(object)?, &target)? {
            return Err(self.throw(&target, ExceptionId::InvalidCast));
        }
        self.write_reference(data, object)
    }

    /// Address of the payload of a boxed value after checking its type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thrown`] with `NullReference` for null and `InvalidCast` on a mismatch.
    pub fn unbox2(&self, unbox_to: u64, object: ObjectRef) -> Result<u64> {
        let target = self.descriptor(unbox_to)?;
        if object.is_null() {
            return Err(self.throw(&target, ExceptionId::NullReference));
        }
        if !unbox_any_type_compare(&self.object_type(object)?, &target)? {
            return Err(self.throw(&target, ExceptionId::InvalidCast));
        }
        Ok(object.address() + u64::from(self.memory.pointer_bytes()))
    }

    /// Unbox `object` into the nullable `data` of type `unbox_to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thrown`] with `InvalidCast` when `object` is not of the underlying type.
    pub fn unbox_nullable(&mut self, data: &mut [u8], unbox_to: u64, object: ObjectRef) -> Result<()> {
        let target = self.descriptor(unbox_to)?;
        if !object.is_null()
            && !self
                .object_type(object)?
                .is_equivalent_to(&target.nullable_type()?)?
        {
            return Err(self.throw(&target, ExceptionId::InvalidCast));
        }
        self.unbox_into(object, data, &target)
    }

    /// Copy a boxed value into `data`; for nullables also set or clear `has_value`.
    fn unbox_into(
        &self,
        object: ObjectRef,
        data: &mut [u8],
        target: &TypeDescriptor<'m>,
    ) -> Result<()> {
        if !target.is_nullable()? {
            let size = target.value_type_size()? as usize;
            let out = data.get_mut(..size).ok_or_else(|| out_of_bounds_error!())?;
            return self.heap.read_payload(object, out);
        }

        if object.is_null() {
            data.fill(0);
            return Ok(());
        }

        let offset = usize::from(target.nullable_value_offset()?);
        let size = target.nullable_type()?.value_type_size()? as usize;
        let out = data
            .get_mut(offset..offset + size)
            .ok_or_else(|| out_of_bounds_error!())?;
        self.heap.read_payload(object, out)?;
        data[0] = 1;
        Ok(())
    }

    /// Reject storing the reference in `data` into `array` when the element type does not accept
    /// it.
    ///
    /// Null arrays, value type elements and null references always pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thrown`] with `ArrayTypeMismatch` on a mismatch.
    pub fn array_store_check_any(&self, array: ObjectRef, data: &[u8]) -> Result<()> {
        if array.is_null() {
            return Ok(());
        }

        let array_type = self.object_type(array)?;
        debug_assert!(array_type.is_array(), "first argument must be an array");
        let element = array_type.related_parameter_type()?;
        if element.is_value_type() {
            return Ok(());
        }

        let value = self.read_reference(data)?;
        if value.is_null() || is_instance_of(&self.object_type(value)?, &element)? {
            return Ok(());
        }
        Err(self.throw(&array_type, ExceptionId::ArrayTypeMismatch))
    }

    /// Returns false only for a null reference of a reference type.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be decoded or `data` is too short.
    pub fn box_and_null_check(&self, data: &[u8], descriptor: u64) -> Result<bool> {
        if self.descriptor(descriptor)?.is_value_type() {
            return Ok(true);
        }
        Ok(!self.read_reference(data)?.is_null())
    }

    /// Shallow copy of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the heap fails.
    pub fn memberwise_clone(&mut self, source: ObjectRef) -> Result<ObjectRef> {
        let descriptor = self.heap.object_type(source)?;
        let clone = if self.descriptor(descriptor)?.is_array() {
            let length = self.heap.array_length(source)?;
            self.new_array(descriptor, length)?
        } else {
            self.new_object(descriptor)?
        };
        self.heap.copy_object_contents(clone, source)?;
        Ok(clone)
    }

    /// Return addresses of the calling thread, skipping the helper's own frame.
    ///
    /// Fills `output` as far as it goes. Returns the number of frames when all of them fit, and
    /// the negated number of frames otherwise (including when `output` is `None`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailFast`] if the walker has no frame for the helper itself.
    pub fn current_thread_stack_trace<W: StackWalker + ?Sized>(
        &self,
        walker: &mut W,
        mut output: Option<&mut [u64]>,
    ) -> Result<i32> {
        let mut frames = StackFrameIterator::new(walker);
        if !frames.init()? {
            return Err(Error::FailFast(crate::FailFastReason::CorruptedStackWalk));
        }

        let capacity = output.as_ref().map_or(0, |buffer| buffer.len());
        let mut count = 0usize;
        while frames.next()? {
            if self.stack_trace_limit != 0 && count >= self.stack_trace_limit {
                break;
            }
            if let Some(slot) = output.as_deref_mut().and_then(|buffer| buffer.get_mut(count)) {
                *slot = frames.control_pc();
            }
            count += 1;
        }

        let count = i32::try_from(count).unwrap_or(i32::MAX);
        Ok(if (count as usize) <= capacity { count } else { -count })
    }

    /// Describe and activate a conservatively reported region.
    pub fn initialize_conservative_region(&self, region: &mut ConservativeRegion, begin: u64, size: u32) {
        region.initialize(self.memory.layout().pointer_size, begin, size);
    }

    /// Deactivate a conservatively reported region.
    pub fn disable_conservative_region(&self, region: &mut ConservativeRegion) {
        region.disable();
    }
}
