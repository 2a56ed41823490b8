//! Recording collaborators for the runtime: heap, class library and funclet callbacks.

use std::collections::HashMap;

use crate::{
    runtime::{
        classlib::{Classlib, ExceptionId},
        exceptions::ExceptionCallbacks,
        exports::{AllocFlags, ManagedHeap},
        object::ObjectRef,
    },
    Error, Result,
};

/// First object address handed out by [`RecordingHeap`]
pub const HEAP_BASE: u64 = 0x1000_0000;

/// Spacing between objects of [`RecordingHeap`]
pub const HEAP_OBJECT_STRIDE: u64 = 0x100;

/// One allocation seen by [`RecordingHeap`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub descriptor: u64,
    pub object: ObjectRef,
    pub flags: AllocFlags,
    pub length: Option<u32>,
}

#[derive(Clone, Debug, Default)]
struct HeapObject {
    descriptor: u64,
    length: Option<u32>,
    payload: Vec<u8>,
}

/// Bump allocator that remembers every object and how it was allocated.
#[derive(Debug, Default)]
pub struct RecordingHeap {
    objects: HashMap<ObjectRef, HeapObject>,
    allocations: Vec<Allocation>,
}

impl RecordingHeap {
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    fn insert(&mut self, descriptor: u64, flags: AllocFlags, length: Option<u32>) -> ObjectRef {
        let object =
            ObjectRef::new(HEAP_BASE + HEAP_OBJECT_STRIDE * self.allocations.len() as u64);
        self.objects.insert(
            object,
            HeapObject {
                descriptor,
                length,
                payload: Vec::new(),
            },
        );
        self.allocations.push(Allocation {
            descriptor,
            object,
            flags,
            length,
        });
        object
    }

    fn object(&self, object: ObjectRef) -> Result<&HeapObject> {
        self.objects
            .get(&object)
            .ok_or_else(|| Error::NotSupported(format!("{object} is not a live object")))
    }
}

impl ManagedHeap for RecordingHeap {
    fn allocate(&mut self, descriptor: u64, flags: AllocFlags) -> Result<ObjectRef> {
        Ok(self.insert(descriptor, flags, None))
    }

    fn allocate_array(&mut self, descriptor: u64, length: u32, flags: AllocFlags) -> Result<ObjectRef> {
        Ok(self.insert(descriptor, flags, Some(length)))
    }

    fn object_type(&self, object: ObjectRef) -> Result<u64> {
        Ok(self.object(object)?.descriptor)
    }

    fn array_length(&self, array: ObjectRef) -> Result<u32> {
        self.object(array)?
            .length
            .ok_or_else(|| Error::NotSupported(format!("{array} is not an array")))
    }

    fn write_payload(&mut self, object: ObjectRef, data: &[u8]) -> Result<()> {
        let entry = self
            .objects
            .get_mut(&object)
            .ok_or_else(|| Error::NotSupported(format!("{object} is not a live object")))?;
        entry.payload = data.to_vec();
        Ok(())
    }

    fn read_payload(&self, object: ObjectRef, out: &mut [u8]) -> Result<()> {
        let payload = &self.object(object)?.payload;
        let source = payload
            .get(..out.len())
            .ok_or_else(|| out_of_bounds_error!())?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn copy_object_contents(&mut self, destination: ObjectRef, source: ObjectRef) -> Result<()> {
        let contents = self.object(source)?.clone();
        let entry = self
            .objects
            .get_mut(&destination)
            .ok_or_else(|| Error::NotSupported(format!("{destination} is not a live object")))?;
        entry.length = contents.length;
        entry.payload = contents.payload;
        Ok(())
    }
}

/// Class library whose exception objects encode where they came from.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestClasslib;

impl TestClasslib {
    pub fn module_exception(module_address: u64, id: ExceptionId) -> ObjectRef {
        ObjectRef::new((module_address << 8) | u64::from(id as u32))
    }

    pub fn function_exception(function: u64, id: ExceptionId) -> ObjectRef {
        ObjectRef::new((function << 8) | 0x80 | u64::from(id as u32))
    }
}

impl Classlib for TestClasslib {
    fn exception_from_module(&self, module_address: u64, id: ExceptionId) -> Result<ObjectRef> {
        if module_address == 0 {
            return Err(Error::NotSupported("type has no module".to_string()));
        }
        Ok(Self::module_exception(module_address, id))
    }

    fn exception_from_function(&self, function: u64, id: ExceptionId) -> Result<ObjectRef> {
        Ok(Self::function_exception(function, id))
    }
}

/// What a filter funclet does when [`RecordingCallbacks`] runs it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    Accept,
    Reject,
    Throw,
}

/// A funclet invocation seen by [`RecordingCallbacks`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncletCall {
    Filter { filter: u64, shadow_stack: u64 },
    Finally { handler: u64, shadow_stack: u64 },
}

/// Funclet callbacks that log every call and answer from tables.
///
/// Filters not listed in `filters` reject the exception.
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    pub types: HashMap<ObjectRef, u64>,
    pub filters: HashMap<u64, FilterOutcome>,
    pub failing_finally: Option<u64>,
    pub calls: Vec<FuncletCall>,
}

impl RecordingCallbacks {
    pub fn with_object(mut self, object: ObjectRef, descriptor: u64) -> Self {
        self.types.insert(object, descriptor);
        self
    }

    pub fn with_filter(mut self, filter: u64, outcome: FilterOutcome) -> Self {
        self.filters.insert(filter, outcome);
        self
    }

    pub fn finally_calls(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                FuncletCall::Finally { handler, .. } => Some(*handler),
                FuncletCall::Filter { .. } => None,
            })
            .collect()
    }

    pub fn filter_calls(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                FuncletCall::Filter { filter, .. } => Some(*filter),
                FuncletCall::Finally { .. } => None,
            })
            .collect()
    }
}

impl ExceptionCallbacks for RecordingCallbacks {
    fn exception_type(&self, exception: ObjectRef) -> Result<u64> {
        self.types
            .get(&exception)
            .copied()
            .ok_or_else(|| Error::NotSupported(format!("no type for {exception}")))
    }

    fn call_filter_funclet(
        &mut self,
        _exception: ObjectRef,
        filter: u64,
        shadow_stack: u64,
    ) -> Result<bool> {
        self.calls.push(FuncletCall::Filter {
            filter,
            shadow_stack,
        });
        match self.filters.get(&filter) {
            Some(FilterOutcome::Accept) => Ok(true),
            Some(FilterOutcome::Throw) => Err(Error::NotSupported("filter threw".to_string())),
            Some(FilterOutcome::Reject) | None => Ok(false),
        }
    }

    fn call_finally_funclet(&mut self, handler: u64, shadow_stack: u64) -> Result<()> {
        self.calls.push(FuncletCall::Finally {
            handler,
            shadow_stack,
        });
        if self.failing_finally == Some(handler) {
            return Err(Error::NotSupported("finally threw".to_string()));
        }
        Ok(())
    }
}
