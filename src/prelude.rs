//! # eeruntime Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the eeruntime library. Import this module to get quick access to the descriptor
//! model, the exception dispatcher and the runtime helpers.
//!
//! ```rust
//! use eeruntime::prelude::*;
//!
//! let memory = AddressSpace::new(TargetLayout::wasm32());
//! assert_eq!(memory.pointer_bytes(), 4);
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all eeruntime operations
pub use crate::Error;

/// The result type used throughout eeruntime
pub use crate::Result;

/// Fail-fast reasons and the payload of helper-raised exceptions
pub use crate::{FailFastReason, ThrownException};

/// Runtime and tracing configuration
pub use crate::config::{RuntimeConfig, TracingConfig};

// ================================================================================================
// Address Space and Native Format
// ================================================================================================

/// Memory holding descriptors, clause tables and runtime data
pub use crate::image::{AddressSpace, RegionId, RegionKind};

/// Target pointer width and pointer encoding
pub use crate::image::{PointerSize, TargetLayout};

/// Native-format integer readers and writers
pub use crate::image::{encode_unsigned, encoded_unsigned_len, NativeParser, NativeReader};

// ================================================================================================
// Type Descriptors
// ================================================================================================

/// Descriptor views and producers
pub use crate::runtime::eetype::{
    md_array_shape, szarray_shape, DescriptorSizeRequest, DynamicModule, TypeDescriptor,
    TypeDescriptorBuilder,
};

/// Descriptor flags and element types
pub use crate::runtime::eetype::{
    CorElementType, EETypeFlags, EETypeKind, EETypeRareFlags, GenericVariance, OptionalFieldTag,
};

/// Field layout
pub use crate::runtime::eetype::{EETypeField, FieldOffsets, LayoutShape, OffsetCache};

/// Optional fields
pub use crate::runtime::eetype::{get_inline_field, OptionalFieldsBuilder};

/// Casting
pub use crate::runtime::eetype::{
    implements_interface, is_instance_of, is_instance_of_class, unbox_any_type_compare,
};

// ================================================================================================
// Exception Handling
// ================================================================================================

/// Clause tables
pub use crate::runtime::exceptions::{ClauseKind, ClauseTableBuilder, EHClause, EHClauseIterator};

/// Two-pass dispatch
pub use crate::runtime::exceptions::{
    find_first_pass_handler, invoke_second_pass, DispatchState, ExceptionCallbacks,
    ExceptionDispatcher, FirstPassHandler, HandlerTransfer, MAX_TRY_REGION_IDX,
};

/// Stack walking
pub use crate::runtime::exceptions::{
    FrameInfo, ShadowStackWalker, StackFrameIterator, StackWalker,
};

// ================================================================================================
// Runtime Services
// ================================================================================================

/// Objects and the class library
pub use crate::runtime::{Classlib, ExceptionId, ObjectRef};

/// Helpers called by compiled code
pub use crate::runtime::exports::{AllocFlags, ConservativeRegion, ManagedHeap, RuntimeExports};

/// Managed thread ids
pub use crate::runtime::threadid::{
    current_managed_thread_id, global_dispenser, ManagedThreadId, ManagedThreadIdDispenser,
};

// ================================================================================================
// Tracing
// ================================================================================================

/// Trace events and their writer
pub use crate::utils::trace::{TraceCategories, TraceEvent, TraceWriter};
