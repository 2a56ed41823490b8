//! Runtime configuration.
//!
//! - [`RuntimeConfig`] - Target layout, offset caching, stack trace limit and tracing
//! - [`TracingConfig`] - Which trace categories are recorded, and where
//!
//! # Configuration Presets
//!
//! - [`RuntimeConfig::native64()`] - 64-bit target with absolute pointers (the default)
//! - [`RuntimeConfig::portable64()`] - 64-bit target whose image descriptors use relative pointers
//! - [`RuntimeConfig::wasm32()`] - 32-bit WebAssembly target
//!
//! # Example
//!
//! ```rust
//! use eeruntime::config::{RuntimeConfig, TracingConfig};
//!
//! let config = RuntimeConfig {
//!     stack_trace_limit: 64,
//!     tracing: TracingConfig::default().with_context("startup"),
//!     ..RuntimeConfig::wasm32()
//! };
//! let memory = config.address_space();
//! assert_eq!(memory.pointer_bytes(), 4);
//! ```

use std::{path::PathBuf, sync::Arc};

use crate::{
    image::{AddressSpace, TargetLayout},
    runtime::eetype::OffsetCache,
    utils::trace::{install_trace_writer, TraceCategories, TraceWriter},
    Result,
};

/// Configuration of one runtime instance.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Pointer size and pointer encoding of the target
    pub target: TargetLayout,

    /// Whether descriptor field offsets are memoized per layout shape.
    ///
    /// Offsets are cheap to compute; the cache pays off for workloads that decode the same
    /// handful of shapes millions of times.
    pub offset_cache: bool,

    /// Trace recording
    pub tracing: TracingConfig,

    /// Frames reported by stack trace helpers, 0 for no limit
    pub stack_trace_limit: usize,
}

impl RuntimeConfig {
    /// 64-bit target with absolute pointers
    #[must_use]
    pub fn native64() -> Self {
        Self {
            target: TargetLayout::native64(),
            offset_cache: false,
            tracing: TracingConfig::default(),
            stack_trace_limit: 0,
        }
    }

    /// 64-bit target with relative pointers in image descriptors
    #[must_use]
    pub fn portable64() -> Self {
        Self {
            target: TargetLayout::portable64(),
            offset_cache: true,
            ..Self::native64()
        }
    }

    /// 32-bit WebAssembly target
    #[must_use]
    pub fn wasm32() -> Self {
        Self {
            target: TargetLayout::wasm32(),
            ..Self::native64()
        }
    }

    /// An empty address space for the target
    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace::new(self.target)
    }

    /// A field offset cache, when enabled
    #[must_use]
    pub fn offset_cache(&self) -> Option<OffsetCache> {
        self.offset_cache.then(OffsetCache::new)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::native64()
    }
}

/// Tracing configuration.
///
/// Tracing is compiled in only with the `trace` cargo feature. Without it the settings here are
/// accepted and ignored.
///
/// # Performance Impact
///
/// - `trace_dispatch`: Low (exceptions are rare)
/// - `trace_funclets`: Low (one event per filter or finally)
/// - `trace_threads`: Low (one event per thread start and exit)
/// - `trace_helpers`: Medium (one event per failed cast)
/// - `trace_layout`: Medium (one event per offset cache miss)
/// - `trace_allocation`: High (one event per allocation)
///
/// # File-Based Tracing
///
/// When `output_path` is set, events are appended to the file as they occur, one JSON object
/// per line, instead of being kept in memory.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Record the phases of exception dispatch. Enabled by default.
    pub trace_dispatch: bool,

    /// Record filter and finally funclet invocations
    pub trace_funclets: bool,

    /// Record object and array allocations made by the runtime helpers
    pub trace_allocation: bool,

    /// Record thread id allocation, recycling and CAS contention
    pub trace_threads: bool,

    /// Record descriptor layout computations that miss the offset cache
    pub trace_layout: bool,

    /// Record class library exceptions raised by the runtime helpers
    pub trace_helpers: bool,

    /// Maximum events kept in memory, 0 for unlimited. Ignored for file output.
    pub max_trace_entries: usize,

    /// File receiving the events, created if missing and appended to.
    pub output_path: Option<PathBuf>,

    /// Included as a "context" field in every event.
    pub context_prefix: Option<String>,
}

impl TracingConfig {
    /// Record every category to the file at `path`
    #[must_use]
    pub fn full_trace<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            trace_dispatch: true,
            trace_funclets: true,
            trace_allocation: true,
            trace_threads: true,
            trace_layout: true,
            trace_helpers: true,
            max_trace_entries: 0,
            output_path: Some(path.into()),
            context_prefix: None,
        }
    }

    /// Record dispatch and funclets to the file at `path`
    #[must_use]
    pub fn dispatch_trace<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            trace_dispatch: true,
            trace_funclets: true,
            trace_allocation: false,
            trace_threads: false,
            trace_layout: false,
            trace_helpers: false,
            max_trace_entries: 0,
            output_path: Some(path.into()),
            context_prefix: None,
        }
    }

    /// Record nothing
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            trace_dispatch: false,
            ..Self::default()
        }
    }

    /// Sets the context prefix for trace events.
    #[must_use]
    pub fn with_context(mut self, prefix: impl Into<String>) -> Self {
        self.context_prefix = Some(prefix.into());
        self
    }

    /// Checks if any tracing is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.categories().is_empty()
    }

    /// Checks if file-based tracing is configured.
    #[must_use]
    pub fn has_output_file(&self) -> bool {
        self.output_path.is_some()
    }

    /// The enabled categories
    #[must_use]
    pub fn categories(&self) -> TraceCategories {
        let mut categories = TraceCategories::empty();
        categories.set(TraceCategories::DISPATCH, self.trace_dispatch);
        categories.set(TraceCategories::FUNCLETS, self.trace_funclets);
        categories.set(TraceCategories::ALLOCATION, self.trace_allocation);
        categories.set(TraceCategories::THREADS, self.trace_threads);
        categories.set(TraceCategories::LAYOUT, self.trace_layout);
        categories.set(TraceCategories::HELPERS, self.trace_helpers);
        categories
    }

    /// Install the process-wide trace writer described by this configuration.
    ///
    /// Returns the new writer, `None` when tracing is disabled (which also removes any
    /// previously installed writer).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the output file cannot be opened.
    pub fn install(&self) -> Result<Option<Arc<TraceWriter>>> {
        if !self.is_enabled() {
            install_trace_writer(None, TraceCategories::empty());
            return Ok(None);
        }

        let writer = Arc::new(match &self.output_path {
            Some(path) => TraceWriter::new_file(path, self.context_prefix.clone())?,
            None => TraceWriter::new_memory(self.max_trace_entries, self.context_prefix.clone()),
        });
        install_trace_writer(Some(Arc::clone(&writer)), self.categories());
        Ok(Some(writer))
    }
}

impl Default for TracingConfig {
    /// Only dispatch tracing is enabled by default.
    fn default() -> Self {
        Self {
            trace_dispatch: true,
            trace_funclets: false,
            trace_allocation: false,
            trace_threads: false,
            trace_layout: false,
            trace_helpers: false,
            max_trace_entries: 10_000,
            output_path: None,
            context_prefix: None,
        }
    }
}
