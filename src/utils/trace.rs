//! Runtime event tracing for debugging dispatch, allocation and thread id bookkeeping.
//!
//! Events are small `Copy` records of fixed-width integers, so recording one costs a lock and a
//! push; formatting only happens when a file-backed writer serializes them. Call sites go
//! through the crate-internal `rt_trace!` macro, which compiles to nothing unless the `trace`
//! cargo feature is enabled, and is filtered at run time by [`TraceCategories`].
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use eeruntime::utils::trace::{install_trace_writer, TraceCategories, TraceWriter};
//!
//! let writer = Arc::new(TraceWriter::new_memory(1_000, Some("startup".to_string())));
//! install_trace_writer(Some(writer.clone()), TraceCategories::DISPATCH);
//! // ... dispatch exceptions ...
//! let events = writer.take_buffer().unwrap_or_default();
//! install_trace_writer(None, TraceCategories::empty());
//! # let _ = events;
//! ```
//!
//! # Output Format
//!
//! File-backed writers append newline-delimited JSON (NDJSON), one object per event, with
//! addresses as fixed-width hexadecimal strings.

use std::{
    collections::VecDeque,
    fmt::{self, Write as _},
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    mem,
    num::NonZeroUsize,
    path::Path,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bitflags::bitflags;

bitflags! {
    /// Groups of trace events that can be switched on independently.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TraceCategories: u32 {
        /// Frame walks, handler searches and control transfers
        const DISPATCH = 0x01;
        /// Filter and finally funclet invocations
        const FUNCLETS = 0x02;
        /// Object and array allocation through the runtime exports
        const ALLOCATION = 0x04;
        /// Managed thread id allocation and recycling
        const THREADS = 0x08;
        /// Descriptor layout cache activity
        const LAYOUT = 0x10;
        /// Class library exceptions raised by runtime helpers
        const HELPERS = 0x20;
    }
}

/// A trace event recorded by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// Dispatch of a thrown exception started.
    DispatchBegin {
        /// The thrown object.
        exception: u64,
        /// Clause index the throw frame resumes after, `u32::MAX` for a fresh throw.
        resume_idx: u32,
    },
    /// The first pass searched one frame.
    FrameSearched {
        /// Frame number counted from the throw site.
        frame: u32,
        /// Control PC of the frame.
        control_pc: u64,
        /// Code offset the clauses were matched against.
        offset: u32,
    },
    /// A filter funclet was evaluated.
    FilterInvoked {
        /// Filter entry point.
        filter: u64,
        /// Whether the filter accepted the exception.
        matched: bool,
    },
    /// The first pass selected a handler.
    HandlerFound {
        /// Frame number counted from the throw site.
        frame: u32,
        /// Handler entry point.
        handler: u64,
        /// Index of the winning clause in the frame's clause table.
        try_region_idx: u32,
    },
    /// No frame accepted the exception.
    Unhandled {
        /// The thrown object.
        exception: u64,
        /// Number of frames searched.
        frames: u32,
    },
    /// The second pass ran a finally or fault funclet.
    FinallyInvoked {
        /// Funclet entry point.
        handler: u64,
        /// Try-region start the funclet belongs to.
        landing: u32,
    },
    /// Control was handed to the selected handler.
    HandlerTransfer {
        /// Frame number counted from the throw site.
        frame: u32,
        /// Handler entry point.
        handler: u64,
    },
    /// An object was allocated through the runtime exports.
    ObjectAllocated {
        /// Descriptor of the new object.
        descriptor: u64,
        /// The new object.
        object: u64,
        /// Allocation routing bits.
        flags: u8,
    },
    /// An array or string was allocated through the runtime exports.
    ArrayAllocated {
        /// Descriptor of the new array.
        descriptor: u64,
        /// The new array.
        object: u64,
        /// Element count.
        length: u32,
    },
    /// A runtime helper raised a class library exception.
    HelperException {
        /// Descriptor whose class library was asked.
        descriptor: u64,
        /// Numeric exception id.
        id: u32,
    },
    /// A managed thread id was handed out.
    ThreadIdAllocated {
        /// The id.
        id: u32,
    },
    /// A managed thread id was returned.
    ThreadIdRecycled {
        /// The id.
        id: u32,
    },
    /// A concurrent update of the thread id tree forced a retry.
    ThreadIdContention {
        /// Number of attempts so far.
        attempts: u32,
    },
    /// A field offset table was computed for a new layout shape.
    OffsetCacheMiss {
        /// Vtable slot count of the shape.
        vtable_slots: u16,
        /// Interface count of the shape.
        interfaces: u16,
        /// Header flags of the shape.
        flags: u16,
        /// Rare flags of the shape.
        rare_flags: u32,
    },
}

impl TraceEvent {
    /// The category this event is filtered under.
    #[must_use]
    pub fn category(&self) -> TraceCategories {
        match self {
            TraceEvent::DispatchBegin { .. }
            | TraceEvent::FrameSearched { .. }
            | TraceEvent::HandlerFound { .. }
            | TraceEvent::Unhandled { .. }
            | TraceEvent::HandlerTransfer { .. } => TraceCategories::DISPATCH,
            TraceEvent::FilterInvoked { .. } | TraceEvent::FinallyInvoked { .. } => {
                TraceCategories::FUNCLETS
            }
            TraceEvent::ObjectAllocated { .. } | TraceEvent::ArrayAllocated { .. } => {
                TraceCategories::ALLOCATION
            }
            TraceEvent::HelperException { .. } => TraceCategories::HELPERS,
            TraceEvent::ThreadIdAllocated { .. }
            | TraceEvent::ThreadIdRecycled { .. }
            | TraceEvent::ThreadIdContention { .. } => TraceCategories::THREADS,
            TraceEvent::OffsetCacheMiss { .. } => TraceCategories::LAYOUT,
        }
    }

    /// Name written as the `type` field of the event's record
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::DispatchBegin { .. } => "dispatch",
            TraceEvent::FrameSearched { .. } => "frame",
            TraceEvent::FilterInvoked { .. } => "filter",
            TraceEvent::HandlerFound { .. } => "handler",
            TraceEvent::Unhandled { .. } => "unhandled",
            TraceEvent::FinallyInvoked { .. } => "finally",
            TraceEvent::HandlerTransfer { .. } => "transfer",
            TraceEvent::ObjectAllocated { .. } => "alloc",
            TraceEvent::ArrayAllocated { .. } => "alloc_array",
            TraceEvent::HelperException { .. } => "helper_exception",
            TraceEvent::ThreadIdAllocated { .. } => "thread_id_alloc",
            TraceEvent::ThreadIdRecycled { .. } => "thread_id_recycle",
            TraceEvent::ThreadIdContention { .. } => "thread_id_contention",
            TraceEvent::OffsetCacheMiss { .. } => "layout_miss",
        }
    }

    fn fields(&self) -> Vec<(&'static str, Field)> {
        use Field::{Address, Count, Flag, Hex16, Hex32, Hex8};

        match *self {
            TraceEvent::DispatchBegin {
                exception,
                resume_idx,
            } => vec![
                ("exception", Address(exception)),
                ("resume_idx", Hex32(resume_idx)),
            ],
            TraceEvent::FrameSearched {
                frame,
                control_pc,
                offset,
            } => vec![
                ("frame", Count(frame)),
                ("control_pc", Address(control_pc)),
                ("offset", Hex32(offset)),
            ],
            TraceEvent::FilterInvoked { filter, matched } => {
                vec![("filter", Address(filter)), ("matched", Flag(matched))]
            }
            TraceEvent::HandlerFound {
                frame,
                handler,
                try_region_idx,
            } => vec![
                ("frame", Count(frame)),
                ("handler", Address(handler)),
                ("try_region_idx", Count(try_region_idx)),
            ],
            TraceEvent::Unhandled { exception, frames } => {
                vec![("exception", Address(exception)), ("frames", Count(frames))]
            }
            TraceEvent::FinallyInvoked { handler, landing } => {
                vec![("handler", Address(handler)), ("landing", Hex32(landing))]
            }
            TraceEvent::HandlerTransfer { frame, handler } => {
                vec![("frame", Count(frame)), ("handler", Address(handler))]
            }
            TraceEvent::ObjectAllocated {
                descriptor,
                object,
                flags,
            } => vec![
                ("descriptor", Address(descriptor)),
                ("object", Address(object)),
                ("flags", Hex8(flags)),
            ],
            TraceEvent::ArrayAllocated {
                descriptor,
                object,
                length,
            } => vec![
                ("descriptor", Address(descriptor)),
                ("object", Address(object)),
                ("length", Count(length)),
            ],
            TraceEvent::HelperException { descriptor, id } => {
                vec![("descriptor", Address(descriptor)), ("id", Count(id))]
            }
            TraceEvent::ThreadIdAllocated { id } | TraceEvent::ThreadIdRecycled { id } => {
                vec![("id", Count(id))]
            }
            TraceEvent::ThreadIdContention { attempts } => vec![("attempts", Count(attempts))],
            TraceEvent::OffsetCacheMiss {
                vtable_slots,
                interfaces,
                flags,
                rare_flags,
            } => vec![
                ("vtable_slots", Count(u32::from(vtable_slots))),
                ("interfaces", Count(u32::from(interfaces))),
                ("flags", Hex16(flags)),
                ("rare_flags", Hex32(rare_flags)),
            ],
        }
    }

    /// One NDJSON record for the event, without the trailing newline.
    ///
    /// `context` must already be free of characters that need escaping; writers sanitize it
    /// when they are created.
    #[must_use]
    pub fn to_ndjson(&self, context: Option<&str>) -> String {
        let mut record = String::with_capacity(96);
        record.push('{');
        if let Some(context) = context {
            let _ = write!(record, "\"context\":\"{context}\",");
        }
        let _ = write!(record, "\"type\":\"{}\"", self.kind());
        for (name, value) in self.fields() {
            let _ = write!(record, ",\"{name}\":{value}");
        }
        record.push('}');
        record
    }
}

/// A typed field value of a trace record.
#[derive(Clone, Copy)]
enum Field {
    Address(u64),
    Hex32(u32),
    Hex16(u16),
    Hex8(u8),
    Count(u32),
    Flag(bool),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Address(value) => write!(f, "\"0x{value:016X}\""),
            Field::Hex32(value) => write!(f, "\"0x{value:08X}\""),
            Field::Hex16(value) => write!(f, "\"0x{value:04X}\""),
            Field::Hex8(value) => write!(f, "\"0x{value:02X}\""),
            Field::Count(value) => write!(f, "{value}"),
            Field::Flag(value) => write!(f, "{value}"),
        }
    }
}

/// Reduce a context label to printable ASCII that needs no escaping in a JSON string.
fn sanitize_context(context: String) -> String {
    if context
        .bytes()
        .all(|b| (b.is_ascii_graphic() || b == b' ') && b != b'"' && b != b'\\')
    {
        return context;
    }
    context
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}

enum TraceSink {
    /// Records appended to a file, one per line
    File(Mutex<BufWriter<File>>),
    /// The most recent events, oldest first; `limit` of `None` keeps everything
    Ring {
        events: Mutex<VecDeque<TraceEvent>>,
        limit: Option<NonZeroUsize>,
    },
}

/// Destination of recorded trace events, shared by every thread of the runtime.
pub struct TraceWriter {
    sink: TraceSink,
    context: Option<String>,
    recorded: AtomicU64,
}

impl TraceWriter {
    /// Append NDJSON records to the file at `path`, creating it if missing.
    ///
    /// Several runtimes may share one file; `context` tells their records apart.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub fn new_file<P: AsRef<Path>>(path: P, context: Option<String>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TraceWriter {
            sink: TraceSink::File(Mutex::new(BufWriter::new(file))),
            context: context.map(sanitize_context),
            recorded: AtomicU64::new(0),
        })
    }

    /// Keep the last `max_entries` events in memory, all of them when `max_entries` is 0.
    #[must_use]
    pub fn new_memory(max_entries: usize, context: Option<String>) -> Self {
        TraceWriter {
            sink: TraceSink::Ring {
                events: Mutex::new(VecDeque::new()),
                limit: NonZeroUsize::new(max_entries),
            },
            context: context.map(sanitize_context),
            recorded: AtomicU64::new(0),
        }
    }

    /// The context label, after sanitizing
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Record one event. A memory writer at its limit drops its oldest event.
    pub fn record(&self, event: TraceEvent) {
        self.recorded.fetch_add(1, Ordering::Relaxed);

        match &self.sink {
            TraceSink::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{}", event.to_ndjson(self.context()));
                }
            }
            TraceSink::Ring { events, limit } => {
                if let Ok(mut events) = events.lock() {
                    if limit.is_some_and(|limit| events.len() >= limit.get()) {
                        events.pop_front();
                    }
                    events.push_back(event);
                }
            }
        }
    }

    /// Push buffered records to the file; a no-op in memory.
    pub fn flush(&self) {
        if let TraceSink::File(file) = &self.sink {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }

    /// Events recorded so far, including those a memory writer has since dropped
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Remove and return the events held in memory, oldest first.
    ///
    /// Returns `None` for a file writer.
    pub fn take_buffer(&self) -> Option<Vec<TraceEvent>> {
        match &self.sink {
            TraceSink::File(_) => None,
            TraceSink::Ring { events, .. } => events
                .lock()
                .ok()
                .map(|mut events| events.drain(..).collect()),
        }
    }
}

impl fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match &self.sink {
            TraceSink::File(_) => "file".to_string(),
            TraceSink::Ring { limit: None, .. } => "memory".to_string(),
            TraceSink::Ring {
                limit: Some(limit), ..
            } => format!("memory({limit})"),
        };
        f.debug_struct("TraceWriter")
            .field("sink", &sink)
            .field("context", &self.context)
            .field("recorded", &self.recorded())
            .finish()
    }
}

static GLOBAL_WRITER: RwLock<Option<Arc<TraceWriter>>> = RwLock::new(None);
static GLOBAL_CATEGORIES: AtomicU32 = AtomicU32::new(0);

/// Install the process-wide trace writer, or remove it with `None`.
///
/// Only events in `categories` reach the writer. Returns the previously installed writer.
pub fn install_trace_writer(
    writer: Option<Arc<TraceWriter>>,
    categories: TraceCategories,
) -> Option<Arc<TraceWriter>> {
    let enabled = if writer.is_some() {
        categories
    } else {
        TraceCategories::empty()
    };

    let previous = match GLOBAL_WRITER.write() {
        Ok(mut slot) => mem::replace(&mut *slot, writer),
        Err(_) => None,
    };
    GLOBAL_CATEGORIES.store(enabled.bits(), Ordering::Release);
    previous
}

/// Categories the installed writer currently receives.
#[must_use]
pub fn enabled_categories() -> TraceCategories {
    TraceCategories::from_bits_truncate(GLOBAL_CATEGORIES.load(Ordering::Acquire))
}

/// Hand an event to the installed writer if its category is enabled.
///
/// `event` is only evaluated when the event will be recorded.
pub fn emit(category: TraceCategories, event: impl FnOnce() -> TraceEvent) {
    if !enabled_categories().intersects(category) {
        return;
    }
    if let Ok(slot) = GLOBAL_WRITER.read() {
        if let Some(writer) = slot.as_ref() {
            writer.record(event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fields() {
        let event = TraceEvent::HandlerFound {
            frame: 2,
            handler: 0x4000_1000,
            try_region_idx: 3,
        };

        assert_eq!(
            event.to_ndjson(None),
            "{\"type\":\"handler\",\"frame\":2,\"handler\":\"0x0000000040001000\",\"try_region_idx\":3}"
        );
        assert_eq!(
            TraceEvent::ObjectAllocated {
                descriptor: 0x20_0000,
                object: 0x10,
                flags: 0x3
            }
            .to_ndjson(None),
            "{\"type\":\"alloc\",\"descriptor\":\"0x0000000000200000\",\
             \"object\":\"0x0000000000000010\",\"flags\":\"0x03\"}"
        );
    }

    #[test]
    fn test_record_with_context() {
        let event = TraceEvent::ThreadIdAllocated { id: 7 };

        let record = event.to_ndjson(Some("worker"));
        assert_eq!(
            record,
            "{\"context\":\"worker\",\"type\":\"thread_id_alloc\",\"id\":7}"
        );
        assert_eq!(
            event.to_ndjson(None),
            "{\"type\":\"thread_id_alloc\",\"id\":7}"
        );
    }

    #[test]
    fn test_context_is_sanitized() {
        assert_eq!(sanitize_context("boot 1".to_string()), "boot 1");
        assert_eq!(sanitize_context("a\"b\\c\nd".to_string()), "a_b_c_d");
        assert_eq!(sanitize_context("héllo".to_string()), "h_llo");

        let writer = TraceWriter::new_memory(1, Some("x\"y".to_string()));
        assert_eq!(writer.context(), Some("x_y"));
    }

    #[test]
    fn test_memory_ring_keeps_latest() {
        let writer = TraceWriter::new_memory(2, Some("test".to_string()));
        for id in 1..=3 {
            writer.record(TraceEvent::ThreadIdRecycled { id });
        }

        assert_eq!(writer.recorded(), 3);
        assert_eq!(writer.context(), Some("test"));

        let buffer = writer.take_buffer().unwrap();
        assert_eq!(
            buffer,
            vec![
                TraceEvent::ThreadIdRecycled { id: 2 },
                TraceEvent::ThreadIdRecycled { id: 3 }
            ]
        );
        assert!(writer.take_buffer().unwrap().is_empty());

        let unbounded = TraceWriter::new_memory(0, None);
        for id in 0..100 {
            unbounded.record(TraceEvent::ThreadIdAllocated { id });
        }
        assert_eq!(unbounded.take_buffer().map(|events| events.len()), Some(100));
    }

    #[test]
    fn test_file_writer_appends_lines() {
        let path = std::env::temp_dir().join(format!("eeruntime-trace-{}.ndjson", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let writer = TraceWriter::new_file(&path, Some("run".to_string())).unwrap();
        writer.record(TraceEvent::ThreadIdContention { attempts: 2 });
        writer.record(TraceEvent::FilterInvoked {
            filter: 0x1060,
            matched: false,
        });
        writer.flush();
        assert!(writer.take_buffer().is_none());

        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "{\"context\":\"run\",\"type\":\"thread_id_contention\",\"attempts\":2}",
                "{\"context\":\"run\",\"type\":\"filter\",\"filter\":\"0x0000000000001060\",\"matched\":false}",
            ]
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            TraceEvent::FilterInvoked {
                filter: 0,
                matched: true
            }
            .category(),
            TraceCategories::FUNCLETS
        );
        assert_eq!(
            TraceEvent::OffsetCacheMiss {
                vtable_slots: 0,
                interfaces: 0,
                flags: 0,
                rare_flags: 0
            }
            .category(),
            TraceCategories::LAYOUT
        );
    }
}
