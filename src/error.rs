use strum::{Display, EnumIter};
use thiserror::Error;

use crate::runtime::{ExceptionId, ObjectRef};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// Reason codes reported when the runtime has to give up below the exception handling layer.
///
/// A failure detected while dispatching an exception cannot itself be reported by throwing, so
/// these codes are the only signal the host receives before it terminates the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum FailFastReason {
    /// An internal consistency check failed.
    #[strum(serialize = "internal error")]
    InternalError,
    /// A filter funclet raised an exception of its own while being evaluated.
    #[strum(serialize = "exception raised inside a filter funclet")]
    ExceptionDuringFilter,
    /// A finally or fault funclet failed while the stack was being unwound.
    #[strum(serialize = "exception raised inside an unwind funclet")]
    ExceptionDuringUnwind,
    /// The stack walker produced a frame the dispatcher could not interpret.
    #[strum(serialize = "corrupted stack walk")]
    CorruptedStackWalk,
    /// The thread identifier space cannot grow any further.
    #[strum(serialize = "managed thread id space exhausted")]
    ThreadIdExhausted,
}

/// A class library exception produced by a runtime helper.
///
/// This is the catchable half of the error taxonomy: unbox and cast helpers translate a type
/// mismatch into the exception object the owning class library defines for `id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrownException {
    /// The class library exception kind.
    pub id: ExceptionId,
    /// The exception object handed back by the class library.
    pub object: ObjectRef,
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Image Errors
/// - [`Error::Malformed`] - Corrupted descriptor, optional-field stream or clause table
/// - [`Error::OutOfBounds`] - A read or write left every mapped memory region
/// - [`Error::NotSupported`] - The requested layout or feature is not supported
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Dispatch Errors
/// - [`Error::UnhandledException`] - No frame on the stack accepted the exception
/// - [`Error::FailFast`] - Failure below the exception handling layer
///
/// ## Class Library Errors
/// - [`Error::Thrown`] - A runtime helper raised a class library exception
///
/// Everything except [`Error::Thrown`] is fatal; see [`Error::is_fatal`].
///
/// # Examples
///
/// ```rust
/// use eeruntime::{Error, image::NativeParser};
///
/// let mut parser = NativeParser::new(&[0x1F]);
/// match parser.decode_unsigned() {
///     Err(Error::Malformed { message, .. }) => eprintln!("bad image: {message}"),
///     Err(e) => eprintln!("other error: {e}"),
///     Ok(value) => println!("{value}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged and could not be decoded.
    ///
    /// This is the bad-image-format signal of the runtime. The error includes the source
    /// location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// Raised when an address does not fall inside a mapped region, or when a read would run
    /// past the end of one.
    #[error("Out of Bound access would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The requested layout or feature is not supported.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// Filesystem I/O error, from opening a trace file.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// No frame on the stack accepted the exception.
    ///
    /// There is no path that returns an unhandled exception to the caller; hosts are expected to
    /// terminate the process.
    #[error("Unhandled exception {exception:?} after walking {frames} frames")]
    UnhandledException {
        /// The exception object that nobody caught
        exception: ObjectRef,
        /// Number of frames visited by the first pass
        frames: usize,
    },

    /// A failure below the exception handling layer.
    #[error("Fail fast: {0}")]
    FailFast(FailFastReason),

    /// A runtime helper raised a class library exception.
    #[error("Class library exception {}", .0.id)]
    Thrown(ThrownException),
}

impl Error {
    /// Returns `true` for every error that must terminate the process.
    ///
    /// Only [`Error::Thrown`] is recoverable; it travels through the normal exception path.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Thrown(_))
    }
}
