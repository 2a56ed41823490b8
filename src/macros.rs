#![allow(unused_macros)]

/// Record a trace event under a [`crate::utils::trace::TraceCategories`] flag
///
/// Expands to nothing unless the `trace` feature is enabled. The event expression is only
/// evaluated when the category is switched on.
///
/// ```rust, ignore
///  rt_trace!(DISPATCH, TraceEvent::Unhandled { exception, frames });
/// ```
macro_rules! rt_trace {
    ($category:ident, $event:expr) => {
        #[cfg(feature = "trace")]
        {
            crate::utils::trace::emit(crate::utils::trace::TraceCategories::$category, || {
                $event
            });
        }
    };
}

/// Map the error of a funclet call to the fail-fast reason of the running pass
///
/// A fail-fast raised by the funclet itself is kept; any other error becomes `$reason`.
///
/// ```rust, ignore
///  let matched = funclet_result!(callbacks.call_filter_funclet(..), ExceptionDuringFilter)?;
/// ```
macro_rules! funclet_result {
    ($call:expr, $reason:ident) => {
        match $call {
            Ok(value) => Ok(value),
            Err(crate::Error::FailFast(reason)) => Err(crate::Error::FailFast(reason)),
            Err(_) => Err(crate::Error::FailFast(crate::FailFastReason::$reason)),
        }
    };
}
