//! Crate-wide helpers that do not belong to the image or runtime layers.
//!
//! - [`trace`] - structured runtime event tracing

pub mod trace;
