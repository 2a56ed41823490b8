//! Exception handling: clause tables, stack frames and the two-pass dispatcher.
//!
//! # Architecture
//!
//! - [`clause`] - Per-method exception clause tables and their iterator
//! - [`frame`] - Frames reported by the platform unwinder
//! - [`state`] - Phases of one dispatch
//! - [`dispatch`] - First and second pass, and the whole-stack dispatcher
//!
//! # Examples
//!
//! ```rust,ignore
//! use eeruntime::prelude::*;
//!
//! let mut dispatcher = ExceptionDispatcher::new(&memory, callbacks);
//! match dispatcher.dispatch(&mut walker, exception, MAX_TRY_REGION_IDX) {
//!     Ok(transfer) => resume_at(transfer.handler_address, &transfer.frame),
//!     Err(error) => abort(error),
//! }
//! ```

pub mod clause;
pub mod dispatch;
pub mod frame;
pub mod state;

pub use clause::{ClauseKind, ClauseTableBuilder, EHClause, EHClauseIterator};
pub use dispatch::{
    find_first_pass_handler, invoke_second_pass, ExceptionCallbacks, ExceptionDispatcher,
    FirstPassHandler, HandlerTransfer, MAX_TRY_REGION_IDX,
};
pub use frame::{FrameInfo, ShadowStackWalker, StackFrameIterator, StackWalker};
pub use state::DispatchState;
