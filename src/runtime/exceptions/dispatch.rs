//! Two-pass exception dispatch.
//!
//! Pass one searches for a handler without changing any state: it walks frames outward from the
//! throw site and asks each frame's clause table for a typed catch or an accepting filter. Pass
//! two walks the same frames again and runs the finally and fault funclets of every try region
//! being left, innermost first, before control reaches the handler.
//!
//! The per-frame halves, [`find_first_pass_handler`] and [`invoke_second_pass`], are usable on
//! their own by targets whose compiler emits landing pads and drives dispatch frame by frame.
//! [`ExceptionDispatcher`] combines them over a [`StackWalker`].
//!
//! # Resuming
//!
//! Both passes take the index of the clause that started a previous dispatch (`idx_start`). A
//! rethrow or a collided unwind resumes past that clause and past every following clause that
//! protects the identical try region. [`MAX_TRY_REGION_IDX`] starts from the first clause.

use crate::{
    image::AddressSpace,
    runtime::{
        eetype::{is_instance_of_class, TypeDescriptor},
        exceptions::{
            clause::{ClauseKind, EHClause, EHClauseIterator},
            frame::{FrameInfo, StackFrameIterator, StackWalker},
            state::DispatchState,
        },
        object::ObjectRef,
    },
    Error, FailFastReason, Result,
};

#[cfg(feature = "trace")]
use crate::utils::trace::TraceEvent;

/// Try-region index meaning "no region", both as a resume point and as a pass-two limit
pub const MAX_TRY_REGION_IDX: u32 = 0xFFFF_FFFF;

/// Operations the dispatcher needs from the code generator and the object model.
pub trait ExceptionCallbacks {
    /// Descriptor address of the thrown object.
    ///
    /// # Errors
    ///
    /// Returns an error if `exception` is not a live object.
    fn exception_type(&self, exception: ObjectRef) -> Result<u64>;

    /// Run the filter funclet at `filter`; `true` selects its handler.
    ///
    /// # Errors
    ///
    /// Any error is an exception escaping the filter and becomes
    /// [`FailFastReason::ExceptionDuringFilter`].
    fn call_filter_funclet(
        &mut self,
        exception: ObjectRef,
        filter: u64,
        shadow_stack: u64,
    ) -> Result<bool>;

    /// Run the finally or fault funclet at `handler`.
    ///
    /// # Errors
    ///
    /// Any error is an exception escaping the funclet and becomes
    /// [`FailFastReason::ExceptionDuringUnwind`].
    fn call_finally_funclet(&mut self, handler: u64, shadow_stack: u64) -> Result<()>;

    /// Descriptor address named by the type symbol of a typed clause.
    ///
    /// Symbols are descriptor addresses unless the image says otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol cannot be resolved.
    fn resolve_type_symbol(&self, symbol: u32) -> Result<u64> {
        Ok(u64::from(symbol))
    }
}

/// Handler selected by the first pass in one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FirstPassHandler {
    /// Entry point of the catch handler
    pub handler_address: u64,
    /// Index of the winning clause
    pub try_region_idx: u32,
}

/// Where dispatch hands control once both passes are done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerTransfer {
    /// Frames between the throw site and the handler frame
    pub frame_index: usize,
    /// The handler frame
    pub frame: FrameInfo,
    /// Entry point of the catch handler
    pub handler_address: u64,
    /// Index of the winning clause in the handler frame
    pub try_region_idx: u32,
    /// The exception being delivered
    pub exception: ObjectRef,
}

struct ResumeSkip {
    idx_start: u32,
    last_try_start: u32,
    last_try_end: u32,
}

impl ResumeSkip {
    fn new(idx_start: u32) -> Self {
        ResumeSkip {
            idx_start,
            last_try_start: 0,
            last_try_end: 0,
        }
    }

    fn skip(&mut self, cur_idx: u32, clause: &EHClause) -> bool {
        if self.idx_start == MAX_TRY_REGION_IDX {
            return false;
        }

        if cur_idx <= self.idx_start {
            self.last_try_start = clause.try_start_offset;
            self.last_try_end = clause.try_end_offset;
            return true;
        }

        if clause.try_start_offset == self.last_try_start
            && clause.try_end_offset == self.last_try_end
        {
            return true;
        }

        // Empty finally markers separate runs of different try regions at the same offsets.
        self.idx_start = MAX_TRY_REGION_IDX;
        false
    }
}

/// Search one frame's clauses for the handler of `exception` thrown at `offset`.
///
/// Typed clauses match when the exception's type derives from the clause type; filter clauses
/// run their filter funclet. The first match wins, which is the innermost one because of the
/// clause order.
///
/// # Arguments
///
/// * `memory` - Address space holding the type descriptors
/// * `callbacks` - Exception type lookup and filter funclets
/// * `exception` - The thrown object
/// * `idx_start` - Resume point, or [`MAX_TRY_REGION_IDX`]
/// * `offset` - Code offset the frame stopped at
/// * `shadow_stack` - Handed to filter funclets
/// * `code_start` - Base of the method's handler and filter offsets
/// * `clauses` - A fresh iterator over the frame's clause table
///
/// # Errors
///
/// Returns [`Error::FailFast`] with [`FailFastReason::ExceptionDuringFilter`] if a filter fails,
/// and the decoding error if the clause table or a descriptor is malformed.
pub fn find_first_pass_handler<C: ExceptionCallbacks + ?Sized>(
    memory: &AddressSpace,
    callbacks: &mut C,
    exception: ObjectRef,
    idx_start: u32,
    offset: u32,
    shadow_stack: u64,
    code_start: u64,
    clauses: EHClauseIterator<'_>,
) -> Result<Option<FirstPassHandler>> {
    let mut resume = ResumeSkip::new(idx_start);
    let mut exception_type: Option<TypeDescriptor<'_>> = None;

    for (cur_idx, clause) in (0u32..).zip(clauses) {
        let clause = clause?;
        if resume.skip(cur_idx, &clause) {
            continue;
        }

        if !matches!(clause.kind, ClauseKind::Typed | ClauseKind::Filter)
            || !clause.contains_code_offset(offset)
        {
            continue;
        }

        let matched = if clause.kind == ClauseKind::Typed {
            let object_type = match exception_type {
                Some(object_type) => object_type,
                None => {
                    let object_type =
                        TypeDescriptor::new(memory, callbacks.exception_type(exception)?)?;
                    exception_type = Some(object_type);
                    object_type
                }
            };
            let catch_type =
                TypeDescriptor::new(memory, callbacks.resolve_type_symbol(clause.type_symbol)?)?;
            is_instance_of_class(&object_type, &catch_type)?
        } else {
            let filter = clause.filter_address(code_start);
            let matched = funclet_result!(
                callbacks.call_filter_funclet(exception, filter, shadow_stack),
                ExceptionDuringFilter
            )?;
            rt_trace!(FUNCLETS, TraceEvent::FilterInvoked { filter, matched });
            matched
        };

        if matched {
            return Ok(Some(FirstPassHandler {
                handler_address: clause.handler_address(code_start),
                try_region_idx: cur_idx,
            }));
        }
    }

    Ok(None)
}

/// Run the finally and fault funclets of one frame whose try regions start at
/// `idx_try_landing_start`.
///
/// Only clauses below `idx_limit` are considered, so the region that owns the handler and the
/// regions around it are left alone. Returns the number of funclets run.
///
/// # Errors
///
/// Returns [`Error::FailFast`] with [`FailFastReason::ExceptionDuringUnwind`] if a funclet fails,
/// and the decoding error if the clause table is malformed.
pub fn invoke_second_pass<C: ExceptionCallbacks + ?Sized>(
    callbacks: &mut C,
    idx_start: u32,
    idx_try_landing_start: u32,
    clauses: EHClauseIterator<'_>,
    idx_limit: u32,
    shadow_stack: u64,
    code_start: u64,
) -> Result<u32> {
    run_second_pass(
        callbacks,
        idx_start,
        idx_try_landing_start,
        None,
        clauses,
        idx_limit,
        shadow_stack,
        code_start,
    )
}

/// [`invoke_second_pass`], optionally restricted to try regions containing `containing`.
fn run_second_pass<C: ExceptionCallbacks + ?Sized>(
    callbacks: &mut C,
    idx_start: u32,
    idx_try_landing_start: u32,
    containing: Option<u32>,
    clauses: EHClauseIterator<'_>,
    idx_limit: u32,
    shadow_stack: u64,
    code_start: u64,
) -> Result<u32> {
    let mut resume = ResumeSkip::new(idx_start);
    let mut invoked = 0;

    for (cur_idx, clause) in (0..idx_limit).zip(clauses) {
        let clause = clause?;
        if resume.skip(cur_idx, &clause) {
            continue;
        }

        if clause.kind != ClauseKind::Fault
            || !clause.try_starts_at(idx_try_landing_start)
            || containing.is_some_and(|offset| !clause.contains_code_offset(offset))
        {
            continue;
        }

        let handler = clause.handler_address(code_start);
        rt_trace!(
            FUNCLETS,
            TraceEvent::FinallyInvoked {
                handler,
                landing: idx_try_landing_start,
            }
        );
        funclet_result!(
            callbacks.call_finally_funclet(handler, shadow_stack),
            ExceptionDuringUnwind
        )?;
        invoked += 1;
    }

    Ok(invoked)
}

/// Distinct try starts of the regions below `idx_limit` that contain `offset`, innermost first.
fn landing_points(clauses: EHClauseIterator<'_>, offset: u32, idx_limit: u32) -> Result<Vec<u32>> {
    let mut landings = Vec::new();
    for (_, clause) in (0..idx_limit).zip(clauses) {
        let clause = clause?;
        if clause.contains_code_offset(offset) && !landings.contains(&clause.try_start_offset) {
            landings.push(clause.try_start_offset);
        }
    }
    Ok(landings)
}

enum SearchOutcome {
    Found {
        frame_index: usize,
        frame: FrameInfo,
        handler: FirstPassHandler,
    },
    Unhandled {
        frames: usize,
    },
}

/// Whole-stack dispatcher for one thread.
///
/// # Examples
///
/// ```rust,ignore
/// let mut dispatcher = ExceptionDispatcher::new(&memory, callbacks);
/// let transfer = dispatcher.dispatch(&mut walker, exception, MAX_TRY_REGION_IDX)?;
/// jump_to(transfer.handler_address, transfer.frame);
/// ```
#[derive(Debug)]
pub struct ExceptionDispatcher<'m, C: ExceptionCallbacks> {
    memory: &'m AddressSpace,
    callbacks: C,
    state: DispatchState,
}

impl<'m, C: ExceptionCallbacks> ExceptionDispatcher<'m, C> {
    /// Dispatcher over the clause tables and descriptors in `memory`
    pub fn new(memory: &'m AddressSpace, callbacks: C) -> Self {
        ExceptionDispatcher {
            memory,
            callbacks,
            state: DispatchState::Idle,
        }
    }

    /// Phase of the current or last dispatch
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// The callbacks
    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// The callbacks, mutably
    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// Give back the callbacks
    pub fn into_callbacks(self) -> C {
        self.callbacks
    }

    fn enter(&mut self, next: DispatchState) {
        self.state = self.state.transition(next);
    }

    /// Abandon the dispatch after a fatal error
    fn abort(&mut self, error: Error) -> Error {
        self.state = DispatchState::Idle;
        error
    }

    /// Dispatch `exception` thrown in the innermost frame of `walker`.
    ///
    /// `resume_idx` is the clause index the throw frame resumes after, [`MAX_TRY_REGION_IDX`]
    /// for a fresh throw. On success every finally between the throw site and the handler has
    /// run and the returned transfer names the handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnhandledException`] if no frame catches the exception,
    /// [`Error::FailFast`] if a funclet fails or the second walk does not retrace the first,
    /// and decoding errors for malformed clause tables or descriptors. Every error is fatal.
    pub fn dispatch<W: StackWalker + ?Sized>(
        &mut self,
        walker: &mut W,
        exception: ObjectRef,
        resume_idx: u32,
    ) -> Result<HandlerTransfer> {
        if self.state.is_terminal() {
            self.enter(DispatchState::Idle);
        }
        self.enter(DispatchState::SearchingHandler);
        rt_trace!(
            DISPATCH,
            TraceEvent::DispatchBegin {
                exception: exception.address(),
                resume_idx,
            }
        );

        let (frame_index, frame, handler) = match self.search(walker, exception, resume_idx) {
            Ok(SearchOutcome::Found {
                frame_index,
                frame,
                handler,
            }) => (frame_index, frame, handler),
            Ok(SearchOutcome::Unhandled { frames }) => {
                self.enter(DispatchState::Unhandled);
                rt_trace!(
                    DISPATCH,
                    TraceEvent::Unhandled {
                        exception: exception.address(),
                        frames: frames as u32,
                    }
                );
                return Err(Error::UnhandledException { exception, frames });
            }
            Err(error) => return Err(self.abort(error)),
        };

        self.enter(DispatchState::HandlerFound);
        rt_trace!(
            DISPATCH,
            TraceEvent::HandlerFound {
                frame: frame_index as u32,
                handler: handler.handler_address,
                try_region_idx: handler.try_region_idx,
            }
        );

        self.enter(DispatchState::RunningUnwindHandlers);
        if let Err(error) = self.unwind(walker, resume_idx, frame_index, &frame, handler) {
            return Err(self.abort(error));
        }

        self.enter(DispatchState::TransferredToHandler);
        rt_trace!(
            DISPATCH,
            TraceEvent::HandlerTransfer {
                frame: frame_index as u32,
                handler: handler.handler_address,
            }
        );
        Ok(HandlerTransfer {
            frame_index,
            frame,
            handler_address: handler.handler_address,
            try_region_idx: handler.try_region_idx,
            exception,
        })
    }

    fn search<W: StackWalker + ?Sized>(
        &mut self,
        walker: &mut W,
        exception: ObjectRef,
        resume_idx: u32,
    ) -> Result<SearchOutcome> {
        let mut frames = StackFrameIterator::new(walker);
        let mut more = frames.init()?;

        while more {
            let Some(frame) = frames.frame().copied() else {
                break;
            };
            rt_trace!(
                DISPATCH,
                TraceEvent::FrameSearched {
                    frame: frames.frame_index() as u32,
                    control_pc: frame.control_pc,
                    offset: frame.code_offset,
                }
            );

            if frame.has_eh_info() {
                let idx_start = if frames.frame_index() == 0 {
                    resume_idx
                } else {
                    MAX_TRY_REGION_IDX
                };
                let clauses = EHClauseIterator::new(self.memory.tail_from(frame.eh_info)?)?;
                if let Some(handler) = find_first_pass_handler(
                    self.memory,
                    &mut self.callbacks,
                    exception,
                    idx_start,
                    frame.code_offset,
                    frame.shadow_stack,
                    frame.code_start,
                    clauses,
                )? {
                    frames.set_try_region_idx(handler.try_region_idx);
                    return Ok(SearchOutcome::Found {
                        frame_index: frames.frame_index(),
                        frame,
                        handler,
                    });
                }
            }

            more = frames.next()?;
        }

        Ok(SearchOutcome::Unhandled {
            frames: frames.frame_index(),
        })
    }

    fn unwind<W: StackWalker + ?Sized>(
        &mut self,
        walker: &mut W,
        resume_idx: u32,
        handler_frame_index: usize,
        handler_frame: &FrameInfo,
        handler: FirstPassHandler,
    ) -> Result<()> {
        let mut frames = StackFrameIterator::new(walker);
        if !frames.init()? {
            return Err(Error::FailFast(FailFastReason::CorruptedStackWalk));
        }

        loop {
            let Some(frame) = frames.frame().copied() else {
                return Err(Error::FailFast(FailFastReason::CorruptedStackWalk));
            };
            let index = frames.frame_index();
            let in_handler_frame = index == handler_frame_index;

            if frame.has_eh_info() {
                let idx_limit = if in_handler_frame {
                    handler.try_region_idx
                } else {
                    MAX_TRY_REGION_IDX
                };
                let idx_start = if index == 0 {
                    resume_idx
                } else {
                    MAX_TRY_REGION_IDX
                };
                frames.set_try_region_idx(idx_limit);

                let table = self.memory.tail_from(frame.eh_info)?;
                let landings =
                    landing_points(EHClauseIterator::new(table)?, frame.code_offset, idx_limit)?;
                for landing in landings {
                    run_second_pass(
                        &mut self.callbacks,
                        idx_start,
                        landing,
                        Some(frame.code_offset),
                        EHClauseIterator::new(table)?,
                        idx_limit,
                        frame.shadow_stack,
                        frame.code_start,
                    )?;
                }
            }

            if in_handler_frame {
                if frame != *handler_frame {
                    return Err(Error::FailFast(FailFastReason::CorruptedStackWalk));
                }
                return Ok(());
            }

            if !frames.next()? {
                return Err(Error::FailFast(FailFastReason::CorruptedStackWalk));
            }
        }
    }
}
