//! Lifecycle of one exception dispatch.

use strum::{Display, EnumIter};

/// Phase of an exception dispatch.
///
/// ```text
/// Idle -> SearchingHandler -> HandlerFound -> RunningUnwindHandlers -> TransferredToHandler
///                          \-> Unhandled
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum DispatchState {
    /// No exception in flight
    #[default]
    Idle,
    /// First pass: walking frames for a handler
    SearchingHandler,
    /// First pass selected a handler
    HandlerFound,
    /// First pass reached the end of the stack
    Unhandled,
    /// Second pass: running finally and fault funclets
    RunningUnwindHandlers,
    /// Control was handed to the handler
    TransferredToHandler,
}

impl DispatchState {
    /// Returns true if the dispatcher may move from `self` to `next`
    #[must_use]
    pub fn can_transition_to(self, next: DispatchState) -> bool {
        matches!(
            (self, next),
            (DispatchState::Idle, DispatchState::SearchingHandler)
                | (
                    DispatchState::SearchingHandler,
                    DispatchState::HandlerFound | DispatchState::Unhandled
                )
                | (
                    DispatchState::HandlerFound,
                    DispatchState::RunningUnwindHandlers
                )
                | (
                    DispatchState::RunningUnwindHandlers,
                    DispatchState::TransferredToHandler
                )
                | (
                    DispatchState::Unhandled | DispatchState::TransferredToHandler,
                    DispatchState::Idle
                )
        )
    }

    /// Move to `next`
    ///
    /// An illegal transition is a dispatcher bug and trips a debug assertion.
    #[must_use]
    pub fn transition(self, next: DispatchState) -> DispatchState {
        debug_assert!(
            self.can_transition_to(next),
            "illegal dispatch transition {self} -> {next}"
        );
        next
    }

    /// Returns true once the dispatch has finished, either way
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchState::Unhandled | DispatchState::TransferredToHandler
        )
    }
}
