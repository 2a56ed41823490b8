//! Stack frames as seen by the exception dispatcher.
//!
//! The platform unwinder is a collaborator: it reports one [`FrameInfo`] per managed frame
//! through the [`StackWalker`] trait. [`ShadowStackWalker`] replays a recorded frame list, which
//! is what targets with an explicit shadow stack (and the tests) use.

use crate::Result;

/// One managed frame on the stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FrameInfo {
    /// Return address, or the faulting instruction of the throw frame
    pub control_pc: u64,
    /// Control PC before any adjustment made by the unwinder
    pub original_control_pc: u64,
    /// Frame pointer
    pub frame_pointer: u64,
    /// Stack pointer of the register set snapshot
    pub stack_pointer: u64,
    /// Shadow stack pointer handed to funclets
    pub shadow_stack: u64,
    /// Start of the method's code; handler and filter offsets are relative to it
    pub code_start: u64,
    /// Address of the method's clause table, 0 when the method has none
    pub eh_info: u64,
    /// Code offset the frame is stopped at, matched against try regions
    pub code_offset: u32,
}

impl FrameInfo {
    /// A frame of the method at `code_start`, stopped at `code_offset`
    #[must_use]
    pub fn new(code_start: u64, code_offset: u32, eh_info: u64) -> Self {
        let control_pc = code_start + u64::from(code_offset);
        FrameInfo {
            control_pc,
            original_control_pc: control_pc,
            code_start,
            eh_info,
            code_offset,
            ..Default::default()
        }
    }

    /// Set the stack, frame and shadow stack pointers
    #[must_use]
    pub fn with_stack(mut self, stack_pointer: u64, frame_pointer: u64, shadow_stack: u64) -> Self {
        self.stack_pointer = stack_pointer;
        self.frame_pointer = frame_pointer;
        self.shadow_stack = shadow_stack;
        self
    }

    /// Returns true if the method has exception clauses
    #[must_use]
    pub fn has_eh_info(&self) -> bool {
        self.eh_info != 0
    }
}

/// Source of managed frames, innermost first.
pub trait StackWalker {
    /// Position on the throw site and return its frame, `None` for an empty stack.
    ///
    /// Calling `init` again restarts the walk; the second dispatch pass relies on that.
    ///
    /// # Errors
    ///
    /// Returns an error if the unwinder cannot start the walk.
    fn init(&mut self) -> Result<Option<FrameInfo>>;

    /// Step to the caller of the current frame, `None` past the outermost frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the unwinder cannot step.
    fn next(&mut self) -> Result<Option<FrameInfo>>;
}

/// [`StackWalker`] over a recorded list of frames.
#[derive(Clone, Debug, Default)]
pub struct ShadowStackWalker {
    frames: Vec<FrameInfo>,
    position: usize,
}

impl ShadowStackWalker {
    /// Walker over `frames`, innermost first
    #[must_use]
    pub fn new(frames: Vec<FrameInfo>) -> Self {
        ShadowStackWalker {
            frames,
            position: 0,
        }
    }

    /// Number of recorded frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if no frame is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl StackWalker for ShadowStackWalker {
    fn init(&mut self) -> Result<Option<FrameInfo>> {
        self.position = 0;
        Ok(self.frames.first().copied())
    }

    fn next(&mut self) -> Result<Option<FrameInfo>> {
        if self.position >= self.frames.len() {
            return Ok(None);
        }
        self.position += 1;
        Ok(self.frames.get(self.position).copied())
    }
}

/// Cursor of one stack walk.
///
/// Tracks the current frame and the try-region index the dispatcher has reached in it. Created
/// per throw and advanced one frame at a time.
#[derive(Debug)]
pub struct StackFrameIterator<'w, W: StackWalker + ?Sized> {
    walker: &'w mut W,
    current: Option<FrameInfo>,
    frame_index: usize,
    try_region_idx: u32,
}

impl<'w, W: StackWalker + ?Sized> StackFrameIterator<'w, W> {
    /// Cursor over `walker`, not yet positioned
    pub fn new(walker: &'w mut W) -> Self {
        StackFrameIterator {
            walker,
            current: None,
            frame_index: 0,
            try_region_idx: u32::MAX,
        }
    }

    /// Position on the throw site. Returns false for an empty stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the walker fails.
    pub fn init(&mut self) -> Result<bool> {
        self.current = self.walker.init()?;
        self.frame_index = 0;
        self.try_region_idx = u32::MAX;
        Ok(self.current.is_some())
    }

    /// Step to the caller. Returns false past the outermost frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the walker fails.
    pub fn next(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        self.current = self.walker.next()?;
        self.frame_index += 1;
        self.try_region_idx = u32::MAX;
        Ok(self.current.is_some())
    }

    /// The current frame
    #[must_use]
    pub fn frame(&self) -> Option<&FrameInfo> {
        self.current.as_ref()
    }

    /// Frames stepped over since the throw site
    #[must_use]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Control PC of the current frame, 0 when the walk is over
    #[must_use]
    pub fn control_pc(&self) -> u64 {
        self.current.map_or(0, |f| f.control_pc)
    }

    /// Original control PC of the current frame, 0 when the walk is over
    #[must_use]
    pub fn original_control_pc(&self) -> u64 {
        self.current.map_or(0, |f| f.original_control_pc)
    }

    /// Frame pointer of the current frame, 0 when the walk is over
    #[must_use]
    pub fn frame_pointer(&self) -> u64 {
        self.current.map_or(0, |f| f.frame_pointer)
    }

    /// Stack pointer of the current frame, 0 when the walk is over
    #[must_use]
    pub fn stack_pointer(&self) -> u64 {
        self.current.map_or(0, |f| f.stack_pointer)
    }

    /// Shadow stack pointer of the current frame, 0 when the walk is over
    #[must_use]
    pub fn shadow_stack(&self) -> u64 {
        self.current.map_or(0, |f| f.shadow_stack)
    }

    /// Try-region index reached in the current frame
    #[must_use]
    pub fn try_region_idx(&self) -> u32 {
        self.try_region_idx
    }

    /// Record the try-region index reached in the current frame
    pub fn set_try_region_idx(&mut self, idx: u32) {
        self.try_region_idx = idx;
    }
}
