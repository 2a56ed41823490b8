//! Managed thread ids, recycled when threads die so the set of live ids stays compact.
//!
//! Live ids are tracked in a binary tree of immutable nodes. Each node owns 32 consecutive ids
//! in a bitmap; its left subtree owns the ids below them and its right subtree the ids above.
//! An update rebuilds the path from the root to the touched node and publishes the new root with
//! a compare-and-swap, so allocation and recycling never take a lock.
//!
//! Nodes live in an append-only [`boxcar::Vec`] arena and are addressed by index. Indices are
//! never reused, which keeps the root CAS free of ABA problems. Superseded nodes stay in the
//! arena until the dispenser is dropped.
//!
//! Id 0 ([`ID_NONE`]) is reserved by the empty tree and never handed out, so the first id is 1
//! ([`ID_MAIN_THREAD`]).

use std::{
    cell::OnceCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        OnceLock,
    },
};

use crate::{Error, FailFastReason, Result};

#[cfg(feature = "trace")]
use crate::utils::trace::TraceEvent;

/// Not a thread id
pub const ID_NONE: u32 = 0;

/// Id of the first thread to ask for one
pub const ID_MAIN_THREAD: u32 = 1;

const BITS_PER_NODE: u32 = 32;

/// Ids stay representable as a signed 32-bit managed int.
const MAX_DISPENSER_SIZE: u32 = i32::MAX as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IdNode {
    left: Option<usize>,
    right: Option<usize>,
    /// Ids tracked by this node and its subtrees
    used: u32,
    /// Ids this node and its subtrees can track
    size: u32,
    bitmap: u32,
}

impl IdNode {
    /// A node of `size` holding only its own first bitmap id
    const fn leaf(size: u32) -> Self {
        IdNode {
            left: None,
            right: None,
            used: 1,
            size,
            bitmap: 1,
        }
    }

    fn child_size(&self) -> u32 {
        debug_assert!(self.size / 2 >= BITS_PER_NODE / 2);
        self.size / 2 - BITS_PER_NODE / 2
    }
}

/// Lock-free dispenser of compact thread ids.
///
/// # Examples
///
/// ```rust
/// use eeruntime::runtime::threadid::{ManagedThreadIdDispenser, ID_MAIN_THREAD};
///
/// let dispenser = ManagedThreadIdDispenser::new();
/// let first = dispenser.allocate_id()?;
/// assert_eq!(first, ID_MAIN_THREAD);
/// let second = dispenser.allocate_id()?;
/// dispenser.recycle_id(second)?;
/// assert_eq!(dispenser.allocate_id()?, second);
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Debug)]
pub struct ManagedThreadIdDispenser {
    nodes: boxcar::Vec<IdNode>,
    root: AtomicUsize,
}

impl Default for ManagedThreadIdDispenser {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedThreadIdDispenser {
    /// Dispenser with no live ids
    #[must_use]
    pub fn new() -> Self {
        let nodes = boxcar::Vec::new();
        let root = nodes.push(IdNode::leaf(BITS_PER_NODE));
        ManagedThreadIdDispenser {
            nodes,
            root: AtomicUsize::new(root),
        }
    }

    fn node(&self, index: usize) -> Result<IdNode> {
        self.nodes
            .get(index)
            .copied()
            .ok_or(Error::FailFast(FailFastReason::InternalError))
    }

    /// Hand out a free id.
    ///
    /// Free bits of a node's own bitmap are used before its subtrees, so ids are compact but not
    /// always the lowest free one.
    ///
    /// # Errors
    ///
    /// Returns [`FailFastReason::ThreadIdExhausted`] when the id space cannot grow any further.
    pub fn allocate_id(&self) -> Result<u32> {
        let mut prior = self.root.load(Ordering::Acquire);
        let mut attempts = 1u32;
        loop {
            let (updated, id) = self.allocate_in(prior)?;
            match self
                .root
                .compare_exchange(prior, updated, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug_assert_ne!(id, ID_NONE);
                    if attempts > 1 {
                        rt_trace!(THREADS, TraceEvent::ThreadIdContention { attempts });
                    }
                    rt_trace!(THREADS, TraceEvent::ThreadIdAllocated { id });
                    return Ok(id);
                }
                Err(current) => {
                    prior = current;
                    attempts = attempts.saturating_add(1);
                }
            }
        }
    }

    /// Return `id` to the pool. [`ID_NONE`] is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FailFastReason::InternalError`] if `id` is not live.
    pub fn recycle_id(&self, id: u32) -> Result<()> {
        if id == ID_NONE {
            return Ok(());
        }

        let mut prior = self.root.load(Ordering::Acquire);
        let mut attempts = 1u32;
        loop {
            let root = self.node(prior)?;
            if id >= root.size {
                return Err(Error::FailFast(FailFastReason::InternalError));
            }
            // The root always keeps the reserved id 0.
            let updated = self
                .recycle_in(prior, id)?
                .ok_or(Error::FailFast(FailFastReason::InternalError))?;
            match self
                .root
                .compare_exchange(prior, updated, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if attempts > 1 {
                        rt_trace!(THREADS, TraceEvent::ThreadIdContention { attempts });
                    }
                    rt_trace!(THREADS, TraceEvent::ThreadIdRecycled { id });
                    return Ok(());
                }
                Err(current) => {
                    prior = current;
                    attempts = attempts.saturating_add(1);
                }
            }
        }
    }

    /// Number of ids handed out and not recycled
    ///
    /// # Errors
    ///
    /// Returns an error only if the arena is inconsistent.
    pub fn live_ids(&self) -> Result<u32> {
        Ok(self.node(self.root.load(Ordering::Acquire))?.used - 1)
    }

    /// Number of ids the current tree can track before it has to grow
    ///
    /// # Errors
    ///
    /// Returns an error only if the arena is inconsistent.
    pub fn capacity(&self) -> Result<u32> {
        Ok(self.node(self.root.load(Ordering::Acquire))?.size)
    }

    /// Number of nodes ever created, including superseded ones
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.nodes.count()
    }

    /// Allocate in the subtree at `index`; returns the replacement subtree and the id.
    fn allocate_in(&self, index: usize) -> Result<(usize, u32)> {
        let node = self.node(index)?;

        if node.used == node.size {
            // Full: the old tree becomes the left child of a bigger root.
            let size = node
                .size
                .checked_mul(2)
                .and_then(|size| size.checked_add(BITS_PER_NODE))
                .filter(|size| *size <= MAX_DISPENSER_SIZE)
                .ok_or(Error::FailFast(FailFastReason::ThreadIdExhausted))?;
            let root = self.nodes.push(IdNode {
                left: Some(index),
                right: None,
                used: node.size + 1,
                size,
                bitmap: 1,
            });
            return Ok((root, node.size));
        }

        let child_size = node.child_size();
        let mut updated = IdNode {
            used: node.used + 1,
            ..node
        };

        let id = if node.bitmap != u32::MAX {
            let bit = (!node.bitmap).trailing_zeros();
            updated.bitmap |= 1 << bit;
            child_size + bit
        } else {
            debug_assert!(child_size > 0);
            match (node.left, node.right) {
                (None, _) => {
                    let left = IdNode::leaf(child_size);
                    updated.left = Some(self.nodes.push(left));
                    left.child_size()
                }
                (Some(_), None) => {
                    let right = IdNode::leaf(child_size);
                    updated.right = Some(self.nodes.push(right));
                    child_size + BITS_PER_NODE + right.child_size()
                }
                (Some(left), Some(right)) => {
                    if self.node(left)?.used < self.node(right)?.used {
                        let (left, id) = self.allocate_in(left)?;
                        updated.left = Some(left);
                        id
                    } else {
                        let (right, id) = self.allocate_in(right)?;
                        updated.right = Some(right);
                        id + child_size + BITS_PER_NODE
                    }
                }
            }
        };

        Ok((self.nodes.push(updated), id))
    }

    /// The id held by a subtree tracking exactly one, relative to the subtree.
    fn only_id(&self, node: &IdNode) -> Result<u32> {
        debug_assert_eq!(node.used, 1);
        let child_size = node.child_size();
        if node.bitmap != 0 {
            return Ok(child_size + node.bitmap.trailing_zeros());
        }
        match (node.left, node.right) {
            (Some(left), _) => self.only_id(&self.node(left)?),
            (None, Some(right)) => {
                Ok(child_size + BITS_PER_NODE + self.only_id(&self.node(right)?)?)
            }
            (None, None) => Err(Error::FailFast(FailFastReason::InternalError)),
        }
    }

    /// Recycle in the subtree at `index`; `None` when the subtree becomes empty.
    fn recycle_in(&self, index: usize, id: u32) -> Result<Option<usize>> {
        let node = self.node(index)?;
        debug_assert!(id < node.size);
        if node.used == 1 {
            if self.only_id(&node)? != id {
                return Err(Error::FailFast(FailFastReason::InternalError));
            }
            return Ok(None);
        }

        let child_size = node.child_size();
        let mut updated = IdNode {
            used: node.used - 1,
            ..node
        };

        if id < child_size {
            let left = node
                .left
                .ok_or(Error::FailFast(FailFastReason::InternalError))?;
            updated.left = self.recycle_in(left, id)?;
        } else {
            let id = id - child_size;
            if id < BITS_PER_NODE {
                if node.bitmap & (1 << id) == 0 {
                    return Err(Error::FailFast(FailFastReason::InternalError));
                }
                updated.bitmap &= !(1 << id);
            } else {
                let right = node
                    .right
                    .ok_or(Error::FailFast(FailFastReason::InternalError))?;
                updated.right = self.recycle_in(right, id - BITS_PER_NODE)?;
            }
        }

        Ok(Some(self.nodes.push(updated)))
    }
}

/// A live id, recycled when dropped.
#[derive(Debug)]
pub struct ManagedThreadId<'d> {
    id: u32,
    dispenser: &'d ManagedThreadIdDispenser,
}

impl<'d> ManagedThreadId<'d> {
    /// Take an id from `dispenser`
    ///
    /// # Errors
    ///
    /// Returns [`FailFastReason::ThreadIdExhausted`] when no id is left.
    pub fn new(dispenser: &'d ManagedThreadIdDispenser) -> Result<Self> {
        Ok(ManagedThreadId {
            id: dispenser.allocate_id()?,
            dispenser,
        })
    }

    /// The id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for ManagedThreadId<'_> {
    fn drop(&mut self) {
        let recycled = self.dispenser.recycle_id(self.id);
        debug_assert!(recycled.is_ok(), "thread id {} recycled twice", self.id);
    }
}

/// The process-wide dispenser behind [`current_managed_thread_id`]
pub fn global_dispenser() -> &'static ManagedThreadIdDispenser {
    static DISPENSER: OnceLock<ManagedThreadIdDispenser> = OnceLock::new();
    DISPENSER.get_or_init(ManagedThreadIdDispenser::new)
}

thread_local! {
    static CURRENT_THREAD_ID: OnceCell<ManagedThreadId<'static>> = const { OnceCell::new() };
}

/// Managed id of the calling thread, allocated on first use and recycled when the thread exits.
///
/// # Errors
///
/// Returns [`FailFastReason::ThreadIdExhausted`] when no id is left.
pub fn current_managed_thread_id() -> Result<u32> {
    CURRENT_THREAD_ID.with(|current| {
        if let Some(id) = current.get() {
            return Ok(id.id());
        }
        let handle = ManagedThreadId::new(global_dispenser())?;
        let id = handle.id();
        // Only this thread touches its cell.
        let _ = current.set(handle);
        Ok(id)
    })
}
