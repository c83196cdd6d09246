//! Lock-free stack reclaiming through a pop counter and a pending list.
//!
//! A popped node is deleted right away only if its popper was alone inside
//! `try_pop`. Otherwise it is chained onto a pending list, which the next
//! popper that finds itself alone deletes wholesale.

use crate::{error::AllocError, heap};
use core::{
    fmt,
    mem::ManuallyDrop,
    ptr::{self, null_mut},
};

#[cfg(not(loom))]
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node<T> {
    data: ManuallyDrop<T>,
    next: AtomicPtr<Node<T>>,
}

/// A lock-free LIFO stack with deferred, batch reclamation.
///
/// Pending nodes are kept until some popper finds no other pop in flight,
/// so a stack that is popped continuously from overlapping threads keeps
/// its detached nodes until contention drops or the stack is dropped.
pub struct PendingStack<T> {
    head: AtomicPtr<Node<T>>,
    pops_in_flight: AtomicUsize,
    pending: AtomicPtr<Node<T>>,
}

impl<T> PendingStack<T> {
    pub fn new() -> PendingStack<T> {
        PendingStack {
            head: AtomicPtr::new(null_mut()),
            pops_in_flight: AtomicUsize::new(0),
            pending: AtomicPtr::new(null_mut()),
        }
    }

    /// Push `value` on top of the stack.
    ///
    /// Aborts through the global allocation error handler if no memory is
    /// left for the node.
    pub fn push(&self, value: T) {
        if let Err((_, err)) = self.try_push(value) {
            heap::exhausted(err);
        }
    }

    /// Push `value`, handing it back if its node cannot be allocated.
    pub fn try_push(&self, value: T) -> Result<(), (T, AllocError)> {
        let ptr = heap::try_alloc(Node {
            data: ManuallyDrop::new(value),
            next: AtomicPtr::new(null_mut()),
        })
        .map_err(|(node, err)| (ManuallyDrop::into_inner(node.data), err))?;

        let node = unsafe { &*ptr };
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, ptr, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        trace!(node = ?ptr, "PendingStack::push");
        Ok(())
    }

    /// Pop the top value, or `None` if the stack was empty when observed.
    pub fn try_pop(&self) -> Option<T> {
        self.pops_in_flight.fetch_add(1, Ordering::AcqRel);

        // nothing is deleted while we are counted, so old_head stays readable
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            if old_head.is_null() {
                self.pops_in_flight.fetch_sub(1, Ordering::AcqRel);
                return None;
            }

            let next = unsafe { (*old_head).next.load(Ordering::Acquire) };
            match self
                .head
                .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => old_head = actual,
            }
        }

        let data = unsafe { ptr::read(&(*old_head).data) };
        trace!(node = ?old_head, "PendingStack::try_pop -> unlinked");
        unsafe { self.try_reclaim(old_head) };

        Some(ManuallyDrop::into_inner(data))
    }

    /// `true` if the stack held no element at the moment of the load.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Pop until the stack is observed empty.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain { stack: self }
    }

    /// Retire `old_head` and leave `try_pop`.
    ///
    /// # Safety
    ///
    /// `old_head` must be unlinked by the caller with its payload moved out.
    unsafe fn try_reclaim(&self, old_head: *mut Node<T>) {
        if self.pops_in_flight.load(Ordering::Acquire) == 1 {
            // alone: claim the whole pending list
            let nodes = self.pending.swap(null_mut(), Ordering::AcqRel);

            if self.pops_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                // still alone, nobody can hold a pointer into the list
                delete_nodes(nodes);
            } else if !nodes.is_null() {
                // another popper showed up and may be reading them
                trace!(nodes = ?nodes, "PendingStack: re-chain pending list");
                self.chain_pending_list(nodes);
            }

            // no other popper was in flight when old_head was unlinked
            heap::free(old_head);
        } else {
            self.chain_pending_nodes(old_head, old_head);
            self.pops_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn chain_pending_list(&self, first: *mut Node<T>) {
        let mut last = first;
        loop {
            let next = unsafe { (*last).next.load(Ordering::Acquire) };
            if next.is_null() {
                break;
            }
            last = next;
        }

        self.chain_pending_nodes(first, last);
    }

    fn chain_pending_nodes(&self, first: *mut Node<T>, last: *mut Node<T>) {
        let last = unsafe { &*last };
        let mut pending = self.pending.load(Ordering::Acquire);
        loop {
            last.next.store(pending, Ordering::Release);
            match self
                .pending
                .compare_exchange(pending, first, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => pending = actual,
            }
        }
    }
}

/// Free a pending chain whose payloads were already moved out.
///
/// # Safety
///
/// No thread may still hold a pointer into the chain.
unsafe fn delete_nodes<T>(mut node: *mut Node<T>) {
    if !node.is_null() {
        trace!(first = ?node, "PendingStack: delete pending list");
    }

    while !node.is_null() {
        let next = (*node).next.load(Ordering::Relaxed);
        heap::free(node);
        node = next;
    }
}

impl<T> Default for PendingStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PendingStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStack")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("pops_in_flight", &self.pops_in_flight.load(Ordering::Relaxed))
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Drop for PendingStack<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            unsafe {
                let next = (*node).next.load(Ordering::Relaxed);
                ManuallyDrop::drop(&mut (*node).data);
                heap::free(node);
                node = next;
            }
        }

        unsafe { delete_nodes(self.pending.load(Ordering::Relaxed)) };
    }
}

unsafe impl<T: Send> Sync for PendingStack<T> {}
unsafe impl<T: Send> Send for PendingStack<T> {}

/// Iterator returned by [`PendingStack::drain`].
pub struct Drain<'a, T> {
    stack: &'a PendingStack<T>,
}

impl<'a, T> Iterator for Drain<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.stack.try_pop()
    }
}

impl<'a, T> fmt::Debug for Drain<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drain").field("stack", self.stack).finish()
    }
}
