//! Lock-free stack with split reference counting.
//!
//! The head slot pairs the top node with an *external* count of threads that
//! have claimed the right to dereference it. Every node also carries an
//! *internal* count. When a popper unlinks a node it folds the external claims
//! into the internal count, and whoever retires the last claim frees the node.
//! No node is freed while a thread may still read it, and each node is freed
//! exactly once.

use crate::{
    counted::{AtomicCountedHead, CountedHead},
    error::AllocError,
    heap,
};
use core::{fmt, mem::ManuallyDrop, ptr};

#[cfg(not(loom))]
use core::sync::atomic::{AtomicI64, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicI64, Ordering};

struct Node<T> {
    data: ManuallyDrop<T>,
    next: CountedHead<Node<T>>,
    internal: AtomicI64,
}

/// A lock-free LIFO stack.
///
/// `push` and `try_pop` never block; a thread only retries its own
/// compare-and-swap when another thread changed the head first.
///
/// ```
/// use countedstack::lfstack::ConcurrentStack;
///
/// let stack = ConcurrentStack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.try_pop(), Some(2));
/// assert_eq!(stack.try_pop(), Some(1));
/// assert_eq!(stack.try_pop(), None);
/// ```
pub struct ConcurrentStack<T> {
    head: AtomicCountedHead<Node<T>>,

    #[cfg(all(test, not(loom)))]
    pub(crate) live: core::sync::atomic::AtomicIsize,
}

impl<T> ConcurrentStack<T> {
    pub fn new() -> ConcurrentStack<T> {
        ConcurrentStack {
            head: AtomicCountedHead::new(CountedHead::null()),

            #[cfg(all(test, not(loom)))]
            live: core::sync::atomic::AtomicIsize::new(0),
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
            next: CountedHead::null(),
            internal: AtomicI64::new(0),
        })
        .map_err(|(node, err)| (ManuallyDrop::into_inner(node.data), err))?;
        self.note_alloc();

        // the chain itself holds one claim
        let new_head = CountedHead::new(ptr, 1);

        // ptr is unpublished until the CAS succeeds, so this thread owns next
        let mut next = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*ptr).next = next };
            match self
                .head
                .compare_exchange(next, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => next = actual,
            }
        }

        trace!(node = ?ptr, "ConcurrentStack::push");
        Ok(())
    }

    /// Pop the top value, or `None` if the stack was empty when observed.
    pub fn try_pop(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            old_head = self.increase_head_count(old_head)?;
            let ptr = old_head.node;

            // our claim keeps *ptr alive, and next never changes once published
            let next = unsafe { (*ptr).next };

            match self
                .head
                .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // unlinked: nobody else can reach the payload any more
                    let data = unsafe { ptr::read(&(*ptr).data) };
                    trace!(
                        node = ?ptr,
                        external = old_head.external,
                        "ConcurrentStack::try_pop -> unlinked"
                    );

                    // minus our own claim and the one held by the chain
                    let count_increase = old_head.external as i64 - 2;
                    let internal = unsafe { &(*ptr).internal };
                    if internal.fetch_add(count_increase, Ordering::AcqRel) == -count_increase {
                        unsafe { self.reclaim(ptr) };
                    }

                    return Some(ManuallyDrop::into_inner(data));
                }
                Err(actual) => {
                    // lost the race, drop our claim
                    let internal = unsafe { &(*ptr).internal };
                    if internal.fetch_sub(1, Ordering::AcqRel) == 1 {
                        unsafe { self.reclaim(ptr) };
                    }
                    old_head = actual;
                }
            }
        }
    }

    /// `true` if the stack held no element at the moment of the load.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).node.is_null()
    }

    /// Pop until the stack is observed empty.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain { stack: self }
    }

    /// Claim the node currently at the head.
    ///
    /// Returns the head as it is after our increment, or `None` if the
    /// stack is empty.
    fn increase_head_count(
        &self,
        mut old_head: CountedHead<Node<T>>,
    ) -> Option<CountedHead<Node<T>>> {
        loop {
            if old_head.node.is_null() {
                return None;
            }

            let new_head = old_head.claimed();
            match self
                .head
                .compare_exchange(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(new_head),
                Err(actual) => old_head = actual,
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be unlinked, its payload moved out, and the caller must
    /// have retired its last claim.
    unsafe fn reclaim(&self, ptr: *mut Node<T>) {
        trace!(node = ?ptr, "ConcurrentStack: reclaim");
        self.note_free();
        heap::free(ptr);
    }

    #[cfg(all(test, not(loom)))]
    fn note_alloc(&self) {
        self.live.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(all(test, not(loom)))]
    fn note_free(&self) {
        let prev = self.live.fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
        assert!(prev > 0, "stack node freed twice");
    }

    #[cfg(not(all(test, not(loom))))]
    fn note_alloc(&self) {}

    #[cfg(not(all(test, not(loom))))]
    fn note_free(&self) {}
}

impl<T> Default for ConcurrentStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ConcurrentStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentStack")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Drop for ConcurrentStack<T> {
    fn drop(&mut self) {
        // no claims are outstanding once we have &mut self
        let mut node = self.head.load(Ordering::Relaxed).node;
        while !node.is_null() {
            unsafe {
                let next = (*node).next.node;
                ManuallyDrop::drop(&mut (*node).data);
                self.reclaim(node);
                node = next;
            }
        }
    }
}

unsafe impl<T: Send> Sync for ConcurrentStack<T> {}
unsafe impl<T: Send> Send for ConcurrentStack<T> {}

/// Iterator returned by [`ConcurrentStack::drain`].
pub struct Drain<'a, T> {
    stack: &'a ConcurrentStack<T>,
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

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_lost_unlinks_do_not_stall_bottom_node() {
        const LOST: usize = u16::MAX as usize + 10;

        let stack = ConcurrentStack::new();
        stack.push(0);

        for _ in 0..LOST {
            // claim the bottom node, then lose the unlink to a push
            let claimed = stack
                .increase_head_count(stack.head.load(Ordering::Acquire))
                .unwrap();
            let ptr = claimed.node;
            stack.push(1);

            let next = unsafe { (*ptr).next };
            assert!(stack
                .head
                .compare_exchange(claimed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err());
            assert_ne!(unsafe { &(*ptr).internal }.fetch_sub(1, Ordering::AcqRel), 1);

            assert_eq!(stack.try_pop(), Some(1));
        }

        // every lost race stays in the count until the node is unlinked
        assert_eq!(stack.head.load(Ordering::Acquire).external, LOST as u64 + 1);

        assert_eq!(stack.try_pop(), Some(0));
        assert_eq!(stack.try_pop(), None);
        assert_eq!(stack.live.load(core::sync::atomic::Ordering::Relaxed), 0);
    }
}
