//! Lock-free stacks for `no_std`.
//!
//! - [`lfstack::ConcurrentStack`] frees nodes through split reference
//!   counting: the head carries an external count of readers and each node
//!   an internal one, so the last reader frees the node.
//! - [`pending::PendingStack`] counts threads inside `pop` and defers
//!   deletion to a pending list while more than one is present.
//!
//! Build with `RUSTFLAGS="--cfg loom"` to run the model checks under `tests/`,
//! and enable the `tracing` feature to emit trace events from push and pop.
#![no_std]

extern crate alloc;

macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        tracing::trace!($($arg)*);
    };
}

mod counted;
mod heap;

pub mod error;
pub mod lfstack;
pub mod pending;

pub use error::AllocError;
pub use lfstack::ConcurrentStack;
pub use pending::PendingStack;

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(all(test, not(loom)))]
mod tests {
    use crate::{lfstack, pending};
    use core::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::vec::Vec;

    const NUM_LOOP: usize = 100000;
    const NUM_THREADS: usize = 4;

    #[test]
    fn test_lfstack() {
        let stack = Arc::new(lfstack::ConcurrentStack::<usize>::new());
        let mut v = Vec::new();

        for i in 0..NUM_THREADS {
            let stack0 = stack.clone();
            let t = std::thread::spawn(move || {
                if i & 1 == 0 {
                    for j in 0..NUM_LOOP {
                        let k = i * NUM_LOOP + j;
                        stack0.push(k);
                    }
                } else {
                    for _ in 0..NUM_LOOP {
                        loop {
                            if stack0.try_pop().is_some() {
                                break;
                            }
                        }
                    }
                }
            });
            v.push(t);
        }

        for t in v {
            t.join().unwrap();
        }

        assert_eq!(stack.try_pop(), None);
        assert_eq!(stack.live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_lfstack_reclaims_contended_nodes() {
        let stack = Arc::new(lfstack::ConcurrentStack::<usize>::new());
        let mut v = Vec::new();

        // few elements, many poppers: most pops lose the unlink race
        for i in 0..NUM_THREADS * 2 {
            let stack0 = stack.clone();
            let t = std::thread::spawn(move || {
                for j in 0..NUM_LOOP / 10 {
                    if j % 2 == 0 {
                        stack0.push(i);
                    }
                    stack0.try_pop();
                }
            });
            v.push(t);
        }

        for t in v {
            t.join().unwrap();
        }

        let left = stack.drain().count();
        assert!(left <= NUM_THREADS * 2 * NUM_LOOP / 20);
        assert_eq!(stack.live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_lfstack_drop_frees_remaining() {
        let payload = Arc::new(0usize);
        {
            let stack = lfstack::ConcurrentStack::new();
            for _ in 0..16 {
                stack.push(payload.clone());
            }
            assert!(stack.try_pop().is_some());
            assert_eq!(stack.live.load(Ordering::Relaxed), 15);
            assert_eq!(Arc::strong_count(&payload), 16);
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_pending_stack() {
        let stack = Arc::new(pending::PendingStack::<usize>::new());
        let mut v = Vec::new();

        for i in 0..NUM_THREADS {
            let stack0 = stack.clone();
            let t = std::thread::spawn(move || {
                if i & 1 == 0 {
                    for j in 0..NUM_LOOP {
                        let k = i * NUM_LOOP + j;
                        stack0.push(k);
                    }
                } else {
                    for _ in 0..NUM_LOOP {
                        loop {
                            if stack0.try_pop().is_some() {
                                break;
                            }
                        }
                    }
                }
            });
            v.push(t);
        }

        for t in v {
            t.join().unwrap();
        }

        assert_eq!(stack.try_pop(), None);
        assert!(stack.is_empty());
    }
}
