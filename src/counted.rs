//! A node pointer paired with an external reference count, swapped as one
//! double-width word.
//!
//! The low 64 bits hold the node address and the high 64 bits the count, so
//! any address is representable and the count cannot wrap in practice.
//! `portable_atomic::AtomicU128` compiles to `cmpxchg16b` on x86_64 and
//! `casp`/LL-SC pairs on aarch64.
//!
//! loom has no 128-bit atomics, so under `--cfg loom` the head is packed into
//! one `AtomicU64` instead: a 48-bit address and a 16-bit count, which is
//! plenty for the handful of operations a model runs.

use core::{fmt, marker::PhantomData, ptr::null_mut};

#[cfg(not(loom))]
use core::sync::atomic::Ordering;
#[cfg(not(loom))]
use portable_atomic::AtomicU128;

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(loom))]
type Word = u128;
#[cfg(loom)]
type Word = u64;

#[cfg(not(loom))]
const ADDR_BITS: u32 = 64;
#[cfg(loom)]
const ADDR_BITS: u32 = 48;

const ADDR_MASK: Word = (1 << ADDR_BITS) - 1;

pub(crate) struct CountedHead<N> {
    pub(crate) external: u64,
    pub(crate) node: *mut N,
}

impl<N> CountedHead<N> {
    pub(crate) fn new(node: *mut N, external: u64) -> CountedHead<N> {
        CountedHead { external, node }
    }

    pub(crate) fn null() -> CountedHead<N> {
        CountedHead::new(null_mut(), 0)
    }

    /// the same node with one more claim on it
    pub(crate) fn claimed(self) -> CountedHead<N> {
        CountedHead::new(self.node, self.external + 1)
    }

    fn pack(self) -> Word {
        let addr = self.node as usize as Word;
        debug_assert!(addr & !ADDR_MASK == 0, "node address out of range");
        debug_assert!((self.external as Word) < (1 << (Word::BITS - ADDR_BITS)));
        ((self.external as Word) << ADDR_BITS) | addr
    }

    fn unpack(bits: Word) -> CountedHead<N> {
        CountedHead {
            external: (bits >> ADDR_BITS) as u64,
            node: (bits & ADDR_MASK) as usize as *mut N,
        }
    }
}

impl<N> Clone for CountedHead<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedHead<N> {}

impl<N> PartialEq for CountedHead<N> {
    fn eq(&self, other: &Self) -> bool {
        self.external == other.external && self.node == other.node
    }
}

impl<N> Eq for CountedHead<N> {}

impl<N> fmt::Debug for CountedHead<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedHead")
            .field("external", &self.external)
            .field("node", &self.node)
            .finish()
    }
}

/// The shared slot a stack's head lives in.
pub(crate) struct AtomicCountedHead<N> {
    #[cfg(not(loom))]
    bits: AtomicU128,
    #[cfg(loom)]
    bits: AtomicU64,
    _phantom: PhantomData<*mut N>,
}

impl<N> AtomicCountedHead<N> {
    pub(crate) fn new(head: CountedHead<N>) -> AtomicCountedHead<N> {
        AtomicCountedHead {
            #[cfg(not(loom))]
            bits: AtomicU128::new(head.pack()),
            #[cfg(loom)]
            bits: AtomicU64::new(head.pack()),
            _phantom: PhantomData,
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> CountedHead<N> {
        CountedHead::unpack(self.bits.load(order))
    }

    /// Replace `current` with `new` if the slot still holds exactly `current`.
    ///
    /// On failure the value found in the slot is returned.
    pub(crate) fn compare_exchange(
        &self,
        current: CountedHead<N>,
        new: CountedHead<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedHead<N>, CountedHead<N>> {
        self.bits
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(CountedHead::unpack)
            .map_err(CountedHead::unpack)
    }
}
