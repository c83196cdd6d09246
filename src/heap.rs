//! Node allocation that hands exhaustion back to the caller.

use crate::error::AllocError;
use alloc::{
    alloc::{alloc, handle_alloc_error},
    boxed::Box,
};
use core::alloc::Layout;

/// Move `value` into a fresh heap cell.
///
/// On failure the value is returned untouched. The pointer is compatible with
/// `Box::from_raw`, which is how [`free`] releases it.
pub(crate) fn try_alloc<N>(value: N) -> Result<*mut N, (N, AllocError)> {
    let layout = Layout::new::<N>();
    debug_assert!(layout.size() > 0);

    let ptr = unsafe { alloc(layout) } as *mut N;
    if ptr.is_null() {
        return Err((value, AllocError::new(layout)));
    }

    unsafe { ptr.write(value) };
    Ok(ptr)
}

/// Abort through the global allocation error handler.
pub(crate) fn exhausted(err: AllocError) -> ! {
    handle_alloc_error(err.layout())
}

/// Drop and deallocate a cell obtained from [`try_alloc`].
///
/// # Safety
///
/// `ptr` must come from `try_alloc::<N>` and must not be used again.
pub(crate) unsafe fn free<N>(ptr: *mut N) {
    drop(Box::from_raw(ptr));
}
