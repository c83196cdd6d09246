use core::alloc::Layout;

/// The global allocator could not provide memory for a stack node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to allocate stack node (size {size}, align {align})")]
pub struct AllocError {
    size: usize,
    align: usize,
}

impl AllocError {
    pub(crate) fn new(layout: Layout) -> AllocError {
        AllocError {
            size: layout.size(),
            align: layout.align(),
        }
    }

    /// layout of the allocation that failed
    pub fn layout(&self) -> Layout {
        // built from a valid Layout in new()
        match Layout::from_size_align(self.size, self.align) {
            Ok(layout) => layout,
            Err(_) => unreachable!(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::AllocError;
    use core::alloc::Layout;
    use std::string::ToString;

    #[test]
    fn test_display() {
        let err = AllocError::new(Layout::from_size_align(48, 16).unwrap());
        assert_eq!(
            err.to_string(),
            "failed to allocate stack node (size 48, align 16)"
        );
        assert_eq!(err.layout().size(), 48);
        assert_eq!(err.layout().align(), 16);
    }
}
