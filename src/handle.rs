//! Null-tagged cells for transferable resource handles.

use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

/// A move-only cell holding a host resource handle, with `0` meaning absent.
///
/// Endpoints borrow the contained handle for the duration of a host call by
/// `take`ing it and `set`ting it back on the way out.  A second user entering
/// while the cell is empty fails loudly rather than double-driving the
/// endpoint; the cell is the single-consumer guard for everything built on
/// top of it.
pub struct Handle {
    value: AtomicU32,
}

impl Handle {
    /// Wrap a handle received from the host.  Aborts on the reserved `0`.
    pub fn new(value: u32) -> Self {
        assert!(value != 0, "nil handle");
        Self {
            value: AtomicU32::new(value),
        }
    }

    /// Read the current value without claiming it.
    pub fn peek(&self) -> u32 {
        self.value.load(Relaxed)
    }

    /// Claim the handle, leaving the cell empty.  Aborts if it is already
    /// empty (moved, dropped, or claimed by a concurrent operation).
    pub fn take(&self) -> u32 {
        let value = self.value.swap(0, Relaxed);
        assert!(value != 0, "nil handle");
        value
    }

    /// Claim the handle if present.
    pub fn take_or_none(&self) -> Option<u32> {
        match self.value.swap(0, Relaxed) {
            0 => None,
            value => Some(value),
        }
    }

    /// Return a previously taken handle.  Aborts on `0` or if the cell is
    /// occupied.
    pub fn set(&self, value: u32) {
        assert!(value != 0, "nil handle");
        assert!(
            self.value.compare_exchange(0, value, Relaxed, Relaxed).is_ok(),
            "handle already set"
        );
    }
}
