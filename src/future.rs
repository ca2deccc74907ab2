//! Reader and writer halves of a one-shot asynchronous value transfer.

use std::mem;

use crate::abi::{RETURN_CODE_CANCELLED, RETURN_CODE_COMPLETED, RETURN_CODE_DROPPED};
use crate::alloc::Pinner;
use crate::handle::Handle;
use crate::task::{self, RunOnDrop};

/// Per-payload-type operations for a future, normally produced by generated
/// bindings.
///
/// `size` and `align` describe the payload's ABI representation.  When
/// `lift` is absent the payload occupies its ABI bytes verbatim (and must be
/// plain data); when `lower` is absent the value's own bytes are pinned in
/// place for the duration of the transfer.  A `lower` implementation returns
/// a restore closure which, if the transfer does not complete, re-takes
/// ownership of any transferable sub-resources.  Since the lowered value
/// itself is consumed by the attempt, payload types carrying sub-resources
/// share their interior (for example behind an `Arc`) so that the restore
/// closure can re-bind them where the caller still sees them.
pub struct FutureVtable<T> {
    pub size: usize,
    pub align: usize,
    pub read: unsafe fn(handle: u32, buffer: *mut u8) -> u32,
    pub write: unsafe fn(handle: u32, buffer: *mut u8) -> u32,
    pub cancel_read: unsafe fn(handle: u32) -> u32,
    pub cancel_write: unsafe fn(handle: u32) -> u32,
    pub drop_readable: unsafe fn(handle: u32),
    pub drop_writable: unsafe fn(handle: u32),
    pub lift: Option<unsafe fn(source: *mut u8) -> T>,
    pub lower:
        Option<fn(pinner: &mut Pinner, value: &T, destination: *mut u8) -> Box<dyn FnOnce()>>,
}

/// The read half of a future.
pub struct FutureReader<T: 'static> {
    vtable: &'static FutureVtable<T>,
    handle: Handle,
}

impl<T> FutureReader<T> {
    pub fn new(vtable: &'static FutureVtable<T>, handle: u32) -> Self {
        Self {
            vtable,
            handle: Handle::new(handle),
        }
    }

    /// Park until the peer writes, then return the value.
    ///
    /// Reading consumes the endpoint's handle: a second read, sequential or
    /// concurrent, aborts with "nil handle".
    pub fn read(&self) -> T {
        let handle = self.handle.take();
        let vtable = self.vtable;
        let _release = RunOnDrop::new(move || unsafe { (vtable.drop_readable)(handle) });

        let mut pinner = Pinner::new();
        let buffer = pinner.allocate(vtable.size, vtable.align);

        let (code, _) =
            task::future_or_stream_wait(unsafe { (vtable.read)(handle, buffer) }, handle);

        match code {
            RETURN_CODE_COMPLETED => {
                log::trace!("future read completed on handle {handle}");
                if let Some(lift) = vtable.lift {
                    unsafe { lift(buffer) }
                } else {
                    debug_assert_eq!(vtable.size, mem::size_of::<T>());
                    unsafe { (buffer as *const T).read() }
                }
            }
            RETURN_CODE_DROPPED => panic!("future writer dropped without completing"),
            RETURN_CODE_CANCELLED => panic!("future read cancelled before completing"),
            _ => panic!("unexpected future read code: {code}"),
        }
    }

    /// Surrender the raw handle, e.g. to pass the endpoint across a call
    /// boundary.
    pub fn into_handle(self) -> u32 {
        self.handle.take()
    }
}

impl<T> Drop for FutureReader<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take_or_none() {
            unsafe { (self.vtable.drop_readable)(handle) }
        }
    }
}

/// The write half of a future.
pub struct FutureWriter<T: 'static> {
    vtable: &'static FutureVtable<T>,
    handle: Handle,
}

impl<T> FutureWriter<T> {
    pub fn new(vtable: &'static FutureVtable<T>, handle: u32) -> Self {
        Self {
            vtable,
            handle: Handle::new(handle),
        }
    }

    /// Deliver `value` to the peer, parking until it is consumed.
    ///
    /// Returns `false` if the peer dropped its reader instead; in that case
    /// the restore closure produced during lowering has run, so any
    /// transferable sub-resources are back in the caller's hands.  Writing
    /// consumes the endpoint's handle: a second write, sequential or
    /// concurrent, aborts with "nil handle".
    pub fn write(&self, value: T) -> bool {
        let handle = self.handle.take();
        let vtable = self.vtable;
        let _release = RunOnDrop::new(move || unsafe { (vtable.drop_writable)(handle) });

        let mut pinner = Pinner::new();
        let mut restore = None;
        let buffer = if let Some(lower) = vtable.lower {
            let buffer = pinner.allocate(vtable.size, vtable.align);
            restore = Some(lower(&mut pinner, &value, buffer));
            buffer
        } else {
            debug_assert_eq!(vtable.size, mem::size_of::<T>());
            // The value lives in this frame until the wait resolves, so its
            // address is stable for the host's use of the buffer.
            &value as *const T as *mut u8
        };

        let (code, _) =
            task::future_or_stream_wait(unsafe { (vtable.write)(handle, buffer) }, handle);

        match code {
            RETURN_CODE_COMPLETED => {
                log::trace!("future write completed on handle {handle}");
                if vtable.lower.is_none() {
                    // The payload bytes now belong to the peer.
                    mem::forget(value);
                }
                true
            }
            RETURN_CODE_DROPPED => {
                log::trace!("future reader dropped; restoring payload of handle {handle}");
                if let Some(restore) = restore {
                    restore();
                }
                false
            }
            RETURN_CODE_CANCELLED => panic!("future write cancelled before completing"),
            _ => panic!("unexpected future write code: {code}"),
        }
    }

    /// Surrender the raw handle, e.g. to pass the endpoint across a call
    /// boundary.
    pub fn into_handle(self) -> u32 {
        self.handle.take()
    }
}

impl<T> Drop for FutureWriter<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take_or_none() {
            unsafe { (self.vtable.drop_writable)(handle) }
        }
    }
}
