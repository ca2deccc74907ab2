//! Reader and writer halves of a bounded-chunk asynchronous stream.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

use crate::abi::{RETURN_CODE_CANCELLED, RETURN_CODE_COMPLETED, RETURN_CODE_DROPPED};
use crate::alloc::Pinner;
use crate::handle::Handle;
use crate::task::{self, RunOnDrop};

/// Per-payload-type operations for a stream, normally produced by generated
/// bindings.  See [`crate::FutureVtable`] for the lift/lower and restore
/// closure contracts; the transport entry points additionally take the
/// element count of the transfer.
pub struct StreamVtable<T> {
    pub size: usize,
    pub align: usize,
    pub read: unsafe fn(handle: u32, buffer: *mut u8, count: u32) -> u32,
    pub write: unsafe fn(handle: u32, buffer: *mut u8, count: u32) -> u32,
    pub cancel_read: unsafe fn(handle: u32) -> u32,
    pub cancel_write: unsafe fn(handle: u32) -> u32,
    pub drop_readable: unsafe fn(handle: u32),
    pub drop_writable: unsafe fn(handle: u32),
    pub lift: Option<unsafe fn(source: *mut u8) -> T>,
    pub lower:
        Option<fn(pinner: &mut Pinner, value: &T, destination: *mut u8) -> Box<dyn FnOnce()>>,
}

/// The read half of a stream.
///
/// Unlike a future, a stream endpoint outlives any single operation: each
/// read borrows the handle and returns it on the way out, so a concurrent
/// read aborts with "nil handle" while a later sequential one succeeds.
pub struct StreamReader<T: 'static> {
    vtable: &'static StreamVtable<T>,
    handle: Handle,
    writer_dropped: AtomicBool,
}

impl<T> StreamReader<T> {
    pub fn new(vtable: &'static StreamVtable<T>, handle: u32) -> Self {
        Self {
            vtable,
            handle: Handle::new(handle),
            writer_dropped: AtomicBool::new(false),
        }
    }

    /// Whether the peer has dropped its writer.  Once this reports `true`,
    /// every subsequent [`StreamReader::read`] returns `0`.
    pub fn writer_dropped(&self) -> bool {
        self.writer_dropped.load(Relaxed)
    }

    /// Park until elements arrive, filling `dst` from the front and
    /// returning how many were received.  Aborts if `dst` is empty.
    pub fn read(&self, dst: &mut [T]) -> u32 {
        assert!(!dst.is_empty(), "stream read destination cannot be empty");

        let handle = self.handle.take();
        let _restore_handle = RunOnDrop::new(|| self.handle.set(handle));

        if self.writer_dropped() {
            return 0;
        }

        let mut pinner = Pinner::new();
        let buffer = if self.vtable.lift.is_some() {
            pinner.allocate(self.vtable.size * dst.len(), self.vtable.align)
        } else {
            debug_assert_eq!(self.vtable.size, mem::size_of::<T>());
            dst.as_mut_ptr() as *mut u8
        };

        let (code, count) = task::future_or_stream_wait(
            unsafe { (self.vtable.read)(handle, buffer, dst.len() as u32) },
            handle,
        );

        match code {
            RETURN_CODE_COMPLETED => {}
            RETURN_CODE_DROPPED => self.writer_dropped.store(true, Relaxed),
            RETURN_CODE_CANCELLED => panic!("stream read cancelled before completing"),
            _ => panic!("unexpected stream read code: {code}"),
        }

        if let Some(lift) = self.vtable.lift {
            for index in 0..count as usize {
                dst[index] = unsafe { lift(buffer.add(index * self.vtable.size)) };
            }
        }

        log::trace!("stream read of {count} element(s) on handle {handle}");
        count
    }

    /// Surrender the raw handle, e.g. to pass the endpoint across a call
    /// boundary.
    pub fn into_handle(self) -> u32 {
        self.handle.take()
    }
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take_or_none() {
            unsafe { (self.vtable.drop_readable)(handle) }
        }
    }
}

/// The write half of a stream.
pub struct StreamWriter<T: 'static> {
    vtable: &'static StreamVtable<T>,
    handle: Handle,
    reader_dropped: AtomicBool,
}

impl<T> StreamWriter<T> {
    pub fn new(vtable: &'static StreamVtable<T>, handle: u32) -> Self {
        Self {
            vtable,
            handle: Handle::new(handle),
            reader_dropped: AtomicBool::new(false),
        }
    }

    /// Whether the peer has dropped its reader.  Once this reports `true`,
    /// every subsequent write returns `0`.
    pub fn reader_dropped(&self) -> bool {
        self.reader_dropped.load(Relaxed)
    }

    /// Offer `items` to the peer, parking until the transfer resolves, and
    /// return how many were taken.
    ///
    /// On a partial or failed transfer the restore closures for the
    /// unwritten tail run, in order, before this returns; sub-resources of
    /// items `[count..]` are back in the caller's hands.
    pub fn write(&self, items: &[T]) -> u32 {
        let handle = self.handle.take();
        let _restore_handle = RunOnDrop::new(|| self.handle.set(handle));

        if self.reader_dropped() {
            return 0;
        }

        let mut pinner = Pinner::new();
        let mut restores = Vec::new();
        let buffer = if let Some(lower) = self.vtable.lower {
            let buffer = pinner.allocate(self.vtable.size * items.len(), self.vtable.align);
            restores.reserve(items.len());
            for (index, item) in items.iter().enumerate() {
                restores.push(lower(&mut pinner, item, unsafe {
                    buffer.add(index * self.vtable.size)
                }));
            }
            buffer
        } else {
            debug_assert_eq!(self.vtable.size, mem::size_of::<T>());
            items.as_ptr() as *mut u8
        };

        let (code, count) = task::future_or_stream_wait(
            unsafe { (self.vtable.write)(handle, buffer, items.len() as u32) },
            handle,
        );

        if (count as usize) < restores.len() {
            log::trace!(
                "restoring {} unwritten element(s) on handle {handle}",
                restores.len() - count as usize
            );
            for restore in restores.drain(count as usize..) {
                restore();
            }
        }

        match code {
            RETURN_CODE_COMPLETED => {}
            RETURN_CODE_DROPPED => self.reader_dropped.store(true, Relaxed),
            RETURN_CODE_CANCELLED => panic!("stream write cancelled before completing"),
            _ => panic!("unexpected stream write code: {code}"),
        }

        count
    }

    /// Write all of `items`, looping until everything is taken or the peer
    /// drops its reader.  Returns how many elements were transferred.
    pub fn write_all(&self, items: &[T]) -> u32 {
        let mut offset = 0;
        while offset < items.len() && !self.reader_dropped() {
            offset += self.write(&items[offset..]) as usize;
        }
        offset as u32
    }

    /// Surrender the raw handle, e.g. to pass the endpoint across a call
    /// boundary.
    pub fn into_handle(self) -> u32 {
        self.handle.take()
    }
}

impl<T> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take_or_none() {
            unsafe { (self.vtable.drop_writable)(handle) }
        }
    }
}
