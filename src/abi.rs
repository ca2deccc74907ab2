//! Canonical ABI constants and the host operations consumed by this crate.
//!
//! On `wasm32` targets the operations are raw imports from the host's root
//! module, using the bracketed names of the canonical built-ins.  On every
//! other target the same operations route through a thread-installed
//! [`HostOps`] implementation, which lets tests and embedders drive the whole
//! callback loop in-process.

#[cfg(not(target_arch = "wasm32"))]
use std::cell::RefCell;
#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;

pub const EVENT_NONE: u32 = 0;
pub const EVENT_SUBTASK: u32 = 1;
pub const EVENT_STREAM_READ: u32 = 2;
pub const EVENT_STREAM_WRITE: u32 = 3;
pub const EVENT_FUTURE_READ: u32 = 4;
pub const EVENT_FUTURE_WRITE: u32 = 5;

pub const STATUS_STARTING: u32 = 0;
pub const STATUS_STARTED: u32 = 1;
pub const STATUS_RETURNED: u32 = 2;

/// Return codes for `{stream,future}.{read,write}`, packed into the low four
/// bits of the status word.  For streams the number of elements transferred
/// occupies the bits above.
pub const RETURN_CODE_COMPLETED: u32 = 0;
pub const RETURN_CODE_DROPPED: u32 = 1;
pub const RETURN_CODE_CANCELLED: u32 = 2;
pub const RETURN_CODE_BLOCKED: u32 = 0xFFFF_FFFF;

/// Codes returned to the host by [`crate::run`] and [`crate::callback`].
///
/// `WAIT` and `POLL` carry the waitable set to watch in the bits above the
/// low four.
pub mod callback_code {
    pub const EXIT: u32 = 0;
    pub const YIELD: u32 = 1;
    pub const WAIT: u32 = 2;
    pub const POLL: u32 = 3;
}

#[cfg(target_arch = "wasm32")]
mod imports {
    #[link(wasm_import_module = "$root")]
    unsafe extern "C" {
        #[link_name = "[waitable-set-new]"]
        pub fn waitable_set_new() -> u32;
        #[link_name = "[waitable-set-poll]"]
        pub fn waitable_set_poll(set: u32, payload: *mut u32) -> u32;
        #[link_name = "[waitable-set-drop]"]
        pub fn waitable_set_drop(set: u32);
        #[link_name = "[waitable-join]"]
        pub fn waitable_join(waitable: u32, set: u32);
        #[link_name = "[context-get-0]"]
        pub fn context_get() -> *mut u8;
        #[link_name = "[context-set-0]"]
        pub fn context_set(value: *mut u8);
        #[link_name = "[subtask-drop]"]
        pub fn subtask_drop(subtask: u32);
    }
}

/// The host operations the callback loop depends on, as a trait so that
/// non-wasm builds can supply an in-process implementation.
///
/// The transport operations are type-erased: payloads travel as raw bytes
/// and the per-type vtables on the guest side do any lifting and lowering.
/// `future_new`/`stream_new` correspond to the `future.new`/`stream.new`
/// built-ins and take the payload's ABI size because the emulation cannot
/// recover it from a type index; they return `(writer, reader)` handles.
#[cfg(not(target_arch = "wasm32"))]
pub trait HostOps: Send + Sync {
    fn waitable_set_new(&self) -> u32;
    /// Poll the set for a ready event, returning `(event, waitable, code)`
    /// with `EVENT_NONE` when nothing is ready.
    fn waitable_set_poll(&self, set: u32) -> (u32, u32, u32);
    fn waitable_set_drop(&self, set: u32);
    /// Join `waitable` to `set`; a set of `0` detaches it instead.
    fn waitable_join(&self, waitable: u32, set: u32);
    fn context_get(&self) -> *mut u8;
    fn context_set(&self, value: *mut u8);
    fn subtask_drop(&self, subtask: u32);

    fn future_new(&self, payload_size: usize) -> (u32, u32);
    fn stream_new(&self, payload_size: usize) -> (u32, u32);
    fn future_read(&self, handle: u32, buffer: *mut u8) -> u32;
    fn future_write(&self, handle: u32, buffer: *mut u8) -> u32;
    fn stream_read(&self, handle: u32, buffer: *mut u8, count: u32) -> u32;
    fn stream_write(&self, handle: u32, buffer: *mut u8, count: u32) -> u32;
    fn cancel_read(&self, handle: u32) -> u32;
    fn cancel_write(&self, handle: u32) -> u32;
    fn drop_readable(&self, handle: u32);
    fn drop_writable(&self, handle: u32);
}

#[cfg(not(target_arch = "wasm32"))]
thread_local! {
    static HOST: RefCell<Option<Arc<dyn HostOps>>> = const { RefCell::new(None) };
}

/// Install the host operations for the current thread.
///
/// [`crate::spawn`] propagates the installation to the task threads it
/// creates, so installing once on the thread that calls [`crate::run`] is
/// enough.
#[cfg(not(target_arch = "wasm32"))]
pub fn install_host(host: Arc<dyn HostOps>) {
    HOST.with(|slot| *slot.borrow_mut() = Some(host));
}

/// Run `f` against the host operations installed on this thread.
#[cfg(not(target_arch = "wasm32"))]
pub fn with_host<R>(f: impl FnOnce(&dyn HostOps) -> R) -> R {
    let host = HOST
        .with(|slot| slot.borrow().clone())
        .unwrap_or_else(|| panic!("no host operations installed on this thread"));
    f(&*host)
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn installed_host() -> Option<Arc<dyn HostOps>> {
    HOST.with(|slot| slot.borrow().clone())
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn adopt_host(host: Option<Arc<dyn HostOps>>) {
    HOST.with(|slot| *slot.borrow_mut() = host);
}

pub(crate) fn waitable_set_new() -> u32 {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { imports::waitable_set_new() }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.waitable_set_new())
    }
}

pub(crate) fn waitable_set_poll(set: u32) -> (u32, u32, u32) {
    #[cfg(target_arch = "wasm32")]
    {
        let mut payload = [0u32; 2];
        let event = unsafe { imports::waitable_set_poll(set, payload.as_mut_ptr()) };
        (event, payload[0], payload[1])
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.waitable_set_poll(set))
    }
}

pub(crate) fn waitable_set_drop(set: u32) {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { imports::waitable_set_drop(set) }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.waitable_set_drop(set))
    }
}

pub(crate) fn waitable_join(waitable: u32, set: u32) {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { imports::waitable_join(waitable, set) }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.waitable_join(waitable, set))
    }
}

pub(crate) fn context_get() -> *mut u8 {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { imports::context_get() }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.context_get())
    }
}

pub(crate) fn context_set(value: *mut u8) {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { imports::context_set(value) }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.context_set(value))
    }
}

pub(crate) fn subtask_drop(subtask: u32) {
    #[cfg(target_arch = "wasm32")]
    {
        unsafe { imports::subtask_drop(subtask) }
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        with_host(|host| host.subtask_drop(subtask))
    }
}
