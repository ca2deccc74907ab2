//! Stable-address allocation for buffers shared with the host.
//!
//! Buffers handed to a host call must keep their address until the call's
//! completion is observed.  Per-call scratch space is owned by a scope-local
//! [`Pinner`] released on scope exit; allocations made on the host's behalf
//! through [`cabi_realloc`] go into a process-wide registry released in bulk
//! when the owning task tears down.

use once_cell::sync::Lazy;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

/// Owns raw allocations whose addresses stay valid until the pinner drops.
pub struct Pinner {
    allocations: Vec<(*mut u8, Layout)>,
}

// The pointers are ordinary heap allocations owned exclusively by the
// pinner.
unsafe impl Send for Pinner {}

impl Pinner {
    pub fn new() -> Self {
        Self {
            allocations: Vec::new(),
        }
    }

    /// Allocate `size` zeroed bytes at alignment `align`.  Zero-size
    /// requests yield an aligned dangling pointer; an alignment that is not
    /// a power of two aborts.
    pub fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return align as *mut u8;
        }
        let layout = Layout::from_size_align(size, align)
            .unwrap_or_else(|_| panic!("invalid allocation request: size {size}, align {align}"));
        let pointer = unsafe { alloc_zeroed(layout) };
        if pointer.is_null() {
            handle_alloc_error(layout);
        }
        self.allocations.push((pointer, layout));
        pointer
    }
}

impl Default for Pinner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pinner {
    fn drop(&mut self) {
        for (pointer, layout) in self.allocations.drain(..) {
            unsafe { dealloc(pointer, layout) }
        }
    }
}

static RUNTIME_READY: AtomicBool = AtomicBool::new(false);

static TASK_PINNER: Lazy<Mutex<Pinner>> = Lazy::new(|| Mutex::new(Pinner::new()));

/// Switch [`cabi_realloc`] from the early-boot allocator to managed, pinned
/// allocations.  Called by [`crate::run`]; startup glue that lowers
/// arguments before the first task entry may also call it once the language
/// runtime is usable.
pub fn mark_runtime_ready() {
    RUNTIME_READY.store(true, Relaxed);
}

/// Release every allocation handed out through [`cabi_realloc`] since the
/// last call.  Runs on task teardown.
pub fn release_task_allocations() {
    *TASK_PINNER.lock().unwrap() = Pinner::new();
}

/// Allocation entry point invoked by the host during argument lowering.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cabi_realloc(
    old_pointer: *mut u8,
    old_size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    realloc_from_nothing(old_pointer, old_size, align, new_size)
}

/// The contract behind the `cabi_realloc` export.
///
/// Only growth from nothing is supported: any call with a nonzero
/// `old_pointer` or `old_size` aborts.  Before the runtime is ready the
/// request is served from a raw bump path; afterwards it is served from the
/// global allocator and pinned until task teardown.
pub fn realloc_from_nothing(
    old_pointer: *mut u8,
    old_size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    if !old_pointer.is_null() || old_size != 0 {
        panic!("cabi_realloc: only growth from nothing is supported");
    }

    if RUNTIME_READY.load(Relaxed) {
        TASK_PINNER.lock().unwrap().allocate(new_size, align)
    } else {
        boot_alloc(new_size, align)
    }
}

/// Early-boot bump allocation over fresh linear memory, with per-call
/// alignment padding.  The host may call `cabi_realloc` while instantiating
/// the module, before the allocator's own initialisation has run.
#[cfg(target_arch = "wasm32")]
fn boot_alloc(size: usize, align: usize) -> *mut u8 {
    const PAGE: usize = 64 * 1024;

    assert!(align.is_power_of_two(), "unsupported alignment: {align}");
    if size == 0 {
        return align as *mut u8;
    }

    let pages = (size + align - 1).div_ceil(PAGE);
    let previous = core::arch::wasm32::memory_grow(0, pages);
    if previous == usize::MAX {
        panic!("memory.grow failed during early-boot allocation");
    }
    let base = previous * PAGE;
    let aligned = (base + align - 1) & !(align - 1);
    aligned as *mut u8
}

/// Native hosts have no pre-init window; serve the request from the global
/// allocator and let it live for the process (nothing tracks it yet).
#[cfg(not(target_arch = "wasm32"))]
fn boot_alloc(size: usize, align: usize) -> *mut u8 {
    if size == 0 {
        assert!(align.is_power_of_two(), "unsupported alignment: {align}");
        return align as *mut u8;
    }
    let layout = Layout::from_size_align(size, align)
        .unwrap_or_else(|_| panic!("invalid allocation request: size {size}, align {align}"));
    let pointer = unsafe { alloc_zeroed(layout) };
    if pointer.is_null() {
        handle_alloc_error(layout);
    }
    pointer
}
