//! Guest-side asynchronous runtime adapter for the Component Model
//! canonical ABI.
//!
//! A host scheduler drives a guest task through a single re-entrant
//! callback: it calls [`run`] once, then [`callback`] with one event per
//! entry, and each return tells it whether to exit, call again soon, or
//! suspend on a waitable set.  This crate multiplexes any number of logical
//! in-guest tasks onto that contract so that application code can be
//! written against ordinary blocking operations:
//!
//! - [`FutureReader`]/[`FutureWriter`]: one-shot value transfer between
//!   paired endpoints, with the writer re-taking ownership of transferable
//!   payload sub-resources when the reader goes away;
//! - [`StreamReader`]/[`StreamWriter`]: bounded-chunk transfers with
//!   partial-write restoration and peer-drop observation;
//! - [`subtask_wait`]: parking on a subtask started through an
//!   async-lowered import;
//! - [`yield_now`]: a cooperative trip through the host scheduler;
//! - [`spawn`]: additional in-guest tasks under the same host task.
//!
//! Endpoints marshal payloads through per-type vtables supplied by
//! generated bindings; the adapter itself never inspects payload bytes.
//! The [`cabi_realloc`] export covers the host's argument-lowering
//! allocations, including calls made before the runtime is initialised.

pub mod abi;
mod alloc;
mod future;
mod handle;
mod sched;
mod stream;
mod task;

pub use alloc::{
    Pinner, cabi_realloc, mark_runtime_ready, realloc_from_nothing, release_task_allocations,
};
pub use future::{FutureReader, FutureVtable, FutureWriter};
pub use handle::Handle;
pub use stream::{StreamReader, StreamVtable, StreamWriter};
pub use task::{callback, future_or_stream_wait, run, spawn, subtask_wait, yield_now};
