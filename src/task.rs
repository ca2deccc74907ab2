//! Per-task state and the host-facing callback loop.
//!
//! The host sees one nonblocking state machine per task: it enters through
//! [`run`] once and through [`callback`] on every subsequent event, and each
//! entry returns a packed code telling it what to do next.  Inside, any
//! number of in-guest tasks block on ordinary calls; the loop here converts
//! host events into wakeups for them and only returns once every one of them
//! is blocked or finished.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::abi::{
    self, EVENT_FUTURE_READ, EVENT_FUTURE_WRITE, EVENT_NONE, EVENT_STREAM_READ, EVENT_STREAM_WRITE,
    EVENT_SUBTASK, RETURN_CODE_BLOCKED, STATUS_RETURNED, STATUS_STARTED, STATUS_STARTING,
    callback_code,
};
use crate::sched::{Channel, Scheduler};

/// State for one host-visible task, shared by the callback loop and every
/// in-guest task spawned under it.
///
/// The `Arc` keeps its address stable for the lifetime of the task; while
/// the task is suspended the host's context slot holds a raw pointer to it.
pub(crate) struct TaskState {
    sched: Arc<Scheduler>,
    /// Posted by the idle hook once every in-guest task is blocked or
    /// finished; the callback loop parks on it and nowhere else.
    wake: Arc<Channel<()>>,
    waitables: Mutex<Waitables>,
    /// `Some` while a task is parked in [`yield_now`] waiting for the next
    /// host entry.
    yielding: Mutex<Option<Arc<Channel<()>>>>,
}

struct Waitables {
    /// Host identity of the waitable set, `0` until first needed.
    set: u32,
    /// One delivery channel per in-flight waitable.  Every key has been
    /// joined to `set`, and is detached again when its completion arrives.
    pending: HashMap<u32, Arc<Channel<u32>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskState>>> = const { RefCell::new(None) };
}

fn current() -> Arc<TaskState> {
    CURRENT
        .with(|current| current.borrow().clone())
        .unwrap_or_else(|| panic!("not called from within a guest task"))
}

impl TaskState {
    fn new() -> Arc<Self> {
        let sched = Scheduler::new();
        Arc::new(Self {
            wake: Channel::new(sched.clone()),
            waitables: Mutex::new(Waitables {
                set: 0,
                pending: HashMap::new(),
            }),
            yielding: Mutex::new(None),
            sched,
        })
    }

    fn spawn_task(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        self.sched.credit();
        let state = self.clone();
        #[cfg(not(target_arch = "wasm32"))]
        let host = abi::installed_host();
        thread::spawn(move || {
            #[cfg(not(target_arch = "wasm32"))]
            abi::adopt_host(host);
            let _exit = RunOnDrop::new({
                let sched = state.sched.clone();
                move || sched.debit()
            });
            CURRENT.with(|current| *current.borrow_mut() = Some(state));
            f();
        });
    }

    /// Register `waitable` with the set (creating the set on demand) and
    /// park until its completion code arrives.
    fn block_on(&self, waitable: u32) -> u32 {
        let channel = {
            let mut waitables = self.waitables.lock().unwrap();
            if waitables.set == 0 {
                waitables.set = abi::waitable_set_new();
            }
            abi::waitable_join(waitable, waitables.set);
            let channel = Channel::new(self.sched.clone());
            let previous = waitables.pending.insert(waitable, channel.clone());
            assert!(
                previous.is_none(),
                "waitable {waitable} already has a pending waiter"
            );
            channel
        };
        channel.recv()
    }

    /// Hand the completion code to whoever is parked on `waitable`.
    fn complete(&self, waitable: u32, code: u32) {
        let channel = self
            .waitables
            .lock()
            .unwrap()
            .pending
            .remove(&waitable)
            .unwrap_or_else(|| panic!("completion for waitable {waitable} with no pending waiter"));
        log::trace!("delivering completion {code:#x} for waitable {waitable}");
        channel.send(code);
    }

    fn dispatch(&self, (event0, event1, event2): (u32, u32, u32)) {
        match event0 {
            EVENT_NONE => {}
            EVENT_SUBTASK => match event2 {
                STATUS_STARTING => panic!("unexpected subtask status: {event2}"),
                STATUS_STARTED => {}
                STATUS_RETURNED => {
                    abi::waitable_join(event1, 0);
                    abi::subtask_drop(event1);
                    self.complete(event1, event2);
                }
                _ => panic!("unexpected subtask status: {event2}"),
            },
            EVENT_STREAM_READ | EVENT_STREAM_WRITE | EVENT_FUTURE_READ | EVENT_FUTURE_WRITE => {
                abi::waitable_join(event1, 0);
                self.complete(event1, event2);
            }
            _ => panic!("unexpected event: {event0}"),
        }
    }

    /// Leave a pointer to this state in the host's context slot so the next
    /// [`callback`] entry can recover it.
    fn stash(self: &Arc<Self>) {
        abi::context_set(Arc::into_raw(self.clone()) as *mut u8);
    }
}

/// First entry point for a host task.
///
/// Spawns `closure` as an in-guest task, then runs the callback loop as if
/// the host had just delivered an initial empty event.  Returns the packed
/// callback code for the host.
pub fn run(closure: impl FnOnce() + Send + 'static) -> u32 {
    crate::alloc::mark_runtime_ready();
    let state = TaskState::new();
    log::trace!("new task state at {:p}", Arc::as_ptr(&state));
    state.spawn_task(closure);
    callback_loop(state, (EVENT_NONE, 0, 0))
}

/// Re-entry point for a suspended host task.
///
/// Recovers the state stashed in the context slot by the previous return,
/// clears the slot, and resumes the callback loop with the delivered event.
pub fn callback(event0: u32, event1: u32, event2: u32) -> u32 {
    let pointer = abi::context_get();
    assert!(
        !pointer.is_null(),
        "callback entered without a stashed task state"
    );
    abi::context_set(ptr::null_mut());
    let state = unsafe { Arc::from_raw(pointer as *const TaskState) };
    callback_loop(state, (event0, event1, event2))
}

fn callback_loop(state: Arc<TaskState>, mut event: (u32, u32, u32)) -> u32 {
    state.sched.credit();

    // A task parked in `yield_now` gets exactly one wakeup per host entry,
    // before any event is dispatched.
    if let Some(yielder) = state.yielding.lock().unwrap().take() {
        yielder.send(());
    }

    state.sched.arm_idle(&state.wake);

    let code = loop {
        state.dispatch(event);

        // Park until every in-guest task is blocked or finished.
        state.wake.recv();

        let yielding = state.yielding.lock().unwrap().is_some();
        let (set, pending) = {
            let waitables = state.waitables.lock().unwrap();
            (waitables.set, waitables.pending.len())
        };

        if yielding {
            if pending == 0 {
                state.stash();
                break callback_code::YIELD;
            }
            assert!(set != 0, "pending completions with no waitable set");
            let polled = abi::waitable_set_poll(set);
            if polled.0 == EVENT_NONE {
                state.stash();
                break callback_code::YIELD;
            }
            // A completion is already sitting in the set: deliver it
            // without returning to the host, and only yield once the set
            // runs dry.
            log::trace!("draining ready event {polled:?} before yielding");
            event = polled;
        } else if pending == 0 {
            if set != 0 {
                abi::waitable_set_drop(set);
            }
            crate::alloc::release_task_allocations();
            log::trace!("task finished");
            break callback_code::EXIT;
        } else {
            assert!(set != 0, "pending completions with no waitable set");
            state.stash();
            break callback_code::WAIT | (set << 4);
        }
    };

    state.sched.disarm_idle();
    state.sched.debit();
    code
}

/// Spawn `f` as a new in-guest task attached to the current host task.
pub fn spawn(f: impl FnOnce() + Send + 'static) {
    current().spawn_task(f);
}

/// Wait for the completion of a transport operation whose initial status
/// word is `code`, returning the split `(code, count)` outcome.
///
/// A `BLOCKED` status parks the calling task until the host reports the
/// operation's completion for `handle`; anything else is decoded directly.
pub fn future_or_stream_wait(code: u32, handle: u32) -> (u32, u32) {
    let code = if code == RETURN_CODE_BLOCKED {
        current().block_on(handle)
    } else {
        code
    };
    (code & 0xF, code >> 4)
}

/// Decode a subtask status word and, for a subtask that has not returned
/// yet, park until it does.
pub fn subtask_wait(status: u32) {
    let subtask = status >> 4;
    let status = status & 0xF;
    match status {
        STATUS_STARTING | STATUS_STARTED => {
            current().block_on(subtask);
        }
        STATUS_RETURNED => {}
        _ => panic!("unexpected subtask status: {status}"),
    }
}

/// Cooperatively return control to the host, resuming on its next entry.
///
/// Wakes exactly once, with no spurious wakeups.  At most one task may be
/// yielding at a time.
pub fn yield_now() {
    let state = current();
    let channel = Channel::new(state.sched.clone());
    {
        let mut yielding = state.yielding.lock().unwrap();
        assert!(
            yielding.is_none(),
            "concurrent yield from more than one task"
        );
        *yielding = Some(channel.clone());
    }
    channel.recv();
}

/// Runs a closure when dropped; pairs host-side releases with every exit
/// path, including unwinds.
pub(crate) struct RunOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> RunOnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for RunOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}
