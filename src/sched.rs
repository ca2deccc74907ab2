//! Cooperative scheduling support for the callback loop.
//!
//! The host drives a task through a single re-entrant callback, so the loop
//! may only hand control back once no in-guest task can make progress.  That
//! requires a reliable "everything is blocked or finished" signal, which is
//! produced here by counting runnable tasks: every live task holds one unit
//! of credit while it runs, parking on a [`Channel`] releases it, and each
//! `send` transfers one unit along with the value so that a message in
//! flight still counts as pending work.  When the count reaches zero with an
//! idle hook armed, a sentinel is posted to the hook's channel.

use std::sync::{Arc, Condvar, Mutex};

pub(crate) struct Scheduler {
    inner: Mutex<Inner>,
}

struct Inner {
    runnable: usize,
    on_idle: Option<Arc<Channel<()>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                runnable: 0,
                on_idle: None,
            }),
        })
    }

    /// Account for a new runnable task or an in-flight message.
    pub fn credit(&self) {
        self.inner.lock().unwrap().runnable += 1;
    }

    /// Account for a task parking or exiting.  Fires the idle hook when the
    /// last runnable unit disappears.
    pub fn debit(&self) {
        let hook = {
            let mut inner = self.inner.lock().unwrap();
            inner.runnable = inner
                .runnable
                .checked_sub(1)
                .expect("runnable task accounting underflow");
            if inner.runnable == 0 {
                inner.on_idle.clone()
            } else {
                None
            }
        };
        if let Some(wake) = hook {
            log::trace!("all tasks blocked or finished; waking the callback loop");
            wake.send(());
        }
    }

    /// Arm `wake` to receive a sentinel each time the runnable count hits
    /// zero.  Stays armed until [`Scheduler::disarm_idle`].
    pub fn arm_idle(&self, wake: &Arc<Channel<()>>) {
        self.inner.lock().unwrap().on_idle = Some(wake.clone());
    }

    pub fn disarm_idle(&self) {
        self.inner.lock().unwrap().on_idle = None;
    }
}

/// A single-slot rendezvous channel integrated with the runnable accounting.
///
/// `send` never blocks: by protocol the slot is empty whenever a post
/// happens, and posting into an occupied slot aborts.  Exactly one receiver
/// is expected per post.
pub(crate) struct Channel<T> {
    sched: Arc<Scheduler>,
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Channel<T> {
    pub fn new(sched: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            sched,
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    /// Post a value, transferring one unit of runnable credit to the
    /// receiver.
    pub fn send(&self, value: T) {
        self.sched.credit();
        let mut slot = self.slot.lock().unwrap();
        assert!(slot.is_none(), "rendezvous channel already holds a value");
        *slot = Some(value);
        self.ready.notify_one();
    }

    /// Park until a value arrives.  The caller stops being runnable while
    /// parked; the credit attached to the delivered value keeps it runnable
    /// afterwards.
    pub fn recv(&self) -> T {
        self.sched.debit();
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self.ready.wait(slot).unwrap();
        }
    }
}
