//! A callback-based [`Awakable`] backing `Core::watch` (§4.5/§4.6):
//! level-triggered, re-armed only on an explicit re-`watch` call (§9's
//! resolved open question), firing through the thread's
//! [`RequestContext`](crate::core::request_context::RequestContext)
//! rather than synchronously, so it never runs while a core lock is
//! held.

use std::sync::{Arc, Mutex, Weak};

use crate::core::request_context;
use crate::dispatcher::{Awakable, HandleSignalsState};
use crate::error::MojoResult;

pub type WatchCallback = dyn FnMut(MojoResult, HandleSignalsState, usize) + Send;

/// Holds its own `Weak` self-reference (the same pattern
/// `WaitSetDispatcher` uses) so `awake` can hand a `'static` `Arc` into
/// the deferred finalizer closure rather than borrowing `self`.
pub struct Watcher {
    callback: Mutex<Box<WatchCallback>>,
    self_weak: Mutex<Weak<Watcher>>,
}

impl Watcher {
    pub fn new(callback: impl FnMut(MojoResult, HandleSignalsState, usize) + Send + 'static) -> Arc<Watcher> {
        let watcher = Arc::new(Watcher {
            callback: Mutex::new(Box::new(callback)),
            self_weak: Mutex::new(Weak::new()),
        });
        *watcher.self_weak.lock().unwrap() = Arc::downgrade(&watcher);
        watcher
    }

    fn fire(&self, result: MojoResult, state: HandleSignalsState, context: usize) {
        let mut cb = self.callback.lock().unwrap();
        cb(result, state, context);
    }
}

impl Awakable for Watcher {
    fn awake(&self, result: MojoResult, state: HandleSignalsState, context: usize) {
        let this = match self.self_weak.lock().unwrap().upgrade() {
            Some(w) => w,
            None => return,
        };
        if result == MojoResult::Cancelled {
            request_context::defer_cancellation(move || this.fire(result, state, context));
        } else {
            let this = this.clone();
            request_context::defer_notification(move || this.fire(result, state, context));
        }
    }
}
