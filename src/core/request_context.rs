//! The thread-local request context (§5 "Request context", §9.6.1 of
//! the original `request_context.h`): batches deferred watcher wake-ups
//! and cancellations so they run after every core lock has been
//! released, in a fresh nested context so a callback may itself call
//! back into the core without deadlocking.
//!
//! Cancellation finalizers always run before notification finalizers,
//! preserving the "a cancelled watch never fires" contract.

use std::cell::RefCell;

/// Where a request context was entered from, kept only for diagnostics
/// (the original distinguishes `LOCAL_API_CALL` from `SYSTEM` for
/// similar reasons).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    LocalApiCall,
    System,
}

type Finalizer = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Finalizers {
    cancellations: Vec<Finalizer>,
    notifications: Vec<Finalizer>,
}

thread_local! {
    static STACK: RefCell<Vec<Finalizers>> = const { RefCell::new(Vec::new()) };
}

/// A scoped request context. Every public `Core` entry point wraps its
/// body in one; dropping it runs whatever got deferred during the
/// call.
pub struct RequestContext {
    _source: Source,
}

impl RequestContext {
    pub fn enter(source: Source) -> RequestContext {
        STACK.with(|s| s.borrow_mut().push(Finalizers::default()));
        RequestContext { _source: source }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        let popped = STACK.with(|s| s.borrow_mut().pop());
        let Finalizers { cancellations, notifications } = match popped {
            Some(f) => f,
            None => return,
        };
        if cancellations.is_empty() && notifications.is_empty() {
            return;
        }
        // Run in a fresh nested context: a finalizer that itself calls
        // back into the core (e.g. closing a handle from a watcher
        // callback) must see an active context to defer into, and must
        // not reacquire any core lock this drop is unwinding through.
        let _nested = RequestContext::enter(Source::System);
        for f in cancellations {
            f();
        }
        for f in notifications {
            f();
        }
    }
}

/// Append a cancellation finalizer to the innermost active context.
/// Panics if called with no context entered — every `Core` API that can
/// wake a watcher must enter one first.
pub fn defer_cancellation(f: impl FnOnce() + Send + 'static) {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let top = stack.last_mut().expect("defer_cancellation called with no active RequestContext");
        top.cancellations.push(Box::new(f));
    });
}

/// Append a notification finalizer to the innermost active context.
pub fn defer_notification(f: impl FnOnce() + Send + 'static) {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let top = stack.last_mut().expect("defer_notification called with no active RequestContext");
        top.notifications.push(Box::new(f));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn cancellations_run_before_notifications() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let _ctx = RequestContext::enter(Source::LocalApiCall);
            let o = order.clone();
            defer_notification(move || o.lock().unwrap().push("notify"));
            let o = order.clone();
            defer_cancellation(move || o.lock().unwrap().push("cancel"));
        }
        assert_eq!(*order.lock().unwrap(), vec!["cancel", "notify"]);
    }
}
