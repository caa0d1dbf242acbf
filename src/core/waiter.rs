//! A one-shot, thread-blocking [`Awakable`] backing `Core::wait`/
//! `wait_many` (§4.6): attached to one or more dispatchers, it wakes the
//! owning thread exactly once and records the result.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::dispatcher::{Awakable, HandleSignalsState};
use crate::error::MojoResult;

struct WaiterState {
    result: Option<(MojoResult, HandleSignalsState, usize)>,
}

pub struct Waiter {
    state: Mutex<WaiterState>,
    condvar: Condvar,
}

impl Waiter {
    pub fn new() -> Arc<Waiter> {
        Arc::new(Waiter { state: Mutex::new(WaiterState { result: None }), condvar: Condvar::new() })
    }

    /// Block until woken or `deadline` elapses. Returns `None` on
    /// timeout with no wake.
    pub fn wait(&self, deadline: Option<Duration>) -> Option<(MojoResult, HandleSignalsState, usize)> {
        let mut state = self.state.lock().unwrap();
        let start = Instant::now();
        loop {
            if let Some(result) = state.result {
                return Some(result);
            }
            match deadline {
                None => state = self.condvar.wait(state).unwrap(),
                Some(d) => {
                    let elapsed = start.elapsed();
                    if elapsed >= d {
                        return None;
                    }
                    let (next, timed_out) = self.condvar.wait_timeout(state, d - elapsed).unwrap();
                    state = next;
                    if timed_out.timed_out() && state.result.is_none() {
                        return None;
                    }
                }
            }
        }
    }
}

impl Awakable for Waiter {
    fn awake(&self, result: MojoResult, state: HandleSignalsState, context: usize) {
        let mut s = self.state.lock().unwrap();
        if s.result.is_none() {
            s.result = Some((result, state, context));
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_exactly_once_with_first_result() {
        let waiter = Waiter::new();
        waiter.awake(MojoResult::Ok, HandleSignalsState::default(), 7);
        waiter.awake(MojoResult::Cancelled, HandleSignalsState::default(), 9);
        let (result, _, context) = waiter.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(result, MojoResult::Ok);
        assert_eq!(context, 7);
    }

    #[test]
    fn times_out_when_never_woken() {
        let waiter = Waiter::new();
        assert!(waiter.wait(Some(Duration::from_millis(5))).is_none());
    }
}
