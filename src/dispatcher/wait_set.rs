//! The wait-set dispatcher: a set of (dispatcher, signals, context)
//! entries reporting ready dispatchers in FIFO wake order, re-armed
//! after each report to preserve level-triggered semantics (§4.4.6).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::dispatcher::{Awakable, Dispatcher, DispatcherKind, Envelope, HandleSignalsState, Signals};
use crate::error::{MojoResult, Result};

type Key = usize;

fn key_of(d: &Arc<dyn Dispatcher>) -> Key {
    Arc::as_ptr(d) as *const () as usize
}

struct Entry {
    dispatcher: Arc<dyn Dispatcher>,
    signals: Signals,
    context: usize,
}

struct ReadyItem {
    key: Key,
    result: MojoResult,
}

pub struct WaitSetDispatcher {
    entries: Mutex<HashMap<Key, Entry>>,
    ready: Mutex<VecDeque<ReadyItem>>,
    envelope: Envelope,
    self_weak: Mutex<Weak<WaitSetDispatcher>>,
}

/// Bridges a member dispatcher's wake to this wait set's ready queue.
struct MemberWaiter {
    set: Weak<WaitSetDispatcher>,
    key: Key,
}

impl Awakable for MemberWaiter {
    fn awake(&self, result: MojoResult, _state: HandleSignalsState, _context: usize) {
        if let Some(set) = self.set.upgrade() {
            set.ready.lock().unwrap().push_back(ReadyItem { key: self.key, result });
            set.envelope.awakables.awake_for_state_change(HandleSignalsState {
                satisfied: Signals::READABLE,
                satisfiable: Signals::READABLE,
            });
        }
    }
}

/// An entry reported by `get_ready_dispatchers`.
pub struct ReadyDispatcher {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub result: MojoResult,
    pub context: usize,
}

impl WaitSetDispatcher {
    pub fn new() -> Arc<WaitSetDispatcher> {
        let set = Arc::new(WaitSetDispatcher {
            entries: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            envelope: Envelope::new(),
            self_weak: Mutex::new(Weak::new()),
        });
        *set.self_weak.lock().unwrap() = Arc::downgrade(&set);
        set
    }

    pub fn add_waiting_dispatcher(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        signals: Signals,
        context: usize,
    ) -> Result<()> {
        self.envelope.check_mutable()?;
        let key = key_of(&dispatcher);
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(MojoResult::AlreadyExists);
        }
        if dispatcher.envelope().is_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        let weak = self.self_weak.lock().unwrap().clone();
        let waiter: Arc<dyn Awakable> = Arc::new(MemberWaiter { set: weak, key });
        dispatcher.add_awakable(waiter, signals, context)?;
        entries.insert(key, Entry { dispatcher, signals, context });
        Ok(())
    }

    pub fn remove_waiting_dispatcher(&self, dispatcher: &Arc<dyn Dispatcher>) -> Result<()> {
        let key = key_of(dispatcher);
        let removed = self.entries.lock().unwrap().remove(&key);
        self.ready.lock().unwrap().retain(|item| item.key != key);
        removed.map(|_| ()).ok_or(MojoResult::NotFound)
    }

    /// §4.4.6: return up to `count` ready entries, re-arming each one so
    /// a still-satisfied dispatcher is reported again on the next call.
    pub fn get_ready_dispatchers(&self, count: usize) -> Vec<ReadyDispatcher> {
        let mut out = Vec::new();
        for _ in 0..count {
            let item = match self.ready.lock().unwrap().pop_front() {
                Some(item) => item,
                None => break,
            };
            let entry = match self.entries.lock().unwrap().get(&item.key).map(|e| {
                (e.dispatcher.clone(), e.signals, e.context)
            }) {
                Some(e) => e,
                None => continue,
            };
            let (dispatcher, signals, context) = entry;
            if item.result == MojoResult::Cancelled {
                self.entries.lock().unwrap().remove(&item.key);
            } else {
                let weak = self.self_weak.lock().unwrap().clone();
                let waiter: Arc<dyn Awakable> = Arc::new(MemberWaiter { set: weak, key: item.key });
                let _ = dispatcher.add_awakable(waiter, signals, context);
            }
            out.push(ReadyDispatcher { dispatcher, result: item.result, context });
        }
        out
    }
}

impl Dispatcher for WaitSetDispatcher {
    fn kind(&self) -> DispatcherKind {
        DispatcherKind::WaitSet
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn handle_signals_state(&self) -> HandleSignalsState {
        let satisfied = if self.ready.lock().unwrap().is_empty() { Signals::NONE } else { Signals::READABLE };
        HandleSignalsState { satisfied, satisfiable: Signals::READABLE }
    }

    /// §9's resolved open question: wait sets never travel in messages.
    fn begin_transit(&self) -> Result<()> {
        Err(MojoResult::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::message_pipe::MessagePipeDispatcher;
    use crate::names::NodeName;
    use crate::ports::node::{Node, NodeDelegate};
    use crate::ports::message::Message;
    use crate::ports::port::PortRef;

    struct NoopDelegate;
    impl NodeDelegate for NoopDelegate {
        fn forward_message(&self, _node: NodeName, _message: Message) {}
        fn broadcast_message(&self, _message: Message) {}
        fn port_status_changed(&self, _port: PortRef) {}
    }

    #[test]
    fn level_triggers_until_read_then_should_wait() {
        let node = Arc::new(Node::new(NodeName::random(), Arc::new(NoopDelegate)));
        let (a1, b1) = node.create_port_pair();
        let (a2, b2) = node.create_port_pair();
        let p1 = MessagePipeDispatcher::new(node.clone(), b1);
        let p2 = MessagePipeDispatcher::new(node.clone(), b2);

        let set = WaitSetDispatcher::new();
        set.add_waiting_dispatcher(p1.clone(), Signals::READABLE, 1).unwrap();
        set.add_waiting_dispatcher(p2.clone(), Signals::READABLE, 2).unwrap();

        node.send_message(a1, b"x".to_vec(), &[]).unwrap();
        let ready = set.get_ready_dispatchers(1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].context, 1);

        // Not yet read: still ready.
        let ready_again = set.get_ready_dispatchers(1);
        assert_eq!(ready_again.len(), 1);
        assert_eq!(ready_again[0].context, 1);

        p1.read_message().unwrap();
        let drained = set.get_ready_dispatchers(1);
        assert!(drained.is_empty());
        let _ = a2;
    }
}
