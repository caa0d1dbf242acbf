//! The dispatcher table: handle-backed primitives and their common
//! envelope.
//!
//! Per the design doc's note on the dispatcher class family collapsing
//! to a tagged sum, there is one [`Dispatcher`] trait implemented by
//! five concrete types (message pipe, data pipe producer/consumer,
//! shared buffer, wrapped handle, wait set), each embedding a shared
//! [`Envelope`] for the closed/transit flags and the awakable list
//! rather than re-implementing that bookkeeping per type.

pub mod data_pipe;
pub mod message_pipe;
pub mod shared_buffer;
pub mod wait_set;
pub mod wrapped_handle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MojoResult, Result};

/// Readiness signals a handle may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signals {
    bits: u8,
}

impl Signals {
    pub const NONE: Signals = Signals { bits: 0 };
    pub const READABLE: Signals = Signals { bits: 0b001 };
    pub const WRITABLE: Signals = Signals { bits: 0b010 };
    pub const PEER_CLOSED: Signals = Signals { bits: 0b100 };

    pub const fn union(self, other: Signals) -> Signals {
        Signals { bits: self.bits | other.bits }
    }

    pub const fn contains(self, other: Signals) -> bool {
        self.bits & other.bits == other.bits
    }

    pub const fn intersects(self, other: Signals) -> bool {
        self.bits & other.bits != 0
    }
}

impl std::ops::BitOr for Signals {
    type Output = Signals;
    fn bitor(self, rhs: Signals) -> Signals {
        self.union(rhs)
    }
}

/// The satisfied and satisfiable signal sets for a handle at a point in
/// time. `satisfiable` narrows as state becomes permanent (e.g. once a
/// peer closes, `WRITABLE` is no longer satisfiable, ever).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleSignalsState {
    pub satisfied: Signals,
    pub satisfiable: Signals,
}

/// The kind tag distinguishing dispatcher variants, matching the core's
/// type enumeration (§3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    MessagePipe,
    DataPipeProducer,
    DataPipeConsumer,
    SharedBuffer,
    WrappedPlatformHandle,
    WaitSet,
}

/// Something that can be woken when a dispatcher's signal state changes:
/// a blocking [`crate::core::waiter::Waiter`] or an async
/// [`crate::core::watcher::Watcher`]. Narrow and single-method, in the
/// spirit of the design doc's note on `UserData`/`PortObserver`.
pub trait Awakable: Send + Sync {
    fn awake(&self, result: MojoResult, state: HandleSignalsState, context: usize);
}

struct AwakableEntry {
    awakable: Arc<dyn Awakable>,
    signals: Signals,
    context: usize,
}

/// Tracks every awakable waiting on one dispatcher. Thread-unsafe by
/// itself; all access goes through its own lock, the innermost in the
/// lock hierarchy.
#[derive(Default)]
pub struct AwakableList {
    entries: Mutex<Vec<AwakableEntry>>,
}

impl AwakableList {
    pub fn new() -> AwakableList {
        AwakableList::default()
    }

    /// §4.6: `Ok` on insertion, `AlreadyExists` if `signals` are already
    /// satisfied, `FailedPrecondition` if they can never be satisfied.
    pub fn add(
        &self,
        awakable: Arc<dyn Awakable>,
        signals: Signals,
        context: usize,
        state: HandleSignalsState,
    ) -> Result<()> {
        if state.satisfied.intersects(signals) {
            return Err(MojoResult::AlreadyExists);
        }
        if !state.satisfiable.intersects(signals) {
            return Err(MojoResult::FailedPrecondition);
        }
        self.entries.lock().unwrap().push(AwakableEntry { awakable, signals, context });
        Ok(())
    }

    pub fn remove(&self, awakable: &Arc<dyn Awakable>) {
        self.entries.lock().unwrap().retain(|e| !Arc::ptr_eq(&e.awakable, awakable));
    }

    /// Offer the new state to every registered awakable; those that
    /// match wake and are removed.
    pub fn awake_for_state_change(&self, state: HandleSignalsState) {
        let mut entries = self.entries.lock().unwrap();
        let mut remaining = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if state.satisfied.intersects(entry.signals) {
                entry.awakable.awake(MojoResult::Ok, state, entry.context);
            } else if !state.satisfiable.intersects(entry.signals) {
                entry.awakable.awake(MojoResult::FailedPrecondition, state, entry.context);
            } else {
                remaining.push(entry);
            }
        }
        *entries = remaining;
    }

    /// Wake every awakable with `Cancelled`, used on close.
    pub fn cancel_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        for entry in entries {
            entry.awakable.awake(MojoResult::Cancelled, HandleSignalsState::default(), entry.context);
        }
    }
}

/// Shared bookkeeping embedded by every dispatcher variant: the
/// closed/transit flags and the awakable list.
#[derive(Default)]
pub struct Envelope {
    closed: AtomicBool,
    in_transit: AtomicBool,
    pub awakables: AwakableList,
}

impl Envelope {
    pub fn new() -> Envelope {
        Envelope::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_in_transit(&self) -> bool {
        self.in_transit.load(Ordering::Acquire)
    }

    /// Mark closed for the first time; returns `false` if already
    /// closed, matching the §8 idempotence law (`Close` is `Ok` once,
    /// `InvalidArgument` thereafter).
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn begin_transit(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        if self.in_transit.swap(true, Ordering::AcqRel) {
            return Err(MojoResult::InvalidArgument);
        }
        Ok(())
    }

    pub fn cancel_transit(&self) {
        self.in_transit.store(false, Ordering::Release);
    }

    /// Guard against mutation while frozen for transit; call at the top
    /// of every mutating operation.
    pub fn check_mutable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        if self.is_in_transit() {
            return Err(MojoResult::InvalidArgument);
        }
        Ok(())
    }
}

/// The byte/port/handle counts a dispatcher needs to serialize, reported
/// by `start_serialize` ahead of `end_serialize` writing into
/// caller-sized buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializeSizes {
    pub num_bytes: usize,
    pub num_ports: usize,
    pub num_platform_handles: usize,
}

/// Everything a dispatcher variant needs to implement to be
/// handle-addressable. See §4.4.1.
pub trait Dispatcher: Send + Sync + std::any::Any {
    fn kind(&self) -> DispatcherKind;
    fn envelope(&self) -> &Envelope;

    /// Lets `Core` downcast back to the concrete dispatcher for
    /// type-specific operations (`write_data`, `duplicate_buffer_handle`,
    /// ...) that don't belong on this shared trait. Every impl just
    /// returns `self`.
    fn as_any(&self) -> &dyn std::any::Any;

    /// As [`Dispatcher::as_any`], but by owned `Arc` — needed where a
    /// concrete `Arc<T>` must be handed onward (e.g. a message pipe's
    /// attachments), not just borrowed.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;

    fn close(&self) -> Result<()> {
        if !self.envelope().mark_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        self.envelope().awakables.cancel_all();
        Ok(())
    }

    fn handle_signals_state(&self) -> HandleSignalsState;

    fn add_awakable(
        &self,
        awakable: Arc<dyn Awakable>,
        signals: Signals,
        context: usize,
    ) -> Result<()> {
        let state = self.handle_signals_state();
        self.envelope().awakables.add(awakable, signals, context, state)
    }

    fn remove_awakable(&self, awakable: &Arc<dyn Awakable>) {
        self.envelope().awakables.remove(awakable);
    }

    fn start_serialize(&self) -> Result<SerializeSizes> {
        Err(MojoResult::Unimplemented)
    }

    /// The Ports-layer port this dispatcher rides on for transfer, if
    /// any (§6.1). `None` for dispatchers with no ports participation —
    /// shared buffers and wrapped platform handles travel as inline
    /// serialized state instead, via `Core`'s transit registry.
    fn transit_port(&self) -> Option<crate::ports::port::PortRef> {
        None
    }

    fn end_serialize(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Err(MojoResult::Unimplemented)
    }

    fn begin_transit(&self) -> Result<()> {
        self.envelope().begin_transit()
    }

    fn cancel_transit(&self) {
        self.envelope().cancel_transit()
    }

    /// Commit transit: the dispatcher's state has already moved into the
    /// outgoing message; close it locally without re-entering
    /// `close`'s awakable-cancellation (there's nothing left waiting on
    /// a dispatcher that was already frozen for transit).
    fn complete_transit_and_close(&self) {
        self.envelope().closed.store(true, Ordering::Release);
    }
}
