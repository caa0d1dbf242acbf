//! The wrapped platform handle dispatcher: a trivial carrier for a
//! single OS handle, backing the public wrap/unwrap API.

use std::sync::Arc;

use crate::dispatcher::{Dispatcher, DispatcherKind, Envelope, HandleSignalsState, Signals};
use crate::error::Result;

/// The logical kind of a wrapped OS handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformHandleKind {
    FileDescriptor,
    WindowsHandle,
    MachPort,
}

/// A raw OS handle value, opaque to this crate beyond its kind. Real
/// backends substitute a type with a `Drop` impl that closes the
/// descriptor; this value type alone has no ownership semantics on its
/// own, which is why it is always held inside a dispatcher (or a
/// message in transit) rather than passed around loose.
#[derive(Debug, Clone, Copy)]
pub struct PlatformHandle {
    pub kind: PlatformHandleKind,
    pub value: i64,
}

pub struct WrappedPlatformHandleDispatcher {
    handle: PlatformHandle,
    envelope: Envelope,
}

impl WrappedPlatformHandleDispatcher {
    pub fn wrap(handle: PlatformHandle) -> WrappedPlatformHandleDispatcher {
        WrappedPlatformHandleDispatcher { handle, envelope: Envelope::new() }
    }

    /// Consume the dispatcher, returning the wrapped handle. Fails if
    /// already closed or in transit.
    pub fn unwrap(&self) -> Result<PlatformHandle> {
        self.envelope.check_mutable()?;
        Ok(self.handle)
    }
}

impl Dispatcher for WrappedPlatformHandleDispatcher {
    fn kind(&self) -> DispatcherKind {
        DispatcherKind::WrappedPlatformHandle
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
        HandleSignalsState { satisfied: Signals::NONE, satisfiable: Signals::NONE }
    }

    fn start_serialize(&self) -> Result<crate::dispatcher::SerializeSizes> {
        Ok(crate::dispatcher::SerializeSizes { num_bytes: 0, num_ports: 0, num_platform_handles: 1 })
    }

    /// Zero state bytes — the handle itself is the whole payload, and it
    /// travels as the one declared platform handle, not as wire bytes.
    fn end_serialize(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}
