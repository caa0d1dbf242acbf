//! The handle table (§4.4 "Core/handle table"): maps opaque [`Handle`]
//! values to [`Dispatcher`] instances.
//!
//! Grounded on the free-list slab in `util::slab.rs` — a `Vec<Entry>`
//! where closed slots chain through a "next free" index — but each slot
//! also carries a generation counter. A handle that outlives its slot
//! (reused after close) must not silently resolve to whatever dispatcher
//! now occupies that index; the generation check turns that into
//! `InvalidArgument` instead of a use-after-free.

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{MojoResult, Result};

const NIL: u32 = u32::MAX;

enum Slot {
    Occupied { generation: u32, dispatcher: Arc<dyn Dispatcher> },
    Free { generation: u32, next: u32 },
}

/// An opaque handle. The low bits carry the slot index, the high bits a
/// generation counter; `0` is never issued (`Handle::INVALID`'s
/// reserved value), matching the core's external contract that `0` is
/// never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    fn pack(index: u32, generation: u32) -> Handle {
        // generation 0 is reserved so that index 0/generation 0 (the
        // all-zero bit pattern) never collides with a real handle.
        Handle(((generation as u64 + 1) << 32) | index as u64)
    }

    fn unpack(self) -> (u32, u32) {
        ((self.0 & 0xffff_ffff) as u32, ((self.0 >> 32) - 1) as u32)
    }

    pub fn is_invalid(self) -> bool {
        self == Handle::INVALID
    }
}

/// The table proper. Not internally locked — `Core` owns one behind its
/// own `handles_lock` per the locking hierarchy (§5).
#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free_head: u32,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable { slots: Vec::new(), free_head: NIL }
    }

    /// Insert a dispatcher, returning its fresh handle.
    pub fn add(&mut self, dispatcher: Arc<dyn Dispatcher>) -> Handle {
        if self.free_head != NIL {
            let index = self.free_head;
            let generation = match self.slots[index as usize] {
                Slot::Free { generation, next } => {
                    self.free_head = next;
                    generation
                }
                Slot::Occupied { .. } => unreachable!("free list pointed at an occupied slot"),
            };
            self.slots[index as usize] = Slot::Occupied { generation, dispatcher };
            Handle::pack(index, generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { generation: 0, dispatcher });
            Handle::pack(index, 0)
        }
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<dyn Dispatcher>> {
        if handle.is_invalid() {
            return Err(MojoResult::InvalidArgument);
        }
        let (index, generation) = handle.unpack();
        match self.slots.get(index as usize) {
            Some(Slot::Occupied { generation: g, dispatcher }) if *g == generation => Ok(dispatcher.clone()),
            _ => Err(MojoResult::InvalidArgument),
        }
    }

    /// Remove and return the dispatcher, freeing the slot for reuse
    /// under a bumped generation. Used both by `close` and by transit
    /// (the handle is consumed into an outgoing message either way).
    pub fn remove(&mut self, handle: Handle) -> Result<Arc<dyn Dispatcher>> {
        if handle.is_invalid() {
            return Err(MojoResult::InvalidArgument);
        }
        let (index, generation) = handle.unpack();
        match self.slots.get(index as usize) {
            Some(Slot::Occupied { generation: g, .. }) if *g == generation => {}
            _ => return Err(MojoResult::InvalidArgument),
        }
        let next_generation = generation.wrapping_add(1);
        let old = std::mem::replace(&mut self.slots[index as usize], Slot::Free { generation: next_generation, next: self.free_head });
        self.free_head = index;
        match old {
            Slot::Occupied { dispatcher, .. } => Ok(dispatcher),
            Slot::Free { .. } => unreachable!(),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::wrapped_handle::{PlatformHandle, PlatformHandleKind, WrappedPlatformHandleDispatcher};

    fn dummy() -> Arc<dyn Dispatcher> {
        Arc::new(WrappedPlatformHandleDispatcher::wrap(PlatformHandle { kind: PlatformHandleKind::FileDescriptor, value: 1 }))
    }

    #[test]
    fn round_trips_through_add_get_remove() {
        let mut table = HandleTable::new();
        let h = table.add(dummy());
        assert!(table.get(h).is_ok());
        table.remove(h).unwrap();
        assert_eq!(table.get(h), Err(MojoResult::InvalidArgument));
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut table = HandleTable::new();
        let h1 = table.add(dummy());
        table.remove(h1).unwrap();
        let h2 = table.add(dummy());
        assert_ne!(h1, h2);
        assert_eq!(table.get(h1), Err(MojoResult::InvalidArgument));
        assert!(table.get(h2).is_ok());
    }

    #[test]
    fn invalid_handle_is_never_valid() {
        let table = HandleTable::new();
        assert_eq!(table.get(Handle::INVALID), Err(MojoResult::InvalidArgument));
    }
}
