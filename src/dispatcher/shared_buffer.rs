//! The shared buffer dispatcher: wraps a platform shared-memory
//! segment, duplicable and mappable.

use std::sync::{Arc, Mutex};

use crate::dispatcher::{Dispatcher, DispatcherKind, Envelope, HandleSignalsState, Signals};
use crate::error::{MojoResult, Result};

/// The in-process stand-in for a platform shared memory segment. A real
/// backend would hold an OS handle (POSIX `memfd`/`shm_open`, Win32
/// file mapping); this crate's loopback backend holds the bytes
/// directly behind a lock, since every "process" sharing it is in fact
/// this one process (§4.3a).
pub struct SharedMemorySegment {
    pub num_bytes: usize,
    bytes: Mutex<Vec<u8>>,
}

impl SharedMemorySegment {
    pub fn new(num_bytes: usize) -> Arc<SharedMemorySegment> {
        Arc::new(SharedMemorySegment { num_bytes, bytes: Mutex::new(vec![0u8; num_bytes]) })
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let bytes = self.bytes.lock().unwrap();
        bytes
            .get(offset..offset + len)
            .map(|s| s.to_vec())
            .ok_or(MojoResult::InvalidArgument)
    }

    pub fn write(&self, offset: usize, data: &[u8], read_only: bool) -> Result<()> {
        if read_only {
            return Err(MojoResult::PermissionDenied);
        }
        let mut bytes = self.bytes.lock().unwrap();
        let dst = bytes.get_mut(offset..offset + data.len()).ok_or(MojoResult::InvalidArgument)?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

/// Duplication options (§4.4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateOptions {
    pub read_only: bool,
}

pub struct SharedBufferDispatcher {
    segment: Arc<SharedMemorySegment>,
    read_only: bool,
    envelope: Envelope,
}

impl SharedBufferDispatcher {
    /// Create a fresh, writable segment of `num_bytes`.
    ///
    /// Resolves the open question on read-only duplication (§9) by not
    /// needing to: the writable dispatcher always holds the one true
    /// segment, and `duplicate_buffer_handle(READ_ONLY)` hands out a new
    /// dispatcher over the *same* `Arc<SharedMemorySegment>` tagged
    /// read-only, so the read-only view is always derivable without any
    /// platform-specific "produce a read-only duplicate" step.
    pub fn create(num_bytes: usize) -> Arc<SharedBufferDispatcher> {
        Arc::new(SharedBufferDispatcher {
            segment: SharedMemorySegment::new(num_bytes),
            read_only: false,
            envelope: Envelope::new(),
        })
    }

    pub fn num_bytes(&self) -> usize {
        self.segment.num_bytes
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn duplicate_buffer_handle(&self, options: DuplicateOptions) -> Result<Arc<SharedBufferDispatcher>> {
        self.envelope.check_mutable()?;
        let read_only = self.read_only || options.read_only;
        Ok(Arc::new(SharedBufferDispatcher {
            segment: self.segment.clone(),
            read_only,
            envelope: Envelope::new(),
        }))
    }

    pub fn map_buffer(&self, offset: usize, length: usize) -> Result<Mapping> {
        self.envelope.check_mutable()?;
        if offset + length > self.segment.num_bytes {
            return Err(MojoResult::InvalidArgument);
        }
        Ok(Mapping { segment: self.segment.clone(), offset, length, read_only: self.read_only })
    }
}

impl Dispatcher for SharedBufferDispatcher {
    fn kind(&self) -> DispatcherKind {
        DispatcherKind::SharedBuffer
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
        Ok(crate::dispatcher::SerializeSizes { num_bytes: 16, num_ports: 0, num_platform_handles: 1 })
    }

    /// §6.1: `num_bytes: u64`, a one-bit `read_only` flag packed into
    /// `flags: u32`, and four bytes of padding to round out to 16.
    fn end_serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&(self.segment.num_bytes as u64).to_le_bytes());
        let flags: u32 = if self.read_only { 1 } else { 0 };
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        Ok(())
    }
}

/// A mapping of part of a shared buffer. Drop releases no OS resource in
/// the loopback backend (the segment lives as long as any dispatcher
/// referencing it), but a real backend would `munmap`/`UnmapViewOfFile`
/// here.
pub struct Mapping {
    segment: Arc<SharedMemorySegment>,
    offset: usize,
    length: usize,
    read_only: bool,
}

impl Mapping {
    pub fn read(&self) -> Vec<u8> {
        self.segment.read(self.offset, self.length).expect("mapping bounds already validated")
    }

    pub fn write(&self, local_offset: usize, data: &[u8]) -> Result<()> {
        if local_offset + data.len() > self.length {
            return Err(MojoResult::InvalidArgument);
        }
        self.segment.write(self.offset + local_offset, data, self.read_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_read_only_sees_writes() {
        let buf = SharedBufferDispatcher::create(4096);
        let mapping = buf.map_buffer(0, 4096).unwrap();
        mapping.write(100, &[0xAB]).unwrap();

        let dup = buf.duplicate_buffer_handle(DuplicateOptions { read_only: true }).unwrap();
        assert!(dup.read_only());
        let dup_mapping = dup.map_buffer(0, 4096).unwrap();
        assert_eq!(dup_mapping.read()[100], 0xAB);
        assert_eq!(dup_mapping.write(100, &[0]).unwrap_err(), MojoResult::PermissionDenied);
    }

    #[test]
    fn end_serialize_packs_num_bytes_and_read_only_flag() {
        let buf = SharedBufferDispatcher::create(4096);
        let dup = buf.duplicate_buffer_handle(DuplicateOptions { read_only: true }).unwrap();

        let mut out = Vec::new();
        dup.end_serialize(&mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 4096);
        assert_eq!(u32::from_le_bytes(out[8..12].try_into().unwrap()), 1);
    }
}
