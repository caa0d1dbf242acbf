//! Platform transport: a bidirectional, boundary-preserving byte+handle
//! stream carrying node-channel frames.
//!
//! This module only concerns itself with frame delivery. The protocol
//! carried inside a frame's payload belongs to
//! [`node_controller`](crate::node_controller). Real OS backends
//! (stream sockets, named pipes, Mach) are contract-only here — behind
//! the `os-channel` feature there is room to add them, but this crate
//! ships one implementation unconditionally: [`loopback::LoopbackChannel`],
//! used by the test harness and this crate's own integration tests.

pub mod loopback;

use crate::dispatcher::wrapped_handle::PlatformHandle;
use crate::error::Result;

/// A single frame: payload bytes plus zero or more attached OS handles.
/// Real backends split this into `{ size, num_handles, message_type,
/// num_payload_bytes, payload[], handle_metadata[] }` on the wire (§4.3);
/// in-process backends only need the two fields.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub handles: Vec<PlatformHandle>,
}

impl Frame {
    pub fn new(payload: Vec<u8>, handles: Vec<PlatformHandle>) -> Frame {
        Frame { payload, handles }
    }
}

/// The byte+handle transport abstraction node controllers route their
/// protocol over (§4.3/§4.3a). Implementations are reliable, ordered,
/// and boundary-preserving: one `send_frame` is one `recv_frame` on the
/// other end, never split or merged.
///
/// A channel that has errored or been closed by its peer returns
/// `Err` from every subsequent call; callers are expected to drop the
/// channel and clean up as if the peer had crashed (§7).
pub trait Channel: Send + Sync {
    fn send_frame(&self, frame: Frame) -> Result<()>;

    /// Blocks the calling thread until a frame arrives, the peer closes
    /// (`Err(MojoResult::Aborted)`), or the channel has already failed
    /// (`Err(MojoResult::Unavailable)`).
    fn recv_frame(&self) -> Result<Frame>;
}
