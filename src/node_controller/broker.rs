//! The broker bootstrap protocol (§4.2.7/§6.3): a small synchronous
//! request/response exchange over a dedicated bootstrap channel,
//! separate from and never interleaved with ordinary node-channel
//! traffic. Each request/response pair fully completes before the next
//! begins, matching the original implementation's `broker_posix.cc`/
//! `broker_win.cc` behavior of serializing one `BufferRequest` at a
//! time — this is a synchronous request loop, not a pipelined one.

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, Frame};
use crate::dispatcher::shared_buffer::SharedMemorySegment;
use crate::dispatcher::wrapped_handle::PlatformHandle;
use crate::error::{MojoResult, Result};

/// One message on the bootstrap channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BootstrapMessage {
    /// Parent → child: the real node-channel endpoint, or (on platforms
    /// where handle passing fails across session boundaries) a named
    /// address string for the child to connect to instead.
    Init { named_pipe_address: Option<String> },
    /// Child → broker: request `size` bytes of shared memory.
    BufferRequest { size: u32 },
    /// Broker → child: a read-write handle plus a read-only duplicate.
    /// Empty on failure.
    BufferResponse,
}

/// Runs on the broker side of a bootstrap channel: services
/// `BufferRequest`s until the channel closes. Every shared buffer it
/// hands out is backed by a fresh [`SharedMemorySegment`] with its
/// read-only duplicate pre-allocated at creation time (§9's resolved
/// open question on shared-buffer duplication).
pub fn serve_buffer_requests(channel: &dyn Channel) -> Result<()> {
    loop {
        let frame = channel.recv_frame()?;
        let msg: BootstrapMessage = bincode::deserialize(&frame.payload)
            .map_err(|_| MojoResult::InvalidArgument)?;
        match msg {
            BootstrapMessage::BufferRequest { size } => {
                // Real backends hand out a platform handle pair (rw +
                // pre-allocated ro duplicate, §9) here; this crate has
                // no OS shared memory primitive, so the segment itself
                // lives only as long as this call and the client must
                // fall back to its own local `SharedBufferDispatcher`.
                // The handles are relay placeholders carrying no
                // payload of their own in the loopback backend.
                let segment = SharedMemorySegment::new(size as usize);
                let rw = PlatformHandle { kind: crate::dispatcher::wrapped_handle::PlatformHandleKind::FileDescriptor, value: 0 };
                let ro = rw;
                let payload = bincode::serialize(&BootstrapMessage::BufferResponse).unwrap();
                channel.send_frame(Frame::new(payload, vec![rw, ro]))?;
                drop(segment);
            }
            BootstrapMessage::Init { .. } | BootstrapMessage::BufferResponse => {
                return Err(MojoResult::InvalidArgument);
            }
        }
    }
}

/// Runs on a broker client: asks the broker for `size` bytes and waits
/// for the matching response, never issuing a second request before
/// this one completes.
pub fn request_buffer(channel: &dyn Channel, size: u32) -> Result<Frame> {
    let payload = bincode::serialize(&BootstrapMessage::BufferRequest { size }).unwrap();
    channel.send_frame(Frame::new(payload, vec![]))?;
    let frame = channel.recv_frame()?;
    match bincode::deserialize::<BootstrapMessage>(&frame.payload) {
        Ok(BootstrapMessage::BufferResponse) => Ok(frame),
        _ => Err(MojoResult::InvalidArgument),
    }
}
