//! The `Core`: the handle table plus the suspension/notification
//! primitives built on top of it (§4.5/§4.6). Every public entry point
//! enters a [`RequestContext`](request_context::RequestContext) for the
//! duration of the call, so any watcher a dispatcher wakes along the
//! way is deferred until the call's locks have all been released.

pub mod handle_table;
pub mod request_context;
pub mod waiter;
pub mod watcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::dispatcher::data_pipe::{self, DataPipeOptions, TransferFlags};
use crate::dispatcher::message_pipe::{MessagePipeDispatcher, ReadFlags};
use crate::dispatcher::shared_buffer::{DuplicateOptions, Mapping, SharedBufferDispatcher};
use crate::dispatcher::wait_set::WaitSetDispatcher;
use crate::dispatcher::wrapped_handle::{PlatformHandle, WrappedPlatformHandleDispatcher};
use crate::dispatcher::{Awakable, Dispatcher, HandleSignalsState, Signals};
use crate::error::{MojoResult, Result};
use crate::node_controller::NodeController;

pub use handle_table::Handle;
use handle_table::HandleTable;
use request_context::{RequestContext, Source};
use waiter::Waiter;
pub use watcher::Watcher;

/// The process-wide singleton, initialized on first use (§9's
/// "once_cell-initialized Core" note). Most applications only ever need
/// one; tests and the multi-node harness build their own instances
/// directly instead of going through this.
static GLOBAL: OnceCell<Arc<Core>> = OnceCell::new();

/// Owns the handle table and the node controller it routes handle
/// traffic through.
pub struct Core {
    node_controller: Arc<NodeController>,
    handles: Mutex<HandleTable>,
    /// Holds attachments that have no Ports-layer port of their own
    /// (shared buffers, wrapped handles) between `write_message` and the
    /// matching `read_message`, keyed by a random id carried inline in
    /// the message payload. Only resolves within this `Core` — the same
    /// already-documented limitation `SharedBufferDispatcher` has for
    /// cross-node transfer, since there is no real platform-handle
    /// channel backing it (see DESIGN.md).
    transit: Mutex<HashMap<u64, Arc<dyn Dispatcher>>>,
}

/// A message frozen for transit by `alloc_message` (§4.5): payload plus
/// every attachment, each already past `begin_transit`. Consumed by
/// `write_message` on success, released by `free_message` if the caller
/// abandons the send instead.
pub struct MessageForTransit {
    payload: Vec<u8>,
    attachments: Vec<Arc<dyn Dispatcher>>,
}

/// The wire tag for a dispatcher kind, used by `get_message_buffer`'s
/// §6.1 header and by the same-process transit-registry prefix.
fn dispatcher_type_tag(kind: crate::dispatcher::DispatcherKind) -> i32 {
    use crate::dispatcher::DispatcherKind::*;
    match kind {
        MessagePipe => 1,
        DataPipeProducer => 2,
        DataPipeConsumer => 3,
        SharedBuffer => 4,
        WrappedPlatformHandle => 5,
        WaitSet => 6,
    }
}

impl Core {
    pub fn new(node_controller: Arc<NodeController>) -> Arc<Core> {
        Arc::new(Core {
            node_controller,
            handles: Mutex::new(HandleTable::new()),
            transit: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide instance, created on its own single-node
    /// controller the first time this is called.
    pub fn global() -> &'static Arc<Core> {
        GLOBAL.get_or_init(|| Core::new(NodeController::new(crate::names::NodeName::random(), true)))
    }

    pub fn node_controller(&self) -> &Arc<NodeController> {
        &self.node_controller
    }

    fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Handle {
        self.handles.lock().unwrap().add(dispatcher)
    }

    fn dispatcher(&self, handle: Handle) -> Result<Arc<dyn Dispatcher>> {
        self.handles.lock().unwrap().get(handle)
    }

    fn downcast<T: Send + Sync + 'static>(dispatcher: Arc<dyn Dispatcher>) -> Result<Arc<T>> {
        dispatcher.as_any_arc().downcast::<T>().map_err(|_| MojoResult::InvalidArgument)
    }

    /// Close a handle: per §5, atomically closes the dispatcher, wakes
    /// every waiter with `Cancelled`, and defers watch-cancel
    /// finalizers into this call's request context.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let dispatcher = self.handles.lock().unwrap().remove(handle)?;
        dispatcher.close()
    }

    pub fn get_handle_signals_state(&self, handle: Handle) -> Result<HandleSignalsState> {
        Ok(self.dispatcher(handle)?.handle_signals_state())
    }

    // -- message pipes (§4.4.2) --------------------------------------

    pub fn create_message_pipe(&self) -> (Handle, Handle) {
        let (a, b) = self.node_controller.node().create_port_pair();
        let pa = MessagePipeDispatcher::new(self.node_controller.node().clone(), a);
        let pb = MessagePipeDispatcher::new(self.node_controller.node().clone(), b);
        (self.add_dispatcher(pa), self.add_dispatcher(pb))
    }

    /// §4.5: reserve `payload` and freeze every handle in `attachments`
    /// for transit. On error every handle already taken is restored to
    /// the table untouched, same as a plain failed `write_message` used
    /// to guarantee.
    pub fn alloc_message(&self, payload: Vec<u8>, attachments: Vec<Handle>) -> Result<MessageForTransit> {
        let mut handles = self.handles.lock().unwrap();
        let mut dispatchers = Vec::with_capacity(attachments.len());
        for h in &attachments {
            match handles.remove(*h) {
                Ok(d) => dispatchers.push(d),
                Err(e) => {
                    for d in dispatchers {
                        handles.add(d);
                    }
                    return Err(e);
                }
            }
        }
        drop(handles);

        for i in 0..dispatchers.len() {
            if let Err(e) = dispatchers[i].begin_transit() {
                for d in &dispatchers[..i] {
                    d.cancel_transit();
                }
                let mut handles = self.handles.lock().unwrap();
                for d in dispatchers {
                    handles.add(d);
                }
                return Err(e);
            }
        }

        Ok(MessageForTransit { payload, attachments: dispatchers })
    }

    /// Abandon a message built by `alloc_message` without sending it:
    /// every attachment's transit is cancelled and it returns to the
    /// handle table.
    pub fn free_message(&self, message: MessageForTransit) {
        let mut handles = self.handles.lock().unwrap();
        for d in message.attachments {
            d.cancel_transit();
            handles.add(d);
        }
    }

    /// §6.1: render a message's dispatcher-serialization header plus its
    /// user payload into one buffer. Exposed for introspection/parity
    /// with the mandated API; `write_message` itself uses a simpler
    /// prefix (see below) since attachments here never leave this
    /// process via a real OS transport.
    pub fn get_message_buffer(&self, message: &MessageForTransit) -> Result<Vec<u8>> {
        let mut headers = Vec::new();
        let mut bodies = Vec::new();
        for d in &message.attachments {
            let sizes = d.start_serialize()?;
            headers.extend_from_slice(&dispatcher_type_tag(d.kind()).to_le_bytes());
            headers.extend_from_slice(&(sizes.num_bytes as u32).to_le_bytes());
            headers.extend_from_slice(&(sizes.num_ports as u32).to_le_bytes());
            headers.extend_from_slice(&(sizes.num_platform_handles as u32).to_le_bytes());
            if sizes.num_bytes > 0 {
                d.end_serialize(&mut bodies)?;
            }
        }
        let mut buf = Vec::with_capacity(8 + headers.len() + bodies.len() + message.payload.len());
        buf.extend_from_slice(&(message.attachments.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(headers.len() as u32).to_le_bytes());
        buf.extend_from_slice(&headers);
        buf.extend_from_slice(&bodies);
        buf.extend_from_slice(&message.payload);
        Ok(buf)
    }

    /// §4.4.2/§4.5: write `payload` through `handle`, carrying
    /// `attachments` of any dispatcher kind (not just message pipes).
    /// Attachments backed by a Ports port (message pipes) physically
    /// move through the ports layer alongside the frame; attachments
    /// with no port (shared buffers, wrapped handles, data pipes) ride
    /// via the transit registry instead, keyed by an id carried in a
    /// small prefix ahead of the caller's own payload.
    pub fn write_message(&self, handle: Handle, payload: Vec<u8>, attachments: &[Handle]) -> Result<()> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        if attachments.iter().any(|&h| h == handle) {
            return Err(MojoResult::InvalidArgument);
        }
        let dispatcher = Self::downcast::<MessagePipeDispatcher>(self.dispatcher(handle)?)?;
        let message = self.alloc_message(payload, attachments.to_vec())?;

        let mut ports = Vec::new();
        let mut tags = Vec::with_capacity(message.attachments.len());
        let mut registry_entries: Vec<(u64, Arc<dyn Dispatcher>)> = Vec::new();
        for a in &message.attachments {
            match a.transit_port() {
                Some(p) => {
                    tags.push(0u8);
                    ports.push(p);
                }
                None => {
                    let id = rand::random::<u64>();
                    tags.push(1u8);
                    registry_entries.push((id, a.clone()));
                }
            }
        }

        let mut wire_payload =
            Vec::with_capacity(4 + message.attachments.len() * 9 + message.payload.len());
        wire_payload.extend_from_slice(&(message.attachments.len() as u32).to_le_bytes());
        let mut registry_iter = registry_entries.iter();
        for &tag in &tags {
            wire_payload.push(tag);
            if tag == 1 {
                let (id, _) = registry_iter.next().expect("tags/registry_entries built in lockstep above");
                wire_payload.extend_from_slice(&id.to_le_bytes());
            }
        }
        wire_payload.extend_from_slice(&message.payload);

        match dispatcher.send_raw(wire_payload, &ports) {
            Ok(()) => {
                for (id, d) in registry_entries {
                    self.transit.lock().unwrap().insert(id, d);
                }
                for a in &message.attachments {
                    a.complete_transit_and_close();
                }
                Ok(())
            }
            Err(e) => {
                self.free_message(message);
                Err(e)
            }
        }
    }

    pub fn read_message(&self, handle: Handle, flags: ReadFlags) -> Result<(Vec<u8>, Vec<Handle>)> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let dispatcher = Self::downcast::<MessagePipeDispatcher>(self.dispatcher(handle)?)?;

        if let Some(max) = flags.max_payload_bytes {
            if let Some(len) = dispatcher.peek_message_len()? {
                if len > max {
                    if flags.may_discard {
                        dispatcher.read_message()?;
                    }
                    return Err(MojoResult::ResourceExhausted);
                }
            }
        }

        let read = dispatcher.read_message()?;
        let node = self.node_controller.node().clone();
        let mut ports = read.ports.into_iter();

        if read.payload.len() < 4 {
            return Err(MojoResult::Internal);
        }
        let num_attachments =
            u32::from_le_bytes(read.payload[0..4].try_into().map_err(|_| MojoResult::Internal)?) as usize;
        let mut offset = 4;
        let mut handles = Vec::with_capacity(num_attachments);
        for _ in 0..num_attachments {
            let tag = *read.payload.get(offset).ok_or(MojoResult::Internal)?;
            offset += 1;
            match tag {
                0 => {
                    let port = ports.next().ok_or(MojoResult::Internal)?;
                    handles.push(self.add_dispatcher(MessagePipeDispatcher::new(node.clone(), port)));
                }
                1 => {
                    let bytes = read.payload.get(offset..offset + 8).ok_or(MojoResult::Internal)?;
                    let id = u64::from_le_bytes(bytes.try_into().map_err(|_| MojoResult::Internal)?);
                    offset += 8;
                    let d = self.transit.lock().unwrap().remove(&id).ok_or(MojoResult::Internal)?;
                    handles.push(self.add_dispatcher(d));
                }
                _ => return Err(MojoResult::Internal),
            }
        }
        let user_payload = read.payload[offset..].to_vec();
        Ok((user_payload, handles))
    }

    // -- data pipes (§4.4.3) ------------------------------------------

    pub fn create_data_pipe(&self, options: DataPipeOptions) -> (Handle, Handle) {
        let (producer, consumer) = data_pipe::create_pair(self.node_controller.node().clone(), options);
        (self.add_dispatcher(producer), self.add_dispatcher(consumer))
    }

    pub fn write_data(&self, handle: Handle, data: &[u8], flags: TransferFlags) -> Result<usize> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let producer = Self::downcast::<data_pipe::DataPipeProducerDispatcher>(self.dispatcher(handle)?)?;
        producer.write_data(data, flags)
    }

    pub fn begin_write_data(&self, handle: Handle, min_bytes: usize) -> Result<(usize, usize)> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let producer = Self::downcast::<data_pipe::DataPipeProducerDispatcher>(self.dispatcher(handle)?)?;
        producer.begin_write_data(min_bytes)
    }

    pub fn end_write_data(&self, handle: Handle, written: usize) -> Result<()> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let producer = Self::downcast::<data_pipe::DataPipeProducerDispatcher>(self.dispatcher(handle)?)?;
        producer.end_write_data(written)
    }

    pub fn read_data(&self, handle: Handle, out: &mut [u8], flags: TransferFlags) -> Result<usize> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let consumer = Self::downcast::<data_pipe::DataPipeConsumerDispatcher>(self.dispatcher(handle)?)?;
        consumer.read_data(out, flags)
    }

    pub fn begin_read_data(&self, handle: Handle) -> Result<(usize, usize)> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let consumer = Self::downcast::<data_pipe::DataPipeConsumerDispatcher>(self.dispatcher(handle)?)?;
        consumer.begin_read_data()
    }

    pub fn end_read_data(&self, handle: Handle, read: usize) -> Result<()> {
        let _ctx = RequestContext::enter(Source::LocalApiCall);
        let consumer = Self::downcast::<data_pipe::DataPipeConsumerDispatcher>(self.dispatcher(handle)?)?;
        consumer.end_read_data(read)
    }

    // -- shared buffers (§4.4.4) ----------------------------------------

    pub fn create_shared_buffer(&self, num_bytes: usize) -> Handle {
        self.add_dispatcher(SharedBufferDispatcher::create(num_bytes))
    }

    pub fn duplicate_buffer_handle(&self, handle: Handle, options: DuplicateOptions) -> Result<Handle> {
        let buffer = Self::downcast::<SharedBufferDispatcher>(self.dispatcher(handle)?)?;
        let dup = buffer.duplicate_buffer_handle(options)?;
        Ok(self.add_dispatcher(dup))
    }

    pub fn map_buffer(&self, handle: Handle, offset: usize, length: usize) -> Result<Mapping> {
        let buffer = Self::downcast::<SharedBufferDispatcher>(self.dispatcher(handle)?)?;
        buffer.map_buffer(offset, length)
    }

    // -- wrapped platform handles (§4.4.5) ------------------------------

    pub fn wrap_platform_handle(&self, handle: PlatformHandle) -> Handle {
        self.add_dispatcher(Arc::new(WrappedPlatformHandleDispatcher::wrap(handle)))
    }

    pub fn unwrap_platform_handle(&self, handle: Handle) -> Result<PlatformHandle> {
        let wrapped = Self::downcast::<WrappedPlatformHandleDispatcher>(self.handles.lock().unwrap().remove(handle)?)?;
        wrapped.unwrap()
    }

    // -- wait sets (§4.4.6) ----------------------------------------------

    pub fn create_wait_set(&self) -> Handle {
        self.add_dispatcher(WaitSetDispatcher::new())
    }

    pub fn wait_set_add(&self, wait_set: Handle, member: Handle, signals: Signals, context: usize) -> Result<()> {
        if wait_set == member {
            return Err(MojoResult::InvalidArgument);
        }
        let set = Self::downcast::<WaitSetDispatcher>(self.dispatcher(wait_set)?)?;
        let member_dispatcher = self.dispatcher(member)?;
        set.add_waiting_dispatcher(member_dispatcher, signals, context)
    }

    pub fn wait_set_remove(&self, wait_set: Handle, member: Handle) -> Result<()> {
        let set = Self::downcast::<WaitSetDispatcher>(self.dispatcher(wait_set)?)?;
        let member_dispatcher = self.dispatcher(member)?;
        set.remove_waiting_dispatcher(&member_dispatcher)
    }

    /// Returns up to `count` `(context, result)` pairs for members that
    /// became ready. `context` is whatever token the caller passed to
    /// `wait_set_add`, the same convention the wait-and-watch APIs use
    /// to let the caller map a wake back to its own handle.
    pub fn wait_set_get_ready(&self, wait_set: Handle, count: usize) -> Result<Vec<(usize, MojoResult)>> {
        let set = Self::downcast::<WaitSetDispatcher>(self.dispatcher(wait_set)?)?;
        Ok(set.get_ready_dispatchers(count).into_iter().map(|r| (r.context, r.result)).collect())
    }

    // -- wait / wait_many (§4.6) -----------------------------------------

    /// Block until `handle` satisfies `signals`, the deadline elapses,
    /// or the handle is closed. A suspension point (§5).
    pub fn wait(&self, handle: Handle, signals: Signals, deadline: Option<Duration>) -> Result<HandleSignalsState> {
        self.wait_many(&[(handle, signals)], deadline).map(|(_, state)| state)
    }

    pub fn wait_many(
        &self,
        entries: &[(Handle, Signals)],
        deadline: Option<Duration>,
    ) -> Result<(usize, HandleSignalsState)> {
        let waiter = Waiter::new();
        let mut armed: Vec<(Arc<dyn Dispatcher>, usize)> = Vec::with_capacity(entries.len());

        for (index, &(handle, signals)) in entries.iter().enumerate() {
            let dispatcher = match self.dispatcher(handle) {
                Ok(d) => d,
                Err(e) => {
                    Self::disarm(&armed, &waiter);
                    return Err(e);
                }
            };
            let awakable: Arc<dyn Awakable> = waiter.clone();
            match dispatcher.add_awakable(awakable, signals, index) {
                Ok(()) => armed.push((dispatcher, index)),
                Err(MojoResult::AlreadyExists) => {
                    let state = dispatcher.handle_signals_state();
                    Self::disarm(&armed, &waiter);
                    return Ok((index, state));
                }
                Err(e) => {
                    Self::disarm(&armed, &waiter);
                    return Err(e);
                }
            }
        }

        let outcome = waiter.wait(deadline);
        Self::disarm(&armed, &waiter);

        match outcome {
            Some((result, state, index)) => {
                if result.is_ok() {
                    Ok((index, state))
                } else {
                    Err(result)
                }
            }
            None => Err(MojoResult::DeadlineExceeded),
        }
    }

    fn disarm(armed: &[(Arc<dyn Dispatcher>, usize)], waiter: &Arc<Waiter>) {
        for (dispatcher, _) in armed {
            let awakable: Arc<dyn Awakable> = waiter.clone();
            dispatcher.remove_awakable(&awakable);
        }
    }

    // -- watch / cancel_watch (§4.6) --------------------------------------

    /// Attach a callback-based watch to `handle`. The watcher fires at
    /// most once; re-`watch` to re-arm. Returns the `Watcher` itself so
    /// the caller can pass it to `cancel_watch`.
    pub fn watch(
        &self,
        handle: Handle,
        signals: Signals,
        context: usize,
        callback: impl FnMut(MojoResult, HandleSignalsState, usize) + Send + 'static,
    ) -> Result<Arc<Watcher>> {
        let dispatcher = self.dispatcher(handle)?;
        let watcher = Watcher::new(callback);
        let awakable: Arc<dyn Awakable> = watcher.clone();
        dispatcher.add_awakable(awakable, signals, context)?;
        Ok(watcher)
    }

    pub fn cancel_watch(&self, handle: Handle, watcher: &Arc<Watcher>) -> Result<()> {
        let dispatcher = self.dispatcher(handle)?;
        let awakable: Arc<dyn Awakable> = watcher.clone();
        dispatcher.remove_awakable(&awakable);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::NodeName;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn core() -> Arc<Core> {
        Core::new(NodeController::new(NodeName::random(), true))
    }

    #[test]
    fn message_pipe_round_trips_payload_and_attachment() {
        let core = core();
        let (a, b) = core.create_message_pipe();
        let (inner_a, inner_b) = core.create_message_pipe();

        core.write_message(a, b"hello".to_vec(), &[inner_b]).unwrap();
        let (payload, handles) = core.read_message(b, ReadFlags::default()).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(handles.len(), 1);

        // The transferred pipe still works end to end after arriving.
        core.write_message(inner_a, b"ping".to_vec(), &[]).unwrap();
        let (payload, _) = core.read_message(handles[0], ReadFlags::default()).unwrap();
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn close_cancels_a_pending_wait() {
        let core = core();
        let (a, _b) = core.create_message_pipe();

        let closer = {
            let core = core.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                core.close(a).unwrap();
            })
        };

        let result = core.wait(a, Signals::READABLE, Some(Duration::from_secs(5)));
        closer.join().unwrap();
        assert_eq!(result, Err(MojoResult::Cancelled));
        assert_eq!(core.get_handle_signals_state(a), Err(MojoResult::InvalidArgument));
    }

    #[test]
    fn watch_fires_once_and_must_be_rearmed() {
        let core = core();
        let (a, b) = core.create_message_pipe();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_cb = fired.clone();
        let _watcher = core
            .watch(b, Signals::READABLE, 42, move |result, _state, context| {
                assert_eq!(result, MojoResult::Ok);
                assert_eq!(context, 42);
                fired_in_cb.store(true, Ordering::SeqCst);
            })
            .unwrap();

        core.write_message(a, b"hi".to_vec(), &[]).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn data_pipe_two_phase_write_then_read() {
        let core = core();
        let (producer, consumer) =
            core.create_data_pipe(DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 16 });

        let (offset, len) = core.begin_write_data(producer, 4).unwrap();
        assert!(len >= 4);
        let _ = offset;
        core.end_write_data(producer, 4).unwrap();

        let mut out = [0u8; 4];
        let n = core.read_data(consumer, &mut out, TransferFlags::default()).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn shared_buffer_duplicate_shares_bytes() {
        let core = core();
        let handle = core.create_shared_buffer(64);
        let mapping = core.map_buffer(handle, 0, 64).unwrap();
        mapping.write(0, &[7]).unwrap();

        let dup = core.duplicate_buffer_handle(handle, DuplicateOptions::default()).unwrap();
        let dup_mapping = core.map_buffer(dup, 0, 64).unwrap();
        assert_eq!(dup_mapping.read()[0], 7);
    }

    #[test]
    fn wrap_and_unwrap_platform_handle_round_trips() {
        let core = core();
        let handle = core.wrap_platform_handle(PlatformHandle {
            kind: crate::dispatcher::wrapped_handle::PlatformHandleKind::FileDescriptor,
            value: 9,
        });
        let unwrapped = core.unwrap_platform_handle(handle).unwrap();
        assert_eq!(unwrapped.value, 9);
        assert_eq!(core.unwrap_platform_handle(handle), Err(MojoResult::InvalidArgument));
    }

    #[test]
    fn wait_set_reports_context_tokens() {
        let core = core();
        let (a, b) = core.create_message_pipe();
        let ws = core.create_wait_set();
        core.wait_set_add(ws, b, Signals::READABLE, 5).unwrap();

        core.write_message(a, b"x".to_vec(), &[]).unwrap();
        let ready = core.wait_set_get_ready(ws, 4).unwrap();
        assert_eq!(ready, vec![(5, MojoResult::Ok)]);
    }

    #[test]
    fn wait_set_add_rejects_adding_itself() {
        let core = core();
        let ws = core.create_wait_set();
        assert_eq!(
            core.wait_set_add(ws, ws, Signals::READABLE, 0),
            Err(MojoResult::InvalidArgument)
        );
    }

    #[test]
    fn write_message_can_carry_a_shared_buffer_attachment() {
        let core = core();
        let (a, b) = core.create_message_pipe();
        let buffer = core.create_shared_buffer(16);
        core.map_buffer(buffer, 0, 16).unwrap().write(0, &[42]).unwrap();

        core.write_message(a, b"carrier".to_vec(), &[buffer]).unwrap();
        let (payload, handles) = core.read_message(b, ReadFlags::default()).unwrap();
        assert_eq!(payload, b"carrier");
        assert_eq!(handles.len(), 1);

        let mapping = core.map_buffer(handles[0], 0, 16).unwrap();
        assert_eq!(mapping.read()[0], 42);
    }

    #[test]
    fn write_message_can_carry_a_data_pipe_attachment() {
        let core = core();
        let (a, b) = core.create_message_pipe();
        let (producer, consumer) =
            core.create_data_pipe(DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 8 });

        core.write_message(a, b"carrier".to_vec(), &[consumer]).unwrap();
        let (_, handles) = core.read_message(b, ReadFlags::default()).unwrap();
        assert_eq!(handles.len(), 1);

        core.write_data(producer, &[1, 2, 3], TransferFlags::default()).unwrap();
        let mut out = [0u8; 3];
        let n = core.read_data(handles[0], &mut out, TransferFlags::default()).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn read_message_rejects_oversized_payload_unless_may_discard() {
        let core = core();
        let (a, b) = core.create_message_pipe();
        core.write_message(a, b"0123456789".to_vec(), &[]).unwrap();

        let flags = ReadFlags { may_discard: false, max_payload_bytes: Some(4) };
        assert_eq!(core.read_message(b, flags), Err(MojoResult::ResourceExhausted));
        // Left in place: a second attempt with room enough succeeds.
        let (payload, _) = core.read_message(b, ReadFlags::default()).unwrap();
        assert_eq!(payload, b"0123456789");

        core.write_message(a, b"0123456789".to_vec(), &[]).unwrap();
        let discard_flags = ReadFlags { may_discard: true, max_payload_bytes: Some(4) };
        assert_eq!(core.read_message(b, discard_flags), Err(MojoResult::ResourceExhausted));
        // Discarded: nothing left to read.
        assert_eq!(core.read_message(b, ReadFlags::default()), Err(MojoResult::ShouldWait));
    }
}
