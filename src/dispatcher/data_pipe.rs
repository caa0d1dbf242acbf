//! Data pipe producer/consumer dispatchers: each side owns a control
//! port (a `Node::create_port_pair` half) used to exchange
//! `DataWasWritten`/`DataWasRead` bookkeeping, while the actual bytes
//! live in a `SharedMemorySegment` both sides hold an `Arc` to (§4.4.3).
//! Moving the control port through the ports layer is what lets the
//! read/write offsets stay in sync once a pipe half is transferred to
//! another node; the segment itself only ever travels within one
//! process, the same limitation `SharedBufferDispatcher` already has.

use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::dispatcher::shared_buffer::SharedMemorySegment;
use crate::dispatcher::{Dispatcher, DispatcherKind, Envelope, HandleSignalsState, Signals};
use crate::error::{MojoResult, Result};
use crate::names::PortName;
use crate::ports::node::Node;
use crate::ports::port::{PortObserver, PortRef};

/// Creation options for a data pipe (§4.4.3).
#[derive(Debug, Clone, Copy)]
pub struct DataPipeOptions {
    pub element_num_bytes: usize,
    pub capacity_num_bytes: usize,
}

impl Default for DataPipeOptions {
    fn default() -> DataPipeOptions {
        DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 64 * 1024 }
    }
}

impl DataPipeOptions {
    pub fn normalized(self) -> DataPipeOptions {
        let element = self.element_num_bytes.max(1);
        let mut capacity = self.capacity_num_bytes.max(element);
        if capacity % element != 0 {
            capacity += element - (capacity % element);
        }
        DataPipeOptions { element_num_bytes: element, capacity_num_bytes: capacity }
    }
}

/// Write semantics for `write_data`/`read_data` (§4.4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFlags {
    pub all_or_none: bool,
    pub peek: bool,
    pub discard: bool,
    pub query: bool,
}

/// Bookkeeping carried over the control port. Bytes themselves never
/// ride along; both sides already share the segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum ControlMessage {
    DataWasWritten { num_bytes: usize },
    DataWasRead { num_bytes: usize },
}

fn send_control(node: &Node, control: PortRef, message: ControlMessage) -> Result<()> {
    let payload = bincode::serialize(&message).map_err(|_| MojoResult::Internal)?;
    node.send_message(control, payload, &[])
}

fn write_wrapping(segment: &SharedMemorySegment, capacity: usize, offset: usize, data: &[u8]) -> Result<()> {
    let first = (capacity - offset).min(data.len());
    segment.write(offset, &data[..first], false)?;
    if first < data.len() {
        segment.write(0, &data[first..], false)?;
    }
    Ok(())
}

fn read_wrapping(segment: &SharedMemorySegment, capacity: usize, offset: usize, len: usize) -> Result<Vec<u8>> {
    let first = (capacity - offset).min(len);
    let mut out = segment.read(offset, first)?;
    if first < len {
        out.extend_from_slice(&segment.read(0, len - first)?);
    }
    Ok(out)
}

/// Create a linked producer/consumer pair on `node`.
pub fn create_pair(
    node: Arc<Node>,
    options: DataPipeOptions,
) -> (Arc<DataPipeProducerDispatcher>, Arc<DataPipeConsumerDispatcher>) {
    let options = options.normalized();
    let segment = SharedMemorySegment::new(options.capacity_num_bytes);
    let (producer_port, consumer_port) = node.create_port_pair();

    let producer = Arc::new(DataPipeProducerDispatcher {
        node: node.clone(),
        control: producer_port,
        segment: segment.clone(),
        options,
        state: Mutex::new(ProducerState { write_offset: 0, unacked: 0, two_phase_open: false }),
        envelope: Envelope::new(),
    });
    let consumer = Arc::new(DataPipeConsumerDispatcher {
        node: node.clone(),
        control: consumer_port,
        segment,
        options,
        state: Mutex::new(ConsumerState { read_offset: 0, available: 0, two_phase_open: false }),
        envelope: Envelope::new(),
    });

    let _ = node.set_user_data(
        producer_port,
        Arc::new(ProducerObserver { producer: Arc::downgrade(&producer) }),
    );
    let _ = node.set_user_data(
        consumer_port,
        Arc::new(ConsumerObserver { consumer: Arc::downgrade(&consumer) }),
    );

    (producer, consumer)
}

struct ProducerState {
    write_offset: usize,
    /// Bytes written but not yet acknowledged as read by the consumer —
    /// the portion of capacity currently unavailable to write into.
    unacked: usize,
    two_phase_open: bool,
}

pub struct DataPipeProducerDispatcher {
    node: Arc<Node>,
    control: PortRef,
    segment: Arc<SharedMemorySegment>,
    options: DataPipeOptions,
    state: Mutex<ProducerState>,
    envelope: Envelope,
}

impl DataPipeProducerDispatcher {
    /// Apply every `DataWasRead` bookkeeping message the consumer has
    /// sent since the last drain, freeing up capacity.
    fn drain_control(&self) {
        while let Ok(Some(msg)) = self.node.get_message(self.control) {
            if let Ok(ControlMessage::DataWasRead { num_bytes }) = bincode::deserialize(&msg.payload) {
                self.state.lock().unwrap().unacked = self.state.lock().unwrap().unacked.saturating_sub(num_bytes);
            }
        }
    }

    fn notify_written(&self, num_bytes: usize) -> Result<()> {
        if num_bytes == 0 {
            return Ok(());
        }
        send_control(&self.node, self.control, ControlMessage::DataWasWritten { num_bytes })
    }

    pub fn write_data(&self, data: &[u8], flags: TransferFlags) -> Result<usize> {
        self.envelope.check_mutable()?;
        self.drain_control();
        let peer_closed = self.node.get_status(self.control)?.peer_closed;
        let mut state = self.state.lock().unwrap();
        if state.two_phase_open {
            return Err(MojoResult::Busy);
        }
        if peer_closed {
            return Err(MojoResult::FailedPrecondition);
        }
        let stride = self.options.element_num_bytes;
        if data.len() % stride != 0 {
            return Err(MojoResult::InvalidArgument);
        }
        let capacity = self.options.capacity_num_bytes;
        let available = capacity - state.unacked;
        if available == 0 && !data.is_empty() {
            return Err(MojoResult::ShouldWait);
        }
        let to_write = if flags.all_or_none {
            if data.len() > available {
                return Err(MojoResult::OutOfRange);
            }
            data.len()
        } else {
            data.len().min(available - available % stride)
        };
        write_wrapping(&self.segment, capacity, state.write_offset, &data[..to_write])?;
        state.write_offset = (state.write_offset + to_write) % capacity;
        state.unacked += to_write;
        drop(state);
        self.notify_written(to_write)?;
        Ok(to_write)
    }

    pub fn begin_write_data(&self, min_bytes: usize) -> Result<(usize, usize)> {
        self.envelope.check_mutable()?;
        self.drain_control();
        let peer_closed = self.node.get_status(self.control)?.peer_closed;
        let mut state = self.state.lock().unwrap();
        if state.two_phase_open {
            return Err(MojoResult::Busy);
        }
        if peer_closed {
            return Err(MojoResult::FailedPrecondition);
        }
        let capacity = self.options.capacity_num_bytes;
        let available = capacity - state.unacked;
        if min_bytes > available {
            return Err(MojoResult::ResourceExhausted);
        }
        let contiguous = (capacity - state.write_offset).min(available);
        state.two_phase_open = true;
        Ok((state.write_offset, contiguous))
    }

    pub fn end_write_data(&self, written: usize) -> Result<()> {
        self.drain_control();
        let mut state = self.state.lock().unwrap();
        if !state.two_phase_open {
            return Err(MojoResult::FailedPrecondition);
        }
        state.two_phase_open = false;
        let capacity = self.options.capacity_num_bytes;
        state.write_offset = (state.write_offset + written) % capacity;
        state.unacked += written;
        drop(state);
        self.notify_written(written)
    }
}

impl Dispatcher for DataPipeProducerDispatcher {
    fn kind(&self) -> DispatcherKind {
        DispatcherKind::DataPipeProducer
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
        if self.envelope.is_closed() {
            return HandleSignalsState::default();
        }
        self.drain_control();
        let peer_closed = self.node.get_status(self.control).map(|s| s.peer_closed).unwrap_or(true);
        let state = self.state.lock().unwrap();
        let mut satisfied = Signals::NONE;
        let mut satisfiable = Signals::PEER_CLOSED;
        let available = self.options.capacity_num_bytes - state.unacked;
        if available > 0 && !state.two_phase_open {
            satisfied = satisfied.union(Signals::WRITABLE);
        }
        if !peer_closed {
            satisfiable = satisfiable.union(Signals::WRITABLE);
        }
        if peer_closed {
            satisfied = satisfied.union(Signals::PEER_CLOSED);
        }
        HandleSignalsState { satisfied, satisfiable }
    }

    fn close(&self) -> Result<()> {
        if !self.envelope.mark_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        self.envelope.awakables.cancel_all();
        let _ = self.node.close_port(self.control);
        Ok(())
    }

    fn start_serialize(&self) -> Result<crate::dispatcher::SerializeSizes> {
        Ok(crate::dispatcher::SerializeSizes { num_bytes: 24, num_ports: 1, num_platform_handles: 1 })
    }

    fn end_serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        let state = self.state.lock().unwrap();
        buf.extend_from_slice(&(self.options.element_num_bytes as u64).to_le_bytes());
        buf.extend_from_slice(&(self.options.capacity_num_bytes as u64).to_le_bytes());
        buf.extend_from_slice(&(state.write_offset as u64).to_le_bytes());
        Ok(())
    }
}

struct ConsumerState {
    read_offset: usize,
    /// Bytes the producer has reported written but not yet read here.
    available: usize,
    two_phase_open: bool,
}

pub struct DataPipeConsumerDispatcher {
    node: Arc<Node>,
    control: PortRef,
    segment: Arc<SharedMemorySegment>,
    options: DataPipeOptions,
    state: Mutex<ConsumerState>,
    envelope: Envelope,
}

impl DataPipeConsumerDispatcher {
    /// Apply every `DataWasWritten` bookkeeping message the producer has
    /// sent since the last drain, making new bytes visible to read.
    fn drain_control(&self) {
        while let Ok(Some(msg)) = self.node.get_message(self.control) {
            if let Ok(ControlMessage::DataWasWritten { num_bytes }) = bincode::deserialize(&msg.payload) {
                self.state.lock().unwrap().available += num_bytes;
            }
        }
    }

    fn notify_read(&self, num_bytes: usize) -> Result<()> {
        if num_bytes == 0 {
            return Ok(());
        }
        send_control(&self.node, self.control, ControlMessage::DataWasRead { num_bytes })
    }

    /// Returns the number of bytes copied into `out`, honoring `flags`.
    pub fn read_data(&self, out: &mut [u8], flags: TransferFlags) -> Result<usize> {
        self.envelope.check_mutable()?;
        self.drain_control();
        let peer_closed = self.node.get_status(self.control)?.peer_closed;
        let mut state = self.state.lock().unwrap();
        if state.two_phase_open {
            return Err(MojoResult::Busy);
        }
        if flags.query {
            return Ok(state.available);
        }
        if state.available == 0 {
            return if peer_closed { Err(MojoResult::FailedPrecondition) } else { Err(MojoResult::ShouldWait) };
        }
        let to_read = if flags.all_or_none {
            if out.len() > state.available {
                return Err(MojoResult::OutOfRange);
            }
            out.len()
        } else {
            out.len().min(state.available)
        };
        let capacity = self.options.capacity_num_bytes;
        let bytes = read_wrapping(&self.segment, capacity, state.read_offset, to_read)?;
        out[..to_read].copy_from_slice(&bytes);
        if !flags.peek {
            state.read_offset = (state.read_offset + to_read) % capacity;
            state.available -= to_read;
            drop(state);
            self.notify_read(to_read)?;
        }
        Ok(to_read)
    }

    pub fn begin_read_data(&self) -> Result<(usize, usize)> {
        self.envelope.check_mutable()?;
        self.drain_control();
        let peer_closed = self.node.get_status(self.control)?.peer_closed;
        let mut state = self.state.lock().unwrap();
        if state.two_phase_open {
            return Err(MojoResult::Busy);
        }
        if state.available == 0 {
            return if peer_closed { Err(MojoResult::FailedPrecondition) } else { Err(MojoResult::ShouldWait) };
        }
        let capacity = self.options.capacity_num_bytes;
        let contiguous = (capacity - state.read_offset).min(state.available);
        state.two_phase_open = true;
        Ok((state.read_offset, contiguous))
    }

    pub fn end_read_data(&self, read: usize) -> Result<()> {
        self.drain_control();
        let mut state = self.state.lock().unwrap();
        if !state.two_phase_open {
            return Err(MojoResult::FailedPrecondition);
        }
        state.two_phase_open = false;
        let capacity = self.options.capacity_num_bytes;
        state.read_offset = (state.read_offset + read) % capacity;
        state.available -= read;
        drop(state);
        self.notify_read(read)
    }
}

impl Dispatcher for DataPipeConsumerDispatcher {
    fn kind(&self) -> DispatcherKind {
        DispatcherKind::DataPipeConsumer
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
        if self.envelope.is_closed() {
            return HandleSignalsState::default();
        }
        self.drain_control();
        let peer_closed = self.node.get_status(self.control).map(|s| s.peer_closed).unwrap_or(true);
        let state = self.state.lock().unwrap();
        let mut satisfied = Signals::NONE;
        let mut satisfiable = Signals::PEER_CLOSED;
        if state.available > 0 && !state.two_phase_open {
            satisfied = satisfied.union(Signals::READABLE);
        }
        if !peer_closed || state.available > 0 {
            satisfiable = satisfiable.union(Signals::READABLE);
        }
        if peer_closed {
            satisfied = satisfied.union(Signals::PEER_CLOSED);
        }
        HandleSignalsState { satisfied, satisfiable }
    }

    fn close(&self) -> Result<()> {
        if !self.envelope.mark_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        self.envelope.awakables.cancel_all();
        let _ = self.node.close_port(self.control);
        Ok(())
    }

    fn start_serialize(&self) -> Result<crate::dispatcher::SerializeSizes> {
        Ok(crate::dispatcher::SerializeSizes { num_bytes: 24, num_ports: 1, num_platform_handles: 1 })
    }

    fn end_serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        let state = self.state.lock().unwrap();
        buf.extend_from_slice(&(self.options.element_num_bytes as u64).to_le_bytes());
        buf.extend_from_slice(&(self.options.capacity_num_bytes as u64).to_le_bytes());
        buf.extend_from_slice(&(state.read_offset as u64).to_le_bytes());
        Ok(())
    }
}

/// Bridges the producer's control port to its own awakable list — a
/// `DataWasRead` arriving there means capacity opened up.
struct ProducerObserver {
    producer: Weak<DataPipeProducerDispatcher>,
}

impl PortObserver for ProducerObserver {
    fn on_status_changed(&self, _port: PortName) {
        if let Some(p) = self.producer.upgrade() {
            p.drain_control();
            let state = p.handle_signals_state();
            p.envelope.awakables.awake_for_state_change(state);
        }
    }
}

/// Bridges the consumer's control port to its own awakable list — a
/// `DataWasWritten` arriving there means new bytes are readable.
struct ConsumerObserver {
    consumer: Weak<DataPipeConsumerDispatcher>,
}

impl PortObserver for ConsumerObserver {
    fn on_status_changed(&self, _port: PortName) {
        if let Some(c) = self.consumer.upgrade() {
            c.drain_control();
            let state = c.handle_signals_state();
            c.envelope.awakables.awake_for_state_change(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::NodeName;
    use crate::ports::message::Message;
    use crate::ports::node::NodeDelegate;

    struct NoopDelegate;
    impl NodeDelegate for NoopDelegate {
        fn forward_message(&self, _node: NodeName, _message: Message) {}
        fn broadcast_message(&self, _message: Message) {}
        fn port_status_changed(&self, _port: PortRef) {}
    }

    fn node() -> Arc<Node> {
        Arc::new(Node::new(NodeName::random(), Arc::new(NoopDelegate)))
    }

    #[test]
    fn capacity_round_trip_and_backpressure() {
        let options = DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 8 };
        let (producer, consumer) = create_pair(node(), options);

        let n = producer.write_data(&[1, 2, 3, 4, 5, 6, 7, 8], TransferFlags::default()).unwrap();
        assert_eq!(n, 8);
        assert_eq!(
            producer.write_data(&[9], TransferFlags::default()).unwrap_err(),
            MojoResult::ShouldWait
        );

        let mut buf = [0u8; 4];
        let read = consumer.read_data(&mut buf, TransferFlags::default()).unwrap();
        assert_eq!(read, 4);
        assert_eq!(buf, [1, 2, 3, 4]);

        let n = producer.write_data(&[9, 10, 11, 12], TransferFlags::default()).unwrap();
        assert_eq!(n, 4);

        consumer.close().unwrap();
        assert_eq!(
            producer.write_data(&[0], TransferFlags::default()).unwrap_err(),
            MojoResult::FailedPrecondition
        );
    }

    struct Recorder(Mutex<Vec<MojoResult>>);
    impl crate::dispatcher::Awakable for Recorder {
        fn awake(&self, result: MojoResult, _state: HandleSignalsState, _context: usize) {
            self.0.lock().unwrap().push(result);
        }
    }

    #[test]
    fn write_wakes_consumer_readable_and_read_wakes_producer_writable() {
        let options = DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 4 };
        let (producer, consumer) = create_pair(node(), options);

        let consumer_woken: Arc<Recorder> = Arc::new(Recorder(Mutex::new(Vec::new())));
        consumer.add_awakable(consumer_woken.clone(), Signals::READABLE, 0).unwrap();

        producer.write_data(&[1, 2], TransferFlags::default()).unwrap();
        assert_eq!(consumer_woken.0.lock().unwrap().len(), 1);

        // Drain the pipe down to empty so producer is writable again,
        // then fill it so WRITABLE is no longer satisfied before we
        // register for it.
        let mut drain = [0u8; 2];
        consumer.read_data(&mut drain, TransferFlags::default()).unwrap();
        producer.write_data(&[3, 4, 5, 6], TransferFlags::default()).unwrap();

        let producer_woken: Arc<Recorder> = Arc::new(Recorder(Mutex::new(Vec::new())));
        producer.add_awakable(producer_woken.clone(), Signals::WRITABLE, 0).unwrap();

        let mut buf = [0u8; 4];
        consumer.read_data(&mut buf, TransferFlags::default()).unwrap();
        assert_eq!(producer_woken.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn two_phase_write_then_read_round_trips_bytes() {
        let options = DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 16 };
        let (producer, consumer) = create_pair(node(), options);

        let (offset, len) = producer.begin_write_data(4).unwrap();
        assert!(len >= 4);
        let _ = offset;
        producer.end_write_data(4).unwrap();

        let mut out = [0u8; 4];
        let n = consumer.read_data(&mut out, TransferFlags::default()).unwrap();
        assert_eq!(n, 4);
    }
}
