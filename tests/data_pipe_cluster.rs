//! Data pipe byte transfer, backpressure, and two-phase I/O (§4.4.3)
//! driven through a `Core` bound to one node of a real multi-node
//! [`LocalCluster`] — confirming the rebuilt control-port-plus-segment
//! design holds up once the owning node also has peers to route to.

#![cfg(feature = "testing")]

use mojo_edk::core::Core;
use mojo_edk::dispatcher::data_pipe::{DataPipeOptions, TransferFlags};
use mojo_edk::testing::LocalCluster;
use mojo_edk::MojoResult;

#[test]
fn data_pipe_round_trips_bytes_on_a_clustered_node() {
    let cluster = LocalCluster::new(2);
    let core = Core::new(cluster.broker().clone());

    let (producer, consumer) =
        core.create_data_pipe(DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 8 });

    let n = core.write_data(producer, b"hello", TransferFlags::default()).unwrap();
    assert_eq!(n, 5);

    let mut out = [0u8; 5];
    let n = core.read_data(consumer, &mut out, TransferFlags::default()).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&out, b"hello");
}

#[test]
fn data_pipe_applies_backpressure_at_capacity() {
    let cluster = LocalCluster::new(2);
    let core = Core::new(cluster.broker().clone());

    let (producer, _consumer) =
        core.create_data_pipe(DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 4 });

    let n = core.write_data(producer, b"abcd", TransferFlags::default()).unwrap();
    assert_eq!(n, 4);

    // Capacity is full and nothing has acked a read yet.
    assert_eq!(
        core.write_data(producer, b"e", TransferFlags::default()),
        Err(MojoResult::ShouldWait)
    );
}

#[test]
fn data_pipe_two_phase_write_then_read_round_trips() {
    let cluster = LocalCluster::new(2);
    let core = Core::new(cluster.broker().clone());

    let (producer, consumer) =
        core.create_data_pipe(DataPipeOptions { element_num_bytes: 1, capacity_num_bytes: 16 });

    let (offset, len) = core.begin_write_data(producer, 4).unwrap();
    assert!(len >= 4);
    let _ = offset;
    core.end_write_data(producer, 4).unwrap();

    let (offset, len) = core.begin_read_data(consumer).unwrap();
    assert!(len >= 4);
    let _ = offset;
    core.end_read_data(consumer, 4).unwrap();

    // Drained: another read should now block.
    let mut out = [0u8; 1];
    assert_eq!(
        core.read_data(consumer, &mut out, TransferFlags::default()),
        Err(MojoResult::ShouldWait)
    );
}
