//! An in-memory, `mpsc`-backed [`Channel`] pair.
//!
//! Grounded in `materialize`'s `Switchboard::local()` pattern: rather
//! than binding real sockets, tests wire nodes together over channels
//! that live entirely in one process. `LoopbackChannel` preserves frame
//! boundaries and ordering exactly like a real transport; it has no OS
//! handles to relay, so attached [`PlatformHandle`]s are carried by
//! value (they are already `Copy`) rather than duplicated through the
//! kernel.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::channel::{Channel, Frame};
use crate::error::{MojoResult, Result};

pub struct LoopbackChannel {
    tx: Sender<Frame>,
    rx: Mutex<Receiver<Frame>>,
}

impl LoopbackChannel {
    /// Create a connected pair; frames sent on one side arrive, in
    /// order, on the other.
    pub fn pair() -> (LoopbackChannel, LoopbackChannel) {
        let (tx_a, rx_b) = mpsc::channel();
        let (tx_b, rx_a) = mpsc::channel();
        (
            LoopbackChannel { tx: tx_a, rx: Mutex::new(rx_a) },
            LoopbackChannel { tx: tx_b, rx: Mutex::new(rx_b) },
        )
    }
}

impl Channel for LoopbackChannel {
    fn send_frame(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| MojoResult::Aborted)
    }

    fn recv_frame(&self) -> Result<Frame> {
        self.rx.lock().unwrap().recv().map_err(|_| MojoResult::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_arrive_in_order() {
        let (a, b) = LoopbackChannel::pair();
        a.send_frame(Frame::new(vec![1], vec![])).unwrap();
        a.send_frame(Frame::new(vec![2], vec![])).unwrap();
        assert_eq!(b.recv_frame().unwrap().payload, vec![1]);
        assert_eq!(b.recv_frame().unwrap().payload, vec![2]);
    }

    #[test]
    fn drop_surfaces_as_aborted() {
        let (a, b) = LoopbackChannel::pair();
        drop(a);
        assert_eq!(b.recv_frame().unwrap_err(), MojoResult::Aborted);
    }
}
