use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::error::QueueError;
use super::packet::RawPacket;

#[derive(Debug, Default)]
struct Pending {
    packets: Vec<RawPacket>,
    closed: bool,
}

/// What the consumer took from the queue in one drain
#[derive(Debug, Default)]
pub struct Drained {
    pub packets: Vec<RawPacket>,
    /// The queue was closed when drained; no more packets will arrive
    pub closed: bool,
}

/// PacketQueue hands batches of packets from the readout threads to the formatter.
///
/// Any number of producers submit; a single consumer drains the whole pending list at
/// once. The lock is held only to move packets in and out.
#[derive(Debug, Default)]
pub struct PacketQueue {
    pending: Mutex<Pending>,
    wakeup: Condvar,
    input_bytes: AtomicI64,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of packets from a board and wake the consumer.
    ///
    /// Fails once the queue is closed, handing the packets back.
    pub fn submit(&self, board_id: u16, packets: Vec<RawPacket>) -> Result<(), QueueError> {
        if packets.is_empty() {
            return Ok(());
        }
        let bytes: usize = packets.iter().map(RawPacket::size_bytes).sum();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(QueueError::Closed(board_id, packets));
            }
            pending.packets.extend(packets);
            self.input_bytes.fetch_add(bytes as i64, Ordering::Relaxed);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Wait up to `timeout` for packets, then take everything pending.
    ///
    /// Returns immediately if packets are already waiting or the queue is closed.
    pub fn drain(&self, timeout: Duration) -> Drained {
        let mut pending = self.pending.lock();
        self.wakeup.wait_while_for(
            &mut pending,
            |p| p.packets.is_empty() && !p.closed,
            timeout,
        );
        let packets = std::mem::take(&mut pending.packets);
        let closed = pending.closed;
        drop(pending);

        let bytes: usize = packets.iter().map(RawPacket::size_bytes).sum();
        self.input_bytes.fetch_sub(bytes as i64, Ordering::Relaxed);
        Drained { packets, closed }
    }

    /// Refuse further submissions and wake the consumer. Pending packets stay drainable.
    pub fn close(&self) {
        self.pending.lock().closed = true;
        self.wakeup.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Bytes submitted but not yet drained
    pub fn input_bytes(&self) -> i64 {
        self.input_bytes.load(Ordering::Relaxed)
    }
}
