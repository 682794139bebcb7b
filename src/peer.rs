use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::PeerConfig;
use crate::message::MessagePool;
use crate::transport::{InboundDatagram, MAX_DATAGRAM_SIZE};

/// Work scheduled for a later tick.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum DelayedEvent {
    /// tear down a rejected connection once its final reject copies have had
    ///  time to drain
    CloseRejectedConnection { remote_addr: SocketAddr },
    /// garbage-collect a pending connection the application never decided on
    ExpirePendingConnection { remote_addr: SocketAddr },
}

struct DelayedEntry {
    fire_at: Instant,
    /// tie-breaker preserving schedule order for equal timestamps
    seq: u64,
    event: DelayedEvent,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// State shared by client and server peers: the monotonic clock anchor, the
///  thread-safe inbound FIFO the transport feeds, the delayed-event queue, and
///  the message pool.
///
/// Everything here is consumed exclusively from `tick()` on the driving
///  thread; the FIFO is the only crossing point from the transport's I/O
///  context.
pub(crate) struct PeerCore {
    start_time: Instant,
    config: Arc<PeerConfig>,
    pool: Arc<MessagePool>,
    inbound: mpsc::Receiver<InboundDatagram>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    next_delayed_seq: u64,
}

impl PeerCore {
    pub fn new(config: PeerConfig, inbound: mpsc::Receiver<InboundDatagram>) -> PeerCore {
        PeerCore {
            start_time: Instant::now(),
            config: Arc::new(config),
            pool: Arc::new(MessagePool::default()),
            inbound,
            delayed: BinaryHeap::new(),
            next_delayed_seq: 0,
        }
    }

    /// how many datagrams the inbound FIFO may hold, derived from the
    ///  configured socket buffer size
    pub fn inbound_queue_capacity(config: &PeerConfig) -> usize {
        (config.socket_buffer_size / MAX_DATAGRAM_SIZE).max(1)
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// milliseconds since this peer started - the protocol's wire timestamp
    pub fn now_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Move everything the transport delivered since the last tick into
    ///  `into`, preserving arrival order. Non-blocking.
    pub fn drain_inbound(&mut self, into: &mut Vec<InboundDatagram>) {
        while let Ok(datagram) = self.inbound.try_recv() {
            into.push(datagram);
        }
    }

    pub fn schedule(&mut self, delay: Duration, event: DelayedEvent) {
        let seq = self.next_delayed_seq;
        self.next_delayed_seq += 1;
        self.delayed.push(Reverse(DelayedEntry {
            fire_at: Instant::now() + delay,
            seq,
            event,
        }));
    }

    /// The next delayed event whose time has come, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<DelayedEvent> {
        match self.delayed.peek() {
            Some(Reverse(entry)) if entry.fire_at <= now => {
                let Reverse(entry) = self.delayed.pop().expect("peek just succeeded");
                Some(entry.event)
            }
            _ => None,
        }
    }
}
