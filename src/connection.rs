use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::protocol::seq::seq_diff;
use crate::protocol::Frame;
use crate::rtt::RttEstimator;
use crate::transport::Transport;

/// Connection lifecycle phase. Transitions are monotonic: once a connection
///  reaches `Disconnected` it never leaves it, and nothing ever returns to
///  `NotConnected`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    NotConnected,
    /// client side: connect sent, waiting for welcome or reject
    Connecting,
    /// server side: connect received, waiting for the application to accept or reject
    Pending,
    Connected,
    Disconnected,
}

/// width of the receive window tracked by the ack bitfield
const ACK_WINDOW: i32 = 16;

struct PendingAck {
    datagram: Bytes,
    first_sent_at: Instant,
    last_sent_at: Instant,
    retry_count: u32,
}

/// Per-peer protocol state: sequence counters and the sliding receive window
///  for reliable delivery, the retransmission table, liveness clocks, and the
///  RTT estimate. The owning peer drives it from `tick()` and passes the
///  transport in explicitly - a connection never holds a reference to its
///  parent.
pub struct Connection {
    remote_addr: SocketAddr,
    /// server-assigned client id; 0 while unassigned
    id: u16,
    state: ConnectionState,
    next_reliable_seq: u16,
    last_received_seq: u16,
    received_bitfield: u16,
    pending_acks: FxHashMap<u16, PendingAck>,
    last_heard_from: Instant,
    last_heartbeat_sent: Instant,
    rtt: RttEstimator,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr, state: ConnectionState) -> Connection {
        let now = Instant::now();
        Connection {
            remote_addr,
            id: 0,
            state,
            next_reliable_seq: 1,
            last_received_seq: 0,
            received_bitfield: 0,
            pending_acks: FxHashMap::default(),
            last_heard_from: now,
            last_heartbeat_sent: now,
            rtt: RttEstimator::new(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state == ConnectionState::Disconnected && state != ConnectionState::Disconnected {
            warn!("connection to {} is already closed, ignoring transition to {:?}", self.remote_addr, state);
            return;
        }
        debug!("connection to {}: {:?} -> {:?}", self.remote_addr, self.state, state);
        self.state = state;
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.rtt.smoothed_rtt()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub(crate) fn mark_heard(&mut self, now: Instant) {
        self.last_heard_from = now;
    }

    pub(crate) fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_heard_from) > timeout
    }

    pub(crate) fn heartbeat_due(&self, now: Instant, interval: Duration) -> bool {
        now.duration_since(self.last_heartbeat_sent) >= interval
    }

    pub(crate) async fn send_unreliable(
        &self,
        transport: &dyn Transport,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let frame = Frame::Unreliable {
            payload: Bytes::copy_from_slice(payload),
        };
        transport.send(self.remote_addr, &frame.to_datagram()).await
    }

    /// Assign the next sequence number, put the frame on the wire and record it
    ///  for retransmission until the peer acknowledges it.
    pub(crate) async fn send_reliable(
        &mut self,
        transport: &dyn Transport,
        payload: &[u8],
        now: Instant,
    ) -> anyhow::Result<u16> {
        let seq = self.next_reliable_seq;
        self.next_reliable_seq = self.next_reliable_seq.wrapping_add(1);

        let datagram = Frame::Reliable {
            seq,
            payload: Bytes::copy_from_slice(payload),
        }
        .to_datagram();

        trace!("sending reliable seq {} to {}", seq, self.remote_addr);
        transport.send(self.remote_addr, &datagram).await?;

        self.pending_acks.insert(
            seq,
            PendingAck {
                datagram,
                first_sent_at: now,
                last_sent_at: now,
                retry_count: 0,
            },
        );
        Ok(seq)
    }

    /// Process an inbound reliable frame: acknowledge it (before any further
    ///  inbound frame is looked at) and return the payload if it has not been
    ///  delivered before.
    pub(crate) async fn on_reliable(
        &mut self,
        transport: &dyn Transport,
        seq: u16,
        payload: Bytes,
    ) -> anyhow::Result<Option<Bytes>> {
        let fresh = self.track_received(seq);

        let ack = if seq == self.last_received_seq {
            Frame::Ack {
                seq: self.last_received_seq,
                bitfield: self.received_bitfield,
            }
        } else {
            // behind or outside the window - acknowledge exactly this sequence
            Frame::AckExtra { seq }
        };
        transport.send(self.remote_addr, &ack.to_datagram()).await?;

        if !fresh {
            trace!("duplicate reliable seq {} from {} - dropped", seq, self.remote_addr);
        }
        Ok(if fresh { Some(payload) } else { None })
    }

    /// Slide the receive window for `seq` and decide whether the payload is new.
    fn track_received(&mut self, seq: u16) -> bool {
        let diff = seq_diff(seq, self.last_received_seq) as i32;

        if diff > 0 {
            // newest sequence so far: shift the window and mark the previous newest
            self.received_bitfield = if diff >= ACK_WINDOW {
                0
            } else {
                self.received_bitfield << diff
            };
            if diff <= ACK_WINDOW {
                self.received_bitfield |= 1 << (diff - 1);
            }
            self.last_received_seq = seq;
            true
        } else if diff == 0 {
            false
        } else {
            let behind = -diff;
            if behind > ACK_WINDOW {
                // too old to track, certainly seen before
                return false;
            }
            let mask = 1u16 << (behind - 1);
            if self.received_bitfield & mask != 0 {
                false
            } else {
                self.received_bitfield |= mask;
                true
            }
        }
    }

    /// The peer acknowledged `seq` as its newest received sequence, plus the 16
    ///  sequences before it per the bitfield.
    pub(crate) fn on_ack(&mut self, seq: u16, bitfield: u16, now: Instant) {
        self.clear_pending(seq, now);
        for bit in 0..ACK_WINDOW as u16 {
            if bitfield & (1 << bit) != 0 {
                self.clear_pending(seq.wrapping_sub(bit + 1), now);
            }
        }
    }

    /// The peer acknowledged a single straggler outside its current window.
    pub(crate) fn on_ack_extra(&mut self, seq: u16, now: Instant) {
        self.clear_pending(seq, now);
    }

    fn clear_pending(&mut self, seq: u16, now: Instant) {
        if let Some(pending) = self.pending_acks.remove(&seq) {
            trace!("seq {} to {} acknowledged after {} retries", seq, self.remote_addr, pending.retry_count);
            if pending.retry_count == 0 {
                // a retransmitted frame's ack is ambiguous, no usable sample
                self.rtt.sample(now.duration_since(pending.first_sent_at));
            }
        }
    }

    /// Re-send every pending reliable frame whose last transmission is older
    ///  than the current retransmission timeout. There is no retry cap - only
    ///  the connection timeout bounds how long this goes on.
    pub(crate) async fn retransmit_overdue(
        &mut self,
        transport: &dyn Transport,
        now: Instant,
    ) -> anyhow::Result<()> {
        let rto = self.rtt.retransmit_timeout();
        let overdue = self
            .pending_acks
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_sent_at) > rto)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();

        for seq in overdue {
            let datagram = match self.pending_acks.get_mut(&seq) {
                Some(pending) => {
                    pending.last_sent_at = now;
                    pending.retry_count += 1;
                    debug!("re-sending reliable seq {} to {} (retry {})", seq, self.remote_addr, pending.retry_count);
                    pending.datagram.clone()
                }
                None => continue,
            };
            transport.send(self.remote_addr, &datagram).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_heartbeat(
        &mut self,
        transport: &dyn Transport,
        now: Instant,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        self.last_heartbeat_sent = now;
        let frame = Frame::Heartbeat {
            echo: false,
            timestamp_ms: now_ms,
        };
        transport.send(self.remote_addr, &frame.to_datagram()).await
    }

    /// A probe is echoed back with its timestamp; an echo of our own probe
    ///  yields an RTT sample.
    pub(crate) async fn on_heartbeat(
        &mut self,
        transport: &dyn Transport,
        echo: bool,
        timestamp_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        if !echo {
            let reply = Frame::Heartbeat {
                echo: true,
                timestamp_ms,
            };
            return transport.send(self.remote_addr, &reply.to_datagram()).await;
        }

        if timestamp_ms > now_ms {
            warn!("heartbeat echo from {} carries a future timestamp - this points to manipulations at the network level", self.remote_addr);
            return Ok(());
        }
        self.rtt.sample(Duration::from_millis(now_ms - timestamp_ms));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use crate::test_util::transport::RecordingTransport;

    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    fn connection() -> Connection {
        Connection::new(test_addr(), ConnectionState::Connected)
    }

    async fn deliver(conn: &mut Connection, transport: &RecordingTransport, seq: u16) -> bool {
        conn.on_reliable(transport, seq, Bytes::from_static(b"x"))
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn test_in_order_delivery_and_acks() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        assert!(deliver(&mut conn, &transport, 1).await);
        assert!(deliver(&mut conn, &transport, 2).await);
        assert!(deliver(&mut conn, &transport, 3).await);

        let sent = transport.take_sent().await;
        assert_eq!(sent.len(), 3);
        // each reliable frame is acknowledged with the newest seq + bitfield
        //  (bit 2 marks the seq-0 baseline the window started from)
        assert_eq!(&sent[2].1[..], &Frame::Ack { seq: 3, bitfield: 0b111 }.to_datagram()[..]);
    }

    #[tokio::test]
    async fn test_duplicates_are_suppressed_but_still_acked() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        assert!(deliver(&mut conn, &transport, 1).await);
        assert!(deliver(&mut conn, &transport, 2).await);
        transport.take_sent().await;

        // duplicate of the newest: dropped, acked with the full window
        assert!(!deliver(&mut conn, &transport, 2).await);
        // duplicate behind the newest: dropped, acked as a straggler
        assert!(!deliver(&mut conn, &transport, 1).await);

        let sent = transport.take_sent().await;
        assert_eq!(&sent[0].1[..], &Frame::Ack { seq: 2, bitfield: 0b11 }.to_datagram()[..]);
        assert_eq!(&sent[1].1[..], &Frame::AckExtra { seq: 1 }.to_datagram()[..]);
    }

    #[tokio::test]
    async fn test_gap_is_filled_exactly_once() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        assert!(deliver(&mut conn, &transport, 1).await);
        assert!(deliver(&mut conn, &transport, 5).await);
        // late arrival inside the window is delivered once
        assert!(deliver(&mut conn, &transport, 3).await);
        assert!(!deliver(&mut conn, &transport, 3).await);
        assert_eq!(conn.last_received_seq, 5);
    }

    #[tokio::test]
    async fn test_window_edge_sixteen_behind() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        assert!(deliver(&mut conn, &transport, 20).await);
        // exactly 16 behind the newest: acceptable while the bit is clear
        assert!(deliver(&mut conn, &transport, 4).await);
        assert!(!deliver(&mut conn, &transport, 4).await);
        // more than 16 behind: always dropped
        assert!(!deliver(&mut conn, &transport, 3).await);
    }

    #[tokio::test]
    async fn test_sequence_wrap_keeps_deduplicating() {
        let transport = RecordingTransport::new();
        let mut conn = connection();
        conn.last_received_seq = 0xfffe;

        assert!(deliver(&mut conn, &transport, 0xffff).await);
        assert!(deliver(&mut conn, &transport, 1).await);
        assert_eq!(conn.last_received_seq, 1);
        // all pre-wrap sequences are now behind the newest and suppressed
        assert!(!deliver(&mut conn, &transport, 0xffff).await);
        assert!(!deliver(&mut conn, &transport, 0xfffe).await);
        // a pre-wrap sequence that was never seen is still deliverable
        assert!(deliver(&mut conn, &transport, 0xfffd).await);
    }

    #[tokio::test]
    async fn test_jump_beyond_window_resets_bitfield() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        assert!(deliver(&mut conn, &transport, 1).await);
        assert!(deliver(&mut conn, &transport, 100).await);
        assert_eq!(conn.received_bitfield, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_clears_pending_and_samples_rtt() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        let now = Instant::now();
        conn.send_reliable(&transport, b"a", now).await.unwrap();
        conn.send_reliable(&transport, b"b", now).await.unwrap();
        conn.send_reliable(&transport, b"c", now).await.unwrap();
        assert_eq!(conn.pending_ack_count(), 3);

        advance(Duration::from_millis(30)).await;
        // peer saw seq 3 newest, and seqs 1 and 2 per the bitfield
        conn.on_ack(3, 0b11, Instant::now());
        assert_eq!(conn.pending_ack_count(), 0);
        assert_eq!(conn.smoothed_rtt(), Duration::from_millis(30));

        // re-acknowledging is a no-op
        conn.on_ack(3, 0b11, Instant::now());
        assert_eq!(conn.pending_ack_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmitted_frame_yields_no_rtt_sample() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        conn.send_reliable(&transport, b"a", Instant::now()).await.unwrap();
        advance(Duration::from_millis(60)).await;
        conn.retransmit_overdue(&transport, Instant::now()).await.unwrap();

        advance(Duration::from_millis(10)).await;
        conn.on_ack_extra(1, Instant::now());
        assert_eq!(conn.pending_ack_count(), 0);
        assert_eq!(conn.smoothed_rtt(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_frames_are_resent_until_acked() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        conn.send_reliable(&transport, b"a", Instant::now()).await.unwrap();
        transport.take_sent().await;

        // inside the 50ms floor: nothing to do
        advance(Duration::from_millis(40)).await;
        conn.retransmit_overdue(&transport, Instant::now()).await.unwrap();
        assert!(transport.take_sent().await.is_empty());

        advance(Duration::from_millis(20)).await;
        conn.retransmit_overdue(&transport, Instant::now()).await.unwrap();
        let resent = transport.take_sent().await;
        assert_eq!(resent.len(), 1);
        assert_eq!(&resent[0].1[..], &Frame::Reliable { seq: 1, payload: Bytes::from_static(b"a") }.to_datagram()[..]);
        assert_eq!(conn.pending_acks.get(&1).unwrap().retry_count, 1);

        // and again after another timeout - there is no retry cap
        advance(Duration::from_millis(60)).await;
        conn.retransmit_overdue(&transport, Instant::now()).await.unwrap();
        assert_eq!(conn.pending_acks.get(&1).unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_sequence_wraps() {
        let transport = RecordingTransport::new();
        let mut conn = connection();
        conn.next_reliable_seq = 0xffff;

        let now = Instant::now();
        assert_eq!(conn.send_reliable(&transport, b"a", now).await.unwrap(), 0xffff);
        assert_eq!(conn.send_reliable(&transport, b"b", now).await.unwrap(), 0);
        assert_eq!(conn.send_reliable(&transport, b"c", now).await.unwrap(), 1);
        assert_eq!(conn.pending_ack_count(), 3);

        // the peer acks seq 1 with a bitfield covering 0 and 0xffff
        conn.on_ack(1, 0b11, Instant::now());
        assert_eq!(conn.pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_probe_is_echoed_verbatim() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        conn.on_heartbeat(&transport, false, 12345, 99999).await.unwrap();

        let sent = transport.take_sent().await;
        assert_eq!(&sent[0].1[..], &Frame::Heartbeat { echo: true, timestamp_ms: 12345 }.to_datagram()[..]);
    }

    #[tokio::test]
    async fn test_heartbeat_echo_samples_rtt() {
        let transport = RecordingTransport::new();
        let mut conn = connection();

        conn.on_heartbeat(&transport, true, 1000, 1080).await.unwrap();
        assert_eq!(conn.smoothed_rtt(), Duration::from_millis(80));
        assert!(transport.take_sent().await.is_empty());

        // an echo from the future is ignored
        conn.on_heartbeat(&transport, true, 5000, 1080).await.unwrap();
        assert_eq!(conn.smoothed_rtt(), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_heartbeat_clocks() {
        let mut conn = connection();
        let timeout = Duration::from_millis(5000);
        let interval = Duration::from_millis(1000);

        assert!(!conn.is_timed_out(Instant::now(), timeout));
        assert!(!conn.heartbeat_due(Instant::now(), interval));

        advance(Duration::from_millis(1000)).await;
        assert!(conn.heartbeat_due(Instant::now(), interval));

        advance(Duration::from_millis(4001)).await;
        assert!(conn.is_timed_out(Instant::now(), timeout));

        conn.mark_heard(Instant::now());
        assert!(!conn.is_timed_out(Instant::now(), timeout));
    }

    #[test]
    fn test_closed_connection_stays_closed() {
        let mut conn = connection();
        conn.set_state(ConnectionState::Disconnected);
        conn.set_state(ConnectionState::Connected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
