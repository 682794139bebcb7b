pub mod udp;

use std::net::SocketAddr;

use bytes::BytesMut;

/// Upper bound for a single datagram on the wire. Chosen to stay below the
///  common 1280-byte path MTU so frames never hit IP-level fragmentation.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

/// A raw datagram handed from the transport to the engine. Delivery happens
///  through a thread-safe FIFO; the engine drains it only during `tick()`, so
///  transports may produce from any context.
#[derive(Debug)]
pub struct InboundDatagram {
    pub bytes: BytesMut,
    pub from: SocketAddr,
}

/// The datagram I/O seam underneath a peer. Implementations deliver inbound
///  datagrams through the `mpsc` channel handed out at construction time and
///  send outbound bytes to an endpoint on request.
///
/// It is passed around as an `Arc<dyn ...>` to keep the engine independent of
///  the concrete I/O strategy (real UDP socket, in-memory loopback, ...).
#[async_trait::async_trait]
pub trait Transport: Sync + Send {
    fn local_addr(&self) -> SocketAddr;

    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;

    /// stop producing inbound datagrams and release the underlying resources
    fn shut_down(&self);
}
