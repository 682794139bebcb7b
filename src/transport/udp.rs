use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::transport::{InboundDatagram, Transport, MAX_DATAGRAM_SIZE};

/// Datagram transport over a tokio UDP socket. A background task owns the
///  receive side and feeds the engine's inbound FIFO; sending shares the same
///  socket from the caller's context.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    receive_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind `addr` (port 0 for an ephemeral port) and start the receive loop.
    ///  `inbound_capacity` bounds the number of datagrams queued for `tick()`;
    ///  when the queue is full the receive loop stalls, which shows up as UDP
    ///  drops at the OS - the engine is expected to tick frequently enough for
    ///  that to stay theoretical.
    pub async fn bind(
        addr: SocketAddr,
        inbound_capacity: usize,
    ) -> anyhow::Result<(Arc<UdpTransport>, mpsc::Receiver<InboundDatagram>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (sender, receiver) = mpsc::channel(inbound_capacity.max(1));

        let receive_task = tokio::spawn(Self::receive_loop(socket.clone(), sender));
        debug!("udp transport bound on {}", local_addr);

        Ok((
            Arc::new(UdpTransport {
                socket,
                local_addr,
                receive_task,
            }),
            receiver,
        ))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, sender: mpsc::Sender<InboundDatagram>) {
        loop {
            let mut bytes = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
            match socket.recv_buf_from(&mut bytes).await {
                Ok((len, from)) => {
                    if len > MAX_DATAGRAM_SIZE {
                        error!("received datagram of {} bytes exceeds the configured maximum - skipping", len);
                        continue;
                    }
                    trace!("received {} raw bytes from {}", len, from);
                    if sender.send(InboundDatagram { bytes, from }).await.is_err() {
                        // the engine dropped its receiver, nothing left to feed
                        break;
                    }
                }
                Err(e) => {
                    error!("error receiving UDP datagram: {}", e);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(anyhow!(
                "datagram of {} bytes exceeds the maximum of {}",
                datagram.len(),
                MAX_DATAGRAM_SIZE
            ));
        }
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    fn shut_down(&self) {
        self.receive_task.abort();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}
