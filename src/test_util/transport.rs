use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;

use crate::transport::{InboundDatagram, Transport};

/// Decides per outbound datagram whether it reaches the wire. Returning false
///  silently swallows the datagram - the sender keeps believing it was sent.
pub type DropPolicy = Box<dyn FnMut(&[u8], SocketAddr) -> bool + Send>;

type EndpointMap = Arc<RwLock<FxHashMap<SocketAddr, mpsc::Sender<InboundDatagram>>>>;

/// An in-memory network connecting [LoopbackTransport] endpoints by fake
///  socket address. Datagrams are delivered instantly and in order, subject to
///  each endpoint's drop policy - which is how tests emulate loss, blackouts
///  and flaky links deterministically.
pub struct LoopbackHub {
    endpoints: EndpointMap,
}

impl LoopbackHub {
    pub fn new() -> LoopbackHub {
        LoopbackHub {
            endpoints: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// Register an endpoint under `addr` and hand back its transport plus the
    ///  inbound receiver to construct a peer with.
    pub async fn attach(
        &self,
        addr: SocketAddr,
    ) -> (Arc<LoopbackTransport>, mpsc::Receiver<InboundDatagram>) {
        let (sender, receiver) = mpsc::channel(64);
        let prev = self.endpoints.write().await.insert(addr, sender);
        assert!(prev.is_none(), "second endpoint for {}", addr);

        (
            Arc::new(LoopbackTransport {
                endpoints: self.endpoints.clone(),
                addr,
                drop_policy: Mutex::new(None),
            }),
            receiver,
        )
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackTransport {
    endpoints: EndpointMap,
    addr: SocketAddr,
    drop_policy: Mutex<Option<DropPolicy>>,
}

impl LoopbackTransport {
    pub async fn set_drop_policy(&self, policy: DropPolicy) {
        *self.drop_policy.lock().await = Some(policy);
    }

    pub async fn clear_drop_policy(&self) {
        *self.drop_policy.lock().await = None;
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        if let Some(policy) = self.drop_policy.lock().await.as_mut() {
            if !policy(datagram, to) {
                trace!("loopback dropped {} bytes from {} to {}", datagram.len(), self.addr, to);
                return Ok(());
            }
        }

        let sender = self
            .endpoints
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| anyhow!("no endpoint attached at {}", to))?;
        sender
            .send(InboundDatagram {
                bytes: BytesMut::from(datagram),
                from: self.addr,
            })
            .await
            .map_err(|_| anyhow!("endpoint {} is gone", to))
    }

    fn shut_down(&self) {
        // endpoints disappear when the peer drops its receiver
    }
}

/// Records every outbound datagram instead of delivering it, in send order.
///  The unit-test counterpart to a mock socket: assertions inspect the exact
///  bytes a component put on the wire.
pub struct RecordingTransport {
    addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl RecordingTransport {
    pub fn new() -> RecordingTransport {
        RecordingTransport {
            addr: "127.0.0.1:1".parse().expect("literal address"),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// all datagrams sent since the last call, oldest first
    pub async fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((to, Bytes::copy_from_slice(datagram)));
        Ok(())
    }

    fn shut_down(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_loopback_delivers_between_endpoints() {
        let hub = LoopbackHub::new();
        let (a, _a_inbound) = hub.attach(addr(1)).await;
        let (_b, mut b_inbound) = hub.attach(addr(2)).await;

        a.send(addr(2), b"\x00hi").await.unwrap();

        let datagram = b_inbound.try_recv().unwrap();
        assert_eq!(&datagram.bytes[..], b"\x00hi");
        assert_eq!(datagram.from, addr(1));
    }

    #[tokio::test]
    async fn test_drop_policy_swallows_datagrams() {
        let hub = LoopbackHub::new();
        let (a, _a_inbound) = hub.attach(addr(1)).await;
        let (_b, mut b_inbound) = hub.attach(addr(2)).await;

        let mut dropped_once = false;
        a.set_drop_policy(Box::new(move |_, _| {
            let deliver = dropped_once;
            dropped_once = true;
            deliver
        }))
        .await;

        a.send(addr(2), b"\x00first").await.unwrap();
        a.send(addr(2), b"\x00second").await.unwrap();

        let datagram = b_inbound.try_recv().unwrap();
        assert_eq!(&datagram.bytes[..], b"\x00second");
        assert!(b_inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_endpoint_fails() {
        let hub = LoopbackHub::new();
        let (a, _inbound) = hub.attach(addr(1)).await;
        assert!(a.send(addr(9), b"\x00x").await.is_err());
    }
}
