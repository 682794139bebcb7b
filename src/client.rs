use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::events::{EventListeners, ListenerId};
use crate::message::{Message, SendMode};
use crate::peer::PeerCore;
use crate::protocol::{DisconnectReason, Frame, RejectReason};
use crate::transport::udp::UdpTransport;
use crate::transport::{InboundDatagram, Transport};

/// Why a connection attempt did not end in `Connected`.
#[derive(Debug)]
pub enum ConnectionFailure {
    /// the server answered with a reject frame
    Rejected { reason: RejectReason, payload: Bytes },
    /// no welcome arrived within the connect timeout
    TimedOut,
    /// the local transport gave up
    TransportError,
}

/// Lifecycle and data events surfaced by a [Client]. Emitted synchronously
///  from within `tick()`.
#[derive(Debug)]
pub enum ClientEvent {
    /// the handshake completed and the server assigned us a client id
    Connected,
    ConnectionFailed(ConnectionFailure),
    Disconnected { reason: DisconnectReason, payload: Bytes },
    MessageReceived { message: Message },
    /// another client joined the server
    PeerConnected { client_id: u16 },
    /// another client left the server
    PeerDisconnected { client_id: u16 },
}

/// A client peer driving exactly one connection to a server. The application
///  owns the `Client` and calls [Client::tick] from its loop; all protocol
///  work - handshake progress, acks, retransmission, heartbeats, timeout
///  detection - happens inside that call, on the calling thread.
pub struct Client {
    core: PeerCore,
    transport: Arc<dyn Transport>,
    connection: Option<Connection>,
    connect_deadline: Option<Instant>,
    last_connect_attempt: Instant,
    connect_attempts: u32,
    connect_payload: Bytes,
    events: EventListeners<ClientEvent>,
    handlers: FxHashMap<u16, Box<dyn FnMut(&mut Message) + Send>>,
}

impl Client {
    /// Bind an ephemeral UDP port and start connecting to `remote`. Drive the
    ///  returned client with [Client::tick] until the `Connected` or
    ///  `ConnectionFailed` event fires.
    pub async fn connect(remote: SocketAddr, config: PeerConfig) -> anyhow::Result<Client> {
        Self::connect_with(remote, Bytes::new(), config).await
    }

    /// Like [Client::connect], with application bytes carried in the connect
    ///  frame for the server's admission callback.
    pub async fn connect_with(
        remote: SocketAddr,
        payload: Bytes,
        config: PeerConfig,
    ) -> anyhow::Result<Client> {
        let capacity = PeerCore::inbound_queue_capacity(&config);
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal address")
        } else {
            "[::]:0".parse().expect("literal address")
        };
        let (transport, inbound) = UdpTransport::bind(bind_addr, capacity).await?;

        let mut client = Client::with_transport(transport, inbound, config);
        client.connect_to(remote, payload).await?;
        Ok(client)
    }

    /// Construct a client on an externally provided transport. Used with the
    ///  in-memory loopback transport in tests, and by applications that bring
    ///  their own datagram layer.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundDatagram>,
        config: PeerConfig,
    ) -> Client {
        Client {
            core: PeerCore::new(config, inbound),
            transport,
            connection: None,
            connect_deadline: None,
            last_connect_attempt: Instant::now(),
            connect_attempts: 0,
            connect_payload: Bytes::new(),
            events: EventListeners::new(),
            handlers: FxHashMap::default(),
        }
    }

    /// Start the handshake towards `remote`.
    pub async fn connect_to(&mut self, remote: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        if let Some(conn) = &self.connection {
            if conn.state() != ConnectionState::Disconnected {
                bail!("already connecting or connected to {}", conn.remote_addr());
            }
        }

        info!("connecting to {}", remote);
        let now = Instant::now();
        self.connection = Some(Connection::new(remote, ConnectionState::Connecting));
        self.connect_deadline = Some(now + self.core.config().connect_timeout);
        self.last_connect_attempt = now;
        self.connect_attempts = 1;
        self.connect_payload = payload.clone();

        self.transport
            .send(remote, &Frame::Connect { payload }.to_datagram())
            .await
    }

    /// One engine step: drain and dispatch everything the transport delivered,
    ///  then run the time-driven work (handshake retries, heartbeats,
    ///  retransmission, timeout detection). Non-blocking apart from transport
    ///  sends; the application drives this from its own loop.
    pub async fn tick(&mut self) {
        let mut inbound = Vec::new();
        self.core.drain_inbound(&mut inbound);
        for datagram in inbound {
            self.on_datagram(datagram).await;
        }

        // a client schedules no delayed events, but draining keeps the
        //  contract uniform with the server
        let now = Instant::now();
        while self.core.pop_due(now).is_some() {}

        self.drive_timers().await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// the server-assigned client id, 0 while unassigned
    pub fn id(&self) -> u16 {
        self.connection.as_ref().map(|c| c.id()).unwrap_or(0)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// smoothed round-trip time to the server, zero until the first sample
    pub fn rtt(&self) -> Duration {
        self.connection
            .as_ref()
            .map(|c| c.smoothed_rtt())
            .unwrap_or(Duration::ZERO)
    }

    /// reliable messages sent but not yet acknowledged by the server
    pub fn pending_reliable_count(&self) -> usize {
        self.connection
            .as_ref()
            .map(|c| c.pending_ack_count())
            .unwrap_or(0)
    }

    /// a pooled message buffer ready for writing
    pub async fn message(&self, mode: SendMode, id: u16) -> Message {
        self.core.pool().message(mode, id).await
    }

    pub fn add_event_listener(
        &mut self,
        listener: Box<dyn FnMut(&mut ClientEvent) + Send>,
    ) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_event_listener(&mut self, listener_id: ListenerId) -> anyhow::Result<()> {
        self.events.try_remove_listener(listener_id)
    }

    pub fn register_message_handler(
        &mut self,
        message_id: u16,
        handler: Box<dyn FnMut(&mut Message) + Send>,
    ) {
        if self.handlers.insert(message_id, handler).is_some() {
            warn!("replacing the message handler registered for id {}", message_id);
        }
    }

    /// Hand a message to the connection for transmission. The buffer returns
    ///  to the pool in all cases; reliable payloads are copied into the
    ///  retransmission table first.
    pub async fn send(&mut self, message: Message) {
        let now = Instant::now();
        let result = match self.connection.as_mut() {
            Some(conn) if conn.state() == ConnectionState::Connected => match message.mode() {
                SendMode::Unreliable => {
                    conn.send_unreliable(&*self.transport, message.payload()).await
                }
                SendMode::Reliable => conn
                    .send_reliable(&*self.transport, message.payload(), now)
                    .await
                    .map(|_| ()),
            },
            _ => {
                warn!("send on a client that is not connected - dropping the message");
                Ok(())
            }
        };
        self.core.pool().release(message).await;

        if let Err(e) = result {
            self.on_transport_error(e).await;
        }
    }

    /// Synchronous teardown: a best-effort disconnect notification goes out
    ///  unacknowledged, in-flight reliable messages are dropped, and the
    ///  transport is released.
    pub async fn disconnect(&mut self) {
        match self.connection.as_mut() {
            Some(conn) if conn.state() != ConnectionState::Disconnected => {
                let frame = Frame::Disconnect {
                    reason: DisconnectReason::Disconnected,
                    payload: Bytes::new(),
                };
                if let Err(e) = self
                    .transport
                    .send(conn.remote_addr(), &frame.to_datagram())
                    .await
                {
                    warn!("could not notify the server of the disconnect: {}", e);
                }
                conn.set_state(ConnectionState::Disconnected);
                self.connect_deadline = None;

                let mut event = ClientEvent::Disconnected {
                    reason: DisconnectReason::Disconnected,
                    payload: Bytes::new(),
                };
                self.events.emit(&mut event);
            }
            _ => warn!("disconnect on a client that is not connected - ignoring"),
        }
        self.transport.shut_down();
    }

    async fn on_datagram(&mut self, datagram: InboundDatagram) {
        let frame = match Frame::try_deser(&mut &datagram.bytes[..]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding malformed datagram from {}: {}", datagram.from, e);
                return;
            }
        };

        {
            let Some(conn) = self.connection.as_mut() else {
                trace!("datagram from {} while not connecting - discarding", datagram.from);
                return;
            };
            if conn.remote_addr() != datagram.from {
                warn!("datagram from unexpected endpoint {} - discarding", datagram.from);
                return;
            }
            if conn.state() == ConnectionState::Disconnected {
                trace!("datagram on a closed connection - discarding");
                return;
            }
            conn.mark_heard(Instant::now());
        }

        match frame {
            Frame::Welcome { client_id } => self.on_welcome(client_id),
            Frame::Reject { reason, payload } => self.on_reject(reason, payload),
            Frame::Connect { .. } => {
                // the server's echo of our connect attempt, nothing beyond liveness
                trace!("connect attempt acknowledged by the server");
            }
            Frame::Heartbeat { echo, timestamp_ms } => self.on_heartbeat(echo, timestamp_ms).await,
            Frame::Ack { seq, bitfield } => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.on_ack(seq, bitfield, Instant::now());
                }
            }
            Frame::AckExtra { seq } => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.on_ack_extra(seq, Instant::now());
                }
            }
            Frame::Unreliable { payload } => {
                if self.state() == ConnectionState::Connected {
                    self.surface_message(SendMode::Unreliable, payload).await;
                } else {
                    warn!("user message before the connection is established - discarding");
                }
            }
            Frame::Reliable { seq, payload } => self.on_reliable(seq, payload).await,
            Frame::Disconnect { reason, payload } => self.on_disconnect(reason, payload),
            Frame::ClientConnected { client_id } => {
                let mut event = ClientEvent::PeerConnected { client_id };
                self.events.emit(&mut event);
            }
            Frame::ClientDisconnected { client_id } => {
                let mut event = ClientEvent::PeerDisconnected { client_id };
                self.events.emit(&mut event);
            }
        }
    }

    fn on_welcome(&mut self, client_id: u16) {
        let Some(conn) = self.connection.as_mut() else { return };
        if conn.state() != ConnectionState::Connecting {
            debug!("duplicate welcome - already connected as {}", conn.id());
            return;
        }

        conn.set_id(client_id);
        conn.set_state(ConnectionState::Connected);
        self.connect_deadline = None;
        info!("connected to {} as client {}", conn.remote_addr(), client_id);

        let mut event = ClientEvent::Connected;
        self.events.emit(&mut event);
    }

    fn on_reject(&mut self, reason: RejectReason, payload: Bytes) {
        let Some(conn) = self.connection.as_mut() else { return };
        if conn.state() != ConnectionState::Connecting {
            debug!("reject received outside the handshake - ignoring");
            return;
        }

        info!("connection to {} rejected: {:?}", conn.remote_addr(), reason);
        conn.set_state(ConnectionState::Disconnected);
        self.connect_deadline = None;

        let mut event =
            ClientEvent::ConnectionFailed(ConnectionFailure::Rejected { reason, payload });
        self.events.emit(&mut event);
    }

    async fn on_heartbeat(&mut self, echo: bool, timestamp_ms: u64) {
        let now_ms = self.core.now_ms();
        let result = match self.connection.as_mut() {
            Some(conn) => conn.on_heartbeat(&*self.transport, echo, timestamp_ms, now_ms).await,
            None => Ok(()),
        };
        if let Err(e) = result {
            self.on_transport_error(e).await;
        }
    }

    async fn on_reliable(&mut self, seq: u16, payload: Bytes) {
        if self.state() != ConnectionState::Connected {
            warn!("user message before the connection is established - discarding");
            return;
        }

        let delivered = {
            let conn = self.connection.as_mut().expect("state was just checked");
            conn.on_reliable(&*self.transport, seq, payload).await
        };
        match delivered {
            Ok(Some(payload)) => self.surface_message(SendMode::Reliable, payload).await,
            Ok(None) => {}
            Err(e) => self.on_transport_error(e).await,
        }
    }

    fn on_disconnect(&mut self, reason: DisconnectReason, payload: Bytes) {
        let Some(conn) = self.connection.as_mut() else { return };
        info!("disconnected by {}: {:?}", conn.remote_addr(), reason);
        conn.set_state(ConnectionState::Disconnected);
        self.connect_deadline = None;

        let mut event = ClientEvent::Disconnected { reason, payload };
        self.events.emit(&mut event);
    }

    async fn surface_message(&mut self, mode: SendMode, payload: Bytes) {
        let message = match Message::from_payload(mode, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("discarding user message without a message id: {}", e);
                return;
            }
        };

        let mut event = ClientEvent::MessageReceived { message };
        self.events.emit(&mut event);

        if let ClientEvent::MessageReceived { mut message } = event {
            if self.core.config().use_message_handlers {
                message.reset_cursor();
                match self.handlers.get_mut(&message.id()) {
                    Some(handler) => handler(&mut message),
                    None => warn!("no message handler registered for id {} - ignoring", message.id()),
                }
            }
            self.core.pool().release(message).await;
        }
    }

    async fn drive_timers(&mut self) {
        let now = Instant::now();
        let now_ms = self.core.now_ms();
        let heartbeat_interval = self.core.config().heartbeat_interval;
        let timeout = self.core.config().timeout;

        match self.state() {
            ConnectionState::Connecting => {
                if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    self.fail_connect(ConnectionFailure::TimedOut);
                } else if now.duration_since(self.last_connect_attempt) >= heartbeat_interval {
                    self.resend_connect(now).await;
                }
            }
            ConnectionState::Connected => {
                if self
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.is_timed_out(now, timeout))
                {
                    let conn = self.connection.as_mut().expect("state was just checked");
                    info!("connection to {} timed out", conn.remote_addr());
                    conn.set_state(ConnectionState::Disconnected);
                    let mut event = ClientEvent::Disconnected {
                        reason: DisconnectReason::TimedOut,
                        payload: Bytes::new(),
                    };
                    self.events.emit(&mut event);
                    return;
                }

                let result = {
                    let conn = self.connection.as_mut().expect("state was just checked");
                    let mut result = Ok(());
                    if conn.heartbeat_due(now, heartbeat_interval) {
                        result = conn.send_heartbeat(&*self.transport, now, now_ms).await;
                    }
                    if result.is_ok() {
                        result = conn.retransmit_overdue(&*self.transport, now).await;
                    }
                    result
                };
                if let Err(e) = result {
                    self.on_transport_error(e).await;
                }
            }
            _ => {}
        }
    }

    async fn resend_connect(&mut self, now: Instant) {
        let Some(conn) = self.connection.as_ref() else { return };
        self.last_connect_attempt = now;
        self.connect_attempts += 1;
        debug!("re-sending connect to {} (attempt {})", conn.remote_addr(), self.connect_attempts);

        let frame = Frame::Connect {
            payload: self.connect_payload.clone(),
        };
        if let Err(e) = self
            .transport
            .send(conn.remote_addr(), &frame.to_datagram())
            .await
        {
            warn!("transport error while re-sending connect: {}", e);
            self.fail_connect(ConnectionFailure::TransportError);
        }
    }

    fn fail_connect(&mut self, failure: ConnectionFailure) {
        if let Some(conn) = self.connection.as_mut() {
            info!("connection to {} failed: {:?}", conn.remote_addr(), failure);
            conn.set_state(ConnectionState::Disconnected);
        }
        self.connect_deadline = None;

        let mut event = ClientEvent::ConnectionFailed(failure);
        self.events.emit(&mut event);
    }

    async fn on_transport_error(&mut self, error: anyhow::Error) {
        warn!("transport error: {}", error);
        match self.state() {
            ConnectionState::Connecting => self.fail_connect(ConnectionFailure::TransportError),
            ConnectionState::Connected => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.set_state(ConnectionState::Disconnected);
                }
                let mut event = ClientEvent::Disconnected {
                    reason: DisconnectReason::TransportError,
                    payload: Bytes::new(),
                };
                self.events.emit(&mut event);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::advance;

    use crate::test_util::transport::LoopbackHub;

    use super::*;

    fn server_addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:5001".parse().unwrap()
    }

    /// records simplified copies of emitted events for assertions
    #[derive(Debug, Clone, PartialEq)]
    enum Captured {
        Connected,
        Rejected(RejectReason, Vec<u8>),
        FailedTimedOut,
        Disconnected(DisconnectReason, Vec<u8>),
        Message(u16, Vec<u8>),
        PeerConnected(u16),
        PeerDisconnected(u16),
    }

    fn capture_events(client: &mut Client) -> Arc<Mutex<Vec<Captured>>> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        client.add_event_listener(Box::new(move |event| {
            let entry = match event {
                ClientEvent::Connected => Captured::Connected,
                ClientEvent::ConnectionFailed(ConnectionFailure::Rejected { reason, payload }) => {
                    Captured::Rejected(*reason, payload.to_vec())
                }
                ClientEvent::ConnectionFailed(_) => Captured::FailedTimedOut,
                ClientEvent::Disconnected { reason, payload } => {
                    Captured::Disconnected(*reason, payload.to_vec())
                }
                ClientEvent::MessageReceived { message } => {
                    let mut payload = Vec::new();
                    while message.remaining() > 0 {
                        payload.push(message.read_u8().unwrap());
                    }
                    Captured::Message(message.id(), payload)
                }
                ClientEvent::PeerConnected { client_id } => Captured::PeerConnected(*client_id),
                ClientEvent::PeerDisconnected { client_id } => Captured::PeerDisconnected(*client_id),
            };
            sink.lock().unwrap().push(entry);
        }));
        captured
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_welcome_connects() {
        let hub = LoopbackHub::new();
        let (server_transport, mut server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();

        let connect = server_inbound.try_recv().unwrap();
        assert_eq!(&connect.bytes[..], &Frame::Connect { payload: Bytes::new() }.to_datagram()[..]);

        server_transport
            .send(client_addr(), &Frame::Welcome { client_id: 3 }.to_datagram())
            .await
            .unwrap();
        client.tick().await;

        assert!(client.is_connected());
        assert_eq!(client.id(), 3);
        assert_eq!(&*captured.lock().unwrap(), &[Captured::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_resent_until_welcome() {
        let hub = LoopbackHub::new();
        let (_server_transport, mut server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();
        assert!(server_inbound.try_recv().is_ok());

        // nothing new inside the heartbeat interval
        advance(Duration::from_millis(500)).await;
        client.tick().await;
        assert!(server_inbound.try_recv().is_err());

        advance(Duration::from_millis(500)).await;
        client.tick().await;
        let resent = server_inbound.try_recv().unwrap();
        assert_eq!(&resent.bytes[..], &Frame::Connect { payload: Bytes::new() }.to_datagram()[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_welcome() {
        let hub = LoopbackHub::new();
        let (_server_transport, _server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();

        advance(Duration::from_millis(10000)).await;
        client.tick().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(&*captured.lock().unwrap(), &[Captured::FailedTimedOut]);

        // no further failure events on subsequent ticks
        advance(Duration::from_millis(1000)).await;
        client.tick().await;
        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_fails_the_handshake() {
        let hub = LoopbackHub::new();
        let (server_transport, _server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();

        server_transport
            .send(
                client_addr(),
                &Frame::Reject { reason: RejectReason::ServerFull, payload: Bytes::new() }.to_datagram(),
            )
            .await
            .unwrap();
        client.tick().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            &*captured.lock().unwrap(),
            &[Captured::Rejected(RejectReason::ServerFull, vec![])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_established_connection_times_out_on_silence() {
        let hub = LoopbackHub::new();
        let (server_transport, _server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();

        server_transport
            .send(client_addr(), &Frame::Welcome { client_id: 1 }.to_datagram())
            .await
            .unwrap();
        client.tick().await;
        assert!(client.is_connected());

        advance(Duration::from_millis(5001)).await;
        client.tick().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            &*captured.lock().unwrap(),
            &[
                Captured::Connected,
                Captured::Disconnected(DisconnectReason::TimedOut, vec![])
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_with_payload_surfaces_reason_and_bytes() {
        let hub = LoopbackHub::new();
        let (server_transport, _server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();

        server_transport
            .send(client_addr(), &Frame::Welcome { client_id: 1 }.to_datagram())
            .await
            .unwrap();
        server_transport
            .send(
                client_addr(),
                &Frame::Disconnect {
                    reason: DisconnectReason::Kicked,
                    payload: Bytes::from_static(b"\x01"),
                }
                .to_datagram(),
            )
            .await
            .unwrap();
        client.tick().await;

        assert_eq!(
            &*captured.lock().unwrap(),
            &[
                Captured::Connected,
                Captured::Disconnected(DisconnectReason::Kicked, vec![0x01])
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_surface_through_event_and_handler() {
        let hub = LoopbackHub::new();
        let (server_transport, _server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);

        let handled = Arc::new(Mutex::new(Vec::new()));
        let handled_sink = handled.clone();
        client.register_message_handler(
            7,
            Box::new(move |message| {
                handled_sink.lock().unwrap().push(message.read_u8().unwrap());
            }),
        );

        client.connect_to(server_addr(), Bytes::new()).await.unwrap();
        server_transport
            .send(client_addr(), &Frame::Welcome { client_id: 1 }.to_datagram())
            .await
            .unwrap();

        // message id 7, one payload byte
        server_transport
            .send(
                client_addr(),
                &Frame::Unreliable { payload: Bytes::from_static(b"\x07\x00\x2a") }.to_datagram(),
            )
            .await
            .unwrap();
        client.tick().await;

        assert_eq!(
            &*captured.lock().unwrap(),
            &[Captured::Connected, Captured::Message(7, vec![0x2a])]
        );
        assert_eq!(&*handled.lock().unwrap(), &[0x2a]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_datagrams_from_strangers_are_discarded() {
        let hub = LoopbackHub::new();
        let (_server_transport, _server_inbound) = hub.attach(server_addr()).await;
        let stranger_addr: SocketAddr = "127.0.0.1:6666".parse().unwrap();
        let (stranger, _stranger_inbound) = hub.attach(stranger_addr).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        let captured = capture_events(&mut client);
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();

        stranger
            .send(client_addr(), &Frame::Welcome { client_id: 9 }.to_datagram())
            .await
            .unwrap();
        client.tick().await;

        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_flow_once_connected() {
        let hub = LoopbackHub::new();
        let (server_transport, mut server_inbound) = hub.attach(server_addr()).await;
        let (client_transport, client_inbound) = hub.attach(client_addr()).await;

        let mut client = Client::with_transport(client_transport, client_inbound, PeerConfig::new());
        client.connect_to(server_addr(), Bytes::new()).await.unwrap();
        server_transport
            .send(client_addr(), &Frame::Welcome { client_id: 1 }.to_datagram())
            .await
            .unwrap();
        client.tick().await;
        server_inbound.try_recv().unwrap(); // the original connect

        advance(Duration::from_millis(1000)).await;
        client.tick().await;

        let heartbeat = server_inbound.try_recv().unwrap();
        let frame = Frame::try_deser(&mut &heartbeat.bytes[..]).unwrap();
        assert!(matches!(frame, Frame::Heartbeat { echo: false, .. }));
    }
}
