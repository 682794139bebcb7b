use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::events::{EventListeners, ListenerId};
use crate::message::{Message, SendMode};
use crate::peer::{DelayedEvent, PeerCore};
use crate::protocol::{DisconnectReason, Frame, RejectReason};
use crate::transport::udp::UdpTransport;
use crate::transport::{InboundDatagram, Transport};

/// a reject is sent in several copies to improve its odds on a lossy link
const REJECT_SEND_COUNT: u32 = 3;

/// Lifecycle and data events surfaced by a [Server]. Emitted synchronously
///  from within `tick()`.
#[derive(Debug)]
pub enum ServerEvent {
    ClientConnected { client_id: u16 },
    ClientDisconnected { client_id: u16, reason: DisconnectReason },
    MessageReceived { from_client_id: u16, message: Message },
}

/// Invoked for each connection attempt when installed; the application must
///  eventually answer with [Server::accept] or [Server::reject] (undecided
///  attempts are garbage-collected after the connect timeout).
pub type ConnectionHandler = Box<dyn FnMut(SocketAddr, &Bytes) + Send>;

/// A server peer accepting connections from many clients. Admission control,
///  client-id assignment, per-connection reliability and liveness, broadcast
///  and relaying all run inside [Server::tick] on the calling thread.
pub struct Server {
    core: PeerCore,
    transport: Arc<dyn Transport>,
    /// every live connection, keyed by remote endpoint - exactly one per peer
    connections: FxHashMap<SocketAddr, Connection>,
    /// connected clients: id -> endpoint into `connections`
    clients: FxHashMap<u16, SocketAddr>,
    /// endpoints awaiting an accept/reject decision
    pending: FxHashSet<SocketAddr>,
    /// unassigned ids in [1, max_clients], lowest first, freed ids at the back
    available_ids: VecDeque<u16>,
    /// message ids whose payloads are rebroadcast instead of handled locally
    relay_filter: Option<FxHashSet<u16>>,
    handlers: FxHashMap<u16, Box<dyn FnMut(u16, &mut Message) + Send>>,
    connection_handler: Option<ConnectionHandler>,
    events: EventListeners<ServerEvent>,
    running: bool,
}

impl Server {
    /// Bind a UDP socket on `addr` and start accepting connections.
    pub async fn start(addr: SocketAddr, config: PeerConfig) -> anyhow::Result<Server> {
        let capacity = PeerCore::inbound_queue_capacity(&config);
        let (transport, inbound) = UdpTransport::bind(addr, capacity).await?;
        Ok(Server::with_transport(transport, inbound, config))
    }

    /// Construct a server on an externally provided transport. Used with the
    ///  in-memory loopback transport in tests, and by applications that bring
    ///  their own datagram layer.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundDatagram>,
        config: PeerConfig,
    ) -> Server {
        let available_ids = (1..=config.max_clients).collect();
        info!("server listening on {}", transport.local_addr());
        Server {
            core: PeerCore::new(config, inbound),
            transport,
            connections: FxHashMap::default(),
            clients: FxHashMap::default(),
            pending: FxHashSet::default(),
            available_ids,
            relay_filter: None,
            handlers: FxHashMap::default(),
            connection_handler: None,
            events: EventListeners::new(),
            running: true,
        }
    }

    /// One engine step: drain and dispatch inbound datagrams, fire due delayed
    ///  events, then run per-connection heartbeats, retransmission and timeout
    ///  detection.
    pub async fn tick(&mut self) {
        let mut inbound = Vec::new();
        self.core.drain_inbound(&mut inbound);
        for datagram in inbound {
            self.on_datagram(datagram).await;
        }

        let now = Instant::now();
        while let Some(event) = self.core.pop_due(now) {
            match event {
                DelayedEvent::CloseRejectedConnection { remote_addr } => {
                    if self
                        .connections
                        .get(&remote_addr)
                        .is_some_and(|c| c.state() == ConnectionState::Disconnected)
                    {
                        debug!("closing rejected connection to {}", remote_addr);
                        self.connections.remove(&remote_addr);
                    }
                }
                DelayedEvent::ExpirePendingConnection { remote_addr } => {
                    if self.pending.remove(&remote_addr) {
                        debug!("connection attempt from {} was never decided on - discarding", remote_addr);
                        self.connections.remove(&remote_addr);
                    }
                }
            }
        }

        self.drive_timers().await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// connected client ids, ascending
    pub fn client_ids(&self) -> Vec<u16> {
        let mut ids = self.clients.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// smoothed round-trip time to a connected client, zero until sampled
    pub fn client_rtt(&self, client_id: u16) -> Option<std::time::Duration> {
        let addr = self.clients.get(&client_id)?;
        self.connections.get(addr).map(|c| c.smoothed_rtt())
    }

    /// a pooled message buffer ready for writing
    pub async fn message(&self, mode: SendMode, id: u16) -> Message {
        self.core.pool().message(mode, id).await
    }

    pub fn add_event_listener(
        &mut self,
        listener: Box<dyn FnMut(&mut ServerEvent) + Send>,
    ) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_event_listener(&mut self, listener_id: ListenerId) -> anyhow::Result<()> {
        self.events.try_remove_listener(listener_id)
    }

    pub fn register_message_handler(
        &mut self,
        message_id: u16,
        handler: Box<dyn FnMut(u16, &mut Message) + Send>,
    ) {
        if self.handlers.insert(message_id, handler).is_some() {
            warn!("replacing the message handler registered for id {}", message_id);
        }
    }

    /// Install the admission callback. Without one, every connection attempt
    ///  is accepted as long as there is room.
    pub fn set_connection_handler(&mut self, handler: ConnectionHandler) {
        self.connection_handler = Some(handler);
    }

    /// Message ids whose payloads are forwarded verbatim to all other clients
    ///  instead of being handled by this server.
    pub fn set_relay_filter(&mut self, message_ids: FxHashSet<u16>) {
        self.relay_filter = Some(message_ids);
    }

    pub fn clear_relay_filter(&mut self) {
        self.relay_filter = None;
    }

    /// Admit a pending connection: assign the lowest available client id, bind
    ///  it and welcome the client. A no-op (with a warning) on connections that
    ///  are not pending; admission limits are re-checked here.
    pub async fn accept(&mut self, remote_addr: SocketAddr) {
        match self.connections.get(&remote_addr).map(|c| c.state()) {
            Some(ConnectionState::Pending) => {}
            Some(ConnectionState::Connected) => {
                // already a client; a reject for this reason never emits a frame
                warn!("accept for {} which is already connected - ignoring", remote_addr);
                return;
            }
            _ => {
                warn!("accept for {} which is not a pending connection - ignoring", remote_addr);
                return;
            }
        }
        self.pending.remove(&remote_addr);

        if self.clients.len() >= self.core.config().max_clients as usize {
            self.do_reject(remote_addr, RejectReason::ServerFull, Bytes::new()).await;
            return;
        }
        let Some(client_id) = self.available_ids.pop_front() else {
            error!("no client id available below the admission limit - this is a bug");
            self.do_reject(remote_addr, RejectReason::ServerFull, Bytes::new()).await;
            return;
        };

        if let Some(conn) = self.connections.get_mut(&remote_addr) {
            conn.set_id(client_id);
            conn.set_state(ConnectionState::Connected);
        }
        self.clients.insert(client_id, remote_addr);
        info!("client {} connected from {}", client_id, remote_addr);

        let welcome = Frame::Welcome { client_id }.to_datagram();
        if let Err(e) = self.transport.send(remote_addr, &welcome).await {
            self.on_connection_transport_error(remote_addr, e).await;
            return;
        }

        self.broadcast_frame(Frame::ClientConnected { client_id }, Some(client_id)).await;

        let mut event = ServerEvent::ClientConnected { client_id };
        self.events.emit(&mut event);
    }

    /// Turn down a pending connection. Without a payload the client sees
    ///  reason `Rejected`; with one it sees `Custom` plus the bytes.
    pub async fn reject(&mut self, remote_addr: SocketAddr, payload: Option<Bytes>) {
        match payload {
            Some(payload) => self.do_reject(remote_addr, RejectReason::Custom, payload).await,
            None => self.do_reject(remote_addr, RejectReason::Rejected, Bytes::new()).await,
        }
    }

    async fn do_reject(&mut self, remote_addr: SocketAddr, reason: RejectReason, payload: Bytes) {
        self.pending.remove(&remote_addr);
        let Some(conn) = self.connections.get_mut(&remote_addr) else {
            warn!("reject for {} which has no connection - ignoring", remote_addr);
            return;
        };
        conn.set_state(ConnectionState::Disconnected);
        info!("rejected connection attempt from {}: {:?}", remote_addr, reason);

        if reason != RejectReason::AlreadyConnected {
            let datagram = Frame::Reject { reason, payload }.to_datagram();
            for _ in 0..REJECT_SEND_COUNT {
                if let Err(e) = self.transport.send(remote_addr, &datagram).await {
                    warn!("transport error while rejecting {}: {}", remote_addr, e);
                    break;
                }
            }
        }

        // keep the dead connection around briefly so late connect retries
        //  cannot re-open it, then let the delayed close reap it
        let grace = self.core.config().connect_timeout;
        self.core.schedule(grace, DelayedEvent::CloseRejectedConnection { remote_addr });
    }

    /// Kick a client, optionally with application bytes explaining why.
    pub async fn disconnect_client(&mut self, client_id: u16, payload: Option<Bytes>) {
        let Some(&remote_addr) = self.clients.get(&client_id) else {
            warn!("disconnect for unknown client {} - ignoring", client_id);
            return;
        };

        let frame = Frame::Disconnect {
            reason: DisconnectReason::Kicked,
            payload: payload.unwrap_or_default(),
        };
        if let Err(e) = self.transport.send(remote_addr, &frame.to_datagram()).await {
            warn!("transport error while kicking client {}: {}", client_id, e);
        }
        info!("kicked client {}", client_id);
        self.drop_client(client_id, DisconnectReason::Kicked).await;
    }

    /// Synchronous teardown: every client gets a best-effort server-stopped
    ///  notification, then all connection state is released.
    pub async fn stop(&mut self) {
        if !self.running {
            warn!("stop on a server that is not running - ignoring");
            return;
        }
        self.running = false;

        let datagram = Frame::Disconnect {
            reason: DisconnectReason::ServerStopped,
            payload: Bytes::new(),
        }
        .to_datagram();
        for (&client_id, &remote_addr) in &self.clients {
            if let Err(e) = self.transport.send(remote_addr, &datagram).await {
                warn!("transport error while stopping, client {}: {}", client_id, e);
            }
        }

        self.clients.clear();
        self.pending.clear();
        self.connections.clear();
        self.available_ids = (1..=self.core.config().max_clients).collect();
        self.transport.shut_down();
        info!("server stopped");
    }

    /// Send to one client. The buffer returns to the pool in all cases.
    pub async fn send(&mut self, message: Message, to_client_id: u16) {
        let Some(&remote_addr) = self.clients.get(&to_client_id) else {
            warn!("send to unknown client {} - dropping the message", to_client_id);
            self.core.pool().release(message).await;
            return;
        };

        let now = Instant::now();
        let result = match self.connections.get_mut(&remote_addr) {
            Some(conn) => match message.mode() {
                SendMode::Unreliable => {
                    conn.send_unreliable(&*self.transport, message.payload()).await
                }
                SendMode::Reliable => conn
                    .send_reliable(&*self.transport, message.payload(), now)
                    .await
                    .map(|_| ()),
            },
            None => Ok(()),
        };
        self.core.pool().release(message).await;

        if let Err(e) = result {
            self.on_connection_transport_error(remote_addr, e).await;
        }
    }

    /// Send to every connected client (except one, typically the originator).
    ///  The buffer returns to the pool exactly once, after the last send.
    pub async fn send_to_all(&mut self, message: Message, except: Option<u16>) {
        let now = Instant::now();
        let targets = self
            .clients
            .iter()
            .filter(|(&id, _)| Some(id) != except)
            .map(|(_, &addr)| addr)
            .collect::<Vec<_>>();

        let mut failures = Vec::new();
        for remote_addr in targets {
            let Some(conn) = self.connections.get_mut(&remote_addr) else { continue };
            let result = match message.mode() {
                SendMode::Unreliable => {
                    conn.send_unreliable(&*self.transport, message.payload()).await
                }
                SendMode::Reliable => conn
                    .send_reliable(&*self.transport, message.payload(), now)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                failures.push((remote_addr, e));
            }
        }
        self.core.pool().release(message).await;

        for (remote_addr, e) in failures {
            self.on_connection_transport_error(remote_addr, e).await;
        }
    }

    async fn on_datagram(&mut self, datagram: InboundDatagram) {
        let frame = match Frame::try_deser(&mut &datagram.bytes[..]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding malformed datagram from {}: {}", datagram.from, e);
                return;
            }
        };
        let from = datagram.from;

        if let Some(conn) = self.connections.get_mut(&from) {
            conn.mark_heard(Instant::now());
        } else if !matches!(frame, Frame::Connect { .. }) {
            warn!("{:?} frame from unknown endpoint {} - discarding", frame.kind(), from);
            return;
        }

        match frame {
            Frame::Connect { payload } => self.on_connect_frame(from, payload).await,
            Frame::Disconnect { .. } => self.on_disconnect_frame(from).await,
            Frame::Heartbeat { echo, timestamp_ms } => {
                let now_ms = self.core.now_ms();
                let result = match self.connections.get_mut(&from) {
                    Some(conn) => conn.on_heartbeat(&*self.transport, echo, timestamp_ms, now_ms).await,
                    None => Ok(()),
                };
                if let Err(e) = result {
                    self.on_connection_transport_error(from, e).await;
                }
            }
            Frame::Ack { seq, bitfield } => {
                if let Some(conn) = self.connections.get_mut(&from) {
                    conn.on_ack(seq, bitfield, Instant::now());
                }
            }
            Frame::AckExtra { seq } => {
                if let Some(conn) = self.connections.get_mut(&from) {
                    conn.on_ack_extra(seq, Instant::now());
                }
            }
            Frame::Unreliable { payload } => {
                self.on_user_frame(from, SendMode::Unreliable, None, payload).await
            }
            Frame::Reliable { seq, payload } => {
                self.on_user_frame(from, SendMode::Reliable, Some(seq), payload).await
            }
            Frame::Welcome { .. }
            | Frame::Reject { .. }
            | Frame::ClientConnected { .. }
            | Frame::ClientDisconnected { .. } => {
                warn!("{:?} frame from {} is server-to-client only - discarding", frame.kind(), from);
            }
        }
    }

    async fn on_connect_frame(&mut self, from: SocketAddr, payload: Bytes) {
        if let Some(conn) = self.connections.get(&from) {
            match conn.state() {
                ConnectionState::Pending => {
                    // the previous echo may have been lost
                    trace!("repeated connect from pending {}", from);
                    let echo = Frame::Connect { payload: Bytes::new() }.to_datagram();
                    if let Err(e) = self.transport.send(from, &echo).await {
                        warn!("transport error echoing connect to {}: {}", from, e);
                    }
                }
                ConnectionState::Connected => {
                    // the welcome may have been lost; re-sending it is idempotent
                    let client_id = conn.id();
                    debug!("connect retry from connected client {} - re-sending welcome", client_id);
                    let welcome = Frame::Welcome { client_id }.to_datagram();
                    if let Err(e) = self.transport.send(from, &welcome).await {
                        self.on_connection_transport_error(from, e).await;
                    }
                }
                _ => trace!("connect from {} on a closed connection - ignoring", from),
            }
            return;
        }

        if !self.running {
            return;
        }

        debug!("connection attempt from {}", from);
        self.connections.insert(from, Connection::new(from, ConnectionState::Pending));

        let echo = Frame::Connect { payload: Bytes::new() }.to_datagram();
        if let Err(e) = self.transport.send(from, &echo).await {
            warn!("transport error echoing connect to {}: {}", from, e);
        }

        if self.connection_handler.is_none() {
            self.accept(from).await;
        } else {
            self.pending.insert(from);
            let connect_timeout = self.core.config().connect_timeout;
            self.core.schedule(connect_timeout, DelayedEvent::ExpirePendingConnection { remote_addr: from });
            if let Some(handler) = self.connection_handler.as_mut() {
                handler(from, &payload);
            }
        }
    }

    async fn on_disconnect_frame(&mut self, from: SocketAddr) {
        let Some(conn) = self.connections.get(&from) else { return };
        match conn.state() {
            ConnectionState::Connected => {
                let client_id = conn.id();
                info!("client {} disconnected", client_id);
                self.drop_client(client_id, DisconnectReason::Disconnected).await;
            }
            ConnectionState::Pending => {
                debug!("pending connection from {} withdrew", from);
                self.pending.remove(&from);
                self.connections.remove(&from);
            }
            _ => {}
        }
    }

    async fn on_user_frame(
        &mut self,
        from: SocketAddr,
        mode: SendMode,
        seq: Option<u16>,
        payload: Bytes,
    ) {
        let Some(conn) = self.connections.get_mut(&from) else { return };
        if conn.state() != ConnectionState::Connected {
            warn!("user message from {} before the connection is established - discarding", from);
            return;
        }
        let from_client_id = conn.id();

        let delivered = match seq {
            Some(seq) => match conn.on_reliable(&*self.transport, seq, payload).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    self.on_connection_transport_error(from, e).await;
                    return;
                }
            },
            None => Some(payload),
        };
        let Some(payload) = delivered else { return };

        // the relay filter sees the message id before any local handling
        if payload.len() >= 2 {
            let message_id = u16::from_le_bytes([payload[0], payload[1]]);
            if self.relay_filter.as_ref().is_some_and(|f| f.contains(&message_id)) {
                self.relay(from_client_id, message_id, mode, payload).await;
                return;
            }
        }

        self.surface_message(from_client_id, mode, payload).await;
    }

    /// Forward a filtered payload verbatim to every client except the sender,
    ///  without invoking local handlers or events.
    async fn relay(&mut self, from_client_id: u16, message_id: u16, mode: SendMode, payload: Bytes) {
        let now = Instant::now();
        let targets = self
            .clients
            .iter()
            .filter(|(&id, _)| id != from_client_id)
            .map(|(_, &addr)| addr)
            .collect::<Vec<_>>();
        trace!("relaying message id {} from client {} to {} peers", message_id, from_client_id, targets.len());

        let mut failures = Vec::new();
        for remote_addr in targets {
            let Some(conn) = self.connections.get_mut(&remote_addr) else { continue };
            let result = match mode {
                SendMode::Unreliable => conn.send_unreliable(&*self.transport, &payload).await,
                SendMode::Reliable => conn
                    .send_reliable(&*self.transport, &payload, now)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                failures.push((remote_addr, e));
            }
        }
        for (remote_addr, e) in failures {
            self.on_connection_transport_error(remote_addr, e).await;
        }
    }

    async fn surface_message(&mut self, from_client_id: u16, mode: SendMode, payload: Bytes) {
        let message = match Message::from_payload(mode, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("discarding user message without a message id from client {}: {}", from_client_id, e);
                return;
            }
        };

        let mut event = ServerEvent::MessageReceived { from_client_id, message };
        self.events.emit(&mut event);

        if let ServerEvent::MessageReceived { from_client_id, mut message } = event {
            if self.core.config().use_message_handlers {
                message.reset_cursor();
                match self.handlers.get_mut(&message.id()) {
                    Some(handler) => handler(from_client_id, &mut message),
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

        let timed_out = self
            .clients
            .iter()
            .filter(|&(_, addr)| {
                self.connections
                    .get(addr)
                    .is_some_and(|c| c.is_timed_out(now, timeout))
            })
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for client_id in timed_out {
            info!("client {} timed out", client_id);
            self.drop_client(client_id, DisconnectReason::TimedOut).await;
        }

        let remote_addrs = self.clients.values().copied().collect::<Vec<_>>();
        let mut failures = Vec::new();
        for remote_addr in remote_addrs {
            let Some(conn) = self.connections.get_mut(&remote_addr) else { continue };
            let mut result = Ok(());
            if conn.heartbeat_due(now, heartbeat_interval) {
                result = conn.send_heartbeat(&*self.transport, now, now_ms).await;
            }
            if result.is_ok() {
                result = conn.retransmit_overdue(&*self.transport, now).await;
            }
            if let Err(e) = result {
                failures.push((remote_addr, e));
            }
        }
        for (remote_addr, e) in failures {
            self.on_connection_transport_error(remote_addr, e).await;
        }
    }

    /// Remove a client, free its id for eventual reuse and tell everyone.
    async fn drop_client(&mut self, client_id: u16, reason: DisconnectReason) {
        let Some(remote_addr) = self.clients.remove(&client_id) else { return };
        self.connections.remove(&remote_addr);
        self.available_ids.push_back(client_id);
        debug!("client {} removed: {:?}", client_id, reason);

        self.broadcast_frame(Frame::ClientDisconnected { client_id }, None).await;

        let mut event = ServerEvent::ClientDisconnected { client_id, reason };
        self.events.emit(&mut event);
    }

    /// best-effort fan-out of a protocol frame to all connected clients
    async fn broadcast_frame(&mut self, frame: Frame, except: Option<u16>) {
        let datagram = frame.to_datagram();
        let targets = self
            .clients
            .iter()
            .filter(|(&id, _)| Some(id) != except)
            .map(|(_, &addr)| addr)
            .collect::<Vec<_>>();
        for remote_addr in targets {
            if let Err(e) = self.transport.send(remote_addr, &datagram).await {
                warn!("transport error broadcasting to {}: {}", remote_addr, e);
            }
        }
    }

    async fn on_connection_transport_error(&mut self, remote_addr: SocketAddr, error: anyhow::Error) {
        warn!("transport error for {}: {}", remote_addr, error);
        let client_id = self.connections.get(&remote_addr).map(|c| c.id()).unwrap_or(0);
        if client_id != 0 {
            self.drop_client(client_id, DisconnectReason::TransportError).await;
        } else {
            self.pending.remove(&remote_addr);
            self.connections.remove(&remote_addr);
        }
    }
}
