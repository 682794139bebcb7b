//! Connection-oriented, low-latency messaging on top of unreliable datagrams
//!  (UDP by default, transport-pluggable).
//!
//! The crate provides a client/server model in which short application
//!  messages travel either fire-and-forget or reliably - acknowledged,
//!  retransmitted on loss, delivered to the application at most once, with no
//!  ordering promise between reliable messages. Around that sit connection
//!  establishment (connect / welcome / reject), per-connection heartbeats with
//!  RTT estimation, inactivity timeouts, and graceful teardown.
//!
//! The engine is single-threaded and cooperative: a [client::Client] or
//!  [server::Server] mutates its state only inside `tick()`, which the
//!  application drives from its own loop. The transport delivers raw datagrams
//!  from its I/O context into a thread-safe FIFO that `tick()` drains; event
//!  callbacks run synchronously inside `tick()`.
//!
//! ```no_run
//! use tether::client::Client;
//! use tether::config::PeerConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = Client::connect("127.0.0.1:7777".parse()?, PeerConfig::new()).await?;
//!     loop {
//!         client.tick().await;
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod message;
pub(crate) mod peer;
pub mod protocol;
pub mod rtt;
pub mod server;
pub mod test_util;
pub mod transport;

pub use client::{Client, ClientEvent, ConnectionFailure};
pub use config::PeerConfig;
pub use connection::ConnectionState;
pub use message::{Message, MessagePool, SendMode};
pub use protocol::{DisconnectReason, RejectReason};
pub use server::{Server, ServerEvent};
