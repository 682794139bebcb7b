//! Wire format of the peer protocol.
//!
//! Every datagram starts with a single header byte whose low four bits select
//!  the frame kind (the high four bits are reserved and must be zero), followed
//!  by a kind-specific body. All multi-byte integers are little-endian.
//!
//! ```ascii
//! Unreliable:         0x00 | payload...
//! Ack:                0x01 | acked seq: u16 | received bitfield: u16
//! AckExtra:           0x02 | acked seq: u16
//! Connect:            0x03 | payload... (optional application bytes)
//! Reject:             0x04 | reason: u8 | payload... (only for reason Custom)
//! Heartbeat:          0x05 | echo: u8 | timestamp: u64 (millis since peer start)
//! Disconnect:         0x06 | reason: u8 | payload... (only for reason Kicked)
//! Welcome:            0x07 | assigned client id: u16
//! ClientConnected:    0x08 | peer client id: u16
//! ClientDisconnected: 0x09 | peer client id: u16
//! Reliable:           0x0a | seq: u16 | payload...
//! ```
//!
//! `Unreliable` and `Reliable` carry application payloads; all other kinds are
//!  protocol internal and never surface to the application. A reliable frame
//!  is acknowledged by `Ack` when it is the newest sequence the receiver has
//!  seen, and by `AckExtra` (naming exactly that sequence) when it arrived
//!  behind or outside the 16-sequence receive window - the distinction lets
//!  the sender clear stragglers from its retransmission table without the
//!  receiver widening its bitfield.
//!
//! The heartbeat is a symmetric echo: a probe (`echo == 0`) is answered with a
//!  reply (`echo == 1`) carrying the probe's timestamp verbatim, so only the
//!  probing side needs to keep state to derive the round-trip time.

mod frames;
mod reasons;
pub(crate) mod seq;

pub use frames::{Frame, FrameKind};
pub use reasons::{DisconnectReason, RejectReason};
