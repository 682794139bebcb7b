use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Why the server turned down a connection attempt. Sent as a single byte in
///  a `Reject` frame - except for [RejectReason::AlreadyConnected], which is
///  never put on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    AlreadyConnected = 0,
    ServerFull = 1,
    Rejected = 2,
    Custom = 3,
}

/// Why a connection ended. Sent as a single byte in a `Disconnect` frame and
///  surfaced through the lifecycle events.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    NeverConnected = 0,
    TransportError = 1,
    TimedOut = 2,
    Kicked = 3,
    ServerStopped = 4,
    Disconnected = 5,
}
