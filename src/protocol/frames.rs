use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::reasons::{DisconnectReason, RejectReason};

/// The frame kind encoded in the low four bits of the header byte. The high
///  four bits are reserved and must be zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Unreliable = 0,
    Ack = 1,
    AckExtra = 2,
    Connect = 3,
    Reject = 4,
    Heartbeat = 5,
    Disconnect = 6,
    Welcome = 7,
    ClientConnected = 8,
    ClientDisconnected = 9,
    Reliable = 10,
}

/// A parsed datagram. `ser` and `try_deser` are exact inverses; the on-wire
///  layout is documented in the module doc.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Unreliable { payload: Bytes },
    Ack { seq: u16, bitfield: u16 },
    AckExtra { seq: u16 },
    Connect { payload: Bytes },
    Reject { reason: RejectReason, payload: Bytes },
    Heartbeat { echo: bool, timestamp_ms: u64 },
    Disconnect { reason: DisconnectReason, payload: Bytes },
    Welcome { client_id: u16 },
    ClientConnected { client_id: u16 },
    ClientDisconnected { client_id: u16 },
    Reliable { seq: u16, payload: Bytes },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Unreliable { .. } => FrameKind::Unreliable,
            Frame::Ack { .. } => FrameKind::Ack,
            Frame::AckExtra { .. } => FrameKind::AckExtra,
            Frame::Connect { .. } => FrameKind::Connect,
            Frame::Reject { .. } => FrameKind::Reject,
            Frame::Heartbeat { .. } => FrameKind::Heartbeat,
            Frame::Disconnect { .. } => FrameKind::Disconnect,
            Frame::Welcome { .. } => FrameKind::Welcome,
            Frame::ClientConnected { .. } => FrameKind::ClientConnected,
            Frame::ClientDisconnected { .. } => FrameKind::ClientDisconnected,
            Frame::Reliable { .. } => FrameKind::Reliable,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            Frame::Unreliable { payload } => {
                buf.put_slice(payload);
            }
            Frame::Ack { seq, bitfield } => {
                buf.put_u16_le(*seq);
                buf.put_u16_le(*bitfield);
            }
            Frame::AckExtra { seq } => {
                buf.put_u16_le(*seq);
            }
            Frame::Connect { payload } => {
                buf.put_slice(payload);
            }
            Frame::Reject { reason, payload } => {
                buf.put_u8((*reason).into());
                if *reason == RejectReason::Custom {
                    buf.put_slice(payload);
                }
            }
            Frame::Heartbeat { echo, timestamp_ms } => {
                buf.put_u8(*echo as u8);
                buf.put_u64_le(*timestamp_ms);
            }
            Frame::Disconnect { reason, payload } => {
                buf.put_u8((*reason).into());
                if *reason == DisconnectReason::Kicked {
                    buf.put_slice(payload);
                }
            }
            Frame::Welcome { client_id } => {
                buf.put_u16_le(*client_id);
            }
            Frame::ClientConnected { client_id } => {
                buf.put_u16_le(*client_id);
            }
            Frame::ClientDisconnected { client_id } => {
                buf.put_u16_le(*client_id);
            }
            Frame::Reliable { seq, payload } => {
                buf.put_u16_le(*seq);
                buf.put_slice(payload);
            }
        }
    }

    /// serialize into a fresh buffer - convenience for single-frame datagrams
    pub fn to_datagram(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let header = buf.try_get_u8()?;
        if header & 0xf0 != 0 {
            return Err(anyhow!("reserved header bits set: {:#04x}", header));
        }
        let kind = FrameKind::try_from(header & 0x0f)
            .map_err(|_| anyhow!("unknown frame kind: {}", header & 0x0f))?;

        let frame = match kind {
            FrameKind::Unreliable => Frame::Unreliable {
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            FrameKind::Ack => Frame::Ack {
                seq: buf.try_get_u16_le()?,
                bitfield: buf.try_get_u16_le()?,
            },
            FrameKind::AckExtra => Frame::AckExtra {
                seq: buf.try_get_u16_le()?,
            },
            FrameKind::Connect => Frame::Connect {
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            FrameKind::Reject => {
                let reason = RejectReason::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("unknown reject reason: {}", e.number))?;
                let payload = if reason == RejectReason::Custom {
                    buf.copy_to_bytes(buf.remaining())
                } else {
                    Bytes::new()
                };
                Frame::Reject { reason, payload }
            }
            FrameKind::Heartbeat => {
                let echo = match buf.try_get_u8()? {
                    0 => false,
                    1 => true,
                    n => return Err(anyhow!("invalid heartbeat echo flag: {}", n)),
                };
                Frame::Heartbeat {
                    echo,
                    timestamp_ms: buf.try_get_u64_le()?,
                }
            }
            FrameKind::Disconnect => {
                let reason = DisconnectReason::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("unknown disconnect reason: {}", e.number))?;
                let payload = if reason == DisconnectReason::Kicked {
                    buf.copy_to_bytes(buf.remaining())
                } else {
                    Bytes::new()
                };
                Frame::Disconnect { reason, payload }
            }
            FrameKind::Welcome => Frame::Welcome {
                client_id: buf.try_get_u16_le()?,
            },
            FrameKind::ClientConnected => Frame::ClientConnected {
                client_id: buf.try_get_u16_le()?,
            },
            FrameKind::ClientDisconnected => Frame::ClientDisconnected {
                client_id: buf.try_get_u16_le()?,
            },
            FrameKind::Reliable => Frame::Reliable {
                seq: buf.try_get_u16_le()?,
                payload: buf.copy_to_bytes(buf.remaining()),
            },
        };
        Ok(frame)
    }
}
