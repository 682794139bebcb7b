use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::RwLock;

use crate::transport::MAX_DATAGRAM_SIZE;

/// How a message travels: fire-and-forget, or retransmitted until the peer
///  acknowledges it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendMode {
    Unreliable,
    Reliable,
}

/// An application payload under construction or consumption. The first two
///  bytes are the little-endian message id used for handler dispatch and
///  relay filtering; typed writes append behind it, typed reads advance a
///  cursor starting right after it.
///
/// A `Message` is owned by whoever holds it: passing it to a send operation
///  hands it back to the pool after the bytes are on the wire (reliable sends
///  copy the bytes into the retransmission table first), so there is no
///  double-release to guard against.
#[derive(Debug)]
pub struct Message {
    mode: SendMode,
    buf: BytesMut,
    read_pos: usize,
}

const MESSAGE_ID_SIZE: usize = 2;

impl Message {
    pub fn reliable(id: u16) -> Message {
        Self::with_buf(SendMode::Reliable, id, BytesMut::with_capacity(MAX_DATAGRAM_SIZE))
    }

    pub fn unreliable(id: u16) -> Message {
        Self::with_buf(SendMode::Unreliable, id, BytesMut::with_capacity(MAX_DATAGRAM_SIZE))
    }

    fn with_buf(mode: SendMode, id: u16, mut buf: BytesMut) -> Message {
        buf.clear();
        buf.put_u16_le(id);
        Message {
            mode,
            buf,
            read_pos: MESSAGE_ID_SIZE,
        }
    }

    /// wrap an inbound payload (message id + body) for reading
    pub(crate) fn from_payload(mode: SendMode, payload: &[u8]) -> anyhow::Result<Message> {
        let mut probe = payload;
        let _ = probe.try_get_u16_le()?;
        Ok(Message {
            mode,
            buf: BytesMut::from(payload),
            read_pos: MESSAGE_ID_SIZE,
        })
    }

    pub fn id(&self) -> u16 {
        u16::from_le_bytes([self.buf[0], self.buf[1]])
    }

    pub fn mode(&self) -> SendMode {
        self.mode
    }

    /// the full wire payload: message id followed by the written body
    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn into_buf(self) -> BytesMut {
        self.buf
    }

    /// number of unread bytes behind the cursor
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    pub fn reset_cursor(&mut self) {
        self.read_pos = MESSAGE_ID_SIZE;
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    /// length-prefixed byte run (u16 length)
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u16_le(value.len() as u16);
        self.buf.put_slice(value);
        self
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        let mut slice = &self.buf[self.read_pos..];
        let value = slice.try_get_u8()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(value)
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        let mut slice = &self.buf[self.read_pos..];
        let value = slice.try_get_u16_le()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(value)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        let mut slice = &self.buf[self.read_pos..];
        let value = slice.try_get_u32_le()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(value)
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        let mut slice = &self.buf[self.read_pos..];
        let value = slice.try_get_u64_le()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(value)
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.read_u16()? as usize;
        if self.remaining() < len {
            anyhow::bail!("byte run of {} exceeds the {} remaining bytes", len, self.remaining());
        }
        let value = Bytes::copy_from_slice(&self.buf[self.read_pos..self.read_pos + len]);
        self.read_pos += len;
        Ok(value)
    }

    pub fn read_str(&mut self) -> anyhow::Result<String> {
        let raw = self.read_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

/// A bounded free-list of message buffers. Retained buffers keep their
///  allocation and are cleared on reuse; once `max_retained` buffers are held,
///  further releases just drop the allocation.
///
/// The pool is shared between a peer and the messages it hands out via `Arc`,
///  and is torn down when the last holder goes away.
pub struct MessagePool {
    buffers: RwLock<Vec<BytesMut>>,
    max_retained: usize,
}

impl MessagePool {
    pub fn new(max_retained: usize) -> MessagePool {
        MessagePool {
            buffers: RwLock::new(Vec::with_capacity(max_retained)),
            max_retained,
        }
    }

    pub async fn message(&self, mode: SendMode, id: u16) -> Message {
        let buf = self.buffers.write().await
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_DATAGRAM_SIZE));
        Message::with_buf(mode, id, buf)
    }

    pub async fn release(&self, message: Message) {
        let mut buffers = self.buffers.write().await;
        if buffers.len() < self.max_retained {
            let mut buf = message.into_buf();
            buf.clear();
            buffers.push(buf);
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_round_trip() {
        let mut msg = Message::reliable(42);
        msg.write_u8(7)
            .write_u16(0x1234)
            .write_u32(0xdead_beef)
            .write_u64(u64::MAX)
            .write_bool(true)
            .write_bytes(b"\xab\xcd")
            .write_str("hello");

        let mut received = Message::from_payload(SendMode::Reliable, msg.payload()).unwrap();
        assert_eq!(received.id(), 42);
        assert_eq!(received.read_u8().unwrap(), 7);
        assert_eq!(received.read_u16().unwrap(), 0x1234);
        assert_eq!(received.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(received.read_u64().unwrap(), u64::MAX);
        assert!(received.read_bool().unwrap());
        assert_eq!(&received.read_bytes().unwrap()[..], b"\xab\xcd");
        assert_eq!(received.read_str().unwrap(), "hello");
        assert_eq!(received.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_is_an_error() {
        let mut msg = Message::unreliable(1);
        msg.write_u8(5);

        let mut received = Message::from_payload(SendMode::Unreliable, msg.payload()).unwrap();
        assert_eq!(received.read_u8().unwrap(), 5);
        assert!(received.read_u8().is_err());
        // a failed read does not advance the cursor
        assert_eq!(received.remaining(), 0);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        assert!(Message::from_payload(SendMode::Unreliable, b"\x01").is_err());
    }

    #[test]
    fn test_reset_cursor_rereads_from_start() {
        let mut msg = Message::unreliable(9);
        msg.write_u16(0xbeef);
        let mut received = Message::from_payload(SendMode::Unreliable, msg.payload()).unwrap();
        assert_eq!(received.read_u16().unwrap(), 0xbeef);
        received.reset_cursor();
        assert_eq!(received.read_u16().unwrap(), 0xbeef);
    }

    #[tokio::test]
    async fn test_pool_reuses_buffers_up_to_limit() {
        let pool = MessagePool::new(1);

        let a = pool.message(SendMode::Reliable, 1).await;
        let b = pool.message(SendMode::Reliable, 2).await;
        pool.release(a).await;
        pool.release(b).await; // beyond max_retained, dropped

        assert_eq!(pool.buffers.read().await.len(), 1);

        let reused = pool.message(SendMode::Unreliable, 3).await;
        assert_eq!(reused.id(), 3);
        assert_eq!(reused.remaining(), 0);
        assert_eq!(pool.buffers.read().await.len(), 0);
    }
}
