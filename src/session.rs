//! The boundary to the transport layer.
//!
//! A [`Session`] owns key exchange, encryption and framing. Channels only
//! hand it complete packet payloads and react to the returned
//! [`WriteFuture`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use crate::future::WriteFuture;
use crate::packets::{MessageNumber, Packet};
use crate::sshwire::{self, SSHEncode, SSHSink, WireResult};

/// A transport connection able to carry channel packets.
///
/// Implementations must serialise packets written concurrently from
/// several channels. `write_packet()` must not call back into the
/// channel synchronously while holding its own locks.
pub trait Session: Send + Sync {
    /// Allocates an outgoing packet buffer for message type `msg`.
    ///
    /// `size_hint` is the expected payload length excluding the message
    /// number.
    fn create_buffer(&self, msg: MessageNumber, size_hint: usize) -> PacketBuf {
        PacketBuf::new(msg, size_hint)
    }

    /// Queues a packet for sending. The future completes once the
    /// transport has accepted or failed it.
    fn write_packet(&self, buf: PacketBuf) -> WriteFuture;
}

/// An outgoing packet payload, starting with the message number.
#[derive(Clone)]
pub struct PacketBuf {
    buf: Vec<u8>,
}

impl PacketBuf {
    pub fn new(msg: MessageNumber, size_hint: usize) -> Self {
        let mut buf = Vec::with_capacity(size_hint + 1);
        buf.push(msg as u8);
        Self { buf }
    }

    /// Encodes a whole [`Packet`].
    pub fn from_packet(p: &Packet) -> Result<Self> {
        let len = sshwire::length_enc(p)?;
        let mut b = Self { buf: Vec::with_capacity(len as usize) };
        p.enc(&mut b)?;
        Ok(b)
    }

    pub fn msg(&self) -> Result<MessageNumber> {
        let n = *self.buf.first().trap()?;
        MessageNumber::try_from(n)
    }

    /// Appends the wire encoding of `v`.
    pub fn put<T: SSHEncode>(&mut self, v: &T) -> Result<()> {
        v.enc(self)?;
        Ok(())
    }

    /// The payload including the leading message number.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        // the message number is always present
        false
    }

    /// Decodes the buffer back to a [`Packet`]
    pub fn packet(&self) -> Result<Packet<'_>> {
        sshwire::packet_from_bytes(&self.buf)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl SSHSink for PacketBuf {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.buf.extend_from_slice(v);
        Ok(())
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("msg", &self.msg().ok())
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Hex dump for trace logging
pub(crate) fn trace_packet(dir: &str, b: &PacketBuf) {
    if log::log_enabled!(log::Level::Trace) {
        trace!("{dir} {:?}\n{:?}", b.msg().ok(), b.payload().hex_dump());
    }
}

#[cfg(test)]
mod tests {
    use crate::packets::*;
    use crate::session::*;
    use crate::sunsetlog::init_test_log;

    #[test]
    fn buffer_starts_with_message() {
        init_test_log();
        let mut b = PacketBuf::new(MessageNumber::SSH_MSG_CHANNEL_WINDOW_ADJUST, 8);
        b.put(&ChannelWindowAdjust { num: 4, adjust: 1000 }).unwrap();
        assert_eq!(b.payload()[0], 93);
        assert_eq!(b.len(), 9);
        match b.packet().unwrap() {
            Packet::ChannelWindowAdjust(a) => {
                assert_eq!(a, ChannelWindowAdjust { num: 4, adjust: 1000 })
            }
            _ => panic!("wrong packet"),
        }
    }

    #[test]
    fn from_packet_matches_manual() {
        init_test_log();
        let p: Packet = ChannelClose { num: 12 }.into();
        let b1 = PacketBuf::from_packet(&p).unwrap();
        let mut b2 = PacketBuf::new(MessageNumber::SSH_MSG_CHANNEL_CLOSE, 4);
        b2.put(&ChannelClose { num: 12 }).unwrap();
        assert_eq!(b1.payload(), b2.payload());
        assert_eq!(b1.msg().unwrap(), MessageNumber::SSH_MSG_CHANNEL_CLOSE);
    }
}
