//! SSH connection protocol channel packets.
//!
//! A [`Packet`] can be encoded/decoded to the SSH wire format using
//! [`sshwire`]. Channel messages are described in
//! [RFC4254](https://tools.ietf.org/html/rfc4254) section 5 and 6.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use sunset_sshwire_derive::*;

use crate::sshnames::*;
use crate::sshwire::{self, BinString, TextString};
use crate::sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireError, WireResult};

#[derive(Debug)]
pub struct ChannelOpen<'a> {
    /// The sender's channel number
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub ty: ChannelOpenType<'a>,
}

// channel type name comes first on the wire, the type-specific
// fields come last.
impl SSHEncode for ChannelOpen<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let name = self.ty.name().map_err(|_| WireError::UnknownVariant)?;
        name.enc(s)?;
        self.num.enc(s)?;
        self.initial_window.enc(s)?;
        self.max_packet.enc(s)?;
        match &self.ty {
            ChannelOpenType::Session => Ok(()),
            ChannelOpenType::DirectTcpip(t) => t.enc(s),
            ChannelOpenType::ForwardedTcpip(t) => t.enc(s),
            ChannelOpenType::X11(t) => t.enc(s),
            ChannelOpenType::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for ChannelOpen<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let name = BinString::dec(s)?.0;
        let num = u32::dec(s)?;
        let initial_window = u32::dec(s)?;
        let max_packet = u32::dec(s)?;
        let ty = match sshwire::try_as_ascii_str(name) {
            Ok(SSH_CHANNEL_SESSION) => ChannelOpenType::Session,
            Ok(SSH_CHANNEL_DIRECT_TCPIP) => ChannelOpenType::DirectTcpip(SSHDecode::dec(s)?),
            Ok(SSH_CHANNEL_FORWARDED_TCPIP) => {
                ChannelOpenType::ForwardedTcpip(SSHDecode::dec(s)?)
            }
            Ok(SSH_CHANNEL_X11) => ChannelOpenType::X11(SSHDecode::dec(s)?),
            _ => {
                // skip whatever type specific data follows
                let rest = s.remaining();
                s.take(rest)?;
                ChannelOpenType::Unknown(Unknown(name))
            }
        };
        Ok(Self { num, initial_window, max_packet, ty })
    }
}

#[derive(Debug)]
pub enum ChannelOpenType<'a> {
    Session,
    DirectTcpip(DirectTcpip<'a>),
    ForwardedTcpip(ForwardedTcpip<'a>),
    X11(X11<'a>),
    /// Received only, can't be encoded.
    Unknown(Unknown<'a>),
}

impl<'a> ChannelOpenType<'a> {
    /// The channel type name. Fails for `Unknown`.
    pub fn name(&self) -> Result<&'static str, &Unknown<'a>> {
        match self {
            Self::Session => Ok(SSH_CHANNEL_SESSION),
            Self::DirectTcpip(_) => Ok(SSH_CHANNEL_DIRECT_TCPIP),
            Self::ForwardedTcpip(_) => Ok(SSH_CHANNEL_FORWARDED_TCPIP),
            Self::X11(_) => Ok(SSH_CHANNEL_X11),
            Self::Unknown(u) => Err(u),
        }
    }
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ChannelOpenFailure<'a> {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: &'a str,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ChannelData<'a> {
    pub num: u32,
    pub data: BinString<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ChannelDataExt<'a> {
    pub num: u32,
    pub code: u32,
    pub data: BinString<'a>,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ChannelEof {
    pub num: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ChannelClose {
    pub num: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ChannelSuccess {
    pub num: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ChannelFailure {
    pub num: u32,
}

/// A channel request.
///
/// `data` is the request specific remainder of the packet, decoded
/// by whichever handler claims `req`.
pub struct ChannelRequest<'a> {
    pub num: u32,
    pub req: &'a str,
    pub want_reply: bool,
    pub data: &'a [u8],
}

impl SSHEncode for ChannelRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.num.enc(s)?;
        self.req.enc(s)?;
        self.want_reply.enc(s)?;
        self.data.enc(s)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for ChannelRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let num = u32::dec(s)?;
        let req = SSHDecode::dec(s)?;
        let want_reply = bool::dec(s)?;
        let rest = s.remaining();
        let data = s.take(rest)?;
        Ok(Self { num, req, want_reply, data })
    }
}

impl fmt::Debug for ChannelRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("num", &self.num)
            .field("req", &self.req)
            .field("want_reply", &self.want_reply)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct DirectTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ForwardedTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct X11<'a> {
    pub origin: TextString<'a>,
    pub origin_port: u32,
}

// Request specific bodies, following the `ChannelRequest` header.

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Exec<'a> {
    pub command: TextString<'a>,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Subsystem<'a> {
    pub subsystem: TextString<'a>,
}

/// The contents of a `"pty-req"` request.
#[derive(Debug, SSHEncode, SSHDecode)]
pub struct PtyReq<'a> {
    pub term: TextString<'a>,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: BinString<'a>,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct WinChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Env<'a> {
    pub name: TextString<'a>,
    pub value: TextString<'a>,
}

/// A unix signal channel request
#[derive(Debug, SSHEncode, SSHDecode)]
pub struct Signal<'a> {
    pub sig: &'a str,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ExitStatus {
    pub status: u32,
}

#[derive(Debug, SSHEncode, SSHDecode)]
pub struct ExitSignal<'a> {
    pub signal: &'a str,
    pub core: bool,
    pub error: TextString<'a>,
    pub lang: &'a str,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Break {
    pub length: u32,
}

// Placeholder for unknown channel type names.
// This is deliberately not Serializable, we only receive it.
#[derive(Clone, PartialEq)]
pub struct Unknown<'a>(pub &'a [u8]);

impl fmt::Display for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = sshwire::try_as_ascii_str(self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl fmt::Debug for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident
            ),
             )*
    ) => {


#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    // variants are eg
    // SSH_MSG_CHANNEL_OPEN = 90,
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => {
                Err(Error::UnknownPacket { number: v })
            }
        }
    }
}

impl Packet<'_> {
    /// Encodes the packet without the leading message number.
    pub fn enc_body<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            $(
            Packet::$SpecificPacketVariant(p) => {
                p.enc(s)
            }
            )*
        }
    }
}

impl SSHEncode for Packet<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let t = self.message_num() as u8;
        t.enc(s)?;
        self.enc_body(s)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for Packet<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let msg_num = u8::dec(s)?;
        let ty = match MessageNumber::try_from(msg_num) {
            Ok(t) => t,
            Err(_) => return Err(WireError::UnknownPacket { number: msg_num })
        };

        // Decode based on the message number
        let p = match ty {
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Channel packet enum
#[derive(Debug)]
pub enum Packet<'a> {
    // eg ChannelOpen(ChannelOpen<'a>),
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl<'a> Packet<'a> {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            $(
            Packet::$SpecificPacketVariant(_) => {
                MessageNumber::$SSH_MESSAGE_NAME
            }
            )*
        }
    }
}

$(
impl<'a> From<$SpecificPacketType> for Packet<'a> {
    fn from(s: $SpecificPacketType) -> Packet<'a> {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

messagetypes![
(90, ChannelOpen, ChannelOpen<'a>, SSH_MSG_CHANNEL_OPEN),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION),
(92, ChannelOpenFailure, ChannelOpenFailure<'a>, SSH_MSG_CHANNEL_OPEN_FAILURE),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST),
(94, ChannelData, ChannelData<'a>, SSH_MSG_CHANNEL_DATA),
(95, ChannelDataExt, ChannelDataExt<'a>, SSH_MSG_CHANNEL_EXTENDED_DATA),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE),
(98, ChannelRequest, ChannelRequest<'a>, SSH_MSG_CHANNEL_REQUEST),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE),
];

impl Packet<'_> {
    /// The recipient channel number, or for `ChannelOpen` the sender's number.
    pub fn channel_num(&self) -> u32 {
        match self {
            Packet::ChannelOpen(p) => p.num,
            Packet::ChannelOpenConfirmation(p) => p.num,
            Packet::ChannelOpenFailure(p) => p.num,
            Packet::ChannelWindowAdjust(p) => p.num,
            Packet::ChannelData(p) => p.num,
            Packet::ChannelDataExt(p) => p.num,
            Packet::ChannelEof(p) => p.num,
            Packet::ChannelClose(p) => p.num,
            Packet::ChannelRequest(p) => p.num,
            Packet::ChannelSuccess(p) => p.num,
            Packet::ChannelFailure(p) => p.num,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::packets::*;
    use crate::sshwire::tests::assert_serialize_equal;
    use crate::sshwire::{packet_from_bytes, read_ssh, write_vec};
    use crate::sunsetlog::init_test_log;

    fn enc(p: &Packet) -> Vec<u8> {
        let mut buf = vec![];
        write_vec(&mut buf, p).unwrap();
        buf
    }

    #[test]
    /// check round trip of packet enums is right
    fn packet_type() {
        for i in 0..=255 {
            let ty = MessageNumber::try_from(i);
            if let Ok(ty) = ty {
                assert_eq!(i, ty as u8);
            }
        }
    }

    #[test]
    fn channel_open_direct_tcpip_layout() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 111,
            initial_window: 50000,
            max_packet: 20000,
            ty: ChannelOpenType::DirectTcpip(DirectTcpip {
                address: "localhost".into(),
                port: 4444,
                origin: "somewhere".into(),
                origin_port: 0,
            }),
        });
        let buf = enc(&p);
        assert_eq!(buf[0], 90);
        // name is first
        assert_eq!(&buf[1..5], &[0u8, 0, 0, 12]);
        assert_eq!(&buf[5..17], b"direct-tcpip");
        assert_eq!(&buf[17..21], &111u32.to_be_bytes());
        assert_eq!(&buf[21..25], &50000u32.to_be_bytes());
        assert_eq!(&buf[25..29], &20000u32.to_be_bytes());

        let p2 = packet_from_bytes(&buf).unwrap();
        assert_serialize_equal(&p, &p2);
        assert!(matches!(p2,
            Packet::ChannelOpen(ChannelOpen { ty: ChannelOpenType::DirectTcpip(DirectTcpip { port: 4444, .. }), .. })
        ));
    }

    #[test]
    fn unknown_channel_type() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 899,
            max_packet: 14,
            ty: ChannelOpenType::Session,
        });
        let mut buf = enc(&p);
        // change a byte of "session", and add trailing junk
        buf[5] = b'X';
        buf.extend_from_slice(b"extra");
        let p2 = packet_from_bytes(&buf).unwrap();
        trace!("unknown: {p2:#?}");
        match p2 {
            Packet::ChannelOpen(ChannelOpen { ty: ChannelOpenType::Unknown(u), num: 0, .. }) => {
                assert_eq!(u.0, b"Xession");
            }
            _ => panic!("wrong packet"),
        }
    }

    #[test]
    #[should_panic]
    fn unknown_method_ser() {
        init_test_log();
        let p = Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 200000,
            max_packet: 88200,
            ty: ChannelOpenType::Unknown(Unknown(b"audio-stream")),
        });
        let mut buf1 = vec![];
        write_vec(&mut buf1, &p).unwrap();
    }

    #[test]
    fn channel_request_keeps_body() {
        init_test_log();
        let mut body = vec![];
        write_vec(&mut body, &ExitStatus { status: 3 }).unwrap();
        let p = Packet::ChannelRequest(ChannelRequest {
            num: 7,
            req: SSH_REQ_EXIT_STATUS,
            want_reply: false,
            data: &body,
        });
        let buf = enc(&p);
        let p2 = packet_from_bytes(&buf).unwrap();
        let Packet::ChannelRequest(r) = p2 else { panic!("wrong packet") };
        assert_eq!(r.num, 7);
        assert_eq!(r.req, "exit-status");
        assert!(!r.want_reply);
        let st: ExitStatus = read_ssh(r.data).unwrap();
        assert_eq!(st.status, 3);
    }

    #[test]
    fn trailing_bytes_rejected() {
        init_test_log();
        let mut buf = enc(&Packet::ChannelEof(ChannelEof { num: 3 }));
        buf.push(0);
        assert!(matches!(packet_from_bytes(&buf), Err(Error::WrongPacketLength)));
    }

    #[test]
    fn unknown_message_number() {
        init_test_log();
        let buf = [21u8, 0, 0, 0, 0];
        assert!(matches!(packet_from_bytes(&buf), Err(Error::UnknownPacket { number: 21 })));
    }

    #[test]
    fn data_field_order() {
        init_test_log();
        let p = Packet::ChannelData(ChannelData { num: 1, data: BinString(b"zz") });
        assert_eq!(enc(&p), [94, 0, 0, 0, 1, 0, 0, 0, 2, b'z', b'z']);

        let p = Packet::ChannelDataExt(ChannelDataExt {
            num: 1,
            code: SSH_EXTENDED_DATA_STDERR,
            data: BinString(b"zz"),
        });
        assert_eq!(enc(&p), [95, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2, b'z', b'z']);
    }
}
