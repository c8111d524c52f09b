//! Named SSH channel types, requests and codes.
//!
//! Some identifiers are also matched directly in `packets.rs`.
//! Packet numbers are listed in `packets.rs`.
//!
//! Everything here is from [RFC4254](https://tools.ietf.org/html/rfc4254)
//! unless noted.

pub const SSH_CHANNEL_SESSION: &str = "session";
pub const SSH_CHANNEL_DIRECT_TCPIP: &str = "direct-tcpip";
pub const SSH_CHANNEL_FORWARDED_TCPIP: &str = "forwarded-tcpip";
pub const SSH_CHANNEL_X11: &str = "x11";

pub const SSH_REQ_PTY: &str = "pty-req";
pub const SSH_REQ_X11: &str = "x11-req";
pub const SSH_REQ_ENV: &str = "env";
pub const SSH_REQ_SHELL: &str = "shell";
pub const SSH_REQ_EXEC: &str = "exec";
pub const SSH_REQ_SUBSYSTEM: &str = "subsystem";
pub const SSH_REQ_WINDOW_CHANGE: &str = "window-change";
pub const SSH_REQ_XON_XOFF: &str = "xon-xoff";
pub const SSH_REQ_SIGNAL: &str = "signal";
pub const SSH_REQ_EXIT_STATUS: &str = "exit-status";
pub const SSH_REQ_EXIT_SIGNAL: &str = "exit-signal";
/// [RFC4335](https://tools.ietf.org/html/rfc4335)
pub const SSH_REQ_BREAK: &str = "break";
/// OpenSSH [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD).
/// Sent with `want_reply`, OpenSSH expects a failure response.
pub const SSH_REQ_KEEPALIVE: &str = "keepalive@openssh.com";

pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Channel open failure reason codes
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanFail {
    SSH_OPEN_ADMINISTRATIVELY_PROHIBITED = 1,
    SSH_OPEN_CONNECT_FAILED = 2,
    SSH_OPEN_UNKNOWN_CHANNEL_TYPE = 3,
    SSH_OPEN_RESOURCE_SHORTAGE = 4,
}

impl ChanFail {
    pub fn description(&self) -> &'static str {
        match self {
            Self::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED => "administratively prohibited",
            Self::SSH_OPEN_CONNECT_FAILED => "connect failed",
            Self::SSH_OPEN_UNKNOWN_CHANNEL_TYPE => "unknown channel type",
            Self::SSH_OPEN_RESOURCE_SHORTAGE => "resource shortage",
        }
    }
}
