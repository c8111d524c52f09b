#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;
use core::str::Utf8Error;

use std::sync::Arc;

use snafu::prelude::*;

use crate::channel::ChanNum;

/// The sunset-mux error type.
///
/// `Clone` so that one failure can complete every operation waiting on it.
#[non_exhaustive]
#[derive(Snafu, Debug, Clone)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Error in received SSH protocol. Fatal to the channel.
    SSHProtoError,

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    #[snafu(display("Channel data length {size} exceeds the packet limit"))]
    BigPacket { size: usize },

    /// Ran out of channels
    NoChannels,

    #[snafu(display("Bad channel number {num}"))]
    BadChannel { num: ChanNum },

    /// Bad application usage
    ///
    /// A programming error rather than a network condition, for example
    /// issuing a second asynchronous read while one is still pending.
    #[snafu(display("Bad usage: {msg}"))]
    BadUsage { msg: &'static str },

    /// Channel EOF
    ///
    /// EOF has been sent, no more data may be written.
    ChannelEOF,

    /// The channel is closing or closed. Terminal.
    ChannelClosed,

    /// A flow control window was closed while waiting on it. Terminal,
    /// unlike [`Error::Timeout`].
    WindowClosed,

    /// A bounded wait expired. The caller may retry.
    Timeout,

    #[snafu(display("Channel open failed, reason {reason}: {desc}"))]
    OpenFailed { reason: u32, desc: String },

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    /// IO Error from the transport
    IoError { source: Arc<std::io::Error> },

    /// Program bug
    ///
    /// This state should not be reached, previous logic should have prevented it.
    /// Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    Bug,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    pub fn usage(msg: &'static str) -> Error {
        Error::BadUsage { msg }
    }

    /// Returns `true` for errors that end a channel for good.
    ///
    /// [`Error::Timeout`] is the notable non-terminal error.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::Timeout)
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `debug` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            debug!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    #[cold]
    pub fn bug_err_msg(msg: &str) -> Error {
        Self::bug_fmt(format_args!("{}", msg))
    }
}

#[cfg(feature = "embedded-io")]
impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Error::Timeout => embedded_io::ErrorKind::TimedOut,
            Error::ChannelClosed | Error::WindowClosed => {
                embedded_io::ErrorKind::BrokenPipe
            }
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// A sunset-mux specific Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message, calls [`Error::bug_msg()`]
    /// The message can be used instead of a comment.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        // call directly so that Location::caller() works
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: Arc::new(value) }
    }
}

/// Converts to `std::io::Error` for the blocking stream adapters.
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &e {
            Error::Timeout => ErrorKind::TimedOut,
            Error::ChannelClosed | Error::WindowClosed | Error::ChannelEOF => {
                ErrorKind::BrokenPipe
            }
            Error::BadUsage { .. } => ErrorKind::InvalidInput,
            Error::IoError { source } => source.kind(),
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::error::*;
    use crate::sunsetlog::init_test_log;

    #[test]
    fn timeout_is_not_terminal() {
        init_test_log();
        assert!(!Error::Timeout.is_terminal());
        assert!(Error::WindowClosed.is_terminal());
        assert!(Error::ChannelClosed.is_terminal());
    }

    #[test]
    fn io_error_kinds() {
        let e: std::io::Error = Error::Timeout.into();
        assert_eq!(e.kind(), std::io::ErrorKind::TimedOut);
        let e: std::io::Error = Error::WindowClosed.into();
        assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
        let src = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone");
        let e: std::io::Error = Error::from(src).into();
        assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn clone_keeps_source() {
        let src = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone");
        let e = Error::from(src);
        let e2 = e.clone();
        assert!(matches!(e2, Error::IoError { .. }));
    }
}
