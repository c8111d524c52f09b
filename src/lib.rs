#![forbid(unsafe_code)]

// avoids headscratching
#![deny(unused_must_use)]

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
// exported so that some error variants can be created with .fail().
pub mod error;

mod sunsetlog;
mod future;
mod session;
mod window;
mod channel;
mod request;
mod conn;
mod chanin;
mod chanout;
mod async_channel;

#[cfg(test)]
mod test;

// Application API
pub use sshwire::TextString;

pub use error::{Error, Result};
pub use config::ChanConfig;
pub use sshnames::ChanFail;

pub use future::{SshFuture, WriteFuture};
pub use session::{PacketBuf, Session};
pub use window::{Window, WindowKind};
pub use channel::{ChanData, ChanNum, ChanState, Channel, ChannelListener, DataSink};
pub use request::{
    handler_fn, session_handlers, ChanExit, EnvHandler, EnvVars, ExitSignalHandler,
    ExitStatusHandler, FnHandler, KeepaliveHandler, Pty, PtyHandler, ReqResult,
    RequestHandler, WinChangeHandler, WindowSize,
};
pub use conn::{ChannelOpener, Channels};
pub use chanin::ChanInput;
pub use chanout::ChanOutput;
pub use async_channel::{AsyncChanInput, AsyncChanOutput};
