//! Channel requests, RFC4254 section 6.
//!
//! Incoming requests are offered to a chain of [`RequestHandler`]s in
//! order. The first that doesn't return [`ReqResult::Unsupported`]
//! decides the reply.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use crate::channel::Channel;
use crate::config::MAX_TERM;
use crate::future::SshFuture;
use crate::packets::{
    Break, ChannelRequest, Env, Exec, ExitSignal, ExitStatus, PtyReq, Signal,
    Subsystem, WinChange,
};
use crate::sshnames::*;
use crate::sshwire::{read_ssh, BinString, TextString};

/// Outcome of a [`RequestHandler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReqResult {
    /// Not handled, try the next handler
    Unsupported,
    /// The handler already sent its reply with [`Channel::reply()`]
    Replied,
    /// A success reply is sent if the peer wants one
    Success,
    /// A failure reply is sent if the peer wants one
    Failure,
}

pub trait RequestHandler: Send + Sync {
    /// Handles `req`. An error is treated as [`ReqResult::Failure`].
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult>;
}

/// Adapts a closure to a [`RequestHandler`]
pub struct FnHandler<F>(pub F);

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&Channel, &ChannelRequest<'_>) -> Result<ReqResult> + Send + Sync,
{
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        (self.0)(ch, req)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(&Channel, &ChannelRequest<'_>) -> Result<ReqResult> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// How the remote command exited, stored as a channel attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum ChanExit {
    Status(u32),
    Signal { signal: String, core: bool, error: String },
}

/// Terminal dimensions, in characters and pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

impl From<&WinChange> for WindowSize {
    fn from(w: &WinChange) -> Self {
        Self { cols: w.cols, rows: w.rows, width: w.width, height: w.height }
    }
}

/// A pseudo-terminal request, stored as a channel attribute by
/// [`PtyHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct Pty {
    pub term: heapless::String<MAX_TERM>,
    pub size: WindowSize,
    /// Encoded terminal modes, RFC4254 section 8
    pub modes: Vec<u8>,
}

/// Environment variables the peer has set, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvVars(pub Vec<(String, String)>);

/// Records `"exit-status"` as [`ChanExit::Status`]
pub struct ExitStatusHandler;

impl RequestHandler for ExitStatusHandler {
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        if req.req != SSH_REQ_EXIT_STATUS {
            return Ok(ReqResult::Unsupported);
        }
        let e: ExitStatus = read_ssh(req.data)?;
        debug!("ch {} exit status {}", ch.num(), e.status);
        ch.set_attribute(ChanExit::Status(e.status));
        Ok(ReqResult::Success)
    }
}

/// Records `"exit-signal"` as [`ChanExit::Signal`]
pub struct ExitSignalHandler;

impl RequestHandler for ExitSignalHandler {
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        if req.req != SSH_REQ_EXIT_SIGNAL {
            return Ok(ReqResult::Unsupported);
        }
        let e: ExitSignal = read_ssh(req.data)?;
        debug!("ch {} exit signal {}", ch.num(), e.signal);
        ch.set_attribute(ChanExit::Signal {
            signal: e.signal.into(),
            core: e.core,
            error: e.error.to_string_lossy(),
        });
        Ok(ReqResult::Success)
    }
}

/// OpenSSH keepalives expect a failure reply.
pub struct KeepaliveHandler;

impl RequestHandler for KeepaliveHandler {
    fn handle(&self, _ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        if req.req == SSH_REQ_KEEPALIVE {
            Ok(ReqResult::Failure)
        } else {
            Ok(ReqResult::Unsupported)
        }
    }
}

/// Stores a `"pty-req"` as a [`Pty`] attribute.
pub struct PtyHandler;

impl RequestHandler for PtyHandler {
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        if req.req != SSH_REQ_PTY {
            return Ok(ReqResult::Unsupported);
        }
        let p: PtyReq = read_ssh(req.data)?;
        let Ok(term) = heapless::String::try_from(p.term.as_ascii()?) else {
            debug!("ch {} long TERM rejected", ch.num());
            return Ok(ReqResult::Failure);
        };
        let size = WindowSize { cols: p.cols, rows: p.rows, width: p.width, height: p.height };
        ch.set_attribute(Pty { term, size, modes: p.modes.0.to_vec() });
        ch.set_attribute(size);
        Ok(ReqResult::Success)
    }
}

/// Updates the [`WindowSize`] attribute on `"window-change"`.
pub struct WinChangeHandler;

impl RequestHandler for WinChangeHandler {
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        if req.req != SSH_REQ_WINDOW_CHANGE {
            return Ok(ReqResult::Unsupported);
        }
        let w: WinChange = read_ssh(req.data)?;
        trace!("ch {} window change {w:?}", ch.num());
        ch.set_attribute(WindowSize::from(&w));
        Ok(ReqResult::Success)
    }
}

/// Collects `"env"` requests into the [`EnvVars`] attribute.
pub struct EnvHandler;

impl RequestHandler for EnvHandler {
    fn handle(&self, ch: &Channel, req: &ChannelRequest<'_>) -> Result<ReqResult> {
        if req.req != SSH_REQ_ENV {
            return Ok(ReqResult::Unsupported);
        }
        let e: Env = read_ssh(req.data)?;
        let mut vars = ch.attribute::<EnvVars>().unwrap_or_default();
        vars.0.push((e.name.as_str()?.into(), e.value.to_string_lossy()));
        ch.set_attribute(vars);
        Ok(ReqResult::Success)
    }
}

/// Installed on every channel.
pub(crate) fn default_handlers() -> Vec<Arc<dyn RequestHandler>> {
    vec![Arc::new(ExitStatusHandler), Arc::new(ExitSignalHandler), Arc::new(KeepaliveHandler)]
}

/// Handlers for the server side of a session channel
pub fn session_handlers() -> Vec<Arc<dyn RequestHandler>> {
    vec![Arc::new(PtyHandler), Arc::new(WinChangeHandler), Arc::new(EnvHandler)]
}

impl Channel {
    pub fn add_session_handlers(&self) {
        for h in session_handlers() {
            self.add_request_handler(h)
        }
    }

    /// How the remote command exited, if it has reported it.
    pub fn exit(&self) -> Option<ChanExit> {
        self.attribute()
    }

    pub fn shell(&self) -> Result<SshFuture<bool>> {
        self.send_request_raw(SSH_REQ_SHELL, true, &[])
    }

    pub fn exec(&self, command: &str) -> Result<SshFuture<bool>> {
        self.send_request(SSH_REQ_EXEC, true, &Exec { command: command.into() })
    }

    pub fn subsystem(&self, subsystem: &str) -> Result<SshFuture<bool>> {
        self.send_request(SSH_REQ_SUBSYSTEM, true, &Subsystem { subsystem: subsystem.into() })
    }

    pub fn request_pty(
        &self,
        term: &str,
        size: WindowSize,
        modes: &[u8],
    ) -> Result<SshFuture<bool>> {
        if term.len() > MAX_TERM {
            return Err(Error::usage("TERM too long"));
        }
        let p = PtyReq {
            term: term.into(),
            cols: size.cols,
            rows: size.rows,
            width: size.width,
            height: size.height,
            modes: BinString(modes),
        };
        self.send_request(SSH_REQ_PTY, true, &p)
    }

    pub fn window_change(&self, size: WindowSize) -> Result<SshFuture<bool>> {
        let w = WinChange { cols: size.cols, rows: size.rows, width: size.width, height: size.height };
        self.send_request(SSH_REQ_WINDOW_CHANGE, false, &w)
    }

    pub fn env(&self, name: &str, value: &str) -> Result<SshFuture<bool>> {
        self.send_request(SSH_REQ_ENV, true, &Env { name: name.into(), value: value.into() })
    }

    /// `sig` is a name without the `SIG` prefix, eg `"TERM"`
    pub fn signal(&self, sig: &str) -> Result<SshFuture<bool>> {
        self.send_request(SSH_REQ_SIGNAL, false, &Signal { sig })
    }

    /// RFC4335 break, `length` in milliseconds
    pub fn send_break(&self, length: u32) -> Result<SshFuture<bool>> {
        self.send_request(SSH_REQ_BREAK, true, &Break { length })
    }

    pub fn exit_status(&self, status: u32) -> Result<SshFuture<bool>> {
        self.send_request(SSH_REQ_EXIT_STATUS, false, &ExitStatus { status })
    }

    pub fn exit_signal(&self, signal: &str, core: bool, error: &str) -> Result<SshFuture<bool>> {
        let e = ExitSignal { signal, core, error: TextString(error.as_bytes()), lang: "" };
        self.send_request(SSH_REQ_EXIT_SIGNAL, false, &e)
    }
}
