//! The connection service: owns a connection's channels and routes
//! incoming channel packets to them.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use snafu::prelude::*;

use crate::channel::{ChanNum, Channel};
use crate::config::ChanConfig;
use crate::error;
use crate::future::SshFuture;
use crate::packets::{self, ChannelOpen, ChannelOpenType, MessageNumber, Packet};
use crate::session::Session;
use crate::sshnames::ChanFail;
use crate::sshwire;

/// Decides whether to accept a channel the peer opens.
///
/// Called once the channel is set up but before the confirmation is
/// sent, so sinks and handlers can be installed first.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, ch: &Arc<Channel>, ty: &ChannelOpenType<'_>) -> Result<(), ChanFail>;
}

/// The channels of one connection.
pub struct Channels {
    session: Arc<dyn Session>,
    config: ChanConfig,
    me: Weak<Channels>,
    ch: Mutex<Vec<Option<Arc<Channel>>>>,
    opener: Mutex<Option<Arc<dyn ChannelOpener>>>,
}

impl Channels {
    pub fn new(session: Arc<dyn Session>, config: ChanConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Channels {
            session,
            config,
            me: me.clone(),
            ch: Mutex::new(Vec::new()),
            opener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ChanConfig {
        &self.config
    }

    /// Sets the handler for channels opened by the peer. Without one,
    /// all are refused.
    pub fn set_opener(&self, opener: Arc<dyn ChannelOpener>) {
        *self.opener.lock() = Some(opener);
    }

    /// Opens a new channel. The returned future completes once the peer
    /// confirms.
    pub fn open(&self, ty: ChannelOpenType<'_>) -> Result<(Arc<Channel>, SshFuture<()>)> {
        let ch = self.reserve()?;
        match ch.open(ty) {
            Ok(f) => Ok((ch, f)),
            Err(e) => {
                ch.close(true);
                Err(e)
            }
        }
    }

    /// Allocates the lowest free channel number.
    fn reserve(&self) -> Result<Arc<Channel>> {
        let mut chans = self.ch.lock();
        let idx = match chans.iter().position(|c| c.is_none()) {
            Some(i) => i,
            None if chans.len() < self.config.max_channels => {
                chans.push(None);
                chans.len() - 1
            }
            None => return Err(Error::NoChannels),
        };
        let num = ChanNum(idx as u32);
        let ch =
            Channel::new(num, self.config.clone(), self.session.clone(), self.me.clone());
        chans[idx] = Some(ch.clone());
        trace!("reserved ch {num}");
        Ok(ch)
    }

    /// Returns a channel by local number.
    pub fn get(&self, num: ChanNum) -> Result<Arc<Channel>> {
        self.ch
            .lock()
            .get(num.0 as usize)
            .and_then(|c| c.clone())
            .context(error::BadChannel { num })
    }

    /// Number of live channels
    pub fn count(&self) -> usize {
        self.ch.lock().iter().flatten().count()
    }

    /// Removes a closed channel, freeing its number.
    pub(crate) fn unregister(&self, ch: &Channel) {
        let mut chans = self.ch.lock();
        if let Some(slot) = chans.get_mut(ch.num().0 as usize) {
            if slot.as_ref().is_some_and(|c| core::ptr::eq(Arc::as_ptr(c), ch)) {
                trace!("removing ch {}", ch.num());
                *slot = None;
            }
        }
    }

    /// Closes every channel immediately, for when the transport has gone.
    pub fn close_all(&self) {
        let all: Vec<_> = self.ch.lock().iter().flatten().cloned().collect();
        for ch in all {
            ch.close(true);
        }
    }

    /// Decodes and dispatches a channel packet payload.
    pub fn dispatch_packet(&self, payload: &[u8]) -> Result<()> {
        let p = sshwire::packet_from_bytes(payload)?;
        self.dispatch(p)
    }

    /// Incoming packet handling.
    ///
    /// Packets for unknown or already closed channels are logged and
    /// ignored. Other errors are returned, the channel concerned has
    /// already been closed for protocol errors.
    pub fn dispatch(&self, packet: Packet<'_>) -> Result<()> {
        let num = packet.channel_num();
        let r = self.dispatch_inner(packet);

        match r {
            Err(Error::BadChannel { num }) => {
                warn!("Ignoring packet for bad channel number {num}");
                Ok(())
            }
            Err(Error::ChannelClosed) => {
                debug!("Ignoring packet for closed channel {num}");
                Ok(())
            }
            r => r,
        }
    }

    fn dispatch_inner(&self, packet: Packet<'_>) -> Result<()> {
        match packet {
            Packet::ChannelOpen(p) => self.dispatch_open(&p),
            Packet::ChannelOpenConfirmation(p) => self
                .get(ChanNum(p.num))?
                .handle_open_success(p.sender_num, p.initial_window, p.max_packet),
            Packet::ChannelOpenFailure(p) => {
                let desc = p.desc.to_string_lossy();
                self.get(ChanNum(p.num))?.handle_open_failure(p.reason, &desc)
            }
            Packet::ChannelWindowAdjust(p) => {
                self.get(ChanNum(p.num))?.handle_window_adjust(p.adjust)
            }
            Packet::ChannelData(p) => self.get(ChanNum(p.num))?.handle_data(p.data.0),
            Packet::ChannelDataExt(p) => {
                self.get(ChanNum(p.num))?.handle_extended_data(p.code, p.data.0)
            }
            Packet::ChannelEof(p) => self.get(ChanNum(p.num))?.handle_eof(),
            Packet::ChannelClose(p) => self.get(ChanNum(p.num))?.handle_close(),
            Packet::ChannelRequest(p) => self.get(ChanNum(p.num))?.handle_request(&p),
            Packet::ChannelSuccess(p) => self.get(ChanNum(p.num))?.handle_success(),
            Packet::ChannelFailure(p) => self.get(ChanNum(p.num))?.handle_failure(),
        }
    }

    fn dispatch_open(&self, p: &ChannelOpen<'_>) -> Result<()> {
        match self.dispatch_open_inner(p) {
            Ok(()) => Ok(()),
            Err(DispatchOpenError::Failure(f)) => {
                debug!("Refusing channel open from {}: {}", p.num, f.description());
                self.send_open_failure(p.num, f);
                Ok(())
            }
            Err(DispatchOpenError::Error(e)) => {
                self.send_open_failure(p.num, ChanFail::SSH_OPEN_CONNECT_FAILED);
                Err(e)
            }
        }
    }

    // the caller will send failure messages if required
    fn dispatch_open_inner(&self, p: &ChannelOpen<'_>) -> Result<(), DispatchOpenError> {
        let name = match p.ty.name() {
            Ok(n) => n,
            Err(u) => {
                debug!("Rejecting unknown channel type '{u}'");
                return Err(ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE.into());
            }
        };

        let opener = self.opener.lock().clone();
        let Some(opener) = opener else {
            return Err(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED.into());
        };

        let ch = self.reserve()?;
        // beware that a reserved channel must be cleaned up on failure
        if let Err(e) = ch.accept_open(name, p.num, p.initial_window, p.max_packet) {
            ch.close(true);
            return Err(e.into());
        }

        if let Err(f) = opener.open(&ch, &p.ty) {
            ch.close(true);
            return Err(f.into());
        }

        ch.confirm_open()?;
        Ok(())
    }

    fn send_open_failure(&self, num: u32, f: ChanFail) {
        let p = packets::ChannelOpenFailure {
            // ChannelOpen.num is the sender's number
            num,
            reason: f as u32,
            desc: f.description().into(),
            lang: "",
        };
        let mut b = self
            .session
            .create_buffer(MessageNumber::SSH_MSG_CHANNEL_OPEN_FAILURE, 16);
        match b.put(&p) {
            Ok(()) => {
                self.session.write_packet(b);
            }
            Err(e) => warn!("Couldn't encode open failure: {e}"),
        }
    }
}

// for dispatch_open_inner()
enum DispatchOpenError {
    Error(Error),
    Failure(ChanFail),
}

impl From<Error> for DispatchOpenError {
    fn from(e: Error) -> Self {
        match e {
            Error::NoChannels => Self::Failure(ChanFail::SSH_OPEN_RESOURCE_SHORTAGE),
            e => Self::Error(e),
        }
    }
}

impl From<ChanFail> for DispatchOpenError {
    fn from(f: ChanFail) -> Self {
        Self::Failure(f)
    }
}
