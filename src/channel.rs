//! A single multiplexed channel, RFC4254 section 5.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::any::{Any, TypeId};
use core::fmt;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::ChanConfig;
use crate::conn::Channels;
use crate::future::{SshFuture, WriteFuture};
use crate::packets::{self, ChannelData, ChannelDataExt, ChannelOpenType, Packet};
use crate::request::{self, ReqResult, RequestHandler};
use crate::session::{trace_packet, Session};
use crate::sshnames::*;
use crate::sshwire::{self, BinString, SSHEncode};
use crate::window::{Window, WindowKind};

/// A SSH protocol channel number
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ChanNum(pub u32);

impl fmt::Display for ChanNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel data packet type.
///
/// The SSH specification allows other `u32` types, only stderr is
/// accepted.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum ChanData {
    /// `SSH_MSG_CHANNEL_DATA`
    Normal,
    /// `SSH_MSG_CHANNEL_EXTENDED_DATA`
    Stderr,
}

/// Lifecycle of a channel.
///
/// Progresses forward only. `Opening` is before an open confirmation has
/// been received for a locally initiated channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanState {
    Opening,
    Opened,
    /// We have sent `SSH_MSG_CHANNEL_CLOSE`
    CloseSent,
    /// The peer sent `SSH_MSG_CHANNEL_CLOSE` first
    CloseReceived,
    Closed,
}

/// Receives incoming channel data.
///
/// Installed per [`ChanData`] direction with [`Channel::set_sink()`].
/// Called from the transport delivery path without channel locks held.
pub trait DataSink: Send + Sync {
    /// Incoming data. Returning [`Error::SSHProtoError`] (for example the
    /// peer overran the window) closes the channel.
    fn data(&self, ch: &Channel, data: &[u8]) -> Result<()>;

    fn eof(&self, _ch: &Channel) {}

    fn closed(&self, _ch: &Channel) {}
}

/// Observes channel events. Listeners run in registration order.
pub trait ChannelListener: Send + Sync {
    fn opened(&self, _ch: &Channel) {}

    fn open_failed(&self, _ch: &Channel, _err: &Error) {}

    fn eof_received(&self, _ch: &Channel) {}

    /// The peer granted more send window.
    fn window_expanded(&self, _ch: &Channel) {}

    fn closed(&self, _ch: &Channel) {}
}

struct PendingReq {
    name: String,
    sent: Instant,
    fut: SshFuture<bool>,
}

struct ChanInner {
    state: ChanState,
    /// Channel type name, set once opening starts
    ty: Option<String>,
    /// The peer's number for this channel, set on open confirmation
    recipient: Option<u32>,
    sent_eof: bool,
    recv_eof: bool,
    dup_eof: u32,

    // requests sent with want_reply, replies arrive in order
    pending_reqs: VecDeque<PendingReq>,

    handlers: Vec<Arc<dyn RequestHandler>>,
    fallback: Option<Arc<dyn RequestHandler>>,

    attributes: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    listeners: Vec<Arc<dyn ChannelListener>>,

    data_sink: Option<Arc<dyn DataSink>>,
    ext_sink: Option<Arc<dyn DataSink>>,
    /// Delivered to either sink but not yet read. Still holds local
    /// window credit.
    unread: usize,
}

/// A channel, shared between the connection and any stream adapters.
pub struct Channel {
    num: ChanNum,
    config: ChanConfig,
    session: Arc<dyn Session>,
    owner: Weak<Channels>,
    me: Weak<Channel>,

    local: Window,
    remote: Window,

    inner: Mutex<ChanInner>,

    opened: SshFuture<()>,
    closed: SshFuture<()>,
}

impl Channel {
    pub(crate) fn new(
        num: ChanNum,
        config: ChanConfig,
        session: Arc<dyn Session>,
        owner: Weak<Channels>,
    ) -> Arc<Self> {
        let div = config.adjust_divisor;
        Arc::new_cyclic(|me| Channel {
            num,
            config,
            session,
            owner,
            me: me.clone(),
            local: Window::new(WindowKind::Local, num, div),
            remote: Window::new(WindowKind::Remote, num, div),
            inner: Mutex::new(ChanInner {
                state: ChanState::Opening,
                ty: None,
                recipient: None,
                sent_eof: false,
                recv_eof: false,
                dup_eof: 0,
                pending_reqs: VecDeque::new(),
                handlers: request::default_handlers(),
                fallback: None,
                attributes: HashMap::new(),
                listeners: Vec::new(),
                data_sink: None,
                ext_sink: None,
                unread: 0,
            }),
            opened: SshFuture::new(),
            closed: SshFuture::new(),
        })
    }

    /// Local channel number
    pub fn num(&self) -> ChanNum {
        self.num
    }

    /// The peer's channel number, once open.
    ///
    /// Returned as a plain `u32` since it is a different namespace than `ChanNum`.
    pub fn recipient(&self) -> Option<u32> {
        self.inner.lock().recipient
    }

    pub fn state(&self) -> ChanState {
        self.inner.lock().state
    }

    pub fn channel_type(&self) -> Option<String> {
        self.inner.lock().ty.clone()
    }

    /// Credit granted to the peer
    pub fn local_window(&self) -> &Window {
        &self.local
    }

    /// Credit the peer has granted us
    pub fn remote_window(&self) -> &Window {
        &self.remote
    }

    pub fn config(&self) -> &ChanConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChanState::Opened
    }

    /// Returns `true` once either side has started closing.
    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ChanState::CloseSent | ChanState::CloseReceived | ChanState::Closed
        )
    }

    pub fn eof_sent(&self) -> bool {
        self.inner.lock().sent_eof
    }

    pub fn eof_received(&self) -> bool {
        self.inner.lock().recv_eof
    }

    /// Number of redundant EOFs the peer has sent
    pub fn duplicate_eofs(&self) -> u32 {
        self.inner.lock().dup_eof
    }

    /// Completes when the channel is open, or fails if opening fails.
    pub fn opened_future(&self) -> SshFuture<()> {
        self.opened.clone()
    }

    /// Completes once the channel reaches [`ChanState::Closed`].
    pub fn closed_future(&self) -> SshFuture<()> {
        self.closed.clone()
    }

    /// Encodes and writes a packet.
    ///
    /// A failed write closes the channel immediately.
    pub(crate) fn send(&self, p: Packet<'_>) -> WriteFuture {
        let hint = sshwire::length_enc(&p).unwrap_or(1).saturating_sub(1);
        let mut buf = self.session.create_buffer(p.message_num(), hint as usize);
        if let Err(e) = p.enc_body(&mut buf) {
            return WriteFuture::failed(e.into());
        }
        trace_packet("send", &buf);
        let fut = self.session.write_packet(buf);
        let w = self.me.clone();
        fut.on_complete(move |r| {
            if let Err(e) = r {
                if let Some(ch) = w.upgrade() {
                    warn!("ch {} write failed: {e}", ch.num);
                    ch.finish();
                }
            }
        });
        fut
    }

    fn listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.inner.lock().listeners.clone()
    }

    /// Logs a peer protocol violation and closes the channel immediately.
    fn protocol_fault(&self, msg: &str) -> Error {
        warn!("ch {} protocol error: {msg}", self.num);
        self.finish();
        Error::SSHProtoError
    }

    /// Starts opening a locally initiated channel.
    pub(crate) fn open(&self, ty: ChannelOpenType<'_>) -> Result<SshFuture<()>> {
        let name = ty.name().map_err(|_| Error::usage("can't open unknown channel type"))?;
        {
            let mut inner = self.inner.lock();
            if inner.ty.is_some() {
                return Err(Error::usage("channel already opened"));
            }
            inner.ty = Some(name.into());
        }
        self.local.init(self.config.window, self.config.max_packet, self.config.packet_ceiling)?;
        debug!("ch {} opening {name}", self.num);
        self.send(
            packets::ChannelOpen {
                num: self.num.0,
                initial_window: self.config.window,
                max_packet: self.config.max_packet,
                ty,
            }
            .into(),
        );
        Ok(self.opened.clone())
    }

    /// Sets up an incoming channel from the peer's open request.
    ///
    /// The confirmation is sent separately with `confirm_open()`.
    pub(crate) fn accept_open(
        &self,
        ty: &str,
        sender_num: u32,
        initial_window: u32,
        max_packet: u32,
    ) -> Result<()> {
        self.remote.init(initial_window, max_packet, self.config.packet_ceiling)?;
        self.local.init(self.config.window, self.config.max_packet, self.config.packet_ceiling)?;
        let mut inner = self.inner.lock();
        inner.ty = Some(ty.into());
        inner.recipient = Some(sender_num);
        inner.state = ChanState::Opened;
        Ok(())
    }

    pub(crate) fn confirm_open(&self) -> Result<WriteFuture> {
        let num = self.recipient().trap()?;
        let f = self.send(
            packets::ChannelOpenConfirmation {
                num,
                sender_num: self.num.0,
                initial_window: self.local.max_size(),
                max_packet: self.local.packet_size(),
            }
            .into(),
        );
        debug!("ch {} opened, recipient {num}", self.num);
        self.opened.set_value(());
        for l in self.listeners() {
            l.opened(self);
        }
        Ok(f)
    }

    /// The peer confirmed our open request.
    pub fn handle_open_success(
        &self,
        sender_num: u32,
        initial_window: u32,
        max_packet: u32,
    ) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.state != ChanState::Opening || inner.ty.is_none() {
                debug!("ch {} unexpected open confirmation in {:?}", self.num, inner.state);
                return Err(Error::SSHProtoError);
            }
        }

        if let Err(e) =
            self.remote.init(initial_window, max_packet, self.config.packet_ceiling)
        {
            self.opened.set_error(e.clone());
            self.finish();
            return Err(e);
        }

        {
            let mut inner = self.inner.lock();
            inner.recipient = Some(sender_num);
            inner.state = ChanState::Opened;
        }
        debug!("ch {} opened, recipient {sender_num}", self.num);
        self.opened.set_value(());
        for l in self.listeners() {
            l.opened(self);
        }
        Ok(())
    }

    /// The peer refused our open request.
    pub fn handle_open_failure(&self, reason: u32, desc: &str) -> Result<()> {
        if self.state() != ChanState::Opening {
            debug!("ch {} unexpected open failure", self.num);
            return Err(Error::SSHProtoError);
        }
        let e = Error::OpenFailed { reason, desc: desc.into() };
        debug!("ch {} {e}", self.num);
        self.opened.set_error(e.clone());
        for l in self.listeners() {
            l.open_failed(self, &e);
        }
        self.finish();
        Ok(())
    }

    pub fn handle_data(&self, data: &[u8]) -> Result<()> {
        self.deliver(ChanData::Normal, data)
    }

    /// Extended data. Only stderr is accepted, other types are answered
    /// with a channel failure.
    pub fn handle_extended_data(&self, code: u32, data: &[u8]) -> Result<()> {
        if code == SSH_EXTENDED_DATA_STDERR {
            return self.deliver(ChanData::Stderr, data);
        }

        debug!("ch {} ignoring extended data type {code}", self.num);
        if self.check_incoming(data.len())? {
            return Err(self.protocol_fault("data after EOF"));
        }
        // discarded data still used window credit
        let r = {
            let inner = self.inner.lock();
            let limit = self.local.size() as usize;
            if inner.unread + data.len() > limit {
                debug!(
                    "ch {} has {} unread, {} more exceeds window {limit}",
                    self.num,
                    inner.unread,
                    data.len()
                );
                None
            } else {
                Some(self.local.consume_and_check(data.len() as u32))
            }
        };
        let Some(r) = r else {
            return Err(self.protocol_fault("peer exceeded window"));
        };
        self.window_checked(r)?;
        self.reply(false)?;
        Ok(())
    }

    fn check_incoming(&self, len: usize) -> Result<bool> {
        let (state, recv_eof) = {
            let inner = self.inner.lock();
            (inner.state, inner.recv_eof)
        };
        match state {
            ChanState::Closed => return Err(Error::ChannelClosed),
            ChanState::Opening => return Err(self.protocol_fault("data before open")),
            _ => (),
        }

        let limit = self.local.packet_size() as usize + 4;
        if len > limit {
            debug!("ch {} data length {len} exceeds {limit}", self.num);
            return Err(self.protocol_fault("oversized data packet"));
        }
        Ok(recv_eof)
    }

    fn deliver(&self, dt: ChanData, data: &[u8]) -> Result<()> {
        if self.check_incoming(data.len())? {
            return Err(self.protocol_fault("data after EOF"));
        }

        let sink = {
            let mut inner = self.inner.lock();
            let sink = match dt {
                ChanData::Normal => inner.data_sink.clone(),
                ChanData::Stderr => inner.ext_sink.clone(),
            };
            let Some(sink) = sink else {
                debug!("ch {} no {dt:?} sink for {} bytes", self.num, data.len());
                return Err(Error::usage("no data sink installed"));
            };
            // stdout and stderr share the local window
            let limit = self.local.size() as usize;
            if inner.unread + data.len() > limit {
                debug!(
                    "ch {} has {} unread, {} more exceeds window {limit}",
                    self.num,
                    inner.unread,
                    data.len()
                );
                None
            } else {
                inner.unread += data.len();
                Some(sink)
            }
        };
        let Some(sink) = sink else {
            return Err(self.protocol_fault("peer exceeded window"));
        };

        match sink.data(self, data) {
            Err(Error::SSHProtoError) => Err(self.protocol_fault("bad channel data")),
            r => r,
        }
    }

    /// Consumes local window credit for data the application has read,
    /// sending a window adjustment when the window runs low.
    pub fn consume_and_check(&self, n: u32) -> Result<()> {
        let r = {
            let mut inner = self.inner.lock();
            inner.unread = inner.unread.saturating_sub(n as usize);
            self.local.consume_and_check(n)
        };
        self.window_checked(r)
    }

    fn window_checked(&self, r: Result<Option<u32>>) -> Result<()> {
        match r {
            Ok(Some(adjust)) => {
                let num = {
                    let inner = self.inner.lock();
                    if inner.state != ChanState::Opened {
                        // no point granting credit while closing
                        return Ok(());
                    }
                    inner.recipient.trap()?
                };
                self.send(packets::ChannelWindowAdjust { num, adjust }.into());
                Ok(())
            }
            Ok(None) => Ok(()),
            // credit is moot once closed
            Err(Error::WindowClosed) => Ok(()),
            Err(Error::SSHProtoError) => Err(self.protocol_fault("peer exceeded window")),
            Err(e) => Err(e),
        }
    }

    pub fn handle_window_adjust(&self, adjust: u32) -> Result<()> {
        match self.state() {
            ChanState::Closed => return Err(Error::ChannelClosed),
            ChanState::Opening => return Err(self.protocol_fault("adjust before open")),
            _ => (),
        }
        self.remote.expand(adjust)?;
        for l in self.listeners() {
            l.window_expanded(self);
        }
        Ok(())
    }

    pub fn handle_eof(&self) -> Result<()> {
        let sinks = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            match state {
                ChanState::Closed => return Err(Error::ChannelClosed),
                ChanState::Opening => {
                    drop(inner);
                    return Err(self.protocol_fault("EOF before open"));
                }
                _ => (),
            }
            if inner.recv_eof {
                inner.dup_eof += 1;
                debug!("ch {} duplicate EOF ({})", self.num, inner.dup_eof);
                return Ok(());
            }
            inner.recv_eof = true;
            [inner.data_sink.clone(), inner.ext_sink.clone()]
        };
        trace!("ch {} EOF received", self.num);
        for s in sinks.iter().flatten() {
            s.eof(self);
        }
        for l in self.listeners() {
            l.eof_received(self);
        }
        Ok(())
    }

    pub fn handle_close(&self) -> Result<()> {
        let prev = {
            let mut inner = self.inner.lock();
            let prev = inner.state;
            if prev == ChanState::Opened {
                inner.state = ChanState::CloseReceived;
            }
            prev
        };

        match prev {
            ChanState::Opened => {
                debug!("ch {} peer closed", self.num);
                self.send_close_reply();
                self.start_close_timer();
            }
            ChanState::CloseSent => {
                debug!("ch {} close handshake complete", self.num);
                self.finish();
            }
            ChanState::Opening => return Err(self.protocol_fault("close before open")),
            ChanState::CloseReceived | ChanState::Closed => {
                debug!("ch {} duplicate close", self.num);
            }
        }
        Ok(())
    }

    // Our CLOSE in response to the peer's. The channel is done once it
    // has been written, successfully or not.
    fn send_close_reply(&self) {
        let Some(num) = self.recipient() else {
            self.finish();
            return;
        };
        let f = self.send(packets::ChannelClose { num }.into());
        let w = self.me.clone();
        f.on_complete(move |_| {
            if let Some(ch) = w.upgrade() {
                ch.finish();
            }
        });
    }

    /// Closes the channel.
    ///
    /// A graceful close sends `SSH_MSG_CHANNEL_CLOSE` and waits for the
    /// peer's, at most `close_timeout`. An `immediate` close skips the
    /// handshake. Returns the channel's closed future.
    pub fn close(&self, immediate: bool) -> SshFuture<()> {
        if immediate {
            self.finish();
            return self.closed.clone();
        }

        let (prev, num) = {
            let mut inner = self.inner.lock();
            let prev = inner.state;
            if prev == ChanState::Opened {
                inner.state = ChanState::CloseSent;
            }
            (prev, inner.recipient)
        };

        match (prev, num) {
            (ChanState::Opened, Some(num)) => {
                debug!("ch {} closing", self.num);
                self.send(packets::ChannelClose { num }.into());
                self.start_close_timer();
            }
            (ChanState::Opening, _) | (ChanState::Opened, None) => {
                // nothing to hand shake with
                self.finish();
            }
            _ => trace!("ch {} already closing", self.num),
        }
        self.closed.clone()
    }

    fn start_close_timer(&self) {
        let w = self.me.clone();
        let closed = self.closed.clone();
        let timeout = self.config.close_timeout;
        let num = self.num;
        let r = thread::Builder::new().name(format!("ch{num}-close")).spawn(move || {
            if let Err(Error::Timeout) = closed.wait(timeout) {
                if let Some(ch) = w.upgrade() {
                    warn!("ch {num} no close from peer after {timeout:?}, forcing");
                    ch.finish();
                }
            }
        });
        if let Err(e) = r {
            warn!("ch {num} couldn't start close timer: {e}");
        }
    }

    /// Terminal cleanup. Runs once.
    fn finish(&self) {
        let (pending, sinks, listeners) = {
            let mut inner = self.inner.lock();
            if inner.state == ChanState::Closed {
                return;
            }
            inner.state = ChanState::Closed;
            let mut pending = Vec::new();
            while let Some(p) = inner.pending_reqs.pop_front() {
                pending.push(p);
            }
            inner.handlers.clear();
            inner.fallback = None;
            let sinks = [inner.data_sink.take(), inner.ext_sink.take()];
            (pending, sinks, core::mem::take(&mut inner.listeners))
        };
        debug!("ch {} closed", self.num);

        self.local.close();
        self.remote.close();
        for p in pending {
            trace!("ch {} request {} abandoned", self.num, p.name);
            p.fut.set_error(Error::ChannelClosed);
        }
        for s in sinks.iter().flatten() {
            s.closed(self);
        }
        for l in listeners {
            l.closed(self);
        }
        self.opened.set_error(Error::ChannelClosed);
        if let Some(owner) = self.owner.upgrade() {
            owner.unregister(self);
        }
        self.closed.set_value(());
    }

    /// Sends `SSH_MSG_CHANNEL_EOF`. Later calls are no-ops.
    pub fn send_eof(&self) -> Result<WriteFuture> {
        let num = {
            let mut inner = self.inner.lock();
            if inner.state != ChanState::Opened {
                return Err(Error::ChannelClosed);
            }
            if inner.sent_eof {
                debug!("ch {} EOF already sent", self.num);
                return Ok(WriteFuture::completed(()));
            }
            inner.sent_eof = true;
            inner.recipient.trap()?
        };
        trace!("ch {} sending EOF", self.num);
        Ok(self.send(packets::ChannelEof { num }.into()))
    }

    /// Frames and writes one data packet.
    ///
    /// The caller must already have consumed remote window credit for
    /// `data`, and it must fit the remote packet size.
    pub fn write_data(&self, dt: ChanData, data: &[u8]) -> Result<WriteFuture> {
        let num = {
            let inner = self.inner.lock();
            if inner.state != ChanState::Opened {
                return Err(Error::ChannelClosed);
            }
            if inner.sent_eof {
                return Err(Error::ChannelEOF);
            }
            inner.recipient.trap()?
        };
        if data.len() > self.remote.packet_size() as usize {
            return Err(Error::BigPacket { size: data.len() });
        }

        let data = BinString(data);
        let p = match dt {
            ChanData::Normal => ChannelData { num, data }.into(),
            ChanData::Stderr => {
                ChannelDataExt { num, code: SSH_EXTENDED_DATA_STDERR, data }.into()
            }
        };
        Ok(self.send(p))
    }

    /// Sends a channel request with an encoded body.
    ///
    /// With `want_reply` the returned future completes with the peer's
    /// success or failure. Otherwise it completes `true` once written.
    pub fn send_request<T: SSHEncode>(
        &self,
        name: &str,
        want_reply: bool,
        body: &T,
    ) -> Result<SshFuture<bool>> {
        let mut data = Vec::new();
        sshwire::write_vec(&mut data, body)?;
        self.send_request_raw(name, want_reply, &data)
    }

    /// Like [`send_request()`](Self::send_request) with a pre-encoded body.
    ///
    /// Only one request of a given name may await a reply at a time.
    pub fn send_request_raw(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> Result<SshFuture<bool>> {
        let fut = SshFuture::new();
        let num = {
            let mut inner = self.inner.lock();
            if inner.state != ChanState::Opened {
                return Err(Error::ChannelClosed);
            }
            let num = inner.recipient.trap()?;
            if want_reply {
                if inner.pending_reqs.iter().any(|p| p.name == name) {
                    return Err(Error::usage("request already pending"));
                }
                let p = PendingReq { name: name.into(), sent: Instant::now(), fut: fut.clone() };
                inner.pending_reqs.push_back(p);
            }
            num
        };

        trace!("ch {} request {name}, want_reply {want_reply}", self.num);
        let w = self.send(packets::ChannelRequest { num, req: name, want_reply, data }.into());
        if !want_reply {
            let f = fut.clone();
            w.on_complete(move |r| {
                let _ = match r {
                    Ok(()) => f.set_value(true),
                    Err(e) => f.set_error(e.clone()),
                };
            });
        }
        Ok(fut)
    }

    /// Sends `SSH_MSG_CHANNEL_SUCCESS` or `SSH_MSG_CHANNEL_FAILURE`.
    ///
    /// For handlers that return [`ReqResult::Replied`].
    pub fn reply(&self, success: bool) -> Result<WriteFuture> {
        let num = {
            let inner = self.inner.lock();
            match inner.state {
                ChanState::Closed => return Err(Error::ChannelClosed),
                ChanState::Opening => return Err(Error::usage("channel not open")),
                _ => (),
            }
            inner.recipient.trap()?
        };
        let p = if success {
            packets::ChannelSuccess { num }.into()
        } else {
            packets::ChannelFailure { num }.into()
        };
        Ok(self.send(p))
    }

    /// An incoming channel request, run through the handler chain.
    pub fn handle_request(&self, req: &packets::ChannelRequest<'_>) -> Result<()> {
        let (handlers, fallback) = {
            let inner = self.inner.lock();
            let state = inner.state;
            match state {
                ChanState::Closed => return Err(Error::ChannelClosed),
                ChanState::Opening => {
                    drop(inner);
                    return Err(self.protocol_fault("request before open"));
                }
                _ => (),
            }
            (inner.handlers.clone(), inner.fallback.clone())
        };

        let mut res = ReqResult::Unsupported;
        for h in handlers.iter().chain(fallback.iter()) {
            match h.handle(self, req) {
                Ok(ReqResult::Unsupported) => continue,
                Ok(r) => {
                    res = r;
                    break;
                }
                Err(e) => {
                    debug!("ch {} error handling {req:?}: {e}", self.num);
                    res = ReqResult::Failure;
                    break;
                }
            }
        }
        trace!("ch {} request {} -> {res:?}", self.num, req.req);

        match res {
            ReqResult::Replied => (),
            ReqResult::Success => {
                if req.want_reply {
                    self.reply(true)?;
                }
            }
            ReqResult::Failure | ReqResult::Unsupported => {
                if res == ReqResult::Unsupported {
                    debug!("ch {} unhandled request \"{}\"", self.num, req.req);
                }
                if req.want_reply {
                    self.reply(false)?;
                }
            }
        }
        Ok(())
    }

    pub fn handle_success(&self) -> Result<()> {
        self.resolve_request(true)
    }

    pub fn handle_failure(&self) -> Result<()> {
        self.resolve_request(false)
    }

    fn resolve_request(&self, ok: bool) -> Result<()> {
        let p = {
            let mut inner = self.inner.lock();
            if inner.state == ChanState::Closed {
                return Err(Error::ChannelClosed);
            }
            inner.pending_reqs.pop_front()
        };
        match p {
            Some(p) => {
                debug!(
                    "ch {} request {} {} after {:?}",
                    self.num,
                    p.name,
                    if ok { "succeeded" } else { "failed" },
                    p.sent.elapsed()
                );
                p.fut.set_value(ok);
            }
            None => warn!("ch {} reply with no outstanding request", self.num),
        }
        Ok(())
    }

    /// Installs the receiver for incoming data of type `dt`.
    pub fn set_sink(&self, dt: ChanData, sink: Arc<dyn DataSink>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ChanState::Closed {
            return Err(Error::ChannelClosed);
        }
        let slot = match dt {
            ChanData::Normal => &mut inner.data_sink,
            ChanData::Stderr => &mut inner.ext_sink,
        };
        if slot.is_some() {
            return Err(Error::usage("data sink already installed"));
        }
        *slot = Some(sink);
        Ok(())
    }

    pub fn clear_sink(&self, dt: ChanData) {
        let mut inner = self.inner.lock();
        match dt {
            ChanData::Normal => inner.data_sink = None,
            ChanData::Stderr => inner.ext_sink = None,
        }
    }

    /// Registers a listener. A listener added after close is told immediately.
    pub fn add_listener(&self, l: Arc<dyn ChannelListener>) {
        let mut inner = self.inner.lock();
        if inner.state == ChanState::Closed {
            drop(inner);
            l.closed(self);
        } else {
            inner.listeners.push(l);
        }
    }

    pub fn remove_listener(&self, l: &Arc<dyn ChannelListener>) {
        let target = Arc::as_ptr(l) as *const ();
        self.inner.lock().listeners.retain(|x| Arc::as_ptr(x) as *const () != target);
    }

    /// Appends a request handler, consulted after those already present.
    pub fn add_request_handler(&self, h: Arc<dyn RequestHandler>) {
        self.inner.lock().handlers.push(h);
    }

    /// Runs for requests no handler claims.
    pub fn set_request_fallback(&self, h: Arc<dyn RequestHandler>) {
        self.inner.lock().fallback = Some(h);
    }

    /// Stores a channel scoped value, one per type. Returns the previous value.
    pub fn set_attribute<T: Any + Send + Sync + Clone>(&self, v: T) -> Option<T> {
        self.inner
            .lock()
            .attributes
            .insert(TypeId::of::<T>(), Box::new(v))
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn attribute<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.inner
            .lock()
            .attributes
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
            .cloned()
    }

    pub fn remove_attribute<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.inner
            .lock()
            .attributes
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("num", &self.num).finish_non_exhaustive()
    }
}
