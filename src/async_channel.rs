//! Non-blocking channel adapters.
//!
//! Each adapter allows a single outstanding operation per direction.
//! Operations return an [`SshFuture`] that completes on whichever thread
//! delivers the data, window adjustment or write completion. The futures
//! can be `.await`ed, waited on, or given callbacks.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::{ChanData, ChanNum, Channel, ChannelListener, DataSink};
use crate::future::SshFuture;

struct PendingWrite {
    data: Arc<[u8]>,
    sent: usize,
    fut: SshFuture<usize>,
}

#[derive(Default)]
struct OutState {
    pending: Option<PendingWrite>,
    // a frame has been handed to the session and not yet completed
    in_flight: bool,
    closed: bool,
}

struct OutShared {
    num: ChanNum,
    dt: ChanData,
    ch: Weak<Channel>,
    me: Weak<OutShared>,
    st: Mutex<OutState>,
}

impl OutShared {
    /// Sends frames of the pending write while credit lasts, one frame in
    /// flight at a time.
    fn pump(&self) {
        loop {
            let Some(ch) = self.ch.upgrade() else {
                self.fail(Error::ChannelClosed);
                return;
            };

            let (data, off, len) = {
                let mut st = self.st.lock();
                if st.in_flight {
                    return;
                }
                let Some(p) = st.pending.as_ref() else {
                    return;
                };
                let remote = ch.remote_window();
                let want = (p.data.len() - p.sent).min(remote.packet_size() as usize);
                let n = match remote.consume_up_to(want as u32) {
                    // resumed by window_expanded()
                    Ok(0) => return,
                    Ok(n) => n as usize,
                    Err(e) => {
                        drop(st);
                        self.fail(e);
                        return;
                    }
                };
                let r = (p.data.clone(), p.sent, n);
                st.in_flight = true;
                r
            };

            let f = match ch.write_data(self.dt, &data[off..off + len]) {
                Ok(f) => f,
                Err(e) => {
                    self.st.lock().in_flight = false;
                    self.fail(e);
                    return;
                }
            };

            match f.result() {
                Some(r) => {
                    if !self.frame_done(len, r) {
                        return;
                    }
                }
                None => {
                    let Some(me) = self.me.upgrade() else {
                        return;
                    };
                    f.on_complete(move |r| {
                        if me.frame_done(len, r.clone()) {
                            me.pump()
                        }
                    });
                    return;
                }
            }
        }
    }

    /// Returns whether more of the pending write remains to send.
    fn frame_done(&self, len: usize, r: Result<()>) -> bool {
        let mut st = self.st.lock();
        st.in_flight = false;
        let closed = st.closed;
        let more = match (&r, st.pending.as_mut()) {
            // abandoned by close()
            (_, None) => return false,
            (Ok(()), Some(p)) => {
                p.sent += len;
                trace!("ch {} async sent {}/{}", self.num, p.sent, p.data.len());
                p.sent < p.data.len()
            }
            (Err(_), Some(_)) => false,
        };
        if more && !closed {
            return true;
        }

        let p = st.pending.take();
        drop(st);
        if let Some(p) = p {
            match r {
                Ok(()) if more => p.fut.set_error(Error::ChannelClosed),
                Ok(()) => p.fut.set_value(p.data.len()),
                Err(e) => {
                    debug!("ch {} async write failed: {e}", self.num);
                    p.fut.set_error(e)
                }
            };
        }
        false
    }

    fn fail(&self, e: Error) {
        let p = self.st.lock().pending.take();
        if let Some(p) = p {
            debug!("ch {} async write failed: {e}", self.num);
            p.fut.set_error(e);
        }
    }
}

impl ChannelListener for OutShared {
    fn window_expanded(&self, _ch: &Channel) {
        self.pump()
    }

    fn closed(&self, _ch: &Channel) {
        let p = {
            let mut st = self.st.lock();
            st.closed = true;
            // an in-flight frame reports its own outcome
            if st.in_flight {
                None
            } else {
                st.pending.take()
            }
        };
        if let Some(p) = p {
            p.fut.set_error(Error::ChannelClosed);
        }
    }
}

/// Non-blocking output to a channel.
pub struct AsyncChanOutput {
    ch: Arc<Channel>,
    shared: Arc<OutShared>,
}

impl AsyncChanOutput {
    pub fn new(ch: &Arc<Channel>, dt: ChanData) -> Self {
        let shared = Arc::new_cyclic(|me| OutShared {
            num: ch.num(),
            dt,
            ch: Arc::downgrade(ch),
            me: me.clone(),
            st: Mutex::new(OutState::default()),
        });
        ch.add_listener(shared.clone());
        Self { ch: ch.clone(), shared }
    }

    /// Starts writing `data`.
    ///
    /// The returned future completes with the full length once every
    /// byte has been written to the session. Fails with
    /// [`Error::BadUsage`] if a write is already pending.
    pub fn write(&self, data: impl Into<Arc<[u8]>>) -> Result<SshFuture<usize>> {
        let data = data.into();
        let fut = SshFuture::new();
        {
            let mut st = self.shared.st.lock();
            if st.closed || self.ch.is_closing() {
                return Err(Error::ChannelClosed);
            }
            if st.pending.is_some() {
                return Err(Error::usage("write already pending"));
            }
            if data.is_empty() {
                return Ok(SshFuture::completed(0));
            }
            st.pending = Some(PendingWrite { data, sent: 0, fut: fut.clone() });
        }
        self.shared.pump();
        Ok(fut)
    }

    /// Whether a write is outstanding
    pub fn is_pending(&self) -> bool {
        self.shared.st.lock().pending.is_some()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.ch
    }

    /// Fails any pending write with [`Error::ChannelClosed`]. The channel
    /// itself stays open.
    pub fn close(&self) {
        self.shared.st.lock().closed = true;
        self.shared.fail(Error::ChannelClosed);
        let l: Arc<dyn ChannelListener> = self.shared.clone();
        self.ch.remove_listener(&l);
    }
}

impl Drop for AsyncChanOutput {
    fn drop(&mut self) {
        self.close()
    }
}

impl fmt::Debug for AsyncChanOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChanOutput")
            .field("num", &self.shared.num)
            .field("dt", &self.shared.dt)
            .finish_non_exhaustive()
    }
}

struct PendingRead {
    max: usize,
    fut: SshFuture<Vec<u8>>,
}

#[derive(Default)]
struct InState {
    buf: VecDeque<u8>,
    pending: Option<PendingRead>,
    eof: bool,
    chan_closed: bool,
    closed: bool,
}

impl InState {
    fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buf.len());
        self.buf.drain(..n).collect()
    }
}

struct InShared {
    num: ChanNum,
    dt: ChanData,
    st: Mutex<InState>,
}

impl DataSink for InShared {
    fn data(&self, ch: &Channel, data: &[u8]) -> Result<()> {
        let (fut, v) = {
            let mut st = self.st.lock();
            st.buf.extend(data);
            let Some(p) = st.pending.take() else {
                return Ok(());
            };
            let v = st.take(p.max);
            (p.fut, v)
        };
        ch.consume_and_check(v.len() as u32)?;
        fut.set_value(v);
        Ok(())
    }

    fn eof(&self, _ch: &Channel) {
        let p = {
            let mut st = self.st.lock();
            st.eof = true;
            // a pending read implies nothing is buffered
            st.pending.take()
        };
        if let Some(p) = p {
            p.fut.set_value(Vec::new());
        }
    }

    fn closed(&self, _ch: &Channel) {
        let (p, eof) = {
            let mut st = self.st.lock();
            st.chan_closed = true;
            (st.pending.take(), st.eof)
        };
        if let Some(p) = p {
            if eof {
                p.fut.set_value(Vec::new());
            } else {
                p.fut.set_error(Error::ChannelClosed);
            }
        }
    }
}

/// Non-blocking input from a channel.
///
/// Incoming data is buffered up to the local window size. Reading
/// hands it to the application and credits the window.
pub struct AsyncChanInput {
    ch: Arc<Channel>,
    shared: Arc<InShared>,
}

impl AsyncChanInput {
    /// Installs the adapter as the channel's `dt` sink.
    pub fn new(ch: &Arc<Channel>, dt: ChanData) -> Result<Self> {
        let shared = Arc::new(InShared {
            num: ch.num(),
            dt,
            st: Mutex::new(InState::default()),
        });
        ch.set_sink(dt, shared.clone())?;
        if ch.eof_received() {
            shared.st.lock().eof = true;
        }
        Ok(Self { ch: ch.clone(), shared })
    }

    /// Reads up to `max` bytes.
    ///
    /// Completes immediately if data is buffered, otherwise once some
    /// arrives. An empty result means EOF. Fails with
    /// [`Error::BadUsage`] if a read is already pending.
    pub fn read(&self, max: usize) -> Result<SshFuture<Vec<u8>>> {
        if max == 0 {
            return Err(Error::usage("zero length read"));
        }
        let v = {
            let mut st = self.shared.st.lock();
            if st.closed {
                return Err(Error::ChannelClosed);
            }
            if st.pending.is_some() {
                return Err(Error::usage("read already pending"));
            }
            if st.buf.is_empty() {
                if st.eof {
                    return Ok(SshFuture::completed(Vec::new()));
                }
                if st.chan_closed {
                    return Err(Error::ChannelClosed);
                }
                let fut = SshFuture::new();
                st.pending = Some(PendingRead { max, fut: fut.clone() });
                return Ok(fut);
            }
            st.take(max)
        };
        self.ch.consume_and_check(v.len() as u32)?;
        Ok(SshFuture::completed(v))
    }

    /// Bytes that can be read immediately
    pub fn available(&self) -> usize {
        self.shared.st.lock().buf.len()
    }

    pub fn is_pending(&self) -> bool {
        self.shared.st.lock().pending.is_some()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.ch
    }

    /// Fails any pending read with [`Error::ChannelClosed`] and detaches
    /// from the channel.
    pub fn close(&self) {
        let p = {
            let mut st = self.shared.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.pending.take()
        };
        if let Some(p) = p {
            p.fut.set_error(Error::ChannelClosed);
        }
        self.ch.clear_sink(self.shared.dt);
        // unread data is dropped, return its credit
        let n = core::mem::take(&mut self.shared.st.lock().buf).len();
        if n > 0 {
            let _ = self.ch.consume_and_check(n as u32);
        }
    }
}

impl Drop for AsyncChanInput {
    fn drop(&mut self) {
        self.close()
    }
}

impl fmt::Debug for AsyncChanInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChanInput")
            .field("num", &self.shared.num)
            .field("dt", &self.shared.dt)
            .finish_non_exhaustive()
    }
}
