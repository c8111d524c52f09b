//! Blocking input from a channel.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::time::Duration;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::channel::{ChanData, Channel, DataSink};

#[derive(Default)]
struct Buffered {
    buf: VecDeque<u8>,
    eof: bool,
    closed: bool,
}

/// The sink half, owned by the channel.
struct InputSink {
    dt: ChanData,
    st: Mutex<Buffered>,
    cond: Condvar,
}

impl DataSink for InputSink {
    fn data(&self, _ch: &Channel, data: &[u8]) -> Result<()> {
        // the channel has already checked the window
        self.st.lock().buf.extend(data);
        self.cond.notify_all();
        Ok(())
    }

    fn eof(&self, _ch: &Channel) {
        self.st.lock().eof = true;
        self.cond.notify_all();
    }

    fn closed(&self, _ch: &Channel) {
        self.st.lock().closed = true;
        self.cond.notify_all();
    }
}

/// A blocking reader for channel data or stderr.
///
/// Reads return buffered bytes as soon as any are available, `Ok(0)`
/// after the peer's EOF, and [`Error::ChannelClosed`] if the channel
/// closes without one. Bytes read are credited back to the local window.
pub struct ChanInput {
    ch: Arc<Channel>,
    sink: Arc<InputSink>,
    timeout: Duration,
}

impl ChanInput {
    /// Installs the reader as the channel's `dt` sink.
    pub fn new(ch: &Arc<Channel>, dt: ChanData) -> Result<Self> {
        let sink = Arc::new(InputSink {
            dt,
            st: Mutex::new(Buffered::default()),
            cond: Condvar::new(),
        });
        ch.set_sink(dt, sink.clone())?;
        // EOF may have arrived before we were installed
        if ch.eof_received() {
            sink.st.lock().eof = true;
        }
        Ok(Self { ch: ch.clone(), sink, timeout: ch.config().wait_timeout })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.ch
    }

    /// Bytes that can be read without blocking
    pub fn available(&self) -> usize {
        self.sink.st.lock().buf.len()
    }

    fn read_buf(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now().checked_add(self.timeout);
        let n = {
            let mut st = self.sink.st.lock();
            loop {
                if !st.buf.is_empty() {
                    break;
                }
                if st.eof {
                    return Ok(0);
                }
                if st.closed {
                    return Err(Error::ChannelClosed);
                }
                let timed_out = match deadline {
                    Some(d) => self.sink.cond.wait_until(&mut st, d).timed_out(),
                    None => {
                        self.sink.cond.wait(&mut st);
                        false
                    }
                };
                if timed_out
                    && st.buf.is_empty()
                    && !st.eof
                    && !st.closed
                {
                    return Err(Error::Timeout);
                }
            }

            let n = out.len().min(st.buf.len());
            for (o, b) in out.iter_mut().zip(st.buf.drain(..n)) {
                *o = b;
            }
            n
        };

        trace!("ch {} read {n}", self.ch.num());
        self.ch.consume_and_check(n as u32)?;
        Ok(n)
    }
}

impl Drop for ChanInput {
    fn drop(&mut self) {
        self.ch.clear_sink(self.sink.dt);
        // unread data is dropped, return its credit
        let n = core::mem::take(&mut self.sink.st.lock().buf).len();
        if n > 0 {
            let _ = self.ch.consume_and_check(n as u32);
        }
    }
}

impl std::io::Read for ChanInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.read_buf(buf)?)
    }
}

#[cfg(feature = "embedded-io")]
impl embedded_io::ErrorType for ChanInput {
    type Error = Error;
}

#[cfg(feature = "embedded-io")]
impl embedded_io::Read for ChanInput {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_buf(buf)
    }
}
