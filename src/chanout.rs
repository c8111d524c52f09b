//! Blocking buffered output to a channel.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::time::Duration;

use std::sync::Arc;

use crate::channel::{ChanData, Channel};

/// A blocking writer for channel data or stderr.
///
/// Writes are gathered into a buffer no larger than the peer's packet
/// size, and sent once it fills or runs ahead of the available window.
/// Waits for window credit are bounded by the channel's
/// `wait_timeout`, a timeout can be retried. Any other error leaves the
/// writer closed.
pub struct ChanOutput {
    ch: Arc<Channel>,
    dt: ChanData,
    buf: Vec<u8>,
    // size of the most recent frame
    last_size: usize,
    no_delay: bool,
    send_eof: bool,
    closed: bool,
    timeout: Duration,
}

impl ChanOutput {
    pub fn new(ch: Arc<Channel>, dt: ChanData) -> Self {
        let timeout = ch.config().wait_timeout;
        Self {
            ch,
            dt,
            buf: Vec::new(),
            last_size: 0,
            no_delay: false,
            send_eof: dt == ChanData::Normal,
            closed: false,
            timeout,
        }
    }

    /// Flush after every write.
    pub fn set_no_delay(&mut self, no_delay: bool) {
        self.no_delay = no_delay;
    }

    /// Whether [`close()`](Self::close) sends EOF. Defaults on for
    /// normal data.
    pub fn set_send_eof(&mut self, send_eof: bool) {
        self.send_eof = send_eof;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.ch
    }

    /// Bytes waiting to be sent
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn check_open(&mut self) -> Result<()> {
        if !self.closed && self.ch.is_closing() {
            trace!("ch {} output closing", self.ch.num());
            self.closed = true;
        }
        if self.closed {
            Err(Error::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn track<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            if e.is_terminal() && !self.closed {
                debug!("ch {} output failed: {e}", self.ch.num());
                self.closed = true;
            }
        }
        r
    }

    fn write_buf(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        let total = data.len();
        let mut data = data;

        while !data.is_empty() {
            let (credit, packet) = {
                let remote = self.ch.remote_window();
                (remote.size() as usize, remote.packet_size() as usize)
            };
            let room = (credit + self.last_size).min(packet).saturating_sub(self.buf.len());

            if room == 0 {
                let r = if self.buf.is_empty() {
                    let r = self.ch.remote_window().wait_for_space(self.timeout);
                    self.track(r).map(|_| ())
                } else {
                    self.flush_buf()
                };
                if let Err(e) = r {
                    let done = total - data.len();
                    if done > 0 && !e.is_terminal() {
                        // short write, the rest can be retried
                        return Ok(done);
                    }
                    return Err(e);
                }
                continue;
            }

            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
        }

        if self.no_delay {
            self.flush_buf()?;
        }
        Ok(total)
    }

    /// Sends everything buffered, in frames no larger than the peer's
    /// packet size.
    fn flush_buf(&mut self) -> Result<()> {
        while !self.buf.is_empty() {
            self.check_open()?;
            let ch = self.ch.clone();
            let remote = ch.remote_window();

            let avail = self.track(remote.wait_for_space(self.timeout))?;
            let len = (avail as usize).min(self.buf.len()).min(remote.packet_size() as usize);
            self.track(remote.wait_and_consume(len as u32, self.timeout))?;

            let f = self.track(ch.write_data(self.dt, &self.buf[..len]))?;
            self.buf.drain(..len);
            self.last_size = len;
            trace!("ch {} sent {len}, {} buffered", ch.num(), self.buf.len());
            self.track(f.wait(self.timeout))?;
        }
        Ok(())
    }

    /// Flushes then sends EOF if configured. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let r = self.flush_buf();
        self.closed = true;
        r?;
        if self.send_eof && self.ch.is_open() {
            self.ch.send_eof()?;
        }
        Ok(())
    }
}

impl std::io::Write for ChanOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.write_buf(buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.check_open()?;
        Ok(self.flush_buf()?)
    }
}

#[cfg(feature = "embedded-io")]
impl embedded_io::ErrorType for ChanOutput {
    type Error = Error;
}

#[cfg(feature = "embedded-io")]
impl embedded_io::Write for ChanOutput {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_buf(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.flush_buf()
    }
}

#[cfg(test)]
mod tests {
    use crate::chanin::ChanInput;
    use crate::chanout::*;
    use crate::config::ChanConfig;
    use crate::packets::{ChannelWindowAdjust, Packet};
    use crate::sunsetlog::init_test_log;
    use crate::test::*;

    use std::io::{ErrorKind, Read, Write};
    use std::thread;

    fn wait_frames(sess: &TestSession, n: usize) {
        for _ in 0..1000 {
            if sess.data_frames().len() >= n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no frames");
    }

    #[test]
    fn blocks_until_adjust() {
        init_test_log();
        let t = TestConn::new();
        let ch = t.open_channel(32768, 16384);
        let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);
        out.set_timeout(Duration::from_secs(20));

        let data: Vec<u8> = (0..50000u32).map(|i| i as u8).collect();
        let d2 = data.clone();
        let w = thread::spawn(move || {
            out.write_all(&d2).unwrap();
            out
        });

        wait_frames(&t.sess, 2);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(t.sess.data_frames(), [16384, 16384]);
        assert!(!w.is_finished());
        assert_eq!(ch.remote_window().size(), 0);

        ch.handle_window_adjust(40000).unwrap();
        let mut out = w.join().unwrap();
        out.flush().unwrap();

        assert_eq!(t.sess.data_frames(), [16384, 16384, 16384, 848]);
        assert_eq!(t.sess.data_bytes(), data);
        assert_eq!(ch.remote_window().size(), 40000 - 16384 - 848);
    }

    /// Window credit we have granted the peer so far
    fn granted(sess: &TestSession) -> u32 {
        sess.packets()
            .iter()
            .filter_map(|b| match b.packet() {
                Ok(Packet::ChannelWindowAdjust(ChannelWindowAdjust { adjust, .. })) => {
                    Some(adjust)
                }
                _ => None,
            })
            .sum()
    }

    #[test]
    fn writes_race_inbound_delivery() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.window = 2000;
        config.max_packet = 500;
        let t = TestConn::with_config(config);
        let ch = t.open_channel(1000, 300);

        let mut input = ChanInput::new(&ch, ChanData::Normal).unwrap();
        input.set_timeout(Duration::from_secs(20));
        let r = thread::spawn(move || {
            let mut v = Vec::new();
            input.read_to_end(&mut v).unwrap();
            v
        });

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);
        out.set_timeout(Duration::from_secs(20));
        let d2 = data.clone();
        let w = thread::spawn(move || {
            out.write_all(&d2).unwrap();
            out.close().unwrap();
        });

        // act as the peer, granting send credit and sending within ours
        let mut peer_sent = 0u32;
        let mut k = 0u8;
        while !w.is_finished() || peer_sent < 20_000 {
            if ch.remote_window().size() < 300 {
                ch.handle_window_adjust(1000).unwrap();
            }
            let credit = 2000 + granted(&t.sess) - peer_sent;
            if peer_sent < 20_000 && credit >= 100 {
                ch.handle_data(&[k; 100]).unwrap();
                peer_sent += 100;
                k += 1;
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        w.join().unwrap();
        ch.handle_eof().unwrap();

        let expect: Vec<u8> = (0..200u32).flat_map(|k| [k as u8; 100]).collect();
        assert_eq!(r.join().unwrap(), expect);
        assert!(t.sess.data_frames().iter().all(|&f| f > 0 && f <= 300));
        assert_eq!(t.sess.data_bytes(), data);
        assert!(ch.eof_sent());
        assert!(ch.is_open());
    }

    #[test]
    fn frames_fit_packet_size() {
        init_test_log();
        let t = TestConn::new();
        let ch = t.open_channel(1_000_000, 700);
        let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);

        let mut all = Vec::new();
        for i in 1..60usize {
            let chunk: Vec<u8> = (0..i * 37).map(|j| (i + j) as u8).collect();
            out.write_all(&chunk).unwrap();
            all.extend_from_slice(&chunk);
        }
        out.close().unwrap();

        let frames = t.sess.data_frames();
        assert!(frames.iter().all(|&f| f > 0 && f <= 700));
        assert_eq!(t.sess.data_bytes(), all);
        // close sent EOF
        assert!(ch.eof_sent());
        assert!(out.write(b"more").is_err());
    }

    #[test]
    fn no_delay_sends_each_write() {
        init_test_log();
        let t = TestConn::new();
        let ch = t.open_channel(100000, 1000);
        let mut out = ChanOutput::new(ch, ChanData::Normal);
        out.set_no_delay(true);
        out.write_all(b"ab").unwrap();
        out.write_all(b"cde").unwrap();
        assert_eq!(t.sess.data_frames(), [2, 3]);
        assert_eq!(out.buffered(), 0);
    }

    #[test]
    fn stderr_frames() {
        init_test_log();
        let t = TestConn::new();
        let ch = t.open_channel(100000, 1000);
        let mut out = ChanOutput::new(ch.clone(), ChanData::Stderr);
        out.write_all(b"oops").unwrap();
        out.close().unwrap();
        let sent = t.sess.packets();
        assert!(sent.iter().any(|b| matches!(
            b.packet().unwrap(),
            crate::packets::Packet::ChannelDataExt(d) if d.code == 1 && d.data.0 == b"oops"
        )));
        // stderr doesn't send EOF by default
        assert!(!ch.eof_sent());
    }

    #[test]
    fn timeout_is_retryable() {
        init_test_log();
        let t = TestConn::new();
        let ch = t.open_channel(0, 1000);
        let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);
        out.set_timeout(Duration::from_millis(20));

        let e = out.write(b"zzz").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TimedOut);

        ch.handle_window_adjust(10).unwrap();
        out.write_all(b"zzz").unwrap();
        out.flush().unwrap();
        assert_eq!(t.sess.data_bytes(), b"zzz");
    }

    #[test]
    fn window_close_ends_writer() {
        init_test_log();
        let t = TestConn::new();
        let ch = t.open_channel(10, 1000);
        let mut out = ChanOutput::new(ch.clone(), ChanData::Normal);
        out.set_timeout(Duration::from_secs(20));

        let w = thread::spawn(move || {
            let r = out.write_all(&[1u8; 50]).and_then(|_| out.flush());
            (r, out)
        });
        wait_frames(&t.sess, 1);
        ch.close(true);
        let (r, mut out) = w.join().unwrap();
        assert_eq!(r.unwrap_err().kind(), ErrorKind::BrokenPipe);
        // stays closed
        assert!(out.write(b"x").is_err());
        assert!(out.flush().is_err());
    }
}
