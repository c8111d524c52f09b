//! Test support: a recording [`Session`] and connection fixtures.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::config::ChanConfig;
use crate::conn::Channels;
use crate::future::WriteFuture;
use crate::packets::{ChannelOpenType, Packet};
use crate::session::{PacketBuf, Session};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WriteMode {
    /// Writes complete before `write_packet()` returns
    Immediate,
    /// Writes complete on `complete_all()`
    Deferred,
    /// Writes fail
    Fail,
}

/// Records every packet written.
pub(crate) struct TestSession {
    mode: Mutex<WriteMode>,
    sent: Mutex<Vec<PacketBuf>>,
    deferred: Mutex<Vec<WriteFuture>>,
}

impl TestSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(WriteMode::Immediate),
            sent: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: WriteMode) {
        *self.mode.lock() = mode;
    }

    /// Packets written so far
    pub fn packets(&self) -> Vec<PacketBuf> {
        self.sent.lock().clone()
    }

    pub fn take_packets(&self) -> Vec<PacketBuf> {
        core::mem::take(&mut *self.sent.lock())
    }

    /// Completes deferred writes successfully
    pub fn complete_all(&self) {
        let d = core::mem::take(&mut *self.deferred.lock());
        for f in d {
            f.set_value(());
        }
    }

    /// Lengths of the channel data frames written, including stderr.
    pub fn data_frames(&self) -> Vec<usize> {
        self.sent
            .lock()
            .iter()
            .filter_map(|b| match b.packet() {
                Ok(Packet::ChannelData(d)) => Some(d.data.0.len()),
                Ok(Packet::ChannelDataExt(d)) => Some(d.data.0.len()),
                _ => None,
            })
            .collect()
    }

    /// The concatenated payload of written data frames
    pub fn data_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        for b in self.sent.lock().iter() {
            if let Ok(Packet::ChannelData(d)) = b.packet() {
                v.extend_from_slice(d.data.0)
            }
        }
        v
    }
}

impl Session for TestSession {
    fn write_packet(&self, buf: PacketBuf) -> WriteFuture {
        self.sent.lock().push(buf);
        let mode = *self.mode.lock();
        match mode {
            WriteMode::Immediate => WriteFuture::completed(()),
            WriteMode::Fail => WriteFuture::failed(Error::msg("test write failure")),
            WriteMode::Deferred => {
                let f = WriteFuture::new();
                self.deferred.lock().push(f.clone());
                f
            }
        }
    }
}

/// A connection over a [`TestSession`]
pub(crate) struct TestConn {
    pub sess: Arc<TestSession>,
    pub chans: Arc<Channels>,
    pub config: ChanConfig,
}

impl TestConn {
    pub fn new() -> Self {
        Self::with_config(ChanConfig::default())
    }

    pub fn with_config(config: ChanConfig) -> Self {
        let sess = TestSession::new();
        let chans = Channels::new(sess.clone(), config.clone());
        Self { sess, chans, config }
    }

    /// Opens a session channel, confirmed by the peer as number 9 with the
    /// given send window and packet size.
    pub fn open_channel(&self, window: u32, max_packet: u32) -> Arc<Channel> {
        let (ch, opened) = self.chans.open(ChannelOpenType::Session).unwrap();
        ch.handle_open_success(9, window, max_packet).unwrap();
        assert!(opened.is_done());
        ch
    }
}

/// Carries packets between two connections.
///
/// Packets queue until `pump()`, so tests choose when the peer sees them.
pub(crate) struct Loopback {
    queue: Mutex<Vec<PacketBuf>>,
    peer: Mutex<Option<std::sync::Weak<Channels>>>,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { queue: Mutex::new(Vec::new()), peer: Mutex::new(None) })
    }

    /// Delivers queued packets to the peer, including any written while
    /// delivering. Returns the number delivered.
    pub fn pump(&self) -> usize {
        let mut n = 0;
        loop {
            let q = core::mem::take(&mut *self.queue.lock());
            if q.is_empty() {
                return n;
            }
            let peer = self.peer.lock().as_ref().and_then(|p| p.upgrade());
            let Some(peer) = peer else {
                return n;
            };
            for b in q {
                peer.dispatch_packet(b.payload()).unwrap();
                n += 1;
            }
        }
    }
}

impl Session for Loopback {
    fn write_packet(&self, buf: PacketBuf) -> WriteFuture {
        self.queue.lock().push(buf);
        WriteFuture::completed(())
    }
}

/// Two connected connections, `a` and `b`.
pub(crate) fn connected_pair(
    config: ChanConfig,
) -> (Arc<Channels>, Arc<Loopback>, Arc<Channels>, Arc<Loopback>) {
    let la = Loopback::new();
    let lb = Loopback::new();
    let a = Channels::new(la.clone(), config.clone());
    let b = Channels::new(lb.clone(), config);
    *la.peer.lock() = Some(Arc::downgrade(&b));
    *lb.peer.lock() = Some(Arc::downgrade(&a));
    (a, la, b, lb)
}

#[cfg(test)]
mod tests {
    use crate::channel::*;
    use crate::conn::ChannelOpener;
    use crate::error::Error;
    use crate::sshnames::ChanFail;
    use crate::sunsetlog::init_test_log;
    use crate::test::*;
    use crate::chanin::ChanInput;
    use crate::chanout::ChanOutput;

    use core::time::Duration;
    use std::io::{Read, Write};

    struct Echo;

    impl ChannelOpener for Echo {
        fn open(&self, ch: &Arc<Channel>, _ty: &ChannelOpenType<'_>) -> Result<(), ChanFail> {
            ch.add_session_handlers();
            Ok(())
        }
    }

    #[test]
    fn two_ends() {
        init_test_log();
        let (a, la, b, lb) = connected_pair(ChanConfig::default());
        b.set_opener(Arc::new(Echo));

        let (ca, opened) = a.open(ChannelOpenType::Session).unwrap();
        la.pump();
        lb.pump();
        opened.wait(Duration::ZERO).unwrap();
        let cb = b.get(ChanNum(ca.recipient().unwrap())).unwrap();
        assert_eq!(cb.recipient(), Some(ca.num().0));

        let mut input = ChanInput::new(&cb, ChanData::Normal).unwrap();
        let mut out = ChanOutput::new(ca.clone(), ChanData::Normal);
        out.write_all(b"hello over a channel").unwrap();
        out.flush().unwrap();
        la.pump();

        let mut buf = [0u8; 100];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello over a channel");

        let env = ca.env("LANG", "C.UTF-8").unwrap();
        la.pump();
        lb.pump();
        assert!(env.wait(Duration::ZERO).unwrap());

        out.close().unwrap();
        la.pump();
        assert_eq!(input.read(&mut buf).unwrap(), 0);

        cb.exit_status(0).unwrap();
        lb.pump();
        assert_eq!(ca.exit(), Some(crate::request::ChanExit::Status(0)));

        ca.close(false);
        assert_eq!(ca.state(), ChanState::CloseSent);
        la.pump();
        assert_eq!(cb.state(), ChanState::Closed);
        lb.pump();
        assert_eq!(ca.state(), ChanState::Closed);
        assert_eq!(a.count(), 0);
        assert_eq!(b.count(), 0);

        // after close
        assert!(out.write(b"x").is_err());
        assert!(matches!(ca.send_eof(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn window_replenished_by_reading() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.window = 4000;
        config.max_packet = 1000;
        let (a, la, b, lb) = connected_pair(config);
        b.set_opener(Arc::new(Echo));
        let (ca, _) = a.open(ChannelOpenType::Session).unwrap();
        la.pump();
        lb.pump();
        let cb = b.get(ChanNum(0)).unwrap();
        let mut input = ChanInput::new(&cb, ChanData::Normal).unwrap();
        let mut out = ChanOutput::new(ca.clone(), ChanData::Normal);
        out.set_timeout(Duration::from_millis(50));

        out.write_all(&[7u8; 4000]).unwrap();
        out.flush().unwrap();
        assert_eq!(ca.remote_window().size(), 0);
        la.pump();

        // no credit until b reads
        out.write_all(&[8u8; 10]).unwrap();
        assert!(matches!(out.flush(), Err(e) if e.kind() == std::io::ErrorKind::TimedOut));

        let mut buf = vec![0u8; 2500];
        input.read_exact(&mut buf).unwrap();
        // below half, b sent an adjustment
        lb.pump();
        assert_eq!(ca.remote_window().size(), 2500);
        out.flush().unwrap();
        la.pump();

        let mut rest = vec![0u8; 1510];
        input.read_exact(&mut rest).unwrap();
        assert!(rest[..1500].iter().all(|&x| x == 7));
        assert!(rest[1500..].iter().all(|&x| x == 8));
    }
}
