//! Flow control credit for one direction of a channel.
//!
//! RFC4254 section 5.2. The local window is credit we have granted the
//! peer, the remote window is credit the peer has granted us.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use core::time::Duration;

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::channel::ChanNum;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowKind {
    /// Credit for data we receive
    Local,
    /// Credit for data we send
    Remote,
}

#[derive(Debug, Default)]
struct WinState {
    size: u32,
    max_size: u32,
    packet_size: u32,
    initialized: bool,
    closed: bool,
}

impl WinState {
    fn check_usable(&self) -> Result<()> {
        if !self.initialized {
            return Err(Error::usage("window not initialized"));
        }
        if self.closed {
            return Err(Error::WindowClosed);
        }
        Ok(())
    }
}

/// A flow control window.
///
/// All accounting happens under the window's own lock. Waiters are
/// released by [`expand()`](Self::expand) or [`close()`](Self::close).
pub struct Window {
    kind: WindowKind,
    num: ChanNum,
    adjust_divisor: u32,
    state: Mutex<WinState>,
    cond: Condvar,
}

impl Window {
    pub fn new(kind: WindowKind, num: ChanNum, adjust_divisor: u32) -> Self {
        Self {
            kind,
            num,
            adjust_divisor: adjust_divisor.max(1),
            state: Mutex::new(WinState::default()),
            cond: Condvar::new(),
        }
    }

    /// One-time setup.
    ///
    /// `packet_size` must be non-zero and no larger than `ceiling`.
    pub fn init(&self, size: u32, packet_size: u32, ceiling: u32) -> Result<()> {
        let mut st = self.state.lock();
        if st.initialized {
            return Err(Error::usage("window already initialized"));
        }
        if packet_size == 0 || packet_size > ceiling {
            debug!(
                "{self:?} bad packet size {packet_size}, ceiling {ceiling}"
            );
            return Err(Error::SSHProtoError);
        }
        st.size = size;
        st.max_size = size;
        st.packet_size = packet_size;
        st.initialized = true;
        trace!("{self:?} init size {size} packet {packet_size}");
        Ok(())
    }

    /// Adds credit, saturating at `u32::MAX`. Wakes all waiters.
    pub fn expand(&self, n: u32) -> Result<()> {
        let mut st = self.state.lock();
        st.check_usable()?;
        st.size = st.size.saturating_add(n);
        trace!("{self:?} expand {n} -> {}", st.size);
        drop(st);
        self.cond.notify_all();
        Ok(())
    }

    /// Removes credit. Fails without modifying the window if `n`
    /// exceeds the available size.
    pub fn consume(&self, n: u32) -> Result<()> {
        let mut st = self.state.lock();
        st.check_usable()?;
        Self::consume_locked(&mut st, n)?;
        trace!("{self:?} consume {n} -> {}", st.size);
        Ok(())
    }

    /// Consumes as much as is available, at most `max`. Doesn't wait.
    pub fn consume_up_to(&self, max: u32) -> Result<u32> {
        let mut st = self.state.lock();
        st.check_usable()?;
        let n = st.size.min(max);
        st.size -= n;
        if n > 0 {
            trace!("{self:?} consume {n} -> {}", st.size);
        }
        Ok(n)
    }

    fn consume_locked(st: &mut WinState, n: u32) -> Result<()> {
        match st.size.checked_sub(n) {
            Some(s) => {
                st.size = s;
                Ok(())
            }
            None => {
                debug!("consume {n} exceeds window {}", st.size);
                Err(Error::SSHProtoError)
            }
        }
    }

    /// Consumes `n` then tops the window back up to its maximum if it
    /// has dropped below `max / adjust_divisor`.
    ///
    /// Returns the adjustment to advertise to the peer. The window has
    /// already been credited with it.
    pub fn consume_and_check(&self, n: u32) -> Result<Option<u32>> {
        let mut st = self.state.lock();
        st.check_usable()?;
        Self::consume_locked(&mut st, n)?;
        let threshold = st.max_size / self.adjust_divisor;
        if st.size < threshold {
            let adjust = st.max_size - st.size;
            st.size = st.max_size;
            trace!("{self:?} consumed {n}, adjust {adjust}");
            drop(st);
            self.cond.notify_all();
            Ok(Some(adjust))
        } else {
            Ok(None)
        }
    }

    /// Waits until some credit is available, returning the size.
    ///
    /// Fails with [`Error::WindowClosed`] if the window closes, or
    /// [`Error::Timeout`] once `timeout` elapses.
    pub fn wait_for_space(&self, timeout: Duration) -> Result<u32> {
        let mut st = self.state.lock();
        self.wait_locked(&mut st, 1, timeout)?;
        Ok(st.size)
    }

    /// Waits until `n` bytes of credit are available then consumes them.
    pub fn wait_and_consume(&self, n: u32, timeout: Duration) -> Result<()> {
        let mut st = self.state.lock();
        self.wait_locked(&mut st, n, timeout)?;
        Self::consume_locked(&mut st, n)?;
        trace!("{self:?} wait consume {n} -> {}", st.size);
        Ok(())
    }

    fn wait_locked(
        &self,
        st: &mut parking_lot::MutexGuard<'_, WinState>,
        want: u32,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            st.check_usable()?;
            if st.size >= want {
                return Ok(());
            }
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(st, d).timed_out() {
                        st.check_usable()?;
                        if st.size >= want {
                            return Ok(());
                        }
                        trace!("{self:?} timed out waiting for {want}");
                        return Err(Error::Timeout);
                    }
                }
                None => self.cond.wait(st),
            }
        }
    }

    /// Marks the window closed, waking all waiters. Idempotent.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if !st.closed {
            st.closed = true;
            trace!("{self:?} closed");
        }
        drop(st);
        self.cond.notify_all();
    }

    pub fn size(&self) -> u32 {
        self.state.lock().size
    }

    pub fn max_size(&self) -> u32 {
        self.state.lock().max_size
    }

    pub fn packet_size(&self) -> u32 {
        self.state.lock().packet_size
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }
}

// Doesn't take the lock, may be used while it is held.
impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = match self.kind {
            WindowKind::Local => "local",
            WindowKind::Remote => "remote",
        };
        write!(f, "Window({k} ch {})", self.num)
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::ChanNum;
    use crate::error::Error;
    use crate::sunsetlog::init_test_log;
    use crate::window::*;

    use std::sync::Arc;
    use std::thread;

    fn win(size: u32, packet: u32) -> Window {
        let w = Window::new(WindowKind::Remote, ChanNum(0), 2);
        w.init(size, packet, 256 * 1024).unwrap();
        w
    }

    #[test]
    fn uninitialized_is_usage_error() {
        init_test_log();
        let w = Window::new(WindowKind::Local, ChanNum(1), 2);
        assert!(matches!(w.expand(1), Err(Error::BadUsage { .. })));
        assert!(matches!(w.consume(1), Err(Error::BadUsage { .. })));
        assert!(matches!(
            w.wait_for_space(Duration::ZERO),
            Err(Error::BadUsage { .. })
        ));
    }

    #[test]
    fn init_checks_packet_size() {
        init_test_log();
        let w = Window::new(WindowKind::Remote, ChanNum(1), 2);
        assert!(matches!(w.init(1000, 0, 100), Err(Error::SSHProtoError)));
        assert!(matches!(w.init(1000, 101, 100), Err(Error::SSHProtoError)));
        w.init(1000, 100, 100).unwrap();
        assert!(matches!(w.init(1000, 100, 100), Err(Error::BadUsage { .. })));
        assert_eq!(w.size(), 1000);
        assert_eq!(w.max_size(), 1000);
    }

    #[test]
    fn consume_up_to_partial() {
        init_test_log();
        let w = win(100, 50);
        assert_eq!(w.consume_up_to(30).unwrap(), 30);
        assert_eq!(w.consume_up_to(500).unwrap(), 70);
        assert_eq!(w.consume_up_to(10).unwrap(), 0);
        w.close();
        assert!(matches!(w.consume_up_to(10), Err(Error::WindowClosed)));
    }

    #[test]
    fn bounds_hold() {
        init_test_log();
        let w = win(10, 10);
        w.expand(u32::MAX).unwrap();
        assert_eq!(w.size(), u32::MAX);
        w.expand(5).unwrap();
        assert_eq!(w.size(), u32::MAX);

        w.consume(u32::MAX).unwrap();
        assert_eq!(w.size(), 0);
        w.expand(7).unwrap();
        // too large fails, no change
        assert!(w.consume(8).is_err());
        assert_eq!(w.size(), 7);
        w.consume(7).unwrap();
        assert_eq!(w.size(), 0);
    }

    #[test]
    fn consume_and_check_tops_up() {
        init_test_log();
        let w = win(1000, 100);
        assert_eq!(w.consume_and_check(400).unwrap(), None);
        assert_eq!(w.size(), 600);
        // exactly half is not below
        assert_eq!(w.consume_and_check(100).unwrap(), None);
        assert_eq!(w.consume_and_check(1).unwrap(), Some(501));
        assert_eq!(w.size(), 1000);
    }

    #[test]
    fn divisor_is_tunable() {
        init_test_log();
        let w = Window::new(WindowKind::Local, ChanNum(0), 4);
        w.init(1000, 100, 1000).unwrap();
        assert_eq!(w.consume_and_check(700).unwrap(), None);
        assert_eq!(w.consume_and_check(60).unwrap(), Some(760));
    }

    #[test]
    fn wait_times_out() {
        init_test_log();
        let w = win(0, 10);
        let r = w.wait_for_space(Duration::from_millis(20));
        assert!(matches!(r, Err(Error::Timeout)));
        // still usable afterwards
        w.expand(3).unwrap();
        assert_eq!(w.wait_for_space(Duration::ZERO).unwrap(), 3);
    }

    #[test]
    fn close_releases_waiters() {
        init_test_log();
        let w = Arc::new(win(0, 10));
        let w2 = w.clone();
        let t = thread::spawn(move || w2.wait_for_space(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        w.close();
        w.close();
        let r = t.join().unwrap();
        assert!(matches!(r, Err(Error::WindowClosed)));

        // later waits fail immediately
        let r = w.wait_and_consume(1, Duration::from_secs(30));
        assert!(matches!(r, Err(Error::WindowClosed)));
    }

    #[test]
    fn wait_and_consume_needs_full_amount() {
        init_test_log();
        let w = Arc::new(win(5, 10));
        let w2 = w.clone();
        let t = thread::spawn(move || w2.wait_and_consume(8, Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        // not yet enough
        w.expand(2).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!t.is_finished());
        w.expand(2).unwrap();
        t.join().unwrap().unwrap();
        assert_eq!(w.size(), 1);
    }
}
