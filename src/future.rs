//! One-shot completions shared between the protocol side and callers.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use std::sync::Arc;
use std::time::Instant;

use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct State<T> {
    result: Option<Result<T>>,
    callbacks: Vec<Callback<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    waker: AtomicWaker,
}

/// A result that becomes available once.
///
/// Clones share the same completion. The first of
/// [`set_value()`](Self::set_value) or [`set_error()`](Self::set_error)
/// wins, later attempts are ignored. Callers may block with
/// [`wait()`](Self::wait), `.await` it, or register
/// [`on_complete()`](Self::on_complete) callbacks. Callbacks run on the
/// completing thread, outside of any internal lock.
pub struct SshFuture<T> {
    inner: Arc<Inner<T>>,
}

/// Completion of a packet write.
pub type WriteFuture = SshFuture<()>;

impl<T> Clone for SshFuture<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + 'static> Default for SshFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> SshFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State { result: None, callbacks: Vec::new() }),
                cond: Condvar::new(),
                waker: AtomicWaker::new(),
            }),
        }
    }

    /// An already successful future
    pub fn completed(v: T) -> Self {
        let f = Self::new();
        f.set_value(v);
        f
    }

    /// An already failed future
    pub fn failed(e: Error) -> Self {
        let f = Self::new();
        f.set_error(e);
        f
    }

    /// Returns `false` if the future was already complete.
    pub fn set_value(&self, v: T) -> bool {
        self.complete(Ok(v))
    }

    /// Returns `false` if the future was already complete.
    pub fn set_error(&self, e: Error) -> bool {
        self.complete(Err(e))
    }

    pub fn complete(&self, r: Result<T>) -> bool {
        let callbacks = {
            let mut st = self.inner.state.lock();
            if st.result.is_some() {
                return false;
            }
            st.result = Some(r.clone());
            core::mem::take(&mut st.callbacks)
        };
        self.inner.cond.notify_all();
        self.inner.waker.wake();
        for cb in callbacks {
            cb(&r);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// The outcome, if complete.
    pub fn result(&self) -> Option<Result<T>> {
        self.inner.state.lock().result.clone()
    }

    /// Blocks until complete or `timeout` elapses.
    ///
    /// Returns [`Error::Timeout`] if the future is still pending, it can
    /// be waited on again.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.inner.state.lock();
        loop {
            if let Some(r) = st.result.as_ref() {
                return r.clone();
            }
            match deadline {
                Some(d) => {
                    if self.inner.cond.wait_until(&mut st, d).timed_out() {
                        return st.result.clone().unwrap_or(Err(Error::Timeout));
                    }
                }
                // unrepresentable deadline, treat as forever
                None => self.inner.cond.wait(&mut st),
            }
        }
    }

    /// Runs `f` once complete. Runs immediately if already complete.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let done = {
            let mut st = self.inner.state.lock();
            match st.result.as_ref() {
                Some(r) => r.clone(),
                None => {
                    st.callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        f(&done)
    }
}

impl<T: Clone + Send + 'static> Future for SshFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(r) = self.result() {
            return Poll::Ready(r);
        }
        self.inner.waker.register(cx.waker());
        // completion may have raced the registration
        match self.result() {
            Some(r) => Poll::Ready(r),
            None => Poll::Pending,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SshFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("SshFuture").field("result", &st.result).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::future::*;
    use crate::sunsetlog::init_test_log;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn first_completion_wins() {
        init_test_log();
        let f = SshFuture::new();
        assert!(f.set_value(3u32));
        assert!(!f.set_value(4));
        assert!(!f.set_error(Error::ChannelClosed));
        assert_eq!(f.wait(Duration::ZERO).unwrap(), 3);
    }

    #[test]
    fn wait_times_out_then_completes() {
        init_test_log();
        let f = SshFuture::<u32>::new();
        let r = f.wait(Duration::from_millis(10));
        assert!(matches!(r, Err(Error::Timeout)));
        assert!(!f.is_done());

        let f2 = f.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            f2.set_value(9);
        });
        assert_eq!(f.wait(Duration::from_secs(10)).unwrap(), 9);
        t.join().unwrap();
    }

    #[test]
    fn callbacks_run_once() {
        init_test_log();
        let count = Arc::new(AtomicUsize::new(0));
        let f = WriteFuture::new();

        let c = count.clone();
        f.on_complete(move |r| {
            assert!(r.is_err());
            c.fetch_add(1, Ordering::SeqCst);
        });
        f.set_error(Error::WindowClosed);
        f.set_value(());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // late registration runs immediately
        let c = count.clone();
        f.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_may_use_future() {
        init_test_log();
        // callbacks run outside the lock, so can query the future
        let f = SshFuture::<u8>::new();
        let f2 = f.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        f.on_complete(move |_| {
            assert!(f2.is_done());
            s.store(1, Ordering::SeqCst);
        });
        f.set_value(1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn await_from_executor() {
        init_test_log();
        let f = SshFuture::<u32>::new();
        let f2 = f.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            f2.set_value(55);
        });
        let r = futures::executor::block_on(f);
        assert_eq!(r.unwrap(), 55);
        t.join().unwrap();
    }
}
