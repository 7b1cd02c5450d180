//! Local duplex channel: Unix domain sockets on POSIX, named pipes on Windows.
//!
//! Both platforms expose the same surface: a [`LocalListener`] that accepts one
//! [`LocalStream`] at a time, and a [`CancelToken`] that can unblock a thread parked in a
//! blocking read or connect from another thread.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::protocol;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;
#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as platform;

pub use platform::LocalListener;

const CANCEL_RETRY_INTERVAL: Duration = Duration::from_millis(20);
const CANCEL_MAX_ATTEMPTS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel endpoint is not available yet")]
    EndpointUnavailable,
    #[error("peer disconnected")]
    Disconnected,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("timed out after {0:?} waiting for the backend to become ready")]
    ReadinessTimeout(Duration),
    #[error("channel operation aborted")]
    Aborted,
    #[error("channel i/o failed: {0}")]
    Io(#[source] io::Error),
}

impl ChannelError {
    pub fn from_io(error: io::Error) -> Self {
        if platform::is_aborted(&error) {
            return Self::Aborted;
        }
        if protocol::is_disconnect(&error) {
            return Self::Disconnected;
        }
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                Self::EndpointUnavailable
            }
            _ => Self::Io(error),
        }
    }

    /// Transient failures that the handshake client recovers from by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EndpointUnavailable | Self::Disconnected | Self::Malformed(_)
        )
    }
}

/// Address of a local endpoint: a socket path on POSIX, a pipe name on Windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    address: PathBuf,
}

impl ChannelEndpoint {
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }
}

impl fmt::Display for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address.display())
    }
}

/// One established connection. Owned by a single thread; reads and writes are never
/// shared across threads.
pub struct LocalStream {
    inner: platform::StreamInner,
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream").finish_non_exhaustive()
    }
}

impl LocalStream {
    pub fn connect(endpoint: &ChannelEndpoint) -> Result<Self, ChannelError> {
        platform::connect(endpoint).map(|inner| Self { inner })
    }

    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<(), ChannelError> {
        protocol::write_message(&mut self.inner, message)
    }

    pub fn recv<M: DeserializeOwned>(&mut self) -> Result<M, ChannelError> {
        protocol::read_message(&mut self.inner)
    }
}

/// Unblocks a listener parked in `accept` by connecting to it once.
#[derive(Debug, Clone)]
pub struct ListenerWaker {
    endpoint: ChannelEndpoint,
}

impl ListenerWaker {
    pub fn new(endpoint: ChannelEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn wake(&self) {
        let _ = LocalStream::connect(&self.endpoint);
    }
}

struct CancelInner {
    cancelled: AtomicBool,
    parked: Mutex<()>,
    wake: Condvar,
    active: Mutex<Option<platform::IoInterrupt>>,
}

/// Cross-thread cancellation for blocking channel I/O.
///
/// A reader attaches its stream before blocking on it; `cancel` then interrupts the
/// in-flight call (socket shutdown on POSIX, `CancelSynchronousIo` on Windows) and keeps
/// doing so until the reader detaches.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                parked: Mutex::new(()),
                wake: Condvar::new(),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `stream` as the in-flight I/O of the calling thread until the guard drops.
    pub fn attach(&self, stream: &LocalStream) -> Result<AttachGuard<'_>, ChannelError> {
        let interrupt = platform::IoInterrupt::for_current_io(&stream.inner)
            .map_err(ChannelError::Io)?;
        let mut active = lock_recover(&self.inner.active);
        // Checked under the lock so a concurrent cancel either sees the attachment or
        // has already set the flag.
        if self.is_cancelled() {
            return Err(ChannelError::Aborted);
        }
        *active = Some(interrupt);
        Ok(AttachGuard { token: self })
    }

    /// Sleeps for `timeout` unless cancelled first. Returns false when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock_recover(&self.inner.parked);
        if self.is_cancelled() {
            return false;
        }
        let result = self
            .inner
            .wake
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled());
        drop(result);
        !self.is_cancelled()
    }

    pub fn cancel(&self) {
        {
            let _parked = lock_recover(&self.inner.parked);
            self.inner.cancelled.store(true, Ordering::SeqCst);
            self.inner.wake.notify_all();
        }

        for _ in 0..CANCEL_MAX_ATTEMPTS {
            {
                let active = lock_recover(&self.inner.active);
                match active.as_ref() {
                    Some(interrupt) => interrupt.interrupt(),
                    None => return,
                }
            }
            thread::sleep(CANCEL_RETRY_INTERVAL);
        }
    }
}

pub struct AttachGuard<'a> {
    token: &'a CancelToken,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        *lock_recover(&self.token.inner.active) = None;
    }
}
