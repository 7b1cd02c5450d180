use std::{
    fmt,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    NotStarted,
    Starting,
    Ready { port: u16, initial_url: String },
    Failed { reason: String },
}

impl BackendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Failed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready { port, initial_url } => write!(f, "ready(port={port}, url={initial_url})"),
            Self::Failed { reason } => write!(f, "failed({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Whether this shell started the backend it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOwnership {
    NotDetermined,
    Owned,
    /// Another party (a system service) hosts the backend. Guests never stop it.
    Guest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessNotice {
    Ready { port: u16, url: String },
    Failed { reason: String },
}

pub type ReadinessListener = Box<dyn FnOnce(ReadinessNotice) + Send + 'static>;

struct LifecycleInner {
    state: BackendState,
    listener: Option<ReadinessListener>,
}

/// Forward-only backend state shared between the supervisor, its workers and the UI.
///
/// The terminal transition happens once. The listener, if any, is invoked exactly once with
/// the terminal outcome and always outside the internal lock.
pub struct BackendLifecycle {
    inner: Mutex<LifecycleInner>,
    changed: Condvar,
}

impl Default for BackendLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackendLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLifecycle")
            .field("state", &self.state())
            .finish()
    }
}

impl BackendLifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: BackendState::NotStarted,
                listener: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> BackendState {
        self.lock().state.clone()
    }

    /// Registers the one-shot readiness listener.
    ///
    /// If the terminal state was already reached, the listener fires immediately on the
    /// calling thread. A second registration replaces a listener that has not fired yet.
    pub fn set_listener(&self, listener: ReadinessListener) {
        let mut inner = self.lock();
        match notice_for(&inner.state) {
            Some(notice) => {
                drop(inner);
                listener(notice);
            }
            None => inner.listener = Some(listener),
        }
    }

    /// `NotStarted -> Starting`. Returns false when the lifecycle already left `NotStarted`.
    pub fn mark_starting(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != BackendState::NotStarted {
            return false;
        }
        inner.state = BackendState::Starting;
        self.changed.notify_all();
        true
    }

    /// `Starting -> Ready`. Any other origin is ignored.
    pub fn mark_ready(&self, port: u16, initial_url: String) -> bool {
        self.finish(
            BackendState::Ready { port, initial_url },
            |state| matches!(state, BackendState::Starting),
        )
    }

    /// `NotStarted | Starting -> Failed`.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        self.finish(
            BackendState::Failed {
                reason: reason.into(),
            },
            |state| !state.is_terminal(),
        )
    }

    fn finish<P>(&self, next: BackendState, allowed_from: P) -> bool
    where
        P: Fn(&BackendState) -> bool,
    {
        let mut inner = self.lock();
        if !allowed_from(&inner.state) {
            return false;
        }
        inner.state = next;
        let listener = inner.listener.take();
        let notice = notice_for(&inner.state);
        self.changed.notify_all();
        drop(inner);

        if let (Some(listener), Some(notice)) = (listener, notice) {
            listener(notice);
        }
        true
    }

    /// Blocks until the state is terminal or `timeout` elapses. Returns the terminal state.
    pub fn wait_for_outcome(&self, timeout: Duration) -> Option<BackendState> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.state.is_terminal() {
                return Some(inner.state.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            inner = match self.changed.wait_timeout(inner, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

fn notice_for(state: &BackendState) -> Option<ReadinessNotice> {
    match state {
        BackendState::Ready { port, initial_url } => Some(ReadinessNotice::Ready {
            port: *port,
            url: initial_url.clone(),
        }),
        BackendState::Failed { reason } => Some(ReadinessNotice::Failed {
            reason: reason.clone(),
        }),
        _ => None,
    }
}
