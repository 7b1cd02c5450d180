//! One shell per user session: an exclusive lock file marks the primary instance, and a
//! control endpoint lets later launches ask it to show its UI.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use fs2::FileExt;

use crate::{
    local_channel::{
        CancelToken, ChannelEndpoint, ChannelError, ListenerWaker, LocalListener, LocalStream,
    },
    logging::DesktopLogger,
    protocol::ControlMessage,
    supervisor::join_with_timeout,
};

const SIGNAL_RETRY_WINDOW: Duration = Duration::from_secs(3);
const SIGNAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const CONTROL_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Held for the life of the primary instance. The OS drops the lock if the process dies.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Returns `Ok(None)` when another live instance holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                format!("Failed to create lock dir {}: {error}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|error| {
                format!("Failed to open instance lock {}: {error}", path.display())
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(error) if is_contended(&error) => Ok(None),
            Err(error) => Err(format!(
                "Failed to lock instance marker {}: {error}",
                path.display()
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Listens for control messages from later launches and forwards `ShowUi` to `on_show_ui`.
pub struct ControlSurface {
    stop: CancelToken,
    waker: ListenerWaker,
    worker: Option<JoinHandle<()>>,
    logger: DesktopLogger,
}

impl ControlSurface {
    pub fn start<F>(
        endpoint: ChannelEndpoint,
        on_show_ui: F,
        logger: DesktopLogger,
    ) -> Result<Self, String>
    where
        F: Fn() + Send + 'static,
    {
        let listener = LocalListener::bind(&endpoint)
            .map_err(|error| format!("Failed to bind control endpoint {endpoint}: {error}"))?;
        let stop = CancelToken::new();
        let worker_stop = stop.clone();
        let worker_logger = logger.clone();
        let worker = thread::Builder::new()
            .name("control-surface".to_string())
            .spawn(move || control_loop(&listener, &on_show_ui, &worker_stop, &worker_logger))
            .map_err(|error| format!("Failed to spawn control surface thread: {error}"))?;
        logger.startup(&format!("control surface listening on {endpoint}"));

        Ok(Self {
            stop,
            waker: ListenerWaker::new(endpoint),
            worker: Some(worker),
            logger,
        })
    }

    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.cancel();
        self.waker.wake();
        join_with_timeout("control surface", worker, CONTROL_JOIN_TIMEOUT, &self.logger);
    }
}

impl Drop for ControlSurface {
    fn drop(&mut self) {
        self.stop();
    }
}

fn control_loop<F>(
    listener: &LocalListener,
    on_show_ui: &F,
    stop: &CancelToken,
    logger: &DesktopLogger,
)
where
    F: Fn(),
{
    while !stop.is_cancelled() {
        let mut stream = match listener.accept() {
            Ok(stream) => stream,
            Err(error) => {
                logger.runtime(&format!("control accept failed: {error}"));
                if !stop.wait_timeout(ACCEPT_ERROR_BACKOFF) {
                    break;
                }
                continue;
            }
        };
        if stop.is_cancelled() {
            break;
        }
        match read_control_message(&mut stream, stop) {
            Ok(ControlMessage::ShowUi) => {
                logger.runtime("another launch asked to show the UI");
                on_show_ui();
            }
            Ok(ControlMessage::Unknown) => logger.runtime("ignoring unknown control message"),
            Err(ChannelError::Disconnected) | Err(ChannelError::Aborted) => {}
            Err(error) => logger.runtime(&format!("control connection dropped: {error}")),
        }
    }
}

/// Reads the one message a control connection carries. A client that stays silent past
/// [`CONTROL_READ_TIMEOUT`] is cut off so it cannot hold up later launches.
fn read_control_message(
    stream: &mut LocalStream,
    stop: &CancelToken,
) -> Result<ControlMessage, ChannelError> {
    let deadline = CancelToken::new();
    let timer_deadline = deadline.clone();
    let timer = thread::Builder::new()
        .name("control-read-deadline".to_string())
        .spawn(move || {
            if timer_deadline.wait_timeout(CONTROL_READ_TIMEOUT) {
                timer_deadline.cancel();
            }
        })
        .map_err(ChannelError::Io)?;

    let outcome = recv_attached(stream, stop, &deadline);
    deadline.cancel();
    let _ = timer.join();
    outcome
}

fn recv_attached(
    stream: &mut LocalStream,
    stop: &CancelToken,
    deadline: &CancelToken,
) -> Result<ControlMessage, ChannelError> {
    let _stop_attached = stop.attach(stream)?;
    let _deadline_attached = deadline.attach(stream)?;
    stream.recv()
}

/// Asks the primary instance to show its UI. The primary may still be binding its control
/// endpoint, so connection failures are retried for a short window.
pub fn signal_existing_instance(
    endpoint: &ChannelEndpoint,
    logger: &DesktopLogger,
) -> Result<(), String> {
    let deadline = Instant::now() + SIGNAL_RETRY_WINDOW;
    loop {
        let attempt = LocalStream::connect(endpoint)
            .and_then(|mut stream| stream.send(&ControlMessage::ShowUi));
        match attempt {
            Ok(()) => {
                logger.startup("forwarded show-ui to the running instance");
                return Ok(());
            }
            Err(error) if error.is_retryable() && Instant::now() < deadline => {
                thread::sleep(SIGNAL_RETRY_INTERVAL);
            }
            Err(error) => {
                return Err(format!(
                    "Failed to signal running instance at {endpoint}: {error}"
                ))
            }
        }
    }
}

/// The primary instance's claim. Dropping it closes the control surface, then the lock.
pub struct PrimaryInstance {
    control: ControlSurface,
    _lock: InstanceLock,
}

impl PrimaryInstance {
    pub fn release(mut self) {
        self.control.stop();
    }
}

pub enum InstanceRole {
    Primary(PrimaryInstance),
    /// Another instance owns the session and was asked to show its UI.
    Forwarded,
}

pub fn claim_instance<F>(
    lock_path: &Path,
    control_endpoint: ChannelEndpoint,
    on_show_ui: F,
    logger: &DesktopLogger,
) -> Result<InstanceRole, String>
where
    F: Fn() + Send + 'static,
{
    match InstanceLock::try_acquire(lock_path)? {
        Some(lock) => {
            let control = ControlSurface::start(control_endpoint, on_show_ui, logger.clone())?;
            logger.startup(&format!("primary instance, lock {}", lock.path().display()));
            Ok(InstanceRole::Primary(PrimaryInstance {
                control,
                _lock: lock,
            }))
        }
        None => {
            logger.startup("another instance is running");
            signal_existing_instance(&control_endpoint, logger)?;
            Ok(InstanceRole::Forwarded)
        }
    }
}
