use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    lifecycle::{BackendLifecycle, BackendState},
    local_channel::{
        CancelToken, ChannelEndpoint, ChannelError, ListenerWaker, LocalListener, LocalStream,
    },
    logging::DesktopLogger,
    protocol::HandshakeMessage,
    supervisor::join_with_timeout,
};

const READY_WAIT_SLICE: Duration = Duration::from_millis(200);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const SERVER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Server side of the handshake, run by the process hosting the backend.
pub struct ReadinessServer {
    endpoint: ChannelEndpoint,
    stop: CancelToken,
    waker: ListenerWaker,
    worker: Option<JoinHandle<()>>,
    logger: DesktopLogger,
}

impl ReadinessServer {
    pub fn start(
        endpoint: ChannelEndpoint,
        lifecycle: Arc<BackendLifecycle>,
        readiness_timeout: Duration,
        logger: DesktopLogger,
    ) -> Result<Self, String> {
        let listener = LocalListener::bind(&endpoint).map_err(|error| {
            format!("Failed to bind readiness endpoint {endpoint}: {error}")
        })?;
        let stop = CancelToken::new();
        let worker_stop = stop.clone();
        let worker_logger = logger.clone();
        let worker = thread::Builder::new()
            .name("readiness-server".to_string())
            .spawn(move || {
                serve_loop(
                    &listener,
                    &lifecycle,
                    readiness_timeout,
                    &worker_stop,
                    &worker_logger,
                )
            })
            .map_err(|error| format!("Failed to spawn readiness server thread: {error}"))?;
        logger.handshake(&format!("readiness server listening on {endpoint}"));

        Ok(Self {
            waker: ListenerWaker::new(endpoint.clone()),
            endpoint,
            stop,
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
        join_with_timeout(
            &format!("readiness server on {}", self.endpoint),
            worker,
            SERVER_JOIN_TIMEOUT,
            &self.logger,
        );
    }
}

impl Drop for ReadinessServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(
    listener: &LocalListener,
    lifecycle: &BackendLifecycle,
    readiness_timeout: Duration,
    stop: &CancelToken,
    logger: &DesktopLogger,
) {
    while !stop.is_cancelled() {
        match listener.accept() {
            Ok(stream) => {
                if stop.is_cancelled() {
                    break;
                }
                serve_connection(stream, lifecycle, readiness_timeout, stop, logger);
            }
            Err(error) => {
                logger.handshake(&format!("readiness accept failed: {error}"));
                if !stop.wait_timeout(ACCEPT_ERROR_BACKOFF) {
                    break;
                }
            }
        }
    }
    logger.handshake("readiness server loop exited");
}

fn serve_connection(
    mut stream: LocalStream,
    lifecycle: &BackendLifecycle,
    readiness_timeout: Duration,
    stop: &CancelToken,
    logger: &DesktopLogger,
) {
    let Ok(_attached) = stop.attach(&stream) else {
        return;
    };
    loop {
        match stream.recv::<HandshakeMessage>() {
            Ok(HandshakeMessage::RequestServerInfo) => {
                match wait_for_ready(lifecycle, readiness_timeout, stop) {
                    Ok((port, root_url)) => {
                        let reply = HandshakeMessage::ServerReady {
                            port,
                            root_url: root_url.clone(),
                        };
                        if let Err(error) = stream.send(&reply) {
                            logger.handshake(&format!("failed to send server_ready: {error}"));
                            return;
                        }
                        logger.handshake(&format!("sent server_ready: port={port}, url={root_url}"));
                    }
                    Err(error) => {
                        logger.handshake(&format!("dropping handshake connection: {error}"));
                        return;
                    }
                }
            }
            Ok(HandshakeMessage::ServerReady { .. }) | Ok(HandshakeMessage::Unknown) => {
                logger.handshake("ignoring unexpected message on readiness server");
            }
            Err(ChannelError::Disconnected) | Err(ChannelError::Aborted) => return,
            Err(error) => {
                logger.handshake(&format!("readiness connection dropped: {error}"));
                return;
            }
        }
    }
}

/// Waits for the local backend to reach a terminal state, in slices so `stop` is honored.
fn wait_for_ready(
    lifecycle: &BackendLifecycle,
    readiness_timeout: Duration,
    stop: &CancelToken,
) -> Result<(u16, String), String> {
    let deadline = Instant::now() + readiness_timeout;
    loop {
        if stop.is_cancelled() {
            return Err(ChannelError::Aborted.to_string());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ChannelError::ReadinessTimeout(readiness_timeout).to_string());
        }
        match lifecycle.wait_for_outcome(remaining.min(READY_WAIT_SLICE)) {
            Some(BackendState::Ready { port, initial_url }) => return Ok((port, initial_url)),
            Some(BackendState::Failed { reason }) => {
                return Err(format!("backend failed before serving: {reason}"))
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Ready { port: u16, root_url: String },
    Cancelled,
}

/// Shared view of the client loop, read by the supervisor's watchdog.
#[derive(Debug, Default)]
pub struct HandshakeProgress {
    attempts: AtomicUsize,
    first_request_at: Mutex<Option<Instant>>,
}

impl HandshakeProgress {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Time since the first `RequestServerInfo` reached a server. Reconnects do not reset it.
    pub fn since_first_request(&self) -> Option<Duration> {
        let guard = match self.first_request_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.map(|sent_at| sent_at.elapsed())
    }

    fn record_request(&self) {
        let mut guard = match self.first_request_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get_or_insert_with(Instant::now);
    }
}

/// Pull-based client loop: connect, ask, wait for the answer; on any transient failure,
/// start over after `retry_interval`. Returns only on success or cancellation.
pub fn run_handshake_client(
    endpoint: &ChannelEndpoint,
    retry_interval: Duration,
    cancel: &CancelToken,
    progress: &HandshakeProgress,
    logger: &DesktopLogger,
) -> HandshakeOutcome {
    let mut last_error: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return HandshakeOutcome::Cancelled;
        }
        let attempt = progress.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let result = LocalStream::connect(endpoint)
            .and_then(|stream| request_server_info(stream, cancel, progress));
        match result {
            Ok((port, root_url)) => {
                logger.handshake(&format!(
                    "server_ready received on attempt {attempt}: port={port}, url={root_url}"
                ));
                return HandshakeOutcome::Ready { port, root_url };
            }
            Err(_) if cancel.is_cancelled() => return HandshakeOutcome::Cancelled,
            Err(ChannelError::Aborted) => return HandshakeOutcome::Cancelled,
            Err(error) => {
                let message = error.to_string();
                // Only log when the failure mode changes to keep the retry loop quiet.
                if last_error.as_deref() != Some(message.as_str()) {
                    let kind = if error.is_retryable() { "transient" } else { "unexpected" };
                    logger.handshake(&format!(
                        "handshake attempt {attempt} failed ({kind}), retrying: {message}"
                    ));
                    last_error = Some(message);
                }
            }
        }

        if !cancel.wait_timeout(retry_interval) {
            return HandshakeOutcome::Cancelled;
        }
    }
}

fn request_server_info(
    mut stream: LocalStream,
    cancel: &CancelToken,
    progress: &HandshakeProgress,
) -> Result<(u16, String), ChannelError> {
    let _attached = cancel.attach(&stream)?;
    stream.send(&HandshakeMessage::RequestServerInfo)?;
    progress.record_request();
    loop {
        match stream.recv::<HandshakeMessage>()? {
            HandshakeMessage::ServerReady { port, root_url } => return Ok((port, root_url)),
            HandshakeMessage::RequestServerInfo | HandshakeMessage::Unknown => continue,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn endpoint_in(dir: &tempfile::TempDir) -> ChannelEndpoint {
        ChannelEndpoint::new(dir.path().join("server-ipc.sock"))
    }

    fn ready_lifecycle(port: u16, url: &str) -> Arc<BackendLifecycle> {
        let lifecycle = Arc::new(BackendLifecycle::new());
        lifecycle.mark_starting();
        lifecycle.mark_ready(port, url.to_string());
        lifecycle
    }

    #[test]
    fn client_converges_when_server_appears_late() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir);
        let logger = DesktopLogger::in_memory();
        let lifecycle = ready_lifecycle(5000, "http://localhost:5000/new");

        let server_endpoint = endpoint.clone();
        let server_logger = logger.clone();
        let server = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            ReadinessServer::start(
                server_endpoint,
                lifecycle,
                Duration::from_secs(5),
                server_logger,
            )
            .expect("start server")
        });

        let progress = HandshakeProgress::default();
        let outcome = run_handshake_client(
            &endpoint,
            Duration::from_millis(200),
            &CancelToken::new(),
            &progress,
            &logger,
        );
        let mut server = server.join().expect("join server");
        server.stop();

        assert_eq!(
            outcome,
            HandshakeOutcome::Ready {
                port: 5000,
                root_url: "http://localhost:5000/new".to_string()
            }
        );
        assert!(progress.attempts() >= 2, "first attempt must miss the server");
        assert!(progress.attempts() <= 3, "took {} attempts", progress.attempts());
    }

    #[test]
    fn client_resends_request_after_broken_connection() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir);
        let listener = LocalListener::bind(&endpoint).expect("bind");
        let requests = Arc::new(AtomicUsize::new(0));

        let server_requests = Arc::clone(&requests);
        let server = thread::spawn(move || {
            let mut first = listener.accept().expect("accept first");
            let _: HandshakeMessage = first.recv().expect("first request");
            server_requests.fetch_add(1, Ordering::SeqCst);
            drop(first);

            let mut second = listener.accept().expect("accept second");
            let request: HandshakeMessage = second.recv().expect("second request");
            assert_eq!(request, HandshakeMessage::RequestServerInfo);
            server_requests.fetch_add(1, Ordering::SeqCst);
            second
                .send(&HandshakeMessage::Unknown)
                .expect("send noise");
            second
                .send(&HandshakeMessage::ServerReady {
                    port: 8080,
                    root_url: "http://localhost:8080/learn/".to_string(),
                })
                .expect("send ready");
        });

        let progress = HandshakeProgress::default();
        let outcome = run_handshake_client(
            &endpoint,
            Duration::from_millis(50),
            &CancelToken::new(),
            &progress,
            &DesktopLogger::in_memory(),
        );
        server.join().expect("join server");

        assert_eq!(requests.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome,
            HandshakeOutcome::Ready {
                port: 8080,
                root_url: "http://localhost:8080/learn/".to_string()
            }
        );
        assert!(progress.since_first_request().is_some());
    }

    #[test]
    fn server_waits_for_backend_before_answering() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir);
        let lifecycle = Arc::new(BackendLifecycle::new());
        lifecycle.mark_starting();
        let mut server = ReadinessServer::start(
            endpoint.clone(),
            Arc::clone(&lifecycle),
            Duration::from_secs(5),
            DesktopLogger::in_memory(),
        )
        .expect("start server");

        let backend = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            lifecycle.mark_ready(8081, "http://localhost:8081/".to_string());
        });

        let mut client = LocalStream::connect(&endpoint).expect("connect");
        client
            .send(&HandshakeMessage::RequestServerInfo)
            .expect("send");
        let reply: HandshakeMessage = client.recv().expect("recv");
        backend.join().expect("join backend");
        server.stop();

        assert!(matches!(reply, HandshakeMessage::ServerReady { port: 8081, .. }));
    }

    #[test]
    fn server_drops_connection_on_readiness_timeout() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir);
        let lifecycle = Arc::new(BackendLifecycle::new());
        lifecycle.mark_starting();
        let logger = DesktopLogger::in_memory();
        let mut server = ReadinessServer::start(
            endpoint.clone(),
            lifecycle,
            Duration::from_millis(150),
            logger.clone(),
        )
        .expect("start server");

        let mut client = LocalStream::connect(&endpoint).expect("connect");
        client
            .send(&HandshakeMessage::RequestServerInfo)
            .expect("send");
        let reply: Result<HandshakeMessage, ChannelError> = client.recv();
        server.stop();

        assert!(matches!(reply, Err(ChannelError::Disconnected)));
        assert!(logger.contains("timed out"));
    }

    #[test]
    fn malformed_input_does_not_kill_the_server() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir);
        let mut server = ReadinessServer::start(
            endpoint.clone(),
            ready_lifecycle(8080, "http://localhost:8080/"),
            Duration::from_secs(5),
            DesktopLogger::in_memory(),
        )
        .expect("start server");

        let mut raw = UnixStream::connect(endpoint.address()).expect("raw connect");
        raw.write_all(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
            .expect("write garbage");
        drop(raw);

        let progress = HandshakeProgress::default();
        let outcome = run_handshake_client(
            &endpoint,
            Duration::from_millis(50),
            &CancelToken::new(),
            &progress,
            &DesktopLogger::in_memory(),
        );
        server.stop();
        assert!(matches!(outcome, HandshakeOutcome::Ready { port: 8080, .. }));
    }

    #[test]
    fn cancel_stops_a_client_that_never_connects() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir);
        let cancel = CancelToken::new();

        let client_cancel = cancel.clone();
        let client = thread::spawn(move || {
            run_handshake_client(
                &endpoint,
                Duration::from_secs(30),
                &client_cancel,
                &HandshakeProgress::default(),
                &DesktopLogger::in_memory(),
            )
        });
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        cancel.cancel();

        assert_eq!(client.join().expect("join client"), HandshakeOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
