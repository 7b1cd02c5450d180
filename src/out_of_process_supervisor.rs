//! Supervisor that hosts the backend in a child process (or finds it already hosted by a
//! system service) and learns its readiness over the local handshake channel.

use std::{
    env,
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    backend_config::HOME_ENV,
    lifecycle::BackendOwnership,
    local_channel::{CancelToken, ChannelEndpoint, ChannelError},
    logging::DesktopLogger,
    process_group::SupervisedProcess,
    readiness_channel::{run_handshake_client, HandshakeOutcome, HandshakeProgress},
    service_manager::ServiceProbe,
    supervisor::{BackendSupervisor, SupervisorCore},
};

pub const RUN_AS_SERVER_FLAG: &str = "--run-as-server";
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How to start the backend host child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLaunch {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl ChildLaunch {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
        }
    }

    /// Re-runs this executable in backend-host mode against the same home directory.
    pub fn current_exe(home_dir: &Path) -> Result<Self, String> {
        let program = env::current_exe()
            .map_err(|error| format!("Failed to resolve current executable: {error}"))?;
        let mut launch = Self::new(program, [RUN_AS_SERVER_FLAG]);
        launch
            .envs
            .push((OsString::from(HOME_ENV), home_dir.as_os_str().to_os_string()));
        Ok(launch)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[derive(Default)]
struct Workers {
    reader: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
}

pub struct OutOfProcessSupervisor {
    core: SupervisorCore,
    launch: ChildLaunch,
    endpoint: ChannelEndpoint,
    service_name: String,
    probe: Arc<dyn ServiceProbe>,
    child: Arc<Mutex<Option<SupervisedProcess>>>,
    reader_cancel: CancelToken,
    progress: Arc<HandshakeProgress>,
    workers: Mutex<Workers>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl OutOfProcessSupervisor {
    pub fn new(
        core: SupervisorCore,
        launch: ChildLaunch,
        endpoint: ChannelEndpoint,
        service_name: String,
        probe: Arc<dyn ServiceProbe>,
    ) -> Self {
        Self {
            core,
            launch,
            endpoint,
            service_name,
            probe,
            child: Arc::new(Mutex::new(None)),
            reader_cancel: CancelToken::new(),
            progress: Arc::new(HandshakeProgress::default()),
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Pid of the owned backend host, while it is held.
    #[cfg(test)]
    pub fn child_id(&self) -> Option<u32> {
        lock_recover(&self.child).as_ref().map(SupervisedProcess::id)
    }

    fn spawn_child(&self, workers: &mut Workers) -> Result<(), String> {
        let logger = self.core.logger().clone();
        let mut process =
            SupervisedProcess::spawn(self.launch.command(), "backend host", logger.clone())?;

        if let Some(stdout) = process.take_stdout() {
            workers.drains.push(spawn_drain("stdout", stdout, logger.clone())?);
        }
        if let Some(stderr) = process.take_stderr() {
            workers.drains.push(spawn_drain("stderr", stderr, logger)?);
        }
        *lock_recover(&self.child) = Some(process);
        Ok(())
    }

    fn spawn_reader(&self) -> Result<JoinHandle<()>, String> {
        let endpoint = self.endpoint.clone();
        let retry_interval = self.core.timings().handshake_retry_interval;
        let cancel = self.reader_cancel.clone();
        let progress = Arc::clone(&self.progress);
        let lifecycle = Arc::clone(self.core.lifecycle());
        let logger = self.core.logger().clone();

        thread::Builder::new()
            .name("readiness-reader".to_string())
            .spawn(move || {
                let outcome =
                    run_handshake_client(&endpoint, retry_interval, &cancel, &progress, &logger);
                match outcome {
                    HandshakeOutcome::Ready { port, root_url } => {
                        if lifecycle.mark_ready(port, root_url) {
                            logger.startup(&format!("backend ready on port {port}"));
                        }
                    }
                    HandshakeOutcome::Cancelled => logger.handshake("readiness reader cancelled"),
                }
            })
            .map_err(|error| format!("Failed to spawn readiness reader thread: {error}"))
    }

    fn spawn_watchdog(&self) -> Result<JoinHandle<()>, String> {
        let progress = Arc::clone(&self.progress);
        let readiness_timeout = self.core.timings().readiness_timeout;
        let child = Arc::clone(&self.child);
        let owned = self.core.ownership() == BackendOwnership::Owned;
        let reader_cancel = self.reader_cancel.clone();

        self.core.spawn_watchdog(
            move || {
                if progress
                    .since_first_request()
                    .is_some_and(|elapsed| elapsed >= readiness_timeout)
                {
                    return Some(ChannelError::ReadinessTimeout(readiness_timeout).to_string());
                }
                if !owned {
                    return None;
                }
                let mut guard = lock_recover(&child);
                let process = guard.as_mut()?;
                match process.try_wait() {
                    Ok(Some(status)) => Some(format!(
                        "backend host exited before becoming ready: {status}"
                    )),
                    Ok(None) => None,
                    Err(error) => Some(error),
                }
            },
            move || reader_cancel.cancel(),
        )
    }
}

fn spawn_drain<R>(
    stream: &'static str,
    pipe: R,
    logger: DesktopLogger,
) -> Result<JoinHandle<()>, String>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("backend-{stream}"))
        .spawn(move || {
            for line in BufReader::new(pipe).lines() {
                match line {
                    Ok(line) => logger.backend(&format!("[{stream}] {line}")),
                    Err(_) => break,
                }
            }
        })
        .map_err(|error| format!("Failed to spawn {stream} drain thread: {error}"))
}

impl BackendSupervisor for OutOfProcessSupervisor {
    fn core(&self) -> &SupervisorCore {
        &self.core
    }

    fn start(&self) -> Result<(), String> {
        let _transition = self.core.transition_lock();
        if self.core.is_shutting_down() {
            return Err("Supervisor is shutting down.".to_string());
        }
        if !self.core.try_begin_start() {
            self.core.logger().startup("supervisor already started, ignoring");
            return Ok(());
        }
        self.core.lifecycle().mark_starting();

        let mut workers = lock_recover(&self.workers);
        if self.probe.is_service_running(&self.service_name) {
            self.core.logger().startup(&format!(
                "service {} is already running; connecting as guest",
                self.service_name
            ));
            self.core.set_ownership(BackendOwnership::Guest);
        } else {
            if let Err(error) = self.spawn_child(&mut workers) {
                self.core.fail(&error);
                return Err(error);
            }
            self.core.set_ownership(BackendOwnership::Owned);
        }

        let started = self
            .spawn_reader()
            .and_then(|reader| {
                workers.reader = Some(reader);
                self.spawn_watchdog()
            })
            .map(|watchdog| workers.watchdog = Some(watchdog));
        if let Err(error) = started {
            self.core.fail(&error);
            return Err(error);
        }
        Ok(())
    }

    fn shutdown(&self) {
        let _transition = self.core.transition_lock();
        if !self.core.try_begin_shutdown() {
            return;
        }
        if !self.core.was_started() {
            self.core.logger().shutdown("shutdown before start, nothing to stop");
            return;
        }
        let logger = self.core.logger();
        logger.shutdown("stopping out-of-process backend");

        let workers = std::mem::take(&mut *lock_recover(&self.workers));
        self.reader_cancel.cancel();
        self.core.stop_watchdog();
        if let Some(reader) = workers.reader {
            self.core.join_worker("readiness reader", reader, WORKER_JOIN_TIMEOUT);
            logger.shutdown(&format!(
                "readiness reader stopped after {} attempt(s)",
                self.progress.attempts()
            ));
        }
        if let Some(watchdog) = workers.watchdog {
            self.core.join_worker("backend watchdog", watchdog, WORKER_JOIN_TIMEOUT);
        }

        let process = lock_recover(&self.child).take();
        match (self.core.ownership(), process) {
            (BackendOwnership::Owned, Some(mut process)) => {
                process.stop(self.core.timings().graceful_stop_timeout);
                process.release_group();
                drop(process);
            }
            (BackendOwnership::Guest, _) => {
                logger.shutdown(&format!(
                    "leaving service {} running (guest)",
                    self.service_name
                ));
            }
            (_, process) => drop(process),
        }
        for drain in workers.drains {
            self.core.join_worker("backend output drain", drain, WORKER_JOIN_TIMEOUT);
        }

        self.core.fail("supervisor shut down before the backend was ready");
        logger.shutdown("out-of-process backend stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        backend_config::SupervisorTimings,
        lifecycle::{BackendLifecycle, BackendState},
        readiness_channel::ReadinessServer,
    };
    use std::time::Instant;

    struct FixedProbe(bool);

    impl ServiceProbe for FixedProbe {
        fn is_service_running(&self, _service_name: &str) -> bool {
            self.0
        }
    }

    fn timings(readiness_timeout: Duration, startup_timeout: Duration) -> SupervisorTimings {
        SupervisorTimings {
            readiness_timeout,
            handshake_retry_interval: Duration::from_millis(50),
            startup_timeout,
            graceful_stop_timeout: Duration::from_secs(1),
        }
    }

    fn shell(script: &str) -> ChildLaunch {
        ChildLaunch::new("sh", ["-c", script])
    }

    fn supervisor(
        dir: &tempfile::TempDir,
        launch: ChildLaunch,
        service_running: bool,
        timings: SupervisorTimings,
        logger: &DesktopLogger,
    ) -> OutOfProcessSupervisor {
        OutOfProcessSupervisor::new(
            SupervisorCore::new(timings, logger.clone()),
            launch,
            ChannelEndpoint::new(dir.path().join("server-ipc.sock")),
            "kolibri".to_string(),
            Arc::new(FixedProbe(service_running)),
        )
    }

    fn serve_readiness(
        dir: &tempfile::TempDir,
        lifecycle: Arc<BackendLifecycle>,
    ) -> ReadinessServer {
        ReadinessServer::start(
            ChannelEndpoint::new(dir.path().join("server-ipc.sock")),
            lifecycle,
            Duration::from_secs(10),
            DesktopLogger::in_memory(),
        )
        .expect("start readiness server")
    }

    fn ready(port: u16, url: &str) -> Arc<BackendLifecycle> {
        let lifecycle = Arc::new(BackendLifecycle::new());
        lifecycle.mark_starting();
        lifecycle.mark_ready(port, url.to_string());
        lifecycle
    }

    fn process_exists(pid: u32) -> bool {
        unsafe {
            // Safety:
            // - Signal 0 only checks for existence.
            libc::kill(pid as libc::pid_t, 0) == 0
        }
    }

    #[test]
    fn owned_child_reaches_ready_and_is_stopped_on_shutdown() {
        let dir = tempfile::tempdir().expect("temp dir");
        let logger = DesktopLogger::in_memory();
        let mut server = serve_readiness(&dir, ready(8080, "http://localhost:8080/learn/"));
        let supervisor = supervisor(
            &dir,
            shell("echo hosting backend; exec sleep 30"),
            false,
            timings(Duration::from_secs(5), Duration::from_secs(10)),
            &logger,
        );

        supervisor.start().expect("start");
        let outcome = supervisor.wait_for_outcome(Duration::from_secs(5));
        let pid = supervisor.child_id().expect("owned child");
        assert_eq!(supervisor.ownership(), BackendOwnership::Owned);
        assert_eq!(
            outcome,
            Some(BackendState::Ready {
                port: 8080,
                initial_url: "http://localhost:8080/learn/".to_string()
            })
        );

        supervisor.shutdown();
        server.stop();
        assert!(!process_exists(pid));
        assert!(logger.contains("[stdout] hosting backend"));
    }

    #[test]
    fn running_service_makes_the_shell_a_guest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let marker = dir.path().join("spawned");
        let mut server = serve_readiness(&dir, ready(8080, "http://localhost:8080/"));
        let supervisor = supervisor(
            &dir,
            shell(&format!("touch {}", marker.display())),
            true,
            timings(Duration::from_secs(5), Duration::from_secs(10)),
            &DesktopLogger::in_memory(),
        );

        supervisor.start().expect("start");
        let outcome = supervisor.wait_for_outcome(Duration::from_secs(5));
        supervisor.shutdown();
        server.stop();

        assert!(matches!(outcome, Some(BackendState::Ready { port: 8080, .. })));
        assert_eq!(supervisor.ownership(), BackendOwnership::Guest);
        assert!(supervisor.child_id().is_none());
        assert!(!marker.exists());
    }

    #[test]
    fn early_child_exit_fails_startup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let supervisor = supervisor(
            &dir,
            shell("exit 2"),
            false,
            timings(Duration::from_secs(5), Duration::from_secs(30)),
            &DesktopLogger::in_memory(),
        );

        supervisor.start().expect("start");
        let outcome = supervisor.wait_for_outcome(Duration::from_secs(5));
        supervisor.shutdown();
        assert!(matches!(
            outcome,
            Some(BackendState::Failed { ref reason }) if reason.contains("exited before becoming ready")
        ));
    }

    #[test]
    fn silent_server_hits_readiness_timeout() {
        let dir = tempfile::tempdir().expect("temp dir");
        let starting = Arc::new(BackendLifecycle::new());
        starting.mark_starting();
        let mut server = serve_readiness(&dir, starting);
        let supervisor = supervisor(
            &dir,
            shell("exec sleep 30"),
            false,
            timings(Duration::from_millis(300), Duration::from_secs(30)),
            &DesktopLogger::in_memory(),
        );

        let started = Instant::now();
        supervisor.start().expect("start");
        let outcome = supervisor.wait_for_outcome(Duration::from_secs(5));
        let pid = supervisor.child_id().expect("owned child");
        supervisor.shutdown();
        server.stop();

        assert!(matches!(
            outcome,
            Some(BackendState::Failed { ref reason }) if reason.contains("timed out")
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!process_exists(pid));
    }

    #[test]
    fn shutdown_before_ready_is_prompt_and_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let supervisor = supervisor(
            &dir,
            shell("exec sleep 30"),
            false,
            timings(Duration::from_secs(60), Duration::from_secs(60)),
            &DesktopLogger::in_memory(),
        );
        supervisor.start().expect("start");
        thread::sleep(Duration::from_millis(150));
        let pid = supervisor.child_id().expect("owned child");

        let started = Instant::now();
        supervisor.shutdown();
        supervisor.shutdown();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!process_exists(pid));
        assert!(matches!(supervisor.state(), BackendState::Failed { .. }));
    }

    #[test]
    fn spawn_failure_is_reported_as_failed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let supervisor = supervisor(
            &dir,
            ChildLaunch::new("/nonexistent/kolibri-desktop", [RUN_AS_SERVER_FLAG]),
            false,
            timings(Duration::from_secs(5), Duration::from_secs(10)),
            &DesktopLogger::in_memory(),
        );
        assert!(supervisor.start().is_err());
        assert!(matches!(supervisor.state(), BackendState::Failed { .. }));
        supervisor.shutdown();
    }

    #[test]
    fn current_exe_launch_runs_as_server() {
        let dir = tempfile::tempdir().expect("temp dir");
        let launch = ChildLaunch::current_exe(dir.path()).expect("launch");
        assert_eq!(launch.args, vec![OsString::from(RUN_AS_SERVER_FLAG)]);
        assert_eq!(
            launch.envs,
            vec![(OsString::from(HOME_ENV), dir.path().as_os_str().to_os_string())]
        );
    }
}
