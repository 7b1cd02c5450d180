use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    backend_config::ShellConfig,
    backend_host::{BackendHost, ExternalBackendHost},
    lifecycle::{BackendLifecycle, BackendState},
    local_channel::{CancelToken, ChannelEndpoint},
    logging::DesktopLogger,
    process_group::GroupMembership,
    readiness_channel::ReadinessServer,
    runtime_paths,
    supervisor::join_with_timeout,
    ui_state,
};

const RUNNER_JOIN_MARGIN: Duration = Duration::from_secs(2);
const PARENT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// How the worker ended. Outlives the lifecycle's forward-only state: a backend that dies
/// after `Ready` is only visible here.
#[derive(Default)]
struct WorkerExit {
    finished: CancelToken,
    error: Mutex<Option<String>>,
}

impl WorkerExit {
    fn record(&self, error: Option<String>) {
        *lock_recover(&self.error) = error;
        self.finished.cancel();
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drives one [`BackendHost`] on a dedicated worker thread and publishes its outcome.
pub struct BackendRunner {
    host: Arc<dyn BackendHost>,
    lifecycle: Arc<BackendLifecycle>,
    resume_candidate: Option<String>,
    logger: DesktopLogger,
    started: AtomicBool,
    spawned_workers: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
    exit: Arc<WorkerExit>,
}

impl BackendRunner {
    pub fn new(
        host: Arc<dyn BackendHost>,
        lifecycle: Arc<BackendLifecycle>,
        resume_candidate: Option<String>,
        logger: DesktopLogger,
    ) -> Self {
        Self {
            host,
            lifecycle,
            resume_candidate,
            logger,
            started: AtomicBool::new(false),
            spawned_workers: AtomicUsize::new(0),
            worker: Mutex::new(None),
            exit: Arc::new(WorkerExit::default()),
        }
    }

    pub fn lifecycle(&self) -> &Arc<BackendLifecycle> {
        &self.lifecycle
    }

    pub fn spawned_workers(&self) -> usize {
        self.spawned_workers.load(Ordering::SeqCst)
    }

    /// True once the host's `serve` has returned, whatever the lifecycle state says.
    pub fn has_finished(&self) -> bool {
        self.exit.finished.is_cancelled()
    }

    /// Why the host stopped, when it did not stop cleanly on request.
    pub fn exit_error(&self) -> Option<String> {
        lock_recover(&self.exit.error).clone()
    }

    /// Spawns the worker. Returns `Ok(false)` when it was already started.
    pub fn start(&self) -> Result<bool, String> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.logger.startup("backend runner already started, ignoring");
            return Ok(false);
        }
        self.lifecycle.mark_starting();

        let host = Arc::clone(&self.host);
        let lifecycle = Arc::clone(&self.lifecycle);
        let resume_candidate = self.resume_candidate.clone();
        let logger = self.logger.clone();
        let exit = Arc::clone(&self.exit);
        let spawn_result = thread::Builder::new()
            .name("backend-runner".to_string())
            .spawn(move || {
                let error = run_host(host.as_ref(), &lifecycle, resume_candidate, &logger);
                exit.record(error);
            });

        match spawn_result {
            Ok(worker) => {
                self.spawned_workers.fetch_add(1, Ordering::SeqCst);
                *self.lock_worker() = Some(worker);
                Ok(true)
            }
            Err(error) => {
                let reason = format!("Failed to spawn backend runner thread: {error}");
                self.lifecycle.mark_failed(reason.as_str());
                self.exit.record(Some(reason.clone()));
                Err(reason)
            }
        }
    }

    /// Asks the host to stop and joins the worker, bounded by `timeout` plus a margin.
    pub fn request_stop(&self, timeout: Duration) {
        if let Err(error) = self.host.request_stop(timeout) {
            self.logger
                .shutdown(&format!("backend host stop request failed: {error}"));
        }
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            join_with_timeout(
                "backend runner",
                worker,
                timeout + RUNNER_JOIN_MARGIN,
                &self.logger,
            );
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        lock_recover(&self.worker)
    }
}

/// Returns the failure reason, or `None` when the host stopped cleanly after serving.
fn run_host(
    host: &dyn BackendHost,
    lifecycle: &BackendLifecycle,
    resume_candidate: Option<String>,
    logger: &DesktopLogger,
) -> Option<String> {
    // States saved by older runs may still hold a wrapped initialize URL.
    let resume_candidate = resume_candidate.as_deref().map(ui_state::continuity_url);
    let mut on_serving = |port: u16| {
        let origin = ui_state::backend_origin(port);
        let state = ui_state::UiContinuityState {
            url: resume_candidate.clone(),
        };
        let resume = ui_state::resume_url_for_origin(&state, &origin);
        let initial_url = format!("{origin}{}", host.initialize_url(resume));
        if lifecycle.mark_ready(port, initial_url.clone()) {
            logger.startup(&format!("backend ready: {initial_url}"));
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| host.serve(&mut on_serving)));
    match outcome {
        Ok(Ok(())) => {
            let reason = "backend stopped before it started serving";
            if lifecycle.mark_failed(reason) {
                logger.startup(reason);
                Some(reason.to_string())
            } else {
                logger.runtime("backend host returned");
                None
            }
        }
        Ok(Err(error)) => {
            if !lifecycle.mark_failed(error.as_str()) {
                logger.runtime(&format!("backend host ended with error: {error}"));
            } else {
                logger.startup(&format!("backend failed to start: {error}"));
            }
            Some(error)
        }
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let reason = format!("backend host panicked: {detail}");
            lifecycle.mark_failed(reason.as_str());
            logger.startup(&reason);
            Some(reason)
        }
    }
}

/// Entry point of the `--run-as-server` child: hosts the backend and answers readiness
/// requests until told to stop or orphaned.
pub fn run_hosted_backend(config: &ShellConfig, logger: DesktopLogger) -> i32 {
    let host = match ExternalBackendHost::new(config, logger.clone()) {
        Ok(host) => Arc::new(host.with_group_membership(GroupMembership::Inherit)),
        Err(error) => {
            logger.startup(&format!("cannot host backend: {error}"));
            return 1;
        }
    };
    let saved = ui_state::load_state(&runtime_paths::state_file_path(&config.home_dir));
    let runner = BackendRunner::new(
        host,
        Arc::new(BackendLifecycle::new()),
        saved.url,
        logger.clone(),
    );

    let endpoint = match runtime_paths::readiness_endpoint_path() {
        Ok(path) => ChannelEndpoint::new(path),
        Err(error) => {
            logger.startup(&format!("cannot resolve readiness endpoint: {error}"));
            return 1;
        }
    };
    let mut server = match ReadinessServer::start(
        endpoint,
        Arc::clone(runner.lifecycle()),
        config.timings.readiness_timeout,
        logger.clone(),
    ) {
        Ok(server) => server,
        Err(error) => {
            logger.startup(&error);
            return 1;
        }
    };

    let exit_requested = CancelToken::new();
    let ctrlc_token = exit_requested.clone();
    if let Err(error) = ctrlc::set_handler(move || ctrlc_token.cancel()) {
        logger.startup(&format!("failed to install termination handler: {error}"));
    }
    if let Err(error) = runner.start() {
        logger.startup(&error);
        server.stop();
        return 1;
    }

    wait_for_exit_request(&exit_requested, &runner, &logger);

    logger.shutdown("hosted backend shutting down");
    runner.request_stop(config.timings.graceful_stop_timeout);
    server.stop();
    hosted_exit_code(&runner)
}

fn hosted_exit_code(runner: &BackendRunner) -> i32 {
    if runner.exit_error().is_some()
        || matches!(runner.lifecycle().state(), BackendState::Failed { .. })
    {
        1
    } else {
        0
    }
}

/// Returns once a termination signal arrives, the backend stops serving, or (on POSIX)
/// the parent shell goes away.
fn wait_for_exit_request(exit: &CancelToken, runner: &BackendRunner, logger: &DesktopLogger) {
    #[cfg(unix)]
    let parent_at_start = unsafe {
        // Safety:
        // - getppid has no preconditions.
        libc::getppid()
    };
    while exit.wait_timeout(PARENT_WATCH_INTERVAL) {
        #[cfg(unix)]
        {
            let parent = unsafe {
                // Safety:
                // - getppid has no preconditions.
                libc::getppid()
            };
            if parent != parent_at_start {
                logger.shutdown("parent shell exited, stopping hosted backend");
                return;
            }
        }
        if let BackendState::Failed { reason } = runner.lifecycle().state() {
            logger.shutdown(&format!("hosted backend failed: {reason}"));
            return;
        }
        if runner.has_finished() {
            let reason = runner
                .exit_error()
                .unwrap_or_else(|| "backend host returned".to_string());
            logger.shutdown(&format!("hosted backend stopped serving: {reason}"));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_host::build_initialize_path;
    use std::sync::atomic::AtomicUsize;

    enum Script {
        ServeThenWait(u16),
        ServeThenDie(u16),
        Fail(&'static str),
        Panic,
        ReturnWithoutServing,
    }

    struct FakeHost {
        script: Script,
        serve_calls: AtomicUsize,
        stop: CancelToken,
    }

    impl FakeHost {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                serve_calls: AtomicUsize::new(0),
                stop: CancelToken::new(),
            })
        }
    }

    impl BackendHost for FakeHost {
        fn serve(&self, on_serving: &mut dyn FnMut(u16)) -> Result<(), String> {
            self.serve_calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::ServeThenWait(port) => {
                    on_serving(port);
                    while self.stop.wait_timeout(Duration::from_millis(20)) {}
                    Ok(())
                }
                Script::ServeThenDie(port) => {
                    on_serving(port);
                    thread::sleep(Duration::from_millis(100));
                    Err("Backend process exited unexpectedly: signal 9".to_string())
                }
                Script::Fail(reason) => Err(reason.to_string()),
                Script::Panic => panic!("port already bound"),
                Script::ReturnWithoutServing => Ok(()),
            }
        }

        fn request_stop(&self, _timeout: Duration) -> Result<(), String> {
            self.stop.cancel();
            Ok(())
        }

        fn initialize_url(&self, next_url: Option<&str>) -> String {
            build_initialize_path("/new", next_url)
        }
    }

    fn runner_for(host: Arc<FakeHost>, resume: Option<&str>) -> BackendRunner {
        BackendRunner::new(
            host,
            Arc::new(BackendLifecycle::new()),
            resume.map(str::to_string),
            DesktopLogger::in_memory(),
        )
    }

    #[test]
    fn repeated_start_spawns_one_worker() {
        let host = FakeHost::new(Script::ServeThenWait(5000));
        let runner = runner_for(Arc::clone(&host), None);

        assert_eq!(runner.start(), Ok(true));
        assert_eq!(runner.start(), Ok(false));
        assert_eq!(runner.start(), Ok(false));
        let outcome = runner.lifecycle().wait_for_outcome(Duration::from_secs(5));
        runner.request_stop(Duration::from_secs(1));

        assert_eq!(runner.spawned_workers(), 1);
        assert_eq!(host.serve_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome,
            Some(BackendState::Ready {
                port: 5000,
                initial_url: "http://localhost:5000/new".to_string()
            })
        );
    }

    #[test]
    fn resume_url_is_forwarded_only_for_the_same_origin() {
        let host = FakeHost::new(Script::ServeThenWait(8080));
        let runner = runner_for(host, Some("http://localhost:8080/en/learn/"));
        runner.start().expect("start");
        let outcome = runner.lifecycle().wait_for_outcome(Duration::from_secs(5));
        runner.request_stop(Duration::from_secs(1));
        assert_eq!(
            outcome,
            Some(BackendState::Ready {
                port: 8080,
                initial_url: "http://localhost:8080/new?next=http%3A%2F%2Flocalhost%3A8080%2Fen%2Flearn%2F"
                    .to_string()
            })
        );

        let host = FakeHost::new(Script::ServeThenWait(8081));
        let runner = runner_for(host, Some("http://localhost:8080/en/learn/"));
        runner.start().expect("start");
        let outcome = runner.lifecycle().wait_for_outcome(Duration::from_secs(5));
        runner.request_stop(Duration::from_secs(1));
        assert_eq!(
            outcome,
            Some(BackendState::Ready {
                port: 8081,
                initial_url: "http://localhost:8081/new".to_string()
            })
        );
    }

    #[test]
    fn host_error_becomes_failed_state() {
        let runner = runner_for(FakeHost::new(Script::Fail("port 8080 in use")), None);
        runner.start().expect("start");
        assert_eq!(
            runner.lifecycle().wait_for_outcome(Duration::from_secs(5)),
            Some(BackendState::Failed {
                reason: "port 8080 in use".to_string()
            })
        );
        runner.request_stop(Duration::from_secs(1));
    }

    #[test]
    fn host_panic_becomes_failed_state() {
        let runner = runner_for(FakeHost::new(Script::Panic), None);
        runner.start().expect("start");
        let outcome = runner.lifecycle().wait_for_outcome(Duration::from_secs(5));
        runner.request_stop(Duration::from_secs(1));
        assert!(matches!(
            outcome,
            Some(BackendState::Failed { ref reason }) if reason.contains("port already bound")
        ));
    }

    #[test]
    fn host_returning_without_serving_is_a_failure() {
        let runner = runner_for(FakeHost::new(Script::ReturnWithoutServing), None);
        runner.start().expect("start");
        assert!(matches!(
            runner.lifecycle().wait_for_outcome(Duration::from_secs(5)),
            Some(BackendState::Failed { .. })
        ));
        runner.request_stop(Duration::from_secs(1));
    }

    #[test]
    fn backend_dying_after_ready_ends_the_hosted_wait() {
        let runner = runner_for(FakeHost::new(Script::ServeThenDie(8080)), None);
        runner.start().expect("start");
        assert!(matches!(
            runner.lifecycle().wait_for_outcome(Duration::from_secs(5)),
            Some(BackendState::Ready { port: 8080, .. })
        ));

        let logger = DesktopLogger::in_memory();
        let started = std::time::Instant::now();
        wait_for_exit_request(&CancelToken::new(), &runner, &logger);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(runner.has_finished());
        assert!(logger.contains("hosted backend stopped serving"));
        assert!(runner
            .exit_error()
            .is_some_and(|error| error.contains("exited unexpectedly")));
        assert!(matches!(
            runner.lifecycle().state(),
            BackendState::Ready { .. }
        ));

        runner.request_stop(Duration::from_secs(1));
        assert_eq!(hosted_exit_code(&runner), 1);
    }

    #[test]
    fn requested_stop_after_ready_exits_cleanly() {
        let runner = runner_for(FakeHost::new(Script::ServeThenWait(8080)), None);
        runner.start().expect("start");
        runner.lifecycle().wait_for_outcome(Duration::from_secs(5));
        assert!(!runner.has_finished());

        runner.request_stop(Duration::from_secs(1));
        assert!(runner.has_finished());
        assert_eq!(runner.exit_error(), None);
        assert_eq!(hosted_exit_code(&runner), 0);
    }

    #[test]
    fn stop_before_start_spawns_nothing() {
        let host = FakeHost::new(Script::ServeThenWait(5000));
        let runner = runner_for(Arc::clone(&host), None);
        runner.request_stop(Duration::from_millis(100));
        assert_eq!(runner.spawned_workers(), 0);
        assert_eq!(host.serve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(runner.lifecycle().state(), BackendState::NotStarted);
    }
}
