use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    backend_config::{ShellConfig, SupervisorTimings},
    backend_host::ExternalBackendHost,
    backend_runner::BackendRunner,
    in_process_supervisor::InProcessSupervisor,
    lifecycle::{BackendLifecycle, BackendOwnership, BackendState, ReadinessListener},
    local_channel::{CancelToken, ChannelEndpoint},
    logging::DesktopLogger,
    out_of_process_supervisor::{ChildLaunch, OutOfProcessSupervisor},
    runtime_paths,
    service_manager::SystemServiceProbe,
    ui_state,
};

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMode {
    InProcess,
    OutOfProcess,
}

impl SupervisorMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in-process" | "in_process" | "inprocess" => Some(Self::InProcess),
            "out-of-process" | "out_of_process" | "outofprocess" => Some(Self::OutOfProcess),
            _ => None,
        }
    }

    /// Windows hosts the backend in a separate process so it can run as a service.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            Self::OutOfProcess
        } else {
            Self::InProcess
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::OutOfProcess => "out-of-process",
        }
    }
}

/// One interface over both topologies. Implementors only provide `start`, `shutdown` and
/// access to the shared [`SupervisorCore`].
pub trait BackendSupervisor: Send + Sync {
    fn core(&self) -> &SupervisorCore;

    /// Starts the backend. Redundant calls are no-ops.
    fn start(&self) -> Result<(), String>;

    /// Best-effort teardown. Idempotent, safe before `start`, never panics or fails.
    fn shutdown(&self);

    /// Registers the single readiness notification.
    fn on_ready(&self, listener: ReadinessListener) {
        self.core().lifecycle().set_listener(listener);
    }

    fn state(&self) -> BackendState {
        self.core().lifecycle().state()
    }

    fn ownership(&self) -> BackendOwnership {
        self.core().ownership()
    }

    fn wait_for_outcome(&self, timeout: Duration) -> Option<BackendState> {
        self.core().lifecycle().wait_for_outcome(timeout)
    }
}

/// State and bookkeeping shared by both supervisor variants.
pub struct SupervisorCore {
    lifecycle: Arc<BackendLifecycle>,
    ownership: Mutex<BackendOwnership>,
    transition: Mutex<()>,
    start_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    watchdog_stop: CancelToken,
    timings: SupervisorTimings,
    logger: DesktopLogger,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SupervisorCore {
    pub fn new(timings: SupervisorTimings, logger: DesktopLogger) -> Self {
        Self {
            lifecycle: Arc::new(BackendLifecycle::new()),
            ownership: Mutex::new(BackendOwnership::NotDetermined),
            transition: Mutex::new(()),
            start_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            watchdog_stop: CancelToken::new(),
            timings,
            logger,
        }
    }

    pub fn lifecycle(&self) -> &Arc<BackendLifecycle> {
        &self.lifecycle
    }

    pub fn timings(&self) -> SupervisorTimings {
        self.timings
    }

    pub fn logger(&self) -> &DesktopLogger {
        &self.logger
    }

    pub fn ownership(&self) -> BackendOwnership {
        *lock_recover(&self.ownership)
    }

    pub fn set_ownership(&self, ownership: BackendOwnership) {
        *lock_recover(&self.ownership) = ownership;
    }

    /// Serializes `start` against `shutdown`.
    pub fn transition_lock(&self) -> MutexGuard<'_, ()> {
        lock_recover(&self.transition)
    }

    /// True for the first caller only.
    pub fn try_begin_start(&self) -> bool {
        self.start_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True for the first caller only.
    pub fn try_begin_shutdown(&self) -> bool {
        self.shutdown_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn was_started(&self) -> bool {
        self.start_requested.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn fail(&self, reason: &str) {
        if self.lifecycle.mark_failed(reason) {
            self.logger.startup(&format!("backend failed: {reason}"));
        }
    }

    /// Monitors startup until the lifecycle is terminal or the watchdog is stopped.
    ///
    /// Fails the lifecycle when the overall startup bound elapses or `check` reports a
    /// failure. `on_failure` runs once after the lifecycle was marked failed.
    pub fn spawn_watchdog<C, F>(
        &self,
        mut check: C,
        on_failure: F,
    ) -> Result<JoinHandle<()>, String>
    where
        C: FnMut() -> Option<String> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let lifecycle = Arc::clone(&self.lifecycle);
        let stop = self.watchdog_stop.clone();
        let startup_timeout = self.timings.startup_timeout;
        let logger = self.logger.clone();
        let started_at = Instant::now();

        thread::Builder::new()
            .name("backend-watchdog".to_string())
            .spawn(move || {
                while stop.wait_timeout(WATCHDOG_INTERVAL) {
                    if lifecycle.state().is_terminal() {
                        return;
                    }
                    let reason = if started_at.elapsed() >= startup_timeout {
                        Some(format!(
                            "backend did not become ready within {}ms",
                            startup_timeout.as_millis()
                        ))
                    } else {
                        check()
                    };
                    if let Some(reason) = reason {
                        if lifecycle.mark_failed(reason.as_str()) {
                            logger.startup(&format!("watchdog failed backend startup: {reason}"));
                        }
                        on_failure();
                        return;
                    }
                }
            })
            .map_err(|error| format!("Failed to spawn watchdog thread: {error}"))
    }

    pub fn stop_watchdog(&self) {
        self.watchdog_stop.cancel();
    }

    /// Joins a worker, giving up after `timeout`. A worker that outlives the bound is
    /// detached and logged.
    pub fn join_worker(&self, label: &str, worker: JoinHandle<()>, timeout: Duration) -> bool {
        join_with_timeout(label, worker, timeout, &self.logger)
    }
}

pub fn join_with_timeout(
    label: &str,
    worker: JoinHandle<()>,
    timeout: Duration,
    logger: &DesktopLogger,
) -> bool {
    let deadline = Instant::now() + timeout;
    while !worker.is_finished() && Instant::now() < deadline {
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    if !worker.is_finished() {
        logger.shutdown(&format!(
            "{label} did not finish within {}ms, detaching",
            timeout.as_millis()
        ));
        return false;
    }
    if worker.join().is_err() {
        logger.shutdown(&format!("{label} panicked"));
    }
    true
}

pub fn build_supervisor(
    config: &ShellConfig,
    logger: &DesktopLogger,
) -> Result<Box<dyn BackendSupervisor>, String> {
    logger.startup(&format!(
        "using {} supervisor",
        config.supervisor_mode.as_str()
    ));
    match config.supervisor_mode {
        SupervisorMode::InProcess => {
            let host = Arc::new(ExternalBackendHost::new(config, logger.clone())?);
            let saved = ui_state::load_state(&runtime_paths::state_file_path(&config.home_dir));
            let core = SupervisorCore::new(config.timings, logger.clone());
            let runner = BackendRunner::new(
                host,
                Arc::clone(core.lifecycle()),
                saved.url,
                logger.clone(),
            );
            Ok(Box::new(InProcessSupervisor::new(core, runner)))
        }
        SupervisorMode::OutOfProcess => {
            let endpoint = ChannelEndpoint::new(runtime_paths::readiness_endpoint_path()?);
            Ok(Box::new(OutOfProcessSupervisor::new(
                SupervisorCore::new(config.timings, logger.clone()),
                ChildLaunch::current_exe(&config.home_dir)?,
                endpoint,
                config.service_name.clone(),
                Arc::new(SystemServiceProbe::new(logger.clone())),
            )))
        }
    }
}
