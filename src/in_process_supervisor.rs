use std::{sync::Mutex, thread::JoinHandle, time::Duration};

use crate::{
    backend_runner::BackendRunner,
    lifecycle::BackendOwnership,
    supervisor::{BackendSupervisor, SupervisorCore},
};

const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the backend on a worker thread of the shell process itself.
pub struct InProcessSupervisor {
    core: SupervisorCore,
    runner: BackendRunner,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessSupervisor {
    /// `runner` must publish to `core`'s lifecycle.
    pub fn new(core: SupervisorCore, runner: BackendRunner) -> Self {
        Self {
            core,
            runner,
            watchdog: Mutex::new(None),
        }
    }
}

impl BackendSupervisor for InProcessSupervisor {
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
        self.core.set_ownership(BackendOwnership::Owned);
        self.runner.start()?;

        let watchdog = self.core.spawn_watchdog(|| None, || {})?;
        *match self.watchdog.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        } = Some(watchdog);
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
        self.core.logger().shutdown("stopping in-process backend");

        self.core.stop_watchdog();
        let watchdog = match self.watchdog.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(watchdog) = watchdog {
            self.core
                .join_worker("backend watchdog", watchdog, WATCHDOG_JOIN_TIMEOUT);
        }

        self.runner
            .request_stop(self.core.timings().graceful_stop_timeout);
        self.core.fail("supervisor shut down before the backend was ready");
        self.core.logger().shutdown("in-process backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend_config::SupervisorTimings,
        backend_host::{build_initialize_path, BackendHost},
        lifecycle::{BackendState, ReadinessNotice},
        local_channel::CancelToken,
        logging::DesktopLogger,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc,
        },
        time::Instant,
    };

    struct SlowHost {
        ready_after: Duration,
        port: u16,
        stop: CancelToken,
        stops: AtomicUsize,
    }

    impl BackendHost for SlowHost {
        fn serve(&self, on_serving: &mut dyn FnMut(u16)) -> Result<(), String> {
            if !self.stop.wait_timeout(self.ready_after) {
                return Ok(());
            }
            on_serving(self.port);
            while self.stop.wait_timeout(Duration::from_millis(20)) {}
            Ok(())
        }

        fn request_stop(&self, _timeout: Duration) -> Result<(), String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stop.cancel();
            Ok(())
        }

        fn initialize_url(&self, next_url: Option<&str>) -> String {
            build_initialize_path("/", next_url)
        }
    }

    fn supervisor(ready_after: Duration, startup_timeout: Duration) -> (InProcessSupervisor, Arc<SlowHost>) {
        let host = Arc::new(SlowHost {
            ready_after,
            port: 8080,
            stop: CancelToken::new(),
            stops: AtomicUsize::new(0),
        });
        let logger = DesktopLogger::in_memory();
        let core = SupervisorCore::new(
            SupervisorTimings {
                readiness_timeout: Duration::from_secs(5),
                handshake_retry_interval: Duration::from_millis(50),
                startup_timeout,
                graceful_stop_timeout: Duration::from_millis(500),
            },
            logger.clone(),
        );
        let runner = BackendRunner::new(
            Arc::clone(&host) as Arc<dyn BackendHost>,
            Arc::clone(core.lifecycle()),
            None,
            logger,
        );
        (InProcessSupervisor::new(core, runner), host)
    }

    #[test]
    fn listener_receives_ready_once() {
        let (supervisor, _host) = supervisor(Duration::from_millis(50), Duration::from_secs(10));
        let (sender, receiver) = mpsc::channel();
        supervisor.on_ready(Box::new(move |notice| {
            let _ = sender.send(notice);
        }));
        supervisor.start().expect("start");
        supervisor.start().expect("second start is a no-op");

        let notice = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("ready notice");
        assert_eq!(
            notice,
            ReadinessNotice::Ready {
                port: 8080,
                url: "http://localhost:8080/".to_string()
            }
        );
        assert_eq!(supervisor.ownership(), BackendOwnership::Owned);
        supervisor.shutdown();
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn shutdown_is_idempotent_and_safe_before_start() {
        let (supervisor, host) = supervisor(Duration::from_millis(50), Duration::from_secs(10));
        supervisor.shutdown();
        supervisor.shutdown();
        assert_eq!(host.stops.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state(), BackendState::NotStarted);
        assert!(supervisor.start().is_err());
    }

    #[test]
    fn shutdown_during_startup_stops_host_promptly() {
        let (supervisor, host) = supervisor(Duration::from_secs(30), Duration::from_secs(60));
        supervisor.start().expect("start");
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        supervisor.shutdown();
        supervisor.shutdown();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(host.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(supervisor.state(), BackendState::Failed { .. }));
    }

    #[test]
    fn startup_bound_fails_a_slow_backend() {
        let (supervisor, _host) =
            supervisor(Duration::from_secs(30), Duration::from_millis(300));
        supervisor.start().expect("start");
        let outcome = supervisor.wait_for_outcome(Duration::from_secs(5));
        supervisor.shutdown();
        assert!(matches!(
            outcome,
            Some(BackendState::Failed { ref reason }) if reason.contains("did not become ready")
        ));
    }
}
