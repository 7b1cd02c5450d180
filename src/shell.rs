use std::sync::Arc;

use crate::{
    backend_config::ShellConfig,
    lifecycle::ReadinessNotice,
    local_channel::ChannelEndpoint,
    logging::DesktopLogger,
    runtime_paths,
    single_instance::{self, InstanceRole},
    supervisor::{self, BackendSupervisor},
    ui_dispatch::{UiDispatcher, UiHandle, UiLoop},
    ui_state::{self, UiContinuityState},
};

/// Whatever renders the backend's pages.
pub trait UiSurface: Send {
    fn load_url(&mut self, url: &str);
    fn show(&mut self);
    fn show_loading(&mut self);
    fn report_failure(&mut self, reason: &str);

    /// The page the user is on, if the surface tracks navigation.
    fn current_location(&self) -> Option<String> {
        None
    }
}

/// Surface used when no renderer is attached: announces the URL to load.
pub struct HeadlessSurface {
    logger: DesktopLogger,
}

impl HeadlessSurface {
    pub fn new(logger: DesktopLogger) -> Self {
        Self { logger }
    }
}

impl UiSurface for HeadlessSurface {
    fn load_url(&mut self, url: &str) {
        self.logger.runtime(&format!("loading {url}"));
        println!("{url}");
    }

    fn show(&mut self) {
        self.logger.runtime("ui shown");
    }

    fn show_loading(&mut self) {
        self.logger.runtime("backend not ready yet, showing loading page");
    }

    fn report_failure(&mut self, reason: &str) {
        self.logger.startup(&format!("startup error: {reason}"));
        eprintln!("Kolibri startup failed: {reason}");
    }
}

/// UI-thread state of the shell.
pub struct ShellApp {
    surface: Box<dyn UiSurface>,
    tray_only: bool,
    current_url: Option<String>,
    loaded_url: Option<String>,
    failure_reported: bool,
}

impl ShellApp {
    pub fn new(surface: Box<dyn UiSurface>, tray_only: bool) -> Self {
        Self {
            surface,
            tray_only,
            current_url: None,
            loaded_url: None,
            failure_reported: false,
        }
    }

    pub fn load_backend(&mut self, _port: u16, url: &str) {
        self.current_url = Some(url.to_string());
        if !self.tray_only {
            self.load_current();
            self.surface.show();
        }
    }

    /// Brings the UI up. Leaves tray-only mode for the rest of the run.
    pub fn show_or_create_ui(&mut self) {
        self.tray_only = false;
        if self.current_url.is_some() {
            self.load_current();
        } else {
            self.surface.show_loading();
        }
        self.surface.show();
    }

    pub fn notify_backend_failed(&mut self, reason: &str) {
        if self.failure_reported {
            return;
        }
        self.failure_reported = true;
        self.surface.report_failure(reason);
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }

    /// What to resume next run: the page on screen, else where the backend's initial URL
    /// leads. Never the initialize URL itself.
    pub fn continuity_state(&self) -> Option<UiContinuityState> {
        let location = self
            .surface
            .current_location()
            .or_else(|| self.current_url.clone())?;
        Some(UiContinuityState {
            url: Some(ui_state::continuity_url(&location)),
        })
    }

    fn load_current(&mut self) {
        let Some(url) = self.current_url.as_deref() else {
            return;
        };
        if self.loaded_url.as_deref() != Some(url) {
            self.surface.load_url(url);
            self.loaded_url = Some(url.to_string());
        }
    }
}

/// Routes the supervisor's readiness notice onto the UI thread.
pub fn forward_readiness(
    supervisor: &dyn BackendSupervisor,
    ui: UiHandle<ShellApp>,
    quit_on_failure: bool,
    logger: DesktopLogger,
) {
    supervisor.on_ready(Box::new(move |notice| {
        let dispatched = match notice {
            ReadinessNotice::Ready { port, url } => ui.run_on_ui_thread(
                "load backend",
                Box::new(move |app: &mut ShellApp| app.load_backend(port, &url)),
            ),
            ReadinessNotice::Failed { reason } => {
                let result = ui.run_on_ui_thread(
                    "report backend failure",
                    Box::new(move |app: &mut ShellApp| app.notify_backend_failed(&reason)),
                );
                if quit_on_failure {
                    ui.request_quit(1);
                }
                result
            }
        };
        if let Err(error) = dispatched {
            logger.runtime(&error);
        }
    }));
}

pub fn run_shell(config: &ShellConfig, logger: DesktopLogger, tray_only: bool) -> i32 {
    if let Err(error) = runtime_paths::ensure_home_dir(&config.home_dir) {
        logger.startup(&error);
        return 1;
    }
    let ui_loop: UiLoop<ShellApp> = UiLoop::new(logger.clone());

    let control_endpoint = match runtime_paths::control_endpoint_path() {
        Ok(path) => ChannelEndpoint::new(path),
        Err(error) => {
            logger.startup(&error);
            return 1;
        }
    };
    let show_handle = ui_loop.handle();
    let show_logger = logger.clone();
    let role = single_instance::claim_instance(
        &runtime_paths::instance_lock_path(&config.home_dir),
        control_endpoint,
        move || {
            if let Err(error) = show_handle.run_on_ui_thread(
                "show ui",
                Box::new(|app: &mut ShellApp| app.show_or_create_ui()),
            ) {
                show_logger.runtime(&error);
            }
        },
        &logger,
    );
    let primary = match role {
        Ok(InstanceRole::Primary(primary)) => primary,
        Ok(InstanceRole::Forwarded) => return 0,
        Err(error) => {
            logger.startup(&error);
            return 1;
        }
    };

    let supervisor: Arc<dyn BackendSupervisor> =
        match supervisor::build_supervisor(config, &logger) {
            Ok(supervisor) => Arc::from(supervisor),
            Err(error) => {
                logger.startup(&error);
                primary.release();
                return 1;
            }
        };
    forward_readiness(supervisor.as_ref(), ui_loop.handle(), true, logger.clone());

    let quit_handle = ui_loop.handle();
    if let Err(error) = ctrlc::set_handler(move || quit_handle.request_quit(0)) {
        logger.startup(&format!("failed to install termination handler: {error}"));
    }
    if let Err(error) = supervisor.start() {
        logger.startup(&format!("backend supervisor failed to start: {error}"));
    }

    let mut app = ShellApp::new(Box::new(HeadlessSurface::new(logger.clone())), tray_only);
    if !tray_only {
        app.show_or_create_ui();
    }
    let exit_code = ui_loop.run_until_quit(&mut app);

    logger.shutdown(&format!("shell exiting with code {exit_code}"));
    supervisor.shutdown();
    if let Some(state) = app.continuity_state() {
        let state_path = runtime_paths::state_file_path(&config.home_dir);
        if let Err(error) = ui_state::save_state(&state_path, &state) {
            logger.shutdown(&error);
        }
    }
    primary.release();
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend_config::SupervisorTimings,
        backend_host::{build_initialize_path, BackendHost},
        backend_runner::BackendRunner,
        in_process_supervisor::InProcessSupervisor,
        local_channel::CancelToken,
        supervisor::SupervisorCore,
    };
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[derive(Clone, Default)]
    struct RecordingSurface {
        events: Arc<Mutex<Vec<String>>>,
        location: Arc<Mutex<Option<String>>>,
    }

    impl RecordingSurface {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events").clone()
        }
    }

    impl UiSurface for RecordingSurface {
        fn load_url(&mut self, url: &str) {
            self.events.lock().expect("events").push(format!("load {url}"));
        }

        fn show(&mut self) {
            self.events.lock().expect("events").push("show".to_string());
        }

        fn show_loading(&mut self) {
            self.events.lock().expect("events").push("loading".to_string());
        }

        fn report_failure(&mut self, reason: &str) {
            self.events.lock().expect("events").push(format!("failed {reason}"));
        }

        fn current_location(&self) -> Option<String> {
            self.location.lock().expect("location").clone()
        }
    }

    #[test]
    fn tray_only_defers_loading_until_shown() {
        let surface = RecordingSurface::default();
        let mut app = ShellApp::new(Box::new(surface.clone()), true);
        app.load_backend(8080, "http://localhost:8080/");
        assert!(surface.events().is_empty());
        assert_eq!(app.current_url(), Some("http://localhost:8080/"));

        app.show_or_create_ui();
        app.show_or_create_ui();
        assert_eq!(
            surface.events(),
            vec!["load http://localhost:8080/", "show", "show"]
        );
    }

    #[test]
    fn show_before_ready_shows_loading_page() {
        let surface = RecordingSurface::default();
        let mut app = ShellApp::new(Box::new(surface.clone()), false);
        app.show_or_create_ui();
        app.load_backend(8080, "http://localhost:8080/learn/");
        assert_eq!(
            surface.events(),
            vec!["loading", "show", "load http://localhost:8080/learn/", "show"]
        );
    }

    #[test]
    fn failure_is_reported_once() {
        let surface = RecordingSurface::default();
        let mut app = ShellApp::new(Box::new(surface.clone()), false);
        app.notify_backend_failed("port in use");
        app.notify_backend_failed("port in use");
        assert_eq!(surface.events(), vec!["failed port in use"]);
    }

    #[test]
    fn continuity_state_prefers_the_page_on_screen() {
        let surface = RecordingSurface::default();
        let mut app = ShellApp::new(Box::new(surface.clone()), false);
        assert_eq!(app.continuity_state(), None);

        app.load_backend(
            8080,
            "http://localhost:8080/?next=http%3A%2F%2Flocalhost%3A8080%2Fen%2Flearn%2F",
        );
        assert_eq!(
            app.continuity_state().and_then(|state| state.url).as_deref(),
            Some("http://localhost:8080/en/learn/")
        );

        *surface.location.lock().expect("location") =
            Some("http://localhost:8080/en/learn/#/topics/t/abc".to_string());
        assert_eq!(
            app.continuity_state().and_then(|state| state.url).as_deref(),
            Some("http://localhost:8080/en/learn/#/topics/t/abc")
        );
    }

    struct InstantHost {
        stop: CancelToken,
    }

    impl BackendHost for InstantHost {
        fn serve(&self, on_serving: &mut dyn FnMut(u16)) -> Result<(), String> {
            on_serving(8765);
            while self.stop.wait_timeout(Duration::from_millis(20)) {}
            Ok(())
        }

        fn request_stop(&self, _timeout: Duration) -> Result<(), String> {
            self.stop.cancel();
            Ok(())
        }

        fn initialize_url(&self, next_url: Option<&str>) -> String {
            build_initialize_path("/", next_url)
        }
    }

    #[test]
    fn readiness_is_loaded_through_the_ui_loop() {
        let logger = DesktopLogger::in_memory();
        let core = SupervisorCore::new(SupervisorTimings::default(), logger.clone());
        let runner = BackendRunner::new(
            Arc::new(InstantHost {
                stop: CancelToken::new(),
            }),
            Arc::clone(core.lifecycle()),
            None,
            logger.clone(),
        );
        let supervisor = InProcessSupervisor::new(core, runner);
        let ui_loop: UiLoop<ShellApp> = UiLoop::new(logger.clone());
        forward_readiness(&supervisor, ui_loop.handle(), true, logger);

        let surface = RecordingSurface::default();
        let mut app = ShellApp::new(Box::new(surface.clone()), false);
        supervisor.start().expect("start");
        assert!(ui_loop.pump_until(&mut app, Duration::from_secs(5), |app| app
            .current_url()
            .is_some()));
        supervisor.shutdown();

        assert_eq!(app.current_url(), Some("http://localhost:8765/"));
        assert_eq!(surface.events(), vec!["load http://localhost:8765/", "show"]);
    }

    #[test]
    fn saved_url_is_stable_across_restarts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state_path = dir.path().join("app_state.json");
        ui_state::save_state(
            &state_path,
            &UiContinuityState {
                url: Some("http://localhost:8765/en/learn/".to_string()),
            },
        )
        .expect("seed state");

        let logger = DesktopLogger::in_memory();
        let mut initial_urls = Vec::new();
        for _ in 0..3 {
            let runner = BackendRunner::new(
                Arc::new(InstantHost {
                    stop: CancelToken::new(),
                }),
                Arc::new(crate::lifecycle::BackendLifecycle::new()),
                ui_state::load_state(&state_path).url,
                logger.clone(),
            );
            runner.start().expect("start");
            let outcome = runner.lifecycle().wait_for_outcome(Duration::from_secs(5));
            runner.request_stop(Duration::from_secs(1));
            let Some(crate::lifecycle::BackendState::Ready { port, initial_url }) = outcome else {
                panic!("backend did not become ready");
            };

            let mut app = ShellApp::new(Box::new(RecordingSurface::default()), false);
            app.load_backend(port, &initial_url);
            let state = app.continuity_state().expect("state to save");
            ui_state::save_state(&state_path, &state).expect("save state");
            initial_urls.push(initial_url);
        }

        assert_eq!(
            ui_state::load_state(&state_path).url.as_deref(),
            Some("http://localhost:8765/en/learn/")
        );
        let expected = "http://localhost:8765/?next=http%3A%2F%2Flocalhost%3A8765%2Fen%2Flearn%2F";
        assert!(initial_urls.iter().all(|url| url == expected));
    }
}
