use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use url::Url;

use crate::{
    backend_config::{BackendReadinessConfig, ShellConfig},
    http_probe,
    logging::{self, DesktopLogger, BACKEND_LOG_MAX_BYTES, LOG_BACKUP_COUNT},
    process_group::{GroupMembership, SupervisedProcess},
};

const BACKEND_LOG_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(20);

/// The backend web server, seen only through its lifecycle.
pub trait BackendHost: Send + Sync {
    /// Runs the backend until it stops. Calls `on_serving` once, with the port, as soon as
    /// the backend accepts requests.
    fn serve(&self, on_serving: &mut dyn FnMut(u16)) -> Result<(), String>;

    /// Requests the graceful-stop transition, escalating after `timeout`.
    fn request_stop(&self, timeout: Duration) -> Result<(), String>;

    /// Path and query of the first page to load, optionally continuing at `next_url`.
    fn initialize_url(&self, next_url: Option<&str>) -> String;
}

pub fn build_initialize_path(initialize_path: &str, next_url: Option<&str>) -> String {
    let Some(next_url) = next_url.filter(|value| !value.is_empty()) else {
        return initialize_path.to_string();
    };
    let encoded: String = url::form_urlencoded::byte_serialize(next_url.as_bytes()).collect();
    let separator = if initialize_path.contains('?') { '&' } else { '?' };
    format!("{initialize_path}{separator}next={encoded}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub home_dir: PathBuf,
    pub http_port: u16,
}

impl LaunchPlan {
    pub fn from_config(config: &ShellConfig) -> Result<Self, String> {
        let mut pieces = shlex::split(&config.backend_command)
            .ok_or_else(|| format!("Invalid KOLIBRI_BACKEND_CMD: {}", config.backend_command))?;
        if pieces.is_empty() {
            return Err("KOLIBRI_BACKEND_CMD is empty.".to_string());
        }
        let cmd = pieces.remove(0);
        Ok(Self {
            cmd,
            args: pieces,
            cwd: config.backend_cwd.clone(),
            home_dir: config.home_dir.clone(),
            http_port: config.http_port,
        })
    }

    pub fn debug_command(&self) -> Vec<String> {
        let mut parts = vec![self.cmd.clone()];
        parts.extend(self.args.iter().cloned());
        parts
    }

    fn build_command(&self, log_path: &Path, log_max_bytes: u64) -> Result<Command, String> {
        if !self.cwd.exists() {
            fs::create_dir_all(&self.cwd).map_err(|error| {
                format!(
                    "Failed to create backend cwd {}: {}",
                    self.cwd.display(),
                    error
                )
            })?;
        }

        let mut command = Command::new(&self.cmd);
        command
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .env("KOLIBRI_HOME", &self.home_dir)
            .env("KOLIBRI_HTTP_PORT", self.http_port.to_string())
            .env("KOLIBRI_INSTALLER_VERSION", env!("CARGO_PKG_VERSION"))
            .env("PYTHONUNBUFFERED", "1")
            .env(
                "PYTHONUTF8",
                env::var("PYTHONUTF8").unwrap_or_else(|_| "1".to_string()),
            )
            .env(
                "PYTHONIOENCODING",
                env::var("PYTHONIOENCODING").unwrap_or_else(|_| "utf-8".to_string()),
            );

        if let Some(log_parent) = log_path.parent() {
            fs::create_dir_all(log_parent).map_err(|error| {
                format!(
                    "Failed to create backend log directory {}: {}",
                    log_parent.display(),
                    error
                )
            })?;
        }
        logging::rotate_log_if_needed(
            log_path,
            log_max_bytes,
            LOG_BACKUP_COUNT,
            "backend",
            false,
        );
        let stdout_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|error| {
                format!(
                    "Failed to open backend log {}: {}",
                    log_path.display(),
                    error
                )
            })?;
        let stderr_file = stdout_file
            .try_clone()
            .map_err(|error| format!("Failed to clone backend log handle: {error}"))?;
        command.stdout(Stdio::from(stdout_file));
        command.stderr(Stdio::from(stderr_file));
        Ok(command)
    }
}

/// Runs the backend as an external command and detects "serving" by probing its port.
pub struct ExternalBackendHost {
    plan: LaunchPlan,
    readiness: BackendReadinessConfig,
    log_path: PathBuf,
    log_max_bytes: u64,
    log_rotation_interval: Duration,
    membership: GroupMembership,
    logger: DesktopLogger,
    process: Mutex<Option<SupervisedProcess>>,
    stop_requested: AtomicBool,
}

impl ExternalBackendHost {
    pub fn new(config: &ShellConfig, logger: DesktopLogger) -> Result<Self, String> {
        Ok(Self {
            plan: LaunchPlan::from_config(config)?,
            readiness: config.readiness.clone(),
            log_path: logging::resolve_backend_log_path(&config.home_dir),
            log_max_bytes: BACKEND_LOG_MAX_BYTES,
            log_rotation_interval: BACKEND_LOG_ROTATION_CHECK_INTERVAL,
            membership: GroupMembership::Own,
            logger,
            process: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        })
    }

    /// Hosts nested under a supervised process keep the backend in that process's group,
    /// so tearing the group down reaches the backend too.
    pub fn with_group_membership(mut self, membership: GroupMembership) -> Self {
        self.membership = membership;
        self
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<SupervisedProcess>> {
        match self.process.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                self.logger
                    .backend("backend process lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn base_url(&self) -> Result<Url, String> {
        Url::parse(&format!("http://127.0.0.1:{}/", self.plan.http_port))
            .map_err(|error| format!("Invalid backend url for port {}: {error}", self.plan.http_port))
    }

    fn poll_child_exit(&self) -> Result<Option<String>, String> {
        let mut guard = self.lock_process();
        let Some(process) = guard.as_mut() else {
            return Ok(Some("backend process handle released".to_string()));
        };
        Ok(process.try_wait()?.map(|status| status.to_string()))
    }
}

impl BackendHost for ExternalBackendHost {
    fn serve(&self, on_serving: &mut dyn FnMut(u16)) -> Result<(), String> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        let base_url = self.base_url()?;
        {
            let mut guard = self.lock_process();
            if guard.is_some() {
                return Err("Backend process is already running.".to_string());
            }
            // Re-checked under the lock so a concurrent request_stop cannot miss the child.
            if self.stop_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
            let command = self.plan.build_command(&self.log_path, self.log_max_bytes)?;
            let process = SupervisedProcess::spawn_with(
                command,
                "backend",
                self.membership,
                self.logger.clone(),
            )?;
            self.logger.backend(&format!(
                "spawned backend: cmd={:?}, cwd={}, port={}",
                self.plan.debug_command(),
                self.plan.cwd.display(),
                self.plan.http_port
            ));
            *guard = Some(process);
        }

        let poll_interval = Duration::from_millis(self.readiness.poll_interval_ms);
        let mut serving = false;
        let mut tcp_ready_logged = false;
        let mut last_rotation_check = Instant::now();
        let outcome = loop {
            if !serving {
                let probe = http_probe::probe(
                    &base_url,
                    &self.readiness.initialize_path,
                    self.readiness.probe_timeout_ms,
                );
                if probe.is_serving() {
                    serving = true;
                    self.logger.backend(&format!(
                        "backend is serving on port {}",
                        self.plan.http_port
                    ));
                    on_serving(self.plan.http_port);
                } else if probe.tcp_reachable && !tcp_ready_logged {
                    self.logger.backend(
                        "backend TCP port is reachable but HTTP is not ready yet; waiting",
                    );
                    tcp_ready_logged = true;
                }
            }

            match self.poll_child_exit() {
                Ok(Some(status)) => {
                    if self.stop_requested.load(Ordering::SeqCst) {
                        self.logger.backend(&format!("backend stopped: {status}"));
                        break Ok(());
                    }
                    if serving {
                        break Err(format!("Backend process exited unexpectedly: {status}"));
                    }
                    break Err(format!(
                        "Backend process exited before becoming reachable: {status}"
                    ));
                }
                Ok(None) => {}
                Err(error) => break Err(error),
            }
            // The child appends to the log, so it is rotated in place.
            if last_rotation_check.elapsed() >= self.log_rotation_interval {
                logging::rotate_log_if_needed(
                    &self.log_path,
                    self.log_max_bytes,
                    LOG_BACKUP_COUNT,
                    "backend",
                    true,
                );
                last_rotation_check = Instant::now();
            }
            thread::sleep(poll_interval);
        };

        self.lock_process().take();
        outcome
    }

    fn request_stop(&self, timeout: Duration) -> Result<(), String> {
        self.stop_requested.store(true, Ordering::SeqCst);
        let mut guard = self.lock_process();
        match guard.as_mut() {
            Some(process) => {
                process.stop(timeout);
                process.release_group();
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn initialize_url(&self, next_url: Option<&str>) -> String {
        build_initialize_path(&self.readiness.initialize_path, next_url)
    }
}
