use std::{env, path::PathBuf, time::Duration};

use crate::{runtime_paths, supervisor::SupervisorMode};

pub const HOME_ENV: &str = "KOLIBRI_HOME";
const SUPERVISOR_MODE_ENV: &str = "KOLIBRI_SUPERVISOR_MODE";
const SERVICE_NAME_ENV: &str = "KOLIBRI_SERVICE_NAME";
const BACKEND_CMD_ENV: &str = "KOLIBRI_BACKEND_CMD";
const BACKEND_CWD_ENV: &str = "KOLIBRI_BACKEND_CWD";
const HTTP_PORT_ENV: &str = "KOLIBRI_HTTP_PORT";
const INITIALIZE_PATH_ENV: &str = "KOLIBRI_INITIALIZE_PATH";
const READINESS_TIMEOUT_ENV: &str = "KOLIBRI_READINESS_TIMEOUT_MS";
const HANDSHAKE_RETRY_ENV: &str = "KOLIBRI_HANDSHAKE_RETRY_MS";
const STARTUP_TIMEOUT_ENV: &str = "KOLIBRI_STARTUP_TIMEOUT_MS";
const GRACEFUL_STOP_TIMEOUT_ENV: &str = "KOLIBRI_GRACEFUL_STOP_TIMEOUT_MS";
const READY_POLL_INTERVAL_ENV: &str = "KOLIBRI_BACKEND_READY_POLL_INTERVAL_MS";
const READY_PROBE_TIMEOUT_ENV: &str = "KOLIBRI_BACKEND_READY_PROBE_TIMEOUT_MS";

const DEFAULT_BACKEND_CMD: &str = "kolibri start --foreground";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_INITIALIZE_PATH: &str = "/";
#[cfg(target_os = "windows")]
const DEFAULT_SERVICE_NAME: &str = "Kolibri";
#[cfg(not(target_os = "windows"))]
const DEFAULT_SERVICE_NAME: &str = "kolibri";

const DEFAULT_READINESS_TIMEOUT_MS: u64 = 60_000;
const READINESS_TIMEOUT_MIN_MS: u64 = 1_000;
const READINESS_TIMEOUT_MAX_MS: u64 = 600_000;
const DEFAULT_HANDSHAKE_RETRY_MS: u64 = 2_000;
const HANDSHAKE_RETRY_MIN_MS: u64 = 50;
const HANDSHAKE_RETRY_MAX_MS: u64 = 10_000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const STARTUP_TIMEOUT_MIN_MS: u64 = 1_000;
const STARTUP_TIMEOUT_MAX_MS: u64 = 60 * 60 * 1000;
const DEFAULT_GRACEFUL_STOP_TIMEOUT_MS: u64 = 10_000;
const GRACEFUL_STOP_TIMEOUT_MIN_MS: u64 = 200;
const GRACEFUL_STOP_TIMEOUT_MAX_MS: u64 = 120_000;
const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 300;
const READY_POLL_INTERVAL_MIN_MS: u64 = 50;
const READY_POLL_INTERVAL_MAX_MS: u64 = 10_000;
const DEFAULT_READY_PROBE_TIMEOUT_MS: u64 = 800;
const READY_PROBE_TIMEOUT_MIN_MS: u64 = 100;
const READY_PROBE_TIMEOUT_MAX_MS: u64 = 30_000;

/// Timing knobs shared by both supervisor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    pub readiness_timeout: Duration,
    pub handshake_retry_interval: Duration,
    pub startup_timeout: Duration,
    pub graceful_stop_timeout: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_millis(DEFAULT_READINESS_TIMEOUT_MS),
            handshake_retry_interval: Duration::from_millis(DEFAULT_HANDSHAKE_RETRY_MS),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            graceful_stop_timeout: Duration::from_millis(DEFAULT_GRACEFUL_STOP_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReadinessConfig {
    pub initialize_path: String,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Everything resolved from the environment at process start.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub home_dir: PathBuf,
    pub supervisor_mode: SupervisorMode,
    pub service_name: String,
    pub backend_command: String,
    pub backend_cwd: PathBuf,
    pub http_port: u16,
    pub readiness: BackendReadinessConfig,
    pub timings: SupervisorTimings,
}

impl ShellConfig {
    pub fn from_env<F>(mut log: F) -> Self
    where
        F: FnMut(String),
    {
        let home_dir = runtime_paths::resolve_home_dir();
        let supervisor_mode = match env::var(SUPERVISOR_MODE_ENV) {
            Ok(raw) => SupervisorMode::parse(&raw).unwrap_or_else(|| {
                let fallback = SupervisorMode::platform_default();
                log(format!(
                    "invalid {SUPERVISOR_MODE_ENV}='{raw}', fallback to {}",
                    fallback.as_str()
                ));
                fallback
            }),
            Err(_) => SupervisorMode::platform_default(),
        };
        let backend_cwd = non_empty_env(BACKEND_CWD_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir.clone());

        Self {
            supervisor_mode,
            service_name: non_empty_env(SERVICE_NAME_ENV)
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            backend_command: non_empty_env(BACKEND_CMD_ENV)
                .unwrap_or_else(|| DEFAULT_BACKEND_CMD.to_string()),
            backend_cwd,
            http_port: resolve_http_port(&mut log),
            readiness: BackendReadinessConfig {
                initialize_path: normalize_http_path(
                    non_empty_env(INITIALIZE_PATH_ENV).as_deref(),
                    INITIALIZE_PATH_ENV,
                    DEFAULT_INITIALIZE_PATH,
                    &mut log,
                ),
                probe_timeout_ms: clamped_env_ms(
                    READY_PROBE_TIMEOUT_ENV,
                    DEFAULT_READY_PROBE_TIMEOUT_MS,
                    READY_PROBE_TIMEOUT_MIN_MS,
                    READY_PROBE_TIMEOUT_MAX_MS,
                    &mut log,
                ),
                poll_interval_ms: clamped_env_ms(
                    READY_POLL_INTERVAL_ENV,
                    DEFAULT_READY_POLL_INTERVAL_MS,
                    READY_POLL_INTERVAL_MIN_MS,
                    READY_POLL_INTERVAL_MAX_MS,
                    &mut log,
                ),
            },
            timings: SupervisorTimings {
                readiness_timeout: Duration::from_millis(clamped_env_ms(
                    READINESS_TIMEOUT_ENV,
                    DEFAULT_READINESS_TIMEOUT_MS,
                    READINESS_TIMEOUT_MIN_MS,
                    READINESS_TIMEOUT_MAX_MS,
                    &mut log,
                )),
                handshake_retry_interval: Duration::from_millis(clamped_env_ms(
                    HANDSHAKE_RETRY_ENV,
                    DEFAULT_HANDSHAKE_RETRY_MS,
                    HANDSHAKE_RETRY_MIN_MS,
                    HANDSHAKE_RETRY_MAX_MS,
                    &mut log,
                )),
                startup_timeout: Duration::from_millis(clamped_env_ms(
                    STARTUP_TIMEOUT_ENV,
                    DEFAULT_STARTUP_TIMEOUT_MS,
                    STARTUP_TIMEOUT_MIN_MS,
                    STARTUP_TIMEOUT_MAX_MS,
                    &mut log,
                )),
                graceful_stop_timeout: Duration::from_millis(clamped_env_ms(
                    GRACEFUL_STOP_TIMEOUT_ENV,
                    DEFAULT_GRACEFUL_STOP_TIMEOUT_MS,
                    GRACEFUL_STOP_TIMEOUT_MIN_MS,
                    GRACEFUL_STOP_TIMEOUT_MAX_MS,
                    &mut log,
                )),
            },
            home_dir,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_http_port<F>(log: &mut F) -> u16
where
    F: FnMut(String),
{
    match env::var(HTTP_PORT_ENV) {
        Ok(raw) => parse_port(&raw).unwrap_or_else(|| {
            log(format!(
                "invalid {HTTP_PORT_ENV}='{raw}', fallback to {DEFAULT_HTTP_PORT}"
            ));
            DEFAULT_HTTP_PORT
        }),
        Err(_) => DEFAULT_HTTP_PORT,
    }
}

pub fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|port| *port > 0)
}

fn clamped_env_ms<F>(env_name: &str, fallback_ms: u64, min_ms: u64, max_ms: u64, log: &mut F) -> u64
where
    F: FnMut(String),
{
    match env::var(env_name) {
        Ok(raw) => parse_clamped_timeout_env(&raw, env_name, fallback_ms, min_ms, max_ms, log),
        Err(_) => fallback_ms,
    }
}

pub fn normalize_http_path<F>(
    raw: Option<&str>,
    env_name: &str,
    default_path: &str,
    mut log: F,
) -> String
where
    F: FnMut(String),
{
    let Some(trimmed) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return default_path.to_string();
    };
    if trimmed.starts_with('/') {
        return trimmed.to_string();
    }
    let normalized = format!("/{trimmed}");
    log(format!(
        "{env_name} is missing leading '/': '{trimmed}', normalized to '{normalized}'"
    ));
    normalized
}

pub fn parse_clamped_timeout_env<F>(
    raw: &str,
    env_name: &str,
    fallback_ms: u64,
    min_ms: u64,
    max_ms: u64,
    mut log: F,
) -> u64
where
    F: FnMut(String),
{
    match raw.trim().parse::<u128>() {
        Ok(parsed) if parsed > 0 => {
            if parsed < min_ms as u128 {
                log(format!(
                    "{env_name}='{raw}' is below minimum {min_ms}ms, clamped to {min_ms}ms"
                ));
                min_ms
            } else if parsed > max_ms as u128 {
                log(format!(
                    "{env_name}='{raw}' is above maximum {max_ms}ms, clamped to {max_ms}ms"
                ));
                max_ms
            } else {
                parsed as u64
            }
        }
        _ => {
            log(format!(
                "invalid {env_name}='{raw}', fallback to {fallback_ms}ms"
            ));
            fallback_ms
        }
    }
}
