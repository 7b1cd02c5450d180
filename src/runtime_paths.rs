use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::backend_config::HOME_ENV;

pub const STATE_FILE_NAME: &str = "app_state.json";
pub const INSTANCE_LOCK_FILE_NAME: &str = "kolibri-desktop.lock";
#[cfg(unix)]
const CHANNEL_DIR_NAME: &str = "kolibri-desktop";
#[cfg(unix)]
const READINESS_SOCKET_NAME: &str = "server-ipc.sock";
#[cfg(unix)]
const CONTROL_SOCKET_NAME: &str = "control.sock";
#[cfg(windows)]
const READINESS_PIPE_NAME: &str = r"\\.\pipe\KolibriAppServerIPC";
#[cfg(windows)]
const CONTROL_PIPE_PREFIX: &str = r"\\.\pipe\KolibriAppControl-";

pub fn resolve_home_dir() -> PathBuf {
    resolve_home_dir_with(env::var(HOME_ENV).ok(), home::home_dir())
}

fn resolve_home_dir_with(explicit: Option<String>, user_home: Option<PathBuf>) -> PathBuf {
    if let Some(value) = explicit
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return PathBuf::from(value);
    }
    user_home
        .map(|home| home.join(".kolibri"))
        .unwrap_or_else(|| env::temp_dir().join(".kolibri"))
}

pub fn state_file_path(home_dir: &Path) -> PathBuf {
    home_dir.join(STATE_FILE_NAME)
}

pub fn instance_lock_path(home_dir: &Path) -> PathBuf {
    home_dir.join(INSTANCE_LOCK_FILE_NAME)
}

/// Per-user directory holding the local sockets. Only the owner can enter it.
#[cfg(unix)]
pub fn channel_dir() -> Result<PathBuf, String> {
    use std::os::unix::fs::PermissionsExt;

    let dir = match env::var_os("XDG_RUNTIME_DIR").filter(|value| !value.is_empty()) {
        Some(runtime_dir) => PathBuf::from(runtime_dir).join(CHANNEL_DIR_NAME),
        None => {
            let uid = unsafe {
                // Safety:
                // - getuid has no preconditions and cannot fail.
                libc::getuid()
            };
            env::temp_dir().join(format!("{CHANNEL_DIR_NAME}-{uid}"))
        }
    };
    fs::create_dir_all(&dir)
        .map_err(|error| format!("Failed to create channel dir {}: {error}", dir.display()))?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(|error| {
        format!(
            "Failed to restrict channel dir {}: {error}",
            dir.display()
        )
    })?;
    Ok(dir)
}

#[cfg(unix)]
pub fn readiness_endpoint_path() -> Result<PathBuf, String> {
    Ok(channel_dir()?.join(READINESS_SOCKET_NAME))
}

#[cfg(unix)]
pub fn control_endpoint_path() -> Result<PathBuf, String> {
    Ok(channel_dir()?.join(CONTROL_SOCKET_NAME))
}

#[cfg(windows)]
pub fn readiness_endpoint_path() -> Result<PathBuf, String> {
    Ok(PathBuf::from(READINESS_PIPE_NAME))
}

#[cfg(windows)]
pub fn control_endpoint_path() -> Result<PathBuf, String> {
    let user = env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    let sanitized: String = user
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    Ok(PathBuf::from(format!("{CONTROL_PIPE_PREFIX}{sanitized}")))
}

pub fn ensure_home_dir(home_dir: &Path) -> Result<(), String> {
    fs::create_dir_all(home_dir)
        .map_err(|error| format!("Failed to create home dir {}: {error}", home_dir.display()))
}
