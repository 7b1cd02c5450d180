use std::{
    env,
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

pub const DESKTOP_LOG_FILE: &str = "kolibri-app.txt";
pub const BACKEND_LOG_FILE: &str = "kolibri-backend.txt";
pub const DESKTOP_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const BACKEND_LOG_MAX_BYTES: u64 = 20 * 1024 * 1024;
pub const LOG_BACKUP_COUNT: usize = 5;
const DESKTOP_LOG_PATH_ENV: &str = "KOLIBRI_DESKTOP_LOG_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Startup,
    Runtime,
    Handshake,
    Shutdown,
    Backend,
}

impl LogCategory {
    fn as_label(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Runtime => "runtime",
            Self::Handshake => "handshake",
            Self::Shutdown => "shutdown",
            Self::Backend => "backend",
        }
    }
}

#[derive(Debug)]
enum LogSink {
    File {
        path: PathBuf,
        max_bytes: u64,
        backup_count: usize,
        write_lock: Mutex<()>,
    },
    #[cfg(test)]
    Memory(Mutex<Vec<String>>),
}

/// Process-wide log handle. Created once in `main` and cloned into every component.
#[derive(Debug, Clone)]
pub struct DesktopLogger {
    sink: Arc<LogSink>,
}

impl DesktopLogger {
    pub fn to_file(path: PathBuf, max_bytes: u64, backup_count: usize) -> Self {
        if let Some(parent) = path.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                eprintln!(
                    "[desktop log] failed to create log directory {}: {}",
                    parent.display(),
                    error
                );
            }
        }
        Self {
            sink: Arc::new(LogSink::File {
                path,
                max_bytes,
                backup_count,
                write_lock: Mutex::new(()),
            }),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            sink: Arc::new(LogSink::Memory(Mutex::new(Vec::new()))),
        }
    }

    #[cfg(test)]
    pub fn lines(&self) -> Vec<String> {
        match self.sink.as_ref() {
            LogSink::Memory(lines) => match lines.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            LogSink::File { .. } => Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn log(&self, category: LogCategory, message: &str) {
        match self.sink.as_ref() {
            LogSink::File {
                path,
                max_bytes,
                backup_count,
                write_lock,
            } => {
                let _guard = match write_lock.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                rotate_log_if_needed(path, *max_bytes, *backup_count, "desktop", false);
                let line = format_log_line(category, message);
                if let Err(error) = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut file| file.write_all(line.as_bytes()))
                {
                    eprintln!("[desktop log] failed to write {}: {}", path.display(), error);
                }
            }
            #[cfg(test)]
            LogSink::Memory(lines) => {
                let line = format!("[{}] {}", category.as_label(), message);
                match lines.lock() {
                    Ok(mut guard) => guard.push(line),
                    Err(poisoned) => poisoned.into_inner().push(line),
                }
            }
        }
    }

    pub fn startup(&self, message: &str) {
        self.log(LogCategory::Startup, message);
    }

    pub fn runtime(&self, message: &str) {
        self.log(LogCategory::Runtime, message);
    }

    pub fn handshake(&self, message: &str) {
        self.log(LogCategory::Handshake, message);
    }

    pub fn shutdown(&self, message: &str) {
        self.log(LogCategory::Shutdown, message);
    }

    pub fn backend(&self, message: &str) {
        self.log(LogCategory::Backend, message);
    }
}

fn format_log_line(category: LogCategory, message: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z");
    format!("[{}] [{}] {}\n", timestamp, category.as_label(), message)
}

pub fn resolve_desktop_log_path(home_dir: &Path) -> PathBuf {
    if let Ok(custom) = env::var(DESKTOP_LOG_PATH_ENV) {
        let candidate = PathBuf::from(custom.trim());
        if !candidate.as_os_str().is_empty() {
            return candidate;
        }
    }
    home_dir.join("logs").join(DESKTOP_LOG_FILE)
}

pub fn resolve_backend_log_path(home_dir: &Path) -> PathBuf {
    home_dir.join("logs").join(BACKEND_LOG_FILE)
}

/// Shifts `path` into numbered backups once it reaches `max_bytes`.
///
/// `copy_and_truncate` keeps the active file in place, which is required while another
/// process still holds it open for appending.
pub fn rotate_log_if_needed(
    path: &Path,
    max_bytes: u64,
    backup_count: usize,
    log_scope: &str,
    copy_and_truncate: bool,
) {
    if max_bytes == 0 || backup_count == 0 {
        return;
    }

    match fs::metadata(path) {
        Ok(metadata) if metadata.len() >= max_bytes => {}
        Ok(_) => return,
        Err(error) => {
            if error.kind() != io::ErrorKind::NotFound {
                eprintln!(
                    "[log rotation:{log_scope}] failed to read metadata for {}: {}",
                    path.display(),
                    error
                );
            }
            return;
        }
    }

    remove_backup(&rotated_log_path(path, backup_count), log_scope);
    for index in (1..backup_count).rev() {
        let source = rotated_log_path(path, index);
        if !source.exists() {
            continue;
        }
        let target = rotated_log_path(path, index + 1);
        remove_backup(&target, log_scope);
        if let Err(error) = fs::rename(&source, &target) {
            eprintln!(
                "[log rotation:{log_scope}] failed to rename {} to {}: {}",
                source.display(),
                target.display(),
                error
            );
        }
    }

    let first_backup = rotated_log_path(path, 1);
    remove_backup(&first_backup, log_scope);

    let outcome = if copy_and_truncate {
        fs::copy(path, &first_backup).and_then(|_| {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(path)
                .map(|_| ())
        })
    } else {
        fs::rename(path, &first_backup)
    };
    if let Err(error) = outcome {
        eprintln!(
            "[log rotation:{log_scope}] failed to rotate {} into {}: {}",
            path.display(),
            first_backup.display(),
            error
        );
    }
}

fn remove_backup(path: &Path, log_scope: &str) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            eprintln!(
                "[log rotation:{log_scope}] failed to remove backup {}: {}",
                path.display(),
                error
            );
        }
    }
}

fn rotated_log_path(path: &Path, index: usize) -> PathBuf {
    let mut value = OsString::from(path.as_os_str());
    value.push(format!(".{index}"));
    PathBuf::from(value)
}
