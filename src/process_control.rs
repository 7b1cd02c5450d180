#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
#[cfg(target_os = "windows")]
use std::process::{Command, Stdio};
use std::{
    process::Child,
    thread,
    time::{Duration, Instant},
};

const FORCE_STOP_WAIT_MIN_MS: u64 = 200;
const EXIT_POLL_INTERVAL_MS: u64 = 120;
#[cfg(target_os = "windows")]
const WINDOWS_GRACEFUL_STOP_NONZERO_WAIT_MS: u64 = 350;
#[cfg(target_os = "windows")]
const FORCE_STOP_WAIT_MAX_WINDOWS_MS: u64 = 2_200;
#[cfg(not(target_os = "windows"))]
const FORCE_STOP_WAIT_MAX_NON_WINDOWS_MS: u64 = 1_500;
#[cfg(target_os = "windows")]
pub(crate) const WINDOWS_CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub fn wait_for_child_exit(child: &mut Child, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return false;
                }
                thread::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS));
            }
            Err(_) => return false,
        }
    }
}

#[cfg(target_os = "windows")]
fn run_stop_command<F>(pid: u32, label: &str, args: &[&str], log: F) -> Result<(), String>
where
    F: Fn(&str) + Copy,
{
    let mut command = Command::new("taskkill");
    command
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .creation_flags(WINDOWS_CREATE_NO_WINDOW);

    match command.status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            log(&format!(
                "{label} returned non-zero: pid={pid}, status={status:?}"
            ));
            Err(format!("status={status:?}"))
        }
        Err(error) => {
            log(&format!("{label} failed to start: pid={pid}, error={error}"));
            Err(format!("error={error}"))
        }
    }
}

/// Signals the whole process group led by `pgid`.
#[cfg(not(target_os = "windows"))]
pub fn signal_process_group<F>(pgid: u32, signal: i32, label: &str, log: F) -> Result<(), String>
where
    F: Fn(&str) + Copy,
{
    let Ok(raw_pgid) = libc::pid_t::try_from(pgid) else {
        return Err(format!("pgid {pgid} out of range"));
    };
    let result = unsafe {
        // Safety:
        // - killpg only reads its arguments; an unknown group yields ESRCH.
        libc::killpg(raw_pgid, signal)
    };
    if result == 0 {
        return Ok(());
    }
    let error = std::io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        return Err("group already gone".to_string());
    }
    log(&format!("{label} failed: pgid={pgid}, error={error}"));
    Err(format!("error={error}"))
}

pub(crate) fn compute_followup_wait(timeout: Duration, max_extra_wait: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::ZERO
    } else {
        (timeout / 4)
            .max(Duration::from_millis(FORCE_STOP_WAIT_MIN_MS))
            .min(max_extra_wait)
    }
}

pub(crate) fn resolve_graceful_wait_timeout<F>(
    pid: u32,
    timeout: Duration,
    non_success_wait_cap: Duration,
    graceful_outcome: &Result<(), String>,
    command_label: &str,
    log: F,
) -> Duration
where
    F: Fn(&str) + Copy,
{
    match graceful_outcome {
        Ok(()) => timeout,
        Err(outcome) => {
            let shortened_wait = timeout.min(non_success_wait_cap);
            if shortened_wait < timeout {
                log(&format!(
                    "{command_label} not successful; shorten graceful wait: pid={pid}, {outcome}, requested_wait_ms={}, effective_wait_ms={}",
                    timeout.as_millis(),
                    shortened_wait.as_millis()
                ));
            }
            shortened_wait
        }
    }
}

/// Asks the child's process tree to exit, then force-kills it once `timeout` elapses.
/// Returns true when the child is known to have exited. `taskkill /t` always walks the
/// tree, so `_whole_group` has no effect here.
#[cfg(target_os = "windows")]
pub fn stop_child_process_gracefully<F>(
    child: &mut Child,
    timeout: Duration,
    _whole_group: bool,
    log: F,
) -> bool
where
    F: Fn(&str) + Copy,
{
    if matches!(child.try_wait(), Ok(Some(_))) {
        return true;
    }
    let pid = child.id();
    let pid_arg = pid.to_string();

    let graceful_outcome = run_stop_command(
        pid,
        "taskkill graceful stop",
        &["/pid", &pid_arg, "/t"],
        log,
    );

    let graceful_wait_timeout = resolve_graceful_wait_timeout(
        pid,
        timeout,
        Duration::from_millis(WINDOWS_GRACEFUL_STOP_NONZERO_WAIT_MS),
        &graceful_outcome,
        "taskkill graceful stop",
        log,
    );

    if wait_for_child_exit(child, graceful_wait_timeout) {
        return true;
    }

    let force_outcome = run_stop_command(
        pid,
        "taskkill force stop",
        &["/pid", &pid_arg, "/t", "/f"],
        log,
    );
    if force_outcome.is_err() {
        let _ = child.kill();
    }

    let followup_wait = compute_followup_wait(
        timeout,
        Duration::from_millis(FORCE_STOP_WAIT_MAX_WINDOWS_MS),
    );
    log(&format!(
        "child graceful stop timed out, force-kill issued: pid={pid}, graceful={graceful_outcome:?}, force={force_outcome:?}, followup_wait_ms={}",
        followup_wait.as_millis(),
    ));
    wait_for_child_exit(child, followup_wait)
}

/// Signals a single process.
#[cfg(not(target_os = "windows"))]
pub fn signal_process<F>(pid: u32, signal: i32, label: &str, log: F) -> Result<(), String>
where
    F: Fn(&str) + Copy,
{
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return Err(format!("pid {pid} out of range"));
    };
    let result = unsafe {
        // Safety:
        // - kill only reads its arguments; an unknown pid yields ESRCH.
        libc::kill(raw_pid, signal)
    };
    if result == 0 {
        return Ok(());
    }
    let error = std::io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        return Err("process already gone".to_string());
    }
    log(&format!("{label} failed: pid={pid}, error={error}"));
    Err(format!("error={error}"))
}

/// Sends SIGTERM to the child (its whole process group when `whole_group` is set),
/// escalating to SIGKILL once `timeout` elapses. Returns true when the child is known to
/// have exited.
#[cfg(not(target_os = "windows"))]
pub fn stop_child_process_gracefully<F>(
    child: &mut Child,
    timeout: Duration,
    whole_group: bool,
    log: F,
) -> bool
where
    F: Fn(&str) + Copy,
{
    if matches!(child.try_wait(), Ok(Some(_))) {
        return true;
    }
    let pid = child.id();
    let send = |signal: i32, label: &str| {
        if whole_group {
            signal_process_group(pid, signal, label, log)
        } else {
            signal_process(pid, signal, label, log)
        }
    };

    let graceful_outcome = send(libc::SIGTERM, "graceful SIGTERM");
    let graceful_wait_timeout = resolve_graceful_wait_timeout(
        pid,
        timeout,
        timeout,
        &graceful_outcome,
        "graceful SIGTERM",
        log,
    );
    if wait_for_child_exit(child, graceful_wait_timeout) {
        return true;
    }

    let force_outcome = send(libc::SIGKILL, "force SIGKILL");
    if force_outcome.is_err() {
        let _ = child.kill();
    }

    let followup_wait = compute_followup_wait(
        timeout,
        Duration::from_millis(FORCE_STOP_WAIT_MAX_NON_WINDOWS_MS),
    );
    log(&format!(
        "child graceful stop timed out, force-kill issued: pid={pid}, graceful={graceful_outcome:?}, force={force_outcome:?}, followup_wait_ms={}",
        followup_wait.as_millis(),
    ));

    wait_for_child_exit(child, followup_wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn compute_followup_wait_respects_min_and_cap() {
        assert_eq!(
            compute_followup_wait(Duration::from_millis(0), Duration::from_millis(900)),
            Duration::ZERO
        );
        assert_eq!(
            compute_followup_wait(Duration::from_millis(100), Duration::from_millis(900)),
            Duration::from_millis(200)
        );
        assert_eq!(
            compute_followup_wait(Duration::from_millis(9_000), Duration::from_millis(900)),
            Duration::from_millis(900)
        );
    }

    #[test]
    fn resolve_graceful_wait_timeout_shortens_and_logs_on_failure() {
        let logs = Mutex::new(Vec::new());
        let graceful_outcome: Result<(), String> = Err("error=simulated failure".to_string());
        let wait = resolve_graceful_wait_timeout(
            42,
            Duration::from_millis(2_000),
            Duration::from_millis(350),
            &graceful_outcome,
            "taskkill graceful stop",
            |message| logs.lock().expect("lock logs").push(message.to_string()),
        );

        assert_eq!(wait, Duration::from_millis(350));
        let snapshot = logs.lock().expect("lock logs");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].contains("shorten graceful wait"));
    }

    #[test]
    fn resolve_graceful_wait_timeout_keeps_full_wait_on_success() {
        let wait = resolve_graceful_wait_timeout(
            7,
            Duration::from_millis(2_000),
            Duration::from_millis(350),
            &Ok(()),
            "killpg -TERM",
            |_| panic!("success must not log"),
        );
        assert_eq!(wait, Duration::from_millis(2_000));
    }

    #[cfg(unix)]
    #[test]
    fn stop_terminates_a_process_group_leader() {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let started = Instant::now();
        assert!(stop_child_process_gracefully(
            &mut child,
            Duration::from_secs(5),
            true,
            |_| {}
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
