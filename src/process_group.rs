//! Child processes tied to a kill-on-release group: a Job object on Windows, a process
//! group (plus `PR_SET_PDEATHSIG` on Linux) on POSIX.

use std::{
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus},
    time::Duration,
};

use crate::{logging::DesktopLogger, process_control};

/// Where a spawned child lives relative to the spawning process's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMembership {
    /// The child leads a new group that is torn down with it.
    Own,
    /// The child stays in the spawner's group, so whoever tears that group down also
    /// reaches this child. Stops then target the child alone.
    Inherit,
}

/// Prepares `command` so the spawned child dies with the parent and, for
/// [`GroupMembership::Own`], leads its own group.
#[cfg(unix)]
pub fn configure_command(command: &mut Command, membership: GroupMembership) {
    use std::os::unix::process::CommandExt;

    if membership == GroupMembership::Own {
        command.process_group(0);
    }
    set_parent_death_signal(command);
}

/// The death signal fires when the *spawning thread* exits, so children must be spawned
/// from a thread that outlives them.
#[cfg(target_os = "linux")]
fn set_parent_death_signal(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    unsafe {
        // Safety:
        // - The closure runs between fork and exec and only calls async-signal-safe prctl.
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal(_command: &mut Command) {}

/// Job objects nest, so both memberships get their own kill-on-close job on Windows.
#[cfg(windows)]
pub fn configure_command(command: &mut Command, _membership: GroupMembership) {
    use std::os::windows::process::CommandExt;

    command.creation_flags(process_control::WINDOWS_CREATE_NO_WINDOW);
}

#[cfg(unix)]
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: u32,
}

#[cfg(unix)]
impl ProcessGroup {
    pub fn attach(child: &Child, membership: GroupMembership) -> Result<Option<Self>, String> {
        Ok(match membership {
            GroupMembership::Own => Some(Self { pgid: child.id() }),
            GroupMembership::Inherit => None,
        })
    }

    /// Kills whatever is left in the group. Members that already exited are ignored.
    pub fn release(self, logger: &DesktopLogger) {
        let _ = process_control::signal_process_group(
            self.pgid,
            libc::SIGKILL,
            "release process group",
            |message| logger.shutdown(message),
        );
        logger.shutdown(&format!("released process group {}", self.pgid));
    }
}

#[cfg(windows)]
#[derive(Debug)]
pub struct ProcessGroup {
    job: std::os::windows::io::OwnedHandle,
}

#[cfg(windows)]
impl ProcessGroup {
    pub fn attach(child: &Child, _membership: GroupMembership) -> Result<Option<Self>, String> {
        use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
        use std::ptr;
        use windows_sys::Win32::System::JobObjects::{
            AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
            SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
            JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        };

        let raw_job = unsafe {
            // Safety:
            // - Anonymous job with default security; no pointers are retained.
            CreateJobObjectW(ptr::null(), ptr::null())
        };
        if raw_job.is_null() {
            return Err(format!(
                "CreateJobObjectW failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        // Safety:
        // - `CreateJobObjectW` returned a valid handle that nobody else owns.
        let job = unsafe { OwnedHandle::from_raw_handle(raw_job) };

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe {
            // Safety:
            // - Zero-initialization is valid for this plain-data struct.
            std::mem::zeroed()
        };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let configured = unsafe {
            // Safety:
            // - `info` is fully initialized and its size matches the information class.
            SetInformationJobObject(
                job.as_raw_handle(),
                JobObjectExtendedLimitInformation,
                (&info as *const JOBOBJECT_EXTENDED_LIMIT_INFORMATION).cast(),
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if configured == 0 {
            return Err(format!(
                "SetInformationJobObject failed: {}",
                std::io::Error::last_os_error()
            ));
        }

        let assigned = unsafe {
            // Safety:
            // - Both handles are valid; the child handle is owned by `child`.
            AssignProcessToJobObject(job.as_raw_handle(), child.as_raw_handle())
        };
        if assigned == 0 {
            return Err(format!(
                "AssignProcessToJobObject failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(Some(Self { job }))
    }

    /// Closing the last job handle terminates every process still assigned to it.
    pub fn release(self, logger: &DesktopLogger) {
        drop(self.job);
        logger.shutdown("released job object");
    }
}

/// One child process plus the group that guarantees its cleanup.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    group: Option<ProcessGroup>,
    membership: GroupMembership,
    label: &'static str,
    logger: DesktopLogger,
}

impl SupervisedProcess {
    pub fn spawn(
        command: Command,
        label: &'static str,
        logger: DesktopLogger,
    ) -> Result<Self, String> {
        Self::spawn_with(command, label, GroupMembership::Own, logger)
    }

    pub fn spawn_with(
        mut command: Command,
        label: &'static str,
        membership: GroupMembership,
        logger: DesktopLogger,
    ) -> Result<Self, String> {
        configure_command(&mut command, membership);
        let mut child = command
            .spawn()
            .map_err(|error| format!("Failed to spawn {label} with {command:?}: {error}"))?;
        let group = match ProcessGroup::attach(&child, membership) {
            Ok(group) => group,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("Failed to attach {label} to a process group: {error}"));
            }
        };
        logger.startup(&format!("spawned {label}: pid={}", child.id()));
        Ok(Self {
            child,
            group,
            membership,
            label,
            logger,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, String> {
        self.child
            .try_wait()
            .map_err(|error| format!("Failed to poll {} status: {error}", self.label))
    }

    /// Graceful stop with escalation. Never fails; the outcome is logged.
    pub fn stop(&mut self, timeout: Duration) {
        let logger = self.logger.clone();
        let exited = process_control::stop_child_process_gracefully(
            &mut self.child,
            timeout,
            self.membership == GroupMembership::Own,
            |message| logger.shutdown(message),
        );
        if exited {
            logger.shutdown(&format!("{} exited: pid={}", self.label, self.child.id()));
        } else {
            logger.shutdown(&format!(
                "{} did not exit after force stop: pid={}",
                self.label,
                self.child.id()
            ));
        }
    }

    pub fn release_group(&mut self) {
        if let Some(group) = self.group.take() {
            group.release(&self.logger);
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.release_group();
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}
