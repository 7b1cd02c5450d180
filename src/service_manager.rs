#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::{
    io::Read,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use clap::ValueEnum;

use crate::{logging::DesktopLogger, process_control};

const SERVICE_TOOL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceStartMode {
    Auto,
    Disabled,
}

impl ServiceStartMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Disabled => "disabled",
        }
    }
}

/// Answers "is the backend already hosted by the platform's service manager?".
pub trait ServiceProbe: Send + Sync {
    fn is_service_running(&self, service_name: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct SystemServiceProbe {
    logger: DesktopLogger,
}

impl SystemServiceProbe {
    pub fn new(logger: DesktopLogger) -> Self {
        Self { logger }
    }
}

impl ServiceProbe for SystemServiceProbe {
    fn is_service_running(&self, service_name: &str) -> bool {
        is_service_running(service_name, &self.logger)
    }
}

struct ToolOutput {
    code: Option<i32>,
    stdout: String,
}

fn run_service_tool(program: &str, args: &[&str], logger: &DesktopLogger) -> Option<ToolOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    #[cfg(target_os = "windows")]
    command.creation_flags(process_control::WINDOWS_CREATE_NO_WINDOW);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            logger.runtime(&format!("failed to run {program} {args:?}: {error}"));
            return None;
        }
    };
    // Read while waiting: a full pipe would block the tool's exit.
    let reader = child.stdout.take().and_then(|mut pipe| {
        thread::Builder::new()
            .name("service-tool-stdout".to_string())
            .spawn(move || {
                let mut stdout = String::new();
                let _ = pipe.read_to_string(&mut stdout);
                stdout
            })
            .ok()
    });
    if !process_control::wait_for_child_exit(&mut child, SERVICE_TOOL_TIMEOUT) {
        logger.runtime(&format!(
            "{program} {args:?} timed out after {}ms",
            SERVICE_TOOL_TIMEOUT.as_millis()
        ));
        let _ = child.kill();
        let _ = child.wait();
        return None;
    }

    let code = child.wait().ok().and_then(|status| status.code());
    let stdout = reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();
    Some(ToolOutput { code, stdout })
}

/// `sc query` prints a `STATE : 4  RUNNING` line for a live service.
pub fn parse_sc_query_running(output: &str) -> bool {
    output.lines().any(|line| {
        let upper = line.to_ascii_uppercase();
        upper.contains("STATE") && upper.contains("RUNNING")
    })
}

#[cfg(target_os = "windows")]
pub fn is_service_running(service_name: &str, logger: &DesktopLogger) -> bool {
    match run_service_tool("sc", &["query", service_name], logger) {
        Some(output) if output.code == Some(0) => parse_sc_query_running(&output.stdout),
        _ => false,
    }
}

#[cfg(not(target_os = "windows"))]
pub fn is_service_running(service_name: &str, logger: &DesktopLogger) -> bool {
    matches!(
        run_service_tool("systemctl", &["is-active", "--quiet", service_name], logger),
        Some(ToolOutput { code: Some(0), .. })
    )
}

/// Switches the service start type. Returns the tool's exit code (0 on success).
pub fn configure_service_start_mode(
    service_name: &str,
    mode: ServiceStartMode,
    logger: &DesktopLogger,
) -> i32 {
    #[cfg(target_os = "windows")]
    let (program, args) = ("sc", vec!["config", service_name, "start=", mode.as_str()]);
    #[cfg(not(target_os = "windows"))]
    let (program, args) = (
        "systemctl",
        vec![
            match mode {
                ServiceStartMode::Auto => "enable",
                ServiceStartMode::Disabled => "disable",
            },
            service_name,
        ],
    );

    match run_service_tool(program, &args, logger) {
        Some(ToolOutput { code: Some(0), .. }) => {
            logger.runtime(&format!(
                "service {service_name} start mode set to {}",
                mode.as_str()
            ));
            0
        }
        Some(ToolOutput { code, stdout }) => {
            let code = code.unwrap_or(1);
            logger.runtime(&format!(
                "failed to set service {service_name} start mode to {}: code={code}, output={}",
                mode.as_str(),
                stdout.trim()
            ));
            code
        }
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sc_query_running_state_is_detected() {
        let running = "\r\nSERVICE_NAME: Kolibri\r\n        TYPE               : 10  WIN32_OWN_PROCESS\r\n        STATE              : 4  RUNNING\r\n";
        assert!(parse_sc_query_running(running));

        let stopped = "SERVICE_NAME: Kolibri\r\n        STATE              : 1  STOPPED\r\n";
        assert!(!parse_sc_query_running(stopped));
        assert!(!parse_sc_query_running(""));
    }

    #[test]
    fn start_mode_parses_from_cli_values() {
        assert_eq!(
            ServiceStartMode::from_str("auto", true).expect("auto"),
            ServiceStartMode::Auto
        );
        assert_eq!(
            ServiceStartMode::from_str("disabled", true).expect("disabled"),
            ServiceStartMode::Disabled
        );
        assert!(ServiceStartMode::from_str("manual", true).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn large_tool_output_does_not_stall() {
        let logger = DesktopLogger::in_memory();
        let started = std::time::Instant::now();
        let output = run_service_tool(
            "sh",
            &["-c", "head -c 200000 /dev/zero | tr '\\000' x"],
            &logger,
        )
        .expect("tool ran");
        assert!(started.elapsed() < SERVICE_TOOL_TIMEOUT);
        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout.len(), 200_000);
    }

    #[test]
    fn unknown_service_is_not_running() {
        let logger = DesktopLogger::in_memory();
        assert!(!is_service_running(
            "kolibri-desktop-test-service-that-does-not-exist",
            &logger
        ));
    }
}
