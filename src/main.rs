#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod backend_config;
mod backend_host;
mod backend_runner;
mod cli;
mod http_probe;
mod in_process_supervisor;
mod lifecycle;
mod local_channel;
mod logging;
mod out_of_process_supervisor;
mod process_control;
mod process_group;
mod protocol;
mod readiness_channel;
mod runtime_paths;
mod service_manager;
mod shell;
mod single_instance;
mod supervisor;
mod ui_dispatch;
mod ui_state;

use clap::Parser;

use crate::{
    backend_config::ShellConfig,
    cli::{LaunchMode, ShellArgs},
    logging::{DesktopLogger, DESKTOP_LOG_MAX_BYTES, LOG_BACKUP_COUNT},
};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = ShellArgs::parse();
    let home_dir = runtime_paths::resolve_home_dir();
    let logger = DesktopLogger::to_file(
        logging::resolve_desktop_log_path(&home_dir),
        DESKTOP_LOG_MAX_BYTES,
        LOG_BACKUP_COUNT,
    );
    let launch_mode = args.launch_mode();
    logger.startup(&format!(
        "desktop process starting: version={}, mode={launch_mode:?}",
        env!("CARGO_PKG_VERSION")
    ));

    let config = ShellConfig::from_env(|message| logger.startup(&message));
    match launch_mode {
        LaunchMode::ConfigureService(mode) => {
            service_manager::configure_service_start_mode(&config.service_name, mode, &logger)
        }
        LaunchMode::HostBackend => backend_runner::run_hosted_backend(&config, logger),
        LaunchMode::Shell { tray_only } => shell::run_shell(&config, logger, tray_only),
    }
}
