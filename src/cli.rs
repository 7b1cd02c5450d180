use clap::Parser;

use crate::service_manager::ServiceStartMode;

#[derive(Debug, Parser)]
#[command(name = "kolibri-desktop", version, about = "Kolibri desktop shell")]
pub struct ShellArgs {
    /// Host the backend headlessly and answer readiness requests.
    #[arg(long, conflicts_with_all = ["tray_only", "configure_service"])]
    pub run_as_server: bool,

    /// Start without showing the main window.
    #[arg(long, visible_alias = "background")]
    pub tray_only: bool,

    /// Set the background service start mode and exit.
    #[arg(long, value_enum, value_name = "MODE", conflicts_with = "tray_only")]
    pub configure_service: Option<ServiceStartMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Shell { tray_only: bool },
    HostBackend,
    ConfigureService(ServiceStartMode),
}

impl ShellArgs {
    pub fn launch_mode(&self) -> LaunchMode {
        if self.run_as_server {
            return LaunchMode::HostBackend;
        }
        if let Some(mode) = self.configure_service {
            return LaunchMode::ConfigureService(mode);
        }
        LaunchMode::Shell {
            tray_only: self.tray_only,
        }
    }
}
