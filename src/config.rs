//! User configuration loaded from `config.toml`.
//!
//! Every section and field is optional; a missing file means defaults.
//! Durations are written in seconds.
//!
//! ```toml
//! [host]
//! platform = "auto"            # auto | legacy | modern
//! driver_repository = 'C:\Windows\System32\DriverStore\FileRepository'
//!
//! [linux]
//! script_base_url = "https://example.org/scripts/"
//! kernel_module_install_secs = 3600
//!
//! [ssh]
//! username = "dev"
//! port = 22
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::guest::{LinuxProvisionerSettings, LinuxTimeouts, ScriptSource, WindowsInjectorSettings};
use crate::host::HostPlatform;
use crate::orchestrator::OrchestratorSettings;
use crate::remote::SshOptions;

const DEFAULT_DRIVER_REPOSITORY: &str = r"C:\Windows\System32\DriverStore\FileRepository";
const DEFAULT_SCRIPT_BASE_URL: &str =
    "https://raw.githubusercontent.com/Justsenger/ExHyperV/main/src/Linux/script/";

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformSetting {
    /// Detect from the host build number.
    #[default]
    Auto,
    Legacy,
    Modern,
}

impl PlatformSetting {
    pub fn forced(self) -> Option<HostPlatform> {
        match self {
            PlatformSetting::Auto => None,
            PlatformSetting::Legacy => Some(HostPlatform::Legacy),
            PlatformSetting::Modern => Some(HostPlatform::Modern),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub platform: PlatformSetting,
    pub driver_repository: PathBuf,
    /// Files uploaded to `<deploy>/lib` on Linux guests.
    pub support_lib_dir: Option<PathBuf>,
    /// Pin a PowerShell executable instead of probing `pwsh`/`powershell`.
    pub powershell: Option<PathBuf>,
    pub reg_program: PathBuf,
    /// Scratch directory for registry exports; the cache directory if unset.
    pub temp_dir: Option<PathBuf>,
    pub disable_settle_secs: u64,
    pub enable_settle_secs: u64,
    pub dismount_settle_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            platform: PlatformSetting::Auto,
            driver_repository: PathBuf::from(DEFAULT_DRIVER_REPOSITORY),
            support_lib_dir: None,
            powershell: None,
            reg_program: PathBuf::from("reg.exe"),
            temp_dir: None,
            disable_settle_secs: 2,
            enable_settle_secs: 1,
            dismount_settle_secs: 1,
            progress_interval_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxConfig {
    pub deploy_dir_name: String,
    /// Base URL the guest downloads installer scripts from.
    pub script_base_url: String,
    /// Upload installer scripts from here instead of downloading them.
    pub script_dir: Option<PathBuf>,
    pub setup_command_secs: u64,
    pub script_download_secs: u64,
    pub chmod_secs: u64,
    pub kernel_module_install_secs: u64,
    pub graphics_setup_secs: u64,
    pub system_configure_secs: u64,
    pub reboot_command_secs: u64,
    pub reboot_poll_secs: u64,
    pub reboot_wait_secs: u64,
    /// How long a freshly started guest gets to open its shell port.
    pub boot_wait_secs: u64,
    pub max_command_attempts: u32,
}

impl Default for LinuxConfig {
    fn default() -> Self {
        let timeouts = LinuxTimeouts::default();
        Self {
            deploy_dir_name: "gpu_pv_deploy".into(),
            script_base_url: DEFAULT_SCRIPT_BASE_URL.into(),
            script_dir: None,
            setup_command_secs: timeouts.setup_command.as_secs(),
            script_download_secs: timeouts.script_download.as_secs(),
            chmod_secs: timeouts.chmod.as_secs(),
            kernel_module_install_secs: timeouts.kernel_module_install.as_secs(),
            graphics_setup_secs: timeouts.graphics_setup.as_secs(),
            system_configure_secs: timeouts.system_configure.as_secs(),
            reboot_command_secs: timeouts.reboot_command.as_secs(),
            reboot_poll_secs: 5,
            reboot_wait_secs: 60,
            boot_wait_secs: 120,
            max_command_attempts: 2,
        }
    }
}

impl LinuxConfig {
    pub fn timeouts(&self) -> LinuxTimeouts {
        LinuxTimeouts {
            setup_command: secs(self.setup_command_secs),
            script_download: secs(self.script_download_secs),
            chmod: secs(self.chmod_secs),
            kernel_module_install: secs(self.kernel_module_install_secs),
            graphics_setup: secs(self.graphics_setup_secs),
            system_configure: secs(self.system_configure_secs),
            reboot_command: secs(self.reboot_command_secs),
        }
    }

    pub fn script_source(&self) -> ScriptSource {
        match &self.script_dir {
            Some(dir) => ScriptSource::Local(dir.clone()),
            None if self.script_base_url.ends_with('/') => {
                ScriptSource::Remote(self.script_base_url.clone())
            }
            None => ScriptSource::Remote(format!("{}/", self.script_base_url)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub port: u16,
    pub username: Option<String>,
    pub connect_timeout_secs: u64,
    pub ssh_program: PathBuf,
    pub scp_program: PathBuf,
    pub sshpass_program: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        let options = SshOptions::default();
        Self {
            port: 22,
            username: None,
            connect_timeout_secs: options.connect_timeout.as_secs(),
            ssh_program: options.ssh_program,
            scp_program: options.scp_program,
            sshpass_program: options.sshpass_program,
        }
    }
}

impl SshConfig {
    pub fn options(&self) -> SshOptions {
        SshOptions {
            ssh_program: self.ssh_program.clone(),
            scp_program: self.scp_program.clone(),
            sshpass_program: self.sshpass_program.clone(),
            connect_timeout: secs(self.connect_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub linux: LinuxConfig,
    pub ssh: SshConfig,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Orchestrator settings; `scratch_dir` is used when `host.temp_dir` is unset.
    pub fn orchestrator_settings(&self, scratch_dir: &Path) -> OrchestratorSettings {
        let host = &self.host;
        let linux = &self.linux;
        OrchestratorSettings {
            windows: WindowsInjectorSettings {
                driver_repository: host.driver_repository.clone(),
                temp_dir: host.temp_dir.clone().unwrap_or_else(|| scratch_dir.to_path_buf()),
                progress_interval: Duration::from_millis(host.progress_interval_ms),
                dismount_settle: secs(host.dismount_settle_secs),
            },
            linux: LinuxProvisionerSettings {
                deploy_dir_name: linux.deploy_dir_name.clone(),
                driver_repository: host.driver_repository.clone(),
                support_lib_dir: host.support_lib_dir.clone(),
                scripts: linux.script_source(),
                timeouts: linux.timeouts(),
                reboot_poll_interval: secs(linux.reboot_poll_secs),
                reboot_wait: secs(linux.reboot_wait_secs),
                max_command_attempts: linux.max_command_attempts,
            },
            disable_settle: secs(host.disable_settle_secs),
            enable_settle: secs(host.enable_settle_secs),
            guest_boot_timeout: secs(linux.boot_wait_secs),
            port_poll_interval: secs(linux.reboot_poll_secs),
            port_connect_timeout: Duration::from_secs(2),
        }
    }
}
