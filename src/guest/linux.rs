//! Remote-shell provisioning pipeline for Linux guests.
//!
//! ```text
//! 1 environment init ─▶ 2 proxy (optional) ─▶ 3 asset transfer
//!     ─▶ 4 kernel module install ─┬─▶ 5 finalize ─▶ Completed
//!                                 └─▶ reboot + wait ─▶ RebootRequired
//! ```
//!
//! Phases run strictly in order. From phase 4 on, a command that times out
//! is retried; any other failure aborts the attempt.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::gpu::{DriverSourceLocation, locate_driver_source};
use crate::host::GpuInventory;
use crate::progress::{CancelToken, Progress};
use crate::remote::{ProxyEndpoint, RemoteShell, SshCredentials, remote_join, shell_quote};

pub const INSTALL_SCRIPT: &str = "install_dxgkrnl.sh";
pub const GRAPHICS_SCRIPT: &str = "setup_graphics.sh";
pub const CONFIGURE_SCRIPT: &str = "configure_system.sh";

const SUCCESS_SENTINEL: &str = "STATUS: SUCCESS";
const REBOOT_SENTINEL: &str = "STATUS: REBOOT_REQUIRED";

/// Where the installer scripts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Fetched on the guest with `wget` from this base URL (trailing `/`).
    Remote(String),
    /// Uploaded from a host directory during asset transfer.
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LinuxTimeouts {
    pub setup_command: Duration,
    pub script_download: Duration,
    pub chmod: Duration,
    pub kernel_module_install: Duration,
    pub graphics_setup: Duration,
    pub system_configure: Duration,
    pub reboot_command: Duration,
}

impl Default for LinuxTimeouts {
    fn default() -> Self {
        Self {
            setup_command: Duration::from_secs(30),
            script_download: Duration::from_secs(2 * 60),
            chmod: Duration::from_secs(10),
            kernel_module_install: Duration::from_secs(60 * 60),
            graphics_setup: Duration::from_secs(20 * 60),
            system_configure: Duration::from_secs(5 * 60),
            reboot_command: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinuxProvisionerSettings {
    /// Scratch directory name under the remote home directory.
    pub deploy_dir_name: String,
    pub driver_repository: PathBuf,
    /// Host directory whose files are uploaded to `<deploy>/lib`.
    pub support_lib_dir: Option<PathBuf>,
    pub scripts: ScriptSource,
    pub timeouts: LinuxTimeouts,
    pub reboot_poll_interval: Duration,
    pub reboot_wait: Duration,
    /// Total tries for a command that keeps timing out.
    pub max_command_attempts: u32,
}

/// Result of a provisioning attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Completed,
    /// The guest rebooted mid-install and is reachable again; run the
    /// pipeline once more.
    RebootRequired,
}

impl fmt::Display for ProvisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionOutcome::Completed => f.write_str("OK"),
            ProvisionOutcome::RebootRequired => f.write_str("REBOOT_REQUIRED_RETRY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerStatus {
    Success,
    RebootRequired,
    /// Neither sentinel was printed.
    Unknown,
}

/// Classify the kernel-module installer's captured output. A reboot request
/// wins over success if both appear.
pub fn scan_installer_output(output: &str) -> InstallerStatus {
    if output.contains(REBOOT_SENTINEL) {
        InstallerStatus::RebootRequired
    } else if output.contains(SUCCESS_SENTINEL) {
        InstallerStatus::Success
    } else {
        InstallerStatus::Unknown
    }
}

/// Per-attempt state, dropped when the attempt ends.
#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub remote_home_dir: String,
    pub remote_deploy_dir: String,
    pub proxy: Option<ProxyEndpoint>,
    pub install_graphics: bool,
    pub cancel: CancelToken,
}

impl ProvisioningSession {
    fn script(&self, name: &str) -> String {
        remote_join(&self.remote_deploy_dir, name)
    }

    fn scripts(&self) -> Vec<&'static str> {
        let mut scripts = vec![INSTALL_SCRIPT];
        if self.install_graphics {
            scripts.push(GRAPHICS_SCRIPT);
        }
        scripts.push(CONFIGURE_SCRIPT);
        scripts
    }
}

pub struct LinuxGuestProvisioner {
    gpus: Arc<dyn GpuInventory>,
    settings: LinuxProvisionerSettings,
}

impl LinuxGuestProvisioner {
    pub fn new(gpus: Arc<dyn GpuInventory>, settings: LinuxProvisionerSettings) -> Self {
        Self { gpus, settings }
    }

    /// Run one attempt of the pipeline against `shell`.
    pub async fn provision(
        &self,
        shell: &dyn RemoteShell,
        credentials: &SshCredentials,
        device_id: &str,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Result<ProvisionOutcome> {
        cancel.check()?;
        progress.line(format!("[1/5] Initialising remote environment on {}", shell.endpoint()));
        let session = self.init_environment(shell, credentials, progress, cancel).await?;

        cancel.check()?;
        if let Some(proxy) = &session.proxy {
            progress.line(format!("[2/5] Configuring proxy {}", proxy.url()));
            self.configure_proxy(shell, &session, proxy, progress).await?;
        }

        cancel.check()?;
        progress.line("[3/5] Transferring driver assets");
        self.transfer_assets(shell, &session, device_id, progress).await?;

        cancel.check()?;
        progress.line("[4/5] Installing GPU kernel module");
        if self.install_kernel_module(shell, &session, progress).await? == InstallerStatus::RebootRequired {
            self.reboot_and_wait(shell, credentials, &session, progress).await?;
            return Ok(ProvisionOutcome::RebootRequired);
        }

        cancel.check()?;
        progress.line("[5/5] Finalising guest configuration");
        self.finalize(shell, &session, progress).await?;
        Ok(ProvisionOutcome::Completed)
    }

    async fn init_environment(
        &self,
        shell: &dyn RemoteShell,
        credentials: &SshCredentials,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Result<ProvisioningSession> {
        let timeout = Some(self.settings.timeouts.setup_command);
        let home = shell.execute_one("pwd", &Progress::silent(), timeout).await?;
        let home = home.trim().lines().last().unwrap_or_default().trim().to_string();
        if home.is_empty() {
            return Err(Error::Precondition("could not determine the remote home directory".into()));
        }

        let deploy = remote_join(&home, &self.settings.deploy_dir_name);
        shell
            .execute_one(
                &format!(
                    "mkdir -p {} {}",
                    shell_quote(&remote_join(&deploy, "drivers")),
                    shell_quote(&remote_join(&deploy, "lib"))
                ),
                progress,
                timeout,
            )
            .await?;
        info!(home = %home, deploy = %deploy, "remote environment ready");
        progress.line(format!("Deployment directory: {deploy}"));

        Ok(ProvisioningSession {
            remote_home_dir: home,
            remote_deploy_dir: deploy,
            proxy: credentials.proxy.clone(),
            install_graphics: credentials.install_graphics,
            cancel: cancel.clone(),
        })
    }

    async fn configure_proxy(
        &self,
        shell: &dyn RemoteShell,
        session: &ProvisioningSession,
        proxy: &ProxyEndpoint,
        progress: &Progress,
    ) -> Result<()> {
        let url = proxy.url();
        let apt_file = remote_join(&session.remote_home_dir, "99proxy");
        let env_file = remote_join(&session.remote_home_dir, "proxy_env");

        shell
            .write_text_file(
                &format!("Acquire::http::Proxy \"{url}\";\nAcquire::https::Proxy \"{url}\";\n"),
                &apt_file,
            )
            .await?;
        shell
            .write_text_file(
                &format!(
                    "\nexport http_proxy=\"{url}\"\nexport https_proxy=\"{url}\"\nexport no_proxy=\"localhost,127.0.0.1\"\n"
                ),
                &env_file,
            )
            .await?;

        let commands = [
            format!("sudo mv {} /etc/apt/apt.conf.d/99proxy", shell_quote(&apt_file)),
            format!("sudo sh -c 'cat {} >> /etc/environment'", env_file),
            format!("rm {}", shell_quote(&env_file)),
            format!("export http_proxy={url}"),
            format!("export https_proxy={url}"),
        ];
        for command in &commands {
            session.cancel.check()?;
            shell
                .execute_one(command, progress, Some(self.settings.timeouts.setup_command))
                .await?;
        }
        Ok(())
    }

    async fn transfer_assets(
        &self,
        shell: &dyn RemoteShell,
        session: &ProvisioningSession,
        device_id: &str,
        progress: &Progress,
    ) -> Result<()> {
        let source =
            locate_driver_source(self.gpus.as_ref(), device_id, &self.settings.driver_repository).await;
        match &source {
            DriverSourceLocation::Precise(_) => {
                progress.line(format!("Located driver package {}", source.folder_name()))
            }
            DriverSourceLocation::Repository(_) => {
                progress.line("Driver package not identified, uploading the whole driver store")
            }
        }

        let drivers = remote_join(&remote_join(&session.remote_deploy_dir, "drivers"), &source.folder_name());
        shell.upload_directory(source.path(), &drivers).await?;
        progress.line("Host drivers uploaded");

        session.cancel.check()?;
        if let Some(lib_dir) = &self.settings.support_lib_dir {
            self.upload_support_libraries(shell, session, lib_dir).await?;
            progress.line("Support libraries uploaded");
        }

        if let ScriptSource::Local(dir) = &self.settings.scripts {
            for script in session.scripts() {
                session.cancel.check()?;
                shell
                    .upload_file(&dir.join(script), &session.script(script))
                    .await?;
            }
            progress.line("Installer scripts uploaded");
        }
        Ok(())
    }

    async fn upload_support_libraries(
        &self,
        shell: &dyn RemoteShell,
        session: &ProvisioningSession,
        lib_dir: &Path,
    ) -> Result<()> {
        let entries = match std::fs::read_dir(lib_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %lib_dir.display(), error = %e, "support library directory unavailable, skipping");
                return Ok(());
            }
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let remote_lib = remote_join(&session.remote_deploy_dir, "lib");
        for file in files {
            session.cancel.check()?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            shell.upload_file(&file, &remote_join(&remote_lib, &name)).await?;
        }
        Ok(())
    }

    async fn install_kernel_module(
        &self,
        shell: &dyn RemoteShell,
        session: &ProvisioningSession,
        progress: &Progress,
    ) -> Result<InstallerStatus> {
        let timeouts = &self.settings.timeouts;

        if let ScriptSource::Remote(base_url) = &self.settings.scripts {
            for script in session.scripts() {
                let command = format!(
                    "wget -O {} {}{}",
                    shell_quote(&session.script(script)),
                    base_url,
                    script
                );
                self.run_with_retry(shell, &command, timeouts.script_download, progress, &session.cancel)
                    .await?;
            }
        }
        let chmod = format!("chmod +x {}/*.sh", shell_quote(&session.remote_deploy_dir));
        self.run_with_retry(shell, &chmod, timeouts.chmod, progress, &session.cancel)
            .await?;

        progress.line("Building the kernel module, this can take a while");
        let install = format!("sudo {}", shell_quote(&session.script(INSTALL_SCRIPT)));
        let output = self
            .run_with_retry(shell, &install, timeouts.kernel_module_install, progress, &session.cancel)
            .await?;

        match scan_installer_output(&output) {
            InstallerStatus::Unknown => Err(Error::Command {
                command: install,
                exit_code: 0,
                stderr: format!("installer did not report '{SUCCESS_SENTINEL}'"),
            }),
            status => {
                info!(?status, "kernel module installer finished");
                Ok(status)
            }
        }
    }

    async fn reboot_and_wait(
        &self,
        shell: &dyn RemoteShell,
        credentials: &SshCredentials,
        session: &ProvisioningSession,
        progress: &Progress,
    ) -> Result<()> {
        progress.line("Kernel updated, rebooting the guest");
        // The session usually drops before `reboot` returns.
        if let Err(e) = shell
            .execute_one("sudo reboot", progress, Some(self.settings.timeouts.reboot_command))
            .await
        {
            info!(error = %e, "reboot command ended without a clean exit");
        }

        progress.line("Waiting for the guest to come back online");
        let back = shell
            .wait_until_reachable(
                self.settings.reboot_wait,
                self.settings.reboot_poll_interval,
                &session.cancel,
            )
            .await;
        session.cancel.check()?;
        if !back {
            return Err(Error::GuestUnreachable {
                host: credentials.host.clone(),
                port: credentials.port,
                timeout: self.settings.reboot_wait,
            });
        }
        progress.line("Guest is back online");
        Ok(())
    }

    async fn finalize(
        &self,
        shell: &dyn RemoteShell,
        session: &ProvisioningSession,
        progress: &Progress,
    ) -> Result<()> {
        let timeouts = &self.settings.timeouts;
        if session.install_graphics {
            progress.line("Configuring the graphics stack");
            let command = format!("sudo {}", shell_quote(&session.script(GRAPHICS_SCRIPT)));
            self.run_with_retry(shell, &command, timeouts.graphics_setup, progress, &session.cancel)
                .await?;
        }

        progress.line("Applying system configuration");
        let mode = if session.install_graphics {
            "enable_graphics"
        } else {
            "no_graphics"
        };
        let command = format!("sudo {} {mode}", shell_quote(&session.script(CONFIGURE_SCRIPT)));
        self.run_with_retry(shell, &command, timeouts.system_configure, progress, &session.cancel)
            .await?;

        session.cancel.check()?;
        progress.line("Rebooting the guest to finish");
        shell.execute_fire_and_forget("sudo reboot").await;
        Ok(())
    }

    /// Run `command`, re-running it only when it times out, up to
    /// `max_command_attempts` tries in total.
    async fn run_with_retry(
        &self,
        shell: &dyn RemoteShell,
        command: &str,
        timeout: Duration,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Result<String> {
        let max_attempts = self.settings.max_command_attempts.max(1);
        let mut attempt = 1;
        loop {
            cancel.check()?;
            match shell.execute_one(command, progress, Some(timeout)).await {
                Err(e) if e.is_timeout() && attempt < max_attempts => {
                    warn!(command, attempt, "command timed out, retrying");
                    progress.line(format!(
                        "Command timed out, retrying (attempt {}/{max_attempts})",
                        attempt + 1
                    ));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
