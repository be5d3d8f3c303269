//! Guest-side provisioning: offline injection for Windows, remote-shell
//! pipeline for Linux.

pub mod hive;
pub mod linux;
pub mod windows;

pub use linux::{
    InstallerStatus, LinuxGuestProvisioner, LinuxProvisionerSettings, LinuxTimeouts,
    ProvisionOutcome, ProvisioningSession, ScriptSource, scan_installer_output,
};
pub use windows::{WindowsGuestInjector, WindowsInjectorSettings, pick_free_drive_letter};
