//! Host-side collaborators: GPU and guest inventories, the hypervisor's
//! partition API, disk mounting and the registry tool.
//!
//! Everything in here sits behind an object-safe async trait so the
//! orchestrator can be driven by the PowerShell implementation in production
//! and by in-memory fakes in tests.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::disk::OsClass;

pub mod device_id;
pub mod metadata;
pub mod powershell;
pub mod registry;

/// First host build with native multi-partition GPU support.
pub const MODERN_HOST_BUILD: u32 = 22000;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A physical display adapter on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// PnP instance id, e.g. `PCI\VEN_10DE&DEV_2684&...`.
    pub instance_id: String,
    pub friendly_name: String,
    pub vendor: String,
    pub driver_version: String,
    /// Set only when the hypervisor exposes this device for partitioning.
    pub partitionable_name: Option<String>,
}

impl GpuDevice {
    pub fn is_partition_eligible(&self) -> bool {
        self.partitionable_name
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty())
    }

    /// Whether `id` names this device, in either PnP or partitionable form.
    pub fn matches(&self, id: &str) -> bool {
        let wanted = device_id::normalize_for_comparison(id);
        if wanted.is_empty() {
            return false;
        }
        device_id::normalize_for_comparison(&self.instance_id) == wanted
            || self
                .partitionable_name
                .as_deref()
                .is_some_and(|p| device_id::normalize_for_comparison(p) == wanted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    Running,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestOs {
    Windows,
    Linux,
    Unknown,
}

impl From<OsClass> for GuestOs {
    fn from(class: OsClass) -> Self {
        match class {
            OsClass::Windows => GuestOs::Windows,
            OsClass::Linux => GuestOs::Linux,
            OsClass::Other => GuestOs::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTarget {
    pub name: String,
    pub power_state: PowerState,
    pub os_class: GuestOs,
}

/// A GPU partition adapter attached to a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAdapter {
    pub id: String,
    /// Host device the adapter is bound to, when known.
    pub instance_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPlatform {
    /// One active GPU partition at a time; sibling GPUs must be disabled.
    Legacy,
    Modern,
}

impl HostPlatform {
    pub fn from_build(build: u32) -> Self {
        if build >= MODERN_HOST_BUILD {
            HostPlatform::Modern
        } else {
            HostPlatform::Legacy
        }
    }

    pub fn supports_multi_partition(self) -> bool {
        self == HostPlatform::Modern
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GpuInventory: Send + Sync {
    async fn host_gpus(&self) -> Result<Vec<GpuDevice>>;

    /// Enable or disable a PnP device. Repeating the current state is a no-op.
    async fn set_device_enabled(&self, instance_id: &str, enabled: bool) -> Result<()>;

    /// Driver files registered for the display adapter whose id matches
    /// `device_id` (empty when nothing matches).
    async fn installed_driver_files(&self, device_id: &str) -> Result<Vec<PathBuf>>;
}

#[async_trait]
pub trait GuestInventory: Send + Sync {
    async fn guest(&self, name: &str) -> Result<GuestTarget>;
    async fn start_guest(&self, name: &str) -> Result<()>;
    /// First IPv4 address reported for the guest's primary adapter.
    async fn guest_address(&self, name: &str) -> Result<Option<Ipv4Addr>>;
    async fn first_disk_path(&self, name: &str) -> Result<PathBuf>;
    async fn notes(&self, name: &str) -> Result<String>;
    async fn set_notes(&self, name: &str, notes: &str) -> Result<()>;
}

#[async_trait]
pub trait PartitionHost: Send + Sync {
    async fn host_platform(&self) -> Result<HostPlatform>;

    /// Guest-controlled caching plus 64 GiB high / 1 GiB low MMIO space.
    async fn prepare_guest_for_gpu(&self, guest: &str) -> Result<()>;

    /// Bind a GPU partition to `guest`. `instance_path` is `None` on legacy
    /// hosts, which pick the only enabled partitionable device.
    async fn attach_gpu_partition(&self, guest: &str, instance_path: Option<&str>) -> Result<()>;

    async fn gpu_adapters(&self, guest: &str) -> Result<Vec<GpuAdapter>>;
    async fn remove_gpu_partition(&self, guest: &str, adapter_id: &str) -> Result<()>;
}

#[async_trait]
pub trait DiskMounter: Send + Sync {
    /// Detach the image. Succeeds when it was not attached.
    async fn dismount(&self, image: &Path) -> Result<()>;

    /// Attach the image without mounting any volume; returns the disk number.
    async fn attach_without_letter(&self, image: &Path) -> Result<u32>;

    /// Path that opens the attached disk for raw sector reads.
    fn raw_device_path(&self, disk_number: u32) -> PathBuf;

    async fn used_drive_letters(&self) -> Result<BTreeSet<char>>;

    /// Attach the image (if needed) and give `partition_index` a drive letter.
    /// Returns the letter actually in effect, which may differ from
    /// `letter` when the partition already had one.
    async fn assign_drive_letter(&self, image: &Path, partition_index: u32, letter: char)
    -> Result<char>;

    async fn remove_drive_letter(&self, image: &Path, partition_index: u32, letter: char)
    -> Result<()>;

    /// Root directory of a mounted volume, e.g. `R:\`.
    fn drive_root(&self, letter: char) -> PathBuf;
}

/// Offline registry hive operations.
#[async_trait]
pub trait HiveTool: Send + Sync {
    async fn export_key(&self, key: &str, file: &Path) -> Result<()>;
    async fn load_hive(&self, key: &str, hive_file: &Path) -> Result<()>;
    async fn import_file(&self, file: &Path) -> Result<()>;
    async fn unload_hive(&self, key: &str) -> Result<()>;
}
