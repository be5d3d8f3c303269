//! Single-partition exclusivity on legacy hosts.
//!
//! Legacy hosts bind a new partition to whichever partitionable GPU is
//! enabled, so every other eligible GPU is disabled for the duration of the
//! attach and re-enabled afterwards.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::host::{GpuDevice, GpuInventory};
use crate::progress::Progress;

/// Devices disabled by one [`ExclusivityCoordinator::reserve`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reservation {
    disabled: Vec<String>,
    failed: Vec<String>,
}

impl Reservation {
    /// Instance ids currently held disabled by this reservation.
    pub fn disabled_ids(&self) -> &[String] {
        &self.disabled
    }

    /// Siblings that could not be disabled.
    pub fn failed_ids(&self) -> &[String] {
        &self.failed
    }

    /// Some sibling stayed enabled, so the assignment may land elsewhere or
    /// not persist across host reboots.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.disabled.is_empty()
    }
}

pub struct ExclusivityCoordinator {
    inventory: Arc<dyn GpuInventory>,
    /// Wait after disabling before the attach is issued.
    disable_settle: Duration,
    /// Wait before re-enabling.
    enable_settle: Duration,
}

impl ExclusivityCoordinator {
    pub fn new(inventory: Arc<dyn GpuInventory>, disable_settle: Duration, enable_settle: Duration) -> Self {
        Self {
            inventory,
            disable_settle,
            enable_settle,
        }
    }

    /// Disable every partition-eligible device in `all` other than `target`.
    ///
    /// Never fails: a sibling that cannot be disabled is recorded in
    /// [`Reservation::failed_ids`] and the reservation proceeds.
    pub async fn reserve(&self, target: &GpuDevice, all: &[GpuDevice], progress: &Progress) -> Reservation {
        let mut reservation = Reservation::default();

        let siblings = all
            .iter()
            .filter(|d| d.is_partition_eligible() && !d.matches(&target.instance_id));

        for device in siblings {
            match self.inventory.set_device_enabled(&device.instance_id, false).await {
                Ok(()) => {
                    info!(device = %device.instance_id, "sibling GPU disabled");
                    progress.line(format!("Temporarily disabled {}", device.friendly_name));
                    reservation.disabled.push(device.instance_id.clone());
                }
                Err(e) => {
                    warn!(device = %device.instance_id, error = %e, "could not disable sibling GPU");
                    reservation.failed.push(device.instance_id.clone());
                }
            }
        }

        if !reservation.disabled.is_empty() {
            tokio::time::sleep(self.disable_settle).await;
        }
        reservation
    }

    /// Re-enable everything `reservation` disabled.
    ///
    /// Successfully restored devices are removed from the reservation, so a
    /// second call only retries what failed the first time.
    pub async fn release(&self, reservation: &mut Reservation) {
        if reservation.disabled.is_empty() {
            return;
        }
        tokio::time::sleep(self.enable_settle).await;

        let mut still_disabled = Vec::new();
        for id in reservation.disabled.drain(..) {
            match self.inventory.set_device_enabled(&id, true).await {
                Ok(()) => info!(device = %id, "sibling GPU re-enabled"),
                Err(e) => {
                    warn!(device = %id, error = %e, "could not re-enable GPU");
                    still_disabled.push(id);
                }
            }
        }
        reservation.disabled = still_disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use anyhow::{Result, bail};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Devices {
        disabled: Mutex<BTreeSet<String>>,
        calls: Mutex<Vec<(String, bool)>>,
        refuse: Option<String>,
    }

    #[async_trait]
    impl GpuInventory for Devices {
        async fn host_gpus(&self) -> Result<Vec<GpuDevice>> {
            Ok(Vec::new())
        }

        async fn set_device_enabled(&self, id: &str, enabled: bool) -> Result<()> {
            self.calls.lock().unwrap().push((id.to_string(), enabled));
            if self.refuse.as_deref() == Some(id) {
                bail!("access denied");
            }
            let mut disabled = self.disabled.lock().unwrap();
            if enabled {
                disabled.remove(id);
            } else {
                disabled.insert(id.to_string());
            }
            Ok(())
        }

        async fn installed_driver_files(&self, _: &str) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    fn gpu(id: &str, eligible: bool) -> GpuDevice {
        GpuDevice {
            instance_id: format!("PCI\\{id}"),
            friendly_name: id.into(),
            vendor: "NVIDIA".into(),
            driver_version: String::new(),
            partitionable_name: eligible.then(|| format!("\\\\?\\PCI#{id}#{{guid}}")),
        }
    }

    fn coordinator(devices: Arc<Devices>) -> ExclusivityCoordinator {
        ExclusivityCoordinator::new(devices, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn release_restores_everything_and_is_idempotent() {
        let devices = Arc::new(Devices::default());
        let coord = coordinator(devices.clone());
        let all = vec![gpu("A", true), gpu("B", true), gpu("C", false), gpu("D", true)];

        let mut reservation = coord.reserve(&all[0], &all, &Progress::silent()).await;
        assert_eq!(reservation.disabled_ids(), ["PCI\\B", "PCI\\D"]);
        assert_eq!(devices.disabled.lock().unwrap().len(), 2);

        coord.release(&mut reservation).await;
        assert!(devices.disabled.lock().unwrap().is_empty());
        assert!(reservation.is_empty());

        let calls_before = devices.calls.lock().unwrap().len();
        coord.release(&mut reservation).await;
        assert_eq!(devices.calls.lock().unwrap().len(), calls_before);
    }

    #[tokio::test]
    async fn failed_disable_is_partial_not_fatal() {
        let devices = Arc::new(Devices {
            refuse: Some("PCI\\B".into()),
            ..Default::default()
        });
        let coord = coordinator(devices.clone());
        let all = vec![gpu("A", true), gpu("B", true), gpu("D", true)];

        let reservation = coord.reserve(&all[0], &all, &Progress::silent()).await;

        assert!(reservation.is_partial());
        assert_eq!(reservation.failed_ids(), ["PCI\\B"]);
        assert_eq!(reservation.disabled_ids(), ["PCI\\D"]);
    }

    #[tokio::test]
    async fn single_gpu_host_disables_nothing() {
        let devices = Arc::new(Devices::default());
        let coord = coordinator(devices.clone());
        let all = vec![gpu("A", true)];

        let reservation = coord.reserve(&all[0], &all, &Progress::silent()).await;
        assert!(reservation.is_empty());
        assert!(devices.calls.lock().unwrap().is_empty());
    }
}
