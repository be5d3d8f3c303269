//! Top-level GPU partition assignment.
//!
//! [`GpuPartitionOrchestrator::add_gpu_partition`] walks one attempt through
//! the [`AssignmentMachine`]: validate, reserve exclusivity (legacy hosts),
//! attach, provision the guest OS, finalize. Finalizing always runs, so
//! disabled sibling GPUs are re-enabled however the attempt ended.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use statig::blocking::{IntoStateMachineExt, StateMachine};
use tracing::{info, warn};

use crate::disk::{Partition, candidate_partitions, parse_partitions};
use crate::error::{Error, Result};
use crate::gpu::{ExclusivityCoordinator, Reservation};
use crate::guest::{
    LinuxGuestProvisioner, LinuxProvisionerSettings, ProvisionOutcome, WindowsGuestInjector,
    WindowsInjectorSettings,
};
use crate::host::metadata::{apply_assignment_tag, parse_assignment_tag, strip_assignment_tag};
use crate::host::{
    DiskMounter, GpuAdapter, GpuDevice, GpuInventory, GuestInventory, GuestOs, GuestTarget,
    HiveTool, HostPlatform, PartitionHost, PowerState,
};
use crate::progress::{CancelToken, Progress};
use crate::remote::{RemoteShellFactory, SshCredentials, wait_for_port};
use crate::state_machine::assignment_sm::{
    AssignmentEvent, AssignmentMachine, ProvisionTarget, State, Verdict,
};

const NON_PERSISTENT_WARNING: &str =
    "On this host the GPU assignment may not persist across host reboots";

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Host-side collaborators used by an orchestrator.
#[derive(Clone)]
pub struct HostServices {
    pub gpus: Arc<dyn GpuInventory>,
    pub guests: Arc<dyn GuestInventory>,
    pub partitions: Arc<dyn PartitionHost>,
    pub disks: Arc<dyn DiskMounter>,
    pub hives: Arc<dyn HiveTool>,
    pub shells: Arc<dyn RemoteShellFactory>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub windows: WindowsInjectorSettings,
    pub linux: LinuxProvisionerSettings,
    /// Wait after disabling sibling GPUs.
    pub disable_settle: Duration,
    /// Wait before re-enabling them.
    pub enable_settle: Duration,
    /// How long a freshly started Linux guest gets to open its shell port.
    pub guest_boot_timeout: Duration,
    pub port_poll_interval: Duration,
    pub port_connect_timeout: Duration,
}

/// One assignment request.
#[derive(Debug, Clone)]
pub struct AssignmentRequest {
    pub guest: String,
    /// Host PnP instance id (or partitionable name) of the GPU.
    pub gpu_device_id: String,
    pub vendor: String,
    /// Guest disk partition to provision; `None` attaches only, unless the
    /// guest is a known Linux guest.
    pub partition: Option<Partition>,
    pub credentials: Option<SshCredentials>,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one assignment attempt. `Display` is the outcome string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok { warnings: Vec<String> },
    /// The guest rebooted twice; invoke the assignment again.
    RebootRequiredRetry { warnings: Vec<String> },
    Cancelled { guest: String },
    Failed { guest: String, reason: String },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Outcome::Ok { warnings } | Outcome::RebootRequiredRetry { warnings } => warnings,
            _ => &[],
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok { .. } => f.write_str("OK"),
            Outcome::RebootRequiredRetry { .. } => f.write_str("REBOOT_REQUIRED_RETRY"),
            Outcome::Cancelled { guest } => write!(f, "{guest}: Operation cancelled"),
            Outcome::Failed { guest, reason } => {
                write!(f, "Failed to assign GPU to '{guest}': {reason}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Facts gathered while validating, carried to the later phases.
struct Plan {
    target: GpuDevice,
    platform: HostPlatform,
    provision: ProvisionTarget,
    /// More than one partition-eligible GPU on a legacy host.
    legacy_multi_gpu: bool,
}

#[derive(Default)]
struct AttemptState {
    plan: Option<Plan>,
    reservation: Reservation,
    attached: bool,
    cancelled: bool,
    warnings: Vec<String>,
}

pub struct GpuPartitionOrchestrator {
    services: HostServices,
    settings: OrchestratorSettings,
    exclusivity: ExclusivityCoordinator,
    windows: WindowsGuestInjector,
    linux: LinuxGuestProvisioner,
}

impl GpuPartitionOrchestrator {
    pub fn new(services: HostServices, settings: OrchestratorSettings) -> Self {
        let exclusivity = ExclusivityCoordinator::new(
            services.gpus.clone(),
            settings.disable_settle,
            settings.enable_settle,
        );
        let windows = WindowsGuestInjector::new(
            services.disks.clone(),
            services.gpus.clone(),
            services.hives.clone(),
            settings.windows.clone(),
        );
        let linux = LinuxGuestProvisioner::new(services.gpus.clone(), settings.linux.clone());
        Self {
            services,
            settings,
            exclusivity,
            windows,
            linux,
        }
    }

    /// Attach a GPU partition to `request.guest` and provision its drivers.
    ///
    /// Never returns an error: every failure is folded into the [`Outcome`]
    /// after cleanup has run.
    pub async fn add_gpu_partition(
        &self,
        request: &AssignmentRequest,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Outcome {
        info!(guest = %request.guest, device = %request.gpu_device_id, "GPU assignment started");
        let mut sm = AssignmentMachine::new(request.guest.clone()).state_machine();
        let mut attempt = AttemptState::default();

        sm.handle(&AssignmentEvent::Begin);
        if let Err(e) = self.run(request, &mut sm, &mut attempt, progress, cancel).await {
            attempt.cancelled = matches!(e, Error::Cancelled);
            sm.handle(&AssignmentEvent::Fail(e.to_string()));
        }

        let verdict = match sm.state() {
            State::Finalizing { verdict } => verdict.clone(),
            other => Verdict::Failed(format!("assignment stopped in unexpected state {other:?}")),
        };
        self.finalize(request, &mut attempt, &verdict, progress).await;
        sm.handle(&AssignmentEvent::Finalized);

        for warning in &attempt.warnings {
            progress.line(format!("Warning: {warning}"));
        }

        let outcome = match sm.state() {
            State::Succeeded {} => Outcome::Ok {
                warnings: attempt.warnings,
            },
            State::RebootPending {} => Outcome::RebootRequiredRetry {
                warnings: attempt.warnings,
            },
            _ if attempt.cancelled => Outcome::Cancelled {
                guest: request.guest.clone(),
            },
            State::Failed { reason } => Outcome::Failed {
                guest: request.guest.clone(),
                reason: reason.clone(),
            },
            other => Outcome::Failed {
                guest: request.guest.clone(),
                reason: format!("assignment stopped in unexpected state {other:?}"),
            },
        };
        info!(guest = %request.guest, outcome = %outcome, "GPU assignment finished");
        outcome
    }

    async fn run(
        &self,
        request: &AssignmentRequest,
        sm: &mut StateMachine<AssignmentMachine>,
        attempt: &mut AttemptState,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        progress.line(format!("Validating guest '{}'", request.guest));
        let (plan, all_gpus) = self.validate(request).await?;
        let exclusive = !plan.platform.supports_multi_partition();
        attempt.plan = Some(plan);
        sm.handle(&AssignmentEvent::PreconditionsMet { exclusive });

        let Some(plan) = attempt.plan.as_ref() else {
            return Err(Error::Precondition("validation produced no plan".into()));
        };

        if matches!(sm.state(), State::Reserving {}) {
            cancel.check()?;
            progress.line("Reserving the GPU (disabling other partitionable GPUs)");
            attempt.reservation = self.exclusivity.reserve(&plan.target, &all_gpus, progress).await;
            if attempt.reservation.is_partial() {
                attempt.warnings.push(format!(
                    "could not disable {}; the partition may bind to another GPU and may not persist across host reboots",
                    attempt.reservation.failed_ids().join(", ")
                ));
            }
            sm.handle(&AssignmentEvent::ExclusivityReserved);
        }

        cancel.check()?;
        self.attach(request, plan, progress).await?;
        attempt.attached = true;
        sm.handle(&AssignmentEvent::Attached(plan.provision));

        match sm.state() {
            State::ProvisioningWindows {} => {
                cancel.check()?;
                self.provision_windows(request, plan, progress).await?;
                sm.handle(&AssignmentEvent::Provisioned);
            }
            State::ProvisioningLinux { .. } => {
                self.provision_linux(request, plan, sm, progress, cancel).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn validate(&self, request: &AssignmentRequest) -> Result<(Plan, Vec<GpuDevice>)> {
        let guest = self.services.guests.guest(&request.guest).await?;
        let gpus = self.services.gpus.host_gpus().await?;
        let target = gpus
            .iter()
            .find(|g| g.matches(&request.gpu_device_id))
            .cloned()
            .ok_or_else(|| {
                Error::Precondition(format!("GPU '{}' was not found on this host", request.gpu_device_id))
            })?;
        let platform = self.services.partitions.host_platform().await?;

        if platform == HostPlatform::Modern && !target.is_partition_eligible() {
            return Err(Error::Precondition(format!(
                "GPU '{}' does not support partitioning",
                target.friendly_name
            )));
        }
        if request.partition.is_some() && guest.power_state != PowerState::Off {
            return Err(Error::Precondition(format!(
                "guest '{}' must be powered off before its disk can be provisioned (state: {:?})",
                guest.name, guest.power_state
            )));
        }

        let provision = provision_target(request.partition.as_ref(), &guest);
        if provision == ProvisionTarget::Linux && request.credentials.is_none() {
            return Err(Error::Precondition(
                "remote-shell credentials are required to provision a Linux guest".into(),
            ));
        }

        let eligible = gpus.iter().filter(|g| g.is_partition_eligible()).count();
        let plan = Plan {
            target,
            platform,
            provision,
            legacy_multi_gpu: platform == HostPlatform::Legacy && eligible > 1,
        };
        info!(
            guest = %request.guest,
            platform = ?plan.platform,
            provision = ?plan.provision,
            "preconditions met"
        );
        Ok((plan, gpus))
    }

    async fn attach(&self, request: &AssignmentRequest, plan: &Plan, progress: &Progress) -> Result<()> {
        let partitions = &self.services.partitions;
        if request.partition.is_some() {
            progress.line("Configuring guest memory-mapped IO for the GPU");
            partitions.prepare_guest_for_gpu(&request.guest).await?;
        }

        progress.line(format!("Attaching {} to '{}'", plan.target.friendly_name, request.guest));
        let instance_path = match plan.platform {
            HostPlatform::Modern => plan.target.partitionable_name.as_deref(),
            HostPlatform::Legacy => None,
        };
        partitions
            .attach_gpu_partition(&request.guest, instance_path)
            .await?;

        if plan.platform == HostPlatform::Legacy {
            let device = plan
                .target
                .partitionable_name
                .as_deref()
                .unwrap_or(&plan.target.instance_id);
            if let Err(e) = self.tag_guest(&request.guest, device).await {
                warn!(guest = %request.guest, error = %e, "could not record assigned GPU in guest notes");
            }
        }
        Ok(())
    }

    async fn tag_guest(&self, guest: &str, device: &str) -> anyhow::Result<()> {
        let notes = self.services.guests.notes(guest).await?;
        self.services
            .guests
            .set_notes(guest, &apply_assignment_tag(&notes, device))
            .await
    }

    async fn provision_windows(&self, request: &AssignmentRequest, plan: &Plan, progress: &Progress) -> Result<()> {
        let Some(partition) = &request.partition else {
            return Err(Error::Precondition("no guest partition selected".into()));
        };
        let disk = self.services.guests.first_disk_path(&request.guest).await?;
        self.windows
            .inject(&disk, partition, &plan.target.instance_id, &request.vendor, progress)
            .await
    }

    async fn provision_linux(
        &self,
        request: &AssignmentRequest,
        plan: &Plan,
        sm: &mut StateMachine<AssignmentMachine>,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Result<()> {
        let Some(credentials) = &request.credentials else {
            return Err(Error::Precondition(
                "remote-shell credentials are required to provision a Linux guest".into(),
            ));
        };
        let credentials = self.linux_preflight(&request.guest, credentials, progress, cancel).await?;
        let shell = self.services.shells.connect(&credentials);

        while let State::ProvisioningLinux { attempt } = sm.state() {
            let attempt = *attempt;
            info!(guest = %request.guest, attempt, "Linux provisioning attempt");
            let outcome = self
                .linux
                .provision(shell.as_ref(), &credentials, &plan.target.instance_id, progress, cancel)
                .await?;
            match outcome {
                ProvisionOutcome::Completed => sm.handle(&AssignmentEvent::Provisioned),
                ProvisionOutcome::RebootRequired => {
                    sm.handle(&AssignmentEvent::RebootRequired);
                    if matches!(sm.state(), State::RebootRetry { .. }) {
                        progress.line("Re-running provisioning after reboot");
                        sm.handle(&AssignmentEvent::GuestReachable);
                    }
                }
            }
        }
        Ok(())
    }

    /// Start the guest if needed, resolve its address and wait for the
    /// shell port.
    async fn linux_preflight(
        &self,
        guest: &str,
        credentials: &SshCredentials,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> Result<SshCredentials> {
        let guests = &self.services.guests;
        let mut credentials = credentials.clone();

        if guests.guest(guest).await?.power_state != PowerState::Running {
            progress.line(format!("Starting guest '{guest}'"));
            guests.start_guest(guest).await?;
        }

        match guests.guest_address(guest).await {
            Ok(Some(address)) => {
                info!(guest, %address, "resolved guest address");
                credentials.host = address.to_string();
            }
            Ok(None) => info!(guest, host = %credentials.host, "no guest address reported, using the configured host"),
            Err(e) => warn!(guest, error = %e, "guest address lookup failed"),
        }

        progress.line(format!(
            "Waiting for {}:{} to accept connections",
            credentials.host, credentials.port
        ));
        let up = wait_for_port(
            &credentials.host,
            credentials.port,
            self.settings.port_connect_timeout,
            self.settings.port_poll_interval,
            self.settings.guest_boot_timeout,
            cancel,
        )
        .await;
        cancel.check()?;
        if !up {
            return Err(Error::GuestUnreachable {
                host: credentials.host,
                port: credentials.port,
                timeout: self.settings.guest_boot_timeout,
            });
        }
        Ok(credentials)
    }

    async fn finalize(
        &self,
        request: &AssignmentRequest,
        attempt: &mut AttemptState,
        verdict: &Verdict,
        progress: &Progress,
    ) {
        if !attempt.reservation.is_empty() {
            progress.line("Re-enabling other GPUs");
            self.exclusivity.release(&mut attempt.reservation).await;
            if !attempt.reservation.is_empty() {
                attempt.warnings.push(format!(
                    "could not re-enable {}; enable them manually in Device Manager",
                    attempt.reservation.disabled_ids().join(", ")
                ));
            }
        }

        let Some(plan) = &attempt.plan else {
            return;
        };
        if !plan.legacy_multi_gpu {
            return;
        }
        attempt.warnings.push(NON_PERSISTENT_WARNING.to_string());

        if attempt.attached && *verdict == Verdict::Success {
            match self.services.guests.guest(&request.guest).await {
                Ok(GuestTarget {
                    power_state: PowerState::Running,
                    ..
                }) => {}
                Ok(_) => {
                    progress.line(format!("Starting guest '{}'", request.guest));
                    if let Err(e) = self.services.guests.start_guest(&request.guest).await {
                        warn!(guest = %request.guest, error = %e, "could not start guest");
                        attempt
                            .warnings
                            .push(format!("could not start guest '{}': {e}", request.guest));
                    }
                }
                Err(e) => warn!(guest = %request.guest, error = %e, "could not query guest state"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Supporting operations
    // -----------------------------------------------------------------------

    /// Partitions of the guest's first virtual disk that are worth
    /// provisioning.
    pub async fn guest_partitions(&self, guest: &str) -> Result<Vec<Partition>> {
        let disks = &self.services.disks;
        let image = self.services.guests.first_disk_path(guest).await?;

        if let Err(e) = disks.dismount(&image).await {
            warn!(image = %image.display(), error = %e, "defensive dismount failed");
        }
        let result = self.read_partitions(&image).await;
        if let Err(e) = disks.dismount(&image).await {
            warn!(image = %image.display(), error = %e, "dismount after partition scan failed");
        }
        result.map(candidate_partitions)
    }

    async fn read_partitions(&self, image: &Path) -> Result<Vec<Partition>> {
        let number = self
            .services
            .disks
            .attach_without_letter(image)
            .await
            .map_err(|e| Error::Disk(format!("could not attach {}: {e:#}", image.display())))?;
        let device = self.services.disks.raw_device_path(number);

        let partitions = tokio::task::spawn_blocking(move || match File::open(&device) {
            Ok(mut file) => parse_partitions(&mut file),
            Err(e) => {
                warn!(device = %device.display(), error = %e, "could not open raw disk");
                Vec::new()
            }
        })
        .await
        .map_err(|e| Error::Disk(format!("partition scan aborted: {e}")))?;
        Ok(partitions)
    }

    /// GPU partition adapters on `guest`, with instance paths recovered from
    /// the guest notes where the hypervisor omits them.
    pub async fn assigned_adapters(&self, guest: &str) -> Result<Vec<GpuAdapter>> {
        let mut adapters = self.services.partitions.gpu_adapters(guest).await?;
        if adapters.iter().any(|a| a.instance_path.is_none()) {
            let tagged = match self.services.guests.notes(guest).await {
                Ok(notes) => parse_assignment_tag(&notes),
                Err(e) => {
                    warn!(guest, error = %e, "could not read guest notes");
                    None
                }
            };
            for adapter in adapters.iter_mut().filter(|a| a.instance_path.is_none()) {
                adapter.instance_path = tagged.clone();
            }
        }
        Ok(adapters)
    }

    pub async fn remove_gpu_partition(&self, guest: &str, adapter_id: &str) -> Result<()> {
        self.services
            .partitions
            .remove_gpu_partition(guest, adapter_id)
            .await?;
        info!(guest, adapter = adapter_id, "GPU partition removed");

        let guests = &self.services.guests;
        match guests.notes(guest).await {
            Ok(notes) => {
                let stripped = strip_assignment_tag(&notes);
                if stripped != notes {
                    if let Err(e) = guests.set_notes(guest, &stripped).await {
                        warn!(guest, error = %e, "could not clear assigned GPU from guest notes");
                    }
                }
            }
            Err(e) => warn!(guest, error = %e, "could not read guest notes"),
        }
        Ok(())
    }
}

/// Provisioning path: the selected partition's OS wins over the guest's
/// reported OS. Windows injection needs a partition to mount.
fn provision_target(partition: Option<&Partition>, guest: &GuestTarget) -> ProvisionTarget {
    let os = partition
        .map(|p| GuestOs::from(p.os_class))
        .filter(|os| *os != GuestOs::Unknown)
        .unwrap_or(guest.os_class);
    match (os, partition) {
        (GuestOs::Windows, Some(_)) => ProvisionTarget::Windows,
        (GuestOs::Linux, _) => ProvisionTarget::Linux,
        _ => ProvisionTarget::Skip,
    }
}
