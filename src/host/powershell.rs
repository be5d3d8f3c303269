//! PowerShell-backed implementation of the host collaborator traits.
//!
//! Every query pipes its result through `ConvertTo-Json` and is mapped into a
//! typed record by an explicit function. Missing or malformed fields fail
//! closed: the field falls back to its default, or the record is skipped.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, warn};

use super::device_id::normalize_for_comparison;
use super::{
    DiskMounter, GpuAdapter, GpuDevice, GpuInventory, GuestInventory, GuestOs, GuestTarget,
    HostPlatform, PartitionHost, PowerState,
};

#[cfg(windows)]
const DEFAULT_PROGRAMS: &[&str] = &["powershell.exe", "pwsh.exe"];
#[cfg(not(windows))]
const DEFAULT_PROGRAMS: &[&str] = &["pwsh"];

const SHELL_ARGS: &[&str] = &[
    "-NoLogo",
    "-NoProfile",
    "-NonInteractive",
    "-ExecutionPolicy",
    "Bypass",
    "-Command",
];

/// Runs management scripts through a PowerShell host process.
///
/// The program that last spawned successfully is cached; a spawn failure
/// clears the cache so the next call probes the candidates again.
pub struct PowerShell {
    candidates: Vec<PathBuf>,
    resolved: Mutex<Option<PathBuf>>,
    platform_override: Option<HostPlatform>,
}

impl PowerShell {
    /// `program` pins a specific executable; `None` probes the defaults.
    pub fn new(program: Option<PathBuf>) -> Self {
        let candidates = match program {
            Some(p) => vec![p],
            None => DEFAULT_PROGRAMS.iter().map(PathBuf::from).collect(),
        };
        Self {
            candidates,
            resolved: Mutex::new(None),
            platform_override: None,
        }
    }

    pub fn with_platform_override(mut self, platform: Option<HostPlatform>) -> Self {
        self.platform_override = platform;
        self
    }

    fn cached_program(&self) -> Option<PathBuf> {
        self.resolved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn remember(&self, program: Option<PathBuf>) {
        *self.resolved.lock().unwrap_or_else(|e| e.into_inner()) = program;
    }

    /// Run `script` and return its trimmed stdout.
    pub async fn run(&self, script: &str) -> Result<String> {
        let candidates = match self.cached_program() {
            Some(program) => vec![program],
            None => self.candidates.clone(),
        };

        let mut last_error = None;
        for program in candidates {
            match Command::new(&program).args(SHELL_ARGS).arg(script).output().await {
                Ok(output) => {
                    self.remember(Some(program));
                    return check_output(script, output);
                }
                Err(e) => {
                    warn!(program = %program.display(), error = %e, "failed to spawn PowerShell");
                    self.remember(None);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => anyhow!(e).context("no usable PowerShell executable"),
            None => anyhow!("no PowerShell executable configured"),
        })
    }

    async fn run_records<T: DeserializeOwned>(&self, script: &str) -> Result<Vec<T>> {
        let stdout = self.run(script).await?;
        Ok(records(&stdout))
    }
}

fn check_output(script: &str, output: Output) -> Result<String> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        debug!(script = summarize(script), "PowerShell ok");
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(
        "PowerShell `{}` failed with status {}: {}",
        summarize(script),
        output.status.code().unwrap_or(-1),
        stderr.trim()
    )
}

fn summarize(script: &str) -> String {
    let first = script.trim().lines().next().unwrap_or_default().trim();
    if first.chars().count() > 80 {
        format!("{}...", first.chars().take(80).collect::<String>())
    } else {
        first.to_string()
    }
}

/// Single-quote a value for interpolation into a script.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `ConvertTo-Json` emits a bare object for one result and an array for
/// several. Records that fail to map are skipped.
pub fn records<T: DeserializeOwned>(json: &str) -> Vec<T> {
    let json = json.trim();
    if json.is_empty() {
        return Vec::new();
    }
    let value: serde_json::Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable PowerShell JSON");
            return Vec::new();
        }
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Query records and their mappings
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct VideoControllerRecord {
    instance_id: Option<String>,
    name: Option<String>,
    vendor: Option<String>,
    driver_version: Option<String>,
}

fn gpu_from_record(record: VideoControllerRecord, partitionable: &[String]) -> Option<GpuDevice> {
    let instance_id = record.instance_id.filter(|id| !id.trim().is_empty())?;
    let key = normalize_for_comparison(&instance_id);
    let partitionable_name = partitionable
        .iter()
        .find(|name| normalize_for_comparison(name) == key)
        .cloned();
    Some(GpuDevice {
        instance_id,
        friendly_name: record.name.unwrap_or_default(),
        vendor: record.vendor.unwrap_or_default(),
        driver_version: record.driver_version.unwrap_or_default(),
        partitionable_name,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct GuestRecord {
    name: Option<String>,
    state: Option<String>,
    os_name: Option<String>,
}

fn power_state(state: &str) -> PowerState {
    match state.trim() {
        s if s.eq_ignore_ascii_case("Off") => PowerState::Off,
        s if s.eq_ignore_ascii_case("Running") => PowerState::Running,
        _ => PowerState::Other,
    }
}

/// Guest OS from the integration-services `OSName` item. Linux guests
/// report a distribution name, so anything non-Windows counts as Linux.
fn guest_os(os_name: &str) -> GuestOs {
    let os_name = os_name.trim();
    if os_name.is_empty() {
        GuestOs::Unknown
    } else if os_name.to_ascii_lowercase().contains("windows") {
        GuestOs::Windows
    } else {
        GuestOs::Linux
    }
}

fn guest_from_record(record: GuestRecord, requested: &str) -> GuestTarget {
    GuestTarget {
        name: record
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| requested.to_string()),
        power_state: power_state(record.state.as_deref().unwrap_or_default()),
        os_class: guest_os(record.os_name.as_deref().unwrap_or_default()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AdapterRecord {
    id: Option<String>,
    instance_path: Option<String>,
}

fn adapter_from_record(record: AdapterRecord) -> Option<GpuAdapter> {
    Some(GpuAdapter {
        id: record.id.filter(|id| !id.is_empty())?,
        instance_path: record.instance_path.filter(|p| !p.trim().is_empty()),
    })
}

fn drive_letters(names: &[String]) -> BTreeSet<char> {
    names
        .iter()
        .filter_map(|n| {
            let mut chars = n.trim().trim_end_matches(':').chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
                _ => None,
            }
        })
        .collect()
}

fn first_ipv4(addresses: &[String]) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .flat_map(|a| a.split(','))
        .find_map(|a| a.trim().parse::<Ipv4Addr>().ok())
}

fn path_literal(path: &Path) -> String {
    ps_quote(&path.to_string_lossy())
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl GpuInventory for PowerShell {
    async fn host_gpus(&self) -> Result<Vec<GpuDevice>> {
        let partitionable: Vec<String> = self
            .run_records(
                "@(Get-VMHostPartitionableGpu -ErrorAction SilentlyContinue | \
                 Select-Object -ExpandProperty Name) | ConvertTo-Json",
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "partitionable GPU query failed, treating none as eligible");
                Vec::new()
            });

        let controllers: Vec<VideoControllerRecord> = self
            .run_records(
                "Get-CimInstance -ClassName Win32_VideoController | ForEach-Object { \
                 [pscustomobject]@{ InstanceId = $_.PNPDeviceID; Name = $_.Name; \
                 Vendor = $_.AdapterCompatibility; DriverVersion = $_.DriverVersion } } | \
                 ConvertTo-Json -Depth 3",
            )
            .await
            .context("listing host display adapters")?;

        Ok(controllers
            .into_iter()
            .filter_map(|r| gpu_from_record(r, &partitionable))
            .collect())
    }

    async fn set_device_enabled(&self, instance_id: &str, enabled: bool) -> Result<()> {
        let verb = if enabled { "Enable" } else { "Disable" };
        self.run(&format!(
            "{verb}-PnpDevice -InstanceId {} -Confirm:$false -ErrorAction Stop",
            ps_quote(instance_id)
        ))
        .await
        .with_context(|| format!("{verb}-PnpDevice {instance_id}"))?;
        Ok(())
    }

    async fn installed_driver_files(&self, device_id: &str) -> Result<Vec<PathBuf>> {
        let script = format!(
            "$id = {}.Trim(); \
             $wmi = Get-CimInstance Win32_VideoController | \
             Where-Object {{ $_.PNPDeviceID -like \"*$id*\" }} | Select-Object -First 1; \
             if ($wmi -and $wmi.InstalledDisplayDrivers) {{ \
             @($wmi.InstalledDisplayDrivers -split ',') | ConvertTo-Json }}",
            ps_quote(device_id)
        );
        let files: Vec<String> = self.run_records(&script).await?;
        Ok(files
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

#[async_trait]
impl GuestInventory for PowerShell {
    async fn guest(&self, name: &str) -> Result<GuestTarget> {
        let script = format!(
            "$vm = Get-VM -Name {} -ErrorAction Stop; $os = ''; \
             $kvp = Get-CimInstance -Namespace root\\virtualization\\v2 \
             -ClassName Msvm_KvpExchangeComponent -Filter \"SystemName='$($vm.Id)'\" \
             -ErrorAction SilentlyContinue; \
             if ($kvp) {{ foreach ($item in $kvp.GuestIntrinsicExchangeItems) {{ \
             $x = [xml]$item; \
             $n = $x.INSTANCE.PROPERTY | Where-Object {{ $_.NAME -eq 'Name' }}; \
             if ($n.VALUE -eq 'OSName') {{ \
             $os = ($x.INSTANCE.PROPERTY | Where-Object {{ $_.NAME -eq 'Data' }}).VALUE }} }} }}; \
             [pscustomobject]@{{ Name = $vm.Name; State = $vm.State.ToString(); OsName = $os }} | \
             ConvertTo-Json",
            ps_quote(name)
        );
        let record = self
            .run_records::<GuestRecord>(&script)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("guest '{name}' not found"))?;
        Ok(guest_from_record(record, name))
    }

    async fn start_guest(&self, name: &str) -> Result<()> {
        self.run(&format!("Start-VM -Name {} -ErrorAction Stop", ps_quote(name)))
            .await
            .with_context(|| format!("starting guest '{name}'"))?;
        Ok(())
    }

    async fn guest_address(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        let addresses: Vec<String> = self
            .run_records(&format!(
                "@((Get-VMNetworkAdapter -VMName {} | Select-Object -First 1).IPAddresses) | \
                 ConvertTo-Json",
                ps_quote(name)
            ))
            .await?;
        Ok(first_ipv4(&addresses))
    }

    async fn first_disk_path(&self, name: &str) -> Result<PathBuf> {
        let path = self
            .run(&format!(
                "(Get-VMHardDiskDrive -VMName {} | Select-Object -First 1).Path",
                ps_quote(name)
            ))
            .await?;
        if path.is_empty() {
            bail!("guest '{name}' has no virtual hard disk");
        }
        Ok(PathBuf::from(path))
    }

    async fn notes(&self, name: &str) -> Result<String> {
        self.run(&format!("(Get-VM -Name {} -ErrorAction Stop).Notes", ps_quote(name)))
            .await
    }

    async fn set_notes(&self, name: &str, notes: &str) -> Result<()> {
        self.run(&format!(
            "Set-VM -Name {} -Notes {} -ErrorAction Stop",
            ps_quote(name),
            ps_quote(notes)
        ))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PartitionHost for PowerShell {
    async fn host_platform(&self) -> Result<HostPlatform> {
        if let Some(platform) = self.platform_override {
            return Ok(platform);
        }
        let build = self.run("[Environment]::OSVersion.Version.Build").await?;
        let build: u32 = build
            .parse()
            .with_context(|| format!("unexpected OS build number '{build}'"))?;
        Ok(HostPlatform::from_build(build))
    }

    async fn prepare_guest_for_gpu(&self, guest: &str) -> Result<()> {
        let name = ps_quote(guest);
        self.run(&format!(
            "Set-VM -VMName {name} -GuestControlledCacheTypes $true -ErrorAction Stop; \
             Set-VM -VMName {name} -HighMemoryMappedIoSpace 64GB -ErrorAction Stop; \
             Set-VM -VMName {name} -LowMemoryMappedIoSpace 1GB -ErrorAction Stop"
        ))
        .await
        .with_context(|| format!("configuring MMIO space for '{guest}'"))?;
        Ok(())
    }

    async fn attach_gpu_partition(&self, guest: &str, instance_path: Option<&str>) -> Result<()> {
        let mut script = format!("Add-VMGpuPartitionAdapter -VMName {}", ps_quote(guest));
        if let Some(path) = instance_path {
            script.push_str(&format!(" -InstancePath {}", ps_quote(path)));
        }
        script.push_str(" -ErrorAction Stop");
        self.run(&script)
            .await
            .with_context(|| format!("attaching GPU partition to '{guest}'"))?;
        Ok(())
    }

    async fn gpu_adapters(&self, guest: &str) -> Result<Vec<GpuAdapter>> {
        let adapters: Vec<AdapterRecord> = self
            .run_records(&format!(
                "Get-VMGpuPartitionAdapter -VMName {} | Select-Object Id, InstancePath | \
                 ConvertTo-Json",
                ps_quote(guest)
            ))
            .await?;
        Ok(adapters.into_iter().filter_map(adapter_from_record).collect())
    }

    async fn remove_gpu_partition(&self, guest: &str, adapter_id: &str) -> Result<()> {
        self.run(&format!(
            "Remove-VMGpuPartitionAdapter -VMName {} -AdapterId {} -Confirm:$false -ErrorAction Stop",
            ps_quote(guest),
            ps_quote(adapter_id)
        ))
        .await
        .with_context(|| format!("removing GPU adapter {adapter_id} from '{guest}'"))?;
        Ok(())
    }
}

#[async_trait]
impl DiskMounter for PowerShell {
    async fn dismount(&self, image: &Path) -> Result<()> {
        self.run(&format!(
            "Dismount-DiskImage -ImagePath {} -ErrorAction SilentlyContinue | Out-Null",
            path_literal(image)
        ))
        .await?;
        Ok(())
    }

    async fn attach_without_letter(&self, image: &Path) -> Result<u32> {
        let number = self
            .run(&format!(
                "(Mount-DiskImage -ImagePath {} -NoDriveLetter -PassThru -ErrorAction Stop | \
                 Get-Disk).Number",
                path_literal(image)
            ))
            .await?;
        number
            .parse()
            .with_context(|| format!("unexpected disk number '{number}'"))
    }

    fn raw_device_path(&self, disk_number: u32) -> PathBuf {
        PathBuf::from(format!(r"\\.\PhysicalDrive{disk_number}"))
    }

    async fn used_drive_letters(&self) -> Result<BTreeSet<char>> {
        let names: Vec<String> = self
            .run_records("@(Get-PSDrive -PSProvider FileSystem | ForEach-Object { $_.Name }) | ConvertTo-Json")
            .await?;
        Ok(drive_letters(&names))
    }

    async fn assign_drive_letter(
        &self,
        image: &Path,
        partition_index: u32,
        letter: char,
    ) -> Result<char> {
        let script = format!(
            "$img = Get-DiskImage -ImagePath {image}; \
             if (-not $img.Attached) {{ $img = Mount-DiskImage -ImagePath {image} -NoDriveLetter -PassThru -ErrorAction Stop }}; \
             $disk = $img | Get-Disk; \
             $part = Get-Partition -DiskNumber $disk.Number -PartitionNumber {partition_index} -ErrorAction Stop; \
             if ($part.DriveLetter) {{ return $part.DriveLetter }}; \
             try {{ $part | Set-Partition -NewDriveLetter '{letter}' -ErrorAction Stop; '{letter}' }} \
             catch {{ (Get-Partition -DiskNumber $disk.Number -PartitionNumber {partition_index}).DriveLetter }}",
            image = path_literal(image),
        );
        let out = self.run(&script).await?;
        drive_letters(&[out.clone()])
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("partition {partition_index} did not receive a drive letter ('{out}')"))
    }

    async fn remove_drive_letter(&self, image: &Path, partition_index: u32, letter: char) -> Result<()> {
        self.run(&format!(
            "$disk = Get-DiskImage -ImagePath {} | Get-Disk -ErrorAction SilentlyContinue; \
             if ($disk) {{ Remove-PartitionAccessPath -DiskNumber $disk.Number \
             -PartitionNumber {partition_index} -AccessPath '{letter}:\\' -ErrorAction SilentlyContinue }}",
            path_literal(image)
        ))
        .await?;
        Ok(())
    }

    fn drive_root(&self, letter: char) -> PathBuf {
        PathBuf::from(format!("{letter}:\\"))
    }
}
