//! Orchestration tests against in-memory collaborators.
//!
//! Every host-side trait is implemented by `FakeHost` and the guest's remote
//! shell by `ScriptedShell`, so these run anywhere with a plain `cargo test`.
//!
//! Tested in this file:
//! - precondition failures leave the host untouched
//! - legacy exclusivity is released whatever the outcome
//! - Windows offline injection stages drivers and patches the hive
//! - Linux reboot re-entry, the retry cap and the reboot-retry outcome
//! - cancellation
//! - partition discovery on a sparse disk image
//! - adapter listing and removal through the guest notes tag

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;

use gpu_partitioner::disk::{OsClass, Partition, parse_partitions};
use gpu_partitioner::error::Error;
use gpu_partitioner::guest::windows::set_tree_readonly;
use gpu_partitioner::guest::{
    LinuxProvisionerSettings, LinuxTimeouts, ScriptSource, WindowsInjectorSettings,
};
use gpu_partitioner::host::{
    DiskMounter, GpuAdapter, GpuDevice, GpuInventory, GuestInventory, GuestOs, GuestTarget,
    HiveTool, HostPlatform, PartitionHost, PowerState,
};
use gpu_partitioner::progress::{CancelToken, Progress};
use gpu_partitioner::remote::{RemoteShell, RemoteShellFactory, SshCredentials};
use gpu_partitioner::{AssignmentRequest, GpuPartitionOrchestrator, HostServices, OrchestratorSettings, Outcome};

const GUEST: &str = "lab";
const TARGET_ID: &str = r"PCI\VEN_10DE&DEV_2684\4&2B1F&0&0008";
const SIBLING_ID: &str = r"PCI\VEN_1002&DEV_73BF\6&1A2B&0&0010";

// ---------------------------------------------------------------------------
// Fake host
// ---------------------------------------------------------------------------

fn gpu(instance_id: &str, eligible: bool) -> GpuDevice {
    GpuDevice {
        instance_id: instance_id.into(),
        friendly_name: format!("GPU {}", &instance_id[8..12]),
        vendor: "NVIDIA".into(),
        driver_version: "32.0.15.6094".into(),
        partitionable_name: eligible.then(|| {
            format!(
                r"\\?\{}#{{064092b3-625e-43bf-9eb5-dc845897dd59}}",
                instance_id.replace('\\', "#")
            )
        }),
    }
}

struct FakeHost {
    platform: HostPlatform,
    gpus: Vec<GpuDevice>,
    guest: Mutex<GuestTarget>,
    notes: Mutex<String>,
    adapters: Mutex<Vec<GpuAdapter>>,
    driver_files: Vec<PathBuf>,
    volume_root: PathBuf,
    raw_device: PathBuf,
    fail_attach: bool,
    /// Every mutating call, in order.
    calls: Mutex<Vec<String>>,
    imported: Mutex<Option<String>>,
}

impl FakeHost {
    fn new(platform: HostPlatform, power_state: PowerState, os: GuestOs) -> Self {
        Self {
            platform,
            gpus: vec![gpu(TARGET_ID, true), gpu(SIBLING_ID, true)],
            guest: Mutex::new(GuestTarget {
                name: GUEST.into(),
                power_state,
                os_class: os,
            }),
            notes: Mutex::new("build box".into()),
            adapters: Mutex::new(Vec::new()),
            driver_files: Vec::new(),
            volume_root: PathBuf::new(),
            raw_device: PathBuf::new(),
            fail_attach: false,
            calls: Mutex::new(Vec::new()),
            imported: Mutex::new(None),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn called(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl GpuInventory for FakeHost {
    async fn host_gpus(&self) -> Result<Vec<GpuDevice>> {
        Ok(self.gpus.clone())
    }

    async fn set_device_enabled(&self, instance_id: &str, enabled: bool) -> Result<()> {
        let verb = if enabled { "enable" } else { "disable" };
        self.record(format!("{verb} {instance_id}"));
        Ok(())
    }

    async fn installed_driver_files(&self, _device_id: &str) -> Result<Vec<PathBuf>> {
        Ok(self.driver_files.clone())
    }
}

#[async_trait]
impl GuestInventory for FakeHost {
    async fn guest(&self, name: &str) -> Result<GuestTarget> {
        if name != GUEST {
            bail!("guest '{name}' not found");
        }
        Ok(self.guest.lock().unwrap().clone())
    }

    async fn start_guest(&self, name: &str) -> Result<()> {
        self.record(format!("start {name}"));
        self.guest.lock().unwrap().power_state = PowerState::Running;
        Ok(())
    }

    async fn guest_address(&self, _name: &str) -> Result<Option<Ipv4Addr>> {
        Ok(Some(Ipv4Addr::LOCALHOST))
    }

    async fn first_disk_path(&self, name: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(format!("{name}.vhdx")))
    }

    async fn notes(&self, _name: &str) -> Result<String> {
        Ok(self.notes.lock().unwrap().clone())
    }

    async fn set_notes(&self, _name: &str, notes: &str) -> Result<()> {
        self.record("set_notes");
        *self.notes.lock().unwrap() = notes.to_string();
        Ok(())
    }
}

#[async_trait]
impl PartitionHost for FakeHost {
    async fn host_platform(&self) -> Result<HostPlatform> {
        Ok(self.platform)
    }

    async fn prepare_guest_for_gpu(&self, guest: &str) -> Result<()> {
        self.record(format!("prepare {guest}"));
        Ok(())
    }

    async fn attach_gpu_partition(&self, guest: &str, instance_path: Option<&str>) -> Result<()> {
        self.record(format!("attach {guest} {}", instance_path.unwrap_or("-")));
        if self.fail_attach {
            bail!("Add-VMGpuPartitionAdapter: the operation failed");
        }
        self.adapters.lock().unwrap().push(GpuAdapter {
            id: "adapter-1".into(),
            instance_path: None,
        });
        Ok(())
    }

    async fn gpu_adapters(&self, _guest: &str) -> Result<Vec<GpuAdapter>> {
        Ok(self.adapters.lock().unwrap().clone())
    }

    async fn remove_gpu_partition(&self, _guest: &str, adapter_id: &str) -> Result<()> {
        self.record(format!("remove {adapter_id}"));
        self.adapters.lock().unwrap().retain(|a| a.id != adapter_id);
        Ok(())
    }
}

#[async_trait]
impl DiskMounter for FakeHost {
    async fn dismount(&self, image: &Path) -> Result<()> {
        self.record(format!("dismount {}", image.display()));
        Ok(())
    }

    async fn attach_without_letter(&self, image: &Path) -> Result<u32> {
        self.record(format!("attach_disk {}", image.display()));
        Ok(3)
    }

    fn raw_device_path(&self, _disk_number: u32) -> PathBuf {
        self.raw_device.clone()
    }

    async fn used_drive_letters(&self) -> Result<BTreeSet<char>> {
        Ok(['C', 'Z'].into_iter().collect())
    }

    async fn assign_drive_letter(&self, _image: &Path, partition_index: u32, letter: char) -> Result<char> {
        self.record(format!("letter {letter} {partition_index}"));
        Ok(letter)
    }

    async fn remove_drive_letter(&self, _image: &Path, _partition_index: u32, letter: char) -> Result<()> {
        self.record(format!("unletter {letter}"));
        Ok(())
    }

    fn drive_root(&self, _letter: char) -> PathBuf {
        self.volume_root.clone()
    }
}

#[async_trait]
impl HiveTool for FakeHost {
    async fn export_key(&self, key: &str, file: &Path) -> Result<()> {
        self.record(format!("reg export {key}"));
        fs::write(
            file,
            "Windows Registry Editor Version 5.00\r\n\r\n\
             [HKEY_LOCAL_MACHINE\\SYSTEM\\CurrentControlSet\\Services\\nvlddmkm]\r\n\
             \"ImagePath\"=\"\\\\SystemRoot\\\\System32\\\\DriverStore\\\\FileRepository\\\\nv\\\\nvlddmkm.sys\"\r\n",
        )?;
        Ok(())
    }

    async fn load_hive(&self, key: &str, _hive_file: &Path) -> Result<()> {
        self.record(format!("reg load {key}"));
        Ok(())
    }

    async fn import_file(&self, file: &Path) -> Result<()> {
        self.record("reg import");
        *self.imported.lock().unwrap() = Some(fs::read_to_string(file)?);
        Ok(())
    }

    async fn unload_hive(&self, key: &str) -> Result<()> {
        self.record(format!("reg unload {key}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted remote shell
// ---------------------------------------------------------------------------

enum Installer {
    Prints(&'static str),
    TimesOut,
}

#[derive(Default)]
struct ScriptedShell {
    installer: Mutex<VecDeque<Installer>>,
    commands: Mutex<Vec<String>>,
    background: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
}

impl ScriptedShell {
    fn with_installer(runs: impl IntoIterator<Item = Installer>) -> Arc<Self> {
        Arc::new(Self {
            installer: Mutex::new(runs.into_iter().collect()),
            ..Self::default()
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn execute_one(
        &self,
        command: &str,
        progress: &Progress,
        timeout: Option<Duration>,
    ) -> gpu_partitioner::Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        if command == "pwd" {
            return Ok("/home/dev\n".into());
        }
        if command.starts_with("sudo ") && command.contains("install_dxgkrnl.sh") {
            let next = self.installer.lock().unwrap().pop_front();
            return match next {
                Some(Installer::Prints(output)) => {
                    progress.output(output);
                    Ok(output.to_string())
                }
                Some(Installer::TimesOut) | None => Err(Error::Timeout {
                    command: command.to_string(),
                    timeout: timeout.unwrap_or_default(),
                }),
            };
        }
        Ok(String::new())
    }

    async fn upload_file(&self, _local: &Path, remote: &str) -> gpu_partitioner::Result<()> {
        self.uploads.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    async fn upload_directory(&self, _local: &Path, remote: &str) -> gpu_partitioner::Result<()> {
        self.uploads.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    async fn write_text_file(&self, _content: &str, remote: &str) -> gpu_partitioner::Result<()> {
        self.uploads.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    async fn execute_fire_and_forget(&self, command: &str) {
        self.background.lock().unwrap().push(command.to_string());
    }

    async fn wait_until_reachable(&self, _timeout: Duration, _poll: Duration, _cancel: &CancelToken) -> bool {
        true
    }

    fn endpoint(&self) -> String {
        "127.0.0.1:22".into()
    }
}

struct Shells(Arc<ScriptedShell>);

impl RemoteShellFactory for Shells {
    fn connect(&self, _credentials: &SshCredentials) -> Arc<dyn RemoteShell> {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn settings(driver_repository: &Path, temp_dir: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        windows: WindowsInjectorSettings {
            driver_repository: driver_repository.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            progress_interval: Duration::from_millis(150),
            dismount_settle: Duration::ZERO,
        },
        linux: LinuxProvisionerSettings {
            deploy_dir_name: "deploy".into(),
            driver_repository: driver_repository.to_path_buf(),
            support_lib_dir: None,
            scripts: ScriptSource::Remote("http://scripts.local/".into()),
            timeouts: LinuxTimeouts::default(),
            reboot_poll_interval: Duration::from_millis(10),
            reboot_wait: Duration::from_secs(1),
            max_command_attempts: 2,
        },
        disable_settle: Duration::ZERO,
        enable_settle: Duration::ZERO,
        guest_boot_timeout: Duration::from_secs(2),
        port_poll_interval: Duration::from_millis(10),
        port_connect_timeout: Duration::from_millis(500),
    }
}

struct Harness {
    host: Arc<FakeHost>,
    shell: Arc<ScriptedShell>,
    orchestrator: GpuPartitionOrchestrator,
    _tmp: TempDir,
}

fn harness(host: FakeHost, shell: Arc<ScriptedShell>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("FileRepository");
    fs::create_dir_all(&repo).unwrap();
    harness_with(host, shell, tmp, &repo)
}

fn harness_with(host: FakeHost, shell: Arc<ScriptedShell>, tmp: TempDir, repo: &Path) -> Harness {
    let host = Arc::new(host);
    let services = HostServices {
        gpus: host.clone(),
        guests: host.clone(),
        partitions: host.clone(),
        disks: host.clone(),
        hives: host.clone(),
        shells: Arc::new(Shells(shell.clone())),
    };
    let orchestrator = GpuPartitionOrchestrator::new(services, settings(repo, tmp.path()));
    Harness {
        host,
        shell,
        orchestrator,
        _tmp: tmp,
    }
}

fn windows_partition() -> Partition {
    Partition {
        index: 2,
        start_offset_bytes: 1 << 20,
        size_bytes: 100 << 30,
        os_class: OsClass::Windows,
        description: "Windows (NTFS/exFAT)".into(),
    }
}

fn request(partition: Option<Partition>, credentials: Option<SshCredentials>) -> AssignmentRequest {
    AssignmentRequest {
        guest: GUEST.into(),
        gpu_device_id: TARGET_ID.into(),
        vendor: "NVIDIA".into(),
        partition,
        credentials,
    }
}

fn credentials(port: u16) -> SshCredentials {
    SshCredentials {
        host: "lab.local".into(),
        port,
        username: "dev".into(),
        password: Some("secret".into()),
        proxy: None,
        install_graphics: true,
    }
}

async fn listener() -> (tokio::net::TcpListener, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn assign(h: &Harness, request: &AssignmentRequest) -> Outcome {
    h.orchestrator
        .add_gpu_partition(request, &Progress::silent(), &CancelToken::new())
        .await
}

// ---------------------------------------------------------------------------
// Preconditions and exclusivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_guest_with_partition_is_rejected_without_side_effects() {
    let host = FakeHost::new(HostPlatform::Legacy, PowerState::Running, GuestOs::Windows);
    let h = harness(host, ScriptedShell::with_installer([]));

    let outcome = assign(&h, &request(Some(windows_partition()), None)).await;

    let message = outcome.to_string();
    assert!(message.contains(GUEST), "{message}");
    assert!(message.contains("powered off"), "{message}");
    assert!(h.host.calls().is_empty(), "host was mutated: {:?}", h.host.calls());
}

#[tokio::test]
async fn unknown_gpu_is_a_precondition_failure() {
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Windows);
    let h = harness(host, ScriptedShell::with_installer([]));

    let mut req = request(None, None);
    req.gpu_device_id = r"PCI\VEN_8086&DEV_0001\0".into();
    let outcome = assign(&h, &req).await;

    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert!(outcome.to_string().contains("not found"));
    assert_eq!(h.host.called("attach"), 0);
}

#[tokio::test]
async fn linux_guest_without_credentials_is_rejected() {
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Linux);
    let h = harness(host, ScriptedShell::with_installer([]));

    let outcome = assign(&h, &request(None, None)).await;

    assert!(outcome.to_string().contains("credentials"));
    assert!(h.host.calls().is_empty());
}

#[tokio::test]
async fn legacy_attach_only_reserves_tags_and_releases() {
    let host = FakeHost::new(HostPlatform::Legacy, PowerState::Off, GuestOs::Windows);
    let h = harness(host, ScriptedShell::with_installer([]));

    let outcome = assign(&h, &request(None, None)).await;

    assert!(outcome.is_ok(), "{outcome}");
    assert_eq!(outcome.to_string(), "OK");
    assert!(outcome.warnings().iter().any(|w| w.contains("may not persist")));

    let calls = h.host.calls();
    let disable = calls.iter().position(|c| c == &format!("disable {SIBLING_ID}")).unwrap();
    let attach = calls.iter().position(|c| c == &format!("attach {GUEST} -")).unwrap();
    let enable = calls.iter().position(|c| c == &format!("enable {SIBLING_ID}")).unwrap();
    assert!(disable < attach && attach < enable, "{calls:?}");
    assert_eq!(h.host.called(&format!("disable {TARGET_ID}")), 0);

    let notes = h.host.notes.lock().unwrap().clone();
    assert!(notes.starts_with("build box [AssignedGPU:"), "{notes}");
    assert!(notes.ends_with(']'), "{notes}");
    assert_eq!(h.host.called(&format!("start {GUEST}")), 1);
}

#[tokio::test]
async fn failed_attach_still_reenables_siblings() {
    let mut host = FakeHost::new(HostPlatform::Legacy, PowerState::Off, GuestOs::Windows);
    host.fail_attach = true;
    let h = harness(host, ScriptedShell::with_installer([]));

    let outcome = assign(&h, &request(None, None)).await;

    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert!(outcome.to_string().contains(GUEST));
    assert_eq!(h.host.called(&format!("enable {SIBLING_ID}")), 1);
    assert_eq!(h.host.called("start"), 0);
}

#[tokio::test]
async fn modern_host_passes_the_instance_path_and_leaves_siblings_alone() {
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Windows);
    let h = harness(host, ScriptedShell::with_installer([]));

    let outcome = assign(&h, &request(None, None)).await;

    assert!(outcome.is_ok(), "{outcome}");
    assert!(outcome.warnings().is_empty());
    assert_eq!(h.host.called("disable"), 0);
    let expected = gpu(TARGET_ID, true).partitionable_name.unwrap();
    assert_eq!(h.host.called(&format!("attach {GUEST} {expected}")), 1);
    assert_eq!(h.host.called("set_notes"), 0);
}

// ---------------------------------------------------------------------------
// Windows injection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn windows_injection_stages_the_driver_package_and_patches_the_hive() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("DriverStore").join("FileRepository");
    let package = repo.join("nv_dispi.inf_amd64_1");
    fs::create_dir_all(package.join("x64")).unwrap();
    fs::write(package.join("nv_dispi.inf"), b"[Version]").unwrap();
    fs::write(package.join("x64").join("nvlddmkm.sys"), b"sys").unwrap();

    let volume = tmp.path().join("volume");
    fs::create_dir_all(volume.join("Windows").join("System32").join("config")).unwrap();

    let mut host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Windows);
    host.driver_files = vec![package.join("x64").join("nvlddmkm.sys")];
    host.volume_root = volume.clone();
    let h = harness_with(host, ScriptedShell::with_installer([]), tmp, &repo);

    let outcome = assign(&h, &request(Some(windows_partition()), None)).await;
    assert!(outcome.is_ok(), "{outcome}");

    let staged = volume
        .join("Windows/System32/HostDriverStore/FileRepository/nv_dispi.inf_amd64_1");
    assert_eq!(fs::read(staged.join("x64").join("nvlddmkm.sys")).unwrap(), b"sys");
    assert!(staged.join("nv_dispi.inf").exists());

    let calls = h.host.calls();
    assert_eq!(h.host.called(&format!("prepare {GUEST}")), 1);
    assert_eq!(h.host.called("letter Y 2"), 1);
    assert_eq!(h.host.called("unletter Y"), 1);
    assert_eq!(calls.last().map(String::as_str), Some(format!("dismount {GUEST}.vhdx").as_str()));

    let imported = h.host.imported.lock().unwrap().clone().unwrap();
    assert!(imported.contains(r"HKEY_LOCAL_MACHINE\OfflineSystem\ControlSet001\Services\nvlddmkm"));
    assert!(imported.contains("HostDriverStore"));
    assert!(h.host.called(r"reg unload HKLM\OfflineSystem") >= 1);

    set_tree_readonly(&volume, false).unwrap();
}

#[tokio::test]
async fn missing_system32_fails_and_still_detaches() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("FileRepository");
    fs::create_dir_all(&repo).unwrap();
    let volume = tmp.path().join("data-volume");
    fs::create_dir_all(&volume).unwrap();

    let mut host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Windows);
    host.volume_root = volume;
    let h = harness_with(host, ScriptedShell::with_installer([]), tmp, &repo);

    let outcome = assign(&h, &request(Some(windows_partition()), None)).await;

    assert!(outcome.to_string().contains("not a valid system partition"), "{outcome}");
    assert_eq!(h.host.called("unletter"), 1);
    assert_eq!(h.host.called("reg"), 0);
}

// ---------------------------------------------------------------------------
// Linux provisioning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linux_success_runs_every_phase() {
    let (_listener, port) = listener().await;
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Linux);
    let shell = ScriptedShell::with_installer([Installer::Prints("...\nSTATUS: SUCCESS\n")]);
    let h = harness(host, shell);

    let outcome = assign(&h, &request(None, Some(credentials(port)))).await;

    assert_eq!(outcome.to_string(), "OK");
    assert_eq!(h.host.called(&format!("start {GUEST}")), 1);
    assert_eq!(h.shell.count("wget -O"), 3);
    assert_eq!(h.shell.count("setup_graphics.sh"), 2);
    assert_eq!(h.shell.count("configure_system.sh enable_graphics"), 1);
    assert_eq!(*h.shell.background.lock().unwrap(), vec!["sudo reboot".to_string()]);
}

#[tokio::test]
async fn reboot_reentry_runs_the_pipeline_again() {
    let (_listener, port) = listener().await;
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Running, GuestOs::Linux);
    let shell = ScriptedShell::with_installer([
        Installer::Prints("STATUS: REBOOT_REQUIRED\n"),
        Installer::Prints("STATUS: SUCCESS\n"),
    ]);
    let h = harness(host, shell);

    let outcome = assign(&h, &request(None, Some(credentials(port)))).await;

    assert_eq!(outcome.to_string(), "OK");
    assert_eq!(h.shell.count("pwd"), 2);
    assert_eq!(h.shell.count("sudo reboot"), 1);
    assert_eq!(h.shell.count("configure_system.sh enable_graphics"), 1);
    assert_eq!(h.host.called("start"), 0);
}

#[tokio::test]
async fn second_reboot_request_returns_retry_without_finalizing() {
    let (_listener, port) = listener().await;
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Running, GuestOs::Linux);
    let shell = ScriptedShell::with_installer([
        Installer::Prints("STATUS: REBOOT_REQUIRED\n"),
        Installer::Prints("STATUS: REBOOT_REQUIRED\n"),
    ]);
    let h = harness(host, shell);

    let outcome = assign(&h, &request(None, Some(credentials(port)))).await;

    assert_eq!(outcome.to_string(), "REBOOT_REQUIRED_RETRY");
    assert!(matches!(outcome, Outcome::RebootRequiredRetry { .. }));
    assert_eq!(h.shell.count("configure_system.sh enable_graphics"), 0);
    assert_eq!(h.shell.count("setup_graphics.sh"), 2);
    assert!(h.shell.background.lock().unwrap().is_empty());
}

#[tokio::test]
async fn installer_timing_out_twice_is_fatal() {
    let (_listener, port) = listener().await;
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Running, GuestOs::Linux);
    let shell = ScriptedShell::with_installer([Installer::TimesOut, Installer::TimesOut]);
    let h = harness(host, shell);

    let outcome = assign(&h, &request(None, Some(credentials(port)))).await;

    assert!(matches!(outcome, Outcome::Failed { .. }), "{outcome}");
    assert!(outcome.to_string().contains("timed out"));
    let installs = h
        .shell
        .commands()
        .iter()
        .filter(|c| c.starts_with("sudo ") && c.contains("install_dxgkrnl.sh"))
        .count();
    assert_eq!(installs, 2);
    assert_eq!(h.shell.count("configure_system.sh enable_graphics"), 0);
}

#[tokio::test]
async fn installer_without_sentinel_fails() {
    let (_listener, port) = listener().await;
    let host = FakeHost::new(HostPlatform::Modern, PowerState::Running, GuestOs::Linux);
    let shell = ScriptedShell::with_installer([Installer::Prints("make: *** Error 2\n")]);
    let h = harness(host, shell);

    let outcome = assign(&h, &request(None, Some(credentials(port)))).await;

    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert_eq!(h.shell.count("configure_system.sh enable_graphics"), 0);
}

#[tokio::test]
async fn cancelled_attempt_reports_cancellation() {
    let host = FakeHost::new(HostPlatform::Legacy, PowerState::Off, GuestOs::Windows);
    let h = harness(host, ScriptedShell::with_installer([]));
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = h
        .orchestrator
        .add_gpu_partition(&request(None, None), &Progress::silent(), &cancel)
        .await;

    assert_eq!(outcome, Outcome::Cancelled { guest: GUEST.into() });
    assert_eq!(outcome.to_string(), "lab: Operation cancelled");
    assert!(h.host.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Partitions, adapters
// ---------------------------------------------------------------------------

/// Sparse image with one NTFS partition at 1 MiB and a small EFI partition.
fn write_image(path: &Path) {
    let mut file = fs::File::create(path).unwrap();
    file.set_len(4 << 30).unwrap();

    let mut mbr = [0u8; 512];
    let mut entry = |slot: usize, kind: u8, lba: u32, sectors: u32| {
        let at = 446 + slot * 16;
        mbr[at + 4] = kind;
        mbr[at + 8..at + 12].copy_from_slice(&lba.to_le_bytes());
        mbr[at + 12..at + 16].copy_from_slice(&sectors.to_le_bytes());
    };
    entry(0, 0xEF, 2048, 204_800);
    entry(1, 0x07, 206_848, 4_194_304);
    mbr[510] = 0x55;
    mbr[511] = 0xAA;

    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&mbr).unwrap();
}

#[test]
fn sparse_image_parses_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("disk.img");
    write_image(&image);

    let partitions = parse_partitions(&mut fs::File::open(&image).unwrap());

    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[1].index, 2);
    assert_eq!(partitions[1].start_offset_bytes, 206_848 * 512);
    assert_eq!(partitions[1].os_class, OsClass::Windows);
}

#[tokio::test]
async fn guest_partitions_filters_and_always_dismounts() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("disk.img");
    write_image(&image);

    let mut host = FakeHost::new(HostPlatform::Modern, PowerState::Off, GuestOs::Windows);
    host.raw_device = image;
    let h = harness(host, ScriptedShell::with_installer([]));

    let partitions = h.orchestrator.guest_partitions(GUEST).await.unwrap();

    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].index, 2);
    assert_eq!(h.host.called("dismount"), 2);
    assert_eq!(h.host.called("attach_disk"), 1);
}

#[tokio::test]
async fn adapters_fall_back_to_the_notes_tag_and_removal_clears_it() {
    let host = FakeHost::new(HostPlatform::Legacy, PowerState::Off, GuestOs::Windows);
    let h = harness(host, ScriptedShell::with_installer([]));
    assert!(assign(&h, &request(None, None)).await.is_ok());

    let adapters = h.orchestrator.assigned_adapters(GUEST).await.unwrap();
    assert_eq!(adapters.len(), 1);
    let path = adapters[0].instance_path.clone().unwrap();
    assert!(path.contains("VEN_10DE"), "{path}");

    h.orchestrator.remove_gpu_partition(GUEST, "adapter-1").await.unwrap();
    assert!(h.orchestrator.assigned_adapters(GUEST).await.unwrap().is_empty());
    assert_eq!(*h.host.notes.lock().unwrap(), "build box");
}
