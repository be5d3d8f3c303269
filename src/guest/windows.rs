//! Offline driver injection into a powered-off Windows guest.
//!
//! Mount the guest disk, give the system partition a free drive letter, stage
//! the host driver package under `Windows\System32\HostDriverStore`, patch the
//! offline registry for NVIDIA, and always detach the disk afterwards.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::disk::Partition;
use crate::error::{Error, Result};
use crate::gpu::{DriverSourceLocation, locate_driver_source};
use crate::guest::hive::patch_offline_hive;
use crate::host::{DiskMounter, GpuInventory, HiveTool};
use crate::progress::Progress;

#[derive(Debug, Clone)]
pub struct WindowsInjectorSettings {
    /// Host driver repository (`...\DriverStore\FileRepository`).
    pub driver_repository: PathBuf,
    /// Scratch directory for registry exports.
    pub temp_dir: PathBuf,
    /// Minimum spacing between non-forced progress lines.
    pub progress_interval: Duration,
    /// Pause after the defensive dismount.
    pub dismount_settle: Duration,
}

/// Progress lines rate-limited to one per interval unless forced.
#[derive(Clone)]
pub struct ThrottledProgress {
    inner: Progress,
    interval: Duration,
    last: Arc<Mutex<Option<Instant>>>,
}

impl ThrottledProgress {
    pub fn new(inner: Progress, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn line(&self, message: impl Into<String>, force: bool) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let due = last.is_none_or(|at| at.elapsed() >= self.interval);
        if force || due {
            self.inner.line(message);
            *last = Some(Instant::now());
        }
    }
}

/// Highest drive letter not in `used`, scanning Z down to A.
pub fn pick_free_drive_letter(used: &BTreeSet<char>) -> Option<char> {
    ('A'..='Z')
        .rev()
        .find(|c| !used.contains(c) && !used.contains(&c.to_ascii_lowercase()))
}

pub struct WindowsGuestInjector {
    disks: Arc<dyn DiskMounter>,
    gpus: Arc<dyn GpuInventory>,
    hives: Arc<dyn HiveTool>,
    settings: WindowsInjectorSettings,
}

impl WindowsGuestInjector {
    pub fn new(
        disks: Arc<dyn DiskMounter>,
        gpus: Arc<dyn GpuInventory>,
        hives: Arc<dyn HiveTool>,
        settings: WindowsInjectorSettings,
    ) -> Self {
        Self {
            disks,
            gpus,
            hives,
            settings,
        }
    }

    /// Stage drivers for `device_id` onto `partition` of `disk_image`.
    pub async fn inject(
        &self,
        disk_image: &Path,
        partition: &Partition,
        device_id: &str,
        vendor: &str,
        progress: &Progress,
    ) -> Result<()> {
        let progress = ThrottledProgress::new(progress.clone(), self.settings.progress_interval);

        progress.line("Preparing guest disk", true);
        if let Err(e) = self.disks.dismount(disk_image).await {
            warn!(image = %disk_image.display(), error = %e, "defensive dismount failed");
        }
        tokio::time::sleep(self.settings.dismount_settle).await;

        let mut letter = None;
        let result = self
            .inject_mounted(disk_image, partition, device_id, vendor, &progress, &mut letter)
            .await;

        progress.line("Detaching guest disk", true);
        if let Some(letter) = letter {
            if let Err(e) = self
                .disks
                .remove_drive_letter(disk_image, partition.index, letter)
                .await
            {
                warn!(letter = %letter, error = %e, "could not remove drive letter");
            }
        }
        if let Err(e) = self.disks.dismount(disk_image).await {
            warn!(image = %disk_image.display(), error = %e, "dismount after injection failed");
        }

        result
    }

    async fn inject_mounted(
        &self,
        disk_image: &Path,
        partition: &Partition,
        device_id: &str,
        vendor: &str,
        progress: &ThrottledProgress,
        assigned: &mut Option<char>,
    ) -> Result<()> {
        progress.line(format!("Mounting partition {}", partition.index), true);
        let used = self.disks.used_drive_letters().await?;
        let wanted = pick_free_drive_letter(&used)
            .ok_or_else(|| Error::Disk("no free drive letter available".into()))?;
        let letter = self
            .disks
            .assign_drive_letter(disk_image, partition.index, wanted)
            .await
            .map_err(|e| Error::Disk(format!("could not mount guest disk: {e:#}")))?;
        *assigned = Some(letter);

        let root = self.disks.drive_root(letter);
        let system32 = root.join("Windows").join("System32");
        if !system32.is_dir() {
            return Err(Error::Disk(format!(
                "partition {} ({letter}:) is not a valid system partition: Windows\\System32 not found",
                partition.index
            )));
        }

        let source =
            locate_driver_source(self.gpus.as_ref(), device_id, &self.settings.driver_repository).await;
        match &source {
            DriverSourceLocation::Precise(dir) => {
                progress.line(format!("Using driver package {}", dir.display()), true)
            }
            DriverSourceLocation::Repository(_) => {
                progress.line("Driver package not identified, copying the whole driver store", true)
            }
        }

        let destination =
            source.destination_under(&system32.join("HostDriverStore").join("FileRepository"));
        let source_dir = source.path().to_path_buf();
        let copy_progress = progress.clone();
        let copied = tokio::task::spawn_blocking(move || {
            stage_driver_tree(&source_dir, &destination, &copy_progress)
        })
        .await
        .map_err(|e| Error::transfer(source.path().display(), e))?
        .map_err(|e| Error::transfer(source.path().display(), e))?;
        progress.line(format!("Copied {copied} driver files"), true);

        if vendor.to_ascii_uppercase().contains("NVIDIA") {
            progress.line("Patching offline registry for NVIDIA", true);
            patch_offline_hive(self.hives.as_ref(), &root, &self.settings.temp_dir).await?;
        }

        info!(letter = %letter, partition = partition.index, "driver injection complete");
        Ok(())
    }
}

/// Copy `source` into `destination` (existing files overwritten, nothing
/// deleted), clearing read-only attributes beforehand and setting them on
/// the whole staged tree afterwards. Returns the number of files copied.
pub fn stage_driver_tree(source: &Path, destination: &Path, progress: &ThrottledProgress) -> io::Result<usize> {
    let total = WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    progress.line(format!("Synchronising {total} driver files"), true);

    fs::create_dir_all(destination)?;
    set_tree_readonly(destination, false)?;

    let mut copied = 0usize;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(source).map_err(io::Error::other)?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
            let percent = copied as f64 / total.max(1) as f64 * 100.0;
            progress.line(format!("Progress: {percent:.1}% ({copied}/{total})"), false);
        }
    }

    set_tree_readonly(destination, true)?;
    Ok(copied)
}

/// Set or clear the read-only attribute on `root` and everything below it.
pub fn set_tree_readonly(root: &Path, readonly: bool) -> io::Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(io::Error::other)?;
        set_readonly(entry.path(), readonly)?;
    }
    Ok(())
}

fn set_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if perms.readonly() == readonly {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        perms.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
    }
    #[cfg(not(unix))]
    perms.set_readonly(readonly);
    fs::set_permissions(path, perms)
}
