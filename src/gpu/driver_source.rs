//! Locating the host driver package for a GPU.
//!
//! The lookup is a heuristic over the driver files the host reports for the
//! device. When it cannot pin down a single package the whole driver
//! repository is used instead; a failed lookup is never an error.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::host::GpuInventory;

const REPOSITORY_DIR_NAME: &str = "FileRepository";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverSourceLocation {
    /// One driver package directory inside the repository.
    Precise(PathBuf),
    /// The entire driver repository.
    Repository(PathBuf),
}

impl DriverSourceLocation {
    pub fn path(&self) -> &Path {
        match self {
            DriverSourceLocation::Precise(p) | DriverSourceLocation::Repository(p) => p,
        }
    }

    pub fn is_precise(&self) -> bool {
        matches!(self, DriverSourceLocation::Precise(_))
    }

    /// Final path component, used to name the copy on the guest.
    pub fn folder_name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| REPOSITORY_DIR_NAME.to_string())
    }

    /// Where this source lands under a guest's `FileRepository` directory.
    pub fn destination_under(&self, repository: &Path) -> PathBuf {
        match self {
            DriverSourceLocation::Precise(_) => repository.join(self.folder_name()),
            DriverSourceLocation::Repository(_) => repository.to_path_buf(),
        }
    }
}

/// Resolve the driver source for `device_id`, falling back to `repository_root`.
pub async fn locate_driver_source(
    inventory: &dyn GpuInventory,
    device_id: &str,
    repository_root: &Path,
) -> DriverSourceLocation {
    let files = match inventory.installed_driver_files(device_id).await {
        Ok(files) => files,
        Err(e) => {
            warn!(device = device_id, error = %e, "driver file query failed");
            Vec::new()
        }
    };

    let root = repository_root.to_path_buf();
    let precise = tokio::task::spawn_blocking(move || package_dir_from_files(&files, &root))
        .await
        .ok()
        .flatten();

    match precise {
        Some(dir) => {
            info!(device = device_id, package = %dir.display(), "precise driver package located");
            DriverSourceLocation::Precise(dir)
        }
        None => {
            info!(device = device_id, "no precise driver package, using whole repository");
            DriverSourceLocation::Repository(repository_root.to_path_buf())
        }
    }
}

/// Walk up from the first repository-resident driver file to its package
/// directory: the first ancestor holding `.inf` files, or the ancestor whose
/// parent is the repository. Falls back to the file's own directory.
pub fn package_dir_from_files(files: &[PathBuf], repository_root: &Path) -> Option<PathBuf> {
    let file = files
        .iter()
        .find(|f| f.to_string_lossy().to_ascii_lowercase().contains("filerepository"))?;
    let start = file.parent()?.to_path_buf();

    let mut current = start.clone();
    loop {
        if contains_inf(&current) {
            return existing_dir(current);
        }
        let parent = match current.parent() {
            Some(p) if p != current => p.to_path_buf(),
            _ => break,
        };
        if is_repository(&parent, repository_root) {
            return existing_dir(current);
        }
        current = parent;
    }

    debug!(file = %file.display(), "no package boundary found, using the file's directory");
    existing_dir(start)
}

fn is_repository(dir: &Path, repository_root: &Path) -> bool {
    dir == repository_root
        || dir
            .file_name()
            .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(REPOSITORY_DIR_NAME))
}

fn contains_inf(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("inf"))
            })
        })
        .unwrap_or(false)
}

fn existing_dir(dir: PathBuf) -> Option<PathBuf> {
    dir.is_dir().then_some(dir)
}
