//! Application directory structure for gpu-partitioner.
//!
//! - Config: `~/.config/gpu-partitioner/` (`%APPDATA%\gpu-partitioner` on Windows)
//! - Cache:  scratch space for registry exports and staged downloads
//! - Logs:   `GPU_PARTITIONER_LOG=1` file output
//!
//! XDG variables are honoured where set.

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "gpu-partitioner";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config
    pub config: PathBuf,
    /// Regenerable scratch data
    pub cache: PathBuf,
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's profile.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = home_dir()?;
        Some(Self {
            config: resolve_config_dir(&home),
            cache: resolve_cache_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE_NAME)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.cache, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

#[cfg(windows)]
fn resolve_config_dir(home: &Path) -> PathBuf {
    std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join("AppData").join("Roaming"))
        .join(APP_NAME)
}

#[cfg(not(windows))]
fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(windows)]
fn local_app_data(home: &Path) -> PathBuf {
    std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join("AppData").join("Local"))
        .join(APP_NAME)
}

#[cfg(windows)]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    local_app_data(home).join("cache")
}

#[cfg(not(windows))]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

#[cfg(windows)]
fn resolve_log_dir(home: &Path) -> PathBuf {
    local_app_data(home).join("logs")
}

#[cfg(not(windows))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
