//! Offline registry patch for NVIDIA guests.
//!
//! The host's `nvlddmkm` service key is exported, re-pointed at the guest's
//! offline `SYSTEM` hive (loaded under a temporary key) with its driver
//! paths redirected to `HostDriverStore`, and imported. The hive is always
//! unloaded and the export file always deleted, whatever happened before.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::host::HiveTool;

pub const OFFLINE_HIVE_KEY: &str = r"HKLM\OfflineSystem";
pub const HOST_SERVICE_KEY: &str = r"HKLM\SYSTEM\CurrentControlSet\Services\nvlddmkm";

const EXPORTED_KEY_PATH: &str = r"HKEY_LOCAL_MACHINE\SYSTEM\CurrentControlSet\Services\nvlddmkm";
const OFFLINE_KEY_PATH: &str = r"HKEY_LOCAL_MACHINE\OfflineSystem\ControlSet001\Services\nvlddmkm";

const UTF16LE_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Guest `SYSTEM` hive under a mounted volume root.
pub fn system_hive_path(volume_root: &Path) -> PathBuf {
    volume_root
        .join("Windows")
        .join("System32")
        .join("config")
        .join("SYSTEM")
}

pub async fn patch_offline_hive(tool: &dyn HiveTool, volume_root: &Path, temp_dir: &Path) -> Result<()> {
    // A previous crashed run may have left the key loaded.
    let _ = tool.unload_hive(OFFLINE_HIVE_KEY).await;

    let export_file = temp_dir.join(format!("nvlddmkm_{}.reg", Uuid::new_v4()));
    let result = patch(tool, &system_hive_path(volume_root), &export_file).await;

    if let Err(e) = tool.unload_hive(OFFLINE_HIVE_KEY).await {
        warn!(error = %e, "offline hive unload failed");
    }
    if let Err(e) = tokio::fs::remove_file(&export_file).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %export_file.display(), error = %e, "could not delete registry export");
        }
    }

    result
}

async fn patch(tool: &dyn HiveTool, hive: &Path, export_file: &Path) -> Result<()> {
    tool.export_key(HOST_SERVICE_KEY, export_file)
        .await
        .map_err(|e| Error::OfflineHive(format!("exporting host driver service key: {e:#}")))?;

    tool.load_hive(OFFLINE_HIVE_KEY, hive)
        .await
        .map_err(|e| Error::OfflineHive(format!("loading guest hive {}: {e:#}", hive.display())))?;

    let exported = tokio::fs::read(export_file)
        .await
        .map_err(|e| Error::OfflineHive(format!("reading registry export: {e}")))?;
    tokio::fs::write(export_file, rewrite_registry_export(&exported))
        .await
        .map_err(|e| Error::OfflineHive(format!("writing registry export: {e}")))?;

    tool.import_file(export_file)
        .await
        .map_err(|e| Error::OfflineHive(format!("importing patched key: {e:#}")))?;

    info!(hive = %hive.display(), "offline driver service key patched");
    Ok(())
}

/// Rewrite a `reg export` file, keeping its encoding.
///
/// `reg.exe` writes UTF-16LE with a BOM; UTF-8 (with or without BOM) is
/// accepted too.
pub fn rewrite_registry_export(raw: &[u8]) -> Vec<u8> {
    if let Some(body) = raw.strip_prefix(&UTF16LE_BOM) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = rewrite_registry_text(&String::from_utf16_lossy(&units));
        let mut out = UTF16LE_BOM.to_vec();
        out.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
        return out;
    }

    let (bom, body) = match raw.strip_prefix(&UTF8_BOM) {
        Some(body) => (&UTF8_BOM[..], body),
        None => (&[][..], raw),
    };
    let mut out = bom.to_vec();
    out.extend_from_slice(rewrite_registry_text(&String::from_utf8_lossy(body)).as_bytes());
    out
}

/// Point the key at the offline hive and redirect `DriverStore` paths to
/// `HostDriverStore` (existing `HostDriverStore` text is left alone).
pub fn rewrite_registry_text(text: &str) -> String {
    const PLACEHOLDER: &str = "\u{0}HOST_DRIVER_STORE\u{0}";
    text.replace(EXPORTED_KEY_PATH, OFFLINE_KEY_PATH)
        .replace("HostDriverStore", PLACEHOLDER)
        .replace("DriverStore", "HostDriverStore")
        .replace(PLACEHOLDER, "HostDriverStore")
}
