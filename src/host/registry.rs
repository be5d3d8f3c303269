//! `reg.exe`-backed [`HiveTool`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::HiveTool;

pub struct RegExe {
    program: PathBuf,
}

impl Default for RegExe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("reg.exe"),
        }
    }
}

impl RegExe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn reg(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "reg {} exited with status {}: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(args = ?args, "reg ok");
        Ok(())
    }
}

#[async_trait]
impl HiveTool for RegExe {
    async fn export_key(&self, key: &str, file: &Path) -> Result<()> {
        self.reg(&["export", key, &file.to_string_lossy(), "/y"]).await
    }

    async fn load_hive(&self, key: &str, hive_file: &Path) -> Result<()> {
        self.reg(&["load", key, &hive_file.to_string_lossy()]).await
    }

    async fn import_file(&self, file: &Path) -> Result<()> {
        self.reg(&["import", &file.to_string_lossy()]).await
    }

    async fn unload_hive(&self, key: &str) -> Result<()> {
        self.reg(&["unload", key]).await
    }
}
