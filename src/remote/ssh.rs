//! [`RemoteShell`] over the system OpenSSH client.
//!
//! Each operation spawns one `ssh` or `scp` process. Password logins go
//! through `sshpass -e` with the password in the child's environment so it
//! never appears on a command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{
    ELEVATION_PREFIX, RemoteShell, RemoteShellFactory, SshCredentials, elevate, remote_join,
    shell_quote, wait_for_port,
};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, Progress};

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Maximum paths passed to one `mkdir -p` or `scp` invocation.
const BATCH: usize = 64;

const READ_CHUNK: usize = 4096;

/// Client-side programs and limits.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_program: PathBuf,
    pub scp_program: PathBuf,
    pub sshpass_program: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
            sshpass_program: PathBuf::from("sshpass"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SshClient {
    credentials: SshCredentials,
    options: SshOptions,
}

impl SshClient {
    pub fn new(credentials: SshCredentials, options: SshOptions) -> Self {
        Self {
            credentials,
            options,
        }
    }

    fn common_opts(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={NULL_DEVICE}"),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
        ];
        if self.credentials.password.is_none() {
            opts.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        opts
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.credentials.username, self.credentials.host)
    }

    /// `program`, or `sshpass -e program` when logging in with a password.
    fn base_command(&self, program: &Path) -> Command {
        match &self.credentials.password {
            Some(password) => {
                let mut cmd = Command::new(&self.options.sshpass_program);
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            None => Command::new(program),
        }
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = self.base_command(&self.options.ssh_program);
        cmd.arg("-p")
            .arg(self.credentials.port.to_string())
            .args(self.common_opts())
            .arg(self.destination())
            .arg(remote_command)
            .kill_on_drop(true);
        cmd
    }

    fn scp(&self, sources: &[PathBuf], remote_target: &str) -> Command {
        let mut cmd = self.base_command(&self.options.scp_program);
        cmd.arg("-q")
            .arg("-P")
            .arg(self.credentials.port.to_string())
            .args(self.common_opts())
            .args(sources)
            .arg(format!("{}:{}", self.destination(), remote_target))
            .kill_on_drop(true);
        cmd
    }

    /// Apply the elevation rewrite when the command asks for it.
    fn prepare(&self, command: &str) -> String {
        match &self.credentials.password {
            Some(password) if command.trim_start().starts_with(ELEVATION_PREFIX) => {
                elevate(command, password)
            }
            _ => command.to_string(),
        }
    }

    async fn run_transfer(&self, mut cmd: Command, what: &str) -> Result<()> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::transfer(what, format!("failed to spawn scp: {e}")))?;
        if !output.status.success() {
            return Err(Error::transfer(
                what,
                format!(
                    "scp exited with status {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward raw chunks from `reader` until EOF, keeping multi-byte
/// characters intact across chunk boundaries.
async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() && tx.send((stream, text)).is_err() {
                    break;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&pending).into_owned()));
    }
}

/// Drain the decodable prefix of `pending`. An incomplete trailing sequence
/// stays behind for the next chunk; invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

struct Captured {
    exit_code: i32,
    combined: String,
    stderr: String,
}

async fn collect(child: &mut Child, progress: &Progress) -> std::io::Result<Captured> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(out) = child.stdout.take() {
        tokio::spawn(pump(out, Stream::Stdout, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(pump(err, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    let mut combined = String::new();
    let mut stderr = String::new();
    while let Some((stream, chunk)) = rx.recv().await {
        progress.output(&chunk);
        combined.push_str(&chunk);
        if stream == Stream::Stderr {
            stderr.push_str(&chunk);
        }
    }

    let status = child.wait().await?;
    Ok(Captured {
        exit_code: status.code().unwrap_or(-1),
        combined,
        stderr,
    })
}

/// Remote directories and file copies for one directory upload.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadPlan {
    /// Every directory to create, parents before children.
    pub directories: Vec<String>,
    /// Local files grouped by the remote directory they go into.
    pub files: BTreeMap<String, Vec<PathBuf>>,
}

/// Walk `local_root` and map it onto `remote_root`.
pub fn plan_directory_upload(local_root: &Path, remote_root: &str) -> Result<UploadPlan> {
    let mut plan = UploadPlan::default();
    for entry in WalkDir::new(local_root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::transfer(local_root.display(), e))?;
        let relative = entry
            .path()
            .strip_prefix(local_root)
            .map_err(|e| Error::transfer(entry.path().display(), e))?;
        let remote = relative
            .components()
            .fold(remote_root.trim_end_matches('/').to_string(), |acc, c| {
                remote_join(&acc, &c.as_os_str().to_string_lossy())
            });

        if entry.file_type().is_dir() {
            plan.directories.push(remote);
        } else if entry.file_type().is_file() {
            let parent = match remote.rsplit_once('/') {
                Some((parent, _)) if !parent.is_empty() => parent.to_string(),
                _ => "/".to_string(),
            };
            plan.files
                .entry(parent)
                .or_default()
                .push(entry.path().to_path_buf());
        }
    }
    Ok(plan)
}

#[async_trait]
impl RemoteShell for SshClient {
    async fn execute_one(
        &self,
        command: &str,
        progress: &Progress,
        timeout: Option<Duration>,
    ) -> Result<String> {
        debug!(host = %self.credentials.host, command, "ssh exec");
        let mut child = self
            .ssh(&self.prepare(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Command {
                command: command.to_string(),
                exit_code: -1,
                stderr: format!("failed to spawn ssh: {e}"),
            })?;

        let captured = match timeout {
            Some(limit) => match tokio::time::timeout(limit, collect(&mut child, progress)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command, timeout_secs = limit.as_secs(), "remote command timed out");
                    let _ = child.start_kill();
                    return Err(Error::Timeout {
                        command: command.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => collect(&mut child, progress).await,
        }
        .map_err(|e| Error::Command {
            command: command.to_string(),
            exit_code: -1,
            stderr: e.to_string(),
        })?;

        if captured.exit_code != 0 {
            return Err(Error::Command {
                command: command.to_string(),
                exit_code: captured.exit_code,
                stderr: captured.stderr.trim().to_string(),
            });
        }
        Ok(captured.combined)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(local = %local.display(), remote, "scp upload");
        self.run_transfer(self.scp(&[local.to_path_buf()], &shell_quote(remote)), remote)
            .await
    }

    async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()> {
        let plan = plan_directory_upload(local, remote)?;
        let file_count: usize = plan.files.values().map(Vec::len).sum();
        info!(local = %local.display(), remote, dirs = plan.directories.len(), files = file_count,
              "uploading directory");

        for dirs in plan.directories.chunks(BATCH) {
            let quoted: Vec<String> = dirs.iter().map(|d| shell_quote(d)).collect();
            self.execute_one(&format!("mkdir -p {}", quoted.join(" ")), &Progress::silent(), None)
                .await
                .map_err(|e| Error::transfer(remote, e))?;
        }

        for (dir, files) in &plan.files {
            for batch in files.chunks(BATCH) {
                let target = format!("{}/", shell_quote(dir).trim_end_matches('/'));
                self.run_transfer(self.scp(batch, &target), dir).await?;
            }
        }
        Ok(())
    }

    async fn write_text_file(&self, content: &str, remote: &str) -> Result<()> {
        let mut child = self
            .ssh(&format!("cat > {}", shell_quote(remote)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::transfer(remote, format!("failed to spawn ssh: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| Error::transfer(remote, e))?;
            // Dropping stdin closes it so `cat` sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::transfer(remote, e))?;
        if !output.status.success() {
            return Err(Error::transfer(
                remote,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn execute_fire_and_forget(&self, command: &str) {
        let mut cmd = self.ssh(&self.prepare(command));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        match cmd.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                debug!(command, "fire-and-forget dispatched");
            }
            Err(e) => warn!(command, error = %e, "fire-and-forget spawn failed"),
        }
    }

    async fn wait_until_reachable(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancelToken,
    ) -> bool {
        wait_for_port(
            &self.credentials.host,
            self.credentials.port,
            Duration::from_secs(2),
            poll_interval,
            timeout,
            cancel,
        )
        .await
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.credentials.host, self.credentials.port)
    }
}

/// Produces one [`SshClient`] per credential set.
#[derive(Debug, Clone, Default)]
pub struct SshClientFactory {
    pub options: SshOptions,
}

impl RemoteShellFactory for SshClientFactory {
    fn connect(&self, credentials: &SshCredentials) -> Arc<dyn RemoteShell> {
        Arc::new(SshClient::new(credentials.clone(), self.options.clone()))
    }
}
