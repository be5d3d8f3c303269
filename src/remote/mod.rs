//! Remote command execution and file transfer against a guest.
//!
//! The guest side is reached through the system `ssh`/`scp` binaries (see
//! [`ssh::SshClient`]). Everything above this module talks to the
//! [`RemoteShell`] trait so tests can script command results.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::progress::{CancelToken, Progress};

pub mod ssh;

pub use ssh::{SshClient, SshClientFactory, SshOptions};

/// Commands starting with this prefix are run through [`elevate`].
pub const ELEVATION_PREFIX: &str = "sudo ";

/// HTTP proxy the guest should use for package downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyEndpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches("http://");
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing proxy host in '{s}'"));
        }
        let port = port
            .trim_end_matches('/')
            .parse()
            .map_err(|_| format!("invalid proxy port in '{s}'"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Remote-shell login for a Linux guest.
#[derive(Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub proxy: Option<ProxyEndpoint>,
    pub install_graphics: bool,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("proxy", &self.proxy)
            .field("install_graphics", &self.install_graphics)
            .finish()
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run one command, streaming its output to `progress` as it arrives.
    ///
    /// Returns the combined stdout/stderr text. A non-zero exit is
    /// [`Error::Command`](crate::error::Error::Command); exceeding `timeout`
    /// kills the process and yields [`Error::Timeout`](crate::error::Error::Timeout).
    async fn execute_one(
        &self,
        command: &str,
        progress: &Progress,
        timeout: Option<Duration>,
    ) -> Result<String>;

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Upload a directory tree. Remote directories are created parent-first
    /// before any file is written into them.
    async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()>;

    async fn write_text_file(&self, content: &str, remote: &str) -> Result<()>;

    /// Start a command without waiting for it (used for the final reboot).
    async fn execute_fire_and_forget(&self, command: &str);

    /// Poll the remote-shell port until it accepts connections.
    async fn wait_until_reachable(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancelToken,
    ) -> bool;

    /// `host:port` for messages.
    fn endpoint(&self) -> String;
}

/// Opens a [`RemoteShell`] for a set of credentials.
pub trait RemoteShellFactory: Send + Sync {
    fn connect(&self, credentials: &SshCredentials) -> Arc<dyn RemoteShell>;
}

/// Rewrite `command` to feed `password` to `sudo` non-interactively.
///
/// A leading `sudo ` is removed first so it is never doubled.
pub fn elevate(command: &str, password: &str) -> String {
    let command = command.trim();
    let command = command.strip_prefix(ELEVATION_PREFIX).unwrap_or(command).trim_start();
    let escaped = password.replace('\'', r"'\''");
    format!("echo '{escaped}' | sudo -S -E -p '' {command}")
}

/// Quote `value` for a POSIX shell unless it is made of safe characters only.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Join a remote POSIX path with one more component.
pub fn remote_join(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Poll `host:port` every `poll_interval` until a TCP handshake succeeds,
/// `timeout` elapses or `cancel` fires.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancelToken,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => debug!(host, port, error = %e, "port probe refused"),
            Err(_) => debug!(host, port, "port probe timed out"),
        }
        if Instant::now() + poll_interval > deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevation_pipes_escaped_password() {
        assert_eq!(
            elevate("sudo reboot", "pa'ss"),
            r"echo 'pa'\''ss' | sudo -S -E -p '' reboot"
        );
        assert_eq!(
            elevate("/home/u/deploy/install_dxgkrnl.sh", "pw"),
            "echo 'pw' | sudo -S -E -p '' /home/u/deploy/install_dxgkrnl.sh"
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/home/u/deploy"), "/home/u/deploy");
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn proxy_parsing() {
        let proxy: ProxyEndpoint = "10.0.0.1:7890".parse().unwrap();
        assert_eq!(proxy.url(), "http://10.0.0.1:7890");
        assert!("10.0.0.1".parse::<ProxyEndpoint>().is_err());
        assert!(":80".parse::<ProxyEndpoint>().is_err());
    }

    #[test]
    fn debug_hides_password() {
        let creds = SshCredentials {
            host: "h".into(),
            port: 22,
            username: "u".into(),
            password: Some("hunter2".into()),
            proxy: None,
            install_graphics: false,
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn port_probe_sees_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let up = wait_for_port(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_secs(1),
            &CancelToken::new(),
        )
        .await;
        assert!(up);
    }

    #[tokio::test]
    async fn port_probe_gives_up_when_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let up = wait_for_port(
            "127.0.0.1",
            9,
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_secs(5),
            &cancel,
        )
        .await;
        assert!(!up);
    }
}
