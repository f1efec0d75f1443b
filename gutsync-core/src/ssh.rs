//! Remote execution over the system `ssh` client.
//!
//! The multiplexed transport authenticates once with a ControlMaster
//! socket and routes every later command through it, which keeps the
//! per-command round trip low enough for the commit/pull loop. The direct
//! transport spawns an independent ssh per command.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::config::TransportKind;
use crate::error::{Result, SyncError};
use crate::exec::{
    child_lines, shell_line, shell_quote, CommandOutput, CommandSpec, Executor, LineStream,
    PathKind,
};

/// ssh exits with this code when the connection itself failed.
const SSH_CONNECTION_FAILED: i32 = 255;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: Option<String>) -> Self {
        Self {
            host: host.into(),
            user,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    /// `user@host`, or just `host`.
    pub fn address(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Options shared by every ssh invocation to this target.
    pub fn options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if let Some(identity) = &self.identity {
            opts.push("-i".to_string());
            opts.push(identity.to_string_lossy().into_owned());
        }
        opts
    }
}

/// Runs commands on a remote node through ssh.
#[derive(Debug)]
pub struct SshExecutor {
    target: SshTarget,
    control_path: Option<PathBuf>,
}

impl SshExecutor {
    /// Open the session. Fails with [`SyncError::Connection`] when the host
    /// cannot be reached or authentication fails.
    pub async fn connect(target: SshTarget, transport: TransportKind) -> Result<Self> {
        let executor = match transport {
            TransportKind::Multiplexed => {
                let control_path = control_socket_path();
                let executor = Self {
                    target,
                    control_path: Some(control_path),
                };
                let mut cmd = executor.ssh();
                cmd.args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes", "-f", "-N"])
                    .arg(executor.target.address());
                executor.connect_with(cmd, "ssh -f -N (control master)").await?;
                executor
            }
            TransportKind::Direct => {
                let executor = Self {
                    target,
                    control_path: None,
                };
                let mut cmd = executor.ssh();
                cmd.arg(executor.target.address()).arg("true");
                executor.connect_with(cmd, "ssh true").await?;
                executor
            }
        };
        tracing::info!(host = %executor.target.host, ?transport, "ssh session established");
        Ok(executor)
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn connect_with(&self, mut cmd: Command, label: &str) -> Result<()> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SyncError::Spawn {
                host: self.target.host.clone(),
                command: label.to_string(),
                source: e,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SyncError::Connection {
                host: self.target.host.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// An `ssh` command carrying the identity and control socket options.
    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.target.options());
        if let Some(control_path) = &self.control_path {
            cmd.arg("-o")
                .arg(format!("ControlPath={}", control_path.display()));
        }
        cmd
    }

    fn remote(&self, line: &str) -> Command {
        let mut cmd = self.ssh();
        cmd.arg(self.target.address()).arg("--").arg(line);
        cmd
    }

    fn spawn_error(&self, spec: &CommandSpec, source: std::io::Error) -> SyncError {
        SyncError::Spawn {
            host: self.target.host.clone(),
            command: spec.to_string(),
            source,
        }
    }

    fn connection_lost(&self, stderr: &str) -> SyncError {
        SyncError::Connection {
            host: self.target.host.clone(),
            detail: stderr.trim().to_string(),
        }
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(host = %self.target.host, command = %spec, "run");
        let output = self
            .remote(&shell_line(spec))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(spec, e))?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.code() == Some(SSH_CONNECTION_FAILED) {
            return Err(self.connection_lost(&stderr));
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            code: output.status.code(),
        })
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()> {
        tracing::debug!(host = %self.target.host, command = %spec, "spawn detached");
        let line = format!(
            "nohup sh -c {} > /dev/null 2>&1 < /dev/null &",
            shell_quote(&shell_line(spec))
        );
        let detach = CommandSpec::new("sh").arg("-c").arg(line);
        self.run(&detach).await?.checked(&self.target.host, spec)?;
        Ok(())
    }

    async fn spawn_lines(&self, spec: &CommandSpec) -> Result<LineStream> {
        tracing::debug!(host = %self.target.host, command = %spec, "spawn streaming");
        // A forced tty makes the remote process receive SIGHUP when the
        // local ssh is killed.
        let mut cmd = self.ssh();
        cmd.arg("-tt")
            .arg(self.target.address())
            .arg("--")
            .arg(shell_line(spec));
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(spec, e))?;
        Ok(child_lines(child))
    }

    async fn probe(&self, path: &str) -> Result<PathKind> {
        let quoted = shell_quote(path);
        let script = format!(
            "if [ -d {p} ]; then echo dir; ls -A {p} | wc -l; \
             elif [ -e {p} ]; then echo file; else echo missing; fi",
            p = quoted
        );
        let spec = CommandSpec::new("sh").arg("-c").arg(script);
        let output = self.run(&spec).await?.checked(&self.target.host, &spec)?;
        parse_probe_output(&output.stdout).ok_or_else(|| SyncError::Protocol {
            host: self.target.host.clone(),
            command: format!("probe {}", path),
            output: output.stdout.trim().to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        let Some(control_path) = &self.control_path else {
            return Ok(());
        };
        let output = self
            .ssh()
            .args(["-O", "exit"])
            .arg(self.target.address())
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            tracing::debug!(
                host = %self.target.host,
                socket = %control_path.display(),
                "control master already gone"
            );
        }
        Ok(())
    }
}

/// Parse the output of the remote probe script.
fn parse_probe_output(stdout: &str) -> Option<PathKind> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next()? {
        "missing" => Some(PathKind::Missing),
        "file" => Some(PathKind::File),
        "dir" => {
            let entries = lines.next()?.parse().ok()?;
            Some(PathKind::Directory { entries })
        }
        _ => None,
    }
}

/// Socket for the control master. `%C` is expanded by ssh to a fixed-length
/// hash of the connection, so long host names cannot push the path past
/// the platform's socket path limit. The pid keeps concurrent sessions to
/// the same host apart.
fn control_socket_path() -> PathBuf {
    PathBuf::from(format!("/tmp/gut-sync-{}-%C.sock", std::process::id()))
}
