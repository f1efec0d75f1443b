//! Command execution on a node.
//!
//! Everything the orchestrator does to a machine goes through [`Executor`]:
//! one-shot commands, detached daemons, streaming watchers and the two
//! filesystem probes the bootstrap guard needs. There are two
//! implementations, [`LocalExecutor`] here and
//! [`SshExecutor`](crate::ssh::SshExecutor) for remote nodes; a node picks
//! one at construction and keeps it for its lifetime.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::{Result, SyncError};

/// Lines of stdout from a long-running process. Dropping the stream kills the process.
pub type LineStream = BoxStream<'static, std::io::Result<String>>;

/// A program invocation, independent of where it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory on the target node.
    pub cwd: Option<String>,
    /// Entries appended to the node's PATH.
    pub path_extra: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            path_extra: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn path_extra(mut self, extra: &[String]) -> Self {
        self.path_extra.extend(extra.iter().cloned());
        self
    }

    /// First argument, which for backend commands is the subcommand name.
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: Some(0),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`SyncError::Exec`].
    pub fn checked(self, host: &str, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(SyncError::Exec {
                host: host.to_string(),
                command: spec.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// What lives at a path on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File,
    Directory { entries: usize },
}

/// Runs commands and filesystem probes on one machine.
#[async_trait]
pub trait Executor: Send + Sync + fmt::Debug {
    /// Host name used in diagnostics.
    fn host(&self) -> &str;

    /// Run a command to completion. A non-zero exit is not an error here;
    /// the caller decides what it means.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start a long-lived process and return without waiting for it.
    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()>;

    /// Start a long-lived process and stream its stdout line by line.
    async fn spawn_lines(&self, spec: &CommandSpec) -> Result<LineStream>;

    async fn probe(&self, path: &str) -> Result<PathKind>;

    /// Release any connection held by the executor.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Executes on the machine gut-sync itself runs on.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    host: String,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
        }
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if !spec.path_extra.is_empty() {
            let mut paths: Vec<std::path::PathBuf> = std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default();
            paths.extend(spec.path_extra.iter().map(Into::into));
            if let Ok(joined) = std::env::join_paths(paths) {
                cmd.env("PATH", joined);
            }
        }
        cmd
    }

    fn spawn_error(&self, spec: &CommandSpec, source: std::io::Error) -> SyncError {
        SyncError::Spawn {
            host: self.host.clone(),
            command: spec.to_string(),
            source,
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(host = %self.host, command = %spec, "run");
        let output = self
            .command(spec)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(spec, e))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()> {
        tracing::debug!(host = %self.host, command = %spec, "spawn detached");
        let mut cmd = self.command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Keep Ctrl-C aimed at gut-sync from reaching the daemon.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn().map_err(|e| self.spawn_error(spec, e))?;
        Ok(())
    }

    async fn spawn_lines(&self, spec: &CommandSpec) -> Result<LineStream> {
        tracing::debug!(host = %self.host, command = %spec, "spawn streaming");
        let child = self
            .command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(spec, e))?;
        Ok(child_lines(child))
    }

    async fn probe(&self, path: &str) -> Result<PathKind> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PathKind::Missing),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Ok(PathKind::File);
        }
        let mut entries = 0;
        let mut dir = tokio::fs::read_dir(path).await?;
        while dir.next_entry().await?.is_some() {
            entries += 1;
        }
        Ok(PathKind::Directory { entries })
    }
}

/// Stream the stdout of a spawned child. The child travels with the stream
/// so that dropping the stream drops (and kills) the child.
pub(crate) fn child_lines(mut child: Child) -> LineStream {
    let lines = child.stdout.take().map(|out| BufReader::new(out).lines());
    futures::stream::unfold((child, lines), |(child, lines)| async move {
        let mut lines = lines?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), (child, Some(lines)))),
            Ok(None) => None,
            Err(e) => Some((Err(e), (child, None))),
        }
    })
    .boxed()
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Render a command as a single shell line for a remote login shell:
/// PATH extension, working directory, then the quoted argv.
pub fn shell_line(spec: &CommandSpec) -> String {
    let mut line = String::new();
    if !spec.path_extra.is_empty() {
        line.push_str(&format!(
            "PATH=\"$PATH\":{}; export PATH; ",
            shell_quote(&spec.path_extra.join(":"))
        ));
    }
    if let Some(cwd) = &spec.cwd {
        line.push_str(&format!("cd {} && ", shell_quote(cwd)));
    }
    line.push_str(&shell_quote(&spec.program));
    for arg in &spec.args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain/path-1.txt"), "plain/path-1.txt");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_shell_line() {
        let spec = CommandSpec::new("/home/u/.guts/gut-build/bin/gut")
            .args(["commit", "--message", "auto commit"])
            .cwd("/home/u/my proj")
            .path_extra(&["/usr/local/bin".to_string()]);
        assert_eq!(
            shell_line(&spec),
            "PATH=\"$PATH\":/usr/local/bin; export PATH; cd '/home/u/my proj' && \
             /home/u/.guts/gut-build/bin/gut commit --message 'auto commit'"
        );
    }

    #[test]
    fn test_checked_output() {
        let spec = CommandSpec::new("gut").arg("pull");
        assert!(CommandOutput::ok("done").checked("h", &spec).is_ok());
        let err = CommandOutput::failed(1, "conflict\n")
            .checked("h", &spec)
            .unwrap_err();
        match err {
            SyncError::Exec { command, code, stderr, .. } => {
                assert_eq!(command, "gut pull");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "conflict");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_run_captures_output_and_code() {
        let exec = LocalExecutor::new();
        let out = exec
            .run(&CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_local_run_uses_cwd() {
        let tmp = TempDir::new().unwrap();
        let exec = LocalExecutor::new();
        let cwd = tmp.path().canonicalize().unwrap();
        let out = exec
            .run(&CommandSpec::new("pwd").cwd(cwd.to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), cwd.to_string_lossy());
    }

    #[tokio::test]
    async fn test_local_spawn_failure() {
        let exec = LocalExecutor::new();
        let err = exec
            .run(&CommandSpec::new("/definitely/not/a/program"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_local_probe() {
        let tmp = TempDir::new().unwrap();
        let exec = LocalExecutor::new();
        let root = tmp.path().to_string_lossy().to_string();

        assert_eq!(
            exec.probe(&root).await.unwrap(),
            PathKind::Directory { entries: 0 }
        );
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        assert_eq!(
            exec.probe(&root).await.unwrap(),
            PathKind::Directory { entries: 1 }
        );
        let file = tmp.path().join("a.txt").to_string_lossy().to_string();
        assert_eq!(exec.probe(&file).await.unwrap(), PathKind::File);
        let missing = tmp.path().join("missing").to_string_lossy().to_string();
        assert_eq!(exec.probe(&missing).await.unwrap(), PathKind::Missing);
    }

    #[tokio::test]
    async fn test_local_spawn_lines() {
        let exec = LocalExecutor::new();
        let mut lines = exec
            .spawn_lines(&CommandSpec::new("printf").arg("one\\ntwo\\n"))
            .await
            .unwrap();
        assert_eq!(lines.next().await.unwrap().unwrap(), "one");
        assert_eq!(lines.next().await.unwrap().unwrap(), "two");
        assert!(lines.next().await.is_none());
    }
}
