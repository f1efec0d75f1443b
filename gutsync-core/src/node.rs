//! Nodes: one execution context per machine in a sync session.
//!
//! A node knows its OS family (which decides the path separator and PATH
//! additions), the absolute sync root and guts home, and holds the
//! executor used for every command. The PATH additions are computed at
//! construction, before any backend command runs.

use std::fmt;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::exec::{CommandOutput, CommandSpec, Executor, LineStream, LocalExecutor, PathKind};
use crate::ssh::{SshExecutor, SshTarget};

/// Which end of the session a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating system family of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    /// Classify the output of `uname -s`.
    pub fn from_uname(uname: &str) -> Self {
        let uname = uname.trim();
        match uname {
            "Linux" => OsFamily::Linux,
            "Darwin" => OsFamily::MacOs,
            "Windows" | "Windows_NT" => OsFamily::Windows,
            _ if uname.starts_with("MINGW")
                || uname.starts_with("MSYS")
                || uname.starts_with("CYGWIN") =>
            {
                OsFamily::Windows
            }
            _ => OsFamily::Other,
        }
    }

    /// Family of the machine gut-sync runs on.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }

    pub fn separator(self) -> char {
        match self {
            OsFamily::Windows => '\\',
            _ => '/',
        }
    }
}

/// Parsed `[user@]host:path` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub user: Option<String>,
    pub host: String,
    pub path: String,
}

impl RemoteSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, path) = s.split_once(':').ok_or_else(|| {
            SyncError::Config(
                "remote must include both the hostname and path, separated by a colon".into(),
            )
        })?;
        let (user, host) = match addr.rsplit_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, addr),
        };
        if host.is_empty() {
            return Err(SyncError::Config(format!("missing host in '{}'", s)));
        }
        if path.is_empty() {
            return Err(SyncError::Config(format!("missing remote path in '{}'", s)));
        }
        if user.as_deref() == Some("") {
            return Err(SyncError::Config(format!("empty user name in '{}'", s)));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    pub fn target(&self) -> SshTarget {
        SshTarget::new(self.host.clone(), self.user.clone())
    }
}

/// Facts about a machine discovered before a [`Node`] is assembled.
#[derive(Debug, Clone)]
pub struct NodeParts {
    pub side: Side,
    pub os: OsFamily,
    pub home: String,
    /// Directory relative sync paths resolve against.
    pub cwd: String,
    pub sync_path: String,
}

/// One machine taking part in a sync session.
#[derive(Debug)]
pub struct Node {
    side: Side,
    name: String,
    os: OsFamily,
    root: String,
    guts_home: String,
    path_extra: Vec<String>,
    executor: Arc<dyn Executor>,
}

impl Node {
    pub fn new(parts: NodeParts, executor: Arc<dyn Executor>, config: &SyncConfig) -> Self {
        let sep = parts.os.separator();
        let root = resolve_path(&parts.home, &parts.cwd, &parts.sync_path, sep);
        let guts_home = resolve_path(&parts.home, &parts.home, &config.guts_home, sep);
        let path_extra = match parts.os {
            // Homebrew installs here, and non-login shells often miss it.
            OsFamily::MacOs => vec!["/usr/local/bin".to_string()],
            OsFamily::Windows => vec![join_path(&guts_home, "inotify-win", sep)],
            _ => Vec::new(),
        };
        Self {
            side: parts.side,
            name: executor.host().to_string(),
            os: parts.os,
            root,
            guts_home,
            path_extra,
            executor,
        }
    }

    /// The machine gut-sync runs on.
    pub async fn connect_local(sync_path: &str, config: &SyncConfig) -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| SyncError::Config("cannot determine home directory".into()))?;
        let cwd = std::env::current_dir()?;
        let parts = NodeParts {
            side: Side::Local,
            os: OsFamily::current(),
            home: home.to_string_lossy().into_owned(),
            cwd: cwd.to_string_lossy().into_owned(),
            sync_path: sync_path.to_string(),
        };
        Ok(Self::new(parts, Arc::new(LocalExecutor::new()), config))
    }

    /// Open an ssh session to `target` and probe the remote machine.
    pub async fn connect_remote(
        target: SshTarget,
        sync_path: &str,
        config: &SyncConfig,
    ) -> Result<Self> {
        let executor = SshExecutor::connect(target, config.transport).await?;
        let host = executor.host().to_string();

        let uname = CommandSpec::new("uname").arg("-s");
        let os = OsFamily::from_uname(&executor.run(&uname).await?.checked(&host, &uname)?.stdout);
        let printenv = CommandSpec::new("printenv").arg("HOME");
        let home = executor.run(&printenv).await?.checked(&host, &printenv)?.stdout;
        let pwd = CommandSpec::new("pwd");
        let cwd = executor.run(&pwd).await?.checked(&host, &pwd)?.stdout;
        tracing::debug!(host = %host, ?os, home = %home.trim(), "probed remote node");

        let parts = NodeParts {
            side: Side::Remote,
            os,
            home: home.trim().to_string(),
            cwd: cwd.trim().to_string(),
            sync_path: sync_path.to_string(),
        };
        Ok(Self::new(parts, Arc::new(executor), config))
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }

    pub fn separator(&self) -> char {
        self.os.separator()
    }

    /// Absolute sync root.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn guts_home(&self) -> &str {
        &self.guts_home
    }

    pub fn path_extra(&self) -> &[String] {
        &self.path_extra
    }

    /// `host:root`, for diagnostics.
    pub fn describe(&self) -> String {
        format!("{}:{}", self.name, self.root)
    }

    /// Absolute path of `relative` under the sync root. `""` and `"."` are the root itself.
    pub fn path(&self, relative: &str) -> String {
        if relative.is_empty() || relative == "." {
            return self.root.clone();
        }
        join_path(&self.root, relative, self.separator())
    }

    /// Path of `relative` under the guts home directory.
    pub fn guts_path(&self, relative: &str) -> String {
        join_path(&self.guts_home, relative, self.separator())
    }

    /// Convert an absolute path reported by a watcher into one relative to
    /// the sync root. Returns `None` for paths outside the root.
    pub fn relativize(&self, absolute: &str) -> Option<String> {
        let sep = self.separator();
        let rest = absolute.strip_prefix(self.root.as_str())?;
        if rest.is_empty() {
            return Some(".".to_string());
        }
        let rest = rest.strip_prefix(sep)?;
        let rest = rest.trim_end_matches(sep);
        if rest.is_empty() {
            Some(".".to_string())
        } else {
            Some(rest.to_string())
        }
    }

    /// Start a command for this node with its PATH additions applied.
    pub fn command(&self, program: impl Into<String>) -> CommandSpec {
        CommandSpec::new(program).path_extra(&self.path_extra)
    }

    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.executor.run(spec).await
    }

    /// Run and turn a non-zero exit into [`SyncError::Exec`].
    pub async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.executor.run(spec).await?.checked(&self.name, spec)
    }

    pub async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()> {
        self.executor.spawn_detached(spec).await
    }

    pub async fn spawn_lines(&self, spec: &CommandSpec) -> Result<LineStream> {
        self.executor.spawn_lines(spec).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.executor.probe(path).await? != PathKind::Missing)
    }

    /// Whether `path` is unsafe to initialize a repository into: false when
    /// it does not exist or is an empty directory, true otherwise.
    pub async fn is_occupied(&self, path: &str) -> Result<bool> {
        Ok(match self.executor.probe(path).await? {
            PathKind::Missing => false,
            PathKind::Directory { entries } => entries > 0,
            PathKind::File => true,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.executor.close().await
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.side)
    }
}

fn is_absolute(path: &str, sep: char) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with(sep)
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Join `rel` onto `base`, normalizing `rel` to the node separator.
pub(crate) fn join_path(base: &str, rel: &str, sep: char) -> String {
    let rel: String = rel
        .chars()
        .map(|c| if c == '/' || c == '\\' { sep } else { c })
        .collect();
    let rel = rel.trim_start_matches(sep);
    let base = base.trim_end_matches(sep);
    if base.is_empty() {
        format!("{}{}", sep, rel)
    } else {
        format!("{}{}{}", base, sep, rel)
    }
}

/// Expand `~` against `home`, resolve relative paths against `cwd`, and
/// strip trailing separators.
fn resolve_path(home: &str, cwd: &str, path: &str, sep: char) -> String {
    let resolved = if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        join_path(home, rest, sep)
    } else if is_absolute(path, sep) {
        path.to_string()
    } else {
        join_path(cwd, path, sep)
    };
    let trimmed = resolved.trim_end_matches(sep);
    if trimmed.is_empty() {
        sep.to_string()
    } else {
        trimmed.to_string()
    }
}
