//! Wrapper around the `gut` version-control backend.
//!
//! `gut` is a git build with renamed metadata (`.gut`, `.gutignore`), staged
//! per node under `<guts_home>/gut-build/bin/gut`. Every repository command
//! runs with its working directory pinned to the repository root.

use crate::compat::TailHash;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::exec::CommandSpec;
use crate::node::Node;

/// Backend metadata directory inside each repository.
pub const METADATA_DIR: &str = ".gut";
/// Ignore file; a change to it forces an untracked rescan.
pub const IGNORE_FILE: &str = ".gutignore";
/// Remote name each side uses for its peer.
pub const ORIGIN: &str = "origin";
/// Backend executable, relative to the guts home.
pub const EXE_RELATIVE_PATH: &str = "gut-build/bin/gut";
/// Directory (relative to the guts home) holding one link per served repository.
pub const DAEMON_REPOS_DIR: &str = "repos";

/// Backend operations on one repository of one node.
pub struct Backend<'a> {
    node: &'a Node,
    repo: String,
    config: &'a SyncConfig,
}

impl<'a> Backend<'a> {
    /// Backend for the node's sync root.
    pub fn new(node: &'a Node, config: &'a SyncConfig) -> Self {
        Self {
            node,
            repo: node.root().to_string(),
            config,
        }
    }

    /// Absolute path of the backend executable on this node.
    pub fn exe_path(&self) -> String {
        self.node.guts_path(EXE_RELATIVE_PATH)
    }

    fn gut(&self) -> CommandSpec {
        self.node.command(self.exe_path()).cwd(self.repo.clone())
    }

    pub async fn is_installed(&self) -> Result<bool> {
        self.node.exists(&self.exe_path()).await
    }

    /// Output of `gut --version`.
    pub async fn version(&self) -> Result<String> {
        let spec = self.node.command(self.exe_path()).arg("--version");
        Ok(self.node.run_checked(&spec).await?.stdout.trim().to_string())
    }

    pub async fn has_repository(&self) -> Result<bool> {
        let marker = self.node.path(METADATA_DIR);
        self.node.exists(&marker).await
    }

    /// Root (parentless) commit of HEAD. A missing repository, a failing
    /// query and empty output all mean "no resolvable root".
    pub async fn tail_hash(&self) -> Result<Option<TailHash>> {
        if !self.has_repository().await? {
            return Ok(None);
        }
        let spec = self.gut().args(["rev-list", "--max-parents=0", "HEAD"]);
        let output = self.node.run(&spec).await?;
        if !output.success() {
            tracing::debug!(
                host = %self.node.name(),
                code = ?output.code,
                "rev-list failed; treating tail hash as absent"
            );
            return Ok(None);
        }
        let hash = output.stdout.trim();
        Ok((!hash.is_empty()).then(|| TailHash::new(hash)))
    }

    pub async fn init(&self) -> Result<()> {
        tracing::info!(host = %self.node.name(), repo = %self.repo, "initializing gut repo");
        let mkdir = self.node.command("mkdir").args(["-p", self.repo.as_str()]);
        self.node.run_checked(&mkdir).await?;
        self.node.run_checked(&self.gut().arg("init")).await?;
        Ok(())
    }

    /// Seed a root commit in a freshly initialized repository.
    pub async fn ensure_initial_commit(&self) -> Result<()> {
        let head = self.gut().args(["rev-parse", "--verify", "--quiet", "HEAD"]);
        if self.node.run(&head).await?.success() {
            return Ok(());
        }
        let commit = self
            .gut()
            .args(["commit", "--allow-empty", "--quiet", "--message", "Initial commit"]);
        self.node.run_checked(&commit).await?;
        Ok(())
    }

    /// Stage everything under `prefix` and commit. With `include_untracked`
    /// the whole tree is rescanned: files that became ignored leave the
    /// index and previously untracked files anywhere are added.
    ///
    /// Returns whether a new revision was created.
    pub async fn commit(&self, prefix: &str, include_untracked: bool) -> Result<bool> {
        self.node
            .run_checked(&self.gut().args(["add", "--all", "--", prefix]))
            .await?;

        if include_untracked {
            let ignored = self.gut().args([
                "ls-files",
                "-z",
                "--cached",
                "--ignored",
                "--exclude-standard",
            ]);
            let listing = self.node.run_checked(&ignored).await?.stdout;
            let newly_ignored: Vec<&str> = listing.split('\0').filter(|p| !p.is_empty()).collect();
            if !newly_ignored.is_empty() {
                tracing::debug!(count = newly_ignored.len(), "dropping newly ignored files from index");
                let rm = self
                    .gut()
                    .args(["rm", "--cached", "--quiet", "--"])
                    .args(newly_ignored);
                self.node.run_checked(&rm).await?;
            }
            self.node
                .run_checked(&self.gut().args(["add", "--all", "--", "."]))
                .await?;
        }

        let staged = self.gut().args(["diff", "--cached", "--quiet"]);
        let status = self.node.run(&staged).await?;
        match status.code {
            Some(0) => return Ok(false),
            Some(1) => {}
            _ => {
                status.checked(self.node.name(), &staged)?;
            }
        }

        let commit = self
            .gut()
            .args(["commit", "--quiet", "--message", self.config.commit_message.as_str()]);
        self.node.run_checked(&commit).await?;
        Ok(true)
    }

    /// Pull from the peer, preferring the peer's side of any conflict.
    pub async fn pull(&self) -> Result<()> {
        let spec = self.gut().args([
            "pull",
            "--commit",
            "--no-edit",
            "--strategy=recursive",
            "--strategy-option=theirs",
            ORIGIN,
            self.config.branch.as_str(),
        ]);
        self.node.run_checked(&spec).await?;
        Ok(())
    }

    /// Start a detached `gut daemon` serving this repository as `<tail_hash>`.
    pub async fn daemon(&self, tail_hash: &TailHash, port: u16) -> Result<()> {
        let base = self.node.guts_path(DAEMON_REPOS_DIR);
        let link = self.node.guts_path(&format!("{}/{}", DAEMON_REPOS_DIR, tail_hash));
        self.node
            .run_checked(&self.node.command("mkdir").args(["-p", base.as_str()]))
            .await?;
        self.node
            .run_checked(
                &self
                    .node
                    .command("ln")
                    .args(["-sfn", self.repo.as_str(), link.as_str()]),
            )
            .await?;

        let spec = self.node.command(self.exe_path()).args([
            "daemon".to_string(),
            "--export-all".to_string(),
            "--reuseaddr".to_string(),
            "--listen=localhost".to_string(),
            format!("--port={}", port),
            format!("--base-path={}", base),
            link,
        ]);
        tracing::info!(host = %self.node.name(), port, tail = %tail_hash.short(), "starting gut daemon");
        self.node.spawn_detached(&spec).await
    }

    /// Point `origin` at the peer's daemon through the tunnel's connect port.
    pub async fn setup_origin(&self, tail_hash: &TailHash, connect_port: u16) -> Result<()> {
        // Absent on a fresh repository; a failure here is expected.
        self.node
            .run(&self.gut().args(["remote", "remove", ORIGIN]))
            .await?;
        let url = origin_url(tail_hash, connect_port);
        self.node
            .run_checked(&self.gut().args(["remote", "add", ORIGIN, url.as_str()]))
            .await?;
        Ok(())
    }
}

/// URL of the peer's daemon as seen through the tunnel.
pub fn origin_url(tail_hash: &TailHash, connect_port: u16) -> String {
    format!("gut://localhost:{}/{}/", connect_port, tail_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_url() {
        assert_eq!(
            origin_url(&TailHash::new("abc123"), 34001),
            "gut://localhost:34001/abc123/"
        );
    }
}
