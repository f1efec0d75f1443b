//! Sync sessions: the pairing of two nodes around one shared history.
//!
//! [`run_sync`] is the whole pipeline a `gut-sync sync` invocation runs:
//! connect, verify the backend, allocate ports, decide compatibility,
//! tunnel, bootstrap, watch, and loop until shutdown.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::bootstrap::bootstrap;
use crate::compat::{Relationship, TailHash, check_compatibility, get_tail_hash};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::node::{Node, RemoteSpec, Side};
use crate::paths::{ROOT_PREFIX, common_prefix_trim};
use crate::ports::{SessionPorts, find_open_ports};
use crate::shutdown::Shutdown;
use crate::ssh::SshTarget;
use crate::sync_loop::{
    ChangeSink, EventReceiver, EventSender, LoopExit, PendingChanges, SyncEvent, SyncLoop,
    event_queue,
};
use crate::tunnel::Tunnel;
use crate::watch::spawn_watcher;

/// An established pairing of the local and remote node.
///
/// The tail hash is fixed when the session is established; a session whose
/// histories diverge afterwards is invalid and must be torn down.
#[derive(Debug)]
pub struct SyncSession {
    local: Arc<Node>,
    remote: Arc<Node>,
    tail_hash: TailHash,
    ports: SessionPorts,
    config: Arc<SyncConfig>,
}

impl SyncSession {
    /// Bootstrap as `relationship` requires, wire each side's `origin` to
    /// the other, and check that both nodes now share one root commit.
    pub async fn establish(
        local: Arc<Node>,
        remote: Arc<Node>,
        relationship: Relationship,
        ports: SessionPorts,
        config: Arc<SyncConfig>,
    ) -> Result<Self> {
        let relationship = relationship.into_result()?;
        let tail_hash = bootstrap(&local, &remote, relationship, ports, &config).await?;

        Backend::new(&local, &config)
            .setup_origin(&tail_hash, ports.connect)
            .await?;
        Backend::new(&remote, &config)
            .setup_origin(&tail_hash, ports.connect)
            .await?;

        let session = Self {
            local,
            remote,
            tail_hash,
            ports,
            config,
        };
        session.verify_tail_hashes().await?;
        tracing::info!(tail = %session.tail_hash.short(), "session established");
        Ok(session)
    }

    pub fn tail_hash(&self) -> &TailHash {
        &self.tail_hash
    }

    pub fn ports(&self) -> SessionPorts {
        self.ports
    }

    pub fn node(&self, side: Side) -> &Arc<Node> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    async fn verify_tail_hashes(&self) -> Result<()> {
        for node in [&self.local, &self.remote] {
            let found = get_tail_hash(node, &self.config).await?;
            if found.as_ref() != Some(&self.tail_hash) {
                return Err(SyncError::Protocol {
                    host: node.name().to_string(),
                    command: "rev-list --max-parents=0 HEAD".to_string(),
                    output: format!(
                        "expected root commit {}, found {}",
                        self.tail_hash,
                        found.as_ref().map_or("none", TailHash::as_str)
                    ),
                });
            }
        }
        Ok(())
    }

    /// Commit `paths` on `side` and, if that produced a revision, pull it
    /// into the other side.
    ///
    /// A commit that fails with a backend execution error is logged and
    /// reported as "nothing committed"; the next change retries naturally.
    /// Pull failures propagate.
    pub async fn commit_and_update(
        &self,
        side: Side,
        paths: &[String],
        rescan: bool,
    ) -> Result<bool> {
        let src = self.node(side);
        let dest = self.node(side.other());
        let prefix = if paths.is_empty() {
            ROOT_PREFIX.to_string()
        } else {
            common_prefix_trim(paths, src.separator())
        };
        tracing::debug!(side = %side, prefix = %prefix, rescan, "commit");

        let committed = match Backend::new(src, &self.config).commit(&prefix, rescan).await {
            Ok(committed) => committed,
            Err(e) if e.is_exec() => {
                tracing::error!(side = %side, prefix = %prefix, error = ?e, "error during commit-and-pull");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if committed {
            tracing::info!(from = %side, to = %side.other(), prefix = %prefix, "committed; pulling");
            Backend::new(dest, &self.config).pull().await?;
        }
        Ok(committed)
    }

    /// Commit what `changes` describes on `side` and pull it to the other side.
    pub async fn commit_changes(&self, side: Side, changes: &PendingChanges) -> Result<bool> {
        self.commit_and_update(side, &changes.paths(), changes.rescan()).await
    }

    /// Capture anything changed before the watchers were attached: commit
    /// both sides with a full rescan, then pull on both.
    pub async fn initial_flush(&self) -> Result<()> {
        self.commit_changes(Side::Remote, &PendingChanges::full_rescan()).await?;
        self.commit_changes(Side::Local, &PendingChanges::full_rescan()).await?;
        Backend::new(&self.remote, &self.config).pull().await?;
        Backend::new(&self.local, &self.config).pull().await?;
        Ok(())
    }

    /// Attach watchers, flush once, and run the debounced loop until the
    /// shutdown sentinel arrives.
    pub async fn run(&mut self, shutdown: Shutdown) -> Result<LoopExit> {
        let (tx, rx) = event_queue();
        let mut tasks = vec![forward_shutdown(tx.clone(), shutdown.clone())];
        for node in [&self.local, &self.remote] {
            tasks.push(spawn_watcher(
                node.clone(),
                tx.clone(),
                shutdown.clone(),
                self.config.watch_restart_delay(),
            ));
        }
        drop(tx);

        // Watchers may not be listening yet; changes made before they are
        // are only picked up by this flush or a later one.
        let result = self.flush_and_loop(rx).await;
        for task in tasks {
            task.abort();
        }
        result
    }

    async fn flush_and_loop(&mut self, events: EventReceiver) -> Result<LoopExit> {
        self.initial_flush().await?;
        let mut sync_loop = SyncLoop::new(events, self.config.debounce_window());
        sync_loop.run(self).await
    }
}

#[async_trait]
impl ChangeSink for SyncSession {
    async fn flush(&mut self, side: Side, changes: PendingChanges) -> Result<()> {
        self.commit_changes(side, &changes).await.map(|_| ())
    }
}

/// Put the shutdown sentinel on the queue once shutdown is triggered.
fn forward_shutdown(events: EventSender, mut shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown.wait().await;
        let _ = events.send(SyncEvent::Shutdown);
    })
}

/// What `gut-sync sync` was asked to do.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub local_path: String,
    pub remote: RemoteSpec,
    pub identity: Option<PathBuf>,
}

impl SyncRequest {
    pub fn target(&self) -> SshTarget {
        self.remote.target().with_identity(self.identity.clone())
    }
}

/// Tail hashes of both sides and what they imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityReport {
    pub local: Option<TailHash>,
    pub remote: Option<TailHash>,
    pub relationship: Relationship,
}

async fn connect(request: &SyncRequest, config: &SyncConfig) -> Result<(Arc<Node>, Arc<Node>)> {
    let local = Node::connect_local(&request.local_path, config).await?;
    let remote = Node::connect_remote(request.target(), &request.remote.path, config).await?;
    tracing::info!(local = %local.describe(), remote = %remote.describe(), "connected");
    Ok((Arc::new(local), Arc::new(remote)))
}

async fn close(node: &Node) {
    if let Err(e) = node.close().await {
        tracing::warn!(node = %node, error = %e, "failed to close connection");
    }
}

/// Fail with [`SyncError::MissingBackend`] unless `gut` is staged on `node`.
pub async fn ensure_backend(node: &Node, config: &SyncConfig) -> Result<()> {
    let backend = Backend::new(node, config);
    if !backend.is_installed().await? {
        return Err(SyncError::MissingBackend {
            host: node.name().to_string(),
            path: backend.exe_path(),
        });
    }
    Ok(())
}

/// Connect to both sides and report their relationship without changing anything.
pub async fn check(request: &SyncRequest, config: &SyncConfig) -> Result<CompatibilityReport> {
    let (local, remote) = connect(request, config).await?;
    let result = report(&local, &remote, config).await;
    close(&remote).await;
    result
}

/// Compare two connected nodes. Both must have the backend staged.
pub async fn report(
    local: &Node,
    remote: &Node,
    config: &SyncConfig,
) -> Result<CompatibilityReport> {
    ensure_backend(local, config).await?;
    ensure_backend(remote, config).await?;
    let (local_hash, remote_hash, relationship) =
        check_compatibility(local, remote, config).await?;
    Ok(CompatibilityReport {
        local: local_hash,
        remote: remote_hash,
        relationship,
    })
}

/// Run a full sync session until `shutdown` is triggered.
///
/// Daemons started on either node are left running afterwards.
pub async fn run_sync(
    request: SyncRequest,
    config: Arc<SyncConfig>,
    shutdown: Shutdown,
) -> Result<()> {
    let (local, remote) = connect(&request, &config).await?;
    let result = run_connected(&request, local, remote.clone(), config, shutdown).await;
    close(&remote).await;
    result
}

async fn run_connected(
    request: &SyncRequest,
    local: Arc<Node>,
    remote: Arc<Node>,
    config: Arc<SyncConfig>,
    shutdown: Shutdown,
) -> Result<()> {
    ensure_backend(&local, &config).await?;
    ensure_backend(&remote, &config).await?;

    let allocated = find_open_ports(&[&*local, &*remote], 3, config.port_attempts).await?;
    let ports = SessionPorts::from_slice(&allocated).ok_or(SyncError::NoFreePorts { wanted: 3 })?;

    let (local_hash, remote_hash, relationship) =
        check_compatibility(&local, &remote, &config).await?;
    if !relationship.is_compatible() {
        tracing::info!(
            local = local_hash.as_ref().map_or("none", TailHash::as_str),
            remote = remote_hash.as_ref().map_or("none", TailHash::as_str),
            "gut repo base commits differ: {}",
            relationship
        );
    }
    // Refuse before anything is started on either side.
    let relationship = relationship.into_result()?;

    let tunnel = Tunnel::start(&request.target(), ports, config.use_autossh)?;
    let result = establish_and_run(local, remote, relationship, ports, config, shutdown).await;

    if let Err(e) = tunnel.stop().await {
        tracing::warn!(error = %e, "failed to stop tunnel");
    }
    let exit = result?;
    tracing::info!(?exit, "sync stopped");
    Ok(())
}

async fn establish_and_run(
    local: Arc<Node>,
    remote: Arc<Node>,
    relationship: Relationship,
    ports: SessionPorts,
    config: Arc<SyncConfig>,
    shutdown: Shutdown,
) -> Result<LoopExit> {
    let mut session = SyncSession::establish(local, remote, relationship, ports, config).await?;
    if shutdown.is_triggered() {
        return Ok(LoopExit::Shutdown);
    }
    session.run(shutdown).await
}
