//! Bootstrap: bring both nodes to a shared history with daemons running.
//!
//! Whatever the starting [`Relationship`], a successful bootstrap leaves
//! each node serving its repository through a `gut daemon` on the bind
//! port. Wiring `origin` on both sides is left to the session.
//!
//! There is no readiness handshake with the daemon or the tunnel. The
//! first pull after wiring an upstream only waits for the configured
//! bootstrap delay, and in the already-compatible case the daemons are
//! not waited for at all; later pulls reconcile anything missed.

use crate::backend::Backend;
use crate::compat::{Relationship, TailHash};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::node::{Node, Side};
use crate::ports::SessionPorts;

/// Fail unless the node's sync root is missing or an empty directory.
pub async fn ensure_empty(node: &Node) -> Result<()> {
    if node.is_occupied(node.root()).await? {
        tracing::error!(host = %node.name(), path = %node.root(), "destination is not empty");
        return Err(SyncError::DestinationNotEmpty {
            host: node.name().to_string(),
            path: node.root().to_string(),
        });
    }
    Ok(())
}

/// Initialize `dest` as a clone of `src` through the tunnel, then serve it.
///
/// The caller has already checked that `dest` is empty.
pub async fn cross_init(
    src: &Node,
    dest: &Node,
    tail_hash: &TailHash,
    ports: SessionPorts,
    config: &SyncConfig,
) -> Result<()> {
    let src_backend = Backend::new(src, config);
    let dest_backend = Backend::new(dest, config);

    src_backend.daemon(tail_hash, ports.bind).await?;
    dest_backend.init().await?;
    dest_backend.setup_origin(tail_hash, ports.connect).await?;

    tracing::debug!(delay = ?config.bootstrap_delay(), "waiting for daemon and tunnel");
    tokio::time::sleep(config.bootstrap_delay()).await;

    dest_backend.pull().await?;
    dest_backend.daemon(tail_hash, ports.bind).await?;
    Ok(())
}

/// Act on `relationship` and return the tail hash the session will use.
pub async fn bootstrap(
    local: &Node,
    remote: &Node,
    relationship: Relationship,
    ports: SessionPorts,
    config: &SyncConfig,
) -> Result<TailHash> {
    match relationship {
        Relationship::Compatible(tail_hash) => {
            tracing::info!(tail = %tail_hash.short(), "repositories share history; starting daemons");
            Backend::new(local, config).daemon(&tail_hash, ports.bind).await?;
            Backend::new(remote, config).daemon(&tail_hash, ports.bind).await?;
            Ok(tail_hash)
        }
        Relationship::Adopt { source, tail_hash } => {
            let (src, dest) = match source {
                Side::Local => (local, remote),
                Side::Remote => (remote, local),
            };
            ensure_empty(dest).await?;
            tracing::info!(
                from = %src.describe(),
                to = %dest.describe(),
                tail = %tail_hash.short(),
                "initializing {} repo from {} repo",
                dest.side(),
                src.side()
            );
            cross_init(src, dest, &tail_hash, ports, config).await?;
            Ok(tail_hash)
        }
        Relationship::InitBoth => {
            ensure_empty(remote).await?;
            ensure_empty(local).await?;
            tracing::info!("initializing both repos, local first");

            let backend = Backend::new(local, config);
            backend.init().await?;
            backend.ensure_initial_commit().await?;
            let tail_hash = backend.tail_hash().await?.ok_or_else(|| SyncError::Protocol {
                host: local.name().to_string(),
                command: "rev-list --max-parents=0 HEAD".to_string(),
                output: "no root commit after initial commit".to_string(),
            })?;

            tracing::info!(tail = %tail_hash.short(), "initializing remote repo from local repo");
            cross_init(local, remote, &tail_hash, ports, config).await?;
            Ok(tail_hash)
        }
        Relationship::Incompatible { local, remote } => {
            Err(SyncError::Incompatible { local, remote })
        }
    }
}
