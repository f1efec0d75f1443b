//! History compatibility between the two nodes.
//!
//! Two repositories can sync only if they descend from the same root
//! commit. The root commit id (the "tail hash") is the whole oracle:
//!
//! | local     | remote    | outcome                         |
//! |-----------|-----------|---------------------------------|
//! | H         | H         | compatible                      |
//! | H         | none      | adopt remote from local         |
//! | none      | H         | adopt local from remote         |
//! | none      | none      | initialize both, local first    |
//! | H1        | H2        | incompatible (fatal)            |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::node::{Node, Side};

/// Id of a repository's root commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TailHash(String);

impl TailHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(10)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for TailHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the two repositories relate, and what bootstrap has to do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relationship {
    /// Same root commit on both sides; nothing to bootstrap.
    Compatible(TailHash),
    /// Only `source` has a repository; the other side is initialized from it.
    Adopt { source: Side, tail_hash: TailHash },
    /// Neither side has a repository.
    InitBoth,
    /// Both sides have repositories with different roots.
    Incompatible { local: TailHash, remote: TailHash },
}

impl Relationship {
    /// Decide from the two tail hashes. Pure; evaluated once per session start.
    pub fn decide(local: Option<&TailHash>, remote: Option<&TailHash>) -> Self {
        match (local, remote) {
            (Some(l), Some(r)) if l == r => Relationship::Compatible(l.clone()),
            (Some(l), None) => Relationship::Adopt {
                source: Side::Local,
                tail_hash: l.clone(),
            },
            (None, Some(r)) => Relationship::Adopt {
                source: Side::Remote,
                tail_hash: r.clone(),
            },
            (None, None) => Relationship::InitBoth,
            (Some(l), Some(r)) => Relationship::Incompatible {
                local: l.clone(),
                remote: r.clone(),
            },
        }
    }

    pub fn is_compatible(&self) -> bool {
        matches!(self, Relationship::Compatible(_))
    }

    /// The fatal case as an error, everything else passes through.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Relationship::Incompatible { local, remote } => {
                Err(SyncError::Incompatible { local, remote })
            }
            other => Ok(other),
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relationship::Compatible(hash) => write!(f, "compatible (root commit {})", hash),
            Relationship::Adopt { source, tail_hash } => write!(
                f,
                "{} will be initialized from {} (root commit {})",
                source.other(),
                source,
                tail_hash
            ),
            Relationship::InitBoth => write!(f, "both repositories will be initialized"),
            Relationship::Incompatible { local, remote } => write!(
                f,
                "incompatible (local root commit {}, remote root commit {})",
                local, remote
            ),
        }
    }
}

/// Root commit of the repository at the node's sync root, if any.
pub async fn get_tail_hash(node: &Node, config: &SyncConfig) -> Result<Option<TailHash>> {
    Backend::new(node, config).tail_hash().await
}

/// Query both nodes and decide their relationship. The queries hit
/// different machines, so they run concurrently.
pub async fn check_compatibility(
    local: &Node,
    remote: &Node,
    config: &SyncConfig,
) -> Result<(Option<TailHash>, Option<TailHash>, Relationship)> {
    let (local_hash, remote_hash) =
        tokio::try_join!(get_tail_hash(local, config), get_tail_hash(remote, config))?;
    let relationship = Relationship::decide(local_hash.as_ref(), remote_hash.as_ref());
    Ok((local_hash, remote_hash, relationship))
}
