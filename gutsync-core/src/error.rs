//! Error types for gut-sync sessions.
//!
//! Errors fall into three groups:
//! - fatal, session-ending conditions (incompatible histories, the
//!   empty-destination guard, an unreachable remote)
//! - backend execution failures, which callers interpret per operation
//! - plumbing failures (I/O, configuration, unexpected probe output)

use crate::compat::TailHash;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while establishing or running a sync session
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Command `{command}` on {host} exited with {}: {stderr}", display_code(.code))]
    Exec {
        host: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Connection to {host} failed: {detail}")]
    Connection { host: String, detail: String },

    #[error("Failed to launch `{command}` on {host}: {source}")]
    Spawn {
        host: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Cannot sync incompatible gut repos: local initial commit [{local}], remote initial commit [{remote}]"
    )]
    Incompatible { local: TailHash, remote: TailHash },

    #[error(
        "Refusing to initialize {path} on {host} as it is not an empty directory. Move or delete it manually first."
    )]
    DestinationNotEmpty { host: String, path: String },

    #[error("gut is not installed at {path} on {host}; run `gut-sync build` there first")]
    MissingBackend { host: String, path: String },

    #[error("Could not find {wanted} open ports usable on every node")]
    NoFreePorts { wanted: usize },

    #[error("Unexpected output from `{command}` on {host}: {output}")]
    Protocol {
        host: String,
        command: String,
        output: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True for a backend command that ran and exited non-zero.
    pub fn is_exec(&self) -> bool {
        matches!(self, SyncError::Exec { .. })
    }

    /// True for errors that must end the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Connection { .. }
                | SyncError::Incompatible { .. }
                | SyncError::DestinationNotEmpty { .. }
                | SyncError::MissingBackend { .. }
        )
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "a signal".to_string(),
    }
}
