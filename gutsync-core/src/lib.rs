//! gut-sync Core Library
//!
//! Live, bidirectional mirroring of a local and a remote directory, with the
//! `gut` backend as transport and merge mechanism:
//! - Command execution on local and ssh-reachable nodes
//! - Tail-hash compatibility checks and repository bootstrap
//! - Port allocation and the ssh tunnel between the two daemons
//! - Filesystem watch producers feeding one event queue
//! - The debounced commit-and-pull loop

pub mod error;
pub mod config;
pub mod exec;
pub mod ssh;
pub mod node;
pub mod backend;
pub mod compat;
pub mod paths;
pub mod ports;
pub mod tunnel;
pub mod bootstrap;
pub mod shutdown;
pub mod sync_loop;
pub mod watch;
pub mod session;

pub use error::{Result, SyncError};
pub use config::{SyncConfig, TransportKind};
pub use exec::{CommandOutput, CommandSpec, Executor, LineStream, LocalExecutor, PathKind};
pub use ssh::{SshExecutor, SshTarget};
pub use node::{Node, NodeParts, OsFamily, RemoteSpec, Side};
pub use backend::Backend;
pub use compat::{Relationship, TailHash, check_compatibility, get_tail_hash};
pub use paths::common_prefix_trim;
pub use ports::{SessionPorts, find_open_ports};
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};
pub use sync_loop::{ChangeEvent, ChangeSink, LoopExit, PendingChanges, SyncEvent, SyncLoop, event_queue};
pub use session::{CompatibilityReport, SyncRequest, SyncSession, check, report, run_sync};
