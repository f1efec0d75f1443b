//! Filesystem watch producers.
//!
//! One task per node runs the platform's watch tool under the node's
//! executor and turns every reported path into a [`SyncEvent::Change`] on
//! the shared queue. Watch tools die (remote sessions drop, inotify limits
//! get hit), so the task restarts the tool after a short delay until
//! shutdown is signalled.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::backend::METADATA_DIR;
use crate::exec::CommandSpec;
use crate::node::{Node, OsFamily};
use crate::shutdown::Shutdown;
use crate::sync_loop::{ChangeEvent, EventSender, SyncEvent};

/// inotify events that mean content or layout changed. Reads (open, access,
/// close_nowrite) are left out: every `gut add` reads the tree it stages.
const INOTIFY_EVENTS: &str = "modify,attrib,close_write,move,create,delete";
/// inotify-win knows only these four.
const INOTIFY_WIN_EVENTS: &str = "create,modify,delete,move";

/// The watch command for `node`, printing one absolute path per change.
pub fn watch_command(node: &Node) -> CommandSpec {
    let root = node.root().to_string();
    match node.os() {
        OsFamily::MacOs => node.command("fswatch").args([
            "--recursive".to_string(),
            "--latency".to_string(),
            "0.001".to_string(),
            "--exclude".to_string(),
            format!("/\\{}(/|$)", METADATA_DIR),
            root,
        ]),
        // inotify-win, found through the node's PATH additions.
        OsFamily::Windows => node.command("inotifywait").args([
            "--monitor".to_string(),
            "--recursive".to_string(),
            "--event".to_string(),
            INOTIFY_WIN_EVENTS.to_string(),
            "--format".to_string(),
            "%w\\%f".to_string(),
            root,
        ]),
        OsFamily::Linux | OsFamily::Other => node.command("inotifywait").args([
            "--quiet".to_string(),
            "--monitor".to_string(),
            "--recursive".to_string(),
            "--event".to_string(),
            INOTIFY_EVENTS.to_string(),
            "--format".to_string(),
            "%w%f".to_string(),
            "--exclude".to_string(),
            format!("(^|/)\\{}(/|$)", METADATA_DIR),
            root,
        ]),
    }
}

/// Turn one line of watcher output into a change event for `node`.
/// Blank lines and paths outside the sync root give `None`.
pub fn parse_watch_line(node: &Node, line: &str) -> Option<ChangeEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let path = node.relativize(line)?;
    Some(ChangeEvent::new(node.side(), path))
}

/// Run the watch tool for `node` until shutdown, restarting it after
/// `restart_delay` whenever it exits. The task also ends once the event
/// queue is closed.
pub fn spawn_watcher(
    node: Arc<Node>,
    events: EventSender,
    mut shutdown: Shutdown,
    restart_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let spec = watch_command(&node);
        while !shutdown.is_triggered() {
            match node.spawn_lines(&spec).await {
                Ok(mut lines) => {
                    tracing::info!(node = %node, root = %node.root(), "watching for changes");
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.wait() => return,
                            line = lines.next() => match line {
                                Some(Ok(line)) => {
                                    let Some(event) = parse_watch_line(&node, &line) else {
                                        continue;
                                    };
                                    if events.send(SyncEvent::Change(event)).is_err() {
                                        tracing::debug!(node = %node, "event queue closed; stopping watcher");
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(node = %node, error = %e, "watcher output failed");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                    tracing::warn!(node = %node, delay = ?restart_delay, "watcher exited; restarting");
                }
                Err(e) => {
                    tracing::error!(node = %node, error = %e, "failed to start watcher");
                }
            }
            tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(restart_delay) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::error::Result;
    use crate::exec::{CommandOutput, Executor, LineStream, PathKind};
    use crate::node::{NodeParts, Side};
    use crate::shutdown::shutdown_channel;
    use crate::sync_loop::event_queue;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every spawn of the watch tool prints the same lines, then exits.
    #[derive(Debug)]
    struct ScriptedWatch {
        lines: Vec<String>,
        spawns: AtomicUsize,
    }

    #[async_trait]
    impl Executor for ScriptedWatch {
        fn host(&self) -> &str {
            "devbox"
        }

        async fn run(&self, _spec: &CommandSpec) -> Result<CommandOutput> {
            Ok(CommandOutput::ok(""))
        }

        async fn spawn_detached(&self, _spec: &CommandSpec) -> Result<()> {
            Ok(())
        }

        async fn spawn_lines(&self, _spec: &CommandSpec) -> Result<LineStream> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let lines: Vec<std::io::Result<String>> =
                self.lines.iter().cloned().map(Ok).collect();
            Ok(stream::iter(lines).boxed())
        }

        async fn probe(&self, _path: &str) -> Result<PathKind> {
            Ok(PathKind::Missing)
        }
    }

    fn node(os: OsFamily, executor: Arc<dyn Executor>) -> Node {
        let parts = NodeParts {
            side: Side::Remote,
            os,
            home: "/home/alice".into(),
            cwd: "/home/alice".into(),
            sync_path: "/srv/proj".into(),
        };
        Node::new(parts, executor, &SyncConfig::default())
    }

    fn scripted(lines: &[&str]) -> Arc<ScriptedWatch> {
        Arc::new(ScriptedWatch {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            spawns: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_watch_command_per_os() {
        let exec = scripted(&[]);
        let linux = watch_command(&node(OsFamily::Linux, exec.clone()));
        assert_eq!(linux.program, "inotifywait");
        assert!(linux.args.contains(&"--exclude".to_string()));
        assert_eq!(linux.args.last().map(String::as_str), Some("/srv/proj"));

        let mac = watch_command(&node(OsFamily::MacOs, exec.clone()));
        assert_eq!(mac.program, "fswatch");
        assert_eq!(mac.path_extra, vec!["/usr/local/bin".to_string()]);

        let win = watch_command(&node(OsFamily::Windows, exec));
        assert_eq!(win.program, "inotifywait");
        assert_eq!(win.path_extra.len(), 1);
    }

    fn events_arg(spec: &CommandSpec) -> Option<&str> {
        let at = spec.args.iter().position(|a| a == "--event")?;
        spec.args.get(at + 1).map(String::as_str)
    }

    #[test]
    fn test_inotify_ignores_reads() {
        let exec = scripted(&[]);
        for os in [OsFamily::Linux, OsFamily::Other, OsFamily::Windows] {
            let spec = watch_command(&node(os, exec.clone()));
            let events = events_arg(&spec).unwrap_or_else(|| panic!("no --event for {:?}", os));
            let events: Vec<&str> = events.split(',').collect();
            for wanted in ["create", "modify", "delete", "move"] {
                assert!(events.contains(&wanted), "{:?} lacks {}", os, wanted);
            }
            for read in ["open", "access", "close_nowrite", "close"] {
                assert!(!events.contains(&read), "{:?} reports {}", os, read);
            }
        }
        assert_eq!(
            events_arg(&watch_command(&node(OsFamily::Linux, exec))),
            Some("modify,attrib,close_write,move,create,delete")
        );
    }

    #[test]
    fn test_parse_watch_line() {
        let node = node(OsFamily::Linux, scripted(&[]));
        assert_eq!(
            parse_watch_line(&node, "/srv/proj/a/b.txt\r"),
            Some(ChangeEvent::new(Side::Remote, "a/b.txt"))
        );
        assert_eq!(parse_watch_line(&node, ""), None);
        assert_eq!(parse_watch_line(&node, "/tmp/elsewhere"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_forwards_and_restarts() {
        let exec = scripted(&["/srv/proj/a.txt", "/tmp/outside", "/srv/proj/b/c.txt"]);
        let node = Arc::new(node(OsFamily::Linux, exec.clone()));
        let (tx, mut rx) = event_queue();
        let (trigger, shutdown) = shutdown_channel();

        let handle = spawn_watcher(node, tx, shutdown, Duration::from_secs(1));

        let first = rx.recv().await.unwrap();
        assert_eq!(first, SyncEvent::Change(ChangeEvent::new(Side::Remote, "a.txt")));
        let second = rx.recv().await.unwrap();
        assert_eq!(second, SyncEvent::Change(ChangeEvent::new(Side::Remote, "b/c.txt")));

        // The scripted tool exits after its lines; the restart replays them.
        let third = rx.recv().await.unwrap();
        assert_eq!(third, SyncEvent::Change(ChangeEvent::new(Side::Remote, "a.txt")));
        assert!(exec.spawns.load(Ordering::SeqCst) >= 2);

        trigger.trigger();
        handle.await.unwrap();
    }
}
