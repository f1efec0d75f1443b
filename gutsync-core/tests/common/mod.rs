//! Scripted two-node world for integration tests.
//!
//! `FakeExecutor` answers the backend commands gut-sync issues by mutating
//! a shared [`World`], so a pull on one side can see the other side's
//! history. Every command is logged for later assertions.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use gutsync_core::{
    CommandOutput, CommandSpec, Executor, LineStream, Node, NodeParts, OsFamily, PathKind, Result,
    Side, SyncConfig, SyncError,
};

pub const LOCAL_ROOT: &str = "/work/proj";
pub const REMOTE_ROOT: &str = "/srv/proj";
pub const HOME: &str = "/home/me";
/// Root commit created by `commit --allow-empty` in a fresh repository.
pub const SEED_HASH: &str = "5eed000000000000000000000000000000000000";

#[derive(Debug, Clone)]
pub struct RepoState {
    pub root: String,
    pub installed: bool,
    pub has_repo: bool,
    pub tail: Option<String>,
    /// Entries in the sync root when no repository exists.
    pub entries: usize,
    /// Whether `diff --cached` would find staged changes.
    pub dirty: bool,
    pub fail_commit: bool,
    pub fail_pull: bool,
    /// The ssh link drops while a (non-seed) commit is running.
    pub drop_link_on_commit: bool,
    pub origin: Option<String>,
    /// Lines the watch tool prints once started.
    pub watch_lines: Vec<String>,
}

impl RepoState {
    pub fn empty(root: &str) -> Self {
        Self {
            root: root.to_string(),
            installed: true,
            has_repo: false,
            tail: None,
            entries: 0,
            dirty: false,
            fail_commit: false,
            fail_pull: false,
            drop_link_on_commit: false,
            origin: None,
            watch_lines: Vec::new(),
        }
    }

    pub fn with_history(root: &str, tail: &str) -> Self {
        Self {
            has_repo: true,
            tail: Some(tail.to_string()),
            entries: 2,
            ..Self::empty(root)
        }
    }
}

#[derive(Debug)]
pub struct World {
    pub repos: BTreeMap<Side, RepoState>,
    pub log: Vec<(Side, CommandSpec)>,
    pub detached: Vec<(Side, CommandSpec)>,
    pub netstat: String,
}

pub type SharedWorld = Arc<Mutex<World>>;

impl World {
    pub fn new(local: RepoState, remote: RepoState) -> SharedWorld {
        Arc::new(Mutex::new(World {
            repos: BTreeMap::from([(Side::Local, local), (Side::Remote, remote)]),
            log: Vec::new(),
            detached: Vec::new(),
            netstat: String::new(),
        }))
    }
}

pub fn repo(world: &SharedWorld, side: Side) -> RepoState {
    world.lock().unwrap().repos[&side].clone()
}

pub fn update(world: &SharedWorld, side: Side, f: impl FnOnce(&mut RepoState)) {
    let mut world = world.lock().unwrap();
    f(world.repos.get_mut(&side).unwrap());
}

pub fn clear_log(world: &SharedWorld) {
    let mut world = world.lock().unwrap();
    world.log.clear();
    world.detached.clear();
}

/// Logged commands on `side` whose backend subcommand is `subcommand`.
pub fn commands(world: &SharedWorld, side: Side, subcommand: &str) -> Vec<CommandSpec> {
    world
        .lock()
        .unwrap()
        .log
        .iter()
        .filter(|(s, spec)| *s == side && spec.subcommand() == Some(subcommand))
        .map(|(_, spec)| spec.clone())
        .collect()
}

/// Real commits, excluding the seed commit made by bootstrap.
pub fn commits(world: &SharedWorld, side: Side) -> usize {
    commands(world, side, "commit")
        .iter()
        .filter(|spec| !spec.args.iter().any(|a| a == "--allow-empty"))
        .count()
}

pub fn pulls(world: &SharedWorld, side: Side) -> usize {
    commands(world, side, "pull").len()
}

/// Prefixes passed to `add --all --`.
pub fn add_prefixes(world: &SharedWorld, side: Side) -> Vec<String> {
    commands(world, side, "add")
        .iter()
        .filter_map(|spec| spec.args.last().cloned())
        .collect()
}

/// Every logged command as `(side, subcommand or program)`, in order.
pub fn timeline(world: &SharedWorld) -> Vec<(Side, String)> {
    world
        .lock()
        .unwrap()
        .log
        .iter()
        .map(|(side, spec)| {
            let name = if spec.program.ends_with("/gut") {
                spec.subcommand().unwrap_or_default().to_string()
            } else {
                spec.program.clone()
            };
            (*side, name)
        })
        .collect()
}

#[derive(Debug)]
pub struct FakeExecutor {
    side: Side,
    host: String,
    world: SharedWorld,
}

impl FakeExecutor {
    pub fn new(side: Side, world: SharedWorld) -> Self {
        let host = match side {
            Side::Local => "localhost",
            Side::Remote => "devbox",
        };
        Self {
            side,
            host: host.to_string(),
            world,
        }
    }

    fn answer(&self, world: &mut World, spec: &CommandSpec) -> CommandOutput {
        if spec.program == "netstat" {
            return CommandOutput::ok(world.netstat.clone());
        }
        if !spec.program.ends_with("/gut") {
            // mkdir, ln and friends
            return CommandOutput::ok("");
        }
        let peer_tail = world.repos[&self.side.other()].tail.clone();
        let state = world.repos.get_mut(&self.side).unwrap();
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["--version"] => CommandOutput::ok("gut version 2.2.2\n"),
            ["init"] => {
                state.has_repo = true;
                CommandOutput::ok("")
            }
            ["rev-list", ..] => match &state.tail {
                Some(tail) => CommandOutput::ok(format!("{}\n", tail)),
                None => CommandOutput::failed(128, "fatal: ambiguous argument 'HEAD'"),
            },
            ["rev-parse", ..] => match state.tail {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed(1, ""),
            },
            ["commit", rest @ ..] if rest.contains(&"--allow-empty") => {
                state.tail = Some(SEED_HASH.to_string());
                CommandOutput::ok("")
            }
            ["commit", ..] => {
                if state.fail_commit {
                    CommandOutput::failed(128, "fatal: Unable to create '.gut/index.lock'")
                } else {
                    state.dirty = false;
                    CommandOutput::ok("")
                }
            }
            ["diff", "--cached", "--quiet"] => {
                if state.dirty {
                    CommandOutput::failed(1, "")
                } else {
                    CommandOutput::ok("")
                }
            }
            ["pull", ..] => {
                if state.fail_pull {
                    CommandOutput::failed(1, "fatal: unable to connect to localhost")
                } else {
                    if state.tail.is_none() {
                        state.tail = peer_tail;
                    }
                    CommandOutput::ok("")
                }
            }
            ["remote", "remove", ..] => match state.origin.take() {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed(2, "error: No such remote: 'origin'"),
            },
            ["remote", "add", _, url] => {
                state.origin = Some(url.to_string());
                CommandOutput::ok("")
            }
            // add, ls-files, rm
            _ => CommandOutput::ok(""),
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut world = self.world.lock().unwrap();
        world.log.push((self.side, spec.clone()));
        let seeding = spec.args.iter().any(|a| a == "--allow-empty");
        if spec.subcommand() == Some("commit")
            && !seeding
            && world.repos[&self.side].drop_link_on_commit
        {
            return Err(SyncError::Connection {
                host: self.host.clone(),
                detail: "Connection reset by peer".into(),
            });
        }
        Ok(self.answer(&mut world, spec))
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        world.detached.push((self.side, spec.clone()));
        Ok(())
    }

    async fn spawn_lines(&self, _spec: &CommandSpec) -> Result<LineStream> {
        let lines = repo(&self.world, self.side).watch_lines;
        let lines = stream::iter(lines.into_iter().map(Ok::<String, std::io::Error>));
        Ok(lines.chain(stream::pending()).boxed())
    }

    async fn probe(&self, path: &str) -> Result<PathKind> {
        let world = self.world.lock().unwrap();
        let state = &world.repos[&self.side];
        let kind = if path.ends_with("/gut-build/bin/gut") {
            if state.installed { PathKind::File } else { PathKind::Missing }
        } else if path == format!("{}/.gut", state.root) {
            if state.has_repo {
                PathKind::Directory { entries: 8 }
            } else {
                PathKind::Missing
            }
        } else if path == state.root {
            let entries = state.entries + usize::from(state.has_repo);
            if entries == 0 {
                PathKind::Missing
            } else {
                PathKind::Directory { entries }
            }
        } else {
            PathKind::Missing
        };
        Ok(kind)
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        bootstrap_delay_ms: 0,
        ..SyncConfig::default()
    }
}

pub fn fake_node(side: Side, world: &SharedWorld, config: &SyncConfig) -> Arc<Node> {
    let root = repo(world, side).root;
    let parts = NodeParts {
        side,
        os: OsFamily::Linux,
        home: HOME.to_string(),
        cwd: HOME.to_string(),
        sync_path: root,
    };
    Arc::new(Node::new(
        parts,
        Arc::new(FakeExecutor::new(side, world.clone())),
        config,
    ))
}

pub fn fake_pair(world: &SharedWorld, config: &SyncConfig) -> (Arc<Node>, Arc<Node>) {
    (
        fake_node(Side::Local, world, config),
        fake_node(Side::Remote, world, config),
    )
}
