//! Port allocation for the daemon/tunnel wiring.
//!
//! Candidates come from the local OS's ephemeral allocator (so they are
//! free locally and distinct from one another) and are then checked
//! against every node's listening sockets.

use std::collections::HashSet;
use std::net::TcpListener;

use crate::error::{Result, SyncError};
use crate::node::{Node, OsFamily};

/// Ports a session needs: the daemon bind port, the tunnel's connect
/// port, and the autossh monitor port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPorts {
    pub bind: u16,
    pub connect: u16,
    pub monitor: u16,
}

impl SessionPorts {
    pub fn from_slice(ports: &[u16]) -> Option<Self> {
        match ports {
            [bind, connect, monitor, ..] => Some(Self {
                bind: *bind,
                connect: *connect,
                monitor: *monitor,
            }),
            _ => None,
        }
    }
}

/// Ports currently listening on `node`.
pub async fn listening_ports(node: &Node) -> Result<HashSet<u16>> {
    let netstat = node.command("netstat").arg("-an");
    let output = node.run(&netstat).await?;
    if output.success() {
        return Ok(parse_listening_ports(&output.stdout));
    }
    if node.os() == OsFamily::Linux {
        let ss = node.command("ss").arg("-ltn");
        let output = node.run_checked(&ss).await?;
        return Ok(parse_listening_ports(&output.stdout));
    }
    output.checked(node.name(), &netstat)?;
    Ok(HashSet::new())
}

/// Pick `count` distinct ports that no node is listening on.
pub async fn find_open_ports(nodes: &[&Node], count: usize, attempts: usize) -> Result<Vec<u16>> {
    let mut busy = HashSet::new();
    for node in nodes {
        busy.extend(listening_ports(node).await?);
    }

    // Listeners stay open until selection finishes so the OS never hands
    // out the same port twice.
    let mut held = Vec::new();
    let mut chosen = Vec::with_capacity(count);
    for _ in 0..attempts {
        if chosen.len() == count {
            break;
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        held.push(listener);
        if !busy.contains(&port) {
            chosen.push(port);
        }
    }
    drop(held);

    if chosen.len() < count {
        return Err(SyncError::NoFreePorts { wanted: count });
    }
    tracing::debug!(ports = ?chosen, "allocated ports");
    Ok(chosen)
}

/// Extract listening TCP ports from `netstat -an` or `ss -ltn` output.
///
/// Handles `0.0.0.0:22`, `[::]:22`, `*:22` and the BSD `*.22` / `127.0.0.1.22` forms.
pub fn parse_listening_ports(output: &str) -> HashSet<u16> {
    output
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // netstat: proto recv-q send-q local foreign state
            // ss:      state recv-q send-q local peer
            // windows: proto local foreign state
            let local = if fields.first() == Some(&"LISTEN") {
                fields.get(3)
            } else if fields.len() == 4 {
                fields.get(1)
            } else {
                fields.get(3)
            }?;
            port_of(local)
        })
        .collect()
}

fn port_of(address: &str) -> Option<u16> {
    let idx = address.rfind([':', '.'])?;
    address[idx + 1..].parse().ok()
}
