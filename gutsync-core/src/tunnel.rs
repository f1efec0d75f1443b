//! ssh port forwarding between the two daemons.
//!
//! Both daemons listen on `bind` on their own machine. The tunnel makes
//! `connect` on the local side reach the remote daemon (`-L`) and
//! `connect` on the remote side reach the local daemon (`-R`), so each
//! side's `origin` can be `gut://localhost:<connect>/...`.

use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::error::{Result, SyncError};
use crate::ports::SessionPorts;
use crate::ssh::SshTarget;

/// A running forwarding process. Killed on [`Tunnel::stop`] or drop.
#[derive(Debug)]
pub struct Tunnel {
    child: Child,
    program: &'static str,
}

impl Tunnel {
    pub fn start(target: &SshTarget, ports: SessionPorts, use_autossh: bool) -> Result<Self> {
        let program = if use_autossh { "autossh" } else { "ssh" };
        let args = tunnel_args(target, ports, use_autossh);
        tracing::info!(
            host = %target.host,
            bind = ports.bind,
            connect = ports.connect,
            program,
            "starting tunnel"
        );
        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::Spawn {
                host: "localhost".to_string(),
                command: format!("{} {}", program, args.join(" ")),
                source: e,
            })?;
        Ok(Self { child, program })
    }

    /// Whether the forwarding process has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    pub async fn stop(mut self) -> Result<()> {
        tracing::debug!(program = self.program, "stopping tunnel");
        if !self.has_exited() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// Arguments for the forwarding process (without the program name).
pub fn tunnel_args(target: &SshTarget, ports: SessionPorts, use_autossh: bool) -> Vec<String> {
    let mut args = Vec::new();
    if use_autossh {
        args.push("-M".to_string());
        args.push(ports.monitor.to_string());
    }
    args.extend(target.options());
    args.extend([
        "-N".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-L".to_string(),
        format!("{}:localhost:{}", ports.connect, ports.bind),
        "-R".to_string(),
        format!("{}:localhost:{}", ports.connect, ports.bind),
        target.address(),
    ]);
    args
}
