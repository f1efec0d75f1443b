//! gut-sync — live two-way sync of a local and a remote directory.
//!
//! # Usage
//!
//! ```bash
//! # Mirror ~/proj with /srv/proj on devbox until Ctrl-C
//! gut-sync sync ~/proj alice@devbox:/srv/proj
//!
//! # Check that the backend is staged locally
//! gut-sync build
//!
//! # Show both root commits without changing anything
//! gut-sync check ~/proj alice@devbox:/srv/proj
//!
//! # Anything else runs the backend directly
//! gut-sync log --oneline
//! ```

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use gutsync_core::{
    Backend, Node, RemoteSpec, SyncConfig, SyncError, SyncRequest, TransportKind,
    shutdown_channel,
};

/// Exit status when the two sides cannot be synced at all, as opposed to
/// a session that failed midway.
const EXIT_FATAL: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "gut-sync")]
#[command(author = "gut-sync Contributors")]
#[command(version)]
#[command(about = "Live two-way directory sync over ssh, backed by gut")]
struct Cli {
    /// Config file (default: ~/.guts/gut-sync.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep a local and a remote directory in sync until interrupted
    Sync {
        /// Local directory
        local: String,
        /// Remote directory as [user@]host:path
        remote: String,
        /// ssh identity file
        #[arg(short, long)]
        identity: Option<PathBuf>,
        /// How commands reach the remote: multiplexed or direct
        #[arg(long)]
        transport: Option<TransportKind>,
        /// Use a plain ssh invocation per command (same as --transport direct)
        #[arg(long, conflicts_with = "transport")]
        use_openssh: bool,
        /// Keep the tunnel up with autossh
        #[arg(long)]
        autossh: bool,
    },

    /// Check that the gut backend is staged on this machine
    Build,

    /// Report both root commits and whether the two sides can sync
    Check {
        /// Local directory
        local: String,
        /// Remote directory as [user@]host:path
        remote: String,
        /// ssh identity file
        #[arg(short, long)]
        identity: Option<PathBuf>,
    },

    /// Any other command runs the local gut executable
    #[command(external_subcommand)]
    Gut(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "gutsync_cli={level},gutsync_core={level}"
                ))
            }),
        )
        .init();

    let config = load_config(cli.config.as_ref())?;

    let result = match cli.command {
        Commands::Sync {
            local,
            remote,
            identity,
            transport,
            use_openssh,
            autossh,
        } => {
            let mut config = config;
            if use_openssh {
                config.transport = TransportKind::Direct;
            } else if let Some(transport) = transport {
                config.transport = transport;
            }
            config.use_autossh |= autossh;
            cmd_sync(request(local, &remote, identity)?, config).await
        }

        Commands::Build => cmd_build(config).await,

        Commands::Check {
            local,
            remote,
            identity,
        } => cmd_check(request(local, &remote, identity)?, config).await,

        Commands::Gut(args) => cmd_gut(args, config).await,
    };

    if let Err(e) = &result {
        if is_fatal(e) {
            eprintln!("Error: {:#}", e);
            std::process::exit(EXIT_FATAL);
        }
    }
    result
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SyncError>()
        .is_some_and(SyncError::is_fatal)
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let path = match path {
        Some(path) => path.clone(),
        None => match SyncConfig::default_path() {
            Some(path) => path,
            None => return Ok(SyncConfig::default()),
        },
    };
    SyncConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn request(local: String, remote: &str, identity: Option<PathBuf>) -> Result<SyncRequest> {
    Ok(SyncRequest {
        local_path: local,
        remote: RemoteSpec::parse(remote)?,
        identity,
    })
}

async fn cmd_sync(request: SyncRequest, config: SyncConfig) -> Result<()> {
    println!(
        "Syncing {} with {}:{}",
        request.local_path, request.remote.host, request.remote.path
    );

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupted; shutting down");
                trigger.trigger();
            }
            Err(e) => {
                // Dropping the trigger would end the session.
                tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    });

    gutsync_core::run_sync(request, Arc::new(config), shutdown).await?;
    println!("Stopped.");
    Ok(())
}

async fn cmd_build(config: SyncConfig) -> Result<()> {
    let local = Node::connect_local(".", &config).await?;
    let backend = Backend::new(&local, &config);
    if !backend.is_installed().await? {
        bail!(
            "gut is not staged at {}; build gut {} there first",
            backend.exe_path(),
            config.backend_version
        );
    }
    let version = backend.version().await?;
    if !version.contains(&config.backend_version) {
        bail!(
            "{} reports '{}', expected gut {}",
            backend.exe_path(),
            version,
            config.backend_version
        );
    }
    println!("gut {} has already been built.", config.backend_version);
    println!("  Path: {}", backend.exe_path());
    Ok(())
}

async fn cmd_check(request: SyncRequest, config: SyncConfig) -> Result<()> {
    let report = gutsync_core::check(&request, &config).await?;
    let show = |hash: &Option<gutsync_core::TailHash>| {
        hash.as_ref()
            .map_or_else(|| "(none)".to_string(), |h| h.to_string())
    };

    println!("Local gut repo base commit:  {}", show(&report.local));
    println!("Remote gut repo base commit: {}", show(&report.remote));
    println!("Outcome: {}", report.relationship);

    report.relationship.into_result()?;
    Ok(())
}

async fn cmd_gut(args: Vec<String>, config: SyncConfig) -> Result<()> {
    let local = Node::connect_local(".", &config).await?;
    let exe = Backend::new(&local, &config).exe_path();
    let status = tokio::process::Command::new(&exe)
        .args(&args)
        .status()
        .await
        .with_context(|| format!("running {}", exe))?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => Err(anyhow!("{} was terminated by a signal", exe)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fatal_sees_through_context() {
        let err = anyhow::Error::new(SyncError::Connection {
            host: "devbox".into(),
            detail: "Permission denied (publickey)".into(),
        })
        .context("connecting");
        assert!(is_fatal(&err));

        let err = anyhow::Error::new(SyncError::NoFreePorts { wanted: 3 });
        assert!(!is_fatal(&err));
        assert!(!is_fatal(&anyhow!("plain failure")));
    }
}
