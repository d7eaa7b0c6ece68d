mod cli;
mod format;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;

use lumen_common::paths::{CONFIG_FILE, REGISTRY_FILE};
use lumen_common::types::{ControllerId, GroupId};
use lumen_mesh::{MeshBuilder, MeshConfig};
use lumen_registry::{GroupRecord, HostFilter, LivenessTable, Registry};

use cli::{Cli, Command, GroupsSubcommand, RunArgs};

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Hold the non-blocking guards for the lifetime of main so logs flush on exit.
    let _log_guards = init_logging(env_filter, cli.log_file.as_deref())?;

    // ── Registry administration (no runtime needed) ─────────────────
    match &cli.command {
        Some(Command::Hosts { filter }) => return list_hosts(&cli, *filter),
        Some(Command::Groups(groups)) => return manage_groups(&cli, &groups.command),
        Some(Command::Forget) => return forget(&cli),
        Some(Command::Identity) => return show_identity(&cli),
        Some(Command::Version) => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "version": env!("CARGO_PKG_VERSION"),
                        "platform": std::env::consts::OS,
                    })
                );
            } else {
                println!("lumen {}", env!("CARGO_PKG_VERSION"));
            }
            return Ok(());
        }
        Some(Command::Run(_)) | None => {}
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let defaults = RunArgs::default();
    let args = match &cli.command {
        Some(Command::Run(args)) => args,
        _ => &defaults,
    };

    let config = run_config(&cli, args)?;
    tracing::info!("Lumen v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Platform: {}", std::env::consts::OS);
    tracing::info!(
        service_type = config.discovery.service_type,
        tick_secs = config.discovery.tick_interval_secs,
        probes = config.probe.enabled,
        "Mesh configuration"
    );

    let handle = MeshBuilder::new()
        .config(config)
        .registry_path(registry_path(&cli))
        .build()?
        .start()
        .await?;
    let identity = handle.identity().clone();
    tracing::info!(id = %identity.id, hostname = identity.hostname, "Ready.");

    let printer = tokio::spawn(print_events(handle.subscribe(), cli.json));

    match args.timeout.filter(|secs| *secs > 0) {
        Some(secs) => {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "Timeout reached");
                }
            }
        }
        None => shutdown_signal().await,
    }
    tracing::info!("Shutting down...");

    match handle.status().await {
        Ok(status) if cli.json => println!("{}", serde_json::to_string(&status)?),
        Ok(status) => format::status_summary(&status),
        Err(e) => tracing::debug!(error = %e, "Status unavailable at shutdown"),
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Error during shutdown"),
        Err(_) => tracing::warn!(
            "Shutdown timed out after {:?}, forcing exit",
            SHUTDOWN_TIMEOUT
        ),
    }
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<lumen_mesh::MeshEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Event serialization failed"),
            },
            Ok(event) => format::event_line(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "Event output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

// ── Configuration ───────────────────────────────────────────────────

fn config_path(cli: &Cli) -> PathBuf {
    match (&cli.config, &cli.data_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => dir.join(CONFIG_FILE),
        (None, None) => lumen_common::paths::config_path(),
    }
}

fn registry_path(cli: &Cli) -> PathBuf {
    match (&cli.registry, &cli.data_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => dir.join(REGISTRY_FILE),
        (None, None) => lumen_common::paths::registry_path(),
    }
}

/// File config with command-line overrides applied.
fn run_config(cli: &Cli, args: &RunArgs) -> anyhow::Result<MeshConfig> {
    let mut config = MeshConfig::load(&config_path(cli))?;
    if let Some(id) = args.id {
        config.node.id = Some(id);
    }
    if let Some(hostname) = &args.hostname {
        config.node.hostname = Some(hostname.clone());
    }
    if args.no_probe {
        config.probe.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

// ── Registry administration ─────────────────────────────────────────

fn open_registry(cli: &Cli) -> anyhow::Result<Registry> {
    Ok(Registry::open(registry_path(cli))?)
}

/// The persisted view only. Liveness lives in the running node, so every
/// controller shows as offline here.
fn list_hosts(cli: &Cli, filter: HostFilter) -> anyhow::Result<()> {
    let registry = open_registry(cli)?;
    let list = lumen_registry::hosts(&registry, &LivenessTable::default(), filter);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else if list.hosts.is_empty() {
        println!("No controllers.");
    } else {
        for info in &list.hosts {
            format::host_line(info);
        }
    }
    Ok(())
}

fn manage_groups(cli: &Cli, command: &GroupsSubcommand) -> anyhow::Result<()> {
    let registry = open_registry(cli)?;
    match command {
        GroupsSubcommand::List => {
            let groups = registry.groups();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
            } else if groups.is_empty() {
                println!("No groups.");
            } else {
                for group in &groups {
                    format::group_line(group);
                }
            }
        }
        GroupsSubcommand::Set { id, name, members } => {
            let group = GroupRecord {
                id: GroupId(*id),
                name: name.clone(),
                controller_ids: members.iter().copied().map(ControllerId).collect(),
            };
            if let Some(reserved) = group.controller_ids.iter().find(|id| id.is_reserved()) {
                anyhow::bail!("controller id {reserved} is reserved");
            }
            registry.set_group(group.clone())?;
            tracing::info!(group = %group.id, name = group.name, "Group saved");
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&group)?);
            } else {
                format::group_line(&group);
            }
        }
        GroupsSubcommand::Remove { id } => {
            registry.remove_group(GroupId(*id))?;
            if !cli.json {
                println!("Removed group {id}.");
            }
        }
    }
    Ok(())
}

fn forget(cli: &Cli) -> anyhow::Result<()> {
    let removed = open_registry(cli)?.forget_controllers()?;
    if cli.json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Forgot {removed} controller(s).");
    }
    Ok(())
}

fn show_identity(cli: &Cli) -> anyhow::Result<()> {
    let config = MeshConfig::load(&config_path(cli))?;
    let id = config.node_id();
    let hostname = config.hostname()?;
    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "id": id, "hostname": hostname })
        );
    } else {
        format::identity(&id.to_string(), &hostname);
    }
    Ok(())
}

// ── Logging ─────────────────────────────────────────────────────────

fn init_logging(
    env_filter: tracing_subscriber::EnvFilter,
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    // Non-blocking stderr so a redirected pipe nobody reads cannot stall the node.
    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (nb_file, file_guard) = tracing_appender::non_blocking(file);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(nb_file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Ok(vec![stderr_guard, file_guard])
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();

        Ok(vec![stderr_guard])
    }
}
