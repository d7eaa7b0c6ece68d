use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use lumen_registry::HostFilter;

#[derive(Parser, Debug)]
#[command(name = "lumen", version, about = "LED controller mesh node")]
pub struct Cli {
    /// Data directory holding the registry and config
    #[arg(long, env = "LUMEN_DATA_DIR", value_name = "PATH", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Configuration file (default: <data dir>/config.toml)
    #[arg(long, env = "LUMEN_CONFIG", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Registry file (default: <data dir>/registry.json)
    #[arg(long, env = "LUMEN_REGISTRY", value_name = "PATH", global = true)]
    pub registry: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LUMEN_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "LUMEN_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join the mesh and run until interrupted (default)
    Run(RunArgs),
    /// List controllers in the persisted registry
    Hosts {
        /// Which controllers to list (all, valid, visible)
        #[arg(long, default_value = "valid")]
        filter: HostFilter,
    },
    /// Manage controller groups
    Groups(GroupsCommand),
    /// Remove every controller from the registry (groups are kept)
    Forget,
    /// Show this node's id and mesh hostname
    Identity,
    /// Show version information
    Version,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Controller id (overrides config; default: derived from machine id)
    #[arg(long, env = "LUMEN_ID")]
    pub id: Option<u32>,

    /// Mesh hostname (overrides config; default: system hostname)
    #[arg(long, env = "LUMEN_HOSTNAME")]
    pub hostname: Option<String>,

    /// Disable HTTP verification probes
    #[arg(long, env = "LUMEN_NO_PROBE")]
    pub no_probe: bool,

    /// Auto-exit after N seconds (0 = run forever)
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct GroupsCommand {
    #[command(subcommand)]
    pub command: GroupsSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum GroupsSubcommand {
    /// List configured groups
    List,
    /// Create or replace a group
    Set {
        /// Group id
        id: u32,
        /// Display name
        name: String,
        /// Member controller ids
        #[arg(required = true)]
        members: Vec<u32>,
    },
    /// Delete a group
    Remove {
        /// Group id
        id: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["lumen"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn run_overrides_parse() {
        let cli = Cli::try_parse_from(["lumen", "run", "--id", "42", "--hostname", "porch", "-v"])
            .unwrap();
        match cli.command {
            Some(Command::Run(args)) => {
                assert_eq!(args.id, Some(42));
                assert_eq!(args.hostname.as_deref(), Some("porch"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn hosts_filter_parses() {
        let cli = Cli::try_parse_from(["lumen", "hosts", "--filter", "visible"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Hosts {
                filter: HostFilter::VisibleOnly
            })
        ));
        assert!(Cli::try_parse_from(["lumen", "hosts", "--filter", "bogus"]).is_err());
    }

    #[test]
    fn group_set_requires_members() {
        assert!(Cli::try_parse_from(["lumen", "groups", "set", "1", "Porch"]).is_err());
        let cli = Cli::try_parse_from(["lumen", "groups", "set", "1", "Porch", "3", "7"]).unwrap();
        match cli.command {
            Some(Command::Groups(GroupsCommand {
                command: GroupsSubcommand::Set { id, name, members },
            })) => {
                assert_eq!(id, 1);
                assert_eq!(name, "Porch");
                assert_eq!(members, vec![3, 7]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
