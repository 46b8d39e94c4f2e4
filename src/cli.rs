use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "metadata-updater",
    version,
    about = "Request metadata updates for every MediaHaven item of a media type"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the YAML configuration file
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "METADATA_UPDATER_CONFIG",
        default_value = "config.yml"
    )]
    pub config: String,

    /// Item database path (overrides `database` in the config file)
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// MediaHaven password (overrides the config file).
    /// Prefer the MEDIAHAVEN_PASSWORD environment variable over the flag,
    /// which is visible in process listings.
    #[arg(long, global = true, env = "MEDIAHAVEN_PASSWORD", hide_env_values = true)]
    pub mediahaven_password: Option<String>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover items and request their updates once, in the foreground
    Sync(SyncArgs),

    /// Serve the HTTP trigger (POST /start, GET /progress, POST /stop)
    Serve(ServeArgs),

    /// Show item counts and the last sync run
    Status,

    /// Delete the item database and start fresh
    ResetState(ResetStateArgs),
}

/// Overrides shared by every command that runs a sync.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Skip discovery and only update items already in the database
    #[arg(long)]
    pub skip_discovery: bool,

    /// Maximum number of items to ingest per run (0 = unlimited)
    #[arg(long)]
    pub max_amount: Option<u64>,

    /// Delay between update requests in milliseconds
    #[arg(long)]
    pub throttle_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Address to listen on (overrides `server.bind`)
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_defaults() {
        let cli = Cli::try_parse_from(["metadata-updater", "sync"]).unwrap();
        assert_eq!(cli.config, "config.yml");
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Sync(args) => {
                assert!(!args.run.skip_discovery);
                assert!(args.run.max_amount.is_none());
                assert!(!args.no_progress_bar);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "metadata-updater",
            "sync",
            "--config",
            "/etc/updater.yml",
            "--log-format",
            "json",
            "--max-amount",
            "10",
            "--skip-discovery",
        ])
        .unwrap();
        assert_eq!(cli.config, "/etc/updater.yml");
        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.run.max_amount, Some(10));
        assert!(args.run.skip_discovery);
    }

    #[test]
    fn test_serve_bind() {
        let cli =
            Cli::try_parse_from(["metadata-updater", "serve", "--bind", "127.0.0.1:9000"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn test_invalid_bind_rejected() {
        assert!(Cli::try_parse_from(["metadata-updater", "serve", "--bind", "nope"]).is_err());
    }

    #[test]
    fn test_reset_state_yes() {
        let cli = Cli::try_parse_from(["metadata-updater", "reset-state", "--yes"]).unwrap();
        assert!(matches!(cli.command, Command::ResetState(ResetStateArgs { yes: true })));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["metadata-updater"]).is_err());
    }
}
