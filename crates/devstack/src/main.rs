//! devstack - run a local development stack in dependency order

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use process_launcher::LogLevel;
use std::path::PathBuf;
use tracing::Level;

mod commands;

#[derive(Parser)]
#[command(name = "devstack")]
#[command(about = "Start, supervise and inspect local development services")]
#[command(version)]
struct Cli {
    /// Stack file path
    #[arg(short, long, global = true, default_value = "services.yaml")]
    config: PathBuf,

    /// State directory for the service store, uptime history and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// More output, repeat for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the stack file and print the start order and tiers
    Validate,

    /// Print the start order
    Order {
        /// Services to include with their dependencies (empty means all)
        services: Vec<String>,

        /// Restrict to a profile
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Start services and supervise them until Ctrl-C
    Up {
        /// Services to start with their dependencies (empty means all)
        services: Vec<String>,

        /// Start a profile
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Show uptime statistics from the recorded history
    Stats {
        /// Service name
        service: String,

        /// Window in seconds
        #[arg(short, long, default_value_t = 86_400)]
        window_secs: u64,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show captured output from the log store
    Logs {
        /// Service name
        service: String,

        /// Minimum level
        #[arg(short, long)]
        level: Option<LevelArg>,

        /// Only the most recent lines
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Only lines containing this text
        #[arg(short, long)]
        grep: Option<String>,
    },

    /// Terminate whatever listens on a port
    CleanupPort {
        /// TCP port
        port: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for LogLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Trace => LogLevel::Trace,
            LevelArg::Debug => LogLevel::Debug,
            LevelArg::Info => LogLevel::Info,
            LevelArg::Warn => LogLevel::Warn,
            LevelArg::Error => LogLevel::Error,
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let data_dir = cli.data_dir.unwrap_or_else(commands::default_data_dir);

    smol::block_on(async {
        match cli.command {
            Commands::Validate => commands::validate::run(&cli.config).await,
            Commands::Order { services, profile } => {
                commands::order::run(&cli.config, services, profile).await
            }
            Commands::Up { services, profile } => {
                commands::up::run(&cli.config, &data_dir, services, profile).await
            }
            Commands::Stats {
                service,
                window_secs,
                json,
            } => commands::stats::run(&cli.config, &data_dir, &service, window_secs, json).await,
            Commands::Logs {
                service,
                level,
                limit,
                grep,
            } => {
                let query = service_registry::LogQuery {
                    min_level: level.map(LogLevel::from),
                    limit,
                    contains: grep,
                    ..Default::default()
                };
                commands::logs::run(&cli.config, &data_dir, &service, query).await
            }
            Commands::CleanupPort { port } => commands::cleanup_port::run(port).await,
        }
    })
}
