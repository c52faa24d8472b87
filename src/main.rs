//! indexsync CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use indexsync::{
    commands::{cmd_clean, cmd_sync, print_clean_report, print_sync_report, SyncOptions},
    config::Config,
    error::Result,
    progress::{hide_progress, LogWriterFactory},
};
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "indexsync")]
#[command(
    version,
    about = "Sync relational data into an alias-addressed search index",
    long_about = None
)]
struct Cli {
    /// Path to config file (default: etc/indexsync.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import, export and alias one site
    ///
    /// Without step flags all three steps run.
    Sync {
        /// Site name (directory under etc/sites/)
        site: String,

        /// Extract SQL templates into the staging store
        #[arg(long)]
        import: bool,

        /// Build a new index from the staging store
        #[arg(long)]
        export: bool,

        /// Point the alias at the new index once the success rate allows it
        #[arg(long)]
        alias: bool,

        /// Log generated SQL and index bodies
        #[arg(long)]
        debug: bool,

        /// Only check that the data source and staging store can be opened
        #[arg(long, conflicts_with_all = ["import", "export", "alias"])]
        check: bool,
    },

    /// Delete indices that no alias points at
    Clean {
        /// Site whose cluster is cleaned
        site: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    let show_progress = !cli.json && std::io::stderr().is_terminal();
    if !show_progress {
        hide_progress();
    }

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "indexsync", &mut std::io::stdout());
        return Ok(());
    }

    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync {
            site,
            import,
            export,
            alias,
            debug,
            check,
        } => {
            let options = SyncOptions {
                import,
                export,
                alias,
                check,
                debug,
                show_progress,
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, stopping...");
                    on_signal.cancel();
                }
            });

            let report = cmd_sync(&config, &site, options, cancel).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_sync_report(&report);
            }
        }

        Commands::Clean { site } => {
            let report = cmd_clean(&config, &site).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_clean_report(&report);
            }
        }

        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}
