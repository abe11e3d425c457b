//! Trellis CLI entry point

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Language server backend for build-configuration workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace root, or any directory inside it
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    /// Build tool executable, overriding `.trellis.toml`
    #[arg(long, global = true)]
    build_tool: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket front end
    Serve {
        /// Port to listen on [default: from settings, 7878]
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to [default: from settings, 127.0.0.1]
        #[arg(long)]
        host: Option<String>,

        /// Do not watch the workspace for changes on disk
        #[arg(long)]
        no_watch: bool,
    },
    /// Scan the workspace and print its targets and diagnostics
    Scan,
    /// Run a structural query through the build tool
    Query {
        expression: String,
    },
    /// Build a target, streaming events to stdout
    Build {
        target: String,
        /// Extra flags passed to the build tool
        #[arg(last = true)]
        flags: Vec<String>,
    },
    /// Test a target, streaming events to stdout
    Test {
        target: String,
        /// Extra flags passed to the build tool
        #[arg(last = true)]
        flags: Vec<String>,
    },
    /// Run a binary target, streaming events to stdout
    Run {
        target: String,
        /// Arguments passed to the binary
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("trellis={default_level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let overrides = commands::overrides(cli.build_tool.as_deref());

    match cli.command {
        Commands::Serve { port, host, no_watch } => {
            commands::serve(cli.root, host, port, !no_watch, overrides).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scan => commands::scan(cli.root, overrides).await,
        Commands::Query { expression } => commands::query(cli.root, &expression, overrides).await,
        Commands::Build { target, flags } => commands::build(cli.root, target, flags, overrides).await,
        Commands::Test { target, flags } => commands::test(cli.root, target, flags, overrides).await,
        Commands::Run { target, args } => commands::run(cli.root, target, args, overrides).await,
        Commands::Version => {
            println!("trellis v{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}
