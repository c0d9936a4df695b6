//! Graft CLI entry point

use clap::{Parser, Subcommand};
use graft_core::CompileOptions;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "graft")]
#[command(about = "Partition dataflow graphs and compile the supported regions for an accelerator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a graph would be partitioned, without compiling
    Plan {
        /// Graph JSON file
        graph: PathBuf,

        /// Settings TOML file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Capability table TOML for the reference accelerator
        #[arg(long)]
        capabilities: Option<PathBuf>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compile a graph and print the resulting hybrid graph
    Compile {
        /// Graph JSON file
        graph: PathBuf,

        /// Settings TOML file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Capability table TOML for the reference accelerator
        #[arg(long)]
        capabilities: Option<PathBuf>,

        /// Print the compile summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a device descriptor such as `gpu:0` or `dla:1`
    Device {
        spec: String,

        /// Allow falling back to the managing GPU
        #[arg(long)]
        allow_fallback: Option<bool>,
    },
    /// Show version
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = match &cli.command {
        Commands::Plan { config, .. } | Commands::Compile { config, .. } => {
            commands::load_options(config.as_deref())?
        }
        _ => CompileOptions::default(),
    };

    // Initialize logging
    let log_level = if cli.verbose || options.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "graft={log_level},graft_core={log_level},graft_partition={log_level},graft_compiler={log_level}"
        )))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!("Graft v{}", env!("CARGO_PKG_VERSION"));

    let output = match cli.command {
        Commands::Plan {
            graph,
            capabilities,
            json,
            ..
        } => commands::plan(&graph, options, capabilities.as_deref(), json)?,
        Commands::Compile {
            graph,
            capabilities,
            json,
            ..
        } => commands::compile(&graph, options, capabilities.as_deref(), json)?,
        Commands::Device {
            spec,
            allow_fallback,
        } => commands::device(&spec, allow_fallback)?,
        Commands::Version => format!("Graft v{}", env!("CARGO_PKG_VERSION")),
    };
    println!("{output}");
    Ok(())
}
