mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "goera-cli")]
#[command(about = "Goera CLI - Judge submissions locally and manage the worker pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge a Go source file locally, without the dispatcher
    Judge {
        /// Go source file
        #[arg(short, long)]
        source: PathBuf,

        /// JSON array of {"input", "expectedOutput"} (an empty file means no test cases)
        #[arg(short, long)]
        cases: PathBuf,

        /// Per test case wall-clock limit (e.g. 500ms, 2s)
        #[arg(short, long, default_value = "2s")]
        time_limit: String,

        /// Memory limit in MB, 0 = unlimited
        #[arg(short, long, default_value = "64")]
        memory_limit: String,

        /// CPU quota in cores
        #[arg(long, default_value = "1.0")]
        cpus: String,

        /// Sandbox image
        #[arg(short, long, default_value = goera_common::config::DEFAULT_SANDBOX_IMAGE)]
        image: String,

        /// Runner configuration file
        #[arg(long, default_value = goera_judge::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Build the sandbox image from the embedded Dockerfile if it is missing
    BuildImage {
        /// Image tag
        #[arg(short, long, default_value = goera_common::config::DEFAULT_SANDBOX_IMAGE)]
        image: String,

        /// Runner configuration file
        #[arg(long, default_value = goera_judge::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Send a submission JSON file to a running dispatcher
    Submit {
        /// Submission payload ({submissionId, sourceCode, testCases, ...})
        #[arg(short, long)]
        file: PathBuf,

        /// Dispatcher base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8082")]
        url: String,
    },

    /// Inspect and manage the dispatcher's worker pool
    Workers {
        /// Dispatcher base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8082", global = true)]
        url: String,

        #[command(subcommand)]
        action: WorkerAction,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// List workers with their state and busy flag
    List,

    /// Start a worker, on the next free port unless one is given
    Spawn {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop one worker, or all of them
    Kill {
        #[arg(short, long, required_unless_present = "all")]
        port: Option<u16>,

        #[arg(long, conflicts_with = "port")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Judge {
            source,
            cases,
            time_limit,
            memory_limit,
            cpus,
            image,
            config,
        } => {
            let limits = commands::LimitArgs {
                time_limit,
                memory_limit,
                cpus,
                image,
            };
            commands::judge_local(&source, &cases, limits, &config).await?;
        }
        Commands::BuildImage { image, config } => {
            commands::build_image(&image, &config).await?;
        }
        Commands::Submit { file, url } => {
            commands::submit(&file, &url).await?;
        }
        Commands::Workers { url, action } => match action {
            WorkerAction::List => commands::list_workers(&url).await?,
            WorkerAction::Spawn { port } => commands::spawn_worker(&url, port).await?,
            WorkerAction::Kill { port, all } => commands::kill_workers(&url, port, all).await?,
        },
    }

    Ok(())
}
