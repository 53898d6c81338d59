mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sandrun_common::config::DEFAULT_LANGUAGES_CONFIG;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sandrun-cli")]
#[command(about = "Sandrun CLI - Manage language recipes and run code locally", long_about = None)]
struct Cli {
    /// Path to languages.json
    #[arg(long, global = true, default_value = DEFAULT_LANGUAGES_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new Sandrun project
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },

    /// List configured languages and their environments
    Languages,

    /// Add an environment to a language's pool
    AddEnv {
        /// Language name (e.g., python, java, cpp)
        #[arg(short, long)]
        language: String,

        /// Environment (container) id
        #[arg(short, long)]
        env: String,
    },

    /// Execute a source file once and print the result
    Run {
        /// Language name
        #[arg(short, long)]
        language: String,

        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// Override the execution timeout, in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            commands::init_project(&path).await?;
        }
        Commands::Languages => {
            commands::list_languages(&cli.config).await?;
        }
        Commands::AddEnv { language, env } => {
            commands::add_environment(&cli.config, &language, &env).await?;
        }
        Commands::Run { language, file, timeout } => {
            commands::run_file(&cli.config, &language, &file, timeout).await?;
        }
    }

    Ok(())
}
