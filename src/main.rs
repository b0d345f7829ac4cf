mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ModelAction};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = cli::load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    // Log to stderr so stdout carries only command output.
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    source.log();

    match cli.command {
        Command::Model {
            action: ModelAction::Download,
        } => cli::model_download(&config.embedding).await?,
        // The engine blocks on SQLite and model inference.
        command => tokio::task::spawn_blocking(move || cli::run(command, config)).await??,
    }

    Ok(())
}
