//! Boardlab CLI entrypoint.

use clap::Parser;

mod commands;
mod handlers;

use commands::Commands;

#[derive(Parser)]
#[command(name = "boardlab")]
#[command(author, version, about = "Boardlab device-fleet test orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Master {
            nats_url,
            database_url,
            env_file,
        } => handlers::master(&nats_url, &database_url, env_file.as_deref()).await?,
        Commands::Logs {
            nats_url,
            database_url,
            output_dir,
            hostname,
        } => handlers::logs(&nats_url, &database_url, &output_dir, &hostname).await?,
        Commands::Submit { path, database_url } => handlers::submit(&path, &database_url).await?,
        Commands::Cancel { job, database_url } => handlers::cancel(&job, &database_url).await?,
        Commands::Show { job, database_url } => handlers::show(&job, &database_url).await?,
        Commands::Devices { database_url } => handlers::devices(&database_url).await?,
    }

    Ok(())
}
