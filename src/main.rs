use clap::Parser;
use tracing_subscriber::EnvFilter;

use quarry::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Execute(args) => args.log_level.clone(),
        _ => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Execute(args) => quarry::run_execute(args).await?,
        Commands::LatestQueueComplete(args) => {
            let complete = quarry::latest_queue_complete(&args.data_directory)?;
            println!("{complete}");
        }
        Commands::RequeueTasks(args) => {
            let promoted = quarry::run_requeue_tasks(&args.data_directory, &args.timestamp, args.requeue_type)?;
            tracing::info!(promoted, "requeued tasks");
        }
    }

    Ok(())
}
