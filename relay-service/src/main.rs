use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub mod app;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", global = true, default_value = "")]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Publish outbox rows to the broker.
    Relay(app::relay::RelayArgs),
    /// Consume a topic with per-partition ordering and retries.
    Consume(app::consumer::ConsumeArgs),
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            token.cancel();
        }
    });

    match cli.command {
        Commands::Migrate => app::migrate::main(&cli.database_url).await,
        Commands::Relay(args) => app::relay::main(&cli.database_url, args, token).await,
        Commands::Consume(args) => app::consumer::main(args, token).await,
    }
}
