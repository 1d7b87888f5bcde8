mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::run_server;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Replicated content-addressed blob storage node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and join the cluster sharing its metadata backend
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,

        /// Override node.id from config
        #[arg(long)]
        node: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf, node } => {
            tracing::info!("Starting Keel with config: {}", conf);

            let mut cfg = match Config::from_file(&conf) {
                Ok(c) => c,
                Err(error) => {
                    tracing::error!("Failed to load config: {}", error);
                    std::process::exit(1);
                }
            };

            if let Some(node) = node {
                tracing::info!("Using node override '{}' via CLI", node);
                cfg.node.id = node;
            }

            if let Err(error) = cfg.validate() {
                tracing::error!("Invalid config: {}", error);
                std::process::exit(2);
            }

            if let Err(error) = run_server(cfg).await {
                tracing::error!("Server error: {}", error);
                std::process::exit(1);
            }
        }
    }
}
