//! minilease node binary

use clap::{Parser, Subcommand};
use minilease::coordinator::http::InfoResponse;
use minilease::coordinator::peer::ErrorBody;
use minilease::{Config, NodeServer};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minilease")]
#[command(about = "Lease-based primary election and handoff")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Serve {
        /// Config file (searched for when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Do not expand ${VAR} references in the config file
        #[arg(long)]
        no_expand_env: bool,

        /// Serve without waiting to become primary or reach the primary
        #[arg(long)]
        skip_sync: bool,
    },

    /// Show a node's leadership view
    Info {
        /// Node API URL
        #[arg(long, default_value = "http://localhost:20202")]
        node: String,
    },

    /// Ask a node to become primary
    Promote {
        /// Node API URL
        #[arg(long, default_value = "http://localhost:20202")]
        node: String,
    },
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn print_response(resp: reqwest::Response) -> anyhow::Result<()> {
    if resp.status().is_success() {
        let info: InfoResponse = resp.json().await?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    let status = resp.status();
    let body: ErrorBody = resp.json().await.unwrap_or(ErrorBody {
        error: status.to_string(),
        primary: None,
    });
    anyhow::bail!("{}: {}", status, body.error)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            no_expand_env,
            skip_sync,
        } => {
            let mut config = Config::load(config.as_deref(), !no_expand_env)?;
            if skip_sync {
                config.skip_sync = true;
            }
            init_tracing(&config.log_level);
            NodeServer::new(config).serve().await?;
        }
        Commands::Info { node } => {
            init_tracing("warn");
            let resp = reqwest::Client::new()
                .get(format!("{}/info", node.trim_end_matches('/')))
                .timeout(Duration::from_secs(5))
                .send()
                .await?;
            print_response(resp).await?;
        }
        Commands::Promote { node } => {
            init_tracing("warn");
            let resp = reqwest::Client::new()
                .post(format!("{}/promote", node.trim_end_matches('/')))
                .timeout(Duration::from_secs(60))
                .send()
                .await?;
            print_response(resp).await?;
        }
    }

    Ok(())
}
