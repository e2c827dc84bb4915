//! Tunnel CLI - create, publish to and listen on broadcast tunnels
//!
//! Talks to a tunnel broker over TCP with automatic reconnection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnel_client::{ClientConfig, TunnelClient, DEFAULT_SERVER_ADDR};

/// Tunnel - pub/sub messaging over broadcast tunnels
#[derive(Parser, Debug)]
#[command(name = "tunnel")]
#[command(about = "Tunnel - pub/sub messaging over broadcast tunnels")]
#[command(version)]
#[command(long_version = concat!(
    env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"
))]
struct Cli {
    /// Broker address (host:port)
    #[arg(long, env = "TUNNEL_SERVER", default_value = DEFAULT_SERVER_ADDR, global = true)]
    server: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Seconds to wait for the broker to acknowledge a request
    #[arg(long, default_value = "10", global = true)]
    ack_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a broadcast tunnel
    Create {
        /// Tunnel name (letters and digits)
        name: String,
    },

    /// Publish a message into a tunnel
    #[command(long_about = r#"
Publish a message into a tunnel. Every word after the tunnel name is part
of the message; only letters, digits and spaces are accepted.

EXAMPLES:
  tunnel create Bidule
  tunnel publish Bidule Hello world
  TUNNEL_SERVER=10.0.0.5:19917 tunnel publish Bidule Hello
    "#)]
    Publish {
        /// Tunnel name
        tunnel: String,

        /// Message text
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },

    /// Print every message of a tunnel until Ctrl+C
    Listen {
        /// Tunnel name
        tunnel: String,
    },
}

/// Setup logging, preferring RUST_LOG over the command line level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run(client: &TunnelClient, command: Commands) -> Result<()> {
    match command {
        Commands::Create { name } => {
            client
                .create_broadcast_tunnel(&name)
                .await
                .with_context(|| format!("Failed to create tunnel {}", name))?;
            info!("Tunnel {} created", name);
        }
        Commands::Publish { tunnel, message } => {
            let message = message.join(" ");
            client
                .publish_message(&tunnel, &message)
                .await
                .with_context(|| format!("Failed to publish to tunnel {}", tunnel))?;
            info!("Message published to {}", tunnel);
        }
        Commands::Listen { tunnel } => {
            client
                .listen_tunnel(&tunnel, |msg| println!("[{}] {}", msg.tunnel, msg.message))
                .await
                .with_context(|| format!("Failed to listen on tunnel {}", tunnel))?;
            info!("Listening on {}, press Ctrl+C to stop", tunnel);

            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    let config = ClientConfig::builder()
        .server_addr(cli.server.as_str())
        .ack_timeout(Duration::from_secs(cli.ack_timeout))
        .build()
        .context("Invalid client configuration")?;

    let client = TunnelClient::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.server))?;

    let result = run(&client, cli.command).await;
    client.stop().await;
    result
}
