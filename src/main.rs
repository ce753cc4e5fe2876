//! A simple CLI harness for poking at audio nodes without running the bot:
//! fetch a node's status, or connect and watch its event stream.

use anyhow::Context;
use clap::{Parser, Subcommand};

use chorok_audio::{
    logging, NodeEvent, TcpNodeTransport, DEFAULT_NODE_PASSWORD, DEFAULT_NODE_PORT,
};

/// Args struct for the CLI.
#[derive(Parser, Debug)]
#[command(
    version,
    author = "Chorok Dev <chorok.dev@proton.me>",
    about = "A simple CLI harness for inspecting Chorok audio nodes."
)]
struct Cli {
    /// The command to run
    #[command(subcommand)]
    command: Commands,
}

/// The command to run.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch a node's resource status over its REST surface.
    Status {
        host: String,
        #[arg(long, default_value_t = DEFAULT_NODE_PORT)]
        port: u16,
        #[arg(long, default_value = DEFAULT_NODE_PASSWORD)]
        password: String,
    },
    /// Connect to a node and print its event stream until interrupted.
    Watch {
        host: String,
        #[arg(long, default_value_t = DEFAULT_NODE_PORT)]
        port: u16,
        #[arg(long, default_value = DEFAULT_NODE_PASSWORD)]
        password: String,
        /// Application id to identify with.
        #[arg(long, default_value_t = 0)]
        user_id: u64,
    },
}

async fn match_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Status {
            host,
            port,
            password,
        } => {
            let url = format!("http://{host}:{port}/status");
            let status = chorok_audio::http_client()
                .get(&url)
                .header("Authorization", &password)
                .send()
                .await
                .with_context(|| format!("requesting {url}"))?
                .error_for_status()?
                .json::<chorok_audio::NodeStatus>()
                .await?;
            println!("memory:   {}/{} MB", status.used_memory, status.total_memory);
            println!("threads:  {}", status.threads);
            println!("network:  {:.2} MB/s in, {:.2} MB/s out", status.network_inbound, status.network_outbound);
        }
        Commands::Watch {
            host,
            port,
            password,
            user_id,
        } => {
            let (_transport, mut events) =
                TcpNodeTransport::connect(&host, port, &password, user_id)
                    .await
                    .with_context(|| format!("connecting to {host}:{port}"))?;
            tracing::info!(%host, port, "watching node events");
            while let Some(event) = events.recv().await {
                match event {
                    NodeEvent::Unknown { name, data } => println!("{name}: {data}"),
                    other => println!("{other:?}"),
                }
            }
            tracing::warn!("node event stream ended");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init().map_err(|e| anyhow::anyhow!(e))?;
    let cli = Cli::parse();
    match_cli(cli).await
}
