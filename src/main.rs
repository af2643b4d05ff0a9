//! Chainswarm CLI
//!
//! Runs a swarm node from the command line.

use std::sync::Arc;
use std::time::Duration;

use chainswarm::chain::Chain;
use chainswarm::crypto::KeyPair;
use chainswarm::network::{Peer, Swarm, SwarmConfig, DEFAULT_DISTRIBUTE_INTERVAL};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;

#[derive(Parser)]
#[command(name = "chainswarm")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking core for a blockchain node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a swarm node
    Run {
        /// Host to advertise to peers
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 picks any free port)
        #[arg(short, long, default_value = "9400")]
        port: u16,

        /// Application protocol version
        #[arg(long, default_value = "1")]
        protocol_version: i32,

        /// Hex-encoded private key; a fresh one is generated if omitted
        #[arg(long)]
        key: Option<String>,

        /// Initial peers, as <public-key-hex>@<host>:<port>
        #[arg(long = "peer")]
        peers: Vec<Peer>,

        /// Delta distribution interval in milliseconds
        #[arg(long, default_value = "1500")]
        distribute_interval_ms: u64,
    },

    /// Generate a key pair and print it
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            host,
            port,
            protocol_version,
            key,
            peers,
            distribute_interval_ms,
        } => {
            let keys = match key {
                Some(hex) => KeyPair::from_private_key_hex(&hex)?,
                None => {
                    let keys = KeyPair::generate();
                    log::info!("Generated node key {}", keys.public_key_hex());
                    keys
                }
            };
            log::info!("Node address: {}", keys.address());

            let mut config = SwarmConfig::new(keys, protocol_version);
            config.host = Some(host);
            config.listen_port = Some(port);

            let swarm = Arc::new(Swarm::new(config, None)?);
            let chain = Arc::new(RwLock::new(Chain::new()));

            if !peers.is_empty() {
                let accepted = swarm.add_peers(peers, chrono::Utc::now()).await?;
                log::info!("Seeded {} peers", accepted.len());
            }

            let interval = if distribute_interval_ms == 0 {
                DEFAULT_DISTRIBUTE_INTERVAL
            } else {
                Duration::from_millis(distribute_interval_ms)
            };

            let runner = {
                let swarm = swarm.clone();
                tokio::spawn(async move { swarm.start(chain, interval).await })
            };

            tokio::signal::ctrl_c().await?;
            log::info!("Interrupted, shutting down");
            swarm.stop().await;
            runner.await??;
        }

        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("private key: {}", keys.private_key_hex());
            println!("public key:  {}", keys.public_key_hex());
            println!("address:     {}", keys.address());
        }
    }
    Ok(())
}
