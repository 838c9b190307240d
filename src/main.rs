//! Overlay node CLI
//!
//! Run a single node, print the identity a seed produces, or spin up the
//! three-node demo network.

use clap::{Parser, Subcommand};
use overlay_node::crypto::PeerIdentity;
use overlay_node::network::DEFAULT_PROTOCOL;
use overlay_node::{Node, NodeConfig, DEFAULT_PORT};
use std::net::IpAddr;
use std::time::Duration;

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "overlay")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A minimal P2P overlay node with Kademlia peer lookup", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Start {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Interface to listen on
        #[arg(long, default_value = "0.0.0.0")]
        listen_ip: IpAddr,

        /// Bootstrap peers (comma-separated full addresses)
        #[arg(long)]
        peers: Option<String>,

        /// Identity seed; 0 draws a random identity
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Start without bootstrapping (first node of a network)
        #[arg(long)]
        no_bootstrap: bool,

        /// Protocol id to receive and send on
        #[arg(long, default_value = DEFAULT_PROTOCOL)]
        protocol: String,
    },

    /// Three local nodes: C finds B through A and says hello
    Demo {
        /// Port of the first node; the others take the next two
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },

    /// Print the peer id a seed produces
    Id {
        #[arg(short, long)]
        seed: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Commands::Id { seed } = cli.command {
        let identity = PeerIdentity::generate(seed)?;
        println!("🔑 Peer ID:    {}", identity.peer_id());
        println!("   Public key: {}", identity.public_key_hex());
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::Start {
                port,
                listen_ip,
                peers,
                seed,
                no_bootstrap,
                protocol,
            } => {
                let bootstrap_peers: Vec<String> = peers
                    .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default();

                let config = NodeConfig {
                    bootstrap_peers,
                    listen_ip,
                    port,
                    key_seed: seed,
                    no_bootstrap,
                    protocol,
                    ..NodeConfig::default()
                };
                run_start(config).await
            }
            Commands::Demo { port } => run_demo(port).await,
            Commands::Id { .. } => unreachable!(),
        }
    })
    .map_err(|e| -> Box<dyn std::error::Error> { e })
}

async fn run_start(config: NodeConfig) -> CliResult {
    println!("🌐 Starting overlay node on port {}...", config.port);

    let node = Node::new(config).await?;
    let protocol = node.config().protocol.clone();
    node.register_handler(&protocol, |peer, data| {
        println!("📨 {} says: {}", peer.short(), String::from_utf8_lossy(&data));
    })
    .await;

    node.started().await?;

    println!("✅ Node {} is up", node.peer_id());
    for addr in node.full_addrs() {
        println!("   📍 {}", addr);
    }

    tokio::signal::ctrl_c().await.ok();
    println!("\n📴 Shutting down node...");
    node.stop().await?;
    Ok(())
}

async fn run_demo(port: u16) -> CliResult {
    let base = |seed: u64, port: u16| NodeConfig {
        listen_ip: IpAddr::from([127, 0, 0, 1]),
        port,
        key_seed: seed,
        ..NodeConfig::default()
    };

    println!("🌐 Starting node A...");
    let a = Node::new(NodeConfig {
        no_bootstrap: true,
        ..base(0, port)
    })
    .await?;
    a.started().await?;
    let a_addr = a.full_addrs()[0].to_string();

    println!("🌐 Starting node B...");
    let b = Node::new(NodeConfig {
        bootstrap_peers: vec![a_addr.clone()],
        ..base(1, port + 1)
    })
    .await?;
    b.register_handler(DEFAULT_PROTOCOL, |peer, data| {
        println!("📨 B got from {}: {}", peer.short(), String::from_utf8_lossy(&data));
    })
    .await;
    b.started().await?;

    println!("🌐 Starting node C...");
    let c = Node::new(NodeConfig {
        bootstrap_peers: vec![a_addr],
        ..base(2, port + 2)
    })
    .await?;
    c.started().await?;

    println!("🔍 C looking up B ({})...", b.peer_id().short());
    let record = c.find_peer(&b.peer_id()).await?;
    for addr in &record.addrs {
        println!("   📍 {}", addr);
    }

    c.connect(&record).await?;
    c.send(&b.peer_id(), "hello friend").await?;
    println!("📤 C sent \"hello friend\" to B");

    // Let B's handler print before tearing down
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in [&c, &b, &a] {
        node.stop().await?;
    }
    println!("✅ Demo finished");
    Ok(())
}
