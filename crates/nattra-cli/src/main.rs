//! NATTRA CLI
//!
//! Runs the infrastructure roles of a NATTRA deployment and the NAT
//! classifier over real UDP sockets.

mod config;

use clap::{Parser, Subcommand};
use nattra_shp::ShpParent;
use nattra_stun::{StunClient, StunServer};
use nattra_transport::{EventLoop, TransportConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::Config;

/// NATTRA - NAT classification and traversal
#[derive(Parser)]
#[command(name = "nattra")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "nattra.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer echo probes on a primary/secondary address pair
    StunServer,

    /// Classify the local NAT against two STUN servers
    Classify,

    /// Relay hole-punching rendezvous requests to registered children
    Parent,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;

    // RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !cli.config.exists() {
        tracing::debug!("No config at {}, using defaults", cli.config.display());
    }

    config.validate()?;

    match cli.command {
        Commands::StunServer => run_stun_server(&config).await?,
        Commands::Classify => classify(&config).await?,
        Commands::Parent => run_parent(&config).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

/// Run a STUN server until interrupted
async fn run_stun_server(config: &Config) -> anyhow::Result<()> {
    let id = config.node_id()?;
    let ([primary, secondary], partner) = config.stun_server(id)?;

    let mut server = StunServer::new(primary, secondary);
    if let Some([p, s]) = partner {
        server = server.with_partner(p, s);
    }

    println!("NATTRA STUN server {}", id);
    println!("Primary: {}", primary.socket);
    println!("Secondary: {}", secondary.socket);
    match partner {
        Some([p, s]) => println!("Partner: {} / {}", p, s),
        None => println!("Partner: none (other-IP probes are reset)"),
    }

    let (event_loop, handle, _events) = EventLoop::new(server, TransportConfig::default());
    let task = tokio::spawn(event_loop.run());

    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    handle.shutdown();

    let server = task.await??;
    let stats = server.stats();
    tracing::info!(
        "STUN server stopped: {} responses, {} forwarded, {} resets, {} dropped",
        stats.responses,
        stats.forwarded,
        stats.resets,
        stats.dropped
    );
    Ok(())
}

/// Run one classification and print the result
async fn classify(config: &Config) -> anyhow::Result<()> {
    if config.stun.servers.is_empty() {
        anyhow::bail!("stun.servers is empty; configure two STUN servers to classify");
    }

    let id = config.node_id()?;
    let local = config.local_pair(id)?;
    let servers = config.stun_servers()?;
    let client = StunClient::new(local, servers, config.stun_client());

    let (event_loop, handle, mut events) = EventLoop::new(client, TransportConfig::default());
    let task = tokio::spawn(event_loop.run());

    let detected = tokio::select! {
        detected = events.recv() => detected,
        _ = tokio::signal::ctrl_c() => None,
    };
    handle.shutdown();
    task.await??;

    let Some(detected) = detected else {
        anyhow::bail!("classification interrupted");
    };
    let classification = detected.result?;

    println!("NAT: {}", classification.descriptor);
    match classification.public_ip {
        Some(ip) => println!("Public IP: {}", ip),
        None => println!("Public IP: unknown"),
    }
    Ok(())
}

/// Run a rendezvous parent until interrupted
async fn run_parent(config: &Config) -> anyhow::Result<()> {
    let id = config.node_id()?;
    let (listen, children) = config.parent(id)?;

    let mut parent = ShpParent::new(listen);
    for child in &children {
        parent.register_child(*child);
    }

    println!("NATTRA parent {}", listen);
    println!("Children: {}", children.len());

    let (event_loop, handle, _events) = EventLoop::new(parent, TransportConfig::default());
    let task = tokio::spawn(event_loop.run());

    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    handle.shutdown();

    let parent = task.await??;
    tracing::info!("Parent stopped after relaying {} request(s)", parent.relayed());
    Ok(())
}
