// ============================================
// File: crates/tunlink-server/src/main.rs
// ============================================
//! # tunlink Entry Point
//!
//! ## Creation Reason
//! Binary entry point. Handles CLI parsing, logging setup and server
//! start-up.
//!
//! ## Usage
//! ```bash
//! tunlink start --config /etc/tunlink/tunlink.toml
//! tunlink validate --config /etc/tunlink/tunlink.toml
//! tunlink default-config > tunlink.toml
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `start` requires root or CAP_NET_ADMIN for TUN
//! - `RUST_LOG` overrides `[logging] level`
//!
//! ## Last Modified
//! v0.1.0 - Initial CLI implementation

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunlink_server::{Server, ServerConfig};

// ============================================
// CLI Definition
// ============================================

/// TUN interceptor with a user-space TCP/IP stack.
#[derive(Parser, Debug)]
#[command(name = "tunlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the interface and start forwarding flows
    Start {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/tunlink/tunlink.toml")]
        config: PathBuf,
    },

    /// Check a configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/tunlink/tunlink.toml")]
        config: PathBuf,
    },

    /// Print the default configuration
    DefaultConfig,
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { config } => cmd_start(config).await,
        Commands::Validate { config } => cmd_validate(config).await,
        Commands::DefaultConfig => {
            print!("{}", ServerConfig::default().to_toml());
            Ok(())
        }
    };

    if let Err(e) = result {
        init_logging("info");
        error!("{:#}", e);
        std::process::exit(1);
    }
}

// ============================================
// Commands
// ============================================

async fn cmd_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        ServerConfig::load(&config_path).await?
    } else {
        ServerConfig::default()
    };

    init_logging(&config.logging.level);
    if !config_path.exists() {
        info!("Config file {} not found, using defaults", config_path.display());
    }
    info!("Starting tunlink on {}", config.tun.name);

    let server = Server::new(config);
    server.run().await?;
    Ok(())
}

async fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("Config file not found: {}", config_path.display());
        println!("   Server will use default values.");
        return Ok(());
    }

    let config = ServerConfig::load(&config_path).await?;
    let tun = config.tun_config()?;

    println!("Configuration is valid");
    println!();
    println!("TUN:");
    println!("   Device:     {}", tun.name);
    println!("   MTU:        {}", tun.effective_mtu());
    println!("   Address:    {}", config.tun.inet4_address);
    println!("   Auto Route: {}", tun.auto_route);
    println!();
    println!("Stack:");
    println!("   TCP Buffer:     {} bytes", config.stack.tcp_buffer_size);
    println!("   Max In-Flight:  {}", config.stack.tcp_max_in_flight);
    println!("   SACK:           {}", config.stack.sack);
    println!("   Keep-Alive:     {}s", config.stack.keep_alive_interval_secs);
    println!();
    println!("Outbound:");
    println!(
        "   Interface:      {}",
        config.outbound.bind_interface.as_deref().unwrap_or("(default route)")
    );
    println!("   Connect Timeout: {}s", config.outbound.connect_timeout_secs);
    println!("   UDP Idle:        {}s", config.outbound.udp_idle_timeout_secs);
    println!();

    Ok(())
}

// ============================================
// Helpers
// ============================================

/// Installs the global subscriber. Later calls are no-ops.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
