// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watcher daemon CLI
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default port (8095) with watcher.db
//! watcherd
//!
//! # Custom database and port
//! watcherd --database /var/lib/watcher/events.db --port 9000
//!
//! # Replay an existing history without recording
//! watcherd --database events.db --read-only
//!
//! # Using a configuration file
//! watcherd --config watcherd.toml
//!
//! # Generate a default configuration
//! watcherd gen-config --output watcherd.toml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watcherd::{DaemonConfig, WatcherServer};

/// Watcher event distribution daemon
#[derive(Parser, Debug)]
#[command(name = "watcherd")]
#[command(about = "Watcher daemon - stores topology events and serves live or replayed streams")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Event database (SQLite path, :memory: or memory)
    #[arg(short, long)]
    database: Option<String>,

    /// Do not persist incoming events
    #[arg(long)]
    read_only: bool,

    /// Runtime worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "watcherd.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print a summary of a stored history
    Stats {
        /// Event database
        #[arg(short, long, default_value = "watcher.db")]
        database: String,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = build_config(&args)?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
            Commands::Stats { database } => cmd_stats(&database),
        };
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("watcherd-worker")
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(serve(config))
}

fn build_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(database) = &args.database {
        config.database = database.clone();
    }
    if args.read_only {
        config.read_only = true;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!("+----------------------------------------------------+");
    info!(
        "|       Watcher Daemon v{}                       |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:     {:38} |", config.listen_address());
    info!("|  Database: {:38} |", config.database);
    info!(
        "|  Mode:     {:38} |",
        if config.read_only { "read-only" } else { "recording" }
    );
    info!("|  Workers:  {:38} |", config.worker_threads);
    info!("+----------------------------------------------------+");

    let server = WatcherServer::from_config(config)?;

    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        server_handle.shutdown();
    });

    server.run().await?;
    info!("Watcher daemon stopped");
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let text = DaemonConfig::default().to_toml()?;
    std::fs::write(&output, text)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Generated configuration: {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(&path)?;
    println!("Configuration is valid: {}", path.display());
    println!("  Listen:   {}", config.listen_address());
    println!("  Database: {}", config.database);
    println!("  Replay:   {} events / {} ms step", config.replay.buffer_size, config.replay.time_step_ms);
    Ok(())
}

fn cmd_stats(database: &str) -> anyhow::Result<()> {
    let store = watcher_store::open(database)?;
    let count = store.count()?;
    println!("Database: {}", database);
    println!("  Events: {}", count);
    match store.event_range()? {
        Some((min, max)) => {
            println!("  First:  {} ms", min);
            println!("  Last:   {} ms", max);
            println!("  Span:   {:.1} s", (max - min) as f64 / 1000.0);
        }
        None => println!("  (empty)"),
    }
    Ok(())
}
