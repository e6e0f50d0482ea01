// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! watcherctl - command-line client for the watcher daemon
//!
//! ```bash
//! # Drive a random mobility scenario into the daemon
//! watcherctl feed --nodes 20 --interval-ms 500
//!
//! # Follow the live feed
//! watcherctl watch
//!
//! # Replay the last stored history backwards at double speed
//! watcherctl watch --seek eof --speed -2
//!
//! # Inspect the daemon
//! watcherctl list-streams
//! watcherctl range
//! ```

mod output;
mod scenario;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use output::{format_timestamp, render, OutputFormat};
use scenario::{Scenario, ScenarioConfig};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use watcher::{
    now_millis, ClientConfig, ClientConnection, GpsMessage, Message, Payload, SeekPosition,
    StatusKind, PROTOCOL_VERSION,
};

/// Command-line client for the watcher daemon
#[derive(Parser, Debug)]
#[command(name = "watcherctl")]
#[command(version)]
#[command(about = "Feed, inspect and watch a watcher daemon")]
struct Cli {
    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:8095", global = true)]
    server: String,

    /// Reply timeout in seconds
    #[arg(long, default_value = "5", global = true)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a random mobility scenario
    Feed {
        /// Number of nodes
        #[arg(short, long, default_value = "10")]
        nodes: u32,

        /// Steps to send (0 = until interrupted)
        #[arg(long, default_value = "0")]
        steps: u64,

        /// Delay between steps in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Neighbor radius
        #[arg(long, default_value = "100")]
        radius: f64,

        /// Connectivity layers per node
        #[arg(long, default_value = "1")]
        layers: u32,

        /// Chance per step that a node is labeled (0-100)
        #[arg(long, default_value = "10")]
        label_percent: u8,

        /// RNG seed (default: random)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Send a single position report
    SendGps {
        /// Node address
        node: IpAddr,
        lat: f64,
        lng: f64,
        #[arg(default_value = "0")]
        alt: f64,
    },

    /// List the daemon's streams
    ListStreams,

    /// Show the stored history's time range
    Range,

    /// Print events from a live or replayed stream
    Watch {
        /// Join an existing stream instead of creating one
        #[arg(long)]
        stream: Option<u32>,

        /// Start position: milliseconds since the epoch, or "eof"
        #[arg(long)]
        seek: Option<String>,

        /// Playback speed (negative plays backwards)
        #[arg(long, allow_negative_numbers = true)]
        speed: Option<f32>,

        /// Description for the stream
        #[arg(short, long)]
        description: Option<String>,

        /// Output format: pretty, json, compact
        #[arg(short, long, default_value = "pretty")]
        format: OutputFormat,

        /// Stop after this many events (0 = unlimited)
        #[arg(short = 'n', long, default_value = "0")]
        count: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let timeout = Duration::from_secs(cli.timeout);
    let (mut client, mut incoming) =
        ClientConnection::connect(ClientConfig::new(cli.server.clone()));
    debug!("Connecting to {}", cli.server);
    tokio::time::timeout(timeout, client.wait_connected())
        .await
        .with_context(|| format!("timed out connecting to {}", cli.server))?
        .with_context(|| format!("could not connect to {}", cli.server))?;

    let result = match cli.command {
        Commands::Feed {
            nodes,
            steps,
            interval_ms,
            radius,
            layers,
            label_percent,
            seed,
        } => {
            let config = ScenarioConfig {
                nodes,
                radius,
                layers,
                label_percent: label_percent.min(100),
                ..Default::default()
            };
            cmd_feed(&client, config, steps, Duration::from_millis(interval_ms), seed).await
        }
        Commands::SendGps {
            node,
            lat,
            lng,
            alt,
        } => {
            let msg = Message::new(Payload::Gps(GpsMessage { node, lat, lng, alt }));
            client.send_message(msg).context("failed to queue message")
        }
        Commands::ListStreams => cmd_list_streams(&client, &mut incoming, timeout).await,
        Commands::Range => cmd_range(&client, &mut incoming, timeout).await,
        Commands::Watch {
            stream,
            seek,
            speed,
            description,
            format,
            count,
        } => {
            let seek = seek.as_deref().map(parse_seek).transpose()?;
            let opts = WatchOptions {
                stream,
                seek,
                speed,
                description,
                format,
                count,
            };
            cmd_watch(&client, &mut incoming, opts, timeout).await
        }
    };

    client.close().await;
    result
}

fn parse_seek(value: &str) -> anyhow::Result<SeekPosition> {
    if value.eq_ignore_ascii_case("eof") {
        return Ok(SeekPosition::Eof);
    }
    let ms: i64 = value
        .parse()
        .with_context(|| format!("invalid seek position '{}'", value))?;
    if ms < 0 {
        bail!("seek position must be positive or 'eof'");
    }
    Ok(SeekPosition::Time(ms))
}

/// Wait for the first reply matching `pick`.
async fn await_reply<T>(
    incoming: &mut mpsc::Receiver<Message>,
    timeout: Duration,
    mut pick: impl FnMut(Message) -> Option<T>,
) -> anyhow::Result<T> {
    let wait = async {
        while let Some(msg) = incoming.recv().await {
            if let Some(value) = pick(msg) {
                return Ok(value);
            }
        }
        bail!("connection closed before a reply arrived")
    };
    tokio::time::timeout(timeout, wait)
        .await
        .context("timed out waiting for the daemon")?
}

async fn cmd_feed(
    client: &ClientConnection,
    config: ScenarioConfig,
    steps: u64,
    interval: Duration,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let seed = seed.unwrap_or_else(|| fastrand::u64(..));
    println!(
        "Feeding {} nodes (seed {}), {} steps",
        config.nodes,
        seed,
        if steps == 0 { "unlimited".to_string() } else { steps.to_string() }
    );
    let mut scenario = Scenario::new(config, seed);
    let mut ticker = tokio::time::interval(interval);

    let mut sent = 0u64;
    let mut step = 0u64;
    while steps == 0 || step < steps {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted");
                break;
            }
        }
        scenario.step();
        let batch = scenario.messages(now_millis());
        sent += batch.len() as u64;
        client.send_messages(batch).context("connection closed")?;
        step += 1;
        info!("Step {} sent ({} messages total)", step, sent);
    }
    println!("Sent {} messages in {} steps", sent, step);
    Ok(())
}

async fn cmd_list_streams(
    client: &ClientConnection,
    incoming: &mut mpsc::Receiver<Message>,
    timeout: Duration,
) -> anyhow::Result<()> {
    client.send_message(Message::new(Payload::ListStreams(vec![])))?;
    let streams = await_reply(incoming, timeout, |msg| match msg.payload {
        Payload::ListStreams(streams) => Some(streams),
        _ => None,
    })
    .await?;

    if streams.is_empty() {
        println!("No streams");
        return Ok(());
    }
    println!("{:>6}  {}", "UID".bold(), "DESCRIPTION".bold());
    for info in streams {
        println!("{:>6}  {}", info.uid, info.description);
    }
    Ok(())
}

async fn cmd_range(
    client: &ClientConnection,
    incoming: &mut mpsc::Receiver<Message>,
    timeout: Duration,
) -> anyhow::Result<()> {
    client.send_message(Message::new(Payload::PlaybackTimeRange { min: 0, max: 0 }))?;
    let (min, max) = await_reply(incoming, timeout, |msg| match msg.payload {
        Payload::PlaybackTimeRange { min, max } => Some((min, max)),
        _ => None,
    })
    .await?;

    if min == 0 && max == 0 {
        println!("History is empty");
    } else {
        println!("First: {}", format_timestamp(min));
        println!("Last:  {}", format_timestamp(max));
        println!("Span:  {:.1} s", (max - min) as f64 / 1000.0);
    }
    Ok(())
}

struct WatchOptions {
    stream: Option<u32>,
    seek: Option<SeekPosition>,
    speed: Option<f32>,
    description: Option<String>,
    format: OutputFormat,
    count: u64,
}

async fn cmd_watch(
    client: &ClientConnection,
    incoming: &mut mpsc::Receiver<Message>,
    opts: WatchOptions,
    timeout: Duration,
) -> anyhow::Result<()> {
    client.send_message(Message::new(Payload::Hello {
        version: PROTOCOL_VERSION,
    }))?;
    let accepted = await_reply(incoming, timeout, |msg| match msg.payload {
        Payload::Hello { .. } => Some(true),
        Payload::Status(StatusKind::Nack) => Some(false),
        _ => None,
    })
    .await?;
    if !accepted {
        bail!("daemon does not speak protocol version {}", PROTOCOL_VERSION);
    }

    if let Some(uid) = opts.stream {
        client.send_message(Message::new(Payload::SubscribeStream(uid)))?;
        let joined = await_reply(incoming, timeout, |msg| match msg.payload {
            Payload::Status(StatusKind::Ack) => Some(true),
            Payload::Status(StatusKind::Nack) => Some(false),
            _ => None,
        })
        .await?;
        if !joined {
            bail!("no stream with uid {}", uid);
        }
    }

    let mut control = Vec::new();
    if let Some(description) = opts.description {
        control.push(Message::new(Payload::StreamDescription(description)));
    }
    if let Some(position) = opts.seek {
        control.push(Message::new(Payload::Seek(position)));
    }
    if let Some(speed) = opts.speed {
        control.push(Message::new(Payload::Speed(speed)));
    }
    control.push(Message::new(Payload::Start));
    client.send_messages(control)?;

    let mut shown = 0u64;
    loop {
        tokio::select! {
            msg = incoming.recv() => {
                let Some(msg) = msg else {
                    bail!("connection to daemon lost");
                };
                if !msg.is_data() {
                    debug!("Control reply: {:?}", msg.payload);
                    continue;
                }
                println!("{}", render(&msg, opts.format));
                shown += 1;
                if opts.count > 0 && shown >= opts.count {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.send_message(Message::new(Payload::Stop))?;
    eprintln!("{} events", shown);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seek() {
        assert_eq!(parse_seek("eof").unwrap(), SeekPosition::Eof);
        assert_eq!(parse_seek("EOF").unwrap(), SeekPosition::Eof);
        assert_eq!(parse_seek("1500").unwrap(), SeekPosition::Time(1500));
        assert!(parse_seek("-3").is_err());
        assert!(parse_seek("soon").is_err());
    }

    #[test]
    fn test_cli_parses_watch() {
        let cli = Cli::try_parse_from([
            "watcherctl", "watch", "--seek", "eof", "--speed", "-2", "-f", "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Watch { seek, speed, format, .. } => {
                assert_eq!(seek.as_deref(), Some("eof"));
                assert_eq!(speed, Some(-2.0));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
