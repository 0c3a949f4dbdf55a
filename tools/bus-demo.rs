//! Bus walkthrough
//!
//! Starts a bus, attaches two clients over Unix socket pairs, registers an
//! address on the first and sends a value to it from the second.
//!
//! Usage:
//!   bus-demo [--address <name>] [--delay-ms <ms>] [--value <json>]

use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::info;

use chanbridge::bus::{Bus, NetClient};
use chanbridge::config::ChanConfig;
use chanbridge::utils::{init_logging_from_config, limit_time, DEFAULT_BRIDGE_DEADLINE};

#[derive(Parser, Debug)]
#[command(about = "Routes one message between two bus clients")]
struct Args {
    /// Address the first client registers
    #[arg(long, default_value = "test-address-1")]
    address: String,

    /// Delay before the second client sends
    #[arg(long, default_value_t = 5)]
    delay_ms: u64,

    /// JSON value to send
    #[arg(long, default_value = r#"{"key":"any value"}"#)]
    value: String,

    /// Configuration file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ChanConfig::from_file(path)?,
        None => ChanConfig::default(),
    };
    config.validate()?;
    init_logging_from_config(Some(&config.logging));

    let value: Value = serde_json::from_str(&args.value)?;
    let bus = Bus::with_config(config.bus.clone());

    let (near1, far1) = UnixStream::pair()?;
    let (near2, far2) = UnixStream::pair()?;
    bus.connect(far1).await?;
    bus.connect(far2).await?;
    let client1 = NetClient::with_config(near1, "client-1", &config.transport)?;
    let client2 = NetClient::with_config(near2, "client-2", &config.transport)?;

    let mut inbox = client1.register_exclusive(&args.address).await?;

    let address = args.address.clone();
    let delay = Duration::from_millis(args.delay_ms);
    let sent = value.clone();
    let sender = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        client2.message(&address, &sent)
    });

    let received: Value = limit_time(inbox.receive(), DEFAULT_BRIDGE_DEADLINE).await?;
    sender.await??;
    info!("client-1 received {} on {:?}", received, args.address);
    println!("{}", received);

    let stats = bus.stats();
    info!("routed={} missed={}", stats.routed, stats.missed);
    bus.close().await;

    anyhow::ensure!(received == value, "received {} but sent {}", received, value);
    Ok(())
}
