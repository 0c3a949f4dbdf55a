//! Echo plugin: a child process for the process bridge
//!
//! Claims the socket its parent installed, answers the echo handshake and then
//! logs whatever arrives on channels the parent opens.
//!
//! Usage:
//!   echo-plugin [--exit-after-handshake] [--exit-code <n>] [--config <file>]

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use chanbridge::config::ChanConfig;
use chanbridge::process::{answer_handshake, inherited_stream};
use chanbridge::transport::{Role, Transport};
use chanbridge::utils::{init_plugin_logging, wait_for_shutdown_signal};

#[derive(Parser, Debug)]
#[command(about = "Answers the chanbridge handshake on an inherited socket")]
struct Args {
    /// Exit as soon as the handshake has been answered
    #[arg(long)]
    exit_after_handshake: bool,

    /// Exit code used with --exit-after-handshake
    #[arg(long, default_value_t = 0)]
    exit_code: i32,

    /// Configuration file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_plugin_logging("echo_plugin", args.log_filter.as_deref());

    let config = match &args.config {
        Some(path) => ChanConfig::from_file(path)?,
        None => ChanConfig::default(),
    };
    config.validate()?;

    let stream = inherited_stream(&config.bridge).context("echo-plugin must be started by a bridge")?;
    let transport = Transport::from_std_unix(stream, Role::Server, &config.bridge.transport)?;

    let message = answer_handshake(&transport).await?;
    info!("Handshake {:?} answered", message);

    if args.exit_after_handshake {
        transport.shutdown().await;
        debug!("Exiting with code {}", args.exit_code);
        std::process::exit(args.exit_code);
    }

    loop {
        let mut channel = tokio::select! {
            _ = wait_for_shutdown_signal() => break,
            channel = transport.wait_receive_channel() => match channel {
                Ok(channel) => channel,
                Err(e) => {
                    info!("Parent went away: {}", e);
                    break;
                }
            },
        };

        tokio::spawn(async move {
            loop {
                match channel.receive_with_reply::<Value>().await {
                    Ok((value, reply)) => {
                        info!("Received {}", value);
                        if let Some(reply) = reply {
                            if let Err(e) = reply.send(&value) {
                                warn!("Could not echo value back: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Channel ended: {}", e);
                        break;
                    }
                }
            }
        });
    }

    transport.shutdown().await;
    Ok(())
}
