//! sigvar CLI - serve, replicate and ping shared variables
//!
//! `serve` publishes a JSON value as a new writable variable and keeps the
//! node online; `get` replicates a variable from a known peer and prints
//! it; `ping` checks that a node answers.
//!
//! Values are replicated as their JSON text; the engine itself is agnostic
//! to the value type.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::crypto::VarId;
use common::engine::{Engine, EngineBuilder};
use common::shared_var::VarEvent;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a JSON value as a new shared variable and keep serving it
    Serve {
        /// Address to bind the UDP socket on
        #[arg(long, default_value = "0.0.0.0:3735")]
        bind: SocketAddr,
        /// The initial value, as JSON
        value: String,
    },
    /// Replicate a variable from a peer and print its value
    Get {
        /// Hex-encoded variable id
        id: String,
        /// A peer known to hold the variable
        #[arg(long)]
        peer: SocketAddr,
        /// How long to wait for convergence, in seconds
        #[arg(long, default_value = "30")]
        wait: u64,
    },
    /// Check that a node answers
    Ping { peer: SocketAddr },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();

    match args.command {
        Command::Serve { bind, value } => serve(bind, value).await,
        Command::Get { id, peer, wait } => get(id, peer, wait).await,
        Command::Ping { peer } => ping(peer).await,
    }
}

async fn serve(bind: SocketAddr, value: String) -> Result<()> {
    // validate and canonicalize the JSON before publishing it
    let parsed: serde_json::Value = serde_json::from_str(&value)?;
    let canonical = serde_json::to_string(&parsed)?;

    let engine: Engine<String> = EngineBuilder::new().bind_addr(bind).bind().await?;
    let var = engine.assign(canonical).await?;

    println!("listening on {}", engine.local_addr());
    println!("variable id: {}", var.id());

    let events = var.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv_async() => match event {
                Ok(event) => tracing::info!("variable event: {event:?}"),
                Err(_) => break,
            },
        }
    }

    engine.close();
    Ok(())
}

async fn get(id: String, peer: SocketAddr, wait: u64) -> Result<()> {
    let id = VarId::from_hex(&id).map_err(|e| anyhow!("invalid variable id: {e}"))?;

    let engine: Engine<String> = EngineBuilder::new().bind().await?;
    engine.ping(peer).await?;

    let var = engine.get(id);
    let events = var.subscribe();

    let value = tokio::time::timeout(Duration::from_secs(wait), async {
        loop {
            // the background sync may have landed before we subscribed
            if let Some(value) = var.value() {
                break Ok(value);
            }
            match events.recv_async().await {
                Ok(VarEvent::DownloadError(e)) => tracing::warn!("download error: {e}"),
                Ok(_) => {}
                Err(_) => break Err(anyhow!("engine closed while waiting")),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for the variable to converge"))??;

    match serde_json::from_str::<serde_json::Value>(&value) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{value}"),
    }

    engine.close();
    Ok(())
}

async fn ping(peer: SocketAddr) -> Result<()> {
    let engine: Engine<String> = EngineBuilder::new().bind().await?;
    engine.ping(peer).await?;
    println!("{peer} responded");
    engine.close();
    Ok(())
}
