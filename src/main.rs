//! Entry point for `btcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  The client reads a file and sends it; the server receives the
//! stream until the client disconnects and writes it out.  All protocol
//! work lives in the library; `main.rs` owns only process setup.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use btcp::{ClientSocket, Config, ServerSocket};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;

/// Reliable byte stream over UDP using selective repeat.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Tuning {
    /// Sliding-window size in segments.
    #[arg(short, long, default_value_t = 100)]
    window: u16,
    /// Retransmission timeout in milliseconds.
    #[arg(short, long, default_value_t = 100)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Receive one stream and write it to a file (or stdout).
    Server {
        /// Local address to bind.
        #[arg(long, default_value = "127.0.0.1:30000")]
        bind: SocketAddr,
        /// Address of the client.
        #[arg(long, default_value = "127.0.0.1:20000")]
        peer: SocketAddr,
        /// Output file; stdout if omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Send a file to the server.
    Client {
        /// Local address to bind.
        #[arg(long, default_value = "127.0.0.1:20000")]
        bind: SocketAddr,
        /// Address of the server.
        #[arg(long, default_value = "127.0.0.1:30000")]
        peer: SocketAddr,
        /// File to send.
        #[arg(short, long)]
        input: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    match Cli::parse().mode {
        Mode::Server {
            bind,
            peer,
            output,
            tuning,
        } => run_server(bind, peer, output, config(&tuning)).await,
        Mode::Client {
            bind,
            peer,
            input,
            tuning,
        } => run_client(bind, peer, input, config(&tuning)).await,
    }
}

fn config(t: &Tuning) -> Config {
    Config::new(t.window, t.timeout)
}

async fn run_server(
    bind: SocketAddr,
    peer: SocketAddr,
    output: Option<PathBuf>,
    config: Config,
) -> Result<()> {
    log::info!("Starting server on {bind}, client {peer}");
    let mut socket = ServerSocket::bind(bind, peer, config)
        .await
        .with_context(|| format!("binding {bind}"))?;

    socket.accept().await.context("accepting connection")?;
    let data = socket.recv_to_end().await.context("receiving stream")?;
    log::info!("Received {} bytes", data.len());

    match output {
        Some(path) => tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }
    socket.close().await?;
    Ok(())
}

async fn run_client(
    bind: SocketAddr,
    peer: SocketAddr,
    input: PathBuf,
    config: Config,
) -> Result<()> {
    let data = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;

    log::info!("Starting client on {bind}, server {peer}");
    let mut socket = ClientSocket::bind(bind, peer, config)
        .await
        .with_context(|| format!("binding {bind}"))?;

    socket.connect().await.context("connecting")?;
    socket.send(&data).await.context("sending")?;
    log::info!("Sent {} bytes", data.len());

    if let Err(e) = socket.disconnect().await {
        log::warn!("Disconnect: {e}");
    }
    socket.close().await?;
    Ok(())
}
