//! Entry point for `rudp`.
//!
//! Parses CLI arguments and runs either the **receive** or the **send** side
//! of a single transfer.  All protocol work is delegated to the library;
//! `main.rs` owns only process setup (logging, argument parsing, reporting).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::net::UdpSocket;

use rudp::{Config, Connection, Datagram, FaultConfig, LossyDatagram, Socket};

/// Reliable message delivery over UDP (stop-and-wait ARQ).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and print every message it delivers.
    Receive {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },
    /// Connect to a receiver, send messages, then disconnect.
    Send {
        /// Receiver address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        peer: SocketAddr,
        /// Size of each generated message in bytes.
        #[arg(short, long, default_value_t = 20_000, conflicts_with = "file")]
        size: usize,
        /// Number of messages to send.
        #[arg(short, long, default_value_t = 1)]
        count: u32,
        /// Send the contents of this file instead of generated bytes.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Args)]
struct Tuning {
    /// Retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 1000)]
    rto_ms: u64,
    /// Retransmissions allowed per packet.
    #[arg(long, global = true, default_value_t = 5)]
    max_retries: u32,
    /// Receive/accept idle timeout in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    idle_secs: u64,
    /// Maximum payload bytes per packet.
    #[arg(long, global = true, default_value_t = 8192)]
    mss: usize,
    /// Probability of dropping an outbound datagram (enables the simulator).
    #[arg(long, global = true, default_value_t = 0.0)]
    loss: f64,
    /// Seed for the simulator's RNG.
    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,
}

impl Tuning {
    fn config(&self) -> Config {
        Config::default()
            .with_rto(Duration::from_millis(self.rto_ms))
            .with_max_retries(self.max_retries)
            .with_idle_timeout(Duration::from_secs(self.idle_secs))
            .with_mss(self.mss)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    if !(0.0..=1.0).contains(&cli.tuning.loss) {
        bail!("--loss must be between 0 and 1, got {}", cli.tuning.loss);
    }
    let config = cli.tuning.config();
    config.validate().context("invalid tuning flags")?;

    let bind = match &cli.mode {
        Mode::Receive { bind } => *bind,
        Mode::Send { peer, .. } if peer.is_ipv6() => "[::]:0".parse()?,
        Mode::Send { .. } => "0.0.0.0:0".parse()?,
    };
    let udp = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    if cli.tuning.loss > 0.0 {
        log::info!(
            "simulating {:.1}% loss (seed {})",
            cli.tuning.loss * 100.0,
            cli.tuning.seed
        );
        let lossy = LossyDatagram::new(udp, FaultConfig::lossy(cli.tuning.loss, cli.tuning.seed));
        run(Socket::new(lossy)?, config, cli.mode).await
    } else {
        run(Socket::new(udp)?, config, cli.mode).await
    }
}

async fn run<D: Datagram>(socket: Socket<D>, config: Config, mode: Mode) -> Result<()> {
    let mut conn = Connection::with_socket(socket, config)?;
    match mode {
        Mode::Receive { .. } => receive(&mut conn).await?,
        Mode::Send {
            peer,
            size,
            count,
            file,
        } => {
            let message = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => (0..size).map(|i| i as u8).collect(),
            };
            send(&mut conn, peer, &message, count).await?;
        }
    }
    conn.close().await.context("closing connection")?;
    Ok(())
}

async fn receive<D: Datagram>(conn: &mut Connection<D>) -> Result<()> {
    log::info!("listening on {}", conn.local_addr());
    let peer = conn.accept().await.context("waiting for a connection")?;
    println!("connection from {peer}");

    let mut total = 0usize;
    let mut messages = 0u64;
    while let Some(message) = conn.recv_message().await.context("receiving")? {
        messages += 1;
        total += message.len();
        println!("message {messages}: {} bytes", message.len());
    }
    conn.disconnect().await.context("finishing teardown")?;

    println!("peer disconnected: {messages} messages, {total} bytes");
    println!("{}", conn.stats());
    Ok(())
}

async fn send<D: Datagram>(
    conn: &mut Connection<D>,
    peer: SocketAddr,
    message: &[u8],
    count: u32,
) -> Result<()> {
    conn.connect(peer)
        .await
        .with_context(|| format!("connecting to {peer}"))?;
    println!("connected to {peer}");

    let started = Instant::now();
    let mut total = 0usize;
    for i in 1..=count {
        total += conn
            .send(message)
            .await
            .with_context(|| format!("sending message {i}"))?;
    }
    let elapsed = started.elapsed();
    conn.disconnect().await.context("disconnecting")?;

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "sent {count} messages, {total} bytes in {:.3}s ({:.1} KiB/s)",
        elapsed.as_secs_f64(),
        total as f64 / 1024.0 / secs
    );
    println!("{}", conn.stats());
    Ok(())
}
