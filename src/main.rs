//! Entry point for `file-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **send** or **receive**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, argument parsing, address resolution).

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use file_over_udp::channel::{self, Socket};
use file_over_udp::files::FileSink;
use file_over_udp::{send_file, ArqMode, Progress, ReceiverSession, TransferConfig};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to a waiting receiver.
    Send {
        /// Receiver host name or IP address.
        #[arg(short, long)]
        target: String,
        /// Receiver UDP port.
        #[arg(short = 'p', long)]
        target_port: u16,
        /// Local UDP port to bind (0 lets the OS choose).
        #[arg(short, long, default_value_t = 0)]
        local_port: u16,
        /// File to send.
        file: PathBuf,
        #[command(flatten)]
        arq: ArqArgs,
        /// Retransmission timeout in milliseconds.
        #[arg(long, default_value_t = 200)]
        timeout_ms: u64,
        /// Retransmissions per segment before giving up (0 = never give up).
        #[arg(long, default_value_t = 50)]
        max_retries: u32,
    },
    /// Wait for one incoming file.
    Receive {
        /// Local UDP port to listen on.
        #[arg(short, long)]
        local_port: u16,
        /// Address to listen on; `::` also accepts IPv6 on dual-stack hosts.
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Directory to write the file into, under its transmitted name.
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Exact output path; overrides the transmitted name.
        #[arg(long, conflicts_with = "output_dir")]
        output: Option<PathBuf>,
        #[command(flatten)]
        arq: ArqArgs,
    },
}

/// Settings both peers must agree on.
#[derive(Args)]
struct ArqArgs {
    /// Sliding window size in segments.
    #[arg(short, long, default_value_t = 8)]
    window: usize,
    /// ARQ variant: selective-repeat (sr), go-back-n (gbn) or stop-and-wait (saw).
    #[arg(short, long, default_value = "selective-repeat")]
    mode: ArqMode,
}

impl ArqArgs {
    fn config(&self) -> TransferConfig {
        TransferConfig {
            mode: self.mode,
            window_size: self.window,
            ..TransferConfig::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Send {
            target,
            target_port,
            local_port,
            file,
            arq,
            timeout_ms,
            max_retries,
        } => {
            let config = TransferConfig {
                timeout: Duration::from_millis(timeout_ms),
                max_retries: (max_retries > 0).then_some(max_retries),
                ..arq.config()
            };
            config.validate().context("invalid settings")?;

            let peer = channel::resolve(&target, target_port)
                .await
                .with_context(|| format!("cannot resolve {target}"))?;
            let bind = channel::wildcard_for(peer, local_port);
            let socket = Socket::bind(bind)
                .await
                .with_context(|| format!("cannot bind {bind}"))?;
            log::info!("Sending {} from {} to {peer}", file.display(), socket.local_addr);

            let report = send_file(&socket, peer, &file, &config, print_progress)
                .await
                .with_context(|| format!("cannot send {}", file.display()))?;
            eprintln!();
            let report = report.into_result().context("transfer failed")?;
            println!(
                "sent {} bytes in {} segments ({} retransmissions)",
                report.bytes_acked, report.segments_acked, report.stats.retransmissions
            );
        }
        Mode::Receive {
            local_port,
            bind,
            output_dir,
            output,
            arq,
        } => {
            let config = arq.config();
            config.validate().context("invalid settings")?;

            let bind = SocketAddr::new(bind, local_port);
            let socket = Socket::bind(bind)
                .await
                .with_context(|| format!("cannot bind {bind}"))?;
            log::info!("Listening on {}", socket.local_addr);

            let sink = match output {
                Some(path) => FileSink::at_path(path),
                None => FileSink::in_dir(output_dir),
            };
            let mut session = ReceiverSession::new(&socket, sink, config)?;
            let mut report = session.run().await;
            if let Some(e) = report.error.take() {
                return Err(e).context("receive failed");
            }

            let sink = session.into_sink();
            let path = sink.path().map(|p| p.display().to_string()).unwrap_or_default();
            if report.size_mismatch() {
                eprintln!("warning: size differs from the sender's declaration");
            }
            match &report.verdict {
                Some(v) if v.matches() => {
                    println!("received {} ({} bytes), digest {}", path, report.bytes_written, v.actual)
                }
                Some(v) => bail!(
                    "digest mismatch for {path}: expected {}, got {}",
                    hex::encode(&v.expected),
                    v.actual
                ),
                None => bail!("transfer ended without a digest"),
            }
        }
    }
    Ok(())
}

fn print_progress(p: Progress) {
    let pct = if p.total_bytes == 0 {
        100.0
    } else {
        p.bytes_acked as f64 * 100.0 / p.total_bytes as f64
    };
    eprint!("\r{} / {} bytes ({pct:.0}%)", p.bytes_acked, p.total_bytes);
    let _ = std::io::stderr().flush();
}
