//! Downloads and seeds one torrent until interrupted.
//!
//! Usage: swarmbit path/to/file.torrent [--dir DIR] [--port-start N]
//!
//! Log output follows `RUST_LOG`; the default is `swarmbit=info`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use swarmbit::config::SessionConfig;
use swarmbit::metainfo::Metainfo;
use swarmbit::session::Session;
use tracing_subscriber::EnvFilter;

/// Ports tried after `--port-start`.
const PORT_SPAN: u16 = 8;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Time given to the `stopped` announce before the session is torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The .torrent file to download.
    torrent: PathBuf,

    /// Directory the torrent's files are stored under.
    #[arg(long, default_value = "downloads")]
    dir: PathBuf,

    /// First listen port to try.
    #[arg(long, default_value_t = 6881)]
    port_start: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swarmbit=info")),
        )
        .init();

    let cli = Cli::parse();
    let metainfo = Metainfo::from_file(&cli.torrent)?;
    let config = SessionConfig {
        download_dir: cli.dir,
        port_range: cli.port_start..=cli.port_start.saturating_add(PORT_SPAN),
        ..SessionConfig::default()
    };

    let session = Session::start(&metainfo, config).await?;
    let total = metainfo.info.total_length;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = status.tick() => {
                let totals = session.totals();
                let done = total.saturating_sub(totals.left());
                let pct = if total == 0 { 100.0 } else { done as f64 / total as f64 * 100.0 };
                let (avg_up, avg_down) = session.average_rates();
                tracing::info!(
                    peers = session.peers().connection_count(),
                    down = session.download_rate(),
                    up = session.upload_rate(),
                    avg_down = avg_down as u64,
                    avg_up = avg_up as u64,
                    "{:.1}% of {} ({} uploaded)",
                    pct,
                    metainfo.info.name,
                    totals.uploaded()
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    tracing::info!("shutting down");
    session.pause();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    session.stop();
    Ok(())
}
