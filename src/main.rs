//! grabbit binary: validate inputs, configure tracing, run the download.
use clap::Parser;
use grabbit::download::{DownloadOptions, Downloader};
use grabbit::torrent::{Metainfo, TorrentError};
use grabbit::Error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "grabbit", version, about = "Single-torrent BitTorrent downloader")]
struct Args {
    /// Path to the .torrent metainfo file
    torrent: PathBuf,

    /// Output directory; must not exist yet
    #[arg(short, long)]
    output: PathBuf,

    /// Listening port advertised to the tracker
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Override the generated peer id (exactly 20 bytes)
    #[arg(long)]
    peer_id: Option<String>,

    /// How many peers to request from the tracker
    #[arg(long)]
    numwant: Option<u32>,

    /// Cap on simultaneous peer connections
    #[arg(long, default_value_t = 30)]
    max_peers: usize,
}

fn parse_peer_id(raw: &str) -> Result<[u8; 20], Error> {
    <[u8; 20]>::try_from(raw.as_bytes()).map_err(|_| {
        Error::Input(TorrentError::InvalidFormat(
            "peer id override must be exactly 20 bytes".to_string(),
        ))
    })
}

async fn run(args: Args) -> Result<(), Error> {
    let metainfo = Metainfo::load(&args.torrent)?;

    let mut options = DownloadOptions::new(args.output);
    options.port = args.port;
    options.numwant = args.numwant;
    options.max_peers = args.max_peers;
    if let Some(raw) = &args.peer_id {
        options.peer_id = Some(parse_peer_id(raw)?);
    }

    let downloader = Downloader::new(metainfo, options);
    downloader
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("{}: {}", err.category(), err);
        std::process::exit(err.exit_code());
    }
}
