extern crate pretty_env_logger;
#[macro_use]
extern crate log;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use piecework::{
    metainfo::Metainfo,
    torrent::{generate_peer_id, TorrentJob},
    tracker, writer, DownloadConfig, PieceScheduler,
};
use tokio::fs;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        return Err(anyhow!("usage: {} <file.torrent> [output]", args[0]));
    }

    let buffer = fs::read(&args[1])
        .await
        .with_context(|| format!("failed to read {}", args[1]))?;
    let metainfo = Metainfo::from_bytes(&buffer)?;

    let peer_id = generate_peer_id();
    let peers = tracker::discover_peers(&metainfo, &peer_id).await;
    if peers.is_empty() {
        return Err(anyhow!("tracker returned no peers"));
    }

    let job = TorrentJob::from_metainfo(&metainfo, peer_id, peers)?;
    let output = match args.get(2) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(&job.name),
    };

    let data = PieceScheduler::new(job, DownloadConfig::default())
        .run()
        .await?;
    writer::write_output(&output, &data).await?;

    info!("download complete: {}", output.display());

    Ok(())
}
