use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use torrent_client::download::{Engine, EngineConfig};
use torrent_client::torrent::Metainfo;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Leeching BitTorrent client: downloads the content a metainfo file
/// describes into an output directory.
#[derive(Debug, Parser)]
#[command(name = "torrent-client", version, about)]
struct Args {
    /// Path to the .torrent metainfo file
    metainfo: PathBuf,
    /// Directory the downloaded files are placed in
    output: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    if !args.metainfo.exists() {
        bail!("no such file: {}", args.metainfo.display());
    }
    if args.metainfo.extension().and_then(|e| e.to_str()) != Some("torrent") {
        bail!("{} is not a .torrent file", args.metainfo.display());
    }
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("create output directory {}", args.output.display()))?;

    let metainfo = Metainfo::from_path(&args.metainfo)
        .with_context(|| format!("parse {}", args.metainfo.display()))?;
    info!(
        name = %metainfo.info.name,
        pieces = metainfo.piece_count(),
        "metainfo loaded"
    );

    let engine = Engine::new(metainfo, &args.output, EngineConfig::default());
    engine.run().await?;
    engine.assemble().context("assemble downloaded files")?;

    info!("download complete");
    Ok(())
}
