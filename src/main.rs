mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use rangedl::DownloadConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::cli::VerifyMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to download
    #[arg(index = 1, required_unless_present = "list")]
    url: Option<String>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Directory holding breakpoints of unfinished downloads
    #[arg(long = "state-dir", default_value = ".rangedl")]
    state_dir: PathBuf,

    /// Maximum number of blocks (parallel connections) per file
    #[arg(short = 's', long, default_value_t = 5)]
    split: usize,

    /// Smallest block worth its own connection, in bytes
    #[arg(long = "min-block-size", default_value_t = 256 * 1024)]
    min_block_size: u64,

    /// Expected SHA-256 of the file
    #[arg(long)]
    sha256: Option<String>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,

    /// List unfinished downloads and their progress
    #[arg(short = 'l', long)]
    list: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr next to the progress bar; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rangedl=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DownloadConfig {
        max_blocks: args.split,
        min_block_size: args.min_block_size,
        ..DownloadConfig::default()
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.list {
            return crate::commands::list_downloads(args.state_dir).await;
        }

        match args.url {
            Some(url) => {
                crate::commands::run_single_download(
                    url,
                    args.download_dir,
                    args.state_dir,
                    config,
                    args.verify_hash,
                    args.sha256,
                )
                .await
            }
            None => Ok(()),
        }
    })
}
