use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use url::Url;

use rangedl::dispatcher::{CallbackDispatcher, DownloadListener};
use rangedl::store::JsonFileStore;
use rangedl::{
    BreakpointInfo, ContentLength, DownloadConfig, DownloadContext, DownloadTask, Downloader,
    Error,
};

use crate::cli::VerifyMode;

/// Drives one indicatif bar from the task's callbacks.
struct ProgressListener {
    pb: Mutex<Option<ProgressBar>>,
}

impl ProgressListener {
    fn new() -> Self {
        Self { pb: Mutex::new(None) }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Some(pb) = self.pb.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            f(pb);
        }
    }

    fn set_layout(&self, info: &BreakpointInfo) {
        self.with_bar(|pb| {
            if let ContentLength::Known(total) = info.total_length {
                pb.set_length(total);
            }
            pb.set_position(info.total_offset());
            pb.set_message(format!("{} ({} blocks)", filename(info), info.block_count()));
        });
    }
}

fn filename(info: &BreakpointInfo) -> String {
    info.path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| info.id.clone())
}

impl DownloadListener for ProgressListener {
    fn task_start(&self, task: &DownloadTask) {
        let pb = ProgressBar::new(0);
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_message(format!("Connecting {}", task.filename()));
        *self.pb.lock().unwrap_or_else(|p| p.into_inner()) = Some(pb);
    }

    fn resume_from_breakpoint(&self, _task: &DownloadTask, info: &BreakpointInfo) {
        self.set_layout(info);
    }

    fn split_block_end(&self, _task: &DownloadTask, info: &BreakpointInfo) {
        self.set_layout(info);
    }

    fn fetch_progress(&self, _task: &DownloadTask, _block_index: usize, bytes: u64) {
        self.with_bar(|pb| pb.inc(bytes));
    }

    fn task_end(&self, task: &DownloadTask, error: Option<&Error>) {
        self.with_bar(|pb| match error {
            None => pb.finish_with_message(format!("Completed   {}", task.filename())),
            Some(e) if e.is_cancelled() => {
                pb.abandon_with_message(format!("Paused      {}", task.filename()))
            }
            Some(e) => pb.abandon_with_message(format!("Failed      {}: {}", task.filename(), e)),
        });
    }
}

pub async fn run_single_download(
    url: String,
    output: PathBuf,
    state_dir: PathBuf,
    config: DownloadConfig,
    verify_mode: VerifyMode,
    sha256: Option<String>,
) -> Result<()> {
    let url = Url::parse(&url).context(format!("Invalid URL: {}", url))?;
    if !output.exists() {
        fs::create_dir_all(&output)
            .await
            .context("Failed to create output directory")?;
    }

    let expected = match verify_mode {
        VerifyMode::Off => None,
        VerifyMode::On if sha256.is_none() => bail!("--verify-hash on requires --sha256"),
        _ => sha256,
    };
    let task = DownloadTask::in_dir(url, &output).with_sha256(expected);

    let context = DownloadContext::builder(config)
        .store(Arc::new(JsonFileStore::new(state_dir)))
        .dispatcher(CallbackDispatcher::new().with_listener(Arc::new(ProgressListener::new())))
        .build();
    let downloader = Downloader::new(Arc::new(context)).context("Failed to set up downloader")?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    match downloader.download(task.clone(), cancel).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_cancelled() => {
            println!("Interrupted, run the same command again to resume {}", task.filename());
            Ok(())
        }
        Err(e) => Err(e).context(format!("Failed to download {}", task.url)),
    }
}

pub async fn list_downloads(state_dir: PathBuf) -> Result<()> {
    let store = JsonFileStore::new(&state_dir);
    let infos = store
        .list()
        .await
        .context(format!("Failed to read state directory {:?}", state_dir))?;

    if infos.is_empty() {
        println!("No unfinished downloads in '{:?}'.", state_dir);
        return Ok(());
    }

    println!("{:<50} {:<10} {:<15} {:<15}", "Filename", "Blocks", "Progress", "Size");
    println!("{:-<50} {:-<10} {:-<15} {:-<15}", "", "", "", "");

    for info in &infos {
        let downloaded = info.total_offset();
        let (progress, size) = match info.total_length {
            ContentLength::Known(total) if total > 0 => (
                format!("{:.2}%", (downloaded as f64 / total as f64) * 100.0),
                format!("{}", HumanBytes(total)),
            ),
            ContentLength::Known(_) => ("100.00%".to_string(), format!("{}", HumanBytes(0))),
            ContentLength::Chunked => (format!("{}", HumanBytes(downloaded)), "unknown".to_string()),
        };
        println!(
            "{:<50} {:<10} {:<15} {:<15}",
            filename(info),
            info.block_count(),
            progress,
            size
        );
    }

    Ok(())
}
