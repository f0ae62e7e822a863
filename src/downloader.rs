use futures::future::join_all;
use std::io;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::breakpoint::{BreakpointInfo, ContentLength};
use crate::chain::{DownloadChain, HttpChain, TaskHandle};
use crate::connection::HttpConnection;
use crate::context::DownloadContext;
use crate::error::{Error, Result};
use crate::gate::SplitGate;
use crate::hashing;
use crate::interceptor::{BreakpointInterceptor, ConnectInterceptor, FetchInterceptor};
use crate::output::MultiPointOutputStream;
use crate::task::DownloadTask;

/// Runs download tasks, one worker per block.
pub struct Downloader {
    context: Arc<DownloadContext>,
    connection: HttpConnection,
    interceptor: Arc<BreakpointInterceptor>,
}

impl Downloader {
    pub fn new(context: Arc<DownloadContext>) -> Result<Self> {
        let connection = HttpConnection::new(&context.config)?;
        let interceptor = Arc::new(BreakpointInterceptor::new(context.clone()));
        Ok(Self {
            context,
            connection,
            interceptor,
        })
    }

    /// Downloads `task`, resuming from its breakpoint when one is stored.
    /// Returns the number of bytes fetched in this run.
    #[instrument(skip_all, fields(task = %task.id, url = %task.url))]
    pub async fn download(&self, task: DownloadTask, cancel: CancellationToken) -> Result<u64> {
        self.context.dispatcher.task_start(&task);
        let result = self.run(&task, cancel).await;
        match &result {
            Ok(fetched) => info!(fetched, path = %task.path.display(), "download complete"),
            Err(e) if e.is_cancelled() => info!("download cancelled"),
            Err(e) => warn!(error = %e, "download failed"),
        }
        self.context.dispatcher.task_end(&task, result.as_ref().err());
        result
    }

    async fn run(&self, task: &DownloadTask, cancel: CancellationToken) -> Result<u64> {
        if let Some(parent) = task.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let (info, resumed) = self.load_info(task).await?;
        let info = Arc::new(Mutex::new(info));
        let gate = if resumed {
            SplitGate::released()
        } else {
            SplitGate::parked()
        };
        let output = MultiPointOutputStream::new(
            task.path.clone(),
            info.clone(),
            self.context.store.clone(),
        );
        let handle = Arc::new(TaskHandle {
            task: Arc::new(task.clone()),
            info: info.clone(),
            gate: Arc::new(gate),
            connection: self.connection.clone(),
            output: Arc::new(output),
            dispatcher: self.context.dispatcher.clone(),
            cancel: cancel.child_token(),
            progress_threshold: self.context.config.progress_threshold,
            checkpoint_threshold: self.context.config.checkpoint_threshold,
        });

        let mut workers = vec![];
        if resumed {
            let pending = {
                let info = info.lock().await;
                self.context.dispatcher.resume_from_breakpoint(task, &info);
                pending_blocks(&info, 0)
            };
            for index in pending {
                workers.push(self.spawn_block(&handle, index, false));
            }
        } else {
            workers.push(self.spawn_block(&handle, 0, true));
            // If block 0 fails before releasing, it cancels the task and we fall
            // through to collect its error.
            if handle.gate.wait(&handle.cancel).await.is_ok() {
                let pending = pending_blocks(&*info.lock().await, 1);
                for index in pending {
                    workers.push(self.spawn_block(&handle, index, false));
                }
            }
        }

        let mut fetched = 0;
        let mut failure: Option<Error> = None;
        for joined in join_all(workers).await {
            let result = joined
                .unwrap_or_else(|e| Err(Error::Io(io::Error::new(io::ErrorKind::Other, e))));
            match result {
                Ok(n) => fetched += n,
                Err(e) => {
                    // Keep the error that caused the cancellation, not the cancellations it caused.
                    let keep = failure.as_ref().map_or(false, |f| !f.is_cancelled());
                    if !keep {
                        failure = Some(e);
                    }
                }
            }
        }
        let outcome = match failure {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(Error::Cancelled),
            None => ensure_complete(&*info.lock().await),
        };
        if let Err(e) = outcome {
            self.keep_breakpoint(&handle, &e).await;
            return Err(e);
        }

        self.finish(task).await?;
        Ok(fetched)
    }

    /// Leaves the store in a state the next run can resume from.
    async fn keep_breakpoint(&self, handle: &TaskHandle, error: &Error) {
        if let Error::ResourceChanged { .. } = error {
            // The stored layout describes a body that no longer exists.
            if let Err(e) = self.context.store.remove(&handle.task.id).await {
                warn!(error = %e, "failed to drop stale breakpoint");
            }
            return;
        }
        // Before the layout is settled there is nothing worth resuming.
        if !handle.gate.is_released() || handle.info.lock().await.total_length.is_chunked() {
            return;
        }
        match handle.output.checkpoint().await {
            Ok(()) => debug!("progress kept for resume"),
            Err(e) => warn!(error = %e, "failed to keep progress"),
        }
    }

    async fn load_info(&self, task: &DownloadTask) -> Result<(BreakpointInfo, bool)> {
        if let Some(info) = self.context.store.get(&task.id).await? {
            let resumable = info.url == task.url
                && info.path == task.path
                && !info.total_length.is_chunked()
                && info.block_count() > 0
                && fs::try_exists(&task.path).await?;
            if resumable {
                info!(
                    blocks = info.block_count(),
                    done = info.total_offset(),
                    "resuming from breakpoint"
                );
                return Ok((info, true));
            }
            debug!("stored breakpoint isn't resumable, starting over");
        }

        Ok((
            BreakpointInfo::new(task.id.clone(), task.url.clone(), task.path.clone()),
            false,
        ))
    }

    fn spawn_block(
        &self,
        handle: &Arc<TaskHandle>,
        block_index: usize,
        negotiator: bool,
    ) -> JoinHandle<Result<u64>> {
        let interceptor = self.interceptor.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut chain = HttpChain::new(handle.clone(), block_index, negotiator);
            let result = run_block(&*interceptor, &mut chain).await;
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    warn!(block = block_index, error = %e, "block failed");
                }
                handle.cancel.cancel();
            }
            result
        })
    }

    async fn finish(&self, task: &DownloadTask) -> Result<()> {
        // Empty bodies never open the output file.
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&task.path)
            .await?;

        self.context.store.remove(&task.id).await?;

        if let Some(expected) = &task.expected_sha256 {
            let hash = hashing::verify_hash(&task.path, expected).await?;
            info!(sha256 = %hash, "hash verified");
        }
        Ok(())
    }
}

async fn run_block(
    interceptor: &BreakpointInterceptor,
    chain: &mut dyn DownloadChain,
) -> Result<u64> {
    interceptor.connect(chain).await?;
    interceptor.fetch(chain).await
}

/// Every block must be fully on disk, whatever the lenience rule let through.
fn ensure_complete(info: &BreakpointInfo) -> Result<()> {
    match info.total_length {
        ContentLength::Known(total) if !info.is_complete() => Err(Error::IntegrityMismatch {
            expected: total,
            actual: info.total_offset(),
        }),
        _ => Ok(()),
    }
}

fn pending_blocks(info: &BreakpointInfo, from: usize) -> Vec<usize> {
    info.blocks()
        .iter()
        .enumerate()
        .skip(from)
        .filter(|(_, block)| !block.is_complete())
        .map(|(index, _)| index)
        .collect()
}
