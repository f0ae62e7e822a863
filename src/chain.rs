//! Per-(task, block) execution handle the interceptor works through.

use async_trait::async_trait;
use reqwest::Response;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::breakpoint::{BlockInfo, BreakpointInfo, ContentLength};
use crate::connection::{range_header, Connected, HttpConnection};
use crate::dispatcher::CallbackDispatcher;
use crate::error::{Error, Result};
use crate::gate::SplitGate;
use crate::output::{BlockOutput, MultiPointOutputStream};
use crate::task::DownloadTask;

pub type SharedInfo = Arc<Mutex<BreakpointInfo>>;

#[async_trait]
pub trait DownloadChain: Send {
    fn task(&self) -> &DownloadTask;

    fn block_index(&self) -> usize;

    fn info(&self) -> &SharedInfo;

    /// Opens the connection for this block.
    async fn process_connect(&mut self) -> Result<Connected>;

    /// Length of the body behind the current connection.
    fn response_content_length(&self) -> ContentLength;

    fn is_interrupted(&self) -> bool;

    /// True when this chain negotiates the layout while the other blocks are parked.
    fn is_other_block_park(&self) -> bool;

    fn unpark_other_block(&self);

    /// Reads and stores the next chunk. `None` once the body is exhausted.
    async fn loop_fetch(&mut self) -> Result<Option<u64>>;

    /// Reports bytes fetched but not yet passed to the listeners.
    fn flush_no_callback_increase_bytes(&mut self);

    fn output_stream(&self) -> Arc<dyn BlockOutput>;
}

/// Everything the blocks of one task share.
pub struct TaskHandle {
    pub task: Arc<DownloadTask>,
    pub info: SharedInfo,
    pub gate: Arc<SplitGate>,
    pub connection: HttpConnection,
    pub output: Arc<MultiPointOutputStream>,
    pub dispatcher: CallbackDispatcher,
    pub cancel: CancellationToken,
    pub progress_threshold: u64,
    pub checkpoint_threshold: u64,
}

pub struct HttpChain {
    handle: Arc<TaskHandle>,
    block_index: usize,
    negotiator: bool,
    response: Option<Response>,
    response_length: ContentLength,
    pending_bytes: u64,
    unsaved_bytes: u64,
}

impl HttpChain {
    pub fn new(handle: Arc<TaskHandle>, block_index: usize, negotiator: bool) -> Self {
        Self {
            handle,
            block_index,
            negotiator,
            response: None,
            response_length: ContentLength::Chunked,
            pending_bytes: 0,
            unsaved_bytes: 0,
        }
    }

    async fn block_range(&self) -> Result<Option<(u64, u64)>> {
        let info = self.handle.info.lock().await;
        let block = info
            .block(self.block_index)
            .ok_or(Error::MissingBlock(self.block_index))?;
        Ok(match info.total_length {
            ContentLength::Known(_) => Some((block.write_offset(), block.end_offset())),
            ContentLength::Chunked => None,
        })
    }
}

#[async_trait]
impl DownloadChain for HttpChain {
    fn task(&self) -> &DownloadTask {
        &self.handle.task
    }

    fn block_index(&self) -> usize {
        self.block_index
    }

    fn info(&self) -> &SharedInfo {
        &self.handle.info
    }

    async fn process_connect(&mut self) -> Result<Connected> {
        let url = &self.handle.task.url;

        if self.negotiator {
            let response = self
                .handle
                .connection
                .open(url, Some(range_header(0, None)))
                .await?;
            let connected = Connected::from_response(&response);
            debug!(
                status = connected.status,
                length = ?connected.content_length,
                accept_ranges = connected.accept_ranges,
                "negotiated"
            );

            // Start from one block spanning the whole body; splitting is up to the interceptor.
            let mut info = self.handle.info.lock().await;
            info.total_length = connected.content_length;
            info.etag = connected.etag.clone();
            info.reset_blocks();
            info.add_block(BlockInfo::new(0, connected.content_length.known().unwrap_or(0)));
            drop(info);

            self.response_length = connected.content_length;
            self.response = Some(response);
            return Ok(connected);
        }

        self.handle.gate.wait(&self.handle.cancel).await?;

        let range = self.block_range().await?;
        let response = self
            .handle
            .connection
            .open(url, range.map(|(start, end)| range_header(start, Some(end - 1))))
            .await?;
        let connected = Connected::from_response(&response);
        if let Some((start, _)) = range {
            // A server ignoring the range would hand us the file from byte 0.
            if start > 0 && !connected.is_partial() {
                return Err(Error::UnexpectedStatus(connected.status));
            }
        }
        let stored_etag = self.handle.info.lock().await.etag.clone();
        if let (Some(expected), Some(actual)) = (stored_etag, connected.etag.as_ref()) {
            if &expected != actual {
                return Err(Error::ResourceChanged {
                    expected,
                    actual: actual.clone(),
                });
            }
        }
        debug!(range = ?range, length = ?connected.content_length, "connected");
        self.response_length = connected.content_length;
        self.response = Some(response);
        Ok(connected)
    }

    fn response_content_length(&self) -> ContentLength {
        self.response_length
    }

    fn is_interrupted(&self) -> bool {
        self.handle.cancel.is_cancelled()
    }

    fn is_other_block_park(&self) -> bool {
        self.negotiator && !self.handle.gate.is_released()
    }

    fn unpark_other_block(&self) {
        self.handle.gate.release();
    }

    async fn loop_fetch(&mut self) -> Result<Option<u64>> {
        if self.handle.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(response) = self.response.as_mut() else {
            return Ok(None);
        };

        let chunk = tokio::select! {
            chunk = response.chunk() => chunk?,
            _ = self.handle.cancel.cancelled() => return Err(Error::Cancelled),
        };
        let Some(bytes) = chunk else {
            self.response = None;
            return Ok(None);
        };

        let written = self.handle.output.write(self.block_index, &bytes).await?;
        self.pending_bytes += written;
        if self.pending_bytes >= self.handle.progress_threshold {
            self.flush_no_callback_increase_bytes();
        }
        self.unsaved_bytes += written;
        if self.unsaved_bytes >= self.handle.checkpoint_threshold {
            self.handle.output.checkpoint().await?;
            self.unsaved_bytes = 0;
        }
        Ok(Some(written))
    }

    fn flush_no_callback_increase_bytes(&mut self) {
        if self.pending_bytes > 0 {
            self.handle
                .dispatcher
                .fetch_progress(&self.handle.task, self.block_index, self.pending_bytes);
            self.pending_bytes = 0;
        }
    }

    fn output_stream(&self) -> Arc<dyn BlockOutput> {
        self.handle.output.clone()
    }
}
