//! Connect and fetch phases of a resumable block download.
//!
//! On connect, the first block negotiates the response, settles how the task
//! is cut into blocks, persists that layout and releases the parked blocks.
//! On fetch, each block reads its body to the end and is then checked against
//! both the expected length and what actually landed on disk.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::breakpoint::{BlockInfo, BreakpointInfo, ContentLength};
use crate::chain::DownloadChain;
use crate::connection::Connected;
use crate::context::DownloadContext;
use crate::error::{Error, Result};

#[async_trait]
pub trait ConnectInterceptor: Send + Sync {
    async fn connect(&self, chain: &mut dyn DownloadChain) -> Result<Connected>;
}

#[async_trait]
pub trait FetchInterceptor: Send + Sync {
    /// Returns the number of bytes fetched for the chain's block.
    async fn fetch(&self, chain: &mut dyn DownloadChain) -> Result<u64>;
}

pub struct BreakpointInterceptor {
    context: Arc<DownloadContext>,
}

impl BreakpointInterceptor {
    pub fn new(context: Arc<DownloadContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ConnectInterceptor for BreakpointInterceptor {
    #[instrument(skip_all, fields(task = %chain.task().id, block = chain.block_index()))]
    async fn connect(&self, chain: &mut dyn DownloadChain) -> Result<Connected> {
        let connected = chain.process_connect().await?;

        if chain.is_interrupted() {
            return Err(Error::Cancelled);
        }

        if chain.is_other_block_park() {
            // Only the first block may decide the layout.
            let block_index = chain.block_index();
            if block_index != 0 {
                return Err(Error::ProtocolViolation { block_index });
            }

            self.context
                .file_strategy
                .discard_old_file(&chain.task().path)
                .await?;

            let content_length = chain.response_content_length();
            if self.context.strategy.is_split_block(content_length, &connected) {
                // A chunked body has no ranges to cut, whatever the strategy says.
                if let ContentLength::Known(total_length) = content_length {
                    let block_count = self.context.strategy.determine_block_count(
                        chain.task(),
                        total_length,
                        &connected,
                    );
                    let mut info = chain.info().lock().await;
                    split_block(block_count, total_length, &mut info)?;
                    info!(block_count, total_length, "split into blocks");
                } else {
                    debug!("strategy asked to split a chunked body, keeping one block");
                }
            }

            {
                let info = chain.info().lock().await;
                self.context.dispatcher.split_block_end(chain.task(), &info);
            }

            chain.unpark_other_block();
        }

        let snapshot = {
            let mut info = chain.info().lock().await;
            info.touch();
            info.clone()
        };
        if !self.context.store.update(&snapshot).await {
            return Err(Error::PersistenceFailure { id: snapshot.id });
        }

        Ok(connected)
    }
}

#[async_trait]
impl FetchInterceptor for BreakpointInterceptor {
    #[instrument(skip_all, fields(task = %chain.task().id, block = chain.block_index()))]
    async fn fetch(&self, chain: &mut dyn DownloadChain) -> Result<u64> {
        let content_length = chain.response_content_length();
        let block_index = chain.block_index();
        let (block_length, range_left, is_multi_block) = {
            let info = chain.info().lock().await;
            let block = info
                .block(block_index)
                .ok_or(Error::MissingBlock(block_index))?;
            (block.content_length, block.current_offset, !info.is_single_block())
        };
        let is_not_chunked = !content_length.is_chunked();

        let mut fetch_length = 0u64;
        let mut first_block_lenience = false;
        while let Some(fetched) = chain.loop_fetch().await? {
            fetch_length += fetched;
            if is_not_chunked
                && is_multi_block
                && block_index == 0
                && self
                    .context
                    .lenience
                    .is_met(range_left + fetch_length, block_length)
            {
                first_block_lenience = true;
                break;
            }
        }

        chain.flush_no_callback_increase_bytes();
        let output = chain.output_stream();
        output.ensure_sync_complete(block_index).await?;

        if let ContentLength::Known(expected) = content_length {
            if !first_block_lenience {
                output.inspect_complete(block_index).await?;

                if fetch_length != expected {
                    return Err(Error::IntegrityMismatch {
                        expected,
                        actual: fetch_length,
                    });
                }
            }
        }

        debug!(fetch_length, first_block_lenience, "block fetched");
        Ok(fetch_length)
    }
}

/// Replaces the layout of `info` with `block_count` blocks covering
/// `total_length`; the last block takes the division remainder. Leaves `info`
/// untouched when `block_count` is 0.
pub fn split_block(block_count: usize, total_length: u64, info: &mut BreakpointInfo) -> Result<()> {
    if block_count < 1 {
        return Err(Error::InvalidBlockCount(block_count));
    }

    info.reset_blocks();
    let count = block_count as u64;
    let each_length = total_length / count;
    for i in 0..count {
        let start_offset = i * each_length;
        let content_length = if i == count - 1 {
            each_length + total_length % count
        } else {
            each_length
        };
        info.add_block(BlockInfo::new(start_offset, content_length));
    }
    Ok(())
}
