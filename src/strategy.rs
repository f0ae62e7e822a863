//! Policy for how a task is cut into blocks.

use crate::breakpoint::ContentLength;
use crate::config::DownloadConfig;
use crate::connection::Connected;
use crate::task::DownloadTask;

const ONE_CONNECTION_UPPER_LIMIT: u64 = 1024 * 1024;
const TWO_CONNECTION_UPPER_LIMIT: u64 = 5 * 1024 * 1024;
const THREE_CONNECTION_UPPER_LIMIT: u64 = 50 * 1024 * 1024;
const FOUR_CONNECTION_UPPER_LIMIT: u64 = 100 * 1024 * 1024;

pub trait DownloadStrategy: Send + Sync {
    /// Whether the negotiated response can be fetched as several ranges.
    fn is_split_block(&self, content_length: ContentLength, connected: &Connected) -> bool;

    /// How many blocks to use. Anything below 1 is rejected by the caller.
    fn determine_block_count(
        &self,
        task: &DownloadTask,
        content_length: u64,
        connected: &Connected,
    ) -> usize;
}

/// Decides when the negotiating block 0 may stop reading before the strict
/// length check: it fetches the whole file but only owns its own range.
pub trait LenienceRule: Send + Sync {
    fn is_met(&self, fetched: u64, block_length: u64) -> bool;
}

/// Met once block 0 is within `slack` bytes of its nominal end.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReachedBlockEnd {
    pub slack: u64,
}

impl LenienceRule for ReachedBlockEnd {
    fn is_met(&self, fetched: u64, block_length: u64) -> bool {
        fetched.saturating_add(self.slack) >= block_length
    }
}

#[derive(Debug, Clone)]
pub struct DefaultDownloadStrategy {
    max_blocks: usize,
    min_block_size: u64,
}

impl DefaultDownloadStrategy {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            max_blocks: config.max_blocks,
            min_block_size: config.min_block_size,
        }
    }
}

impl Default for DefaultDownloadStrategy {
    fn default() -> Self {
        Self::new(&DownloadConfig::default())
    }
}

impl DownloadStrategy for DefaultDownloadStrategy {
    fn is_split_block(&self, content_length: ContentLength, connected: &Connected) -> bool {
        match content_length {
            ContentLength::Known(len) => len > 0 && connected.accept_ranges,
            ContentLength::Chunked => false,
        }
    }

    fn determine_block_count(
        &self,
        _task: &DownloadTask,
        content_length: u64,
        _connected: &Connected,
    ) -> usize {
        let by_size = if content_length < ONE_CONNECTION_UPPER_LIMIT {
            1
        } else if content_length < TWO_CONNECTION_UPPER_LIMIT {
            2
        } else if content_length < THREE_CONNECTION_UPPER_LIMIT {
            3
        } else if content_length < FOUR_CONNECTION_UPPER_LIMIT {
            4
        } else {
            5
        };

        let by_block_size = match self.min_block_size {
            0 => by_size,
            min => usize::try_from(content_length / min).unwrap_or(usize::MAX),
        };

        by_size.min(self.max_blocks).min(by_block_size).max(1)
    }
}
