use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Length of a response body, or the marker for a chunked transfer whose
/// size isn't known up front.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentLength {
    Known(u64),
    Chunked,
}

impl ContentLength {
    pub fn known(self) -> Option<u64> {
        match self {
            ContentLength::Known(len) => Some(len),
            ContentLength::Chunked => None,
        }
    }

    pub fn is_chunked(self) -> bool {
        matches!(self, ContentLength::Chunked)
    }
}

impl From<Option<u64>> for ContentLength {
    fn from(len: Option<u64>) -> Self {
        len.map_or(ContentLength::Chunked, ContentLength::Known)
    }
}

/// One contiguous range of the target file, `[start_offset, start_offset + content_length)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub start_offset: u64,
    pub content_length: u64,
    /// Bytes of this block already on disk. This is where a resumed fetch picks up.
    pub current_offset: u64,
}

impl BlockInfo {
    pub fn new(start_offset: u64, content_length: u64) -> Self {
        Self {
            start_offset,
            content_length,
            current_offset: 0,
        }
    }

    /// Exclusive end of the range.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.content_length
    }

    /// Absolute file offset the next byte of this block lands on.
    pub fn write_offset(&self) -> u64 {
        self.start_offset + self.current_offset
    }

    pub fn remaining(&self) -> u64 {
        self.content_length.saturating_sub(self.current_offset)
    }

    pub fn is_complete(&self) -> bool {
        self.current_offset >= self.content_length
    }
}

/// Resumable state of one download task.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakpointInfo {
    pub id: String,
    pub url: Url,
    pub path: PathBuf,
    pub total_length: ContentLength,
    blocks: Vec<BlockInfo>,
    /// Validator of the body the blocks were cut from.
    #[serde(default)]
    pub etag: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BreakpointInfo {
    pub fn new(id: impl Into<String>, url: Url, path: PathBuf) -> Self {
        Self {
            id: id.into(),
            url,
            path,
            total_length: ContentLength::Chunked,
            blocks: vec![BlockInfo::new(0, 0)],
            etag: None,
            updated_at: None,
        }
    }

    pub fn block(&self, index: usize) -> Option<&BlockInfo> {
        self.blocks.get(index)
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut BlockInfo> {
        self.blocks.get_mut(index)
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn reset_blocks(&mut self) {
        self.blocks.clear();
    }

    pub fn add_block(&mut self, block: BlockInfo) {
        self.blocks.push(block);
    }

    pub fn is_single_block(&self) -> bool {
        self.blocks.len() <= 1
    }

    /// Bytes already on disk across all blocks.
    pub fn total_offset(&self) -> u64 {
        self.blocks.iter().map(|b| b.current_offset).sum()
    }

    pub fn is_complete(&self) -> bool {
        match self.total_length {
            ContentLength::Known(_) => self.blocks.iter().all(BlockInfo::is_complete),
            ContentLength::Chunked => false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}
