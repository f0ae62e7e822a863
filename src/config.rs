use serde::Deserialize;
use std::time::Duration;

/// Knobs for one downloader instance.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    /// Upper bound on blocks per task.
    pub max_blocks: usize,
    /// Blocks smaller than this aren't worth a connection of their own.
    pub min_block_size: u64,
    /// Bytes block 0 may fall short of its nominal length and still count as done.
    pub lenience_slack: u64,
    /// Bytes buffered per block before a progress callback fires.
    pub progress_threshold: u64,
    /// Bytes a block writes between two persisted checkpoints.
    pub checkpoint_threshold: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_blocks: 5,
            min_block_size: 256 * 1024,
            lenience_slack: 0,
            progress_threshold: 64 * 1024,
            checkpoint_threshold: 1024 * 1024,
            user_agent: format!("rangedl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 10,
        }
    }
}

impl DownloadConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
