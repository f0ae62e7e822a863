//! Shared writer for all blocks of a task.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

use crate::breakpoint::{BreakpointInfo, ContentLength};
use crate::error::{Error, Result};
use crate::store::BreakpointStore;

/// The two checks the fetch phase runs against what landed on disk.
#[async_trait]
pub trait BlockOutput: Send + Sync {
    /// Returns once everything written for `block_index` is flushed, synced
    /// and its progress persisted.
    async fn ensure_sync_complete(&self, block_index: usize) -> Result<()>;

    /// Fails with [`Error::IntegrityMismatch`] if the block isn't fully on disk.
    async fn inspect_complete(&self, block_index: usize) -> Result<()>;
}

pub struct MultiPointOutputStream {
    path: PathBuf,
    info: Arc<Mutex<BreakpointInfo>>,
    store: Arc<dyn BreakpointStore>,
    file: Mutex<Option<File>>,
}

impl MultiPointOutputStream {
    pub fn new(
        path: PathBuf,
        info: Arc<Mutex<BreakpointInfo>>,
        store: Arc<dyn BreakpointStore>,
    ) -> Self {
        Self {
            path,
            info,
            store,
            file: Mutex::new(None),
        }
    }

    /// Writes `bytes` at the block's current position and advances it.
    /// With a known length, anything past the block's end is dropped; the
    /// number of bytes actually kept is returned.
    pub async fn write(&self, block_index: usize, bytes: &[u8]) -> Result<u64> {
        let (offset, len) = {
            let info = self.info.lock().await;
            let block = info
                .block(block_index)
                .ok_or(Error::MissingBlock(block_index))?;
            let len = match info.total_length {
                ContentLength::Known(_) => block.remaining().min(bytes.len() as u64),
                ContentLength::Chunked => bytes.len() as u64,
            };
            (block.write_offset(), len)
        };
        if len == 0 {
            return Ok(0);
        }

        {
            let mut guard = self.file.lock().await;
            // Opened on first write, after any stale file was discarded.
            if guard.is_none() {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&self.path)
                    .await?;
                *guard = Some(file);
            }
            if let Some(file) = guard.as_mut() {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&bytes[..len as usize]).await?;
            }
        }

        let mut info = self.info.lock().await;
        if let Some(block) = info.block_mut(block_index) {
            block.current_offset += len;
        }
        trace!(block = block_index, offset, len, "wrote chunk");
        Ok(len)
    }

    /// Syncs the file and persists every block's offset as of now.
    pub async fn checkpoint(&self) -> Result<()> {
        // Offsets advance only after their bytes reach the file, so a sync
        // after the snapshot covers everything it records.
        let snapshot = {
            let mut info = self.info.lock().await;
            info.touch();
            info.clone()
        };
        {
            let mut guard = self.file.lock().await;
            if let Some(file) = guard.as_mut() {
                file.flush().await?;
                file.sync_data().await?;
            }
        }

        if !self.store.update(&snapshot).await {
            return Err(Error::PersistenceFailure { id: snapshot.id });
        }
        trace!(done = snapshot.total_offset(), "checkpoint");
        Ok(())
    }
}

#[async_trait]
impl BlockOutput for MultiPointOutputStream {
    async fn ensure_sync_complete(&self, block_index: usize) -> Result<()> {
        self.checkpoint().await?;
        trace!(block = block_index, "synced");
        Ok(())
    }

    async fn inspect_complete(&self, block_index: usize) -> Result<()> {
        let (block, total_length) = {
            let info = self.info.lock().await;
            let block = info
                .block(block_index)
                .cloned()
                .ok_or(Error::MissingBlock(block_index))?;
            (block, info.total_length)
        };
        if total_length.is_chunked() || block.content_length == 0 {
            return Ok(());
        }

        if block.current_offset != block.content_length {
            return Err(Error::IntegrityMismatch {
                expected: block.content_length,
                actual: block.current_offset,
            });
        }

        let on_disk = fs::metadata(&self.path).await?.len();
        if on_disk < block.end_offset() {
            return Err(Error::IntegrityMismatch {
                expected: block.end_offset(),
                actual: on_disk,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::BlockInfo;
    use crate::store::MemoryStore;
    use url::Url;

    fn setup(path: PathBuf) -> (MultiPointOutputStream, Arc<Mutex<BreakpointInfo>>, Arc<MemoryStore>) {
        let mut info = BreakpointInfo::new(
            "out",
            Url::parse("https://example.com/f").unwrap(),
            path.clone(),
        );
        info.total_length = ContentLength::Known(10);
        info.reset_blocks();
        info.add_block(BlockInfo::new(0, 4));
        info.add_block(BlockInfo::new(4, 6));
        let info = Arc::new(Mutex::new(info));
        let store = Arc::new(MemoryStore::new());
        let output = MultiPointOutputStream::new(path, info.clone(), store.clone());
        (output, info, store)
    }

    #[tokio::test]
    async fn test_blocks_write_to_their_own_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let (output, info, store) = setup(path.clone());

        assert_eq!(output.write(1, b"efg").await.unwrap(), 3);
        assert_eq!(output.write(0, b"abcd").await.unwrap(), 4);
        // Overshoot past block 1's end is clamped.
        assert_eq!(output.write(1, b"hijXYZ").await.unwrap(), 3);
        assert_eq!(output.write(1, b"more").await.unwrap(), 0);

        output.ensure_sync_complete(1).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefghij");
        assert_eq!(info.lock().await.total_offset(), 10);

        let persisted = store.snapshot("out").unwrap();
        assert_eq!(persisted.block(1).unwrap().current_offset, 6);

        output.inspect_complete(0).await.unwrap();
        output.inspect_complete(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_inspect_detects_short_block() {
        let dir = tempfile::tempdir().unwrap();
        let (output, _info, _store) = setup(dir.path().join("f.bin"));

        output.write(1, b"ef").await.unwrap();
        let err = output.inspect_complete(1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityMismatch {
                expected: 6,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_inspect_detects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let (output, _info, _store) = setup(path.clone());

        output.write(1, b"efghij").await.unwrap();
        output.ensure_sync_complete(1).await.unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(7)
            .unwrap();

        let err = output.inspect_complete(1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityMismatch {
                expected: 10,
                actual: 7
            }
        ));
    }

    #[tokio::test]
    async fn test_sync_reports_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (output, _info, store) = setup(dir.path().join("f.bin"));
        store.set_fail_updates(true);

        let err = output.ensure_sync_complete(0).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure { .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_persists_partial_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let (output, _info, store) = setup(path.clone());

        output.write(1, b"ef").await.unwrap();
        output.checkpoint().await.unwrap();

        let persisted = store.snapshot("out").unwrap();
        assert_eq!(persisted.block(0).unwrap().current_offset, 0);
        assert_eq!(persisted.block(1).unwrap().current_offset, 2);
        assert!(persisted.updated_at.is_some());
        assert_eq!(&std::fs::read(&path).unwrap()[4..6], b"ef");
    }
}
