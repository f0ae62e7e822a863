use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tracing::info;

use crate::error::Result;

/// What to do with a file already sitting at a fresh task's target path.
#[async_trait]
pub trait ProcessFileStrategy: Send + Sync {
    async fn discard_old_file(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFileStrategy;

#[async_trait]
impl ProcessFileStrategy for DefaultFileStrategy {
    async fn discard_old_file(&self, path: &Path) -> Result<()> {
        if fs::try_exists(path).await? {
            info!(path = %path.display(), "discarding stale file");
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discard_removes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.bin");
        std::fs::write(&path, b"stale").unwrap();

        DefaultFileStrategy.discard_old_file(&path).await.unwrap();
        assert!(!path.exists());

        // Nothing to do the second time.
        DefaultFileStrategy.discard_old_file(&path).await.unwrap();
    }
}
