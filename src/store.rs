//! Durable breakpoint state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breakpoint::BreakpointInfo;
use crate::error::Result;

#[async_trait]
pub trait BreakpointStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<BreakpointInfo>>;

    /// Persist `info`. Returns `false` if it couldn't be written.
    async fn update(&self, info: &BreakpointInfo) -> bool;

    async fn remove(&self, id: &str) -> Result<()>;
}

/// One `<id>.json` per task inside `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, info: &BreakpointInfo) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&info.id);
        // Blocks checkpoint concurrently, so each write stages in its own file.
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", info.id, Uuid::new_v4().simple()));
        let content = serde_json::to_string(info)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Every breakpoint currently in the store, skipping unreadable files.
    pub async fn list(&self) -> Result<Vec<BreakpointInfo>> {
        let mut infos = vec![];
        if !self.dir.exists() {
            return Ok(infos);
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<BreakpointInfo>(&content) {
                Ok(info) => infos.push(info),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable breakpoint"),
            }
        }
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }
}

#[async_trait]
impl BreakpointStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<BreakpointInfo>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                // A torn or foreign file is no use for resuming; start over.
                warn!(path = %path.display(), error = %e, "discarding corrupt breakpoint");
                Ok(None)
            }
        }
    }

    async fn update(&self, info: &BreakpointInfo) -> bool {
        match self.write(info).await {
            Ok(()) => {
                debug!(id = %info.id, "breakpoint stored");
                true
            }
            Err(e) => {
                warn!(id = %info.id, error = %e, "failed to store breakpoint");
                false
            }
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// In-process store. Can be told to reject updates.
#[derive(Debug, Default)]
pub struct MemoryStore {
    infos: Mutex<HashMap<String, BreakpointInfo>>,
    fail_updates: AtomicBool,
    updates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Number of successful updates so far.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, id: &str) -> Option<BreakpointInfo> {
        self.infos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl BreakpointStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<BreakpointInfo>> {
        Ok(self.snapshot(id))
    }

    async fn update(&self, info: &BreakpointInfo) -> bool {
        if self.fail_updates.load(Ordering::SeqCst) {
            return false;
        }
        self.infos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(info.id.clone(), info.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.infos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        Ok(())
    }
}
