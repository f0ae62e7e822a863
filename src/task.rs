use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use url::Url;

use crate::utils::{get_filename_from_url, sanitize_filename};

/// A single file to fetch.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Stable across runs so an interrupted download finds its breakpoint again.
    pub id: String,
    pub url: Url,
    pub path: PathBuf,
    pub expected_sha256: Option<String>,
}

impl DownloadTask {
    pub fn new(url: Url, path: PathBuf) -> Self {
        Self {
            id: task_id(&url, &path),
            url,
            path,
            expected_sha256: None,
        }
    }

    /// Task saving into `dir` under the name the URL suggests.
    pub fn in_dir(url: Url, dir: &Path) -> Self {
        let filename = sanitize_filename(&get_filename_from_url(&url));
        let path = dir.join(filename);
        Self::new(url, path)
    }

    pub fn with_sha256(mut self, hash: Option<String>) -> Self {
        self.expected_sha256 = hash;
        self
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

fn task_id(url: &Url, path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
