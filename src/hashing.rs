use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::error::{Error, Result};

pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Checks the file against `expected`; a mismatching file is removed.
pub async fn verify_hash(filepath: &Path, expected: &str) -> Result<String> {
    let computed = calculate_hash(filepath).await?;
    if !expected.eq_ignore_ascii_case(&computed) {
        if let Err(e) = fs::remove_file(filepath).await {
            warn!(path = %filepath.display(), error = %e, "failed to remove file with bad hash");
        }
        return Err(Error::HashMismatch {
            expected: expected.to_string(),
            actual: computed,
        });
    }
    Ok(computed)
}
