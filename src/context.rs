use std::path::{Path, PathBuf};

use crate::error::ReviewError;

/// Largest source file accepted for review.
pub const MAX_SOURCE_BYTES: usize = 2 * 1024 * 1024;

/// Resolve `path` against `working_directory` when it is relative.
pub fn resolve_path(path: &str, working_directory: Option<&Path>) -> PathBuf {
    let p = Path::new(path);
    match working_directory {
        Some(base) if p.is_relative() => base.join(p),
        _ => p.to_path_buf(),
    }
}

/// Read the file a review was requested for.
///
/// Rejects non-files, files over `max_bytes`, and content that is not UTF-8.
pub async fn read_source_file(path: &Path, max_bytes: usize) -> Result<String, ReviewError> {
    let display = path.display();
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ReviewError::FileContext(format!("{display}: {e}")))?;

    if !meta.is_file() {
        return Err(ReviewError::FileContext(format!("{display} is not a file")));
    }
    if meta.len() > max_bytes as u64 {
        return Err(ReviewError::FileContext(format!(
            "{display} is {} bytes (max {max_bytes})",
            meta.len()
        )));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ReviewError::FileContext(format!("{display}: {e}")))?;
    // Re-check: the file may have grown between stat and read.
    if bytes.len() > max_bytes {
        return Err(ReviewError::FileContext(format!(
            "{display} exceeds {max_bytes} bytes"
        )));
    }
    String::from_utf8(bytes)
        .map_err(|_| ReviewError::FileContext(format!("{display} is not valid UTF-8")))
}

/// Validate working directory exists, is a directory, and canonicalize it.
pub async fn validate_working_directory(path: &str) -> Result<PathBuf, ReviewError> {
    let canonical = tokio::fs::canonicalize(path).await.map_err(|e| {
        ReviewError::FileContext(format!("working directory not found: {path}: {e}"))
    })?;

    let meta = tokio::fs::metadata(&canonical).await.map_err(|e| {
        ReviewError::FileContext(format!("cannot stat working directory: {path}: {e}"))
    })?;

    if !meta.is_dir() {
        return Err(ReviewError::FileContext(format!("{path} is not a directory")));
    }

    Ok(canonical)
}
