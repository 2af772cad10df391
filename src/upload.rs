//! Upload storage for structure files.
//!
//! Uploads are written under the upload directory with generated names;
//! the client-supplied name is only sanitised for logging. Each stored
//! file is owned by a [`StoredArtifact`] guard that deletes it on drop.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Accepted structure-file suffixes, matched case-insensitively.
pub const VALID_EXTENSIONS: &[&str] = &[".cif", ".cssr", ".v1", ".arc", ".cif.gz", ".cssr.gz"];

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("invalid file format. Supported: .cif, .cssr, .v1, .arc (optionally .gz)")]
    InvalidExtension(String),

    #[error("uploaded file is empty")]
    Empty,

    #[error("failed to store upload at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Whether `filename` carries one of [`VALID_EXTENSIONS`].
pub fn is_valid_structure_file(filename: &str) -> bool {
    structure_extension(filename).is_some()
}

/// The longest accepted suffix of `filename`, lowercased.
fn structure_extension(filename: &str) -> Option<&'static str> {
    let lower = filename.to_ascii_lowercase();
    VALID_EXTENSIONS
        .iter()
        .copied()
        .filter(|ext| lower.ends_with(ext) && lower.len() > ext.len())
        .max_by_key(|ext| ext.len())
}

/// Reduce a client-supplied name to its last path segment made of
/// `[A-Za-z0-9._-]`, replacing everything else with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe.is_empty() || safe == "." || safe == ".." {
        "uploaded_file".to_string()
    } else {
        safe
    }
}

/// An uploaded file on disk, removed when dropped.
#[derive(Debug)]
pub struct StoredArtifact {
    path: PathBuf,
    original_name: String,
    digest: String,
    size: u64,
}

impl StoredArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sanitised client filename.
    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Lowercase hex SHA-256 of the file content.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for StoredArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "failed to remove upload: {e}");
            }
        }
    }
}

/// Persist `bytes` under `dir` as `<prefix>_<uuid><ext>`.
pub async fn save_upload(
    dir: &Path,
    prefix: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<StoredArtifact, UploadError> {
    let ext = structure_extension(filename)
        .ok_or_else(|| UploadError::InvalidExtension(sanitize_filename(filename)))?;
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| UploadError::Io { path, source }
    };

    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await.map_err(io_err(dir))?;

    let path = dir.join(format!("{prefix}_{}{ext}", Uuid::new_v4().simple()));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .map_err(io_err(&path))?;

    // From here on the guard owns the file, so a failed write cleans up.
    let artifact = StoredArtifact {
        path,
        original_name: sanitize_filename(filename),
        digest: hex::encode(Sha256::digest(bytes)),
        size: bytes.len() as u64,
    };
    file.write_all(bytes).await.map_err(io_err(&artifact.path))?;
    file.flush().await.map_err(io_err(&artifact.path))?;

    tracing::debug!(
        path = %artifact.path.display(),
        original = %artifact.original_name,
        size = artifact.size,
        "stored upload"
    );
    Ok(artifact)
}

/// Remove regular files directly under `dir` last modified more than
/// `max_age` ago. A missing directory counts as clean.
pub async fn cleanup_stale(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age > max_age && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
