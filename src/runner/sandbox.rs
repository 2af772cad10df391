//! Per-invocation sandbox directories.
//!
//! Every run gets a fresh directory under the sandbox root. The
//! directory and everything in it is removed when the workspace is
//! dropped, so cleanup happens on every exit path including timeouts,
//! errors and cancelled futures.

use std::io;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

/// A uniquely named, self-deleting working directory.
#[derive(Debug)]
pub struct SandboxWorkspace {
    dir: PathBuf,
    removed: bool,
}

impl SandboxWorkspace {
    /// Create `<root>/run-<uuid>`, creating `root` first if needed.
    ///
    /// The returned path is absolute and free of symlinks.
    pub async fn create(root: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let root = tokio::fs::canonicalize(root).await?;
        let dir = root.join(format!("run-{}", Uuid::new_v4()));

        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&dir).await?;

        Ok(Self {
            dir,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Copy `artifact` into the sandbox under its base name.
    pub async fn import(&self, artifact: &Path) -> io::Result<PathBuf> {
        let name = artifact.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("artifact path has no file name: {}", artifact.display()),
            )
        })?;
        let target = self.dir.join(name);
        tokio::fs::copy(artifact, &target).await?;
        Ok(target)
    }

    /// Resolve an expected output name to a path directly inside the sandbox.
    ///
    /// Returns `None` when the name would land anywhere else.
    pub fn resolve_output(&self, name: &str) -> Option<PathBuf> {
        contained_path(&self.dir, name)
    }

    /// Remove the sandbox now. On failure the drop guard retries.
    pub async fn remove(mut self) -> io::Result<()> {
        tokio::fs::remove_dir_all(&self.dir).await?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for SandboxWorkspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(sandbox = %self.dir.display(), "failed to remove sandbox: {e}");
            }
        }
    }
}

/// Join `name` onto `root` and accept the result only if it is a direct
/// child of `root`.
///
/// `root` must already be absolute and normalised. Resolution is lexical:
/// `..` pops a component, `.` is dropped and an absolute `name` replaces
/// `root` entirely, so every escape attempt fails the parent check.
pub fn contained_path(root: &Path, name: &str) -> Option<PathBuf> {
    let candidate = normalize(&root.join(name));
    (candidate.parent() == Some(root)).then_some(candidate)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
