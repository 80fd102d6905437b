//! TW-014: Scoped run root and definition workspaces.
//!
//! Guards remove their directory on drop unless retained. Explicit `close`
//! reports removal failures; drop only logs them.

use super::error::WorkerError;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFINITIONS_DIR: &str = "definitions";
const MODULES_DIR: &str = "terraform-modules";

/// Remove a directory tree, treating "already gone" as success.
fn remove_tree(path: &Path) -> Result<(), WorkerError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkerError::workspace(path, e)),
    }
}

/// A unique id for this run's scratch directory.
pub fn run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{:x}", std::process::id(), nanos)
}

/// Root directory of one run.
#[derive(Debug)]
pub struct RunRoot {
    path: PathBuf,
    /// We created `path` ourselves and may remove it whole
    owned: bool,
    retain: bool,
    closed: bool,
}

impl RunRoot {
    /// Use `working_dir` when given, else a fresh directory under the
    /// system temp dir.
    pub fn create(working_dir: Option<&Path>, retain: bool) -> Result<Self, WorkerError> {
        let (path, owned) = match working_dir {
            Some(dir) => (dir.to_path_buf(), false),
            None => (
                std::env::temp_dir().join(format!("tfworker-{}", run_id())),
                true,
            ),
        };
        std::fs::create_dir_all(path.join(DEFINITIONS_DIR))
            .map_err(|e| WorkerError::workspace(&path, e))?;
        tracing::debug!(root = %path.display(), "run root ready");
        Ok(Self {
            path,
            owned,
            retain,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn definition_dir(&self, name: &str) -> PathBuf {
        self.path.join(DEFINITIONS_DIR).join(name)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.path.join(MODULES_DIR)
    }

    pub fn retained(&self) -> bool {
        self.retain
    }

    /// Remove everything this run created.
    pub fn close(mut self) -> Result<(), WorkerError> {
        self.closed = true;
        if self.retain {
            return Ok(());
        }
        self.remove()
    }

    fn remove(&self) -> Result<(), WorkerError> {
        if self.owned {
            remove_tree(&self.path)
        } else {
            remove_tree(&self.path.join(DEFINITIONS_DIR))?;
            remove_tree(&self.modules_dir())
        }
    }
}

impl Drop for RunRoot {
    fn drop(&mut self) {
        if self.closed || self.retain {
            return;
        }
        if let Err(e) = self.remove() {
            tracing::warn!("cleanup failed: {}", e);
        }
    }
}

/// One definition's rendered workspace.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    retain: bool,
    closed: bool,
}

impl Workspace {
    /// Take ownership of a freshly rendered directory.
    pub fn adopt(path: PathBuf, retain: bool) -> Self {
        Self {
            path,
            retain,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the saved plan is written.
    pub fn plan_file(&self) -> PathBuf {
        self.path.join("worker.tfplan")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.path.join("hooks")
    }

    /// Remove the workspace unless retained.
    pub fn close(mut self) -> Result<(), WorkerError> {
        self.closed = true;
        if self.retain {
            return Ok(());
        }
        remove_tree(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.closed || self.retain {
            return;
        }
        if let Err(e) = remove_tree(&self.path) {
            tracing::warn!("cleanup failed: {}", e);
        }
    }
}
