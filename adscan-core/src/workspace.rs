use crate::paths;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Per-run directory tree: one subdirectory per browser worker holding
/// hosted pages and network logs.
#[derive(Debug, Clone)]
pub struct Workspace {
  root: PathBuf,
  workers: usize,
}

impl Workspace {
  pub fn new(root: impl Into<PathBuf>, workers: usize) -> Self {
    Self {
      root: root.into(),
      workers,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn worker_dir(&self, worker: usize) -> PathBuf {
    paths::worker_dir(&self.root, worker)
  }

  pub fn create(&self) -> anyhow::Result<()> {
    for i in 0..self.workers {
      let dir = self.worker_dir(i);
      fs::create_dir_all(&dir).with_context(|| format!("create worker dir {}", dir.display()))?;
    }
    Ok(())
  }

  /// Empties the tree and recreates the worker directories.
  pub fn reset(&self) -> anyhow::Result<()> {
    self.delete()?;
    self.create()
  }

  pub fn delete(&self) -> anyhow::Result<()> {
    match fs::remove_dir_all(&self.root) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e).with_context(|| format!("remove workspace {}", self.root.display())),
    }
  }

  /// Network log files currently in the workspace.
  pub fn log_files(&self) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(&self.root)
      .follow_links(false)
      .into_iter()
      .flatten()
      .filter(|e| e.file_type().is_file())
      .map(|e| e.into_path())
      .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
      .collect();
    out.sort();
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn create_reset_delete() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path().join("tmp"), 3);

    ws.create().unwrap();
    for i in 0..3 {
      assert!(ws.worker_dir(i).is_dir());
    }

    fs::write(ws.worker_dir(1).join("9.json"), "{}").unwrap();
    fs::write(ws.worker_dir(2).join("9.html"), "<b></b>").unwrap();
    assert_eq!(ws.log_files(), vec![ws.worker_dir(1).join("9.json")]);

    ws.reset().unwrap();
    assert!(ws.log_files().is_empty());
    assert!(ws.worker_dir(2).is_dir());

    ws.delete().unwrap();
    assert!(!ws.root().exists());
    ws.delete().unwrap();
  }
}
