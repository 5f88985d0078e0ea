use crate::types::CreativeId;
use std::path::{Path, PathBuf};

/// `ADSCAN_HOME` if set, else the current directory.
pub fn base_dir() -> anyhow::Result<PathBuf> {
  match std::env::var_os("ADSCAN_HOME") {
    Some(home) => Ok(PathBuf::from(home)),
    None => Ok(std::env::current_dir()?),
  }
}

pub fn config_path(base: &Path) -> PathBuf {
  base.join("adscan.toml")
}

pub fn report_path(output_dir: &Path, run_id: &str) -> PathBuf {
  output_dir.join(format!("report-{run_id}.json"))
}

pub fn worker_dir(workspace: &Path, worker: usize) -> PathBuf {
  workspace.join(worker.to_string())
}

/// URL path (relative to the workspace root) of a locally hosted page.
pub fn hosted_page_rel(worker: usize, creative_id: CreativeId) -> String {
  format!("{worker}/{creative_id}.html")
}

pub fn hosted_page_path(workspace: &Path, worker: usize, creative_id: CreativeId) -> PathBuf {
  worker_dir(workspace, worker).join(format!("{creative_id}.html"))
}

pub fn network_log_path(workspace: &Path, worker: usize, creative_id: CreativeId) -> PathBuf {
  worker_dir(workspace, worker).join(format!("{creative_id}.json"))
}
